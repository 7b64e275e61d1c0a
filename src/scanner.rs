// Multi-axis scanner coordinator
//
// Owns one axis controller per spatial dimension and makes the gantry behave
// as a single addressable volume. All position vectors use the axis order of
// the configuration.

use std::ops::{Deref, DerefMut};
use std::thread;
use tracing::{info, warn};

use crate::config::{AxisConfig, ConfigError, ScannerConfig};
use crate::motor::axis::{AxisController, AxisError};
use crate::motor::transport::{Connector, SerialConnector};

/// Error types for scanner operations
#[derive(Debug, thiserror::Error)]
pub enum ScannerError {
    #[error("Axis {axis} failed: {source}")]
    Axis {
        axis: usize,
        #[source]
        source: AxisError,
    },

    #[error("Expected one value per axis ({expected}), got {actual}")]
    AxisCountMismatch { expected: usize, actual: usize },

    #[error("Scanner is already connected")]
    AlreadyConnected,

    #[error("Position {point:?} mm (relative: {relative}) lies outside the working volume")]
    OutOfVolume { point: Vec<f64>, relative: bool },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Disconnect failed on {} axes", .0.len())]
    Disconnect(Vec<(usize, AxisError)>),
}

pub type Result<T> = std::result::Result<T, ScannerError>;

/// Allowed step range of every axis. A point is inside iff every component is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkingVolume {
    bounds: Vec<(i64, i64)>,
}

impl WorkingVolume {
    pub fn from_axes(axes: &[AxisConfig]) -> Self {
        Self {
            bounds: axes
                .iter()
                .map(|axis| (axis.min_steps, axis.max_steps))
                .collect(),
        }
    }

    pub fn bounds(&self) -> &[(i64, i64)] {
        &self.bounds
    }

    pub fn contains(&self, steps: &[i64]) -> bool {
        steps.len() == self.bounds.len()
            && steps
                .iter()
                .zip(&self.bounds)
                .all(|(step, (min, max))| (min..=max).contains(&step))
    }
}

/// The three-axis scanner gantry
pub struct Scanner {
    config: ScannerConfig,
    connector: Box<dyn Connector>,
    axes: Vec<AxisController>,
    volume: WorkingVolume,
    connected: bool,
}

impl Scanner {
    /// Scanner talking to its modules over serial ports
    pub fn new(config: ScannerConfig) -> Result<Self> {
        let connector = SerialConnector::new(config.baudrate);
        Self::with_connector(config, connector)
    }

    /// Scanner opening its transports through `connector`
    pub fn with_connector(config: ScannerConfig, connector: impl Connector + 'static) -> Result<Self> {
        config.validate()?;
        let axes = config
            .axes
            .iter()
            .enumerate()
            .map(|(index, axis)| AxisController::new(index, axis.clone(), config.timing.clone()))
            .collect();
        let volume = WorkingVolume::from_axes(&config.axes);

        Ok(Self {
            config,
            connector: Box::new(connector),
            axes,
            volume,
            connected: false,
        })
    }

    pub fn config(&self) -> &ScannerConfig {
        &self.config
    }

    pub fn axis_count(&self) -> usize {
        self.axes.len()
    }

    pub fn axes(&self) -> &[AxisController] {
        &self.axes
    }

    pub fn volume(&self) -> &WorkingVolume {
        &self.volume
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_homed(&self) -> bool {
        self.axes.iter().all(AxisController::is_homed)
    }

    fn check_count(&self, actual: usize) -> Result<()> {
        if actual != self.axes.len() {
            return Err(ScannerError::AxisCountMismatch {
                expected: self.axes.len(),
                actual,
            });
        }
        Ok(())
    }

    /// Connect every axis to its port, in order. All or nothing.
    pub fn connect<S: AsRef<str>>(&mut self, ports: &[S]) -> Result<()> {
        if self.connected {
            return Err(ScannerError::AlreadyConnected);
        }
        self.check_count(ports.len())?;

        for (index, port) in ports.iter().enumerate() {
            let port = port.as_ref();
            info!("Connecting axis {} to {}", index, port);
            let result = self
                .connector
                .open(port)
                .map_err(AxisError::from)
                .and_then(|transport| self.axes[index].connect(transport));

            if let Err(source) = result {
                warn!("Axis {} failed to connect on {}: {}", index, port, source);
                for axis in self.axes[..index].iter_mut().rev() {
                    if let Err(e) = axis.disconnect() {
                        warn!("Rollback of axis {} failed: {}", axis.index(), e);
                    }
                }
                return Err(ScannerError::Axis {
                    axis: index,
                    source,
                });
            }
        }

        self.connected = true;
        info!("Scanner connected ({} axes)", self.axes.len());
        Ok(())
    }

    /// Connect using the ports from the configuration
    pub fn connect_configured(&mut self) -> Result<()> {
        let ports = self.config.ports();
        self.connect(ports.as_slice())
    }

    /// Scoped connection: disconnects exactly once, when closed or dropped
    pub fn session<S: AsRef<str>>(&mut self, ports: &[S]) -> Result<ScannerSession<'_>> {
        self.connect(ports)?;
        Ok(ScannerSession {
            scanner: self,
            closed: false,
        })
    }

    pub fn configured_session(&mut self) -> Result<ScannerSession<'_>> {
        let ports = self.config.ports();
        self.session(ports.as_slice())
    }

    /// Configure axes in order, stopping at the first failure
    pub fn configure_motors(&mut self) -> Result<()> {
        for axis in &mut self.axes {
            axis.configure().map_err(|source| ScannerError::Axis {
                axis: axis.index(),
                source,
            })?;
        }
        Ok(())
    }

    /// Run `op` on every axis and wait for all of them. Sequential unless the
    /// configuration asks for one thread per axis. Reports the first failure
    /// in axis order.
    fn for_each_axis<F>(&mut self, op: F) -> Result<()>
    where
        F: Fn(&mut AxisController) -> std::result::Result<(), AxisError> + Sync,
    {
        if !self.config.parallel {
            for axis in &mut self.axes {
                op(axis).map_err(|source| ScannerError::Axis {
                    axis: axis.index(),
                    source,
                })?;
            }
            return Ok(());
        }

        let op = &op;
        let results: Vec<_> = thread::scope(|scope| {
            let handles: Vec<_> = self
                .axes
                .iter_mut()
                .map(|axis| scope.spawn(move || op(axis)))
                .collect();
            handles.into_iter().map(|handle| handle.join()).collect()
        });

        let mut first_error = None;
        for (index, result) in results.into_iter().enumerate() {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(source)) if first_error.is_none() => {
                    first_error = Some(ScannerError::Axis {
                        axis: index,
                        source,
                    });
                }
                Ok(Err(source)) => warn!("Axis {} also failed: {}", index, source),
                Err(panic) => std::panic::resume_unwind(panic),
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Home every axis. The caller must re-home everything after a failure.
    pub fn find_reference_position(&mut self) -> Result<()> {
        info!("Searching reference position on all axes");
        self.for_each_axis(AxisController::find_reference)?;
        info!("All axes homed");
        Ok(())
    }

    /// Arm stall guard on every axis, in order
    pub fn arm_stall_guard(&mut self) -> Result<()> {
        for axis in &mut self.axes {
            axis.arm_stall_guard().map_err(|source| ScannerError::Axis {
                axis: axis.index(),
                source,
            })?;
        }
        Ok(())
    }

    /// Disarm stall guard on every axis, in order
    pub fn disarm_stall_guard(&mut self) -> Result<()> {
        for axis in &mut self.axes {
            axis.disarm_stall_guard().map_err(|source| ScannerError::Axis {
                axis: axis.index(),
                source,
            })?;
        }
        Ok(())
    }

    /// Run every homed axis into its far endstop and return the travel in
    /// steps. Afterwards the axes sit at their endstops.
    pub fn measure_travel(&mut self) -> Result<Vec<i64>> {
        info!("Measuring travel on all axes");
        self.for_each_axis(|axis| axis.measure_travel().map(|_| ()))?;
        Ok(self.get_current_steps())
    }

    /// Target steps of every axis, or `None` if `point` cannot be resolved
    fn resolve_targets(&self, point: &[f64], relative: bool) -> Option<Vec<i64>> {
        if point.len() != self.axes.len() || point.iter().any(|mm| !mm.is_finite()) {
            return None;
        }
        let targets = self
            .axes
            .iter()
            .zip(point)
            .map(|(axis, &mm)| {
                let steps = axis.mm_to_steps(mm);
                if relative {
                    axis.position_steps().saturating_add(steps)
                } else {
                    steps
                }
            })
            .collect();
        Some(targets)
    }

    /// Whether `point` (absolute, or relative to the current position) lies
    /// within the working volume. Never fails.
    pub fn check_position_in_mm_allowed(&self, point: &[f64], relative: bool) -> bool {
        self.resolve_targets(point, relative)
            .is_some_and(|targets| self.volume.contains(&targets))
    }

    fn move_all(&mut self, point: &[f64], relative: bool) -> Result<()> {
        self.check_count(point.len())?;
        let targets = self
            .resolve_targets(point, relative)
            .filter(|targets| self.volume.contains(targets))
            .ok_or_else(|| ScannerError::OutOfVolume {
                point: point.to_vec(),
                relative,
            })?;
        // Refuse before any axis moves rather than leaving some of them halfway
        if let Some(axis) = self.axes.iter().find(|axis| !axis.is_homed()) {
            return Err(ScannerError::Axis {
                axis: axis.index(),
                source: AxisError::NotHomed { axis: axis.index() },
            });
        }

        info!("Moving to {:?} steps", targets);
        self.for_each_axis(|axis| axis.move_to_absolute_steps(targets[axis.index()]))
    }

    pub fn move_to_absolute_position_in_mm(&mut self, point: &[f64]) -> Result<()> {
        self.move_all(point, false)
    }

    pub fn move_relative_distance_in_mm(&mut self, deltas: &[f64]) -> Result<()> {
        self.move_all(deltas, true)
    }

    /// Cached position of every axis in mm, no I/O
    pub fn get_current_position(&self) -> Vec<f64> {
        self.axes.iter().map(AxisController::position_mm).collect()
    }

    /// Cached position of every axis in steps, no I/O
    pub fn get_current_steps(&self) -> Vec<i64> {
        self.axes.iter().map(AxisController::position_steps).collect()
    }

    /// Positions as reported by the modules, without touching the cache
    pub fn read_actual_steps(&mut self) -> Result<Vec<i64>> {
        self.axes
            .iter_mut()
            .map(|axis| {
                axis.read_actual_position().map_err(|source| ScannerError::Axis {
                    axis: axis.index(),
                    source,
                })
            })
            .collect()
    }

    /// Stop every axis, best effort
    pub fn stop(&mut self) -> Result<()> {
        let mut first_error = None;
        for axis in &mut self.axes {
            if let Err(source) = axis.stop() {
                warn!("Failed to stop axis {}: {}", axis.index(), source);
                if first_error.is_none() {
                    first_error = Some(ScannerError::Axis {
                        axis: axis.index(),
                        source,
                    });
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Close every axis, even if some of them fail
    pub fn disconnect(&mut self) -> Result<()> {
        let mut failures = Vec::new();
        for axis in &mut self.axes {
            if let Err(e) = axis.disconnect() {
                warn!("Failed to disconnect axis {}: {}", axis.index(), e);
                failures.push((axis.index(), e));
            }
        }
        self.connected = false;

        if failures.is_empty() {
            info!("Scanner disconnected");
            Ok(())
        } else {
            Err(ScannerError::Disconnect(failures))
        }
    }
}

/// A connected scanner that disconnects itself exactly once
pub struct ScannerSession<'a> {
    scanner: &'a mut Scanner,
    closed: bool,
}

impl ScannerSession<'_> {
    /// Disconnect now and report teardown errors
    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        self.scanner.disconnect()
    }
}

impl Deref for ScannerSession<'_> {
    type Target = Scanner;

    fn deref(&self) -> &Scanner {
        &*self.scanner
    }
}

impl DerefMut for ScannerSession<'_> {
    fn deref_mut(&mut self) -> &mut Scanner {
        &mut *self.scanner
    }
}

impl Drop for ScannerSession<'_> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(e) = self.scanner.disconnect() {
            warn!("Failed to disconnect scanner on drop: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TimingConfig;
    use crate::motor::sim::SimConnector;
    use crate::motor::tmcl::{AxisParameter, Instruction};
    use std::time::Duration;

    const PORTS: [&str; 3] = ["sim-x", "sim-y", "sim-z"];

    fn test_config() -> ScannerConfig {
        let axis = |port: &str, max_steps| AxisConfig {
            port: port.to_string(),
            steps_per_mm: 100.0,
            min_steps: 0,
            max_steps,
            ..AxisConfig::default()
        };
        ScannerConfig {
            axes: vec![axis(PORTS[0], 5000), axis(PORTS[1], 5000), axis(PORTS[2], 5000)],
            timing: TimingConfig {
                reply_timeout_ms: 10,
                retries: 3,
                poll_interval_ms: 1,
                homing_timeout_ms: 200,
                freeze_timeout_ms: 20,
            },
            ..ScannerConfig::default()
        }
    }

    fn scanner_with(connector: SimConnector) -> Scanner {
        Scanner::with_connector(test_config(), connector).unwrap()
    }

    fn fast_connector() -> SimConnector {
        let mut connector = SimConnector::new();
        for port in PORTS {
            connector
                .module(port)
                .set_stall_after(Some(Duration::from_millis(3)));
        }
        connector
    }

    #[test]
    fn test_unencodable_limits_rejected_up_front() {
        let mut config = test_config();
        config.axes[0].max_steps = 10_000_000_000;
        let result = Scanner::with_connector(config, SimConnector::new());
        assert!(matches!(result, Err(ScannerError::Config(_))));
    }

    #[test]
    fn test_stall_guard_pair_on_all_axes() {
        let mut connector = SimConnector::new();
        let modules: Vec<_> = PORTS.iter().map(|port| connector.module(port)).collect();
        let mut scanner = scanner_with(connector);
        scanner.connect(&PORTS).unwrap();

        scanner.arm_stall_guard().unwrap();
        for module in &modules {
            assert_eq!(module.parameter(AxisParameter::MixedDecayThreshold), Some(2048));
            assert_eq!(module.parameter(AxisParameter::StallDetectionThreshold), Some(7));
        }
        scanner.disarm_stall_guard().unwrap();
        for module in &modules {
            assert_eq!(module.parameter(AxisParameter::MixedDecayThreshold), Some(-1));
            assert_eq!(module.parameter(AxisParameter::StallDetectionThreshold), Some(0));
        }
    }

    #[test]
    fn test_measure_travel_reports_every_axis() {
        let mut connector = fast_connector();
        let modules: Vec<_> = PORTS.iter().map(|port| connector.module(port)).collect();
        let mut scanner = scanner_with(connector);
        scanner.connect(&PORTS).unwrap();
        assert!(matches!(
            scanner.measure_travel(),
            Err(ScannerError::Axis {
                axis: 0,
                source: AxisError::NotHomed { .. }
            })
        ));

        scanner.find_reference_position().unwrap();
        let travel = scanner.measure_travel().unwrap();
        let actual: Vec<i64> = modules.iter().map(|m| i64::from(m.position())).collect();
        assert_eq!(travel, actual);
        assert!(travel.iter().all(|&steps| steps > 0));
    }

    #[test]
    fn test_working_volume_bounds() {
        let volume = WorkingVolume::from_axes(&test_config().axes);
        assert!(volume.contains(&[0, 0, 0]));
        assert!(volume.contains(&[5000, 5000, 5000]));
        assert!(!volume.contains(&[5001, 0, 0]));
        assert!(!volume.contains(&[0, -1, 0]));
        assert!(!volume.contains(&[0, 0]));
    }

    #[test]
    fn test_check_position_boundaries() {
        let scanner = scanner_with(SimConnector::new());
        assert!(scanner.check_position_in_mm_allowed(&[50.0, 0.0, 25.0], false));
        assert!(!scanner.check_position_in_mm_allowed(&[50.01, 0.0, 25.0], false));
        assert!(!scanner.check_position_in_mm_allowed(&[0.0, -0.01, 0.0], false));
        assert!(!scanner.check_position_in_mm_allowed(&[1.0, 1.0], false));
        assert!(!scanner.check_position_in_mm_allowed(&[f64::NAN, 0.0, 0.0], false));
    }

    #[test]
    fn test_check_relative_uses_current_position() {
        let mut scanner = scanner_with(fast_connector());
        scanner.connect(&PORTS).unwrap();
        scanner.find_reference_position().unwrap();
        scanner.move_to_absolute_position_in_mm(&[40.0, 0.0, 0.0]).unwrap();

        assert!(scanner.check_position_in_mm_allowed(&[10.0, 0.0, 0.0], true));
        assert!(!scanner.check_position_in_mm_allowed(&[10.01, 0.0, 0.0], true));
        assert!(scanner.check_position_in_mm_allowed(&[-40.0, 0.0, 0.0], true));
        assert!(!scanner.check_position_in_mm_allowed(&[0.0, -1.0, 0.0], true));
    }

    #[test]
    fn test_connect_wrong_port_count() {
        let mut scanner = scanner_with(SimConnector::new());
        let result = scanner.connect(&PORTS[..2]);
        assert!(matches!(
            result,
            Err(ScannerError::AxisCountMismatch {
                expected: 3,
                actual: 2
            })
        ));
        assert!(!scanner.is_connected());
    }

    #[test]
    fn test_connect_rolls_back_on_failure() {
        let mut connector = SimConnector::new();
        let x = connector.module(PORTS[0]);
        let y = connector.module(PORTS[1]);
        connector.set_unavailable(PORTS[2]);
        let mut scanner = scanner_with(connector);

        let result = scanner.connect(&PORTS);
        assert!(matches!(result, Err(ScannerError::Axis { axis: 2, .. })));
        assert!(!scanner.is_connected());
        assert!(scanner.axes().iter().all(|axis| !axis.is_connected()));
        assert!(x.is_closed());
        assert!(y.is_closed());
    }

    #[test]
    fn test_connect_twice() {
        let mut scanner = scanner_with(SimConnector::new());
        scanner.connect(&PORTS).unwrap();
        assert!(matches!(
            scanner.connect(&PORTS),
            Err(ScannerError::AlreadyConnected)
        ));
    }

    #[test]
    fn test_configure_stops_at_first_failure() {
        let mut connector = SimConnector::new();
        let y = connector.module(PORTS[1]);
        let z = connector.module(PORTS[2]);
        y.reject(Instruction::SetAxisParameter, crate::motor::tmcl::Status::WrongType);
        let mut scanner = scanner_with(connector);
        scanner.connect(&PORTS).unwrap();

        let result = scanner.configure_motors();
        assert!(matches!(result, Err(ScannerError::Axis { axis: 1, .. })));
        let configured: Vec<bool> = scanner.axes().iter().map(|a| a.state().configured).collect();
        assert_eq!(configured, vec![true, false, false]);
        assert_eq!(z.count_commands(Instruction::SetAxisParameter), 0);
    }

    #[test]
    fn test_move_before_homing_is_refused_without_io() {
        let mut connector = fast_connector();
        let x = connector.module(PORTS[0]);
        let mut scanner = scanner_with(connector);
        scanner.connect(&PORTS).unwrap();

        let result = scanner.move_to_absolute_position_in_mm(&[1.0, 1.0, 1.0]);
        assert!(matches!(
            result,
            Err(ScannerError::Axis {
                axis: 0,
                source: AxisError::NotHomed { .. }
            })
        ));
        assert_eq!(x.count_commands(Instruction::MoveToPosition), 0);
    }

    #[test]
    fn test_move_wrong_length() {
        let mut scanner = scanner_with(fast_connector());
        scanner.connect(&PORTS).unwrap();
        scanner.find_reference_position().unwrap();
        assert!(matches!(
            scanner.move_relative_distance_in_mm(&[1.0]),
            Err(ScannerError::AxisCountMismatch { .. })
        ));
    }

    #[test]
    fn test_get_current_position_is_idempotent() {
        let mut scanner = scanner_with(fast_connector());
        scanner.connect(&PORTS).unwrap();
        scanner.find_reference_position().unwrap();
        scanner.move_to_absolute_position_in_mm(&[1.5, 2.5, 3.5]).unwrap();

        let first = scanner.get_current_position();
        assert_eq!(first, scanner.get_current_position());
        assert_eq!(scanner.get_current_steps(), vec![150, 250, 350]);
    }

    #[test]
    fn test_disconnect_collects_failures() {
        let mut connector = SimConnector::new();
        let y = connector.module(PORTS[1]);
        let mut scanner = scanner_with(connector);
        scanner.connect(&PORTS).unwrap();
        y.fail_close(true);

        match scanner.disconnect() {
            Err(ScannerError::Disconnect(failures)) => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].0, 1);
            }
            other => panic!("Expected Disconnect error, got {:?}", other),
        }
        assert!(!scanner.is_connected());
        assert!(scanner.axes().iter().all(|axis| !axis.is_connected()));
    }

    #[test]
    fn test_session_disconnects_on_drop() {
        let mut connector = SimConnector::new();
        let modules: Vec<_> = PORTS.iter().map(|port| connector.module(port)).collect();
        let mut scanner = scanner_with(connector);
        {
            let session = scanner.session(&PORTS).unwrap();
            assert!(session.is_connected());
        }
        assert!(!scanner.is_connected());
        assert!(modules.iter().all(|module| module.is_closed()));
    }

    #[test]
    fn test_session_close_reports_errors_once() {
        let mut connector = SimConnector::new();
        let z = connector.module(PORTS[2]);
        let mut scanner = scanner_with(connector);

        let session = scanner.session(&PORTS).unwrap();
        z.fail_close(true);
        assert!(matches!(session.close(), Err(ScannerError::Disconnect(_))));
        assert_eq!(z.close_count(), 1);
    }
}
