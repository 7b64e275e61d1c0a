// Single-axis controller
//
// Owns one TMCL module: pushes the axis configuration, finds the reference
// position with stall guard, and runs bounded moves in motor steps.

use std::thread::sleep;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::bus::{BusError, TmclBus};
use super::tmcl::{AxisParameter, MoveMode};
use super::transport::Transport;
use crate::config::{AxisConfig, TimingConfig};

/// Error types for axis operations
#[derive(Debug, thiserror::Error)]
pub enum AxisError {
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Axis {axis} is already connected")]
    AlreadyConnected { axis: usize },

    #[error("Axis {axis} is not connected")]
    NotConnected { axis: usize },

    #[error("Axis {axis} has not been homed")]
    NotHomed { axis: usize },

    #[error("Axis {axis}: target step {target} outside soft limits [{min}, {max}]")]
    OutOfRange {
        axis: usize,
        target: i64,
        min: i64,
        max: i64,
    },

    #[error("Axis {axis}: no stall detected within {elapsed:?} while homing")]
    HomingTimeout { axis: usize, elapsed: Duration },

    #[error("Axis {axis}: far endstop not reached within {elapsed:?}")]
    TravelTimeout { axis: usize, elapsed: Duration },

    #[error("Axis {axis} stalled at step {position} while moving to {target}")]
    StallDuringMove {
        axis: usize,
        target: i64,
        position: i64,
    },
}

pub type Result<T> = std::result::Result<T, AxisError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionStatus {
    Idle,
    Moving,
    Stalled,
    Error,
}

/// Cached state of one axis. `position` is only meaningful once `homed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AxisState {
    pub connection: ConnectionStatus,
    pub configured: bool,
    pub homed: bool,
    pub position: i64,
    pub motion: MotionStatus,
}

impl Default for AxisState {
    fn default() -> Self {
        Self {
            connection: ConnectionStatus::Disconnected,
            configured: false,
            homed: false,
            position: 0,
            motion: MotionStatus::Idle,
        }
    }
}

/// Convert millimeters to the nearest motor step
pub fn mm_to_steps(mm: f64, steps_per_mm: f64) -> i64 {
    (mm * steps_per_mm).round() as i64
}

pub fn steps_to_mm(steps: i64, steps_per_mm: f64) -> f64 {
    steps as f64 / steps_per_mm
}

/// Controller for one axis of the gantry
pub struct AxisController {
    index: usize,
    config: AxisConfig,
    timing: TimingConfig,
    bus: Option<TmclBus>,
    state: AxisState,
}

impl AxisController {
    pub fn new(index: usize, config: AxisConfig, timing: TimingConfig) -> Self {
        Self {
            index,
            config,
            timing,
            bus: None,
            state: AxisState::default(),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn config(&self) -> &AxisConfig {
        &self.config
    }

    pub fn state(&self) -> AxisState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.bus.is_some()
    }

    pub fn is_homed(&self) -> bool {
        self.state.homed
    }

    /// Soft limits in steps, inclusive
    pub fn limits(&self) -> (i64, i64) {
        (self.config.min_steps, self.config.max_steps)
    }

    pub fn mm_to_steps(&self, mm: f64) -> i64 {
        mm_to_steps(mm, self.config.steps_per_mm)
    }

    pub fn steps_to_mm(&self, steps: i64) -> f64 {
        steps_to_mm(steps, self.config.steps_per_mm)
    }

    /// Cached position in steps, no I/O
    pub fn position_steps(&self) -> i64 {
        self.state.position
    }

    /// Cached position in millimeters, no I/O
    pub fn position_mm(&self) -> f64 {
        self.steps_to_mm(self.state.position)
    }

    fn bus(&mut self) -> Result<&mut TmclBus> {
        let axis = self.index;
        self.bus.as_mut().ok_or(AxisError::NotConnected { axis })
    }

    /// Bind a transport and check that the module answers
    pub fn connect(&mut self, transport: Box<dyn Transport>) -> Result<()> {
        if self.bus.is_some() {
            return Err(AxisError::AlreadyConnected { axis: self.index });
        }

        let mut bus = TmclBus::new(transport, self.config.address, self.config.motor)
            .with_reply_timeout(self.timing.reply_timeout())
            .with_retries(self.timing.retries);

        // A stop is harmless and proves the module is alive
        if let Err(e) = bus.stop() {
            warn!("Axis {}: module {} not responding: {}", self.index, self.config.address, e);
            if let Err(close_err) = bus.close() {
                debug!("Axis {}: close after failed connect: {}", self.index, close_err);
            }
            return Err(e.into());
        }

        info!("Axis {} connected (module {})", self.index, self.config.address);
        self.bus = Some(bus);
        self.state = AxisState {
            connection: ConnectionStatus::Connected,
            ..AxisState::default()
        };
        Ok(())
    }

    /// Release the transport. Homing is lost with the connection.
    pub fn disconnect(&mut self) -> Result<()> {
        let Some(mut bus) = self.bus.take() else {
            return Ok(());
        };
        self.state = AxisState::default();
        info!("Closing connection to axis {}", self.index);
        bus.close()?;
        Ok(())
    }

    fn set_parameter(&mut self, parameter: AxisParameter, value: i64) -> Result<()> {
        let store = self.config.store_parameters;
        let bus = self.bus()?;
        bus.set_axis_parameter(parameter, value)?;
        if store {
            bus.store_axis_parameter(parameter)?;
        }
        Ok(())
    }

    /// Push speed, acceleration and microstepping, and leave stall guard disarmed
    pub fn configure(&mut self) -> Result<()> {
        self.state.configured = false;
        debug!(
            "Axis {}: max speed {}, max acceleration {}, microsteps 2^{}",
            self.index,
            self.config.max_speed,
            self.config.max_acceleration,
            self.config.microstep_resolution
        );

        let settings = [
            (AxisParameter::MinSpeed, self.config.min_speed),
            (AxisParameter::MaxSpeed, self.config.max_speed),
            (AxisParameter::MaxAcceleration, self.config.max_acceleration),
            (
                AxisParameter::MicrostepResolution,
                i32::from(self.config.microstep_resolution),
            ),
        ];
        for (parameter, value) in settings {
            self.set_parameter(parameter, i64::from(value))?;
        }
        self.disarm_stall_guard()?;

        self.state.configured = true;
        info!("Axis {} configured", self.index);
        Ok(())
    }

    /// Stop the motor (MST)
    pub fn stop(&mut self) -> Result<()> {
        self.bus()?.stop()?;
        self.state.motion = MotionStatus::Idle;
        Ok(())
    }

    /// Position reported by the module, leaves the cached state untouched
    pub fn read_actual_position(&mut self) -> Result<i64> {
        Ok(i64::from(
            self.bus()?.get_axis_parameter(AxisParameter::ActualPosition)?,
        ))
    }

    /// Let the driver stop the motor when it runs into an endstop.
    /// Stall guard only works with mixed decay switched to its threshold.
    pub fn arm_stall_guard(&mut self) -> Result<()> {
        debug!("Axis {}: arming stall guard", self.index);
        self.set_parameter(
            AxisParameter::MixedDecayThreshold,
            i64::from(self.config.mixed_decay_threshold),
        )?;
        self.set_parameter(
            AxisParameter::StallDetectionThreshold,
            i64::from(self.config.stall_guard_threshold),
        )
    }

    /// Back to normal decay with stall detection off
    pub fn disarm_stall_guard(&mut self) -> Result<()> {
        debug!("Axis {}: disarming stall guard", self.index);
        self.set_parameter(
            AxisParameter::MixedDecayThreshold,
            i64::from(self.config.normal_decay_threshold),
        )?;
        self.set_parameter(AxisParameter::StallDetectionThreshold, 0)
    }

    /// Stop after a failed motion and pick up wherever the motor ended
    fn abort_motion(&mut self, motion: MotionStatus) {
        let axis = self.index;
        self.state.motion = motion;
        let Ok(bus) = self.bus() else {
            return;
        };
        if let Err(e) = bus.stop() {
            warn!("Axis {}: stop after failed motion: {}", axis, e);
        }
        match bus.get_axis_parameter(AxisParameter::ActualPosition) {
            Ok(position) => self.state.position = i64::from(position),
            Err(e) => warn!("Axis {}: position unknown after failed motion: {}", axis, e),
        }
    }

    /// `abort_motion` for an endstop search: also disarms stall guard
    fn abort_stall_search(&mut self) {
        self.abort_motion(MotionStatus::Error);
        if let Err(e) = self.disarm_stall_guard() {
            warn!("Axis {}: stall guard still armed after failure: {}", self.index, e);
        }
    }

    /// Rotate with stall guard armed until the driver stops the motor.
    /// Returns the elapsed time if the timeout ran out first; the motor is
    /// stopped and stall guard disarmed on every failure path.
    fn run_into_endstop(&mut self, forward: bool) -> Result<Option<Duration>> {
        let velocity = i64::from(self.config.homing_speed);
        let started = Instant::now();

        let rotated = self.arm_stall_guard().and_then(|()| {
            let bus = self.bus()?;
            if forward {
                bus.rotate_right(velocity)?;
            } else {
                bus.rotate_left(velocity)?;
            }
            Ok(())
        });
        if let Err(e) = rotated {
            self.abort_stall_search();
            return Err(e);
        }
        self.state.motion = MotionStatus::Moving;

        loop {
            sleep(self.timing.poll_interval());
            let reading = self.bus()?.get_axis_parameter(AxisParameter::ActualSpeed);
            let speed = match reading {
                Ok(speed) => speed,
                Err(e) => {
                    self.abort_stall_search();
                    return Err(e.into());
                }
            };
            if speed == 0 {
                return Ok(None);
            }

            let elapsed = started.elapsed();
            debug!("Axis {}: speed {} after {:?}", self.index, speed, elapsed);
            if elapsed >= self.timing.homing_timeout() {
                warn!("Axis {}: no stall after {:?}, giving up", self.index, elapsed);
                self.abort_stall_search();
                return Ok(Some(elapsed));
            }
        }
    }

    /// Drive toward the endstop until stall guard fires, then define it as step 0
    pub fn find_reference(&mut self) -> Result<()> {
        self.state.homed = false;
        info!("Axis {}: searching reference position", self.index);

        if let Some(elapsed) = self.run_into_endstop(false)? {
            return Err(AxisError::HomingTimeout {
                axis: self.index,
                elapsed,
            });
        }

        let zeroed = self.bus().and_then(|bus| {
            bus.stop()?;
            bus.set_axis_parameter(AxisParameter::ActualPosition, 0)?;
            Ok(())
        });
        if let Err(e) = zeroed {
            self.abort_stall_search();
            return Err(e);
        }
        self.state.position = 0;
        self.state.motion = MotionStatus::Idle;
        self.state.homed = true;
        self.disarm_stall_guard()?;
        info!("Axis {}: reference position set", self.index);

        if self.config.reference_backoff_mm != 0.0 {
            let backoff = self.mm_to_steps(self.config.reference_backoff_mm);
            self.move_relative_steps(backoff)?;
        }
        Ok(())
    }

    /// Drive a homed axis into the far endstop and report how many steps away
    /// from the reference it stalled. The axis is left at the endstop, which
    /// may lie beyond the soft limits.
    pub fn measure_travel(&mut self) -> Result<i64> {
        if !self.state.homed {
            return Err(AxisError::NotHomed { axis: self.index });
        }
        info!("Axis {}: measuring travel", self.index);

        if let Some(elapsed) = self.run_into_endstop(true)? {
            return Err(AxisError::TravelTimeout {
                axis: self.index,
                elapsed,
            });
        }

        let measured = self.stop().and_then(|()| self.read_actual_position());
        let travel = match measured {
            Ok(travel) => travel,
            Err(e) => {
                self.abort_stall_search();
                return Err(e);
            }
        };
        self.state.position = travel;
        self.disarm_stall_guard()?;
        info!(
            "Axis {}: travel {} steps ({:.4} mm)",
            self.index,
            travel,
            self.steps_to_mm(travel)
        );
        Ok(travel)
    }

    /// Whether `steps` (absolute, or relative to the cached position) lies within the soft limits
    pub fn check_steps_allowed(&self, steps: i64, relative: bool) -> bool {
        let target = if relative {
            self.state.position.saturating_add(steps)
        } else {
            steps
        };
        (self.config.min_steps..=self.config.max_steps).contains(&target)
    }

    fn validate_target(&self, target: i64) -> Result<()> {
        if !self.state.homed {
            return Err(AxisError::NotHomed { axis: self.index });
        }
        if !self.check_steps_allowed(target, false) {
            return Err(AxisError::OutOfRange {
                axis: self.index,
                target,
                min: self.config.min_steps,
                max: self.config.max_steps,
            });
        }
        Ok(())
    }

    /// Move to an absolute step position and wait until it is reached
    pub fn move_to_absolute_steps(&mut self, target: i64) -> Result<()> {
        self.validate_target(target)?;

        debug!("Axis {}: moving {} -> {}", self.index, self.state.position, target);
        self.bus()?.move_to(MoveMode::Absolute, target)?;
        self.state.motion = MotionStatus::Moving;

        if let Err(e) = self.wait_for_target(target) {
            if !matches!(e, AxisError::StallDuringMove { .. }) {
                self.abort_motion(MotionStatus::Error);
            }
            return Err(e);
        }

        self.state.position = target;
        self.state.motion = MotionStatus::Idle;
        debug!("Axis {}: reached {}", self.index, target);
        Ok(())
    }

    /// Move by `delta` steps from the cached position
    pub fn move_relative_steps(&mut self, delta: i64) -> Result<()> {
        let target = self.state.position.saturating_add(delta);
        self.move_to_absolute_steps(target)
    }

    /// Poll until the module reports the target reached. A position that does
    /// not change for the freeze timeout is a stall.
    fn wait_for_target(&mut self, target: i64) -> Result<()> {
        let freeze_timeout = self.timing.freeze_timeout();
        let poll_interval = self.timing.poll_interval();

        let mut last_position = self.read_actual_position()?;
        let mut last_change = Instant::now();

        loop {
            let reached = self.bus()?.get_axis_parameter(AxisParameter::TargetPositionReached)?;
            if reached != 0 {
                return Ok(());
            }
            sleep(poll_interval);
            let position = self.read_actual_position()?;
            if position != last_position {
                last_position = position;
                last_change = Instant::now();
            } else if last_change.elapsed() > freeze_timeout {
                warn!(
                    "Axis {} cannot move from step {} for {:?}, stopping",
                    self.index, position, freeze_timeout
                );
                self.abort_motion(MotionStatus::Stalled);
                return Err(AxisError::StallDuringMove {
                    axis: self.index,
                    target,
                    position,
                });
            }
        }
    }
}
