// Scanner geometry, timeouts, motor configuration
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::motor::tmcl::DEFAULT_MODULE_ADDRESS;
use crate::motor::transport::{DEFAULT_BAUDRATE, DEFAULT_TIMEOUT_MS};

// Stepper geometry
pub const FULL_STEPS_PER_REVOLUTION: u32 = 200;
pub const DEFAULT_MICROSTEP_RESOLUTION: u8 = 6; // 2^6 = 64 microsteps
pub const MAX_MICROSTEP_RESOLUTION: u8 = 8;

// Scanner gantry, measured spindle lead per axis (mm per revolution)
pub const SCANNER_LEAD_MM: [f64; 3] = [1.9983, 1.9983, 1.9959];
// Travel of each axis in microsteps, measured from the reference position
pub const SCANNER_MAX_STEPS: [i64; 3] = [1_303_641, 1_425_174, 1_342_922];
// Serial ports of the three TMCL modules (x, y, z)
pub const SCANNER_PORTS: [&str; 3] = ["/dev/ttyACM0", "/dev/ttyACM1", "/dev/ttyACM2"];

// Motion defaults (device units)
pub const DEFAULT_MAX_SPEED: i32 = 5000;
pub const DEFAULT_MAX_ACCELERATION: i32 = 1500;
pub const DEFAULT_MIN_SPEED: i32 = 1;
pub const DEFAULT_HOMING_SPEED: i32 = 900;
pub const DEFAULT_STALL_GUARD_THRESHOLD: i32 = 7;
pub const STALL_GUARD_MIXED_DECAY_THRESHOLD: i32 = 2048;
// Mixed decay off again once stall guard is disarmed
pub const NORMAL_MIXED_DECAY_THRESHOLD: i32 = -1;

// Polling
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_HOMING_TIMEOUT: Duration = Duration::from_secs(60);
// A move that shows no position change for this long is treated as stalled
pub const DEFAULT_FREEZE_TIMEOUT: Duration = Duration::from_secs(10);

/// Error types for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Static configuration of a single axis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AxisConfig {
    /// Serial port of the module driving this axis
    pub port: String,
    /// TMCL module address
    pub address: u8,
    /// Motor number on the module
    pub motor: u8,
    pub steps_per_mm: f64,
    pub max_speed: i32,
    pub max_acceleration: i32,
    pub min_speed: i32,
    pub stall_guard_threshold: i32,
    /// Mixed decay threshold while stall guard is armed
    pub mixed_decay_threshold: i32,
    /// Mixed decay threshold for normal moves
    pub normal_decay_threshold: i32,
    /// Microstep resolution as a power of two (6 = 64 microsteps)
    pub microstep_resolution: u8,
    /// Velocity of the ROL command used while homing
    pub homing_speed: i32,
    /// Soft limits in steps, inclusive
    pub min_steps: i64,
    pub max_steps: i64,
    /// Move away from the endstop by this much once the reference is set
    pub reference_backoff_mm: f64,
    /// Persist every SAP with STAP as well
    pub store_parameters: bool,
}

impl Default for AxisConfig {
    fn default() -> Self {
        Self {
            port: String::new(),
            address: DEFAULT_MODULE_ADDRESS,
            motor: 0,
            steps_per_mm: steps_per_mm_for_lead(SCANNER_LEAD_MM[0], DEFAULT_MICROSTEP_RESOLUTION),
            max_speed: DEFAULT_MAX_SPEED,
            max_acceleration: DEFAULT_MAX_ACCELERATION,
            min_speed: DEFAULT_MIN_SPEED,
            stall_guard_threshold: DEFAULT_STALL_GUARD_THRESHOLD,
            mixed_decay_threshold: STALL_GUARD_MIXED_DECAY_THRESHOLD,
            normal_decay_threshold: NORMAL_MIXED_DECAY_THRESHOLD,
            microstep_resolution: DEFAULT_MICROSTEP_RESOLUTION,
            homing_speed: DEFAULT_HOMING_SPEED,
            min_steps: 0,
            max_steps: SCANNER_MAX_STEPS[0],
            reference_backoff_mm: 0.0,
            store_parameters: false,
        }
    }
}

impl AxisConfig {
    /// Axis driven through a spindle with `lead_mm` travel per revolution
    pub fn with_lead(port: &str, lead_mm: f64, max_steps: i64) -> Self {
        Self {
            port: port.to_string(),
            steps_per_mm: steps_per_mm_for_lead(lead_mm, DEFAULT_MICROSTEP_RESOLUTION),
            max_steps,
            ..Self::default()
        }
    }

    fn validate(&self, index: usize) -> Result<(), ConfigError> {
        let invalid = |reason: String| Err(ConfigError::Invalid(format!("axis {}: {}", index, reason)));

        if !self.steps_per_mm.is_finite() || self.steps_per_mm <= 0.0 {
            return invalid(format!("steps_per_mm must be > 0, got {}", self.steps_per_mm));
        }
        // Step targets travel in the signed 32-bit TMCL value field
        let encodable = i64::from(i32::MIN)..=i64::from(i32::MAX);
        if !encodable.contains(&self.min_steps) || !encodable.contains(&self.max_steps) {
            return invalid(format!(
                "soft limits [{}, {}] exceed the 32-bit step range",
                self.min_steps, self.max_steps
            ));
        }
        if self.min_steps > self.max_steps {
            return invalid(format!(
                "soft limits inverted: min {} > max {}",
                self.min_steps, self.max_steps
            ));
        }
        if self.max_speed <= 0 || self.max_acceleration <= 0 || self.homing_speed <= 0 {
            return invalid("speeds and acceleration must be > 0".to_string());
        }
        if self.microstep_resolution > MAX_MICROSTEP_RESOLUTION {
            return invalid(format!(
                "microstep_resolution must be <= {}, got {}",
                MAX_MICROSTEP_RESOLUTION, self.microstep_resolution
            ));
        }
        if !self.reference_backoff_mm.is_finite() {
            return invalid("reference_backoff_mm must be finite".to_string());
        }
        Ok(())
    }
}

/// Microsteps per millimeter for a spindle with `lead_mm` travel per revolution
pub fn steps_per_mm_for_lead(lead_mm: f64, microstep_resolution: u8) -> f64 {
    let microsteps_per_rev = f64::from(FULL_STEPS_PER_REVOLUTION) * f64::from(1u32 << microstep_resolution);
    microsteps_per_rev / lead_mm
}

/// Transaction and polling timing shared by all axes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub reply_timeout_ms: u64,
    pub retries: u32,
    pub poll_interval_ms: u64,
    pub homing_timeout_ms: u64,
    pub freeze_timeout_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            reply_timeout_ms: DEFAULT_TIMEOUT_MS,
            retries: crate::motor::bus::DEFAULT_RETRIES,
            poll_interval_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64,
            homing_timeout_ms: DEFAULT_HOMING_TIMEOUT.as_millis() as u64,
            freeze_timeout_ms: DEFAULT_FREEZE_TIMEOUT.as_millis() as u64,
        }
    }
}

impl TimingConfig {
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn homing_timeout(&self) -> Duration {
        Duration::from_millis(self.homing_timeout_ms)
    }

    pub fn freeze_timeout(&self) -> Duration {
        Duration::from_millis(self.freeze_timeout_ms)
    }
}

/// Complete scanner configuration, axes in caller order (x, y, z)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    pub axes: Vec<AxisConfig>,
    pub baudrate: u32,
    /// Home and move all axes at once, one thread per axis
    pub parallel: bool,
    pub timing: TimingConfig,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        let axes = SCANNER_PORTS
            .iter()
            .zip(SCANNER_LEAD_MM)
            .zip(SCANNER_MAX_STEPS)
            .map(|((port, lead), max_steps)| AxisConfig::with_lead(port, lead, max_steps))
            .collect();

        Self {
            axes,
            baudrate: DEFAULT_BAUDRATE,
            parallel: false,
            timing: TimingConfig::default(),
        }
    }
}

impl ScannerConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.axes.is_empty() {
            return Err(ConfigError::Invalid("at least one axis is required".to_string()));
        }
        for (index, axis) in self.axes.iter().enumerate() {
            axis.validate(index)?;
        }
        Ok(())
    }

    pub fn ports(&self) -> Vec<String> {
        self.axes.iter().map(|axis| axis.port.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_matches_scanner_gantry() {
        let config = ScannerConfig::default();
        assert_eq!(config.axes.len(), 3);
        assert!(config.validate().is_ok());
        assert_eq!(config.axes[1].max_steps, 1_425_174);
        // 200 * 64 microsteps over 1.9983 mm
        assert!((config.axes[0].steps_per_mm - 6405.444).abs() < 0.01);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{
            "axes": [
                { "port": "/dev/ttyUSB0", "steps_per_mm": 100.0, "max_steps": 5000 }
            ],
            "timing": { "poll_interval_ms": 10 }
        }"#;
        let config = ScannerConfig::from_json_str(json).unwrap();
        assert_eq!(config.axes.len(), 1);
        assert_eq!(config.axes[0].port, "/dev/ttyUSB0");
        assert_eq!(config.axes[0].max_speed, DEFAULT_MAX_SPEED);
        assert_eq!(config.timing.poll_interval(), Duration::from_millis(10));
        assert_eq!(config.timing.retries, 3);
        assert_eq!(config.baudrate, DEFAULT_BAUDRATE);
    }

    #[test]
    fn test_rejects_inverted_limits() {
        let json = r#"{ "axes": [ { "min_steps": 10, "max_steps": 5 } ] }"#;
        assert!(matches!(
            ScannerConfig::from_json_str(json),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_rejects_limits_beyond_step_range() {
        let json = r#"{ "axes": [ { "max_steps": 10000000000 } ] }"#;
        assert!(matches!(
            ScannerConfig::from_json_str(json),
            Err(ConfigError::Invalid(_))
        ));

        let mut config = ScannerConfig::default();
        config.axes[0].min_steps = i64::from(i32::MIN) - 1;
        assert!(config.validate().is_err());
        config.axes[0].min_steps = i64::from(i32::MIN);
        config.axes[0].max_steps = i64::from(i32::MAX);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_non_positive_steps_per_mm() {
        let mut config = ScannerConfig::default();
        config.axes[2].steps_per_mm = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_empty_axes() {
        assert!(ScannerConfig::from_json_str(r#"{ "axes": [] }"#).is_err());
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(
            ScannerConfig::from_json_str("{ axes"),
            Err(ConfigError::Parse(_))
        ));
    }
}
