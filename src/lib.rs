// Motion control for a three-axis scanner gantry driven by TMCL stepper modules

pub mod config;
pub mod motor;
pub mod scanner;

pub use config::{AxisConfig, ConfigError, ScannerConfig, TimingConfig};
pub use scanner::{Scanner, ScannerError, ScannerSession, WorkingVolume};
