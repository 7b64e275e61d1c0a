// Motor control for the TMCL scanner gantry
//
// Provides:
// - TMCL frame codec (9-byte command / reply frames)
// - Serial transport and a simulated module behind the same trait
// - Retrying transaction layer with typed commands
// - Per-axis controller: configuration, homing, bounded moves

pub mod axis;
pub mod bus;
pub mod sim;
pub mod tmcl;
pub mod transport;

pub use axis::{AxisController, AxisError, AxisState, ConnectionStatus, MotionStatus};
pub use bus::{BusError, TmclBus};
pub use sim::{SimConnector, SimulatedModule};
pub use tmcl::{AxisParameter, Instruction, MoveMode, Status, TmclError};
pub use transport::{Connector, SerialConnector, SerialTransport, Transport};
