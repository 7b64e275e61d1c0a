// Simulated TMCL module
//
// Speaks the 9-byte protocol over the `Transport` trait so the whole stack can
// run without hardware. Motion is time based: moves finish after a fixed
// duration, a rotation toward the endstop stalls after `stall_after`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::debug;

use super::bus::BusError;
use super::tmcl::{self, AxisParameter, FRAME_LEN, Instruction, MoveMode, Status};
use super::transport::{Connector, Transport};

/// Address the module answers to the host with
const HOST_ADDRESS: u8 = 2;

#[derive(Debug, Clone, Copy)]
enum Motion {
    Idle,
    Rotating {
        velocity: i32,
        from: i32,
        started: Instant,
    },
    Moving {
        from: i32,
        started: Instant,
    },
}

#[derive(Debug)]
struct SimState {
    address: u8,
    params: HashMap<u8, i32>,
    position: i32,
    target: i32,
    speed: i32,
    motion: Motion,
    stall_after: Option<Duration>,
    move_duration: Duration,
    jammed: bool,
    corrupt_replies: usize,
    silent_replies: usize,
    rejections: HashMap<u8, Status>,
    output: VecDeque<u8>,
    commands: Vec<(Instruction, u8, i32)>,
    closed: bool,
    close_count: usize,
    fail_close: bool,
}

impl SimState {
    fn new(address: u8) -> Self {
        Self {
            address,
            params: HashMap::new(),
            position: 0,
            target: 0,
            speed: 0,
            motion: Motion::Idle,
            stall_after: Some(Duration::from_millis(20)),
            move_duration: Duration::from_millis(5),
            jammed: false,
            corrupt_replies: 0,
            silent_replies: 0,
            rejections: HashMap::new(),
            output: VecDeque::new(),
            commands: Vec::new(),
            closed: false,
            close_count: 0,
            fail_close: false,
        }
    }

    /// Bring position and speed up to date with the clock
    fn advance(&mut self) {
        match self.motion {
            Motion::Idle => self.speed = 0,
            Motion::Rotating {
                velocity,
                from,
                started,
            } => {
                let elapsed = started.elapsed();
                let travelled = elapsed.as_millis().min(i32::MAX as u128) as i32;
                self.position = from.saturating_add(velocity.signum().saturating_mul(travelled));
                match self.stall_after {
                    Some(limit) if elapsed >= limit => {
                        // Stall guard fired: the driver stops the motor
                        self.speed = 0;
                        self.motion = Motion::Idle;
                    }
                    _ => self.speed = velocity,
                }
            }
            Motion::Moving { from, started } => {
                if self.jammed {
                    self.speed = 0;
                    return;
                }
                let elapsed = started.elapsed();
                if elapsed >= self.move_duration {
                    self.position = self.target;
                    self.speed = 0;
                    self.motion = Motion::Idle;
                } else {
                    let fraction = elapsed.as_secs_f64() / self.move_duration.as_secs_f64();
                    let delta = f64::from(self.target - from) * fraction;
                    self.position = from + delta as i32;
                    self.speed = self.params.get(&(AxisParameter::MaxSpeed as u8)).copied().unwrap_or(1);
                }
            }
        }
    }

    fn target_reached(&self) -> bool {
        matches!(self.motion, Motion::Idle) && self.position == self.target
    }

    fn handle(&mut self, frame: &[u8]) {
        let instruction_byte = frame[1];
        let type_number = frame[2];
        let value = i32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]]);

        if tmcl::checksum(&frame[..8]) != frame[8] {
            self.reply(Status::WrongChecksum, instruction_byte, 0);
            return;
        }
        if let Some(&status) = self.rejections.get(&instruction_byte) {
            self.reply(status, instruction_byte, 0);
            return;
        }

        self.advance();
        let instruction = match instruction_from_byte(instruction_byte) {
            Some(instruction) => instruction,
            None => {
                self.reply(Status::InvalidCommand, instruction_byte, 0);
                return;
            }
        };
        self.commands.push((instruction, type_number, value));

        let result = match instruction {
            Instruction::RotateRight | Instruction::RotateLeft => {
                let velocity = if instruction == Instruction::RotateLeft {
                    -value.abs()
                } else {
                    value.abs()
                };
                self.motion = Motion::Rotating {
                    velocity,
                    from: self.position,
                    started: Instant::now(),
                };
                self.speed = velocity;
                0
            }
            Instruction::Stop => {
                self.motion = Motion::Idle;
                self.speed = 0;
                0
            }
            Instruction::MoveToPosition => {
                self.target = if type_number == MoveMode::Relative as u8 {
                    self.position.saturating_add(value)
                } else {
                    value
                };
                self.motion = Motion::Moving {
                    from: self.position,
                    started: Instant::now(),
                };
                self.target
            }
            Instruction::SetAxisParameter => {
                if type_number == AxisParameter::ActualPosition as u8 {
                    self.position = value;
                    self.target = value;
                } else {
                    self.params.insert(type_number, value);
                }
                0
            }
            Instruction::GetAxisParameter => match type_number {
                t if t == AxisParameter::ActualPosition as u8 => self.position,
                t if t == AxisParameter::TargetPosition as u8 => self.target,
                t if t == AxisParameter::ActualSpeed as u8 => self.speed,
                t if t == AxisParameter::TargetPositionReached as u8 => {
                    i32::from(self.target_reached())
                }
                t => self.params.get(&t).copied().unwrap_or(0),
            },
            Instruction::StoreAxisParameter | Instruction::RestoreAxisParameter => 0,
        };
        self.reply(Status::Ok, instruction_byte, result);
    }

    fn reply(&mut self, status: Status, command: u8, value: i32) {
        if self.silent_replies > 0 {
            self.silent_replies -= 1;
            return;
        }
        let mut frame = tmcl::encode_reply(HOST_ADDRESS, self.address, status, command, value);
        if self.corrupt_replies > 0 {
            self.corrupt_replies -= 1;
            frame[FRAME_LEN - 1] = frame[FRAME_LEN - 1].wrapping_add(1);
        }
        self.output.extend(frame);
    }
}

fn instruction_from_byte(byte: u8) -> Option<Instruction> {
    Some(match byte {
        1 => Instruction::RotateRight,
        2 => Instruction::RotateLeft,
        3 => Instruction::Stop,
        4 => Instruction::MoveToPosition,
        5 => Instruction::SetAxisParameter,
        6 => Instruction::GetAxisParameter,
        7 => Instruction::StoreAxisParameter,
        8 => Instruction::RestoreAxisParameter,
        _ => return None,
    })
}

/// Handle to a simulated module. Clones share the same device.
#[derive(Debug, Clone)]
pub struct SimulatedModule {
    state: Arc<Mutex<SimState>>,
}

impl Default for SimulatedModule {
    fn default() -> Self {
        Self::new(tmcl::DEFAULT_MODULE_ADDRESS)
    }
}

impl SimulatedModule {
    pub fn new(address: u8) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState::new(address))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Stall guard fires this long after a rotation starts; `None` never stalls
    pub fn set_stall_after(&self, stall_after: Option<Duration>) {
        self.lock().stall_after = stall_after;
    }

    /// Time every MVP takes to reach its target
    pub fn set_move_duration(&self, duration: Duration) {
        self.lock().move_duration = duration;
    }

    /// Block the axis mechanically: moves start but the position never changes
    pub fn set_jammed(&self, jammed: bool) {
        self.lock().jammed = jammed;
    }

    /// Flip the checksum of the next `count` replies
    pub fn corrupt_next_replies(&self, count: usize) {
        self.lock().corrupt_replies = count;
    }

    /// Swallow the next `count` replies
    pub fn drop_next_replies(&self, count: usize) {
        self.lock().silent_replies = count;
    }

    /// Answer every `instruction` with `status`
    pub fn reject(&self, instruction: Instruction, status: Status) {
        self.lock().rejections.insert(instruction as u8, status);
    }

    pub fn position(&self) -> i32 {
        let mut state = self.lock();
        state.advance();
        state.position
    }

    pub fn parameter(&self, parameter: AxisParameter) -> Option<i32> {
        self.lock().params.get(&(parameter as u8)).copied()
    }

    /// Every well-formed command received so far
    pub fn commands(&self) -> Vec<(Instruction, u8, i32)> {
        self.lock().commands.clone()
    }

    pub fn count_commands(&self, instruction: Instruction) -> usize {
        self.lock()
            .commands
            .iter()
            .filter(|(seen, _, _)| *seen == instruction)
            .count()
    }

    /// Make `close` report an error (the module is closed regardless)
    pub fn fail_close(&self, fail: bool) {
        self.lock().fail_close = fail;
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn close_count(&self) -> usize {
        self.lock().close_count
    }
}

impl Transport for SimulatedModule {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        let mut state = self.lock();
        if state.closed {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "module closed"));
        }
        for frame in bytes.chunks(FRAME_LEN).filter(|chunk| chunk.len() == FRAME_LEN) {
            state.handle(frame);
        }
        Ok(bytes.len())
    }

    fn read(&mut self, n: usize, _timeout: Duration) -> io::Result<Vec<u8>> {
        let mut state = self.lock();
        let count = n.min(state.output.len());
        Ok(state.output.drain(..count).collect())
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.lock().output.clear();
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        let mut state = self.lock();
        state.closed = true;
        state.close_count += 1;
        if state.fail_close {
            return Err(io::Error::other("simulated close failure"));
        }
        Ok(())
    }
}

/// Hands out one simulated module per port
#[derive(Debug, Default)]
pub struct SimConnector {
    modules: HashMap<String, SimulatedModule>,
    unavailable: HashSet<String>,
}

impl SimConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// The module behind `port`, created on first use
    pub fn module(&mut self, port: &str) -> SimulatedModule {
        self.modules.entry(port.to_string()).or_default().clone()
    }

    /// Make opening `port` fail as if the device were unplugged
    pub fn set_unavailable(&mut self, port: &str) {
        self.unavailable.insert(port.to_string());
    }
}

impl Connector for SimConnector {
    fn open(&mut self, port: &str) -> Result<Box<dyn Transport>, BusError> {
        if self.unavailable.contains(port) {
            return Err(BusError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no device on {}", port),
            )));
        }
        let module = self.module(port);
        module.lock().closed = false;
        debug!("Opened simulated module on {}", port);
        Ok(Box::new(module))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motor::bus::TmclBus;

    #[test]
    fn test_move_reaches_target() {
        let module = SimulatedModule::default();
        module.set_move_duration(Duration::ZERO);
        let mut bus = TmclBus::new(Box::new(module.clone()), 1, 0);

        bus.move_to(MoveMode::Absolute, 1234).unwrap();
        assert_eq!(bus.get_axis_parameter(AxisParameter::TargetPositionReached).unwrap(), 1);
        assert_eq!(bus.get_axis_parameter(AxisParameter::ActualPosition).unwrap(), 1234);
    }

    #[test]
    fn test_rotation_stalls() {
        let module = SimulatedModule::default();
        module.set_stall_after(Some(Duration::ZERO));
        let mut bus = TmclBus::new(Box::new(module.clone()), 1, 0);

        bus.rotate_left(900).unwrap();
        assert_eq!(bus.get_axis_parameter(AxisParameter::ActualSpeed).unwrap(), 0);
    }

    #[test]
    fn test_rotation_without_stall_keeps_speed() {
        let module = SimulatedModule::default();
        module.set_stall_after(None);
        let mut bus = TmclBus::new(Box::new(module.clone()), 1, 0);

        bus.rotate_left(900).unwrap();
        assert_eq!(bus.get_axis_parameter(AxisParameter::ActualSpeed).unwrap(), -900);
        bus.stop().unwrap();
        assert_eq!(bus.get_axis_parameter(AxisParameter::ActualSpeed).unwrap(), 0);
    }

    #[test]
    fn test_parameters_are_kept() {
        let module = SimulatedModule::default();
        let mut bus = TmclBus::new(Box::new(module.clone()), 1, 0);

        bus.set_axis_parameter(AxisParameter::MaxAcceleration, 1500).unwrap();
        assert_eq!(module.parameter(AxisParameter::MaxAcceleration), Some(1500));
        assert_eq!(bus.get_axis_parameter(AxisParameter::MaxAcceleration).unwrap(), 1500);
    }

    #[test]
    fn test_connector_unavailable_port() {
        let mut connector = SimConnector::new();
        connector.set_unavailable("/dev/ttyACM9");
        assert!(connector.open("/dev/ttyACM9").is_err());
        assert!(connector.open("/dev/ttyACM0").is_ok());
    }
}
