// TMCL transaction layer
//
// One command out, one 9-byte reply back. Short writes, corrupt, short or
// mismatched replies and a module reporting a corrupted command are retried
// with the full send/receive cycle; any other error status is surfaced
// immediately.

use std::time::Duration;
use tracing::{debug, warn};

use super::tmcl::{
    self, AxisParameter, CommandFrame, FRAME_LEN, Instruction, MoveMode, ReplyFrame, Status,
    TmclError,
};
use super::transport::Transport;

/// Retries after the first attempt before giving up on a transaction
pub const DEFAULT_RETRIES: u32 = 3;

/// Error types for TMCL transactions
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] TmclError),

    #[error("Short write to module {address} ({written} of 9 bytes)")]
    ShortWrite { address: u8, written: usize },

    #[error("Timeout waiting for reply from module {address} ({received} of 9 bytes)")]
    Timeout { address: u8, received: usize },

    #[error("Reply from module {module} to command {command} does not match request to module {address} ({instruction:?})")]
    UnexpectedReply {
        address: u8,
        instruction: Instruction,
        module: u8,
        command: u8,
    },

    #[error("Communication with module {address} failed after {attempts} attempts: {last}")]
    Communication {
        address: u8,
        attempts: u32,
        #[source]
        last: Box<BusError>,
    },

    #[error("Module {address} rejected {instruction:?}: {status}")]
    Device {
        address: u8,
        instruction: Instruction,
        status: Status,
    },
}

impl BusError {
    /// Transport glitches worth another full send/receive cycle. A module
    /// answering WrongChecksum received a corrupted command.
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            BusError::Timeout { .. }
                | BusError::ShortWrite { .. }
                | BusError::UnexpectedReply { .. }
                | BusError::Device {
                    status: Status::WrongChecksum,
                    ..
                }
                | BusError::Protocol(TmclError::ChecksumMismatch { .. })
                | BusError::Protocol(TmclError::MalformedFrame { .. })
        )
    }
}

pub type Result<T> = std::result::Result<T, BusError>;

/// TMCL bus to a single module - owns the transport exclusively
pub struct TmclBus {
    transport: Box<dyn Transport>,
    address: u8,
    motor: u8,
    reply_timeout: Duration,
    retries: u32,
}

impl TmclBus {
    pub fn new(transport: Box<dyn Transport>, address: u8, motor: u8) -> Self {
        Self {
            transport,
            address,
            motor,
            reply_timeout: Duration::from_millis(super::transport::DEFAULT_TIMEOUT_MS),
            retries: DEFAULT_RETRIES,
        }
    }

    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    /// Build a command for this bus's module and motor
    pub fn command(&self, instruction: Instruction, type_number: u8, value: i64) -> Result<CommandFrame> {
        Ok(CommandFrame::new(
            self.address,
            instruction,
            type_number,
            self.motor,
            value,
        )?)
    }

    /// Single send/receive cycle, no retries
    fn exchange(&mut self, command: &CommandFrame) -> Result<ReplyFrame> {
        let frame = command.to_bytes();
        let written = self.transport.write(&frame)?;
        if written < FRAME_LEN {
            return Err(BusError::ShortWrite {
                address: self.address,
                written,
            });
        }

        let raw = self.transport.read(FRAME_LEN, self.reply_timeout)?;
        if raw.len() < FRAME_LEN {
            return Err(BusError::Timeout {
                address: self.address,
                received: raw.len(),
            });
        }

        let reply = tmcl::decode(&raw)?;
        if !reply.answers(command) {
            return Err(BusError::UnexpectedReply {
                address: command.address,
                instruction: command.instruction,
                module: reply.module_address,
                command: reply.command,
            });
        }
        Ok(reply)
    }

    /// Execute a command, retrying transport-level failures
    pub fn execute(&mut self, command: &CommandFrame) -> Result<ReplyFrame> {
        let address = self.address;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = self.exchange(command).and_then(|reply| {
                debug!(
                    "Module {}: {:?} type={} value={} -> {:?} value={}",
                    address,
                    command.instruction,
                    command.type_number,
                    command.value,
                    reply.status,
                    reply.value
                );
                if reply.status.is_success() {
                    Ok(reply)
                } else {
                    Err(BusError::Device {
                        address,
                        instruction: command.instruction,
                        status: reply.status,
                    })
                }
            });

            match result {
                Ok(reply) => return Ok(reply),
                Err(e) if e.is_retryable() && attempt <= self.retries => {
                    warn!(
                        "Module {}: attempt {} of {:?} failed ({}), retrying",
                        address, attempt, command.instruction, e
                    );
                    self.transport.clear_input()?;
                }
                Err(e @ BusError::Timeout { .. }) => return Err(e),
                Err(e) if e.is_retryable() => {
                    return Err(BusError::Communication {
                        address,
                        attempts: attempt,
                        last: Box::new(e),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn send(&mut self, instruction: Instruction, type_number: u8, value: i64) -> Result<ReplyFrame> {
        let command = self.command(instruction, type_number, value)?;
        self.execute(&command)
    }

    // === Typed commands ===

    /// ROR: rotate with `velocity`, position counter increasing
    pub fn rotate_right(&mut self, velocity: i64) -> Result<()> {
        self.send(Instruction::RotateRight, 0, velocity).map(|_| ())
    }

    /// ROL: rotate with `velocity`, position counter decreasing
    pub fn rotate_left(&mut self, velocity: i64) -> Result<()> {
        self.send(Instruction::RotateLeft, 0, velocity).map(|_| ())
    }

    /// MST: soft stop
    pub fn stop(&mut self) -> Result<()> {
        self.send(Instruction::Stop, 0, 0).map(|_| ())
    }

    /// MVP: start a move. Returns as soon as the module accepted it.
    pub fn move_to(&mut self, mode: MoveMode, steps: i64) -> Result<()> {
        self.send(Instruction::MoveToPosition, mode as u8, steps)
            .map(|_| ())
    }

    pub fn set_axis_parameter(&mut self, parameter: AxisParameter, value: i64) -> Result<()> {
        self.send(Instruction::SetAxisParameter, parameter as u8, value)
            .map(|_| ())
    }

    pub fn get_axis_parameter(&mut self, parameter: AxisParameter) -> Result<i32> {
        self.send(Instruction::GetAxisParameter, parameter as u8, 0)
            .map(|reply| reply.value)
    }

    /// STAP: persist the current value of `parameter` to EEPROM
    pub fn store_axis_parameter(&mut self, parameter: AxisParameter) -> Result<()> {
        self.send(Instruction::StoreAxisParameter, parameter as u8, 0)
            .map(|_| ())
    }

    /// RSAP: reload `parameter` from EEPROM
    pub fn restore_axis_parameter(&mut self, parameter: AxisParameter) -> Result<()> {
        self.send(Instruction::RestoreAxisParameter, parameter as u8, 0)
            .map(|_| ())
    }

    /// Close the underlying transport
    pub fn close(&mut self) -> Result<()> {
        self.transport.close()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motor::tmcl::encode_reply;
    use std::collections::VecDeque;
    use std::io;
    use std::sync::{Arc, Mutex};

    /// Transport that replays canned replies and records every write
    #[derive(Clone, Default)]
    struct ScriptedTransport {
        pub replies: Arc<Mutex<VecDeque<Vec<u8>>>>,
        pub writes: Arc<Mutex<Vec<Vec<u8>>>>,
        pub clears: Arc<Mutex<usize>>,
        pub short_writes: Arc<Mutex<usize>>,
    }

    impl ScriptedTransport {
        pub fn push(&self, reply: impl Into<Vec<u8>>) {
            self.replies.lock().unwrap().push_back(reply.into());
        }

        pub fn write_count(&self) -> usize {
            self.writes.lock().unwrap().len()
        }
    }

    impl Transport for ScriptedTransport {
        fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
            self.writes.lock().unwrap().push(bytes.to_vec());
            let mut short_writes = self.short_writes.lock().unwrap();
            if *short_writes > 0 {
                *short_writes -= 1;
                return Ok(bytes.len() - 1);
            }
            Ok(bytes.len())
        }

        fn read(&mut self, n: usize, _timeout: Duration) -> io::Result<Vec<u8>> {
            let mut reply = self.replies.lock().unwrap().pop_front().unwrap_or_default();
            reply.truncate(n);
            Ok(reply)
        }

        fn clear_input(&mut self) -> io::Result<()> {
            *self.clears.lock().unwrap() += 1;
            Ok(())
        }

        fn close(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn ok_reply(command: Instruction, value: i32) -> [u8; 9] {
        encode_reply(2, 1, Status::Ok, command as u8, value)
    }

    fn bus(transport: &ScriptedTransport) -> TmclBus {
        TmclBus::new(Box::new(transport.clone()), 1, 0)
    }

    #[test]
    fn test_execute_writes_encoded_frame() {
        let transport = ScriptedTransport::default();
        transport.push(ok_reply(Instruction::SetAxisParameter, 0));
        let mut bus = bus(&transport);

        bus.set_axis_parameter(AxisParameter::MaxSpeed, 5000).unwrap();

        let writes = transport.writes.lock().unwrap();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0], vec![1, 5, 4, 0, 0x00, 0x00, 0x13, 0x88, 165]);
    }

    #[test]
    fn test_rotate_right_frame() {
        let transport = ScriptedTransport::default();
        transport.push(ok_reply(Instruction::RotateRight, 0));
        let mut bus = bus(&transport);

        bus.rotate_right(900).unwrap();
        // 900 = 0x0384; 1 + 1 + 0x03 + 0x84 = 137
        assert_eq!(
            transport.writes.lock().unwrap()[0],
            vec![1, 1, 0, 0, 0x00, 0x00, 0x03, 0x84, 137]
        );
    }

    #[test]
    fn test_restore_axis_parameter_frame() {
        let transport = ScriptedTransport::default();
        transport.push(ok_reply(Instruction::RestoreAxisParameter, 0));
        let mut bus = bus(&transport);

        bus.restore_axis_parameter(AxisParameter::MaxSpeed).unwrap();
        assert_eq!(
            transport.writes.lock().unwrap()[0],
            vec![1, 8, 4, 0, 0, 0, 0, 0, 13]
        );
    }

    #[test]
    fn test_short_write_retried() {
        let transport = ScriptedTransport::default();
        *transport.short_writes.lock().unwrap() = 1;
        transport.push(ok_reply(Instruction::Stop, 0));
        let mut bus = bus(&transport);

        bus.stop().unwrap();
        assert_eq!(transport.write_count(), 2);
    }

    #[test]
    fn test_short_write_without_retries() {
        let transport = ScriptedTransport::default();
        *transport.short_writes.lock().unwrap() = 1;
        let mut bus = bus(&transport).with_retries(0);

        match bus.stop() {
            Err(BusError::Communication { attempts, last, .. }) => {
                assert_eq!(attempts, 1);
                assert!(matches!(*last, BusError::ShortWrite { written: 8, .. }));
            }
            other => panic!("Expected Communication error, got {:?}", other),
        }
    }

    #[test]
    fn test_module_checksum_complaint_retried() {
        let transport = ScriptedTransport::default();
        transport.push(encode_reply(2, 1, Status::WrongChecksum, 3, 0));
        transport.push(ok_reply(Instruction::Stop, 0));
        let mut bus = bus(&transport);

        bus.stop().unwrap();
        assert_eq!(transport.write_count(), 2);
        assert_eq!(*transport.clears.lock().unwrap(), 1);
    }

    #[test]
    fn test_get_axis_parameter_returns_value() {
        let transport = ScriptedTransport::default();
        transport.push(ok_reply(Instruction::GetAxisParameter, -42));
        let mut bus = bus(&transport);

        assert_eq!(bus.get_axis_parameter(AxisParameter::ActualPosition).unwrap(), -42);
    }

    #[test]
    fn test_corrupt_reply_retried_once() {
        let transport = ScriptedTransport::default();
        let mut corrupt = ok_reply(Instruction::Stop, 0);
        corrupt[8] ^= 0xFF;
        transport.push(corrupt);
        transport.push(ok_reply(Instruction::Stop, 0));
        let mut bus = bus(&transport);

        bus.stop().unwrap();
        assert_eq!(transport.write_count(), 2);
        assert_eq!(*transport.clears.lock().unwrap(), 1);
    }

    #[test]
    fn test_retry_budget_exhausted() {
        let transport = ScriptedTransport::default();
        for _ in 0..4 {
            let mut corrupt = ok_reply(Instruction::Stop, 0);
            corrupt[4] = 0x55;
            transport.push(corrupt);
        }
        let mut bus = bus(&transport);

        match bus.stop() {
            Err(BusError::Communication { attempts, last, .. }) => {
                assert_eq!(attempts, 4);
                assert!(matches!(*last, BusError::Protocol(TmclError::ChecksumMismatch { .. })));
            }
            other => panic!("Expected Communication error, got {:?}", other),
        }
        assert_eq!(transport.write_count(), 4);
    }

    #[test]
    fn test_short_read_is_timeout() {
        let transport = ScriptedTransport::default();
        transport.push(vec![2, 1, 100]);
        let mut bus = bus(&transport).with_retries(0);

        match bus.stop() {
            Err(BusError::Timeout { address, received }) => {
                assert_eq!(address, 1);
                assert_eq!(received, 3);
            }
            other => panic!("Expected Timeout, got {:?}", other),
        }
    }

    #[test]
    fn test_device_error_not_retried() {
        let transport = ScriptedTransport::default();
        transport.push(encode_reply(2, 1, Status::InvalidValue, 5, 0));
        transport.push(ok_reply(Instruction::SetAxisParameter, 0));
        let mut bus = bus(&transport);

        match bus.set_axis_parameter(AxisParameter::MaxSpeed, -1) {
            Err(BusError::Device { status, instruction, .. }) => {
                assert_eq!(status, Status::InvalidValue);
                assert_eq!(instruction, Instruction::SetAxisParameter);
            }
            other => panic!("Expected Device error, got {:?}", other),
        }
        assert_eq!(transport.write_count(), 1);
    }

    #[test]
    fn test_stale_reply_is_retried() {
        let transport = ScriptedTransport::default();
        // Leftover GAP reply in the stream, then the real MST reply
        transport.push(ok_reply(Instruction::GetAxisParameter, 7));
        transport.push(ok_reply(Instruction::Stop, 0));
        let mut bus = bus(&transport);

        bus.stop().unwrap();
        assert_eq!(transport.write_count(), 2);
    }

    #[test]
    fn test_value_out_of_range_never_written() {
        let transport = ScriptedTransport::default();
        let mut bus = bus(&transport);

        let result = bus.move_to(MoveMode::Absolute, i64::from(i32::MAX) + 1);
        assert!(matches!(
            result,
            Err(BusError::Protocol(TmclError::ValueOutOfRange { .. }))
        ));
        assert_eq!(transport.write_count(), 0);
    }
}
