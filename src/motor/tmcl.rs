// TMCL binary protocol (Trinamic Motion Control Language)
//
// Every transaction is a fixed 9-byte frame in each direction:
// Command: [Address, Instruction, Type, Motor, Value(4, big-endian), Checksum]
// Reply:   [ReplyAddress, ModuleAddress, Status, Command, Value(4, big-endian), Checksum]
// Checksum is the sum of the first 8 bytes mod 256.

use std::fmt;

/// Length of every TMCL frame, command and reply alike
pub const FRAME_LEN: usize = 9;

/// Default module address of a freshly configured TMCL module
pub const DEFAULT_MODULE_ADDRESS: u8 = 1;

pub type Result<T> = std::result::Result<T, TmclError>;

/// Instruction set (subset used for axis motion)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    /// ROR: rotate right (position counter increases)
    RotateRight = 1,
    /// ROL: rotate left (position counter decreases)
    RotateLeft = 2,
    /// MST: soft stop with deceleration ramp
    Stop = 3,
    /// MVP: move to position
    MoveToPosition = 4,
    /// SAP: set axis parameter (volatile)
    SetAxisParameter = 5,
    /// GAP: get axis parameter
    GetAxisParameter = 6,
    /// STAP: store axis parameter to EEPROM
    StoreAxisParameter = 7,
    /// RSAP: restore axis parameter from EEPROM
    RestoreAxisParameter = 8,
}

/// Type byte of an MVP command
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveMode {
    Absolute = 0,
    Relative = 1,
}

/// Axis parameters addressed by SAP/GAP/STAP/RSAP
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AxisParameter {
    TargetPosition = 0,
    ActualPosition = 1,
    TargetSpeed = 2,
    ActualSpeed = 3,
    MaxSpeed = 4,
    MaxAcceleration = 5,
    MaxCurrent = 6,
    StandbyCurrent = 7,
    TargetPositionReached = 8,
    ReferenceSwitchStatus = 9,
    RightLimitSwitchStatus = 10,
    LeftLimitSwitchStatus = 11,
    RightLimitSwitchDisable = 12,
    LeftLimitSwitchDisable = 13,
    MinSpeed = 130,
    ActualAcceleration = 135,
    RampMode = 138,
    MicrostepResolution = 140,
    ReferenceSwitchTolerance = 141,
    SoftStopFlag = 149,
    RampDivisor = 153,
    PulseDivisor = 154,
    ReferencingMode = 193,
    ReferencingSearchSpeed = 194,
    ReferencingSwitchSpeed = 195,
    MixedDecayThreshold = 203,
    Freewheeling = 204,
    StallDetectionThreshold = 205,
    ActualLoadValue = 206,
    DriverErrorFlags = 208,
    FullstepThreshold = 211,
    PowerDownDelay = 214,
}

/// Status byte of a reply
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok = 100,
    CommandLoaded = 101,
    WrongChecksum = 1,
    InvalidCommand = 2,
    WrongType = 3,
    InvalidValue = 4,
    EepromLocked = 5,
    CommandNotAvailable = 6,
}

impl Status {
    /// Whether the module accepted and executed (or stored) the command
    pub fn is_success(self) -> bool {
        matches!(self, Status::Ok | Status::CommandLoaded)
    }

    pub fn description(self) -> &'static str {
        match self {
            Status::Ok => "successfully executed, no error",
            Status::CommandLoaded => "command loaded into TMCL program EEPROM",
            Status::WrongChecksum => "wrong checksum",
            Status::InvalidCommand => "invalid command",
            Status::WrongType => "wrong type",
            Status::InvalidValue => "invalid value",
            Status::EepromLocked => "configuration EEPROM locked",
            Status::CommandNotAvailable => "command not available",
        }
    }
}

impl TryFrom<u8> for Status {
    type Error = TmclError;

    fn try_from(code: u8) -> Result<Self> {
        Ok(match code {
            100 => Status::Ok,
            101 => Status::CommandLoaded,
            1 => Status::WrongChecksum,
            2 => Status::InvalidCommand,
            3 => Status::WrongType,
            4 => Status::InvalidValue,
            5 => Status::EepromLocked,
            6 => Status::CommandNotAvailable,
            _ => return Err(TmclError::UnknownStatus { code }),
        })
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.description(), *self as u8)
    }
}

/// Frame-level protocol errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TmclError {
    #[error("Value {value} does not fit the signed 32-bit TMCL value field")]
    ValueOutOfRange { value: i64 },

    #[error("Checksum mismatch: expected 0x{expected:02X}, got 0x{actual:02X}")]
    ChecksumMismatch { expected: u8, actual: u8 },

    #[error("Malformed frame: expected 9 bytes, got {len}")]
    MalformedFrame { len: usize },

    #[error("Unknown reply status code {code}")]
    UnknownStatus { code: u8 },
}

/// Sum of bytes mod 256
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// An outgoing command, immutable once built
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandFrame {
    pub address: u8,
    pub instruction: Instruction,
    pub type_number: u8,
    pub motor: u8,
    pub value: i32,
}

impl CommandFrame {
    pub fn new(
        address: u8,
        instruction: Instruction,
        type_number: u8,
        motor: u8,
        value: i64,
    ) -> Result<Self> {
        let value = i32::try_from(value).map_err(|_| TmclError::ValueOutOfRange { value })?;
        Ok(Self {
            address,
            instruction,
            type_number,
            motor,
            value,
        })
    }

    pub fn to_bytes(&self) -> [u8; FRAME_LEN] {
        let mut frame = [0u8; FRAME_LEN];
        frame[0] = self.address;
        frame[1] = self.instruction as u8;
        frame[2] = self.type_number;
        frame[3] = self.motor;
        frame[4..8].copy_from_slice(&self.value.to_be_bytes());
        frame[8] = checksum(&frame[..8]);
        frame
    }
}

/// Encode a command into its 9-byte wire form
pub fn encode(
    address: u8,
    instruction: Instruction,
    type_number: u8,
    motor: u8,
    value: i64,
) -> Result<[u8; FRAME_LEN]> {
    Ok(CommandFrame::new(address, instruction, type_number, motor, value)?.to_bytes())
}

/// A decoded, checksum-verified reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyFrame {
    pub reply_address: u8,
    pub module_address: u8,
    pub status: Status,
    pub command: u8,
    pub value: i32,
    pub checksum: u8,
}

impl ReplyFrame {
    /// Whether this reply answers `command` (same module, same instruction)
    pub fn answers(&self, command: &CommandFrame) -> bool {
        self.module_address == command.address && self.command == command.instruction as u8
    }
}

/// Decode a reply, verifying length and checksum
pub fn decode(bytes: &[u8]) -> Result<ReplyFrame> {
    if bytes.len() != FRAME_LEN {
        return Err(TmclError::MalformedFrame { len: bytes.len() });
    }

    let expected = checksum(&bytes[..8]);
    if expected != bytes[8] {
        return Err(TmclError::ChecksumMismatch {
            expected,
            actual: bytes[8],
        });
    }

    Ok(ReplyFrame {
        reply_address: bytes[0],
        module_address: bytes[1],
        status: Status::try_from(bytes[2])?,
        command: bytes[3],
        value: i32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        checksum: bytes[8],
    })
}

/// Build the wire form of a reply. Used by the simulated module.
pub fn encode_reply(
    reply_address: u8,
    module_address: u8,
    status: Status,
    command: u8,
    value: i32,
) -> [u8; FRAME_LEN] {
    let mut frame = [0u8; FRAME_LEN];
    frame[0] = reply_address;
    frame[1] = module_address;
    frame[2] = status as u8;
    frame[3] = command;
    frame[4..8].copy_from_slice(&value.to_be_bytes());
    frame[8] = checksum(&frame[..8]);
    frame
}
