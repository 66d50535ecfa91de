//! Wire-level command/response encoding.

use crate::iovm1::VmState;
use crate::target::VmResultCode;
use bytes::{BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Transport-level result code accompanying every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum RexResult {
    Success = 0,
    MsgTooShort = 1,
    CmdUnknown = 2,
    CmdError = 3,
}

/// Command type codes for channel 0 outbound messages. PPUX and other
/// subsystems occupy 16 and above and are not modeled here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum CommandType {
    Upload = 0,
    Start = 1,
    Stop = 2,
    Reset = 3,
    SetFlags = 4,
    GetState = 5,
}

/// Notification type codes for channel 1 inbound messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum NotificationType {
    NotifyEnd = 0x80,
    NotifyRead = 0x81,
    NotifyWrite = 0x82,
    NotifyWait = 0x83,
}

/// An outbound IOVM1 command.
#[derive(Debug, Clone)]
pub enum Command {
    Upload(Bytes),
    Start,
    Stop,
    Reset,
    SetFlags(u8),
    GetState,
}

impl Command {
    pub fn command_type(&self) -> CommandType {
        match self {
            Command::Upload(_) => CommandType::Upload,
            Command::Start => CommandType::Start,
            Command::Stop => CommandType::Stop,
            Command::Reset => CommandType::Reset,
            Command::SetFlags(_) => CommandType::SetFlags,
            Command::GetState => CommandType::GetState,
        }
    }

    /// The `[type][body...]` bytes to write.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(self.command_type().into());
        match self {
            Command::Upload(program) => buf.extend_from_slice(program),
            Command::SetFlags(flags) => buf.put_u8(*flags),
            Command::Start | Command::Stop | Command::Reset | Command::GetState => {}
        }
        buf.freeze()
    }
}

/// A parsed command completion: every command yields `[RexResult, VmErr]`;
/// `GetState` additionally carries the VM's current `State` (the other
/// completion parsers are treated as structurally identical to
/// `UploadComplete`, see the crate's design notes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub command_type: CommandType,
    pub rex_result: RexResult,
    pub vm_err: VmResultCode,
    pub state: Option<VmState>,
}
