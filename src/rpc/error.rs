//! Dispatcher-level errors: protocol violations and connection loss.

use crate::frame::FrameError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("framing error: {0}")]
    Frame(#[from] FrameError),

    #[error("unknown type byte {type_byte:#04x} on channel {channel:?}")]
    UnknownType { channel: crate::frame::Channel, type_byte: u8 },

    #[error("handler produced a malformed completion payload")]
    MalformedPayload,

    #[error("connection closed while a command was in flight")]
    ConnectionClosed,

    #[error("completion arrived but no waiter was pending for this command type")]
    UnmatchedCompletion,
}
