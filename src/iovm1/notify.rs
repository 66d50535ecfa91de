//! Notification types emitted by a running VM.
//!
//! The same [`Notification`] values are produced whether the VM executes
//! in-process (`Vm::step` returning `StepOutcome::Suspend`) or is driven
//! remotely and observed through [`crate::rpc::handlers`] decoding wire
//! frames — one typed sum type for both paths, per the source's
//! per-event callbacks collapsed into tagged deliveries.

use crate::frame::Channel;
use crate::iovm1::vm::VmState;
use crate::target::VmResultCode;
use bytes::Bytes;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// One VM execution has ended; exactly one of these is emitted per
    /// execution.
    PrgEnd {
        pc: u32,
        opcode: u8,
        result: VmResultCode,
        state: VmState,
    },
    /// A chunk of a streaming read. `chunk_offset` is strictly monotonic
    /// within one read chain and the payload lengths sum to the read's
    /// declared `len`.
    ReadChunk {
        pc: u32,
        tdu: u8,
        addr: u32,
        len: u32,
        chunk_offset: u32,
        data: Bytes,
        is_final: bool,
    },
    WriteStart { pc: u32, tdu: u8, addr: u32, len: u32 },
    WriteEnd { pc: u32, tdu: u8, addr: u32, len: u32 },
    WaitComplete {
        pc: u32,
        opcode: u8,
        result: VmResultCode,
        state: VmState,
    },
    /// A message on a type byte this crate doesn't interpret (PPUX and
    /// other external subsystems) — passed through unparsed, per the
    /// crate's scope.
    Opaque { channel: Channel, data: Bytes },
}
