//! Core of a host-agent system for scripting a retro-console emulator over
//! a byte-stream connection: the IOVM1 byte-code interpreter, the 64-byte
//! framed transport it and the RPC layer share, and the RPC dispatcher that
//! demultiplexes responses/notifications and correlates commands with
//! their completions.
//!
//! Socket bootstrap, process lifecycle, controller-side convenience
//! wrappers, CLI glue, and the PPUX overlay subsystem are external
//! collaborators — this crate only provides the wire-level building
//! blocks (see `DESIGN.md` for the scope boundary).

pub mod frame;
pub mod iovm1;
pub mod rpc;
pub mod target;


pub use frame::{Channel, Frame, FrameDecoder, FrameEncoder, FrameError, FramedReader, FramedWriter};
pub use iovm1::{Notification, Program, StepOutcome, Vm, VmChannel, VmState};
pub use rpc::{Command, Completion, DispatchError, Dispatcher};
pub use target::{MemoryAccess, Target, TargetTable, VmError, VmResultCode};

/// Error returned by code at the crate's public boundary that doesn't
/// warrant its own `thiserror` enum.
///
/// Library internals never use this — `frame::FrameError`, `target::VmError`,
/// and `rpc::DispatchError` are the typed errors propagated with `?`
/// throughout. This alias exists only for integration glue (tests, example
/// binaries) that needs to bubble up any of the above uniformly.
pub type Error = Box<dyn std::error::Error + Send + Sync>;

/// A specialized `Result` type mirroring [`Error`]'s scope.
pub type Result<T> = std::result::Result<T, Error>;
