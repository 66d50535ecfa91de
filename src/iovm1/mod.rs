//! The IOVM1 byte-code interpreter: instruction decoding, channel
//! register state, and the stepwise execution engine.

pub mod channel;
pub mod notify;
pub mod opcode;
pub mod program;
pub mod vm;

pub use channel::VmChannel;
pub use notify::Notification;
pub use opcode::{Instruction, Opcode};
pub use program::Program;
pub use vm::{vm_flags, StepOutcome, Vm, VmState};
