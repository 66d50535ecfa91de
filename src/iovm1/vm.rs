//! The IOVM1 interpreter: stepwise opcode execution, four channels of
//! register state, wait-loops, and read/write streaming.

use crate::frame::MAX_PAYLOAD;
use crate::iovm1::channel::VmChannel;
use crate::iovm1::notify::Notification;
use crate::iovm1::opcode::{Instruction, Opcode};
use crate::iovm1::program::Program;
use crate::target::{TargetTable, VmError, VmResultCode};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Notification-emission and auto-restart bits set by `SetFlags`.
pub mod vm_flags {
    pub const NOTIFY_WRITE_START: u8 = 0x01;
    pub const NOTIFY_WRITE_END: u8 = 0x02;
    pub const NOTIFY_WAIT_COMPLETE: u8 = 0x04;
    pub const AUTO_RESTART_ON_ERROR: u8 = 0x08;
    pub const AUTO_RESTART_ON_END: u8 = 0x10;
}

/// Overall VM execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum VmState {
    Init = 0,
    Loaded = 1,
    Reset = 2,
    ExecuteNext = 3,
    InvokeCallback = 4,
    Ended = 5,
}

/// One call to [`Vm::step`] reports exactly one of these outcomes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// A micro-instruction completed with nothing to report; call `step`
    /// again immediately.
    Continue,
    /// Exactly one notification is ready; the VM is immediately ready to
    /// resume on the next `step` call (this is the pull-based shape of
    /// the source's blocking callback invocation).
    Suspend(Notification),
    /// The program has ended; `step` should not be called again until a
    /// command (`Reset`/`Upload`) moves the VM out of `Ended`.
    Ended(VmResultCode),
}

struct ReadProgress {
    channel: u8,
    pc_at_start: u32,
    total_len: u32,
}

struct PendingWrite {
    channel: u8,
    pc_at_start: u32,
    data: bytes::Bytes,
}

struct WaitProgress {
    channel: u8,
    opcode: Opcode,
    pc_at_start: u32,
}

pub struct Vm {
    program: Option<Program>,
    pc: usize,
    channels: [VmChannel; 4],
    state: VmState,
    flags: u8,
    active_read: Option<ReadProgress>,
    pending_write: Option<PendingWrite>,
    active_wait: Option<WaitProgress>,
    /// Set when a runtime error needs to surface as `NotifyEnd` only
    /// after an already-emitted notification for the same event (e.g. a
    /// wait timeout emits `WaitComplete` before `PrgEnd`).
    pending_end: Option<(u32, u8, VmResultCode)>,
    /// Set by `Stop`: freezes execution without moving `state` off
    /// whatever running state it found the VM in (`stop`'s wire contract
    /// is "halt; no state change"). Only `Reset`/`Upload` clear it; `step`
    /// becomes a no-op while set.
    halted: bool,
}

impl Vm {
    pub fn new() -> Vm {
        Vm {
            program: None,
            pc: 0,
            channels: std::array::from_fn(|_| VmChannel::new()),
            state: VmState::Init,
            flags: 0,
            active_read: None,
            pending_write: None,
            active_wait: None,
            pending_end: None,
            halted: false,
        }
    }

    pub fn state(&self) -> VmState {
        self.state
    }

    /// Whether `Stop` has frozen execution. A host's tick loop should stop
    /// calling `step` once this is set (calling it anyway is harmless — it
    /// no-ops) and only resume feeding ticks after `Reset`/`Upload`.
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// `Upload`: loads a new program image. Legal from `Init`/`Loaded`/
    /// `Reset`/`Ended` only.
    pub fn upload(&mut self, program: Program) -> VmResultCode {
        match self.state {
            VmState::Init | VmState::Loaded | VmState::Reset | VmState::Ended => {
                self.program = Some(program);
                self.pc = 0;
                self.reset_run_state();
                self.state = VmState::Loaded;
                VmResultCode::Success
            }
            VmState::ExecuteNext | VmState::InvokeCallback => {
                VmResultCode::InvalidOperationForState
            }
        }
    }

    /// `Start`: begins or resumes execution from `Loaded`/`Reset`.
    pub fn start(&mut self) -> VmResultCode {
        match self.state {
            VmState::Loaded | VmState::Reset => {
                self.state = VmState::ExecuteNext;
                VmResultCode::Success
            }
            _ => VmResultCode::InvalidOperationForState,
        }
    }

    /// `Stop`: halts execution. Legal from any actively-running state;
    /// per the wire contract this changes nothing about `state` itself —
    /// `GetState` keeps reporting whatever running state execution was
    /// frozen in. The only way out of a halted VM is `Reset` (or
    /// `Upload`, once `Reset`/`Ended` is reached).
    pub fn stop(&mut self) -> VmResultCode {
        match self.state {
            VmState::ExecuteNext | VmState::InvokeCallback => {
                self.halted = true;
                VmResultCode::Success
            }
            _ => VmResultCode::InvalidOperationForState,
        }
    }

    /// `Reset`: rewinds the program counter but keeps the resident
    /// program. Legal from `Loaded`/`Reset`/`ExecuteNext`/`InvokeCallback`/`Ended`.
    pub fn reset(&mut self) -> VmResultCode {
        match self.state {
            VmState::Init => VmResultCode::InvalidOperationForState,
            _ => {
                self.pc = 0;
                self.reset_run_state();
                self.state = VmState::Reset;
                VmResultCode::Success
            }
        }
    }

    /// `SetFlags`: updates the notification/auto-restart bitset. Legal in
    /// any state (it only affects future notification emission).
    pub fn set_flags(&mut self, flags: u8) -> VmResultCode {
        self.flags = flags;
        VmResultCode::Success
    }

    fn reset_run_state(&mut self) {
        self.active_read = None;
        self.pending_write = None;
        self.active_wait = None;
        self.pending_end = None;
        self.halted = false;
    }

    fn auto_restart_state(&self, on_error: bool) -> VmState {
        let bit = if on_error {
            vm_flags::AUTO_RESTART_ON_ERROR
        } else {
            vm_flags::AUTO_RESTART_ON_END
        };
        if self.flags & bit != 0 {
            VmState::Reset
        } else {
            VmState::Ended
        }
    }

    fn end_run(&mut self, pc: u32, opcode: u8, result: VmResultCode) -> StepOutcome {
        self.state = self.auto_restart_state(result != VmResultCode::Success);
        if self.state == VmState::Reset {
            self.pc = 0;
        }
        self.reset_run_state();
        StepOutcome::Suspend(Notification::PrgEnd {
            pc,
            opcode,
            result,
            state: self.state,
        })
    }

    /// Executes one micro-instruction, one wait-loop iteration, or one
    /// chunk of an in-flight read/write. The caller (the host's tick
    /// loop) drives this repeatedly.
    #[tracing::instrument(skip(self, targets))]
    pub fn step(&mut self, targets: &mut TargetTable) -> StepOutcome {
        if self.halted {
            return StepOutcome::Continue;
        }
        if self.state != VmState::ExecuteNext && self.state != VmState::InvokeCallback {
            return StepOutcome::Ended(VmResultCode::InvalidOperationForState);
        }

        if let Some((pc, opcode, result)) = self.pending_end.take() {
            return self.end_run(pc, opcode, result);
        }

        if self.active_wait.is_some() {
            return self.step_wait(targets);
        }

        if self.pending_write.is_some() {
            return self.step_write_commit(targets);
        }

        if self.active_read.is_some() {
            return self.step_read_chunk(targets);
        }

        self.step_fetch(targets)
    }

    fn step_fetch(&mut self, targets: &mut TargetTable) -> StepOutcome {
        let pc_at_start = self.pc as u32;
        let byte = match self.program_byte(self.pc) {
            Ok(b) => b,
            Err(e) => return self.end_run(pc_at_start, 0, e.into()),
        };
        let instr = match Instruction::decode(byte) {
            Ok(i) => i,
            Err(e) => return self.end_run(pc_at_start, byte, e.into()),
        };
        self.pc += 1;

        match self.dispatch(instr, pc_at_start, targets) {
            Ok(outcome) => outcome,
            Err(e) => self.end_run(pc_at_start, instr.opcode.into(), e.into()),
        }
    }

    fn dispatch(
        &mut self,
        instr: Instruction,
        pc_at_start: u32,
        targets: &mut TargetTable,
    ) -> Result<StepOutcome, VmError> {
        let ch = instr.channel as usize;
        match instr.opcode {
            Opcode::End => Ok(self.end_run(pc_at_start, instr.opcode.into(), VmResultCode::Success)),
            Opcode::SetA8 => {
                let v = self.fetch_u8()?;
                self.channels[ch].set_addr8(v);
                Ok(StepOutcome::Continue)
            }
            Opcode::SetA16 => {
                let v = self.fetch_u16()?;
                self.channels[ch].set_addr16(v);
                Ok(StepOutcome::Continue)
            }
            Opcode::SetA24 => {
                let v = self.fetch_u24()?;
                self.channels[ch].set_addr24(v);
                Ok(StepOutcome::Continue)
            }
            Opcode::SetTdu => {
                let v = self.fetch_u8()?;
                self.channels[ch].set_tdu(v);
                Ok(StepOutcome::Continue)
            }
            Opcode::SetLen => {
                let v = self.fetch_u16()?;
                self.channels[ch].set_len(v);
                Ok(StepOutcome::Continue)
            }
            Opcode::SetCmpMsk => {
                let value = self.fetch_u8()?;
                let mask = self.fetch_u8()?;
                self.channels[ch].set_cmp(value, mask);
                Ok(StepOutcome::Continue)
            }
            Opcode::SetTim => {
                let v = self.fetch_u16()?;
                self.channels[ch].set_timeout(v);
                Ok(StepOutcome::Continue)
            }
            Opcode::Read => self.begin_read(ch as u8, pc_at_start, targets),
            Opcode::Write => self.begin_write(ch as u8, pc_at_start),
            Opcode::WaitWhileNeq
            | Opcode::WaitWhileEq
            | Opcode::WaitWhileLt
            | Opcode::WaitWhileGt
            | Opcode::WaitWhileLte
            | Opcode::WaitWhileGte => {
                self.channels[ch].start_wait();
                self.active_wait = Some(WaitProgress {
                    channel: ch as u8,
                    opcode: instr.opcode,
                    pc_at_start,
                });
                self.state = VmState::ExecuteNext;
                Ok(StepOutcome::Continue)
            }
        }
    }

    fn fetch_u8(&mut self) -> Result<u8, VmError> {
        let v = self.program_byte(self.pc)?;
        self.pc += 1;
        Ok(v)
    }

    fn fetch_u16(&mut self) -> Result<u16, VmError> {
        let program = self.program.as_ref().ok_or(VmError::OutOfRange)?;
        let v = program.fetch_u16(self.pc)?;
        self.pc += 2;
        Ok(v)
    }

    fn fetch_u24(&mut self) -> Result<u32, VmError> {
        let program = self.program.as_ref().ok_or(VmError::OutOfRange)?;
        let v = program.fetch_u24(self.pc)?;
        self.pc += 3;
        Ok(v)
    }

    fn program_byte(&self, pc: usize) -> Result<u8, VmError> {
        self.program.as_ref().ok_or(VmError::OutOfRange)?.fetch_u8(pc)
    }

    fn begin_read(
        &mut self,
        ch: u8,
        pc_at_start: u32,
        targets: &mut TargetTable,
    ) -> Result<StepOutcome, VmError> {
        let channel = &mut self.channels[ch as usize];
        channel.target.ok_or(VmError::MemoryTargetUndefined)?;
        channel.start_transfer();
        let total_len = channel.len;

        self.state = VmState::InvokeCallback;
        self.active_read = Some(ReadProgress {
            channel: ch,
            pc_at_start,
            total_len,
        });
        Ok(self.emit_read_chunk(targets).unwrap_or(StepOutcome::Continue))
    }

    fn step_read_chunk(&mut self, targets: &mut TargetTable) -> StepOutcome {
        match self.emit_read_chunk(targets) {
            Some(outcome) => outcome,
            None => StepOutcome::Continue,
        }
    }

    /// Transfers one up-to-63-byte chunk of the read in progress and
    /// returns the `ReadChunk` notification for it, or `None` if there is
    /// no read in progress (unreachable in practice; callers guard on
    /// `active_read.is_some()`).
    fn emit_read_chunk(&mut self, targets: &mut TargetTable) -> Option<StepOutcome> {
        let progress = self.active_read.as_ref()?;
        let ch = progress.channel;
        let pc_at_start = progress.pc_at_start;
        let total_len = progress.total_len;

        let channel = &self.channels[ch as usize];
        let target = match channel.target {
            Some(t) => t,
            None => {
                self.active_read = None;
                return Some(self.end_run(pc_at_start, Opcode::Read.into(), VmError::MemoryTargetUndefined.into()));
            }
        };
        let remaining = channel.remaining;
        let chunk_len = remaining.min(MAX_PAYLOAD as u32);
        let chunk_offset = total_len - remaining;
        let reverse = channel.reverse();
        let addr = channel.addr;
        let tdu = channel.target_flags | target as u8;

        let start_addr = if reverse {
            addr.wrapping_sub(chunk_offset).wrapping_sub(chunk_len.saturating_sub(1))
        } else {
            addr.wrapping_add(chunk_offset)
        };

        let data = match targets.read_at(target, start_addr, chunk_len) {
            Ok(mut bytes) => {
                if reverse {
                    let mut v = bytes.to_vec();
                    v.reverse();
                    bytes = bytes::Bytes::from(v);
                }
                bytes
            }
            Err(e) => {
                self.active_read = None;
                return Some(self.end_run(pc_at_start, Opcode::Read.into(), e.into()));
            }
        };

        let channel = &mut self.channels[ch as usize];
        channel.remaining -= chunk_len;
        let is_final = channel.remaining == 0;

        if is_final {
            if channel.update_addr() {
                channel.addr = if reverse {
                    channel.addr.wrapping_sub(total_len)
                } else {
                    channel.addr.wrapping_add(total_len)
                };
            }
            self.active_read = None;
            self.state = VmState::ExecuteNext;
        }

        Some(StepOutcome::Suspend(Notification::ReadChunk {
            pc: pc_at_start,
            tdu,
            addr,
            len: total_len,
            chunk_offset,
            data,
            is_final,
        }))
    }

    fn begin_write(&mut self, ch: u8, pc_at_start: u32) -> Result<StepOutcome, VmError> {
        let channel = &self.channels[ch as usize];
        let target = channel.target.ok_or(VmError::MemoryTargetUndefined)?;
        let len = channel.len as usize;

        let program = self.program.as_ref().ok_or(VmError::OutOfRange)?;
        let data = program.slice(self.pc, len)?;
        self.pc += len;

        self.state = VmState::InvokeCallback;
        self.pending_write = Some(PendingWrite {
            channel: ch,
            pc_at_start,
            data,
        });

        if self.flags & vm_flags::NOTIFY_WRITE_START != 0 {
            let channel = &self.channels[ch as usize];
            Ok(StepOutcome::Suspend(Notification::WriteStart {
                pc: pc_at_start,
                tdu: channel.target_flags | target as u8,
                addr: channel.addr,
                len: channel.len,
            }))
        } else {
            self.step_write_commit_inner(pc_at_start)
        }
    }

    fn step_write_commit(&mut self, targets: &mut TargetTable) -> StepOutcome {
        let Some(pending) = self.pending_write.take() else {
            return StepOutcome::Continue;
        };
        let ch = pending.channel as usize;
        let channel = &self.channels[ch];
        let target = match channel.target {
            Some(t) => t,
            None => {
                return self.end_run(
                    pending.pc_at_start,
                    Opcode::Write.into(),
                    VmError::MemoryTargetUndefined.into(),
                )
            }
        };
        let len = pending.data.len() as u32;
        let reverse = channel.reverse();
        let addr = channel.addr;

        let start_addr = if reverse {
            addr.wrapping_sub(len.saturating_sub(1))
        } else {
            addr
        };
        let ordered: Vec<u8> = if reverse {
            let mut v = pending.data.to_vec();
            v.reverse();
            v
        } else {
            pending.data.to_vec()
        };

        if let Err(e) = targets.write_at(target, start_addr, &ordered) {
            return self.end_run(pending.pc_at_start, Opcode::Write.into(), e.into());
        }

        let channel = &mut self.channels[ch];
        if channel.update_addr() {
            channel.addr = if reverse {
                channel.addr.wrapping_sub(len)
            } else {
                channel.addr.wrapping_add(len)
            };
        }
        let tdu = channel.target_flags | target as u8;
        self.state = VmState::ExecuteNext;

        if self.flags & vm_flags::NOTIFY_WRITE_END != 0 {
            StepOutcome::Suspend(Notification::WriteEnd {
                pc: pending.pc_at_start,
                tdu,
                addr,
                len,
            })
        } else {
            StepOutcome::Continue
        }
    }

    fn step_write_commit_inner(&mut self, pc_at_start: u32) -> Result<StepOutcome, VmError> {
        let _ = pc_at_start;
        // The actual memory write happens on the next `step` call via
        // `step_write_commit`; this path is taken only when `WriteStart`
        // isn't being emitted, so there is nothing to report yet.
        Ok(StepOutcome::Continue)
    }

    fn step_wait(&mut self, targets: &mut TargetTable) -> StepOutcome {
        let wait = self.active_wait.as_ref().expect("active_wait checked by caller");
        let ch = wait.channel as usize;
        let opcode = wait.opcode;
        let pc_at_start = wait.pc_at_start;

        let channel = &self.channels[ch];
        let target = match channel.target {
            Some(t) => t,
            None => {
                self.active_wait = None;
                return self.end_run(pc_at_start, opcode.into(), VmError::MemoryTargetUndefined.into());
            }
        };
        let addr = channel.addr;
        let mask = channel.cmp_mask;
        let cmp_value = channel.cmp_value;
        let timeout = channel.timeout;

        let sample = match targets.read_at(target, addr, 1) {
            Ok(b) => b[0],
            Err(e) => {
                self.active_wait = None;
                return self.end_run(pc_at_start, opcode.into(), e.into());
            }
        };
        let masked = sample & mask;

        if opcode.wait_predicate(masked, cmp_value) {
            let channel = &mut self.channels[ch];
            channel.elapsed += 1;
            if timeout > 0 && channel.elapsed >= timeout {
                self.active_wait = None;
                self.pending_end = Some((pc_at_start, opcode.into(), VmResultCode::TimedOut));
                return StepOutcome::Suspend(Notification::WaitComplete {
                    pc: pc_at_start,
                    opcode: opcode.into(),
                    result: VmResultCode::TimedOut,
                    state: self.state,
                });
            }
            StepOutcome::Continue
        } else {
            self.active_wait = None;
            self.state = VmState::ExecuteNext;
            if self.flags & vm_flags::NOTIFY_WAIT_COMPLETE != 0 {
                StepOutcome::Suspend(Notification::WaitComplete {
                    pc: pc_at_start,
                    opcode: opcode.into(),
                    result: VmResultCode::Success,
                    state: self.state,
                })
            } else {
                StepOutcome::Continue
            }
        }
    }
}

impl Default for Vm {
    fn default() -> Vm {
        Vm::new()
    }
}
