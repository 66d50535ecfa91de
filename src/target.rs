//! Memory-target accessors: uniform read/write across the seven
//! emulator-visible memory regions an IOVM1 program can address.

use bytes::Bytes;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;

/// One of the seven addressable memory regions.
///
/// The wire encoding matches the low nibble of a channel's `SETTDU`
/// operand; the upper bits of that operand are [`TargetFlags`], stripped
/// before conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum Target {
    Wram = 0,
    Sram = 1,
    Rom = 2,
    /// The mapped execution window at `$2C00`; the one target IOVM1's
    /// `WRITE` opcode typically patches a native code stub into.
    Nmi2c00 = 3,
    Vram = 4,
    Cgram = 5,
    Oam = 6,
}

/// Direction/behavior bits carried in the high nibble of a `SETTDU` operand.
pub mod target_flags {
    /// Transfer walks the address backward (decrement) for its duration.
    pub const REVERSE: u8 = 0x40;
    /// After the transfer, advance the channel's address past the last
    /// byte touched. Absent, the address is left unchanged.
    pub const UPDATE_ADDR: u8 = 0x80;

    /// Mask isolating the [`Target`](super::Target) nibble from a raw
    /// `SETTDU` operand.
    pub const TARGET_MASK: u8 = 0x0F;
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    #[error("operation out of range")]
    OutOfRange,
    #[error("invalid operation for current VM state")]
    InvalidOperationForState,
    #[error("unknown opcode")]
    UnknownOpcode,
    #[error("operation timed out")]
    TimedOut,
    #[error("memory target undefined")]
    MemoryTargetUndefined,
    #[error("memory target not readable")]
    MemoryTargetNotReadable,
    #[error("memory target not writable")]
    MemoryTargetNotWritable,
    #[error("memory target address out of range")]
    MemoryTargetAddressOutOfRange,
}

/// Wire-level VM result code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum VmResultCode {
    Success = 0,
    OutOfRange = 1,
    InvalidOperationForState = 2,
    UnknownOpcode = 3,
    TimedOut = 4,
    MemoryTargetUndefined = 5,
    MemoryTargetNotReadable = 6,
    MemoryTargetNotWritable = 7,
    MemoryTargetAddressOutOfRange = 8,
}

impl From<VmError> for VmResultCode {
    fn from(err: VmError) -> VmResultCode {
        match err {
            VmError::OutOfRange => VmResultCode::OutOfRange,
            VmError::InvalidOperationForState => VmResultCode::InvalidOperationForState,
            VmError::UnknownOpcode => VmResultCode::UnknownOpcode,
            VmError::TimedOut => VmResultCode::TimedOut,
            VmError::MemoryTargetUndefined => VmResultCode::MemoryTargetUndefined,
            VmError::MemoryTargetNotReadable => VmResultCode::MemoryTargetNotReadable,
            VmError::MemoryTargetNotWritable => VmResultCode::MemoryTargetNotWritable,
            VmError::MemoryTargetAddressOutOfRange => VmResultCode::MemoryTargetAddressOutOfRange,
        }
    }
}

/// Uniform accessor a host installs for one memory target.
///
/// `write_at`'s default rejects all writes, matching targets like ROM that
/// are read-only by construction; writable targets override it.
pub trait MemoryAccess {
    fn read_at(&self, offset: u32, len: u32) -> Result<Bytes, VmError>;

    fn write_at(&mut self, offset: u32, data: &[u8]) -> Result<(), VmError> {
        let _ = (offset, data);
        Err(VmError::MemoryTargetNotWritable)
    }
}

/// Registry of installed target accessors, indexed by [`Target`].
///
/// An empty slot yields `MemoryTargetUndefined` on any access, mirroring
/// an emulator build that doesn't expose a given region (e.g. no SRAM
/// present in the loaded cartridge).
#[derive(Default)]
pub struct TargetTable {
    slots: [Option<Box<dyn MemoryAccess + Send>>; 7],
}

impl TargetTable {
    pub fn new() -> TargetTable {
        TargetTable::default()
    }

    pub fn install(&mut self, target: Target, accessor: Box<dyn MemoryAccess + Send>) {
        self.slots[target as usize] = Some(accessor);
    }

    pub fn read_at(&self, target: Target, offset: u32, len: u32) -> Result<Bytes, VmError> {
        self.slots[target as usize]
            .as_ref()
            .ok_or(VmError::MemoryTargetUndefined)?
            .read_at(offset, len)
    }

    pub fn write_at(&mut self, target: Target, offset: u32, data: &[u8]) -> Result<(), VmError> {
        self.slots[target as usize]
            .as_mut()
            .ok_or(VmError::MemoryTargetUndefined)?
            .write_at(offset, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FlatMemory {
        bytes: Vec<u8>,
        writable: bool,
    }

    impl MemoryAccess for FlatMemory {
        fn read_at(&self, offset: u32, len: u32) -> Result<Bytes, VmError> {
            let start = offset as usize;
            let end = start + len as usize;
            if end > self.bytes.len() {
                return Err(VmError::MemoryTargetAddressOutOfRange);
            }
            Ok(Bytes::copy_from_slice(&self.bytes[start..end]))
        }

        fn write_at(&mut self, offset: u32, data: &[u8]) -> Result<(), VmError> {
            if !self.writable {
                return Err(VmError::MemoryTargetNotWritable);
            }
            let start = offset as usize;
            let end = start + data.len();
            if end > self.bytes.len() {
                return Err(VmError::MemoryTargetAddressOutOfRange);
            }
            self.bytes[start..end].copy_from_slice(data);
            Ok(())
        }
    }

    #[test]
    fn undefined_target_reports_undefined() {
        let table = TargetTable::new();
        assert_eq!(
            table.read_at(Target::Wram, 0, 1).unwrap_err(),
            VmError::MemoryTargetUndefined
        );
    }

    #[test]
    fn read_only_target_rejects_write_by_default() {
        struct RomOnly(Vec<u8>);
        impl MemoryAccess for RomOnly {
            fn read_at(&self, offset: u32, len: u32) -> Result<Bytes, VmError> {
                Ok(Bytes::copy_from_slice(
                    &self.0[offset as usize..offset as usize + len as usize],
                ))
            }
        }

        let mut table = TargetTable::new();
        table.install(Target::Rom, Box::new(RomOnly(vec![0u8; 16])));
        assert_eq!(
            table.write_at(Target::Rom, 0, &[1]).unwrap_err(),
            VmError::MemoryTargetNotWritable
        );
    }

    #[test]
    fn writable_target_roundtrips() {
        let mut table = TargetTable::new();
        table.install(
            Target::Wram,
            Box::new(FlatMemory {
                bytes: vec![0u8; 32],
                writable: true,
            }),
        );
        table.write_at(Target::Wram, 4, &[9, 8, 7]).unwrap();
        let read = table.read_at(Target::Wram, 4, 3).unwrap();
        assert_eq!(&read[..], &[9, 8, 7]);
    }

    #[test]
    fn out_of_range_offset_is_reported() {
        let mut table = TargetTable::new();
        table.install(
            Target::Sram,
            Box::new(FlatMemory {
                bytes: vec![0u8; 8],
                writable: true,
            }),
        );
        assert_eq!(
            table.read_at(Target::Sram, 4, 100).unwrap_err(),
            VmError::MemoryTargetAddressOutOfRange
        );
    }

    #[test]
    fn target_nibble_mask_strips_flags() {
        let raw = target_flags::REVERSE | target_flags::UPDATE_ADDR | (Target::Vram as u8);
        let nibble = raw & target_flags::TARGET_MASK;
        assert_eq!(Target::try_from(nibble).unwrap(), Target::Vram);
    }
}
