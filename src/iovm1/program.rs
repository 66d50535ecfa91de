//! Program loader: a thin, bounds-checked cursor over an owned byte-code
//! image.
//!
//! There is no whole-program preflight pass. Validation happens lazily,
//! instruction by instruction, exactly as execution reaches each one —
//! a truncated operand stream surfaces as [`VmError::OutOfRange`] only
//! when the interpreter actually tries to fetch the missing bytes.

use crate::target::VmError;
use bytes::Bytes;

#[derive(Debug, Clone)]
pub struct Program {
    bytes: Bytes,
}

impl Program {
    pub fn new(bytes: Bytes) -> Program {
        Program { bytes }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn fetch_u8(&self, pc: usize) -> Result<u8, VmError> {
        self.bytes.get(pc).copied().ok_or(VmError::OutOfRange)
    }

    /// Little-endian 16-bit fetch starting at `pc`.
    pub fn fetch_u16(&self, pc: usize) -> Result<u16, VmError> {
        let lo = self.fetch_u8(pc)?;
        let hi = self.fetch_u8(pc + 1)?;
        Ok(u16::from_le_bytes([lo, hi]))
    }

    /// Little-endian 24-bit fetch starting at `pc`, widened into a `u32`.
    pub fn fetch_u24(&self, pc: usize) -> Result<u32, VmError> {
        let b0 = self.fetch_u8(pc)?;
        let b1 = self.fetch_u8(pc + 1)?;
        let b2 = self.fetch_u8(pc + 2)?;
        Ok(u32::from_le_bytes([b0, b1, b2, 0]))
    }

    /// A zero-copy view of `len` bytes starting at `pc`, used by `WRITE`
    /// to pull its inline payload straight out of the program stream.
    pub fn slice(&self, pc: usize, len: usize) -> Result<Bytes, VmError> {
        let end = pc.checked_add(len).ok_or(VmError::OutOfRange)?;
        if end > self.bytes.len() {
            return Err(VmError::OutOfRange);
        }
        Ok(self.bytes.slice(pc..end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_u8_in_range() {
        let p = Program::new(Bytes::from_static(&[1, 2, 3]));
        assert_eq!(p.fetch_u8(0).unwrap(), 1);
        assert_eq!(p.fetch_u8(2).unwrap(), 3);
    }

    #[test]
    fn fetch_u8_out_of_range() {
        let p = Program::new(Bytes::from_static(&[1]));
        assert_eq!(p.fetch_u8(1).unwrap_err(), VmError::OutOfRange);
    }

    #[test]
    fn fetch_u16_little_endian() {
        let p = Program::new(Bytes::from_static(&[0x34, 0x12]));
        assert_eq!(p.fetch_u16(0).unwrap(), 0x1234);
    }

    #[test]
    fn fetch_u24_little_endian() {
        let p = Program::new(Bytes::from_static(&[0x56, 0x34, 0x12]));
        assert_eq!(p.fetch_u24(0).unwrap(), 0x0012_3456);
    }

    #[test]
    fn truncated_operand_is_out_of_range() {
        let p = Program::new(Bytes::from_static(&[0x34]));
        assert_eq!(p.fetch_u16(0).unwrap_err(), VmError::OutOfRange);
    }

    #[test]
    fn slice_for_inline_write_payload() {
        let p = Program::new(Bytes::from_static(&[0, 1, 2, 3, 4, 5]));
        let s = p.slice(2, 3).unwrap();
        assert_eq!(&s[..], &[2, 3, 4]);
    }

    #[test]
    fn slice_past_end_is_out_of_range() {
        let p = Program::new(Bytes::from_static(&[0, 1, 2]));
        assert_eq!(p.slice(1, 10).unwrap_err(), VmError::OutOfRange);
    }
}
