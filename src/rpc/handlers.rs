//! Per-message frame handlers: one-shot completion parsers for channel 0,
//! streaming notification parsers for channel 1.

use crate::iovm1::{Notification, VmState};
use crate::rpc::error::DispatchError;
use crate::rpc::wire::{Completion, CommandType, RexResult};
use crate::target::VmResultCode;
use bytes::{Buf, BytesMut};

/// What a [`FrameHandler`] produced after consuming one frame's payload.
pub enum HandlerOutcome {
    /// More frames are needed before this message resolves.
    Continue,
    /// A channel-0 command completion (one-shot handlers only).
    Completion(Completion),
    /// A channel-1 notification event.
    Notification(Notification),
    /// The message's type byte isn't one this crate knows how to parse;
    /// the accumulated payload is passed through unparsed.
    Opaque(bytes::Bytes),
}

/// A stateful parser bound to one channel for the lifetime of one
/// logical message.
pub trait FrameHandler: Send {
    fn handle(&mut self, data: &[u8], is_final: bool) -> Result<HandlerOutcome, DispatchError>;
}

fn read_u32_le(buf: &[u8]) -> u32 {
    u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]])
}

fn read_u24_le(buf: &[u8]) -> u32 {
    u32::from_le_bytes([buf[0], buf[1], buf[2], 0])
}

fn read_u16_le(buf: &[u8]) -> u16 {
    u16::from_le_bytes([buf[0], buf[1]])
}

/// Decodes `[RexResult, VmErr]`, the completion body shared by
/// Upload/Start/Stop/Reset/SetFlags.
struct SimpleCompletionHandler {
    command_type: CommandType,
    buf: BytesMut,
}

impl SimpleCompletionHandler {
    fn new(command_type: CommandType) -> SimpleCompletionHandler {
        SimpleCompletionHandler {
            command_type,
            buf: BytesMut::new(),
        }
    }
}

impl FrameHandler for SimpleCompletionHandler {
    fn handle(&mut self, data: &[u8], is_final: bool) -> Result<HandlerOutcome, DispatchError> {
        self.buf.extend_from_slice(data);
        if !is_final {
            return Ok(HandlerOutcome::Continue);
        }
        if self.buf.len() != 2 {
            return Err(DispatchError::MalformedPayload);
        }
        let rex_result =
            RexResult::try_from(self.buf[0]).map_err(|_| DispatchError::MalformedPayload)?;
        let vm_err =
            VmResultCode::try_from(self.buf[1]).map_err(|_| DispatchError::MalformedPayload)?;
        Ok(HandlerOutcome::Completion(Completion {
            command_type: self.command_type,
            rex_result,
            vm_err,
            state: None,
        }))
    }
}

/// `GetState`'s completion additionally carries the VM's current state,
/// appending `[State:4]` to the usual `[RexResult, VmErr]` body.
struct GetStateCompletionHandler {
    buf: BytesMut,
}

impl GetStateCompletionHandler {
    fn new() -> GetStateCompletionHandler {
        GetStateCompletionHandler { buf: BytesMut::new() }
    }
}

impl FrameHandler for GetStateCompletionHandler {
    fn handle(&mut self, data: &[u8], is_final: bool) -> Result<HandlerOutcome, DispatchError> {
        self.buf.extend_from_slice(data);
        if !is_final {
            return Ok(HandlerOutcome::Continue);
        }
        if self.buf.len() != 6 {
            return Err(DispatchError::MalformedPayload);
        }
        let rex_result =
            RexResult::try_from(self.buf[0]).map_err(|_| DispatchError::MalformedPayload)?;
        let vm_err =
            VmResultCode::try_from(self.buf[1]).map_err(|_| DispatchError::MalformedPayload)?;
        let state_raw = read_u32_le(&self.buf[2..6]);
        let state = VmState::try_from(state_raw).map_err(|_| DispatchError::MalformedPayload)?;
        Ok(HandlerOutcome::Completion(Completion {
            command_type: CommandType::GetState,
            rex_result,
            vm_err,
            state: Some(state),
        }))
    }
}

/// Constructs the one-shot completion handler for a given command type.
pub fn completion_handler(command_type: CommandType) -> Box<dyn FrameHandler> {
    match command_type {
        CommandType::GetState => Box::new(GetStateCompletionHandler::new()),
        other => Box::new(SimpleCompletionHandler::new(other)),
    }
}

/// `NotifyEnd`/`NotifyWait`: `[PC:4, Opcode:1, Result:1, State:4]`,
/// always a single 10-byte message.
struct EventNotificationHandler {
    buf: BytesMut,
    build: fn(u32, u8, VmResultCode, VmState) -> Notification,
}

impl FrameHandler for EventNotificationHandler {
    fn handle(&mut self, data: &[u8], is_final: bool) -> Result<HandlerOutcome, DispatchError> {
        self.buf.extend_from_slice(data);
        if !is_final {
            return Ok(HandlerOutcome::Continue);
        }
        if self.buf.len() != 10 {
            return Err(DispatchError::MalformedPayload);
        }
        let pc = read_u32_le(&self.buf[0..4]);
        let opcode = self.buf[4];
        let result =
            VmResultCode::try_from(self.buf[5]).map_err(|_| DispatchError::MalformedPayload)?;
        let state_raw = read_u32_le(&self.buf[6..10]);
        let state = VmState::try_from(state_raw).map_err(|_| DispatchError::MalformedPayload)?;
        Ok(HandlerOutcome::Notification((self.build)(pc, opcode, result, state)))
    }
}

pub fn notify_end_handler() -> Box<dyn FrameHandler> {
    Box::new(EventNotificationHandler {
        buf: BytesMut::new(),
        build: |pc, opcode, result, state| Notification::PrgEnd { pc, opcode, result, state },
    })
}

pub fn notify_wait_handler() -> Box<dyn FrameHandler> {
    Box::new(EventNotificationHandler {
        buf: BytesMut::new(),
        build: |pc, opcode, result, state| Notification::WaitComplete { pc, opcode, result, state },
    })
}

/// `NotifyWrite`: `[PC:4, TDU:1, Addr:3, Len:2]`, one logical message
/// bracketing a single `WRITE`. The header arrives on a non-final frame
/// (`WriteStart`) and the same message's final frame (possibly carrying
/// the identical header again, possibly empty) yields `WriteEnd` for the
/// same write — start and end are discriminated purely by the frame's
/// final bit, and `WriteEnd` always reports the header `WriteStart`
/// already parsed rather than re-parsing a closing frame that may carry
/// nothing.
struct NotifyWriteHandler {
    buf: BytesMut,
    header: Option<(u32, u8, u32, u32)>,
}

impl NotifyWriteHandler {
    fn new() -> NotifyWriteHandler {
        NotifyWriteHandler {
            buf: BytesMut::new(),
            header: None,
        }
    }

    fn parse(&self) -> Result<(u32, u8, u32, u32), DispatchError> {
        if self.buf.len() < 10 {
            return Err(DispatchError::MalformedPayload);
        }
        let pc = read_u32_le(&self.buf[0..4]);
        let tdu = self.buf[4];
        let addr = read_u24_le(&self.buf[5..8]);
        let len_raw = read_u16_le(&self.buf[8..10]);
        let len = if len_raw == 0 { 65536 } else { len_raw as u32 };
        Ok((pc, tdu, addr, len))
    }
}

impl FrameHandler for NotifyWriteHandler {
    fn handle(&mut self, data: &[u8], is_final: bool) -> Result<HandlerOutcome, DispatchError> {
        match self.header {
            None => {
                self.buf.extend_from_slice(data);
                if self.buf.len() < 10 {
                    if is_final {
                        return Err(DispatchError::MalformedPayload);
                    }
                    return Ok(HandlerOutcome::Continue);
                }
                let header = self.parse()?;
                self.header = Some(header);
                self.buf.clear();
                let (pc, tdu, addr, len) = header;
                Ok(HandlerOutcome::Notification(Notification::WriteStart { pc, tdu, addr, len }))
            }
            Some((pc, tdu, addr, len)) => {
                Ok(HandlerOutcome::Notification(Notification::WriteEnd { pc, tdu, addr, len }))
            }
        }
    }
}

pub fn notify_write_handler() -> Box<dyn FrameHandler> {
    Box::new(NotifyWriteHandler::new())
}

/// Accumulates a message on an unregistered type byte and hands it back
/// whole, unparsed, on the final frame. PPUX and other subsystems' type
/// codes are disjoint from IOVM1's and are never interpreted here.
struct OpaqueFrameHandler {
    buf: BytesMut,
}

impl FrameHandler for OpaqueFrameHandler {
    fn handle(&mut self, data: &[u8], is_final: bool) -> Result<HandlerOutcome, DispatchError> {
        self.buf.extend_from_slice(data);
        if is_final {
            Ok(HandlerOutcome::Opaque(self.buf.split().freeze()))
        } else {
            Ok(HandlerOutcome::Continue)
        }
    }
}

pub fn opaque_handler() -> Box<dyn FrameHandler> {
    Box::new(OpaqueFrameHandler { buf: BytesMut::new() })
}

/// `NotifyRead`: header (10 bytes) then zero or more data chunks, final
/// frame ends the read.
#[derive(Clone, Copy)]
enum NotifyReadState {
    Header,
    Streaming { pc: u32, tdu: u8, addr: u32, len: u32, chunk_offset: u32 },
}

pub struct NotifyReadHandler {
    buf: BytesMut,
    state: NotifyReadState,
}

impl NotifyReadHandler {
    fn new() -> NotifyReadHandler {
        NotifyReadHandler {
            buf: BytesMut::new(),
            state: NotifyReadState::Header,
        }
    }
}

pub fn notify_read_handler() -> Box<dyn FrameHandler> {
    Box::new(NotifyReadHandler::new())
}

impl FrameHandler for NotifyReadHandler {
    fn handle(&mut self, data: &[u8], is_final: bool) -> Result<HandlerOutcome, DispatchError> {
        if let NotifyReadState::Header = self.state {
            self.buf.extend_from_slice(data);
            if self.buf.len() < 10 {
                if is_final {
                    return Err(DispatchError::MalformedPayload);
                }
                return Ok(HandlerOutcome::Continue);
            }
            let mut header = self.buf.split_to(10);
            let pc = header.get_u32_le();
            let tdu = header.get_u8();
            let addr = read_u24_le(&header.split_to(3));
            let len_raw = header.get_u16_le();
            let len = if len_raw == 0 { 65536 } else { len_raw as u32 };
            self.state = NotifyReadState::Streaming {
                pc,
                tdu,
                addr,
                len,
                chunk_offset: 0,
            };

            let remainder = self.buf.split_off(0);
            if !remainder.is_empty() || is_final {
                return self.emit_chunk(&remainder, is_final);
            }
            return Ok(HandlerOutcome::Continue);
        }

        let data = data.to_vec();
        self.emit_chunk(&data, is_final)
    }
}

impl NotifyReadHandler {
    fn emit_chunk(&mut self, data: &[u8], is_final: bool) -> Result<HandlerOutcome, DispatchError> {
        let NotifyReadState::Streaming { pc, tdu, addr, len, chunk_offset } = self.state else {
            return Err(DispatchError::MalformedPayload);
        };
        let chunk = bytes::Bytes::copy_from_slice(data);
        let this_offset = chunk_offset;
        let next_offset = chunk_offset + chunk.len() as u32;

        if is_final {
            self.state = NotifyReadState::Header;
            self.buf.clear();
        } else {
            self.state = NotifyReadState::Streaming {
                pc,
                tdu,
                addr,
                len,
                chunk_offset: next_offset,
            };
        }

        Ok(HandlerOutcome::Notification(Notification::ReadChunk {
            pc,
            tdu,
            addr,
            len,
            chunk_offset: this_offset,
            data: chunk,
            is_final,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_completion_rejects_wrong_length() {
        let mut h = SimpleCompletionHandler::new(CommandType::Start);
        assert!(matches!(
            h.handle(&[0], true),
            Err(DispatchError::MalformedPayload)
        ));
    }

    #[test]
    fn simple_completion_parses_success() {
        let mut h = SimpleCompletionHandler::new(CommandType::Start);
        let outcome = h.handle(&[0, 0], true).unwrap();
        match outcome {
            HandlerOutcome::Completion(c) => {
                assert_eq!(c.rex_result, RexResult::Success);
                assert_eq!(c.vm_err, VmResultCode::Success);
                assert_eq!(c.state, None);
            }
            _ => panic!("expected completion"),
        }
    }

    #[test]
    fn get_state_completion_parses_state() {
        let mut h = GetStateCompletionHandler::new();
        let mut body = vec![0u8, 0u8];
        body.extend_from_slice(&(VmState::ExecuteNext as u32).to_le_bytes());
        let outcome = h.handle(&body, true).unwrap();
        match outcome {
            HandlerOutcome::Completion(c) => assert_eq!(c.state, Some(VmState::ExecuteNext)),
            _ => panic!("expected completion"),
        }
    }

    #[test]
    fn notify_read_streams_header_then_chunks() {
        let mut h = NotifyReadHandler::new();
        let mut header = vec![];
        header.extend_from_slice(&42u32.to_le_bytes());
        header.push(0); // tdu
        header.extend_from_slice(&[0x10, 0x00, 0x00]); // addr 0x10
        header.extend_from_slice(&4u16.to_le_bytes()); // len 4

        let mut payload = header.clone();
        payload.extend_from_slice(&[1, 2]);
        let outcome = h.handle(&payload, false).unwrap();
        match outcome {
            HandlerOutcome::Notification(Notification::ReadChunk { chunk_offset, data, is_final, .. }) => {
                assert_eq!(chunk_offset, 0);
                assert_eq!(&data[..], &[1, 2]);
                assert!(!is_final);
            }
            _ => panic!("expected read chunk"),
        }

        let outcome = h.handle(&[3, 4], true).unwrap();
        match outcome {
            HandlerOutcome::Notification(Notification::ReadChunk { chunk_offset, data, is_final, .. }) => {
                assert_eq!(chunk_offset, 2);
                assert_eq!(&data[..], &[3, 4]);
                assert!(is_final);
            }
            _ => panic!("expected final read chunk"),
        }
    }

    #[test]
    fn notify_write_brackets_start_and_end() {
        let mut h = NotifyWriteHandler::new();
        let mut header = vec![];
        header.extend_from_slice(&7u32.to_le_bytes());
        header.push(3); // tdu
        header.extend_from_slice(&[0x00, 0x2C, 0x00]); // addr
        header.extend_from_slice(&6u16.to_le_bytes()); // len

        let start = h.handle(&header, false).unwrap();
        match start {
            HandlerOutcome::Notification(Notification::WriteStart { pc, tdu, addr, len }) => {
                assert_eq!(pc, 7);
                assert_eq!(tdu, 3);
                assert_eq!(addr, 0x002C00);
                assert_eq!(len, 6);
            }
            _ => panic!("expected write start"),
        }

        // Closing frame carries no payload; WriteEnd must still report the
        // header WriteStart parsed, not zeros.
        let end = h.handle(&[], true).unwrap();
        match end {
            HandlerOutcome::Notification(Notification::WriteEnd { pc, tdu, addr, len }) => {
                assert_eq!(pc, 7);
                assert_eq!(tdu, 3);
                assert_eq!(addr, 0x002C00);
                assert_eq!(len, 6);
            }
            _ => panic!("expected write end"),
        }
    }
}
