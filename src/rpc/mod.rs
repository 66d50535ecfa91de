//! The RPC dispatcher: frame-to-handler routing, command encoding,
//! completion correlation, and notification delivery.
//!
//! A per-channel type-byte demux binds inbound frames to a handler for
//! the lifetime of one logical message, an outbound writer mutex
//! serializes command frames, and a per-command-type FIFO of one-shot
//! rendezvous slots performs request/response pairing.

pub mod error;
pub mod handlers;
pub mod wire;

pub use error::DispatchError;
pub use handlers::{FrameHandler, HandlerOutcome};
pub use wire::{Command, CommandType, Completion, NotificationType, RexResult};

use crate::frame::{Channel, FramedReader, FramedWriter};
use crate::iovm1::Notification;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, Mutex};

type CompletionResult = Result<Completion, DispatchError>;

/// A pending rendezvous for the next completion of a given command type.
/// Carries a sequence number purely for diagnostics: if the caller
/// cancels its await, the `oneshot::Sender` stays queued in FIFO order
/// rather than being pruned, so a later completion for the same command
/// type is never mis-paired with a different, still-live waiter.
struct Waiter {
    seq: u64,
    tx: oneshot::Sender<CompletionResult>,
}

#[derive(Default)]
struct CompletionFifos {
    queues: HashMap<CommandType, VecDeque<Waiter>>,
}

impl CompletionFifos {
    fn push(&mut self, ty: CommandType, waiter: Waiter) {
        self.queues.entry(ty).or_default().push_back(waiter);
    }

    fn pop(&mut self, ty: CommandType) -> Option<Waiter> {
        self.queues.get_mut(&ty)?.pop_front()
    }

    fn drain_all(&mut self) -> Vec<Waiter> {
        self.queues.drain().flat_map(|(_, q)| q).collect()
    }
}

/// Per-channel demux state: either awaiting the type byte that opens the
/// next message, or bound to the handler parsing the message currently in
/// flight.
enum ChannelState {
    AwaitingType(Vec<u8>),
    Bound(Box<dyn FrameHandler>),
}

impl ChannelState {
    fn idle() -> ChannelState {
        ChannelState::AwaitingType(Vec::new())
    }
}

/// Controller-side RPC client sitting above the frame codec. Owns the
/// outbound writer mutex and the per-command-type completion FIFOs;
/// [`Dispatcher::run`] drives the receive loop that feeds both.
pub struct Dispatcher<W> {
    writer: Mutex<FramedWriter<W>>,
    fifos: Mutex<CompletionFifos>,
    next_seq: AtomicU64,
    notify_tx: mpsc::Sender<Notification>,
}

impl<W> Dispatcher<W>
where
    W: AsyncWrite + Unpin,
{
    /// Builds a dispatcher writing commands to `sink` on the response
    /// channel, and returns the receiver end of its notification stream
    /// (`notify_capacity` bounds how many undelivered notifications may
    /// queue before the receive loop backs up).
    pub fn new(sink: W, notify_capacity: usize) -> (Dispatcher<W>, mpsc::Receiver<Notification>) {
        let (notify_tx, notify_rx) = mpsc::channel(notify_capacity);
        let dispatcher = Dispatcher {
            writer: Mutex::new(FramedWriter::new(sink, Channel::Response)),
            fifos: Mutex::new(CompletionFifos::default()),
            next_seq: AtomicU64::new(0),
            notify_tx,
        };
        (dispatcher, notify_rx)
    }

    /// Submits a command and awaits its completion.
    ///
    /// The writer mutex is held across enqueuing the waiter *and* writing
    /// the command frame(s), so the FIFO push order for a command type
    /// always matches the wire write order for that type — the precondition
    /// the completion-ordering invariant depends on. The mutex is released
    /// before awaiting the completion, so independent commands (of the
    /// same or different types) do not block each other past the actual
    /// write.
    #[tracing::instrument(skip(self, op))]
    pub async fn command(&self, op: Command) -> CompletionResult {
        let ty = op.command_type();
        let (tx, rx) = oneshot::channel();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);

        {
            let mut writer = self.writer.lock().await;
            self.fifos.lock().await.push(ty, Waiter { seq, tx });
            writer.write(&op.encode()).await?;
            writer.finalize().await?;
        }

        rx.await.map_err(|_| DispatchError::ConnectionClosed)?
    }

    async fn resolve_completion(&self, completion: Completion) {
        let waiter = self.fifos.lock().await.pop(completion.command_type);
        match waiter {
            Some(waiter) => {
                if waiter.tx.send(Ok(completion)).is_err() {
                    tracing::warn!(
                        seq = waiter.seq,
                        command_type = ?completion.command_type,
                        "completion arrived for a cancelled waiter; discarding"
                    );
                }
            }
            None => {
                tracing::warn!(
                    command_type = ?completion.command_type,
                    "completion arrived with no pending command of this type"
                );
            }
        }
    }

    /// Resolves every still-pending completion waiter with
    /// `ConnectionClosed`. VMs are not informed and keep running; their
    /// notifications are simply no longer observed once the receive loop
    /// has exited.
    async fn fail_pending(&self) {
        for waiter in self.fifos.lock().await.drain_all() {
            let _ = waiter.tx.send(Err(DispatchError::ConnectionClosed));
        }
    }

    /// Drives the receive loop: reads framed messages from `source`,
    /// demultiplexes by channel and type byte, and feeds each frame's
    /// payload to the bound handler until the message's final frame
    /// releases it. Returns once `source` reaches a clean EOF; a malformed
    /// frame or handler closes the connection by propagating the error.
    pub async fn run<R>(&self, source: R) -> Result<(), DispatchError>
    where
        R: AsyncRead + Unpin,
    {
        let mut reader = FramedReader::new(source);
        let mut channels = [ChannelState::idle(), ChannelState::idle()];

        let result = self.receive_loop(&mut reader, &mut channels).await;
        self.fail_pending().await;
        result
    }

    async fn receive_loop<R>(
        &self,
        reader: &mut FramedReader<R>,
        channels: &mut [ChannelState; 2],
    ) -> Result<(), DispatchError>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let frame = match reader.read_frame().await? {
                Some(frame) => frame,
                None => return Ok(()),
            };
            let idx = match frame.channel() {
                Channel::Response => 0,
                Channel::Notification => 1,
            };
            let is_final = frame.is_final();

            let outcome = self.feed(&mut channels[idx], frame.channel(), &frame.payload, is_final)?;
            if is_final {
                channels[idx] = ChannelState::idle();
            }

            match outcome {
                HandlerOutcome::Continue => {}
                HandlerOutcome::Completion(c) => self.resolve_completion(c).await,
                HandlerOutcome::Notification(n) => {
                    let _ = self.notify_tx.send(n).await;
                }
                HandlerOutcome::Opaque(data) => {
                    let _ = self
                        .notify_tx
                        .send(Notification::Opaque { channel: frame.channel(), data })
                        .await;
                }
            }
        }
    }

    /// Advances one channel's demux state by one frame's payload,
    /// consuming the leading type byte the first time bytes arrive on an
    /// idle channel.
    fn feed(
        &self,
        state: &mut ChannelState,
        channel: Channel,
        payload: &[u8],
        is_final: bool,
    ) -> Result<HandlerOutcome, DispatchError> {
        match state {
            ChannelState::AwaitingType(pending) => {
                pending.extend_from_slice(payload);
                if pending.is_empty() {
                    return Ok(HandlerOutcome::Continue);
                }
                let type_byte = pending[0];
                let rest = pending.split_off(1);
                let mut handler = handler_for(channel, type_byte);
                let outcome = handler.handle(&rest, is_final)?;
                *state = ChannelState::Bound(handler);
                Ok(outcome)
            }
            ChannelState::Bound(handler) => handler.handle(payload, is_final),
        }
    }
}

/// Picks the handler factory for a message's type byte: known IOVM1
/// command/notification types get their typed parser; anything else
/// (PPUX and future subsystems) falls through to the opaque pass-through
/// handler.
fn handler_for(channel: Channel, type_byte: u8) -> Box<dyn FrameHandler> {
    match channel {
        Channel::Response => match CommandType::try_from(type_byte) {
            Ok(ct) => handlers::completion_handler(ct),
            Err(_) => handlers::opaque_handler(),
        },
        Channel::Notification => match NotificationType::try_from(type_byte) {
            Ok(NotificationType::NotifyEnd) => handlers::notify_end_handler(),
            Ok(NotificationType::NotifyWait) => handlers::notify_wait_handler(),
            Ok(NotificationType::NotifyWrite) => handlers::notify_write_handler(),
            Ok(NotificationType::NotifyRead) => handlers::notify_read_handler(),
            Err(_) => handlers::opaque_handler(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameEncoder;
    use crate::target::VmResultCode;
    use bytes::Bytes;

    fn encode_message(channel: Channel, bytes_in: &[u8]) -> Vec<u8> {
        let mut enc = FrameEncoder::new(channel);
        let mut frames = enc.write(bytes_in);
        frames.push(enc.finalize());
        let mut out = Vec::new();
        for f in frames {
            out.extend_from_slice(&f.to_bytes());
        }
        out
    }

    #[tokio::test]
    async fn command_resolves_its_own_completion() {
        let (client_to_agent, mut agent_reads) = tokio::io::duplex(4096);
        let (agent_writes, agent_to_client) = tokio::io::duplex(4096);

        let (dispatcher, _notify_rx) = Dispatcher::new(client_to_agent, 8);
        let dispatcher = Arc::new(dispatcher);

        let run_dispatcher = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.run(agent_to_client).await })
        };

        // fake agent: read the Start command byte, then write back its completion.
        let fake_agent = tokio::spawn(async move {
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            let mut byte = [0u8; 1];
            agent_reads.read_exact(&mut byte).await.unwrap();
            assert_eq!(byte[0], CommandType::Start as u8);
            let mut agent_writes = agent_writes;
            let msg = encode_message(
                Channel::Response,
                &[CommandType::Start as u8, RexResult::Success as u8, VmResultCode::Success as u8],
            );
            agent_writes.write_all(&msg).await.unwrap();
        });

        let completion = dispatcher.command(Command::Start).await.unwrap();
        assert_eq!(completion.command_type, CommandType::Start);
        assert_eq!(completion.rex_result, RexResult::Success);
        assert_eq!(completion.vm_err, VmResultCode::Success);

        fake_agent.await.unwrap();
        run_dispatcher.abort();
    }

    #[tokio::test]
    async fn completions_of_same_type_resolve_in_submission_order() {
        let (client_to_agent, mut agent_reads) = tokio::io::duplex(4096);
        let (agent_writes, agent_to_client) = tokio::io::duplex(4096);

        let (dispatcher, _notify_rx) = Dispatcher::new(client_to_agent, 8);
        let dispatcher = Arc::new(dispatcher);

        let run_dispatcher = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.run(agent_to_client).await })
        };

        let fake_agent = tokio::spawn(async move {
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            let mut agent_writes = agent_writes;
            // two Stop commands arrive; reply to both, in order.
            for i in 0u8..2 {
                let mut byte = [0u8; 1];
                agent_reads.read_exact(&mut byte).await.unwrap();
                assert_eq!(byte[0], CommandType::Stop as u8);
                let msg = encode_message(Channel::Response, &[CommandType::Stop as u8, 0, i]);
                agent_writes.write_all(&msg).await.unwrap();
            }
        });

        let d1 = dispatcher.clone();
        let d2 = dispatcher.clone();
        let (c1, c2) = tokio::join!(
            async move { d1.command(Command::Stop).await.unwrap() },
            async move { d2.command(Command::Stop).await.unwrap() },
        );

        // whichever call's write landed first gets VmErr==0 back; the
        // important invariant is each sees a distinct, well-formed reply.
        let mut errs: Vec<u8> = vec![c1.vm_err as u8, c2.vm_err as u8];
        errs.sort();
        assert_eq!(errs, vec![0, 1]);

        fake_agent.await.unwrap();
        run_dispatcher.abort();
    }

    #[tokio::test]
    async fn connection_loss_fails_pending_waiters() {
        let (client_to_agent, agent_reads) = tokio::io::duplex(4096);
        let (agent_writes, agent_to_client) = tokio::io::duplex(4096);
        drop(agent_reads);
        drop(agent_writes);

        let (dispatcher, _notify_rx) = Dispatcher::new(client_to_agent, 8);
        let dispatcher = Arc::new(dispatcher);

        let run_dispatcher = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.run(agent_to_client).await })
        };

        let err = dispatcher.command(Command::GetState).await.unwrap_err();
        assert!(matches!(err, DispatchError::ConnectionClosed));

        run_dispatcher.await.unwrap().unwrap();
    }

    #[test]
    fn handler_for_unknown_type_is_opaque() {
        let mut h = handler_for(Channel::Response, 200);
        let outcome = h.handle(&[1, 2, 3], true).unwrap();
        match outcome {
            HandlerOutcome::Opaque(data) => assert_eq!(data, Bytes::from_static(&[1, 2, 3])),
            _ => panic!("expected opaque outcome"),
        }
    }
}
