//! A single connection used to publish messages to one broker node

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use super::dial_and_handshake;
use super::wire::{ClientFrame, ServerFrame};
use crate::error::{ProtocolError, PublishCause, PublishError, TransportError};
use crate::frame::FrameWriter;
use crate::host_port::HostAndPort;
use crate::types::Topic;

type Reply = oneshot::Sender<Result<(), PublishCause>>;

#[derive(Debug)]
struct Shared {
    writer: FrameWriter<OwnedWriteHalf>,
    pending: VecDeque<Reply>,
}

/// One TCP connection used to publish messages to a single broker node
///
/// All writes are serialized through an internal lock; the single reply
/// stream is matched FIFO against outstanding `publish` calls.
#[derive(Debug)]
pub struct PubConnection {
    addr: HostAndPort,
    shared: Arc<Mutex<Shared>>,
    closed: Arc<AtomicBool>,
    reader_task: JoinHandle<()>,
}

impl PubConnection {
    /// Dial `addr` and perform the handshake
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] on I/O failure during connect or
    /// handshake.
    pub async fn open(addr: HostAndPort) -> Result<Self, TransportError> {
        let (mut reader, writer) = dial_and_handshake(&addr).await?;

        let shared = Arc::new(Mutex::new(Shared {
            writer,
            pending: VecDeque::new(),
        }));
        let closed = Arc::new(AtomicBool::new(false));

        let reader_shared = Arc::clone(&shared);
        let reader_closed = Arc::clone(&closed);
        let reader_addr = addr.clone();
        let reader_task = tokio::spawn(async move {
            loop {
                let frame = match reader.read_frame().await {
                    Ok(frame) => frame,
                    Err(err) => {
                        fail_all(&reader_shared, &reader_addr, err).await;
                        reader_closed.store(true, Ordering::Release);
                        break;
                    }
                };

                let result = match ServerFrame::decode(frame.freeze()) {
                    Some(ServerFrame::Ok) => Ok(()),
                    Some(ServerFrame::Error(msg)) => Err(PublishCause::Rejected(PublishError(msg))),
                    Some(ServerFrame::Heartbeat) => continue,
                    Some(ServerFrame::Message { .. }) | None => Err(PublishCause::Protocol(
                        ProtocolError::UnexpectedReply {
                            command: "PUB/MPUB",
                            reply: "unexpected frame".to_owned(),
                        },
                    )),
                };

                let mut shared = reader_shared.lock().await;
                if let Some(reply) = shared.pending.pop_front() {
                    let _ = reply.send(result);
                }
            }
        });

        Ok(Self {
            addr,
            shared,
            closed,
            reader_task,
        })
    }

    /// The node this connection talks to
    #[must_use]
    pub fn addr(&self) -> &HostAndPort {
        &self.addr
    }

    /// `true` once this connection has hit a terminal transport failure
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Publish a single message (`PUB`)
    ///
    /// # Errors
    ///
    /// Returns [`PublishCause`] if the broker rejects the command or the
    /// connection fails.
    pub async fn publish(&self, topic: &Topic, payload: Bytes) -> Result<(), PublishCause> {
        self.send(ClientFrame::Pub {
            topic: topic.to_string(),
            payload,
        })
        .await
    }

    /// Publish a batch of messages as a single `MPUB`
    ///
    /// # Errors
    ///
    /// Returns [`PublishCause`] if the broker rejects the command or the
    /// connection fails.
    pub async fn publish_batch(
        &self,
        topic: &Topic,
        payloads: Vec<Bytes>,
    ) -> Result<(), PublishCause> {
        self.send(ClientFrame::Mpub {
            topic: topic.to_string(),
            payloads,
        })
        .await
    }

    async fn send(&self, frame: ClientFrame) -> Result<(), PublishCause> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PublishCause::Transport(TransportError::Closed(
                self.addr.to_string(),
            )));
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut shared = self.shared.lock().await;
            let encoded = frame.encode();
            if let Err(err) = shared.writer.write_frame(&encoded).await {
                self.closed.store(true, Ordering::Release);
                return Err(PublishCause::Transport(TransportError::Io(
                    self.addr.to_string(),
                    err,
                )));
            }
            shared.pending.push_back(tx);
        }

        rx.await.unwrap_or_else(|_| {
            Err(PublishCause::Transport(TransportError::Closed(
                self.addr.to_string(),
            )))
        })
    }

    /// Idempotently close the connection
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.reader_task.abort();
        let mut shared = self.shared.lock().await;
        shared.writer.shutdown().await;
    }
}

impl Drop for PubConnection {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

async fn fail_all(shared: &Arc<Mutex<Shared>>, addr: &HostAndPort, err: std::io::Error) {
    let mut shared = shared.lock().await;
    while let Some(reply) = shared.pending.pop_front() {
        let _ = reply.send(Err(PublishCause::Transport(TransportError::Io(
            addr.to_string(),
            std::io::Error::new(err.kind(), err.to_string()),
        ))));
    }
}

