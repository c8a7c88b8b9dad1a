//! A single connection used to receive messages from one broker node

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use super::dial_and_handshake;
use super::wire::{ClientFrame, ServerFrame};
use crate::error::{ProtocolError, TransportError};
use crate::frame::FrameWriter;
use crate::host_port::HostAndPort;
use crate::types::{Channel, Message, MessageId, Topic};

/// The reason a [`SubConnection`] reached its terminal state
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum CloseCause {
    /// A transport-level failure occurred
    Transport(String),
    /// The broker sent a malformed or unexpected frame
    Protocol(String),
    /// The connection was closed gracefully via [`SubConnection::close`]
    Graceful,
}

/// An event produced by a [`SubConnection`]'s background reader task
///
/// Consumed by the owning subscription's single control loop, which
/// serializes reader events against API calls instead of sharing a mutex
/// between them.
#[derive(Debug)]
pub(crate) enum ConnEvent {
    Message {
        from: HostAndPort,
        message: Message,
    },
    /// Invoked exactly once when the connection reaches a terminal state
    Closed {
        from: HostAndPort,
        cause: CloseCause,
    },
}

/// One TCP connection subscribed to a single `(topic, channel)` on one
/// broker node
#[derive(Debug)]
pub struct SubConnection {
    addr: HostAndPort,
    writer: Arc<Mutex<FrameWriter<OwnedWriteHalf>>>,
    closed: Arc<AtomicBool>,
    reader_task: JoinHandle<()>,
}

impl SubConnection {
    /// Dial `addr`, perform the handshake and issue `SUB` for `(topic, channel)`
    ///
    /// `SUB` must be the first stateful command issued after the handshake.
    /// Message and close events are delivered on `events`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] on I/O failure, or wraps a
    /// [`ProtocolError`] when the broker rejects the subscribe.
    pub(crate) async fn open(
        addr: HostAndPort,
        topic: &Topic,
        channel: &Channel,
        events: mpsc::Sender<ConnEvent>,
    ) -> Result<Self, TransportError> {
        let (mut reader, mut writer) = dial_and_handshake(&addr).await?;

        let sub_frame = ClientFrame::Sub {
            topic: topic.to_string(),
            channel: channel.to_string(),
        }
        .encode();
        writer
            .write_frame(&sub_frame)
            .await
            .map_err(|err| TransportError::Io(addr.to_string(), err))?;
        let ack = reader
            .read_frame()
            .await
            .map_err(|err| TransportError::Io(addr.to_string(), err))?;
        match ServerFrame::decode(ack.freeze()) {
            Some(ServerFrame::Ok) => {}
            Some(ServerFrame::Error(msg)) => {
                return Err(TransportError::Io(
                    addr.to_string(),
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        ProtocolError::UnexpectedReply {
                            command: "SUB",
                            reply: msg,
                        }
                        .to_string(),
                    ),
                ))
            }
            _ => {
                return Err(TransportError::Io(
                    addr.to_string(),
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        ProtocolError::Malformed("SUB reply".to_owned()).to_string(),
                    ),
                ))
            }
        }

        let writer = Arc::new(Mutex::new(writer));
        let closed = Arc::new(AtomicBool::new(false));

        let reader_addr = addr.clone();
        let reader_writer = Arc::clone(&writer);
        let reader_closed = Arc::clone(&closed);
        let reader_task = tokio::spawn(async move {
            loop {
                let frame = match reader.read_frame().await {
                    Ok(frame) => frame,
                    Err(err) => {
                        reader_closed.store(true, Ordering::Release);
                        let _ = events
                            .send(ConnEvent::Closed {
                                from: reader_addr.clone(),
                                cause: CloseCause::Transport(err.to_string()),
                            })
                            .await;
                        break;
                    }
                };

                match ServerFrame::decode(frame.freeze()) {
                    Some(ServerFrame::Message {
                        id,
                        timestamp_ms,
                        attempts,
                        body,
                    }) => {
                        let message = Message {
                            id,
                            timestamp: SystemTime::UNIX_EPOCH + Duration::from_millis(timestamp_ms),
                            attempts,
                            body,
                        };
                        if events
                            .send(ConnEvent::Message {
                                from: reader_addr.clone(),
                                message,
                            })
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Some(ServerFrame::Heartbeat) => {
                        let nop = ClientFrame::Nop.encode();
                        let mut writer = reader_writer.lock().await;
                        if writer.write_frame(&nop).await.is_err() {
                            reader_closed.store(true, Ordering::Release);
                            let _ = events
                                .send(ConnEvent::Closed {
                                    from: reader_addr.clone(),
                                    cause: CloseCause::Transport("heartbeat write failed".to_owned()),
                                })
                                .await;
                            break;
                        }
                    }
                    Some(ServerFrame::Ok) => {}
                    Some(ServerFrame::Error(msg)) => {
                        reader_closed.store(true, Ordering::Release);
                        let _ = events
                            .send(ConnEvent::Closed {
                                from: reader_addr.clone(),
                                cause: CloseCause::Protocol(msg),
                            })
                            .await;
                        break;
                    }
                    None => {
                        reader_closed.store(true, Ordering::Release);
                        let _ = events
                            .send(ConnEvent::Closed {
                                from: reader_addr.clone(),
                                cause: CloseCause::Protocol("malformed frame".to_owned()),
                            })
                            .await;
                        break;
                    }
                }
            }
        });

        Ok(Self {
            addr,
            writer,
            closed,
            reader_task,
        })
    }

    /// The node this connection talks to
    #[must_use]
    pub fn addr(&self) -> &HostAndPort {
        &self.addr
    }

    /// `true` once this connection has reached a terminal state
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Set the receive-ready count (in-flight credit) for this connection
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the connection is closed or the write fails.
    pub async fn rdy(&self, n: u32) -> std::io::Result<()> {
        self.write(ClientFrame::Rdy(n)).await
    }

    /// Acknowledge successful processing of a message
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the connection is closed or the write fails.
    pub async fn fin(&self, id: MessageId) -> std::io::Result<()> {
        self.write(ClientFrame::Fin(id)).await
    }

    /// Requeue a message for redelivery after `delay`
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the connection is closed or the write fails.
    pub async fn req(&self, id: MessageId, delay: Duration) -> std::io::Result<()> {
        let delay_ms = u32::try_from(delay.as_millis()).unwrap_or(u32::MAX);
        self.write(ClientFrame::Req { id, delay_ms }).await
    }

    /// Reset the broker-side processing timeout for a message
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the connection is closed or the write fails.
    pub async fn touch(&self, id: MessageId) -> std::io::Result<()> {
        self.write(ClientFrame::Touch(id)).await
    }

    /// Begin a graceful close: ask the broker to stop delivering, then
    /// hard-close after a short drain timeout
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.write_unchecked(ClientFrame::Cls).await;
        let mut writer = self.writer.lock().await;
        writer.shutdown().await;
        self.reader_task.abort();
    }

    async fn write(&self, frame: ClientFrame) -> std::io::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "connection closed",
            ));
        }
        self.write_unchecked(frame).await
    }

    async fn write_unchecked(&self, frame: ClientFrame) -> std::io::Result<()> {
        let encoded = frame.encode();
        let mut writer = self.writer.lock().await;
        writer.write_frame(&encoded).await
    }
}

impl Drop for SubConnection {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}
