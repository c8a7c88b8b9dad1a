//! In-process fake broker used by integration-style tests
//!
//! A minimal broker good enough to drive the handshake/SUB/RDY/CLS lifecycle
//! without a real nsqd, so `Subscriber`/`Subscription` behavior can be
//! exercised end-to-end.
#![cfg(test)]

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, Duration};

use crate::connection::wire::{ClientFrame, ServerFrame};
use crate::frame::{FrameReader, FrameWriter};
use crate::host_port::HostAndPort;
use crate::types::{Message, MessageId};

/// A fake broker node accepting the handshake and basic commands
///
/// Optionally pushes `messages_on_sub` fake messages immediately after
/// acking `SUB`, standing in for messages the real broker would deliver
/// once RDY credit is granted.
pub(crate) struct FakeBroker {
    pub(crate) addr: HostAndPort,
}

/// Initialize a `tracing` subscriber writing to the test harness, so logs
/// from the control loop and connections show up under `--nocapture`.
///
/// Safe to call from every test; only the first call installs a subscriber.
pub(crate) fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("nsq_client=debug")
        .try_init();
}

impl FakeBroker {
    pub(crate) async fn spawn(messages_on_sub: usize) -> Self {
        init_test_tracing();
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind fake broker");
        let addr = HostAndPort::new("127.0.0.1", listener.local_addr().unwrap().port());

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(handle_connection(stream, messages_on_sub));
            }
        });

        Self { addr }
    }
}

async fn handle_connection(mut stream: TcpStream, messages_on_sub: usize) {
    let mut magic = [0u8; 4];
    if stream.read_exact(&mut magic).await.is_err() {
        return;
    }

    let (read_half, write_half) = stream.into_split();
    let mut reader = FrameReader::new(read_half);
    let mut writer = FrameWriter::new(write_half);

    loop {
        let Ok(frame) = reader.read_frame().await else {
            break;
        };
        let Some(client_frame) = ClientFrame::decode(frame.freeze()) else {
            break;
        };

        match client_frame {
            ClientFrame::Identify(_) | ClientFrame::Pub { .. } | ClientFrame::Mpub { .. } => {
                if writer.write_frame(&ServerFrame::Ok.encode()).await.is_err() {
                    break;
                }
            }
            ClientFrame::Sub { .. } => {
                if writer.write_frame(&ServerFrame::Ok.encode()).await.is_err() {
                    break;
                }
                for i in 0..messages_on_sub {
                    let byte = u8::try_from(i).unwrap_or(u8::MAX);
                    let message = ServerFrame::Message {
                        id: MessageId::from_bytes([byte; 16]),
                        timestamp_ms: 0,
                        attempts: 1,
                        body: bytes::Bytes::from_static(b"payload"),
                    };
                    if writer.write_frame(&message.encode()).await.is_err() {
                        return;
                    }
                }
            }
            ClientFrame::Cls => {
                let _ = writer.write_frame(&ServerFrame::Ok.encode()).await;
                break;
            }
            ClientFrame::Rdy(_) | ClientFrame::Fin(_) | ClientFrame::Req { .. } | ClientFrame::Touch(_) | ClientFrame::Nop => {
                // no reply expected for these in the real protocol either
            }
        }
    }
}

/// A handler that sleeps briefly then always succeeds, so tests can observe
/// messages passing through the in-flight count before completing.
pub(crate) fn slow_success_handler(
    delay: Duration,
) -> impl Fn(Message) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), crate::handler::HandlerError>> + Send>>
       + Send
       + Sync
       + 'static {
    move |_message| {
        let delay = delay;
        Box::pin(async move {
            sleep(delay).await;
            Ok(())
        })
    }
}
