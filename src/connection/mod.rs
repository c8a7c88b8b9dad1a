//! One TCP connection to a single broker node
//!
//! `PubConnection` and `SubConnection` both build on the same dial +
//! handshake logic; each owns one socket, serializes writes behind a lock
//! and runs its reads on a dedicated background task.

mod pub_connection;
mod sub_connection;
pub(crate) mod wire;

pub use pub_connection::PubConnection;
pub use sub_connection::{CloseCause, SubConnection};
pub(crate) use sub_connection::ConnEvent;

use bytes::Bytes;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use crate::error::{ProtocolError, TransportError};
use crate::frame::{FrameReader, FrameWriter};
use crate::host_port::HostAndPort;
use wire::ServerFrame;

/// Magic preamble sent before the framed portion of the protocol starts
const MAGIC: &[u8] = b"  N1";

#[derive(Debug, Serialize)]
struct IdentifyPayload<'a> {
    client_id: &'a str,
    hostname: &'a str,
    user_agent: &'static str,
}

/// Perform the TCP dial and protocol handshake shared by both connection kinds
pub(crate) async fn dial_and_handshake(
    addr: &HostAndPort,
) -> Result<(FrameReader<OwnedReadHalf>, FrameWriter<OwnedWriteHalf>), TransportError> {
    let mut stream = TcpStream::connect((addr.host(), addr.port()))
        .await
        .map_err(|err| TransportError::Connect(addr.to_string(), err))?;
    stream
        .write_all(MAGIC)
        .await
        .map_err(|err| TransportError::Io(addr.to_string(), err))?;

    let (read_half, write_half) = stream.into_split();
    let mut reader = FrameReader::new(read_half);
    let mut writer = FrameWriter::new(write_half);

    let identify = IdentifyPayload {
        client_id: "nsq-client",
        hostname: &hostname(),
        user_agent: concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")),
    };
    let payload = serde_json::to_vec(&identify).expect("identify payload always serializes");
    let frame = wire::ClientFrame::Identify(Bytes::from(payload)).encode();
    writer
        .write_frame(&frame)
        .await
        .map_err(|err| TransportError::Io(addr.to_string(), err))?;

    let reply = reader
        .read_frame()
        .await
        .map_err(|err| TransportError::Io(addr.to_string(), err))?;
    match ServerFrame::decode(reply.freeze()) {
        Some(ServerFrame::Ok) => Ok((reader, writer)),
        Some(other) => Err(TransportError::Io(
            addr.to_string(),
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                ProtocolError::Handshake(format!("{other:?}")).to_string(),
            ),
        )),
        None => Err(TransportError::Io(
            addr.to_string(),
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                ProtocolError::Malformed("handshake reply".to_owned()).to_string(),
            ),
        )),
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_owned())
}
