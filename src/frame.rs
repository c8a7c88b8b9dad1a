//! Generic length-prefixed framing over an async byte stream
//!
//! This is the framed-connection primitive the broker wire protocol sits on
//! top of. It knows nothing about `PUB`/`SUB`/etc. — [`crate::connection`]
//! builds the command vocabulary on top of the plain frames read and written
//! here.
//!
//! Reader and writer halves are kept separate so that reads can run on a
//! dedicated background task while writes are serialized through a
//! per-connection lock.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// The read half of a framed connection
#[derive(Debug)]
pub(crate) struct FrameReader<R> {
    io: R,
    read_buf: BytesMut,
}

/// The write half of a framed connection
#[derive(Debug)]
pub(crate) struct FrameWriter<W> {
    io: W,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub(crate) fn new(io: R) -> Self {
        Self {
            io,
            read_buf: BytesMut::with_capacity(4096),
        }
    }

    pub(crate) async fn read_frame(&mut self) -> std::io::Result<BytesMut> {
        let mut len_buf = [0u8; 4];
        self.io.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf);
        if len > MAX_FRAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "frame exceeds maximum size",
            ));
        }

        self.read_buf.clear();
        self.read_buf.resize(len as usize, 0);
        self.io.read_exact(&mut self.read_buf).await?;
        Ok(self.read_buf.split_to(len as usize))
    }
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub(crate) fn new(io: W) -> Self {
        Self { io }
    }

    pub(crate) async fn write_frame(&mut self, body: &[u8]) -> std::io::Result<()> {
        let len = u32::try_from(body.len()).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "frame too large")
        })?;
        self.io.write_all(&len.to_be_bytes()).await?;
        self.io.write_all(body).await?;
        self.io.flush().await
    }

    /// Best-effort, silent shutdown; errors are discarded since there is
    /// nothing left to do with them once a connection is being torn down.
    pub(crate) async fn shutdown(&mut self) {
        crate::host_port::quiet_close(&mut self.io).await;
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::duplex;

    use super::{FrameReader, FrameWriter};

    #[tokio::test]
    async fn write_then_read_roundtrips() {
        let (client_io, server_io) = duplex(4096);
        let mut writer = FrameWriter::new(client_io);
        let mut reader = FrameReader::new(server_io);

        writer.write_frame(b"hello").await.unwrap();
        let frame = reader.read_frame().await.unwrap();
        assert_eq!(&frame[..], b"hello");
    }

    #[tokio::test]
    async fn empty_frame_roundtrips() {
        let (client_io, server_io) = duplex(4096);
        let mut writer = FrameWriter::new(client_io);
        let mut reader = FrameReader::new(server_io);

        writer.write_frame(b"").await.unwrap();
        let frame = reader.read_frame().await.unwrap();
        assert!(frame.is_empty());
    }
}
