//! Message framing shared by the cloud, SM and IAM streams.
//!
//! `header: {version: u8, kind: u8, data_size: u32}` followed by
//! `data_size` bytes of `serde_json`-encoded payload. The transport is
//! unaware of payload semantics beyond `kind` — callers pick the `kind`
//! byte and the `T` to (de)serialize.

use cm_proto::{CmError, ErrorKind};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const HEADER_LEN: usize = 6;
pub const FRAME_VERSION: u8 = 1;

/// Cap on a single frame's payload. Prevents a corrupt/hostile peer from
/// making us allocate an unbounded buffer before validation.
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

pub struct FramedStream<S> {
    io: S,
}

impl<S> FramedStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(io: S) -> Self {
        Self { io }
    }

    pub async fn write_frame(&mut self, kind: u8, payload: &[u8]) -> Result<(), CmError> {
        if payload.len() as u64 > MAX_FRAME_LEN as u64 {
            return Err(CmError::new(
                ErrorKind::InvalidArgument,
                "frame payload exceeds maximum size",
            ));
        }
        let mut header = [0u8; HEADER_LEN];
        header[0] = FRAME_VERSION;
        header[1] = kind;
        header[2..6].copy_from_slice(&(payload.len() as u32).to_be_bytes());

        self.io.write_all(&header).await?;
        self.io.write_all(payload).await?;
        self.io.flush().await?;
        Ok(())
    }

    pub async fn write_json<T: serde::Serialize>(
        &mut self,
        kind: u8,
        value: &T,
    ) -> Result<(), CmError> {
        let payload = serde_json::to_vec(value)?;
        self.write_frame(kind, &payload).await
    }

    /// Reads one frame. Returns `Ok(None)` on a clean EOF before any header
    /// bytes arrive (peer closed between frames).
    pub async fn read_frame(&mut self) -> Result<Option<(u8, Vec<u8>)>, CmError> {
        let mut header = [0u8; HEADER_LEN];
        match self.io.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let version = header[0];
        if version != FRAME_VERSION {
            return Err(CmError::new(
                ErrorKind::InvalidArgument,
                format!("unsupported frame version {version}"),
            ));
        }
        let kind = header[1];
        let data_size = u32::from_be_bytes([header[2], header[3], header[4], header[5]]);
        if data_size > MAX_FRAME_LEN {
            return Err(CmError::new(
                ErrorKind::InvalidArgument,
                "frame header declares an oversized payload",
            ));
        }

        let mut payload = vec![0u8; data_size as usize];
        self.io.read_exact(&mut payload).await?;
        Ok(Some((kind, payload)))
    }

    pub async fn read_json<T: serde::de::DeserializeOwned>(
        &mut self,
    ) -> Result<Option<(u8, T)>, CmError> {
        match self.read_frame().await? {
            None => Ok(None),
            Some((kind, payload)) => {
                let value = serde_json::from_slice(&payload)?;
                Ok(Some((kind, value)))
            }
        }
    }

    pub fn into_inner(self) -> S {
        self.io
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Ping {
        n: u32,
    }

    #[tokio::test]
    async fn round_trips_a_frame() {
        let (client, server) = tokio::io::duplex(4096);
        let mut client = FramedStream::new(client);
        let mut server = FramedStream::new(server);

        client.write_json(7, &Ping { n: 42 }).await.unwrap();
        let (kind, value): (u8, Ping) = server.read_json().await.unwrap().unwrap();
        assert_eq!(kind, 7);
        assert_eq!(value, Ping { n: 42 });
    }

    #[tokio::test]
    async fn clean_close_reads_as_none() {
        let (client, server) = tokio::io::duplex(16);
        drop(client);
        let mut server = FramedStream::new(server);
        assert!(server.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_header_is_rejected() {
        let (mut client, server) = tokio::io::duplex(4096);
        let mut header = [0u8; HEADER_LEN];
        header[0] = FRAME_VERSION;
        header[2..6].copy_from_slice(&(MAX_FRAME_LEN + 1).to_be_bytes());
        client.write_all(&header).await.unwrap();

        let mut server = FramedStream::new(server);
        let err = server.read_frame().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }
}
