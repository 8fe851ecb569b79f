//! Unix domain socket transport
//!
//! Frames are length-delimited (`LengthDelimitedCodec`, 4-byte big-endian
//! length prefix).

use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::debug;

use super::{Transport, TransportFactory, UNIX_SOCKET_SCHEME};
use crate::error::Result;

pub struct UnixSocketTransport {
    endpoint: String,
    reader: Mutex<FramedRead<ReadHalf<UnixStream>, LengthDelimitedCodec>>,
    writer: Mutex<FramedWrite<WriteHalf<UnixStream>, LengthDelimitedCodec>>,
}

impl UnixSocketTransport {
    /// Connect to a listening socket
    pub async fn connect<P: AsRef<Path>>(socket_path: P) -> Result<Self> {
        let stream = UnixStream::connect(socket_path.as_ref()).await?;
        let endpoint = format!("{}://{}", UNIX_SOCKET_SCHEME, socket_path.as_ref().display());
        debug!("Connected to {}", endpoint);
        Ok(Self::from_stream(endpoint, stream))
    }

    /// Wrap an accepted or connected stream
    pub fn from_stream(endpoint: impl Into<String>, stream: UnixStream) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            endpoint: endpoint.into(),
            reader: Mutex::new(FramedRead::new(read_half, LengthDelimitedCodec::new())),
            writer: Mutex::new(FramedWrite::new(write_half, LengthDelimitedCodec::new())),
        }
    }
}

#[async_trait]
impl Transport for UnixSocketTransport {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn send(&self, payload: Bytes) -> Result<()> {
        self.writer.lock().await.send(payload).await?;
        Ok(())
    }

    async fn recv(&self) -> Result<Option<Bytes>> {
        match self.reader.lock().await.next().await {
            Some(frame) => Ok(Some(frame?.freeze())),
            None => Ok(None),
        }
    }

    async fn close(&self) -> Result<()> {
        self.writer.lock().await.close().await?;
        Ok(())
    }
}

/// Factory for `unix-socket://<path>`
pub struct UnixSocketFactory;

#[async_trait]
impl TransportFactory for UnixSocketFactory {
    fn scheme(&self) -> &str {
        UNIX_SOCKET_SCHEME
    }

    async fn open(&self, _endpoint: &str, address: &str) -> Result<Box<dyn Transport>> {
        Ok(Box::new(UnixSocketTransport::connect(address).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportRegistry;
    use tokio::net::UnixListener;

    #[tokio::test]
    async fn test_frames_over_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cdmf.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let transport = UnixSocketTransport::from_stream("server", stream);
            while let Some(frame) = transport.recv().await.unwrap() {
                let mut reply = frame.to_vec();
                reply.reverse();
                transport.send(Bytes::from(reply)).await.unwrap();
            }
        });

        let registry = TransportRegistry::new();
        let endpoint = format!("unix-socket://{}", path.display());
        let client = registry.open(&endpoint).await.unwrap();
        client.send(Bytes::from_static(b"abc")).await.unwrap();
        assert_eq!(client.recv().await.unwrap().unwrap(), Bytes::from_static(b"cba"));

        client.close().await.unwrap();
        server.await.unwrap();
    }
}
