//! Local transport
//!
//! The [`Transport`] capability sends one request to an endpoint and waits
//! for one response. [`UnixTransport`] is the real implementation; both the
//! registry's liveness probe and the discovery client go through it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::UnixStream;

use super::protocol::{ServerRequest, ServerResponse};
use crate::error::TransportError;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(60);

/// Longest message line either side will buffer
pub const MAX_MESSAGE_BYTES: u64 = 1024 * 1024;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `request` to `endpoint` and wait for the reply
    async fn request(
        &self,
        endpoint: &Path,
        request: &ServerRequest,
    ) -> Result<ServerResponse, TransportError>;
}

/// Newline-delimited JSON over a Unix domain socket
#[derive(Debug, Clone)]
pub struct UnixTransport {
    connect_timeout: Duration,
    response_timeout: Duration,
}

impl UnixTransport {
    pub fn new() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }

    pub fn with_timeouts(connect_timeout: Duration, response_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            response_timeout,
        }
    }

    async fn connect(&self, endpoint: &Path) -> Result<UnixStream, TransportError> {
        match tokio::time::timeout(self.connect_timeout, UnixStream::connect(endpoint)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(source)) => Err(TransportError::Connect {
                endpoint: endpoint.to_path_buf(),
                source,
            }),
            Err(_) => Err(TransportError::ConnectTimeout(endpoint.to_path_buf())),
        }
    }
}

impl Default for UnixTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for UnixTransport {
    async fn request(
        &self,
        endpoint: &Path,
        request: &ServerRequest,
    ) -> Result<ServerResponse, TransportError> {
        let stream = self.connect(endpoint).await?;
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        tracing::debug!("-> {:?} {:?}", endpoint, request);
        write_message(&mut writer, request).await?;

        let response = tokio::time::timeout(
            self.response_timeout,
            read_message::<_, ServerResponse>(&mut reader),
        )
        .await
        .map_err(|_| TransportError::ResponseTimeout(PathBuf::from(endpoint)))??
        .ok_or(TransportError::Closed)?;

        tracing::debug!("<- {:?} {:?}", endpoint, response);
        Ok(response)
    }
}

/// Write one message as a JSON line
pub(crate) async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let json = serde_json::to_string(message)?;
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

/// Read one JSON line. `Ok(None)` when the peer closed without sending.
pub(crate) async fn read_message<R, T>(reader: &mut R) -> Result<Option<T>, TransportError>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    let n = (&mut *reader)
        .take(MAX_MESSAGE_BYTES)
        .read_line(&mut line)
        .await?;
    if n as u64 >= MAX_MESSAGE_BYTES && !line.ends_with('\n') {
        return Err(TransportError::MessageTooLarge(MAX_MESSAGE_BYTES));
    }
    if n == 0 || line.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(&line)?))
}
