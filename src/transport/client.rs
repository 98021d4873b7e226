//! Client side of a framed endpoint pair.

use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::debug;

use crate::error::{Error, Result};
use crate::transport::frame::{frame_stream, send_frames, send_shutdown_frame, FramedStream};

/// Client for one remote endpoint pair.
///
/// Connections are opened lazily and kept for reuse. A socket that errors
/// or times out is discarded so the next call reconnects cleanly.
pub struct MessageEndpointClient {
    host: String,
    port: u16,
    reply_port: u16,
    request_timeout: Duration,
    async_conn: Mutex<Option<FramedStream>>,
    sync_conn: Mutex<Option<FramedStream>>,
}

impl MessageEndpointClient {
    pub fn new(host: &str, port: u16, reply_port: u16, request_timeout: Duration) -> Self {
        Self {
            host: host.to_string(),
            port,
            reply_port,
            request_timeout,
            async_conn: Mutex::new(None),
            sync_conn: Mutex::new(None),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    async fn connect(&self, port: u16) -> Result<FramedStream> {
        let addr = format!("{}:{}", self.host, port);
        let stream = timeout(self.request_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| Error::MessageTimeout)?
            .map_err(|e| Error::Transport(format!("connect {addr}: {e}")))?;
        stream
            .set_nodelay(true)
            .map_err(|e| Error::Transport(e.to_string()))?;
        Ok(frame_stream(stream))
    }

    /// Fire-and-forget send on the async socket. At-most-once delivery, no
    /// acknowledgment.
    pub async fn send_async(&self, header: u8, body: &[u8]) -> Result<()> {
        let mut guard = self.async_conn.lock().await;
        if guard.is_none() {
            *guard = Some(self.connect(self.port).await?);
        }
        let framed = guard.as_mut().expect("connection just opened");
        if let Err(err) = send_frames(framed, header, body).await {
            *guard = None;
            return Err(err);
        }
        Ok(())
    }

    /// Request/reply on the sync socket. Blocks up to the client timeout
    /// and returns the single reply frame.
    pub async fn request(&self, header: u8, body: &[u8]) -> Result<Bytes> {
        let mut guard = self.sync_conn.lock().await;
        if guard.is_none() {
            *guard = Some(self.connect(self.reply_port).await?);
        }
        let framed = guard.as_mut().expect("connection just opened");

        if let Err(err) = send_frames(framed, header, body).await {
            *guard = None;
            return Err(err);
        }

        match timeout(self.request_timeout, framed.next()).await {
            Err(_) => {
                // The reply may still arrive later; the socket can no
                // longer be matched to a request, so drop it.
                debug!(host = %self.host, header, "sync request timed out");
                *guard = None;
                Err(Error::MessageTimeout)
            }
            Ok(None) => {
                *guard = None;
                Err(Error::Transport("connection closed before reply".to_string()))
            }
            Ok(Some(Err(e))) => {
                *guard = None;
                Err(Error::Transport(e.to_string()))
            }
            Ok(Some(Ok(frame))) => Ok(frame.freeze()),
        }
    }

    /// Ask the remote server to stop by sending an empty async frame.
    pub async fn send_shutdown(&self) -> Result<()> {
        let mut guard = self.async_conn.lock().await;
        if guard.is_none() {
            *guard = Some(self.connect(self.port).await?);
        }
        let framed = guard.as_mut().expect("connection just opened");
        if let Err(err) = send_shutdown_frame(framed).await {
            *guard = None;
            return Err(err);
        }
        Ok(())
    }
}
