//! Two-frame wire protocol over a length-delimited codec.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::error::{Error, Result};

pub type FramedStream = Framed<TcpStream, LengthDelimitedCodec>;

/// Wrap a TCP stream in the length-delimited codec used by all endpoints.
pub fn frame_stream(stream: TcpStream) -> FramedStream {
    Framed::new(stream, LengthDelimitedCodec::new())
}

/// One inbound event on a framed connection.
#[derive(Debug)]
pub enum Inbound {
    /// A complete header/body pair.
    Frame { header: u8, body: Bytes },
    /// An empty header frame: the peer is asking the server to stop.
    Shutdown,
    /// The peer closed the connection.
    Closed,
}

/// Send a header frame followed by a body frame.
pub async fn send_frames(framed: &mut FramedStream, header: u8, body: &[u8]) -> Result<()> {
    framed
        .send(Bytes::copy_from_slice(&[header]))
        .await
        .map_err(|e| Error::Transport(e.to_string()))?;
    framed
        .send(Bytes::copy_from_slice(body))
        .await
        .map_err(|e| Error::Transport(e.to_string()))?;
    Ok(())
}

/// Send the empty frame that signals server shutdown.
pub async fn send_shutdown_frame(framed: &mut FramedStream) -> Result<()> {
    framed
        .send(Bytes::new())
        .await
        .map_err(|e| Error::Transport(e.to_string()))
}

/// Receive the next header/body pair, shutdown signal, or EOF.
pub async fn recv_frames(framed: &mut FramedStream) -> Result<Inbound> {
    let header = match framed.next().await {
        None => return Ok(Inbound::Closed),
        Some(Err(e)) => return Err(Error::Transport(e.to_string())),
        Some(Ok(frame)) => frame,
    };

    if header.is_empty() {
        return Ok(Inbound::Shutdown);
    }
    if header.len() != 1 {
        return Err(Error::Transport(format!(
            "header frame must be one byte, got {}",
            header.len()
        )));
    }

    let body = match framed.next().await {
        None => return Ok(Inbound::Closed),
        Some(Err(e)) => return Err(Error::Transport(e.to_string())),
        Some(Ok(frame)) => frame,
    };

    Ok(Inbound::Frame {
        header: header[0],
        body: body.freeze(),
    })
}
