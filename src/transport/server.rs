//! Server side of a framed endpoint pair.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::SinkExt;
use tokio::net::TcpListener;
use tokio::sync::{watch, Semaphore};
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::transport::frame::{frame_stream, recv_frames, Inbound};

/// Dispatch target for inbound frames. The header byte selects the
/// operation; the body is the serialized request.
#[async_trait]
pub trait ServerHandler: Send + Sync + 'static {
    /// Handle a fire-and-forget message from the async socket.
    async fn handle_async(&self, header: u8, body: Bytes) -> Result<()>;

    /// Handle a request from the sync socket and produce exactly one reply
    /// body (possibly empty).
    async fn handle_sync(&self, header: u8, body: Bytes) -> Result<Vec<u8>>;
}

/// A dual-port framed server.
///
/// Binds the async and sync ports, accepts connections on both, and
/// dispatches each frame pair to the handler. Handlers run inline on the
/// connection task, so frames are processed in FIFO order per sender per
/// socket; a semaphore bounds how many handlers run at once across all
/// connections. An empty inbound frame stops the whole server; in-flight
/// work is drained before [`MessageEndpointServer::stop`] returns.
pub struct MessageEndpointServer {
    async_port: u16,
    sync_port: u16,
    shutdown_tx: watch::Sender<bool>,
    tracker: TaskTracker,
}

impl MessageEndpointServer {
    pub async fn start(
        handler: Arc<dyn ServerHandler>,
        bind_host: &str,
        port: u16,
        reply_port: u16,
        workers: usize,
    ) -> Result<Self> {
        let async_listener = TcpListener::bind((bind_host, port))
            .await
            .map_err(|e| Error::Transport(format!("bind {bind_host}:{port}: {e}")))?;
        let sync_listener = TcpListener::bind((bind_host, reply_port))
            .await
            .map_err(|e| Error::Transport(format!("bind {bind_host}:{reply_port}: {e}")))?;

        let async_port = async_listener
            .local_addr()
            .map_err(|e| Error::Transport(e.to_string()))?
            .port();
        let sync_port = sync_listener
            .local_addr()
            .map_err(|e| Error::Transport(e.to_string()))?
            .port();

        let (shutdown_tx, _) = watch::channel(false);
        let tracker = TaskTracker::new();
        let semaphore = Arc::new(Semaphore::new(workers.max(1)));

        for (listener, is_sync) in [(async_listener, false), (sync_listener, true)] {
            let handler = Arc::clone(&handler);
            let semaphore = Arc::clone(&semaphore);
            let shutdown_tx = shutdown_tx.clone();
            let conn_tracker = tracker.clone();
            tracker.spawn(accept_loop(
                listener,
                is_sync,
                handler,
                semaphore,
                shutdown_tx,
                conn_tracker,
            ));
        }

        debug!(async_port, sync_port, "endpoint server listening");

        Ok(Self {
            async_port,
            sync_port,
            shutdown_tx,
            tracker,
        })
    }

    pub fn async_port(&self) -> u16 {
        self.async_port
    }

    pub fn sync_port(&self) -> u16 {
        self.sync_port
    }

    /// Stop accepting frames and wait for in-flight handlers to finish.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        self.tracker.close();
        self.tracker.wait().await;
    }

    /// Wait until a peer signals shutdown with an empty frame.
    pub async fn wait_for_shutdown(&self) {
        let mut rx = self.shutdown_tx.subscribe();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    is_sync: bool,
    handler: Arc<dyn ServerHandler>,
    semaphore: Arc<Semaphore>,
    shutdown_tx: watch::Sender<bool>,
    tracker: TaskTracker,
) {
    let mut shutdown_rx = shutdown_tx.subscribe();
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(?err, "accept failed");
                        continue;
                    }
                };
                debug!(%peer, is_sync, "accepted connection");
                let handler = Arc::clone(&handler);
                let semaphore = Arc::clone(&semaphore);
                let shutdown_tx = shutdown_tx.clone();
                tracker.spawn(connection_loop(stream, is_sync, handler, semaphore, shutdown_tx));
            }
        }
    }
}

async fn connection_loop(
    stream: tokio::net::TcpStream,
    is_sync: bool,
    handler: Arc<dyn ServerHandler>,
    semaphore: Arc<Semaphore>,
    shutdown_tx: watch::Sender<bool>,
) {
    let mut framed = frame_stream(stream);
    let mut shutdown_rx = shutdown_tx.subscribe();

    loop {
        let inbound = tokio::select! {
            _ = shutdown_rx.changed() => break,
            inbound = recv_frames(&mut framed) => inbound,
        };

        let (header, body) = match inbound {
            Ok(Inbound::Frame { header, body }) => (header, body),
            Ok(Inbound::Shutdown) => {
                debug!("received shutdown frame");
                let _ = shutdown_tx.send(true);
                break;
            }
            Ok(Inbound::Closed) => break,
            Err(err) => {
                warn!(?err, "dropping connection");
                break;
            }
        };

        let _permit = semaphore
            .acquire()
            .await
            .expect("semaphore is never closed");

        if is_sync {
            match handler.handle_sync(header, body).await {
                Ok(response) => {
                    if let Err(err) = framed.send(Bytes::from(response)).await {
                        warn!(?err, "failed to send reply");
                        break;
                    }
                }
                Err(err) => {
                    // Refuse the request; the client observes the closed
                    // socket as a transport error.
                    warn!(header, ?err, "sync handler failed");
                    break;
                }
            }
        } else if let Err(err) = handler.handle_async(header, body).await {
            warn!(header, ?err, "async handler failed");
        }
    }
}
