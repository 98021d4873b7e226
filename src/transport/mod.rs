//! Framed transport endpoints.
//!
//! Every logical message between hosts is a two-frame sequence on a
//! length-delimited TCP stream: a single-byte header carrying the call id,
//! then a body (possibly empty). Each service binds a pair of ports: an
//! async port for fire-and-forget messages and a sync port for
//! request/reply.

mod client;
mod frame;
mod server;

pub use client::MessageEndpointClient;
pub use frame::{frame_stream, recv_frames, send_frames, send_shutdown_frame, FramedStream, Inbound};
pub use server::{MessageEndpointServer, ServerHandler};
