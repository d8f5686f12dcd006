// Copyright (C) 2025, Cloudflare, Inc.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions are
// met:
//
//     * Redistributions of source code must retain the above copyright notice,
//       this list of conditions and the following disclaimer.
//
//     * Redistributions in binary form must reproduce the above copyright
//       notice, this list of conditions and the following disclaimer in the
//       documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS
// IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED TO,
// THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR
// PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR
// CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL,
// EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO,
// PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE, DATA, OR
// PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF
// LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING
// NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE OF THIS
// SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

//! Interface to the downstream (backend) side of the proxy.
//!
//! The ingress does not talk to backends itself. For every admitted request
//! it asks the embedder's [`DownstreamDispatcher`] for a
//! [`DownstreamConnection`]: a pair of bounded channels carrying the request
//! body towards the backend and response events back. How the dispatcher
//! resolves a target, pools connections, or speaks HTTP/1 vs HTTP/2 is its
//! own business.

use std::net::SocketAddr;

use quiche::h3;
use tokio::sync::mpsc;

use crate::buf_factory::PooledBuf;
use crate::result::BoxError;

/// Per-stream channel depth for request body and response event channels.
///
/// With 64 KB pooled buffers this bounds per-request buffering at 1 MB in
/// each direction, on top of the response ring buffer.
pub const DOWNSTREAM_CHANNEL_CAPACITY: usize = 16;

/// The request head handed to the dispatcher, after validation and path
/// cleaning.
#[derive(Debug, Clone)]
pub struct RequestHead {
    /// Request method (the raw `:method` value).
    pub method: Vec<u8>,
    /// `:scheme`, absent for CONNECT.
    pub scheme: Option<Vec<u8>>,
    /// `:authority`, with a `host` header fallback applied.
    pub authority: Option<Vec<u8>>,
    /// The request path after rewriting. `*` is preserved for OPTIONS; in
    /// forward-proxy mode the raw path is forwarded.
    pub path: Vec<u8>,
    /// All non-pseudo header fields in received order.
    pub headers: Vec<h3::Header>,
    /// Parsed `content-length`, if present. Filled with 0 for requests that
    /// cannot carry a body.
    pub content_length: Option<u64>,
    /// The request is an Extended CONNECT for the `websocket` protocol.
    pub connect_protocol: bool,
    /// Body bytes may follow the request head.
    pub expect_body: bool,
    /// Address of the requesting client.
    pub peer_addr: SocketAddr,
}

/// A chunk of request body forwarded to the backend.
#[derive(Debug)]
pub struct BodyChunk {
    pub data: PooledBuf,
    /// No more body follows this chunk.
    pub fin: bool,
    /// Request trailer fields, delivered with the `fin` chunk and empty on
    /// all others. Fields over the request header limits have already been
    /// dropped.
    pub trailers: Vec<h3::Header>,
}

/// Response-side events produced by a downstream connection.
#[derive(Debug)]
pub enum DownstreamEvent {
    /// The backend's response head is complete.
    Headers(ResponseHead),
    /// A chunk of response body. `flush` asks the upstream to push it to the
    /// client immediately instead of waiting for more data.
    Body { data: PooledBuf, flush: bool },
    /// The response body is complete, with optional trailers.
    Finished { trailers: Vec<h3::Header> },
    /// The downstream connection died before completing the response. The
    /// upstream may re-dispatch the request unless `no_retry` is set.
    Reset { no_retry: bool },
}

/// A backend response head.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: u16,
    /// Response header fields in order, without pseudo-headers.
    pub headers: Vec<h3::Header>,
    /// Declared body length. When set, the upstream enforces that the body
    /// events sum up to exactly this many bytes.
    pub content_length: Option<u64>,
    /// Body events will follow.
    pub has_body: bool,
}

/// Why a request could not be dispatched.
#[derive(Debug)]
pub enum DispatchError {
    /// The selected backend requires a TLS frontend; the client is
    /// redirected to HTTPS with 308.
    TlsRequired,
    /// No backend connection could be produced.
    Unavailable(BoxError),
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::TlsRequired => f.write_str("backend requires TLS frontend"),
            Self::Unavailable(e) => write!(f, "no downstream available: {e}"),
        }
    }
}

impl std::error::Error for DispatchError {}

/// The upstream's handle to one dispatched request.
pub struct DownstreamConnection {
    /// Carries request body chunks towards the backend.
    pub body_tx: mpsc::Sender<BodyChunk>,
    /// Delivers response events from the backend.
    pub events_rx: mpsc::Receiver<DownstreamEvent>,
    /// Opaque session-affinity token. When present and an affinity cookie is
    /// configured, the upstream reflects it to the client via `set-cookie`.
    pub affinity_token: Option<String>,
}

/// The backend half of a [`DownstreamConnection`], as handed to whatever
/// task drives the actual backend protocol.
pub struct BackendHandle {
    pub body_rx: mpsc::Receiver<BodyChunk>,
    pub events_tx: mpsc::Sender<DownstreamEvent>,
}

impl DownstreamConnection {
    /// Creates a connected pair of upstream and backend halves.
    pub fn pair() -> (Self, BackendHandle) {
        let (body_tx, body_rx) = mpsc::channel(DOWNSTREAM_CHANNEL_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(DOWNSTREAM_CHANNEL_CAPACITY);

        (
            DownstreamConnection {
                body_tx,
                events_rx,
                affinity_token: None,
            },
            BackendHandle { body_rx, events_tx },
        )
    }
}

/// Resolves requests to backend connections.
///
/// Implementations must not block: `dispatch` runs on the connection task.
/// The usual shape is to spawn a task per backend request (or check one out
/// of a pool) and return its channel handle immediately.
pub trait DownstreamDispatcher: Send + Sync + 'static {
    fn dispatch(
        &self, head: &RequestHead,
    ) -> Result<DownstreamConnection, DispatchError>;
}
