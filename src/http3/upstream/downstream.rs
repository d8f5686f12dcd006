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

//! Per-request state: the request head, the bridge to the downstream
//! connection, and the buffered response.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;

use quiche::h3;
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;

use crate::buf_factory::PooledBuf;
use crate::downstream::BodyChunk;
use crate::downstream::DownstreamConnection;
use crate::downstream::DownstreamEvent;
use crate::downstream::RequestHead;
use crate::http3::settings::TimeoutKey;
use crate::http3::H3AuditStats;

/// High watermark for the response ring buffer, in bytes. While at or above
/// this level, no further downstream body events are consumed.
pub(crate) const RESPONSE_BODY_HIGH_WATERMARK: usize = 256 * 1024;

/// Body chunks submitted to the transport per writable-stream visit.
pub(crate) const MAX_BODY_CHUNKS_PER_WRITE: usize = 16;

/// Admission state of a request. Transitions form a DAG:
/// pending moves to active, blocked or failed; blocked moves to active or
/// failed; active only completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DispatchState {
    /// Created, not yet admitted.
    Pending,
    /// Admission refused by capacity; waiting for a slot.
    Blocked,
    /// Dispatched to a downstream connection.
    Active,
    /// Dispatch failed terminally; a local reply was generated.
    Failed,
}

/// Progress of the response on the HTTP/3 stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResponseState {
    /// No response headers submitted yet.
    Initial,
    /// Headers are on the stream; body may still be flowing.
    HeadersSent,
    /// The response is complete (FIN queued or sent).
    Complete,
}

/// Buffered response body between the downstream connection and the HTTP/3
/// stream.
///
/// Bytes enter when the downstream produces them and leave strictly in
/// offset order as the HTTP/3 layer accepts them; the `drain` accounting
/// asserts the two never diverge.
#[derive(Default)]
pub(crate) struct BodyRing {
    chunks: VecDeque<PooledBuf>,
    /// Bytes currently resident.
    len: usize,
    /// Total bytes ever appended.
    appended: u64,
    /// Total bytes drained into the transport.
    drained: u64,
}

impl BodyRing {
    pub(crate) fn append(&mut self, data: PooledBuf) {
        if data.is_empty() {
            return;
        }

        self.len += data.len();
        self.appended += data.len() as u64;
        self.chunks.push_back(data);
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn appended(&self) -> u64 {
        self.appended
    }

    /// Whether the ring can accept more downstream data.
    pub(crate) fn has_room(&self) -> bool {
        self.len < RESPONSE_BODY_HIGH_WATERMARK
    }

    /// The first resident chunk, to hand to the transport.
    pub(crate) fn front(&self) -> Option<&[u8]> {
        self.chunks.front().map(|c| &c[..])
    }

    /// Releases exactly `n` bytes from the front of the ring.
    ///
    /// `n` is the byte count the HTTP/3 layer reported accepted; the ring
    /// must contain at least that much.
    pub(crate) fn drain(&mut self, n: usize) {
        let mut left = n;

        while left > 0 {
            let Some(front) = self.chunks.front_mut() else {
                break;
            };

            if front.len() <= left {
                left -= front.len();
                self.chunks.pop_front();
            } else {
                front.pop_front(left);
                left = 0;
            }
        }

        debug_assert_eq!(left, 0, "drained more than the ring holds");

        self.len -= n - left;
        self.drained += (n - left) as u64;
    }
}

/// One request stream and everything attached to it.
pub(crate) struct Downstream {
    pub(crate) stream_id: u64,
    pub(crate) request: RequestHead,
    /// Request trailer fields received so far, already clipped to the
    /// header limits. Handed to the backend with the final body chunk.
    pub(crate) request_trailers: Vec<h3::Header>,
    /// Request body bytes forwarded to the backend so far.
    pub(crate) body_consumed: u64,
    pub(crate) dispatch_state: DispatchState,
    /// Times this request was re-dispatched after a downstream reset.
    pub(crate) retries: usize,

    /// Sends request body towards the backend. Taken while a capacity wait
    /// is in flight.
    pub(crate) body_tx: Option<PollSender<BodyChunk>>,
    /// Response events from the backend. Taken while an event wait is in
    /// flight.
    pub(crate) events_rx: Option<mpsc::Receiver<DownstreamEvent>>,
    /// Session-affinity token reported by the downstream connection.
    pub(crate) affinity_token: Option<String>,

    pub(crate) response: ResponseBuffer,

    /// Response headers queued for submission, with their FIN flag. Kept
    /// here until the stream has capacity for the HEADERS frame.
    pub(crate) pending_headers: Option<(Vec<h3::Header>, bool)>,

    /// The client finished sending its request body.
    pub(crate) req_fin_recv: bool,
    /// End-of-body was forwarded to the backend.
    pub(crate) req_fin_sent: bool,
    /// The response FIN was handed to the transport.
    pub(crate) fin_sent: bool,

    /// Key of this request's deadline in the driver's timeout queue.
    pub(crate) timeout_key: Option<TimeoutKey>,

    pub(crate) audit_stats: Arc<H3AuditStats>,
}

/// Response-side bookkeeping for one request.
#[derive(Default)]
pub(crate) struct ResponseBuffer {
    pub(crate) state: ResponseStateField,
    pub(crate) status: Option<u16>,
    /// Declared `content-length` from the backend, when present.
    pub(crate) content_length: Option<u64>,
    pub(crate) body: BodyRing,
    /// The downstream signalled end of body.
    pub(crate) complete: bool,
    pub(crate) trailers: Vec<h3::Header>,
    /// Ask the access log layer to mark this exchange `connection: close`.
    pub(crate) connection_close: bool,
}

/// Newtype so `ResponseBuffer` can derive Default.
pub(crate) struct ResponseStateField(pub(crate) ResponseState);

impl Default for ResponseStateField {
    fn default() -> Self {
        Self(ResponseState::Initial)
    }
}

impl Downstream {
    pub(crate) fn new(stream_id: u64, request: RequestHead) -> Self {
        Self {
            stream_id,
            request,
            request_trailers: Vec::new(),
            body_consumed: 0,
            dispatch_state: DispatchState::Pending,
            retries: 0,
            body_tx: None,
            events_rx: None,
            affinity_token: None,
            response: ResponseBuffer::default(),
            pending_headers: None,
            req_fin_recv: false,
            req_fin_sent: false,
            fin_sent: false,
            timeout_key: None,
            audit_stats: Arc::new(H3AuditStats::new(stream_id)),
        }
    }

    /// Wires up a freshly dispatched downstream connection.
    pub(crate) fn attach(&mut self, dconn: DownstreamConnection) {
        self.body_tx = Some(PollSender::new(dconn.body_tx));
        self.events_rx = Some(dconn.events_rx);
        self.affinity_token = dconn.affinity_token;
    }

    /// Severs the link to the downstream connection, closing both channels.
    pub(crate) fn detach(&mut self) {
        self.body_tx = None;
        self.events_rx = None;
    }

    pub(crate) fn response_state(&self) -> ResponseState {
        self.response.state.0
    }

    pub(crate) fn set_response_state(&mut self, state: ResponseState) {
        self.response.state.0 = state;
    }

    /// The response already carries everything the client will get.
    pub(crate) fn response_finished(&self) -> bool {
        self.response.complete && self.response.body.is_empty()
    }

    /// Creates a future that resolves with the next downstream event.
    ///
    /// Only legal while `events_rx` is attached and the response ring has
    /// room; the receiver is parked in the future until it resolves.
    pub(crate) fn wait_for_event(&mut self, stream_id: u64) -> WaitForDownstream {
        WaitForDownstream::Event(WaitForResponseEvent {
            stream_id,
            chan: self.events_rx.take(),
        })
    }

    /// Creates a future that resolves when the request body channel has
    /// capacity again.
    pub(crate) fn wait_for_body_capacity(
        &mut self, stream_id: u64,
    ) -> WaitForDownstream {
        WaitForDownstream::Capacity(WaitForBodyCapacity {
            stream_id,
            chan: self.body_tx.take(),
        })
    }
}

/// Futures the driver parks per stream while waiting on the downstream
/// bridge.
pub(crate) enum WaitForDownstream {
    /// Waiting for a response event from the backend.
    Event(WaitForResponseEvent),
    /// Waiting for request-body channel capacity towards the backend.
    Capacity(WaitForBodyCapacity),
}

pub(crate) enum DownstreamReady {
    Event(ReceivedResponseEvent),
    Capacity(HaveBodyCapacity),
}

impl Future for WaitForDownstream {
    type Output = DownstreamReady;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.get_mut() {
            WaitForDownstream::Event(e) =>
                Pin::new(e).poll(cx).map(DownstreamReady::Event),
            WaitForDownstream::Capacity(c) =>
                Pin::new(c).poll(cx).map(DownstreamReady::Capacity),
        }
    }
}

impl WaitForDownstream {
    pub(crate) fn stream_id(&self) -> u64 {
        match self {
            Self::Event(e) => e.stream_id,
            Self::Capacity(c) => c.stream_id,
        }
    }

    /// Closes the parked channel halves, so the downstream side observes
    /// the stream as gone. The future stays pollable and resolves promptly.
    pub(crate) fn disconnect(&mut self) {
        match self {
            Self::Event(e) =>
                if let Some(chan) = e.chan.as_mut() {
                    chan.close();
                },
            Self::Capacity(c) =>
                if let Some(chan) = c.chan.as_mut() {
                    chan.close();
                },
        }
    }
}

pub(crate) struct WaitForResponseEvent {
    pub(crate) stream_id: u64,
    pub(crate) chan: Option<mpsc::Receiver<DownstreamEvent>>,
}

pub(crate) struct ReceivedResponseEvent {
    pub(crate) stream_id: u64,
    pub(crate) chan: mpsc::Receiver<DownstreamEvent>,
    /// `None` means the downstream hung up without a reset event.
    pub(crate) event: Option<DownstreamEvent>,
}

impl Future for WaitForResponseEvent {
    type Output = ReceivedResponseEvent;

    fn poll(
        mut self: Pin<&mut Self>, cx: &mut Context<'_>,
    ) -> Poll<Self::Output> {
        // Unwraps are fine: chan is only None after the first Poll::Ready,
        // and these futures are never polled afterwards.
        self.chan.as_mut().unwrap().poll_recv(cx).map(|event| {
            ReceivedResponseEvent {
                stream_id: self.stream_id,
                chan: self.chan.take().unwrap(),
                event,
            }
        })
    }
}

pub(crate) struct WaitForBodyCapacity {
    pub(crate) stream_id: u64,
    pub(crate) chan: Option<PollSender<BodyChunk>>,
}

pub(crate) struct HaveBodyCapacity {
    pub(crate) stream_id: u64,
    pub(crate) chan: PollSender<BodyChunk>,
}

impl Future for WaitForBodyCapacity {
    type Output = HaveBodyCapacity;

    fn poll(
        mut self: Pin<&mut Self>, cx: &mut Context<'_>,
    ) -> Poll<Self::Output> {
        match self.chan.as_mut().unwrap().poll_reserve(cx) {
            Poll::Ready(_) => Poll::Ready(HaveBodyCapacity {
                stream_id: self.stream_id,
                chan: self.chan.take().unwrap(),
            }),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buf_factory::BufFactory;

    fn buf(bytes: &[u8]) -> PooledBuf {
        BufFactory::buf_from_slice(bytes)
    }

    #[test]
    fn ring_tracks_resident_and_total_bytes() {
        let mut ring = BodyRing::default();
        assert!(ring.is_empty());

        ring.append(buf(b"hello"));
        ring.append(buf(b" world"));
        assert_eq!(ring.len(), 11);
        assert_eq!(ring.appended(), 11);

        ring.drain(11);
        assert!(ring.is_empty());
        assert_eq!(ring.appended(), 11);
    }

    #[test]
    fn ring_drains_across_chunk_boundaries() {
        let mut ring = BodyRing::default();
        ring.append(buf(b"abc"));
        ring.append(buf(b"defgh"));

        ring.drain(4);
        assert_eq!(ring.len(), 4);
        assert_eq!(ring.front().unwrap(), b"efgh");

        ring.drain(4);
        assert!(ring.front().is_none());
    }

    #[test]
    fn ring_ignores_empty_chunks() {
        let mut ring = BodyRing::default();
        ring.append(buf(b""));
        assert!(ring.is_empty());
        assert_eq!(ring.appended(), 0);
    }

    #[test]
    fn ring_watermark_gates_reads() {
        let mut ring = BodyRing::default();
        assert!(ring.has_room());

        while ring.len() < RESPONSE_BODY_HIGH_WATERMARK {
            ring.append(buf(&[0; 4096]));
        }
        assert!(!ring.has_room());

        ring.drain(4096);
        assert!(ring.has_room());
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "drained more than the ring holds")]
    fn ring_overdrain_asserts() {
        let mut ring = BodyRing::default();
        ring.append(buf(b"abc"));
        ring.drain(4);
    }

    #[tokio::test]
    async fn downstream_attach_detach() {
        let head = RequestHead {
            method: b"GET".to_vec(),
            scheme: Some(b"https".to_vec()),
            authority: Some(b"example.org".to_vec()),
            path: b"/".to_vec(),
            headers: Vec::new(),
            content_length: Some(0),
            connect_protocol: false,
            expect_body: false,
            peer_addr: "127.0.0.1:4433".parse().unwrap(),
        };

        let mut downstream = Downstream::new(0, head);
        assert_eq!(downstream.dispatch_state, DispatchState::Pending);
        assert_eq!(downstream.response_state(), ResponseState::Initial);

        let (dconn, backend) = DownstreamConnection::pair();
        downstream.attach(dconn);
        assert!(downstream.body_tx.is_some());

        downstream.detach();
        drop(downstream);

        // The backend sees both halves close.
        let mut backend = backend;
        assert!(backend.body_rx.recv().await.is_none());
        assert!(backend.events_tx.is_closed());
    }
}
