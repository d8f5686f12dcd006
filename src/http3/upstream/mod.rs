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

//! The per-connection upstream state machine.
//!
//! [`UpstreamDriver`] glues four things together: the QUIC transport's
//! packet and timer callbacks (delivered through the
//! [`UpstreamApplication`] seam), the HTTP/3 framing layer on top of it, the
//! bounded [`DownstreamQueue`] of in-flight requests bridged to backend
//! connections, and the connection's shutdown lifecycle.

mod downstream;
mod headers;
mod queue;

use std::sync::Arc;

use foundations::telemetry::log;
use futures::FutureExt;
use futures_util::stream::FuturesUnordered;
use quiche::h3;
use tokio::select;
use tokio::sync::mpsc::error::TrySendError;
use tokio_stream::StreamExt;

use self::downstream::DispatchState;
use self::downstream::Downstream;
use self::downstream::DownstreamReady;
use self::downstream::HaveBodyCapacity;
use self::downstream::ReceivedResponseEvent;
use self::downstream::ResponseState;
use self::downstream::WaitForDownstream;
use self::downstream::MAX_BODY_CHUNKS_PER_WRITE;
use self::queue::DownstreamQueue;
use crate::buf_factory::BufFactory;
use crate::buf_factory::PooledBuf;
use crate::downstream::BodyChunk;
use crate::downstream::DispatchError;
use crate::downstream::DownstreamDispatcher;
use crate::downstream::DownstreamEvent;
use crate::downstream::RequestHead;
use crate::downstream::ResponseHead;
use crate::http3::settings::Http3Settings;
use crate::http3::settings::Http3SettingsEnforcer;
use crate::http3::settings::Http3TimeoutType;
use crate::metrics::labels;
use crate::metrics::Metrics;
use crate::quic::io::connection_stage::conservative_pto;
use crate::quic::HandshakeInfo;
use crate::quic::UpstreamApplication;
use crate::settings::ProxySettings;
use crate::settings::RequestHook;
use crate::settings::RequestVerdict;
use crate::QuicResult;

pub(crate) use self::headers::RequestError;

/// GOAWAY stream ID used for the shutdown notice: larger than any stream the
/// peer could open, signalling "wrap up, a real limit follows".
const SHUTDOWN_NOTICE_STREAM_ID: u64 = (1 << 62) - 4;

/// Grace between the shutdown notice and the final GOAWAY, as a multiple of
/// the path's PTO.
const SHUTDOWN_PTO_FACTOR: u32 = 3;

/// A fatal error on the upstream connection.
///
/// The kind decides whether the final CONNECTION_CLOSE is transport- or
/// application-level.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    /// The HTTP/3 layer failed irrecoverably.
    #[error("HTTP/3 error: {0}")]
    H3(h3::Error),
    /// Transport-level close with the given error code.
    #[error("transport error code {0}")]
    Transport(u64),
    /// Application-level close with the given error code.
    #[error("application error code {0}")]
    Application(u64),
    /// TLS alert captured during the handshake.
    #[error("TLS alert {0}")]
    TlsAlert(u8),
    /// No request arrived within the post-accept timeout.
    #[error("no request received after handshake")]
    PostAcceptTimeout,
}

impl From<h3::Error> for UpstreamError {
    fn from(err: h3::Error) -> Self {
        UpstreamError::H3(err)
    }
}

/// Progress of the connection's graceful shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShutdownPhase {
    /// Normal operation.
    Running,
    /// The shutdown notice went out; new requests are rejected.
    NoticeSent,
    /// The final GOAWAY went out; the connection closes once drained.
    GoAwaySent,
}

/// The HTTP/3 reverse-proxy application for one client connection.
///
/// Constructed per accepted connection and passed to
/// [`InitialQuicConnection::start`](crate::InitialQuicConnection::start).
pub struct UpstreamDriver {
    /// Configuration used to initialize `conn`.
    h3_config: h3::Config,
    /// The underlying HTTP/3 connection, created once the QUIC handshake
    /// completes.
    conn: Option<h3::Connection>,

    settings: Arc<ProxySettings>,
    enforcer: Http3SettingsEnforcer,
    dispatcher: Arc<dyn DownstreamDispatcher>,
    request_hook: Option<Arc<dyn RequestHook>>,

    /// All in-flight requests on this connection.
    queue: DownstreamQueue,
    /// Parked futures waiting on downstream channels: response events when
    /// the ring has room, and request-body capacity.
    waiting: FuturesUnordered<WaitForDownstream>,

    /// The buffer shared with the I/O worker for outbound packets.
    pooled_buf: PooledBuf,
    /// The maximum request stream ID seen on this connection.
    max_stream_seen: u64,
    /// Requests accepted on this connection.
    requests: u64,

    shutdown_phase: ShutdownPhase,
    post_accept_timeout_key: Option<crate::http3::settings::TimeoutKey>,

    /// The client's address, captured from the active path once the
    /// handshake completes.
    peer_addr: Option<std::net::SocketAddr>,
}

impl UpstreamDriver {
    pub fn new(
        http3_settings: Http3Settings, settings: Arc<ProxySettings>,
        dispatcher: Arc<dyn DownstreamDispatcher>,
        request_hook: Option<Arc<dyn RequestHook>>,
    ) -> Self {
        let mut http3_settings = http3_settings;
        if settings.forward_proxy {
            // RFC 9220 tunnelling is not offered on a forward proxy.
            http3_settings.enable_connect_protocol = false;
        }

        Self {
            h3_config: (&http3_settings).into(),
            conn: None,
            enforcer: (&http3_settings).into(),
            queue: DownstreamQueue::new(&settings),
            settings,
            dispatcher,
            request_hook,
            waiting: FuturesUnordered::new(),
            pooled_buf: BufFactory::get_max_buf(),
            max_stream_seen: 0,
            requests: 0,
            shutdown_phase: ShutdownPhase::Running,
            post_accept_timeout_key: None,
            peer_addr: None,
        }
    }

    fn peer_addr(&self) -> std::net::SocketAddr {
        use std::net::Ipv6Addr;

        self.peer_addr
            .unwrap_or_else(|| (Ipv6Addr::UNSPECIFIED, 0).into())
    }

    fn conn_mut(&mut self) -> QuicResult<&mut h3::Connection> {
        self.conn
            .as_mut()
            .ok_or_else(|| UpstreamError::H3(h3::Error::InternalError).into())
    }

    /// Restarts the watchdog for `stream_id`; any downstream progress resets
    /// the clock.
    fn arm_request_timeout(&mut self, stream_id: u64) {
        let Some(timeout) = self.settings.request_timeout else {
            return;
        };
        let Some(downstream) = self.queue.get_mut(stream_id) else {
            return;
        };

        if let Some(key) = downstream.timeout_key.take() {
            self.enforcer.cancel_timeout(key);
        }

        let key = self
            .enforcer
            .add_timeout(Http3TimeoutType::Request(stream_id), timeout);
        // Borrow again: add_timeout needed the enforcer exclusively.
        if let Some(downstream) = self.queue.get_mut(stream_id) {
            downstream.timeout_key = Some(key);
        }
    }

    fn disarm_request_timeout(&mut self, stream_id: u64) {
        if let Some(key) = self
            .queue
            .get_mut(stream_id)
            .and_then(|d| d.timeout_key.take())
        {
            self.enforcer.cancel_timeout(key);
        }
    }

    /// Handles one HEADERS section from the peer.
    fn handle_request(
        &mut self, qconn: &mut quiche::Connection, stream_id: u64,
        headers: Vec<h3::Header>, has_body: bool,
    ) -> QuicResult<()> {
        self.max_stream_seen = self.max_stream_seen.max(stream_id);

        // A later HEADERS section on a known stream is the request's
        // trailers. The same bounds apply as for the request section, but an
        // over-limit trailer field is dropped on its own instead of failing
        // the request. The kept fields ride the final body chunk downstream.
        if self.queue.contains(stream_id) {
            let trailers = headers::clip_trailers(headers, &self.settings);
            if let Some(downstream) = self.queue.get_mut(stream_id) {
                if !downstream.req_fin_sent {
                    downstream.request_trailers = trailers;
                }
            }
            return Ok(());
        }

        if self.shutdown_phase != ShutdownPhase::Running {
            // Streams opened after the shutdown notice are rejected so the
            // client retries them on a fresh connection.
            let code = h3::WireErrorCode::RequestRejected as u64;
            let _ =
                qconn.stream_shutdown(stream_id, quiche::Shutdown::Read, code);
            let _ =
                qconn.stream_shutdown(stream_id, quiche::Shutdown::Write, code);
            return Ok(());
        }

        if let Some(key) = self.post_accept_timeout_key.take() {
            self.enforcer.cancel_timeout(key);
        }

        if self.enforcer.enforce_requests_limit(self.requests) {
            // The connection served its quota: wind it down gracefully and
            // bounce this request to a fresh connection.
            self.start_graceful_shutdown(qconn);

            let code = h3::WireErrorCode::RequestRejected as u64;
            let _ =
                qconn.stream_shutdown(stream_id, quiche::Shutdown::Read, code);
            let _ =
                qconn.stream_shutdown(stream_id, quiche::Shutdown::Write, code);
            return Ok(());
        }

        self.requests += 1;

        let head = match headers::parse_request(
            headers,
            has_body,
            self.peer_addr(),
            &self.settings,
        ) {
            Ok(head) => head,
            Err(RequestError::HeaderLimits) => {
                return self.refuse_request(
                    qconn,
                    stream_id,
                    431,
                    labels::LocalReply::HeaderFieldsTooLarge,
                );
            },
            Err(RequestError::BadRequest) => {
                return self.refuse_request(
                    qconn,
                    stream_id,
                    400,
                    labels::LocalReply::BadRequest,
                );
            },
            Err(RequestError::MissingAuthority) => {
                let code = h3::WireErrorCode::GeneralProtocolError as u64;
                let _ = qconn.stream_shutdown(
                    stream_id,
                    quiche::Shutdown::Read,
                    code,
                );
                let _ = qconn.stream_shutdown(
                    stream_id,
                    quiche::Shutdown::Write,
                    code,
                );
                return Ok(());
            },
        };

        let mut downstream = Downstream::new(stream_id, head);
        downstream.req_fin_recv = !downstream.request.expect_body;

        if let Some(hook) = self.request_hook.clone() {
            match hook.on_request_headers(&mut downstream.request) {
                RequestVerdict::Forward => {},
                RequestVerdict::Respond {
                    status,
                    headers,
                    body,
                } => {
                    self.queue.add_pending(downstream);
                    return self.synthesize_reply(
                        qconn, stream_id, status, headers, body,
                    );
                },
            }
        }

        self.queue.add_pending(downstream);
        self.start_downstream(qconn, stream_id)
    }

    /// Admits a pending request or parks it as blocked.
    fn start_downstream(
        &mut self, qconn: &mut quiche::Connection, stream_id: u64,
    ) -> QuicResult<()> {
        let Some(downstream) = self.queue.get(stream_id) else {
            return Ok(());
        };

        if self
            .queue
            .can_activate(downstream.request.authority.as_deref())
        {
            self.initiate_downstream(qconn, stream_id)
        } else {
            self.queue.mark_blocked(stream_id);
            Ok(())
        }
    }

    /// Obtains a downstream connection for the request and wires it up.
    fn initiate_downstream(
        &mut self, qconn: &mut quiche::Connection, stream_id: u64,
    ) -> QuicResult<()> {
        let Some(downstream) = self.queue.get_mut(stream_id) else {
            return Ok(());
        };

        let dconn = match self.dispatcher.dispatch(&downstream.request) {
            Ok(dconn) => dconn,
            Err(DispatchError::TlsRequired) => {
                let location =
                    headers::https_redirect_location(&downstream.request);
                return match location {
                    Some(location) => self.local_reply(
                        qconn,
                        stream_id,
                        308,
                        Some(location),
                        labels::LocalReply::HttpsRedirect,
                    ),
                    None => self.local_reply(
                        qconn,
                        stream_id,
                        502,
                        None,
                        labels::LocalReply::BadGateway,
                    ),
                };
            },
            Err(DispatchError::Unavailable(e)) => {
                log::debug!(
                    "downstream dispatch failed";
                    "stream_id" => stream_id,
                    "error" => %e
                );
                return self.local_reply(
                    qconn,
                    stream_id,
                    502,
                    None,
                    labels::LocalReply::BadGateway,
                );
            },
        };

        if let Some(hook) = &self.request_hook {
            hook.on_downstream_selected(&mut downstream.request);
        }

        downstream.attach(dconn);
        self.queue.mark_active(stream_id);

        let downstream = self.queue.get_mut(stream_id).unwrap();

        // The response side starts listening immediately.
        self.waiting.push(downstream.wait_for_event(stream_id));

        // With no request body coming, tell the backend right away.
        let downstream = self.queue.get_mut(stream_id).unwrap();
        if downstream.req_fin_recv && !downstream.req_fin_sent {
            self.forward_request_body(qconn, stream_id)?;
        }

        self.arm_request_timeout(stream_id);

        Ok(())
    }

    /// Replies with a local status and stops reading the request.
    fn local_reply(
        &mut self, qconn: &mut quiche::Connection, stream_id: u64, status: u16,
        location: Option<Vec<u8>>, label: labels::LocalReply,
    ) -> QuicResult<()> {
        let headers = headers::local_reply_headers(
            status,
            &self.settings,
            location.as_deref(),
        );

        self.synthesized_reply_with(qconn, stream_id, headers, Vec::new(), label)
    }

    fn refuse_request(
        &mut self, qconn: &mut quiche::Connection, stream_id: u64, status: u16,
        label: labels::LocalReply,
    ) -> QuicResult<()> {
        // The stream was never admitted; register it only to carry the
        // error reply out.
        let head = RequestHead {
            method: Vec::new(),
            scheme: None,
            authority: None,
            path: Vec::new(),
            headers: Vec::new(),
            content_length: Some(0),
            connect_protocol: false,
            expect_body: false,
            peer_addr: self.peer_addr(),
        };
        self.queue.add_pending(Downstream::new(stream_id, head));

        let headers =
            headers::local_reply_headers(status, &self.settings, None);
        self.synthesized_reply_with(qconn, stream_id, headers, Vec::new(), label)
    }

    /// A reply produced by the request hook.
    fn synthesize_reply(
        &mut self, qconn: &mut quiche::Connection, stream_id: u64, status: u16,
        headers: Vec<(Vec<u8>, Vec<u8>)>, body: Vec<u8>,
    ) -> QuicResult<()> {
        let mut list = vec![h3::Header::new(
            b":status",
            status.to_string().as_bytes(),
        )];
        list.extend(
            headers
                .iter()
                .map(|(name, value)| h3::Header::new(name, value)),
        );
        list.push(h3::Header::new(
            b"content-length",
            body.len().to_string().as_bytes(),
        ));

        self.synthesized_reply_with(
            qconn,
            stream_id,
            list,
            body,
            labels::LocalReply::Scripted,
        )
    }

    fn synthesized_reply_with(
        &mut self, qconn: &mut quiche::Connection, stream_id: u64,
        headers: Vec<h3::Header>, body: Vec<u8>, label: labels::LocalReply,
    ) -> QuicResult<()> {
        crate::metrics::ingress_metrics::local_reply_count(label).inc();

        let Some(downstream) = self.queue.get_mut(stream_id) else {
            return Ok(());
        };

        downstream.detach();
        downstream.pending_headers = Some((headers, body.is_empty()));
        if !body.is_empty() {
            downstream
                .response
                .body
                .append(BufFactory::buf_from_slice(&body));
        }
        downstream.response.complete = true;
        self.queue.mark_failed(stream_id);

        // Whatever request body follows is irrelevant now.
        let _ = qconn.stream_shutdown(
            stream_id,
            quiche::Shutdown::Read,
            h3::WireErrorCode::NoError as u64,
        );

        self.process_writable_stream(qconn, stream_id)
    }

    /// Moves request body bytes from the HTTP/3 stream into the downstream
    /// channel, respecting its capacity.
    fn forward_request_body(
        &mut self, qconn: &mut quiche::Connection, stream_id: u64,
    ) -> QuicResult<()> {
        // Split borrows between the h3 connection and the queue.
        let Some(conn) = self.conn.as_mut() else {
            return Ok(());
        };
        let Some(downstream) = self.queue.get_mut(stream_id) else {
            // Stream already gone; drain what quiche buffered so connection
            // flow control stays accurate.
            let mut scratch = BufFactory::get_max_buf();
            while conn.recv_body(qconn, stream_id, &mut scratch).is_ok() {}
            return Ok(());
        };

        if downstream.dispatch_state != DispatchState::Active {
            // Not dispatched yet (blocked); body stays in quiche's buffers
            // and stream flow control applies backpressure.
            return Ok(());
        }

        enum BodyStatus {
            Done,
            Blocked,
            DownstreamGone,
        }

        let status = loop {
            let Some(sender) =
                downstream.body_tx.as_ref().and_then(|tx| tx.get_ref())
            else {
                // Already waiting for capacity.
                break BodyStatus::Done;
            };

            let permit = match sender.try_reserve() {
                Ok(permit) => permit,
                Err(TrySendError::Closed(())) => break BodyStatus::DownstreamGone,
                Err(TrySendError::Full(())) => {
                    if downstream.req_fin_recv ||
                        qconn.stream_readable(stream_id)
                    {
                        break BodyStatus::Blocked;
                    }
                    break BodyStatus::Done;
                },
            };

            if downstream.req_fin_recv && !downstream.req_fin_sent {
                let all_read = !qconn.stream_readable(stream_id);
                if all_read {
                    permit.send(BodyChunk {
                        data: BufFactory::get_empty_buf(),
                        fin: true,
                        trailers: std::mem::take(
                            &mut downstream.request_trailers,
                        ),
                    });
                    downstream.req_fin_sent = true;
                    break BodyStatus::Done;
                }
            }

            match conn.recv_body(qconn, stream_id, &mut self.pooled_buf) {
                Ok(n) => {
                    let mut data = std::mem::replace(
                        &mut self.pooled_buf,
                        BufFactory::get_max_buf(),
                    );
                    data.truncate(n);

                    downstream.body_consumed += n as u64;
                    downstream.audit_stats.add_bytes_recvd(n as u64);
                    permit.send(BodyChunk {
                        data,
                        fin: false,
                        trailers: Vec::new(),
                    });
                },
                Err(h3::Error::Done) => {
                    if downstream.req_fin_recv && !downstream.req_fin_sent {
                        permit.send(BodyChunk {
                            data: BufFactory::get_empty_buf(),
                            fin: true,
                            trailers: std::mem::take(
                                &mut downstream.request_trailers,
                            ),
                        });
                        downstream.req_fin_sent = true;
                    }
                    break BodyStatus::Done;
                },
                Err(_) => {
                    break BodyStatus::DownstreamGone;
                },
            }
        };

        match status {
            BodyStatus::Done => {},
            BodyStatus::Blocked => {
                let wait = downstream.wait_for_body_capacity(stream_id);
                self.waiting.push(wait);
            },
            BodyStatus::DownstreamGone => {
                // The backend stopped consuming. Stop the client's upload,
                // but keep serving whatever response is in flight. Body
                // bytes already read above stay credited to flow control.
                let _ = qconn.stream_shutdown(
                    stream_id,
                    quiche::Shutdown::Read,
                    h3::WireErrorCode::InternalError as u64,
                );
                downstream
                    .audit_stats
                    .set_sent_stop_sending_error_code(
                        h3::WireErrorCode::InternalError as i64,
                    );
            },
        }

        Ok(())
    }

    /// The client finished its request body.
    fn handle_request_fin(
        &mut self, qconn: &mut quiche::Connection, stream_id: u64,
    ) -> QuicResult<()> {
        let Some(downstream) = self.queue.get_mut(stream_id) else {
            return Ok(());
        };

        if downstream.req_fin_recv && downstream.req_fin_sent {
            return Ok(());
        }
        downstream.req_fin_recv = true;

        self.forward_request_body(qconn, stream_id)
    }

    /// Dispatches one resolved downstream future.
    fn handle_downstream_ready(
        &mut self, qconn: &mut quiche::Connection, ready: DownstreamReady,
    ) -> QuicResult<()> {
        match ready {
            DownstreamReady::Event(ev) => self.handle_response_event(qconn, ev),
            DownstreamReady::Capacity(cap) =>
                self.handle_body_capacity(qconn, cap),
        }
    }

    fn handle_body_capacity(
        &mut self, qconn: &mut quiche::Connection, cap: HaveBodyCapacity,
    ) -> QuicResult<()> {
        let HaveBodyCapacity {
            stream_id,
            mut chan,
        } = cap;

        match self.queue.get_mut(stream_id) {
            None => Ok(()),
            Some(downstream) => {
                chan.abort_send(); // Release the reserved permit.
                downstream.body_tx = Some(chan);
                self.forward_request_body(qconn, stream_id)
            },
        }
    }

    fn handle_response_event(
        &mut self, qconn: &mut quiche::Connection, ev: ReceivedResponseEvent,
    ) -> QuicResult<()> {
        let ReceivedResponseEvent {
            stream_id,
            chan,
            event,
        } = ev;

        let Some(downstream) = self.queue.get_mut(stream_id) else {
            return Ok(());
        };
        downstream.events_rx = Some(chan);

        match event {
            None => {
                // Downstream hung up without a proper event.
                return self.on_downstream_reset(qconn, stream_id, false);
            },
            Some(DownstreamEvent::Headers(head)) => {
                self.on_downstream_header_complete(qconn, stream_id, head)?;
            },
            Some(DownstreamEvent::Body { data, flush }) => {
                self.on_downstream_body(qconn, stream_id, data, flush)?;
            },
            Some(DownstreamEvent::Finished { trailers }) => {
                return self.on_downstream_body_complete(
                    qconn, stream_id, trailers,
                );
            },
            Some(DownstreamEvent::Reset { no_retry }) => {
                return self.on_downstream_reset(qconn, stream_id, no_retry);
            },
        }

        self.rearm_response_events(stream_id);

        Ok(())
    }

    /// Parks a fresh event wait for the stream, unless the ring is above its
    /// watermark (reads resume once acks drain it).
    fn rearm_response_events(&mut self, stream_id: u64) {
        let Some(downstream) = self.queue.get_mut(stream_id) else {
            return;
        };

        if downstream.events_rx.is_none() || downstream.response.complete {
            return;
        }

        if downstream.response.body.has_room() {
            let wait = downstream.wait_for_event(stream_id);
            self.waiting.push(wait);
        }
    }

    /// The backend's response head is complete; rewrite and submit it.
    fn on_downstream_header_complete(
        &mut self, qconn: &mut quiche::Connection, stream_id: u64,
        head: ResponseHead,
    ) -> QuicResult<()> {
        let settings = Arc::clone(&self.settings);
        let Some(downstream) = self.queue.get_mut(stream_id) else {
            return Ok(());
        };

        let response_headers = headers::build_response_headers(
            &head,
            downstream.request.connect_protocol,
            downstream.affinity_token.as_deref(),
            &settings,
        );

        downstream.response.status = Some(head.status);
        downstream.response.content_length = head.content_length;
        downstream.pending_headers =
            Some((response_headers, !head.has_body));
        if !head.has_body {
            downstream.response.complete = true;
        }

        self.arm_request_timeout(stream_id);
        self.process_writable_stream(qconn, stream_id)
    }

    /// A chunk of response body arrived from the backend.
    fn on_downstream_body(
        &mut self, qconn: &mut quiche::Connection, stream_id: u64,
        data: PooledBuf, flush: bool,
    ) -> QuicResult<()> {
        let Some(downstream) = self.queue.get_mut(stream_id) else {
            return Ok(());
        };

        downstream.response.body.append(data);

        if flush {
            self.arm_request_timeout(stream_id);
            return self.process_writable_stream(qconn, stream_id);
        }

        Ok(())
    }

    /// The backend finished the response.
    fn on_downstream_body_complete(
        &mut self, qconn: &mut quiche::Connection, stream_id: u64,
        trailers: Vec<h3::Header>,
    ) -> QuicResult<()> {
        let Some(downstream) = self.queue.get_mut(stream_id) else {
            return Ok(());
        };

        // A backend that lied about its length corrupts message framing;
        // the stream dies with a protocol error and the exchange is marked
        // connection-close for the access log.
        let produced = downstream.response.body.appended();
        if let Some(declared) = downstream.response.content_length {
            if produced != declared {
                log::debug!(
                    "response body length mismatch";
                    "stream_id" => stream_id,
                    "declared" => declared,
                    "produced" => produced
                );
                downstream.response.connection_close = true;

                let code = h3::WireErrorCode::GeneralProtocolError as u64;
                return self.finish_stream(
                    qconn,
                    stream_id,
                    Some(code),
                    Some(code),
                );
            }
        }

        downstream.response.trailers = trailers;
        downstream.response.complete = true;
        downstream.detach();
        self.disarm_request_timeout(stream_id);

        self.process_writable_stream(qconn, stream_id)
    }

    /// The downstream connection died; retry or give up.
    fn on_downstream_reset(
        &mut self, qconn: &mut quiche::Connection, stream_id: u64,
        no_retry: bool,
    ) -> QuicResult<()> {
        let Some(downstream) = self.queue.get_mut(stream_id) else {
            return Ok(());
        };

        if downstream.response.complete {
            // Everything the client gets is already buffered; keep draining.
            downstream.detach();
            return Ok(());
        }

        downstream.detach();
        downstream.retries += 1;

        // A retry must replay the request from the top; a partially
        // forwarded body cannot be reproduced.
        let body_unreplayable =
            downstream.body_consumed > 0 && downstream.request.expect_body;

        let out_of_retries =
            downstream.retries > self.settings.max_downstream_retries;

        if no_retry || out_of_retries || body_unreplayable {
            if downstream.response_state() == ResponseState::Initial {
                // Nothing sent yet: the client gets a real reply.
                return self.local_reply(
                    qconn,
                    stream_id,
                    502,
                    None,
                    labels::LocalReply::BadGateway,
                );
            }

            // Mid-response there is nothing useful left to say; reject the
            // stream so the client knows it may retry.
            let code = h3::WireErrorCode::RequestRejected as u64;
            return self.finish_stream(qconn, stream_id, Some(code), Some(code));
        }

        crate::metrics::ingress_metrics::downstream_retry_count().inc();
        log::debug!(
            "re-dispatching request after downstream reset";
            "stream_id" => stream_id,
            "attempt" => downstream.retries
        );

        self.initiate_downstream(qconn, stream_id)
    }

    /// Flushes pending headers, body and FIN for a stream into the HTTP/3
    /// connection, as far as stream capacity allows.
    fn process_writable_stream(
        &mut self, qconn: &mut quiche::Connection, stream_id: u64,
    ) -> QuicResult<()> {
        let Some(conn) = self.conn.as_mut() else {
            return Ok(());
        };
        let Some(downstream) = self.queue.get_mut(stream_id) else {
            return Ok(());
        };

        // 1. Response headers.
        if let Some((headers, fin)) = downstream.pending_headers.take() {
            match conn.send_response(qconn, stream_id, &headers, fin) {
                Ok(()) => {
                    downstream.set_response_state(if fin {
                        downstream.fin_sent = true;
                        ResponseState::Complete
                    } else {
                        ResponseState::HeadersSent
                    });
                },
                Err(h3::Error::StreamBlocked | h3::Error::Done) => {
                    downstream.pending_headers = Some((headers, fin));
                    return Ok(());
                },
                Err(h3::Error::TransportError(
                    quiche::Error::StreamStopped(e),
                )) => {
                    downstream
                        .audit_stats
                        .set_recvd_stop_sending_error_code(e as i64);
                    return self.finish_stream(qconn, stream_id, Some(e), None);
                },
                Err(_) => {
                    let code = h3::WireErrorCode::InternalError as u64;
                    return self.finish_stream(
                        qconn,
                        stream_id,
                        Some(code),
                        Some(code),
                    );
                },
            }
        }

        // 2. Buffered response body, a bounded number of chunks per visit.
        let mut wrote_chunks = 0;
        while wrote_chunks < MAX_BODY_CHUNKS_PER_WRITE {
            let Some(chunk) = downstream.response.body.front() else {
                break;
            };
            let chunk_len = chunk.len();

            match conn.send_body(qconn, stream_id, chunk, false) {
                Ok(n) => {
                    // The transport accepted exactly n bytes; the ring
                    // drains by the same amount (asserted inside).
                    downstream.response.body.drain(n);
                    downstream.audit_stats.add_bytes_sent(n as u64);
                    wrote_chunks += 1;

                    if n < chunk_len {
                        break;
                    }
                },
                Err(h3::Error::Done | h3::Error::StreamBlocked) => break,
                Err(h3::Error::TransportError(
                    quiche::Error::StreamStopped(e),
                )) => {
                    downstream
                        .audit_stats
                        .set_recvd_stop_sending_error_code(e as i64);
                    return self.finish_stream(qconn, stream_id, Some(e), None);
                },
                Err(_) => {
                    let code = h3::WireErrorCode::InternalError as u64;
                    return self.finish_stream(
                        qconn,
                        stream_id,
                        Some(code),
                        Some(code),
                    );
                },
            }
        }

        // 3. End of response: trailers or a bare FIN.
        if downstream.response.complete &&
            downstream.response.body.is_empty() &&
            !downstream.fin_sent
        {
            let res = if downstream.response.trailers.is_empty() {
                conn.send_body(qconn, stream_id, &[], true).map(|_| ())
            } else {
                conn.send_additional_headers(
                    qconn,
                    stream_id,
                    &downstream.response.trailers,
                    true,
                    true,
                )
            };

            match res {
                Ok(()) => {
                    downstream.fin_sent = true;
                    downstream.set_response_state(ResponseState::Complete);
                },
                Err(h3::Error::Done | h3::Error::StreamBlocked) => {},
                Err(_) => {
                    let code = h3::WireErrorCode::InternalError as u64;
                    return self.finish_stream(
                        qconn,
                        stream_id,
                        Some(code),
                        Some(code),
                    );
                },
            }
        }

        // Acked data drained ring space; resume downstream reads.
        self.rearm_response_events(stream_id);

        self.maybe_cleanup_stream(qconn, stream_id)
    }

    /// Retires a stream whose response is fully on the wire.
    fn maybe_cleanup_stream(
        &mut self, qconn: &mut quiche::Connection, stream_id: u64,
    ) -> QuicResult<()> {
        let Some(downstream) = self.queue.get(stream_id) else {
            return Ok(());
        };

        if !downstream.fin_sent {
            return Ok(());
        }

        // The response is done. If the client is still uploading, half-close
        // the read side; the request is over.
        if !downstream.req_fin_recv {
            let _ = qconn.stream_shutdown(
                stream_id,
                quiche::Shutdown::Read,
                h3::WireErrorCode::NoError as u64,
            );
        }

        self.remove_stream(qconn, stream_id)
    }

    /// Shuts down a stream with the given error codes and removes it.
    fn finish_stream(
        &mut self, qconn: &mut quiche::Connection, stream_id: u64,
        read: Option<u64>, write: Option<u64>,
    ) -> QuicResult<()> {
        if let Some(downstream) = self.queue.get(stream_id) {
            if let Some(err) = read {
                downstream
                    .audit_stats
                    .set_sent_stop_sending_error_code(err as i64);
                let _ = qconn.stream_shutdown(
                    stream_id,
                    quiche::Shutdown::Read,
                    err,
                );
            }

            if let Some(err) = write {
                downstream
                    .audit_stats
                    .set_sent_reset_stream_error_code(err as i64);
                let _ = qconn.stream_shutdown(
                    stream_id,
                    quiche::Shutdown::Write,
                    err,
                );
            }
        }

        self.remove_stream(qconn, stream_id)
    }

    /// Drops a stream's state and promotes the next blocked request.
    fn remove_stream(
        &mut self, qconn: &mut quiche::Connection, stream_id: u64,
    ) -> QuicResult<()> {
        self.disarm_request_timeout(stream_id);
        let (removed, promote) = self.queue.remove(stream_id);

        if removed.is_some() {
            // Disconnect any parked futures so the downstream side observes
            // the stream as gone.
            for pending in self.waiting.iter_mut() {
                if pending.stream_id() == stream_id {
                    pending.disconnect();
                }
            }
        }

        if let Some(promote) = promote {
            self.start_downstream(qconn, promote)?;
        }

        self.maybe_close_when_drained(qconn);

        Ok(())
    }

    /// Submits the shutdown notice and schedules the final GOAWAY.
    fn start_graceful_shutdown(&mut self, qconn: &mut quiche::Connection) {
        if self.shutdown_phase != ShutdownPhase::Running {
            return;
        }

        let Ok(conn) = self.conn_mut() else {
            return;
        };

        if let Err(e) = conn.send_goaway(qconn, SHUTDOWN_NOTICE_STREAM_ID) {
            log::debug!("failed to send shutdown notice"; "error" => %e);
        }

        self.shutdown_phase = ShutdownPhase::NoticeSent;
        self.enforcer.add_timeout(
            Http3TimeoutType::Shutdown,
            SHUTDOWN_PTO_FACTOR * conservative_pto(qconn),
        );

        log::debug!(
            "starting graceful shutdown";
            "scid" => format!("{:?}", qconn.source_id())
        );
    }

    /// Sends the final GOAWAY after the shutdown grace period.
    fn finish_graceful_shutdown(
        &mut self, qconn: &mut quiche::Connection,
    ) -> QuicResult<()> {
        if self.shutdown_phase != ShutdownPhase::NoticeSent {
            return Ok(());
        }

        let max_stream_seen = self.max_stream_seen;
        let conn = self.conn_mut()?;
        if let Err(e) = conn.send_goaway(qconn, max_stream_seen) {
            log::debug!("failed to send final GOAWAY"; "error" => %e);
        }

        self.shutdown_phase = ShutdownPhase::GoAwaySent;
        self.maybe_close_when_drained(qconn);

        Ok(())
    }

    /// Closes the connection once the final GOAWAY is out and all requests
    /// have drained.
    fn maybe_close_when_drained(&mut self, qconn: &mut quiche::Connection) {
        if self.shutdown_phase == ShutdownPhase::GoAwaySent &&
            self.queue.is_empty()
        {
            let _ =
                qconn.close(true, h3::WireErrorCode::NoError as u64, &[]);
        }
    }

    fn handle_timeout(
        &mut self, qconn: &mut quiche::Connection, timeout: Http3TimeoutType,
    ) -> QuicResult<()> {
        match timeout {
            Http3TimeoutType::PostAccept => {
                log::debug!(
                    "closing connection: no request after handshake";
                    "scid" => format!("{:?}", qconn.source_id())
                );
                qconn.close(true, h3::WireErrorCode::NoError as u64, &[])?;
                Err(UpstreamError::PostAcceptTimeout.into())
            },
            Http3TimeoutType::Shutdown => self.finish_graceful_shutdown(qconn),
            Http3TimeoutType::Request(stream_id) => {
                let Some(downstream) = self.queue.get_mut(stream_id) else {
                    return Ok(());
                };
                downstream.timeout_key = None;

                if downstream.response_state() == ResponseState::Initial {
                    // The backend never produced a response head in time.
                    self.local_reply(
                        qconn,
                        stream_id,
                        408,
                        None,
                        labels::LocalReply::RequestTimeout,
                    )
                } else {
                    // Headers are already out; all that is left is to stop
                    // the stream.
                    crate::metrics::ingress_metrics::local_reply_count(
                        labels::LocalReply::GatewayTimeout,
                    )
                    .inc();
                    let code = h3::WireErrorCode::RequestCancelled as u64;
                    self.finish_stream(qconn, stream_id, Some(code), Some(code))
                }
            },
        }
    }

    /// Processes a single [`h3::Event`] from the framing layer.
    fn process_read_event(
        &mut self, qconn: &mut quiche::Connection, stream_id: u64,
        event: h3::Event,
    ) -> QuicResult<()> {
        match event {
            h3::Event::Headers { list, more_frames } =>
                self.handle_request(qconn, stream_id, list, more_frames),

            h3::Event::Data => self.forward_request_body(qconn, stream_id),
            h3::Event::Finished => self.handle_request_fin(qconn, stream_id),

            h3::Event::Reset(code) => {
                if let Some(downstream) = self.queue.get(stream_id) {
                    downstream
                        .audit_stats
                        .set_recvd_reset_stream_error_code(code as i64);
                }

                self.finish_stream(qconn, stream_id, None, None)
            },

            h3::Event::PriorityUpdate => Ok(()),

            // A client GOAWAY announces it will open no more streams;
            // existing exchanges continue.
            h3::Event::GoAway => Ok(()),

            h3::Event::Datagram => Ok(()),
        }
    }

    fn record_quiche_error(
        qconn: &mut quiche::Connection, metrics: &impl Metrics,
    ) {
        // split metrics between local/peer and QUIC/HTTP/3 level errors
        if let Some(err) = qconn.local_error() {
            if err.is_app {
                metrics.local_h3_conn_close_error_count(err.error_code.into())
            } else {
                metrics.local_quic_conn_close_error_count(err.error_code.into())
            }
            .inc();
        } else if let Some(err) = qconn.peer_error() {
            if err.is_app {
                metrics.peer_h3_conn_close_error_count(err.error_code.into())
            } else {
                metrics.peer_quic_conn_close_error_count(err.error_code.into())
            }
            .inc();
        }
    }
}

impl UpstreamApplication for UpstreamDriver {
    fn on_conn_established(
        &mut self, qconn: &mut quiche::Connection,
        handshake_info: &HandshakeInfo,
    ) -> QuicResult<()> {
        debug_assert!(
            qconn.is_server(),
            "UpstreamDriver requires a server-side QUIC connection"
        );

        let conn = h3::Connection::with_transport(qconn, &self.h3_config)?;
        self.conn = Some(conn);

        self.peer_addr = qconn.path_stats().next().map(|p| p.peer_addr);

        if let Some(post_accept_timeout) = self.enforcer.post_accept_timeout() {
            let remaining = post_accept_timeout
                .checked_sub(handshake_info.elapsed())
                .ok_or(UpstreamError::PostAcceptTimeout)?;

            let key = self
                .enforcer
                .add_timeout(Http3TimeoutType::PostAccept, remaining);
            self.post_accept_timeout_key = Some(key);
        }

        Ok(())
    }

    #[inline]
    fn should_act(&self) -> bool {
        self.conn.is_some()
    }

    /// The listener began its graceful shutdown: submit the shutdown notice
    /// and schedule the final GOAWAY.
    fn on_draining(&mut self, qconn: &mut quiche::Connection) -> QuicResult<()> {
        self.start_graceful_shutdown(qconn);
        Ok(())
    }

    #[inline]
    fn buffer(&mut self) -> &mut [u8] {
        &mut self.pooled_buf
    }

    /// Polls the framing layer for events and dispatches them.
    fn process_reads(&mut self, qconn: &mut quiche::Connection) -> QuicResult<()> {
        loop {
            match self.conn_mut()?.poll(qconn) {
                Ok((stream_id, event)) =>
                    self.process_read_event(qconn, stream_id, event)?,
                Err(h3::Error::Done) => break,
                Err(err) => {
                    // Don't bubble the error up; keep the worker loop going
                    // until quiche reports the connection as closed.
                    log::debug!(
                        "connection closing due to h3 protocol error";
                        "error" => ?err
                    );
                    return Ok(());
                },
            };
        }

        Ok(())
    }

    /// Writes as much buffered response data as the transport accepts.
    fn process_writes(&mut self, qconn: &mut quiche::Connection) -> QuicResult<()> {
        while let Some(stream_id) = qconn.stream_writable_next() {
            self.process_writable_stream(qconn, stream_id)?;
        }

        // Also optimistically check for any downstream progress.
        while let Some(Some(ready)) = self.waiting.next().now_or_never() {
            self.handle_downstream_ready(qconn, ready)?;
        }

        Ok(())
    }

    /// Waits for downstream progress, a timeout, or the shutdown signal.
    async fn wait_for_data(
        &mut self, qconn: &mut quiche::Connection,
    ) -> QuicResult<()> {
        select! {
            biased;
            Some(ready) = self.waiting.next() => {
                self.handle_downstream_ready(qconn, ready)
            },
            timeout = self.enforcer.next_timeout(),
                if self.enforcer.has_pending_timeouts() =>
            {
                self.handle_timeout(qconn, timeout)
            },
            // With no downstream activity or pending timeouts left to wait
            // for, park here; inbound packets, transport timers and the
            // shutdown signal wake the worker loop independently.
            () = std::future::pending() => unreachable!(),
        }
    }

    /// Reports connection-level error metrics before the final close packet
    /// is flushed.
    fn on_conn_close<M: Metrics>(
        &mut self, qconn: &mut quiche::Connection, metrics: &M,
        work_loop_result: &QuicResult<()>,
    ) {
        metrics
            .maximum_writable_streams()
            .observe(self.max_stream_seen as f64);

        let Err(work_loop_error) = work_loop_result else {
            return;
        };

        Self::record_quiche_error(qconn, metrics);

        match work_loop_error.downcast_ref::<UpstreamError>() {
            // The close was already performed with the right code.
            Some(UpstreamError::PostAcceptTimeout) | None => {},
            Some(UpstreamError::H3(_)) | Some(UpstreamError::Application(_)) => {
                let _ = qconn.close(
                    true,
                    h3::WireErrorCode::InternalError as u64,
                    &[],
                );
            },
            Some(UpstreamError::Transport(code)) => {
                let _ = qconn.close(false, *code, &[]);
            },
            Some(UpstreamError::TlsAlert(alert)) => {
                // TLS alerts surface as CRYPTO_ERROR at the transport level.
                let _ = qconn.close(false, 0x100 + u64::from(*alert), &[]);
            },
        }
    }
}
