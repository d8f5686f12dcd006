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

//! Metrics for the ingress subsystem.
//!
//! The crate records metrics through the [`Metrics`] trait so embedders can
//! route them into their own registry. [`DefaultMetrics`] publishes them via
//! [foundations].

pub mod labels;
pub(crate) mod tokio_task;

use foundations::telemetry::metrics::metrics;
use foundations::telemetry::metrics::Counter;
use foundations::telemetry::metrics::Gauge;
use foundations::telemetry::metrics::Histogram;
use foundations::telemetry::metrics::TimeHistogram;

/// Sink for the metrics emitted by this crate.
///
/// The trait is cloned into every connection task, so implementations should
/// be cheap handles. All methods return foundations metric handles which are
/// updated by the caller.
pub trait Metrics: Clone + Send + Sync + Unpin + 'static {
    /// Number of QUIC connections currently in memory.
    fn connections_in_memory(&self) -> Gauge;

    /// Maximum HTTP/3 stream ID observed on a connection, recorded at
    /// connection close.
    fn maximum_writable_streams(&self) -> Histogram;

    /// Number of accepted QUIC Initial packets.
    fn accepted_initial_packet_count(&self) -> Counter;

    /// Number of rejected QUIC Initial packets.
    fn rejected_initial_packet_count(
        &self, reason: labels::QuicInvalidInitialPacketError,
    ) -> Counter;

    /// Number of failed QUIC handshakes.
    fn failed_handshakes(&self, reason: labels::HandshakeError) -> Counter;

    /// Number of non-Initial packets whose DCID failed verification.
    fn invalid_cid_packet_count(&self, reason: labels::InvalidCid) -> Counter;

    /// Number of UDP packets dropped by the kernel (`SO_RXQ_OVFL`).
    fn udp_drop_count(&self) -> Counter;

    /// Number of failed `send(2)` calls on UDP sockets.
    fn write_errors(&self, reason: labels::QuicWriteError) -> Counter;

    /// Number of CONNECTION_CLOSE retransmits from the close-wait registry.
    fn close_wait_retransmit_count(&self) -> Counter;

    /// Number of Retry packets emitted for address validation.
    fn retry_packet_count(&self) -> Counter;

    /// Number of requests handed to the downstream dispatcher.
    fn forwarded_request_count(&self) -> Counter;

    /// Number of downstream re-dispatch attempts after a reset.
    fn downstream_retry_count(&self) -> Counter;

    /// Number of responses synthesized locally instead of by a backend.
    fn local_reply_count(&self, status: labels::LocalReply) -> Counter;

    /// Number of QUIC-level connection closes initiated locally.
    fn local_quic_conn_close_error_count(
        &self, code: labels::QuicError,
    ) -> Counter;

    /// Number of HTTP/3-level connection closes initiated locally.
    fn local_h3_conn_close_error_count(&self, code: labels::H3Error) -> Counter;

    /// Number of QUIC-level connection closes initiated by the peer.
    fn peer_quic_conn_close_error_count(
        &self, code: labels::QuicError,
    ) -> Counter;

    /// Number of HTTP/3-level connection closes initiated by the peer.
    fn peer_h3_conn_close_error_count(&self, code: labels::H3Error) -> Counter;

    /// Time spent blocked in `sendmsg` after `EWOULDBLOCK`.
    fn send_to_wouldblock_duration_s(&self) -> TimeHistogram;

    /// QUIC handshake durations per stage.
    #[cfg(feature = "perf-quic-listener-metrics")]
    fn handshake_time_seconds(
        &self, stage: labels::QuicHandshakeStage,
    ) -> TimeHistogram;
}

#[metrics]
pub(crate) mod ingress_metrics {
    /// Number of QUIC connections currently in memory
    pub fn connections_in_memory() -> Gauge;

    /// Maximum writable HTTP/3 stream ID seen on a connection
    pub fn maximum_writable_streams() -> Histogram;

    /// Number of accepted QUIC Initial packets
    pub fn accepted_initial_packet_count() -> Counter;

    /// Number of rejected QUIC Initial packets
    pub fn rejected_initial_packet_count(
        reason: super::labels::QuicInvalidInitialPacketError,
    ) -> Counter;

    /// Number of failed QUIC handshakes
    pub fn failed_handshakes(reason: super::labels::HandshakeError) -> Counter;

    /// Number of non-Initial packets with an unverifiable DCID
    pub fn invalid_cid_packet_count(
        reason: super::labels::InvalidCid,
    ) -> Counter;

    /// Number of UDP packets dropped by the kernel
    pub fn udp_drop_count() -> Counter;

    /// Number of failed UDP send calls
    pub fn write_errors(reason: super::labels::QuicWriteError) -> Counter;

    /// Number of CONNECTION_CLOSE retransmits during close-wait
    pub fn close_wait_retransmit_count() -> Counter;

    /// Number of Retry packets emitted
    pub fn retry_packet_count() -> Counter;

    /// Number of requests handed to the downstream dispatcher
    pub fn forwarded_request_count() -> Counter;

    /// Number of downstream re-dispatch attempts
    pub fn downstream_retry_count() -> Counter;

    /// Number of locally synthesized responses
    pub fn local_reply_count(status: super::labels::LocalReply) -> Counter;

    /// Local QUIC-level connection close count
    pub fn local_quic_conn_close_error_count(
        code: super::labels::QuicError,
    ) -> Counter;

    /// Local HTTP/3-level connection close count
    pub fn local_h3_conn_close_error_count(
        code: super::labels::H3Error,
    ) -> Counter;

    /// Peer QUIC-level connection close count
    pub fn peer_quic_conn_close_error_count(
        code: super::labels::QuicError,
    ) -> Counter;

    /// Peer HTTP/3-level connection close count
    pub fn peer_h3_conn_close_error_count(
        code: super::labels::H3Error,
    ) -> Counter;

    /// Time spent blocked in sendmsg after EWOULDBLOCK
    pub fn send_to_wouldblock_duration_s() -> TimeHistogram;

    /// QUIC handshake durations per stage
    #[cfg(feature = "perf-quic-listener-metrics")]
    pub fn handshake_time_seconds(
        stage: super::labels::QuicHandshakeStage,
    ) -> TimeHistogram;
}

/// Standard implementation of [`Metrics`] backed by [foundations].
#[derive(Default, Clone, Copy, Debug)]
pub struct DefaultMetrics;

impl Metrics for DefaultMetrics {
    fn connections_in_memory(&self) -> Gauge {
        ingress_metrics::connections_in_memory()
    }

    fn maximum_writable_streams(&self) -> Histogram {
        ingress_metrics::maximum_writable_streams()
    }

    fn accepted_initial_packet_count(&self) -> Counter {
        ingress_metrics::accepted_initial_packet_count()
    }

    fn rejected_initial_packet_count(
        &self, reason: labels::QuicInvalidInitialPacketError,
    ) -> Counter {
        ingress_metrics::rejected_initial_packet_count(reason)
    }

    fn failed_handshakes(&self, reason: labels::HandshakeError) -> Counter {
        ingress_metrics::failed_handshakes(reason)
    }

    fn invalid_cid_packet_count(&self, reason: labels::InvalidCid) -> Counter {
        ingress_metrics::invalid_cid_packet_count(reason)
    }

    fn udp_drop_count(&self) -> Counter {
        ingress_metrics::udp_drop_count()
    }

    fn write_errors(&self, reason: labels::QuicWriteError) -> Counter {
        ingress_metrics::write_errors(reason)
    }

    fn close_wait_retransmit_count(&self) -> Counter {
        ingress_metrics::close_wait_retransmit_count()
    }

    fn retry_packet_count(&self) -> Counter {
        ingress_metrics::retry_packet_count()
    }

    fn forwarded_request_count(&self) -> Counter {
        ingress_metrics::forwarded_request_count()
    }

    fn downstream_retry_count(&self) -> Counter {
        ingress_metrics::downstream_retry_count()
    }

    fn local_reply_count(&self, status: labels::LocalReply) -> Counter {
        ingress_metrics::local_reply_count(status)
    }

    fn local_quic_conn_close_error_count(
        &self, code: labels::QuicError,
    ) -> Counter {
        ingress_metrics::local_quic_conn_close_error_count(code)
    }

    fn local_h3_conn_close_error_count(&self, code: labels::H3Error) -> Counter {
        ingress_metrics::local_h3_conn_close_error_count(code)
    }

    fn peer_quic_conn_close_error_count(
        &self, code: labels::QuicError,
    ) -> Counter {
        ingress_metrics::peer_quic_conn_close_error_count(code)
    }

    fn peer_h3_conn_close_error_count(&self, code: labels::H3Error) -> Counter {
        ingress_metrics::peer_h3_conn_close_error_count(code)
    }

    fn send_to_wouldblock_duration_s(&self) -> TimeHistogram {
        ingress_metrics::send_to_wouldblock_duration_s()
    }

    #[cfg(feature = "perf-quic-listener-metrics")]
    fn handshake_time_seconds(
        &self, stage: labels::QuicHandshakeStage,
    ) -> TimeHistogram {
        ingress_metrics::handshake_time_seconds(stage)
    }
}
