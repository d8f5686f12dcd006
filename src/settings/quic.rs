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

use foundations::settings::settings;
use serde_with::serde_as;
use serde_with::DurationMilliSeconds;
use std::time::Duration;

/// Length of server-issued source connection IDs, in bytes.
///
/// One prefix byte routes the packet to its worker, one selects the keying
/// material slot, sixteen carry the encrypted payload, two are random tail.
pub const QUIC_SCID_LEN: usize = 20;

/// Default cap on outgoing UDP payload size.
pub const MAX_UDP_PAYLOAD_SIZE: usize = 1452;

/// Floor for the UDP payload cap after the kernel rejects a datagram size.
/// This is the minimum payload size every IETF QUIC path must support.
pub const UDP_PAYLOAD_SIZE_FLOOR: usize = 1200;

/// QUIC configuration parameters for the ingress listener.
#[serde_as]
#[settings]
pub struct QuicSettings {
    /// Configures the list of supported application protocols. Defaults to
    /// `[b"h3"]`.
    #[serde(skip, default = "QuicSettings::default_alpn")]
    pub alpn: Vec<Vec<u8>>,

    /// Sets the `initial_max_data` transport parameter. Defaults to 1 MB.
    #[serde(default = "QuicSettings::default_initial_max_data")]
    pub initial_max_data: u64,

    /// Sets the `initial_max_stream_data_bidi_remote` transport parameter.
    /// Defaults to 256 KB.
    #[serde(default = "QuicSettings::default_initial_max_stream_data")]
    pub initial_max_stream_data_bidi_remote: u64,

    /// Sets the `initial_max_stream_data_uni` transport parameter.
    /// Defaults to 256 KB.
    #[serde(default = "QuicSettings::default_initial_max_stream_data")]
    pub initial_max_stream_data_uni: u64,

    /// Sets the `initial_max_streams_bidi` transport parameter.
    /// Defaults to `100`.
    #[serde(default = "QuicSettings::default_initial_max_streams_bidi")]
    pub initial_max_streams_bidi: u64,

    /// Sets the `initial_max_streams_uni` transport parameter.
    ///
    /// Defaults to `3`: the peer's HTTP/3 control stream plus its two QPACK
    /// streams. The ingress never accepts other unidirectional streams.
    #[serde(default = "QuicSettings::default_initial_max_streams_uni")]
    pub initial_max_streams_uni: u64,

    /// Upper bound for the connection-level flow control window.
    /// Defaults to 6 MB.
    #[serde(default = "QuicSettings::default_max_window")]
    pub max_connection_window: u64,

    /// Upper bound for stream-level flow control windows. Defaults to 6 MB.
    #[serde(default = "QuicSettings::default_max_window")]
    pub max_stream_window: u64,

    /// Configures the max idle timeout of the connection in milliseconds.
    /// The real idle timeout is the minimum of this and the peer's
    /// `max_idle_timeout`. Defaults to 30 seconds.
    #[serde(
        rename = "max_idle_timeout_ms",
        default = "QuicSettings::default_max_idle_timeout"
    )]
    #[serde_as(as = "Option<DurationMilliSeconds>")]
    pub max_idle_timeout: Option<Duration>,

    /// Initial RTT estimate handed to the congestion controller, in
    /// milliseconds. Defaults to quiche's built-in initial RTT when unset.
    #[serde(rename = "initial_rtt_ms")]
    #[serde_as(as = "Option<DurationMilliSeconds>")]
    pub initial_rtt: Option<Duration>,

    /// Sets the maximum incoming UDP payload size. Defaults to 1452 bytes.
    #[serde(default = "QuicSettings::default_max_udp_payload_size")]
    pub max_recv_udp_payload_size: usize,

    /// Sets the maximum outgoing UDP payload size. Defaults to 1452 bytes.
    ///
    /// This is also the GSO segment size for batched sends. `sendmsg`
    /// failures with `EINVAL`/`EMSGSIZE` lower the effective value for the
    /// affected connection to [`UDP_PAYLOAD_SIZE_FLOOR`].
    #[serde(default = "QuicSettings::default_max_udp_payload_size")]
    pub max_send_udp_payload_size: usize,

    /// Whether to validate client IPs with a stateless Retry before creating
    /// connection state. Defaults to `false` (validation enabled).
    pub disable_client_ip_validation: bool,

    /// Path to a file in which TLS secrets will be logged in
    /// [SSLKEYLOGFILE format](https://tlswg.org/sslkeylogfile/draft-ietf-tls-keylogfile.html).
    pub keylog_file: Option<String>,

    /// Path to a directory where qlog files will be saved.
    ///
    /// Files are named `<iso8601-basic>-<hex-scid>.sqlog` and created with
    /// mode 0640.
    pub qlog_dir: Option<String>,

    /// Congestion control algorithm to use.
    ///
    /// For available values, see
    /// [`CongestionControlAlgorithm`](quiche::CongestionControlAlgorithm).
    /// Defaults to `bbr`.
    #[serde(default = "QuicSettings::default_cc_algorithm")]
    pub cc_algorithm: String,

    /// Whether to use HyStart++ (only with `cubic` and `reno` CC). Defaults
    /// to `true`.
    #[serde(default = "QuicSettings::default_enable_hystart")]
    pub enable_hystart: bool,

    /// Per-burst packet cap applied when the congestion controller is not
    /// BBR. Defaults to 10.
    #[serde(default = "QuicSettings::default_non_bbr_burst_packets")]
    pub non_bbr_burst_packets: usize,

    /// A timeout for the QUIC handshake, in milliseconds. Disabled by
    /// default.
    #[serde(rename = "handshake_timeout_ms")]
    #[serde_as(as = "Option<DurationMilliSeconds>")]
    pub handshake_timeout: Option<Duration>,

    /// The maximum number of newly-created connections queued for handshake
    /// processing. Defaults to 1024 connections.
    #[serde(default = "QuicSettings::default_listen_backlog")]
    pub listen_backlog: usize,
}

impl QuicSettings {
    #[inline]
    fn default_alpn() -> Vec<Vec<u8>> {
        quiche::h3::APPLICATION_PROTOCOL
            .iter()
            .map(|v| v.to_vec())
            .collect()
    }

    #[inline]
    fn default_initial_max_data() -> u64 {
        1024 * 1024
    }

    #[inline]
    fn default_initial_max_stream_data() -> u64 {
        256 * 1024
    }

    #[inline]
    fn default_initial_max_streams_bidi() -> u64 {
        100
    }

    #[inline]
    fn default_initial_max_streams_uni() -> u64 {
        3
    }

    #[inline]
    fn default_max_window() -> u64 {
        6 * 1024 * 1024
    }

    #[inline]
    fn default_max_idle_timeout() -> Option<Duration> {
        Some(Duration::from_secs(30))
    }

    #[inline]
    fn default_max_udp_payload_size() -> usize {
        MAX_UDP_PAYLOAD_SIZE
    }

    #[inline]
    fn default_cc_algorithm() -> String {
        "bbr".to_string()
    }

    #[inline]
    fn default_enable_hystart() -> bool {
        true
    }

    #[inline]
    fn default_non_bbr_burst_packets() -> usize {
        10
    }

    #[inline]
    fn default_listen_backlog() -> usize {
        1024
    }
}

#[cfg(test)]
mod test {
    use super::QuicSettings;
    use std::time::Duration;

    #[test]
    fn timeouts_parse_as_milliseconds() {
        let quic = serde_json::from_str::<QuicSettings>(
            r#"{ "handshake_timeout_ms": 5000, "max_idle_timeout_ms": 7000 }"#,
        )
        .unwrap();

        assert_eq!(quic.handshake_timeout.unwrap(), Duration::from_secs(5));
        assert_eq!(quic.max_idle_timeout.unwrap(), Duration::from_secs(7));
    }

    #[test]
    fn defaults_follow_wire_limits() {
        let quic = serde_json::from_str::<QuicSettings>("{}").unwrap();

        assert_eq!(quic.max_send_udp_payload_size, 1452);
        assert_eq!(quic.initial_max_streams_uni, 3);
        assert_eq!(quic.cc_algorithm, "bbr");
    }
}
