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

//! HTTP/3-over-QUIC ingress termination for a reverse proxy.
//!
//! h3-ingress terminates QUIC + HTTP/3 on a UDP listener, decodes request
//! streams, hands each request to a [`DownstreamDispatcher`] and streams the
//! backend's response back as HTTP/3 frames with correct flow control and
//! lifecycle handling. It is powered by [quiche] and runs on [tokio].
//!
//! # Serving HTTP/3
//!
//! A server [`listen`]s on one or more UDP sockets (usually sharing a port
//! via `SO_REUSEPORT`, one worker per socket) and starts an
//! [`UpstreamDriver`] for each accepted connection:
//!
//! ```no_run
//! use std::sync::Arc;
//! use futures::stream::StreamExt;
//! use h3_ingress::http3::settings::Http3Settings;
//! use h3_ingress::http3::upstream::UpstreamDriver;
//! use h3_ingress::metrics::DefaultMetrics;
//! use h3_ingress::quic::GracefulShutdown;
//! use h3_ingress::settings::ProxySettings;
//! use h3_ingress::ConnectionParams;
//!
//! # async fn example(
//! #     dispatcher: Arc<dyn h3_ingress::downstream::DownstreamDispatcher>,
//! # ) -> h3_ingress::QuicResult<()> {
//! let socket = tokio::net::UdpSocket::bind("0.0.0.0:443").await?;
//! let shutdown = GracefulShutdown::new();
//! let proxy_settings = Arc::new(ProxySettings::default());
//!
//! let mut listeners = h3_ingress::listen(
//!     [socket],
//!     ConnectionParams::default(),
//!     &shutdown,
//!     DefaultMetrics,
//! )?;
//! let accept_stream = &mut listeners[0];
//!
//! while let Some(conn) = accept_stream.next().await {
//!     let driver = UpstreamDriver::new(
//!         Http3Settings::default(),
//!         Arc::clone(&proxy_settings),
//!         Arc::clone(&dispatcher),
//!         None,
//!     );
//!     conn?.start(driver);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Triggering [`GracefulShutdown::shutdown`] makes the acceptors refuse new
//! connections with `CONNECTION_REFUSED` and every live connection submit a
//! shutdown notice, followed by a final GOAWAY after three PTOs.

pub mod buf_factory;
pub mod downstream;
pub mod http3;
pub mod metrics;
pub mod quic;
mod result;
pub mod settings;
pub mod socket;

pub use buffer_pool;
pub use datagram_socket;

use std::io;
use tokio::net::UdpSocket;
use tokio_stream::wrappers::ReceiverStream;

use crate::metrics::Metrics;
use crate::socket::QuicListener;

pub use crate::http3::upstream::UpstreamDriver;
pub use crate::http3::upstream::UpstreamError;
pub use crate::quic::GracefulShutdown;
pub use crate::quic::InitialQuicConnection;
pub use crate::quic::QuicConnection;
pub use crate::quic::UpstreamApplication;
pub use crate::result::BoxError;
pub use crate::result::QuicResult;
pub use crate::settings::ConnectionParams;

#[doc(hidden)]
pub use crate::result::QuicResultExt;

/// A stream of accepted [`InitialQuicConnection`]s from a [`listen`] call.
///
/// Errors from processing the client's QUIC initials can also be emitted on
/// this stream. These do not indicate that the listener itself has failed.
pub type QuicConnectionStream<M> =
    ReceiverStream<io::Result<InitialQuicConnection<UdpSocket, M>>>;

/// Starts listening for inbound QUIC connections on the given
/// [`QuicListener`]s.
///
/// Each socket starts a separate worker task to route inbound packets. The
/// task emits connections on the respective [`QuicConnectionStream`] after
/// receiving the client's QUIC Initial and validating its IP address, and
/// shuts down when the returned stream is closed (or dropped) and all
/// previously-yielded connections are closed.
pub fn listen_with_capabilities<M>(
    sockets: impl IntoIterator<Item = QuicListener>, params: ConnectionParams,
    shutdown: &GracefulShutdown, metrics: M,
) -> io::Result<Vec<QuicConnectionStream<M>>>
where
    M: Metrics,
{
    sockets
        .into_iter()
        .map(|s| crate::quic::start_listener(s, &params, shutdown, metrics.clone()))
        .collect()
}

/// Starts listening for inbound QUIC connections on the given `sockets`.
///
/// Each socket is converted into a [`QuicListener`]; its position in the
/// iterator becomes the worker id embedded in issued connection IDs. On
/// Linux all supported socket capabilities (GSO, GRO, ...) are enabled
/// opportunistically. The listeners are then passed to
/// [`listen_with_capabilities`].
pub fn listen<S, M>(
    sockets: impl IntoIterator<Item = S>, params: ConnectionParams,
    shutdown: &GracefulShutdown, metrics: M,
) -> io::Result<Vec<QuicConnectionStream<M>>>
where
    S: TryInto<QuicListener, Error = io::Error>,
    M: Metrics,
{
    let quic_sockets: Vec<QuicListener> = sockets
        .into_iter()
        .enumerate()
        .map(|(worker_id, s)| {
            #[cfg_attr(not(target_os = "linux"), expect(unused_mut))]
            let mut socket = s.try_into()?;
            socket.worker_id = worker_id as u8;
            #[cfg(target_os = "linux")]
            socket.apply_max_capabilities();
            Ok(socket)
        })
        .collect::<io::Result<_>>()?;

    listen_with_capabilities(quic_sockets, params, shutdown, metrics)
}
