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

//! QUIC transport termination.
//!
//! Each listening socket is driven by an [`IngressPacketRouter`] task that
//! owns the socket's `recv` half. It decodes the QUIC header in each packet,
//! looks up the destination connection ID, and forwards the packet to the
//! owning connection's `IoWorker` task. Packets that match no connection are
//! answered from the close-wait registry or, for Initials, handled by the
//! [`ConnectionAcceptor`]: version negotiation, stateless Retry for address
//! validation, refusal during graceful shutdown, or acceptance into the
//! listener's connection stream.
//!
//! `IoWorker` feeds inbound packets into the [`quiche::Connection`],
//! executes the [`UpstreamApplication`] callbacks, and flushes outbound
//! packets in GSO batches. It loops through these operations until the
//! connection closes or the application errors, at which point the final
//! CONNECTION_CLOSE datagram and the connection's CIDs move to close-wait.
//!
//! [`IngressPacketRouter`]: self::router::IngressPacketRouter
//! [`ConnectionAcceptor`]: self::router::acceptor::ConnectionAcceptor

use std::sync::Arc;

use foundations::telemetry::log;
use tokio::sync::watch;

use crate::metrics::Metrics;
use crate::settings::Config;
use crate::socket::QuicListener;
use crate::ConnectionParams;
use crate::QuicConnectionStream;

pub(crate) mod addr_validation_token;
pub mod cid;
pub(crate) mod close_wait;
pub(crate) mod connection;
pub(crate) mod io;
pub(crate) mod router;

use self::addr_validation_token::AddrValidationTokenManager;
use self::cid::EncryptedCidGenerator;
use self::cid::KeyingMaterials;
use self::router::acceptor::ConnectionAcceptor;
use self::router::acceptor::ConnectionAcceptorConfig;
use self::router::IngressPacketRouter;

pub use self::connection::HandshakeError;
pub use self::connection::HandshakeInfo;
pub use self::connection::Incoming;
pub use self::connection::InitialQuicConnection;
pub use self::connection::QuicConnection;
pub use self::connection::QuicConnectionStats;
pub use self::connection::UpstreamApplication;

/// Coordinates graceful shutdown of listeners and their connections.
///
/// Triggering the handle makes every acceptor refuse new connections with
/// `CONNECTION_REFUSED` and every [`UpstreamDriver`] start its shutdown
/// sequence (shutdown notice, then GOAWAY after 3 PTO).
///
/// [`UpstreamDriver`]: crate::http3::upstream::UpstreamDriver
#[derive(Clone)]
pub struct GracefulShutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl GracefulShutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Starts the graceful shutdown. Idempotent.
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }

    /// A receiver that resolves once shutdown begins.
    pub fn watch(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Creates a qlog writer for the given SCID in `dir`.
///
/// Files are named `<iso8601-basic>-<hex-scid>.sqlog` and, on Unix, created
/// with mode 0640 so the log group can collect them.
pub(crate) fn make_qlog_writer(
    dir: &str, scid: &quiche::ConnectionId,
) -> std::io::Result<std::io::BufWriter<std::fs::File>> {
    let mut path = std::path::PathBuf::from(dir);

    let ts = chrono::Utc::now().format("%Y%m%dT%H%M%SZ");
    let id: String = scid.iter().map(|b| format!("{b:02x}")).collect();
    path.push(format!("{ts}-{id}.sqlog"));

    let mut opts = std::fs::File::options();
    opts.create_new(true).write(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o640);
    }

    let f = opts.open(&path)?;
    Ok(std::io::BufWriter::new(f))
}

pub(crate) fn start_listener<M>(
    socket: QuicListener, params: &ConnectionParams,
    shutdown: &GracefulShutdown, metrics: M,
) -> std::io::Result<QuicConnectionStream<M>>
where
    M: Metrics,
{
    #[cfg(unix)]
    assert!(
        datagram_socket::is_nonblocking(&socket).unwrap_or_default(),
        "O_NONBLOCK should be set for the listening socket"
    );

    let config = Config::new(params, socket.capabilities).map_err(
        |e| std::io::Error::other(format!("invalid connection params: {e}")),
    )?;

    let keys = Arc::new(KeyingMaterials::default());
    let cid_gen = EncryptedCidGenerator::new(socket.worker_id, keys.clone());
    let token_manager = AddrValidationTokenManager::new(keys);

    let local_addr = socket.socket.local_addr()?;
    let socket_tx = Arc::new(socket.socket);
    let socket_rx = Arc::clone(&socket_tx);

    let acceptor = ConnectionAcceptor::new(
        ConnectionAcceptorConfig {
            disable_client_ip_validation: config.disable_client_ip_validation,
            qlog_dir: config.qlog_dir.clone(),
            keylog_file: config
                .keylog_file
                .as_ref()
                .and_then(|f| f.try_clone().ok()),
            #[cfg(target_os = "linux")]
            with_pktinfo: if local_addr.is_ipv4() {
                config.has_ippktinfo
            } else {
                config.has_ipv6pktinfo
            },
        },
        Arc::clone(&socket_tx),
        token_manager.clone(),
        cid_gen.clone(),
        shutdown.watch(),
        metrics.clone(),
    );

    let (socket_driver, accept_stream) = IngressPacketRouter::new(
        config,
        socket_tx,
        socket_rx,
        local_addr,
        acceptor,
        cid_gen,
        token_manager,
        shutdown.watch(),
        metrics.clone(),
    );

    crate::metrics::tokio_task::spawn("quic_udp_listener", async move {
        match socket_driver.await {
            Ok(()) => log::trace!("ingress packet router finished"),
            Err(error) => {
                log::error!("ingress packet router failed"; "error" => error)
            },
        }
    });
    Ok(QuicConnectionStream::new(accept_stream))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn graceful_shutdown_is_observable_and_idempotent() {
        let shutdown = GracefulShutdown::new();
        let rx = shutdown.watch();
        assert!(!*rx.borrow());

        shutdown.shutdown();
        shutdown.shutdown();
        assert!(*rx.borrow());

        // Receivers subscribed after the fact still see the signal.
        assert!(*shutdown.watch().borrow());
    }

    #[test]
    #[cfg(unix)]
    fn qlog_files_are_group_readable_and_named_by_scid() {
        use std::os::unix::fs::PermissionsExt;

        let dir = std::env::temp_dir().join(format!(
            "h3-ingress-qlog-test-{}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();

        let scid = quiche::ConnectionId::from_ref(&[0xab, 0x01]);
        let writer =
            make_qlog_writer(dir.to_str().unwrap(), &scid).unwrap();
        drop(writer);

        let entry = std::fs::read_dir(&dir).unwrap().next().unwrap().unwrap();
        let name = entry.file_name().into_string().unwrap();
        assert!(name.ends_with("-ab01.sqlog"), "unexpected name: {name}");

        let mode = entry.metadata().unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o640);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
