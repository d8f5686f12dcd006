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

mod error;
mod map;

pub use self::error::HandshakeError;
pub(crate) use self::map::ConnectionMap;

use datagram_socket::AsSocketStats;
use datagram_socket::DatagramSocketSend;
use datagram_socket::MaybeConnectedSocket;
use datagram_socket::QuicAuditStats;
use datagram_socket::SocketStats;
use foundations::telemetry::log;
use futures::future::BoxFuture;
use futures::Future;
use quiche::ConnectionId;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;
use std::time::SystemTime;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio_util::task::AbortOnDropHandle;

use super::io::connection_stage::Close;
use super::io::connection_stage::ConnectionStageContext;
use super::io::connection_stage::Handshake;
use super::io::connection_stage::RunningApplication;
use super::io::worker::Closing;
use super::io::worker::IoWorker;
use super::io::worker::IoWorkerParams;
use super::io::worker::Running;
use super::io::worker::RunningOrClosing;
use super::io::worker::WriteState;
use super::io::worker::WriterConfig;
use super::io::worker::INCOMING_QUEUE_SIZE;
use super::router::ConnectionMapCommand;
use crate::buf_factory::PooledBuf;
use crate::metrics::Metrics;
use crate::quic::addr_validation_token::AddrValidationTokenManager;
use crate::quic::cid::EncryptedCidGenerator;
use crate::QuicResult;

/// Wrapper for connection statistics recorded by [quiche].
#[derive(Debug)]
pub struct QuicConnectionStats {
    /// Aggregate connection statistics across all paths.
    pub stats: quiche::Stats,
    /// Specific statistics about the connection's active path.
    pub path_stats: Option<quiche::PathStats>,
}

pub(crate) type QuicConnectionStatsShared = Arc<Mutex<QuicConnectionStats>>;

impl QuicConnectionStats {
    pub(crate) fn from_conn(qconn: &quiche::Connection) -> Self {
        Self {
            stats: qconn.stats(),
            path_stats: qconn.path_stats().next(),
        }
    }
}

impl AsSocketStats for QuicConnectionStats {
    fn as_socket_stats(&self) -> SocketStats {
        let path = self.path_stats.as_ref();

        SocketStats {
            pmtu: path.map(|p| p.pmtu as u16).unwrap_or_default(),
            rtt_us: path
                .map(|p| p.rtt.as_micros() as i64)
                .unwrap_or_default(),
            min_rtt_us: path
                .and_then(|p| p.min_rtt.map(|x| x.as_micros() as i64))
                .unwrap_or_default(),
            rtt_var_us: path
                .map(|p| p.rttvar.as_micros() as i64)
                .unwrap_or_default(),
            cwnd: path.map(|p| p.cwnd as u64).unwrap_or_default(),
            packets_sent: self.stats.sent as u64,
            packets_recvd: self.stats.recv as u64,
            packets_lost: self.stats.lost as u64,
            packets_retrans: self.stats.retrans as u64,
            bytes_sent: self.stats.sent_bytes,
            bytes_recvd: self.stats.recv_bytes,
            bytes_lost: self.stats.lost_bytes,
            bytes_retrans: self.stats.stream_retrans_bytes,
            bytes_unsent: 0,
            delivery_rate: path.map(|p| p.delivery_rate).unwrap_or_default(),
        }
    }
}

/// A received network packet with additional metadata.
#[derive(Debug)]
pub struct Incoming {
    /// The address that sent the inbound packet.
    pub peer_addr: SocketAddr,
    /// The address on which we received the inbound packet.
    pub local_addr: SocketAddr,
    /// The receive timestamp of the packet.
    pub rx_time: Option<SystemTime>,
    /// The packet's contents.
    pub buf: PooledBuf,
    /// If set, then `buf` is a GRO buffer containing multiple packets.
    /// Each individual packet has a size of `gro` (except for the last one).
    pub gro: Option<u16>,
}

/// A QUIC connection that has not performed a handshake yet.
///
/// It is created and added to the listener's connection stream after an
/// initial packet from a client passed address validation. To turn the
/// initial connection into a fully established one, a QUIC handshake must be
/// performed:
/// - `start` spawns a task to handle the entire lifetime of the connection.
/// - `handshake` spawns a task for the handshake and awaits its completion,
///   pausing the connection until it is `resume`d. This lets callers collect
///   telemetry or reject a client before serving the application.
#[must_use = "call InitialQuicConnection::start to establish the connection"]
pub struct InitialQuicConnection<Tx, M>
where
    Tx: DatagramSocketSend + Send + 'static + ?Sized,
    M: Metrics,
{
    /// An internal key, to uniquely identify the connection across multiple
    /// QUIC connection IDs.
    pub(crate) key: u64,
    pub(crate) params: QuicConnectionParams<Tx, M>,
    pub(crate) audit_log_stats: Arc<QuicAuditStats>,
    stats: QuicConnectionStatsShared,
    pub(crate) incoming_ev_sender: mpsc::Sender<Incoming>,
    incoming_ev_receiver: mpsc::Receiver<Incoming>,
}

impl<Tx, M> InitialQuicConnection<Tx, M>
where
    Tx: DatagramSocketSend + Send + 'static + ?Sized,
    M: Metrics,
{
    #[inline]
    pub(crate) fn new(params: QuicConnectionParams<Tx, M>) -> Self {
        let (incoming_ev_sender, incoming_ev_receiver) =
            mpsc::channel(INCOMING_QUEUE_SIZE);
        let audit_log_stats = Arc::new(QuicAuditStats::new(params.scid.to_vec()));

        let stats = Arc::new(Mutex::new(QuicConnectionStats::from_conn(
            &params.quiche_conn,
        )));

        Self {
            key: Self::generate_key(),
            params,
            audit_log_stats,
            stats,
            incoming_ev_sender,
            incoming_ev_receiver,
        }
    }

    /// The local address this connection listens on.
    pub fn local_addr(&self) -> SocketAddr {
        self.params.local_addr
    }

    /// The remote address for this connection.
    pub fn peer_addr(&self) -> SocketAddr {
        self.params.peer_addr
    }

    /// A handle to the [`QuicAuditStats`] for this connection.
    ///
    /// # Note
    /// These stats are updated during the lifetime of the connection. The
    /// getter exists to grab a handle early on, which can then be stowed
    /// away and read out after the connection has closed.
    #[inline]
    pub fn audit_log_stats(&self) -> Arc<QuicAuditStats> {
        Arc::clone(&self.audit_log_stats)
    }

    /// A handle to the [`QuicConnectionStats`] for this connection.
    ///
    /// # Note
    /// Initially, these stats represent the state when the
    /// [quiche::Connection] was created. They are updated when the connection
    /// is closed.
    #[inline]
    pub fn stats(&self) -> &QuicConnectionStatsShared {
        &self.stats
    }

    /// Creates a future to drive the connection's handshake.
    ///
    /// This is a lower-level alternative to the `handshake` function which
    /// gives the caller more control over execution of the future.
    #[allow(clippy::type_complexity)]
    pub fn handshake_fut<A: UpstreamApplication>(
        self, app: A,
    ) -> (
        QuicConnection,
        BoxFuture<'static, io::Result<Running<Arc<Tx>, M, A>>>,
    ) {
        self.params.metrics.connections_in_memory().inc();

        let conn = QuicConnection {
            local_addr: self.params.local_addr,
            peer_addr: self.params.peer_addr,
            audit_log_stats: Arc::clone(&self.audit_log_stats),
            stats: Arc::clone(&self.stats),
            scid: self.params.scid,
        };
        let context = ConnectionStageContext {
            in_pkt: self.params.initial_pkt,
            incoming_pkt_receiver: self.incoming_ev_receiver,
            application: app,
            stats: Arc::clone(&self.stats),
        };
        let conn_stage = Handshake {
            handshake_info: self.params.handshake_info,
        };
        let params = IoWorkerParams {
            socket: MaybeConnectedSocket::new(self.params.socket),
            shutdown_tx: self.params.shutdown_tx,
            cfg: self.params.writer_cfg,
            audit_log_stats: self.audit_log_stats,
            write_state: WriteState::default(),
            conn_map_cmd_tx: self.params.conn_map_cmd_tx,
            cid_gen: self.params.cid_gen,
            token_manager: self.params.token_manager,
            draining: self.params.draining,
            close_datagram: None,
            #[cfg(feature = "perf-quic-listener-metrics")]
            init_rx_time: self.params.init_rx_time,
            metrics: self.params.metrics.clone(),
        };

        let handshake_fut = async move {
            let qconn = self.params.quiche_conn;
            let handshake_done =
                IoWorker::new(params, conn_stage).run(qconn, context).await;

            match handshake_done {
                RunningOrClosing::Running(r) => Ok(r),
                RunningOrClosing::Closing(Closing {
                    params,
                    work_loop_result,
                    mut context,
                    mut qconn,
                }) => {
                    let hs_result = make_handshake_result(&work_loop_result);
                    IoWorker::new(params, Close { work_loop_result })
                        .close(&mut qconn, &mut context)
                        .await;
                    hs_result
                },
            }
        };

        (conn, Box::pin(handshake_fut))
    }

    /// Performs the QUIC handshake in a separate tokio task and awaits its
    /// completion.
    ///
    /// The returned [`QuicConnection`] holds metadata about the established
    /// connection. The connection itself is paused after `handshake` returns
    /// and must be resumed by passing the opaque `Running` value to
    /// [`InitialQuicConnection::resume`].
    pub async fn handshake<A: UpstreamApplication>(
        self, app: A,
    ) -> io::Result<(QuicConnection, Running<Arc<Tx>, M, A>)> {
        let (conn, handshake_fut) = Self::handshake_fut(self, app);

        let handshake_handle =
            crate::metrics::tokio_task::spawn("quic_handshake", handshake_fut);

        // `AbortOnDropHandle` simulates task-killswitch behavior without
        // needing to give up ownership of the `JoinHandle`.
        let handshake_abort_handle = AbortOnDropHandle::new(handshake_handle);

        let worker = handshake_abort_handle.await??;

        Ok((conn, worker))
    }

    /// Resumes a QUIC connection which was paused after a successful
    /// handshake.
    pub fn resume<A: UpstreamApplication>(pre_running: Running<Arc<Tx>, M, A>) {
        let fut = async move {
            let Running {
                params,
                context,
                qconn,
            } = pre_running;
            let conn_stage = RunningApplication::new(params.draining.clone());
            let running_worker = IoWorker::new(params, conn_stage);

            let Closing {
                params,
                mut context,
                work_loop_result,
                mut qconn,
            } = running_worker.run(qconn, context).await;

            IoWorker::new(params, Close { work_loop_result })
                .close(&mut qconn, &mut context)
                .await;
        };

        crate::metrics::tokio_task::spawn_with_killswitch("quic_io_worker", fut);
    }

    /// Drives a QUIC connection from handshake to close in separate tokio
    /// tasks.
    ///
    /// It combines [`InitialQuicConnection::handshake`] and
    /// [`InitialQuicConnection::resume`] into a single call.
    pub fn start<A: UpstreamApplication>(self, app: A) -> QuicConnection {
        let (conn, handshake_fut) = Self::handshake_fut(self, app);

        let fut = async move {
            match handshake_fut.await {
                Ok(running) => Self::resume(running),
                Err(e) => {
                    log::debug!("QUIC handshake failed"; "error" => e)
                },
            }
        };

        crate::metrics::tokio_task::spawn_with_killswitch("quic_handshake", fut);

        conn
    }

    fn generate_key() -> u64 {
        let mut buf = [0; 8];

        boring::rand::rand_bytes(&mut buf).unwrap();

        u64::from_ne_bytes(buf)
    }
}

/// Derives a [`std::io::Result`] from the handshake work-loop result without
/// taking ownership of the original [`Result`].
pub(crate) fn make_handshake_result<T>(res: &QuicResult<()>) -> io::Result<T> {
    let Err(err) = res else {
        return Err(io::Error::other(
            "handshake transitioned to closing without error",
        ));
    };

    // BoxError does not force its content to be Clone, so we need to check
    // for the types we expect manually & clone/copy them.
    if let Some(hs_err) = err.downcast_ref::<HandshakeError>() {
        Err(hs_err.clone().into())
    } else if let Some(quiche_err) = err.downcast_ref::<quiche::Error>() {
        Err(io::Error::other(*quiche_err))
    } else {
        Err(io::Error::other(format!("unexpected handshake error: {err}")))
    }
}

pub(crate) struct QuicConnectionParams<Tx, M>
where
    Tx: DatagramSocketSend + Send + 'static + ?Sized,
    M: Metrics,
{
    pub writer_cfg: WriterConfig,
    pub initial_pkt: Option<Incoming>,
    pub shutdown_tx: mpsc::Sender<()>,
    /// Channel that signals connection map changes to the packet router.
    pub conn_map_cmd_tx: mpsc::UnboundedSender<ConnectionMapCommand>,
    pub scid: ConnectionId<'static>,
    pub metrics: M,
    pub cid_gen: EncryptedCidGenerator,
    pub token_manager: AddrValidationTokenManager,
    /// Flips to true when the listener starts its graceful shutdown.
    pub draining: watch::Receiver<bool>,
    #[cfg(feature = "perf-quic-listener-metrics")]
    pub init_rx_time: Option<SystemTime>,
    pub handshake_info: HandshakeInfo,
    pub quiche_conn: quiche::Connection,
    pub socket: Arc<Tx>,
    pub local_addr: SocketAddr,
    pub peer_addr: SocketAddr,
}

/// Metadata about an established QUIC connection.
///
/// While this struct allows access to some facets of a QUIC connection, it
/// notably does not represent the [quiche::Connection] itself. The crate
/// handles all interactions with [quiche] internally in a worker task.
pub struct QuicConnection {
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    audit_log_stats: Arc<QuicAuditStats>,
    stats: QuicConnectionStatsShared,
    scid: ConnectionId<'static>,
}

impl QuicConnection {
    /// The local address this connection listens on.
    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The remote address for this connection.
    #[inline]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// A handle to the [`QuicAuditStats`] for this connection.
    #[inline]
    pub fn audit_log_stats(&self) -> &Arc<QuicAuditStats> {
        &self.audit_log_stats
    }

    /// A handle to the [`QuicConnectionStats`] for this connection.
    #[inline]
    pub fn stats(&self) -> &QuicConnectionStatsShared {
        &self.stats
    }

    /// The QUIC source connection ID used by this connection.
    #[inline]
    pub fn scid(&self) -> &ConnectionId<'static> {
        &self.scid
    }
}

impl AsSocketStats for QuicConnection {
    #[inline]
    fn as_socket_stats(&self) -> SocketStats {
        // Only updated when the connection stops, which is fine, since this
        // is only used for logging after the connection is finished.
        self.stats.lock().unwrap().as_socket_stats()
    }

    #[inline]
    fn as_quic_stats(&self) -> Option<&Arc<QuicAuditStats>> {
        Some(&self.audit_log_stats)
    }
}

/// Details about a connection's QUIC handshake.
#[derive(Debug, Clone)]
pub struct HandshakeInfo {
    /// The time at which the connection was created.
    start_time: Instant,
    /// The timeout before which the handshake must complete.
    timeout: Option<Duration>,
    /// The real duration that the handshake took to complete.
    time_handshake: Option<Duration>,
    /// Address-validation token minted when the handshake completed.
    address_token: Option<Vec<u8>>,
}

impl HandshakeInfo {
    pub(crate) fn new(start_time: Instant, timeout: Option<Duration>) -> Self {
        Self {
            start_time,
            timeout,
            time_handshake: None,
            address_token: None,
        }
    }

    /// The time at which the connection was created.
    #[inline]
    pub fn start_time(&self) -> Instant {
        self.start_time
    }

    /// How long the handshake took to complete.
    #[inline]
    pub fn elapsed(&self) -> Duration {
        self.time_handshake.unwrap_or_default()
    }

    pub(crate) fn set_elapsed(&mut self) {
        let elapsed = self.start_time.elapsed();
        self.time_handshake = Some(elapsed)
    }

    /// The address-validation token issued for this client when the
    /// handshake completed, if any.
    ///
    /// The embedder decides how to deliver it; the transport itself has no
    /// NEW_TOKEN submission API.
    #[inline]
    pub fn address_token(&self) -> Option<&[u8]> {
        self.address_token.as_deref()
    }

    pub(crate) fn set_address_token(&mut self, token: Vec<u8>) {
        self.address_token = Some(token);
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.timeout.map(|timeout| self.start_time + timeout)
    }

    pub(crate) fn is_expired(&self) -> bool {
        self.timeout
            .is_some_and(|timeout| self.start_time.elapsed() >= timeout)
    }
}

/// The upstream (client-facing) application served over a QUIC connection.
///
/// The application is driven by an internal worker task, which also handles
/// I/O for the connection. The worker feeds inbound packets into the
/// [quiche::Connection], calls [`UpstreamApplication::process_reads`]
/// followed by [`UpstreamApplication::process_writes`], and then flushes any
/// pending outbound packets to the network. This repeats in a loop until
/// either the connection is closed or the application returns an error.
///
/// In between loop iterations, the worker yields until a new packet arrives,
/// a timer expires, or [`UpstreamApplication::wait_for_data`] resolves.
#[allow(unused_variables)] // for default functions
pub trait UpstreamApplication: Send + 'static {
    /// Callback to set up the application after the QUIC handshake completed
    /// successfully.
    ///
    /// # Errors
    /// Returning an error from this method immediately stops the worker loop
    /// and transitions to the connection closing stage.
    fn on_conn_established(
        &mut self, qconn: &mut quiche::Connection,
        handshake_info: &HandshakeInfo,
    ) -> QuicResult<()>;

    /// Determines whether the application's methods will be called by the
    /// worker.
    ///
    /// The function is checked in each iteration of the worker loop. Only
    /// `on_conn_established()` and `buffer()` bypass this check.
    fn should_act(&self) -> bool;

    /// A borrowed buffer for the worker to write outbound packets into.
    ///
    /// Any data in the buffer may be overwritten by the worker.
    fn buffer(&mut self) -> &mut [u8];

    /// Waits for an event to trigger the next iteration of the worker loop.
    ///
    /// The returned future is awaited in parallel to inbound packets and the
    /// connection's timers. Any one of those futures resolving triggers the
    /// next loop iteration. As for any future, it is **very important** that
    /// this method does not block the runtime.
    ///
    /// # Errors
    /// Returning an error from this method immediately stops the worker loop
    /// and transitions to the connection closing stage.
    fn wait_for_data(
        &mut self, qconn: &mut quiche::Connection,
    ) -> impl Future<Output = QuicResult<()>> + Send;

    /// Processes data received on the connection.
    ///
    /// This method is only called if `should_act()` returns `true` and any
    /// packets were received since the last worker loop iteration.
    ///
    /// # Errors
    /// Returning an error from this method immediately stops the worker loop
    /// and transitions to the connection closing stage.
    fn process_reads(&mut self, qconn: &mut quiche::Connection)
        -> QuicResult<()>;

    /// Adds data to be sent on the connection.
    ///
    /// Unlike `process_reads`, this method is called on every iteration of
    /// the worker loop (provided `should_act()` returns true), immediately
    /// before packets are pushed to the socket.
    ///
    /// # Errors
    /// Returning an error from this method immediately stops the worker loop
    /// and transitions to the connection closing stage.
    fn process_writes(
        &mut self, qconn: &mut quiche::Connection,
    ) -> QuicResult<()>;

    /// Callback to inspect the result of the worker task, before a final
    /// packet with a `CONNECTION_CLOSE` frame is flushed to the network.
    ///
    /// `connection_result` is [`Ok`] only if the connection was closed
    /// without any local error.
    fn on_conn_close<M: Metrics>(
        &mut self, qconn: &mut quiche::Connection, metrics: &M,
        connection_result: &QuicResult<()>,
    ) {
    }

    /// Called once when the listener starts its graceful shutdown, before
    /// the next batch of reads is processed. The application should stop
    /// admitting new work and begin winding the connection down.
    ///
    /// # Errors
    /// Returning an error from this method immediately stops the worker
    /// loop and transitions to the connection closing stage.
    fn on_draining(&mut self, qconn: &mut quiche::Connection) -> QuicResult<()> {
        Ok(())
    }
}
