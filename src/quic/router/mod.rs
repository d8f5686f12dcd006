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

pub(crate) mod acceptor;

use super::cid::hashed_cid;
use super::close_wait::CloseWaitRegistry;
use super::connection::ConnectionMap;
use super::connection::HandshakeInfo;
use super::connection::Incoming;
use super::connection::InitialQuicConnection;
use super::connection::QuicConnectionParams;
use super::io::worker::WriterConfig;
use crate::buf_factory::BufFactory;
use crate::buf_factory::PooledBuf;
use crate::metrics::labels;
use crate::metrics::Metrics;
use crate::quic::addr_validation_token::AddrValidationTokenManager;
use crate::quic::cid::EncryptedCidGenerator;
use crate::settings::Config;

use datagram_socket::DatagramSocketRecv;
use datagram_socket::DatagramSocketSend;
use datagram_socket::DatagramSocketSendExt;
use foundations::telemetry::log;
#[cfg(target_os = "linux")]
use foundations::telemetry::metrics::Counter;
#[cfg(target_os = "linux")]
use libc::sockaddr_in;
#[cfg(target_os = "linux")]
use libc::sockaddr_in6;
use quiche::ConnectionId;
use quiche::Header;
use quiche::MAX_CONN_ID_LEN;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::ready;
use std::task::Context;
use std::task::Poll;
use std::time::Duration;
use std::time::Instant;
use std::time::SystemTime;
use task_killswitch::spawn_with_killswitch;
use tokio::sync::mpsc;
use tokio::sync::watch;

type ConnStream<Tx, M> = mpsc::Receiver<io::Result<InitialQuicConnection<Tx, M>>>;

/// Datagrams processed per poll of the router, to bound the time one wakeup
/// can monopolize the worker.
const MAX_RECV_BURST: usize = 10;

/// Cadence of the eager close-wait sweep.
const CLOSE_WAIT_SWEEP_PERIOD: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct PollRecvData {
    bytes: usize,
    // The packet's source, e.g., the peer's address
    src_addr: SocketAddr,
    // The packet's original destination. If the original destination is
    // identical to the local listening address, this will be `None`.
    dst_addr_override: Option<SocketAddr>,
    rx_time: Option<SystemTime>,
    gro: Option<u16>,
}

/// A message from a connection worker requesting a connection-map change.
pub(crate) enum ConnectionMapCommand {
    /// Register an additional CID as a route to the connection owning
    /// `scid`.
    MapCid {
        cid: ConnectionId<'static>,
        scid: ConnectionId<'static>,
    },
    /// Drop a single CID alias.
    UnmapCid(ConnectionId<'static>),
    /// Drop the connection and all of its aliases.
    RemoveScid(ConnectionId<'static>),
    /// Drop the connection, but keep its CIDs resident in close-wait with
    /// the final CONNECTION_CLOSE datagram.
    CloseWait {
        scid: ConnectionId<'static>,
        cids: Vec<Vec<u8>>,
        close_pkt: Vec<u8>,
        hold: Duration,
    },
}

/// An `IngressPacketRouter` drives one worker socket: it routes [`Incoming`]
/// packets from the [recv half][rh] of the socket to live connections,
/// answers stray packets for recently-closed connections out of the
/// close-wait registry, and hands unknown Initials to the
/// [`InitialPacketHandler`].
///
/// [rh]: datagram_socket::DatagramSocketRecv
pub(crate) struct IngressPacketRouter<Tx, Rx, M, I>
where
    Tx: DatagramSocketSend + Send + 'static,
    M: Metrics,
{
    socket_tx: Arc<Tx>,
    socket_rx: Rx,
    local_addr: SocketAddr,
    config: Config,
    conns: ConnectionMap,
    close_wait: CloseWaitRegistry,
    close_wait_sweep: tokio::time::Interval,
    incoming_packet_handler: I,
    shutdown_tx: Option<mpsc::Sender<()>>,
    shutdown_rx: mpsc::Receiver<()>,
    conn_map_cmd_tx: mpsc::UnboundedSender<ConnectionMapCommand>,
    conn_map_cmd_rx: mpsc::UnboundedReceiver<ConnectionMapCommand>,
    accept_sink: mpsc::Sender<io::Result<InitialQuicConnection<Tx, M>>>,
    cid_gen: EncryptedCidGenerator,
    token_manager: AddrValidationTokenManager,
    /// Flips to true when the listener starts its graceful shutdown;
    /// handed to every spawned connection.
    draining: watch::Receiver<bool>,
    metrics: M,
    #[cfg(target_os = "linux")]
    udp_drop_count: u32,

    #[cfg(target_os = "linux")]
    reusable_cmsg_space: Vec<u8>,

    current_buf: PooledBuf,

    // Keep the hot-path metric handles here, to avoid cloning them per
    // packet
    #[cfg(target_os = "linux")]
    metrics_udp_drop_count: Counter,
}

impl<Tx, Rx, M, I> IngressPacketRouter<Tx, Rx, M, I>
where
    Tx: DatagramSocketSend + Send + 'static,
    Rx: DatagramSocketRecv,
    M: Metrics,
    I: InitialPacketHandler,
{
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: Config, socket_tx: Arc<Tx>, socket_rx: Rx,
        local_addr: SocketAddr, incoming_packet_handler: I,
        cid_gen: EncryptedCidGenerator,
        token_manager: AddrValidationTokenManager,
        draining: watch::Receiver<bool>, metrics: M,
    ) -> (Self, ConnStream<Tx, M>) {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let (accept_sink, accept_stream) = mpsc::channel(config.listen_backlog);
        let (conn_map_cmd_tx, conn_map_cmd_rx) = mpsc::unbounded_channel();

        let mut close_wait_sweep =
            tokio::time::interval(CLOSE_WAIT_SWEEP_PERIOD);
        close_wait_sweep
            .set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        (
            IngressPacketRouter {
                local_addr,
                socket_tx,
                socket_rx,
                conns: ConnectionMap::default(),
                close_wait: CloseWaitRegistry::default(),
                close_wait_sweep,
                incoming_packet_handler,
                shutdown_tx: Some(shutdown_tx),
                shutdown_rx,
                conn_map_cmd_tx,
                conn_map_cmd_rx,
                accept_sink,
                cid_gen,
                token_manager,
                draining,
                #[cfg(target_os = "linux")]
                udp_drop_count: 0,
                #[cfg(target_os = "linux")]
                // Specify CMSG space for GRO, timestamp, drop count,
                // IP_RECVORIGDSTADDR, and IPV6_RECVORIGDSTADDR. Even if
                // they're not all currently used, the cmsg buffer may have
                // been configured by a previous version of this crate with
                // the socket re-used on graceful restart. As such, this
                // vector should _only grow_.
                reusable_cmsg_space: nix::cmsg_space!(u32, nix::sys::time::TimeSpec, u16, sockaddr_in, sockaddr_in6),
                config,

                current_buf: BufFactory::get_max_buf(),

                #[cfg(target_os = "linux")]
                metrics_udp_drop_count: metrics.udp_drop_count(),

                metrics,
            },
            accept_stream,
        )
    }

    fn on_incoming(&mut self, mut incoming: Incoming) -> io::Result<()> {
        if let Some(dcid) = short_dcid(&incoming.buf) {
            if let Some(ev_sender) = self.conns.get(&dcid) {
                let _ = ev_sender.try_send(incoming);
                return Ok(());
            }

            if self.answer_from_close_wait(&dcid, incoming.peer_addr) {
                return Ok(());
            }
        }

        let hdr = Header::from_slice(&mut incoming.buf, MAX_CONN_ID_LEN)
            .map_err(|e| match e {
                quiche::Error::BufferTooShort | quiche::Error::InvalidPacket =>
                    labels::QuicInvalidInitialPacketError::FailedToParse.into(),
                e => io::Error::other(e),
            })?;

        if let Some(ev_sender) = self.conns.get(&hdr.dcid) {
            let _ = ev_sender.try_send(incoming);
            return Ok(());
        }

        let dcid = hdr.dcid.clone().into_owned();
        if self.answer_from_close_wait(&dcid, incoming.peer_addr) {
            return Ok(());
        }

        if self.shutdown_tx.is_none() {
            return Ok(());
        }

        let local_addr = incoming.local_addr;
        let peer_addr = incoming.peer_addr;

        #[cfg(feature = "perf-quic-listener-metrics")]
        let init_rx_time = incoming.rx_time;

        let new_connection = self.incoming_packet_handler.handle_initials(
            incoming,
            hdr,
            self.config.as_mut(),
        )?;

        match new_connection {
            Some(new_connection) => self.spawn_new_connection(
                new_connection,
                local_addr,
                peer_addr,
                #[cfg(feature = "perf-quic-listener-metrics")]
                init_rx_time,
            ),
            None => Ok(()),
        }
    }

    /// Retransmits a stored CONNECTION_CLOSE if `dcid` belongs to a
    /// connection in close-wait. Returns whether the datagram was consumed.
    fn answer_from_close_wait(
        &mut self, dcid: &ConnectionId, peer_addr: SocketAddr,
    ) -> bool {
        let Some(pkt) =
            self.close_wait.on_datagram(dcid.as_ref(), Instant::now())
        else {
            return false;
        };

        self.metrics.close_wait_retransmit_count().inc();

        let pkt = pkt.to_vec();
        let socket = Arc::clone(&self.socket_tx);
        spawn_with_killswitch(async move {
            let _ = socket.send_to(&pkt, peer_addr).await;
        });

        true
    }

    /// Creates a new [`InitialQuicConnection`] and queues it for the
    /// listener's accept stream.
    fn spawn_new_connection(
        &mut self, new_connection: NewConnection, local_addr: SocketAddr,
        peer_addr: SocketAddr,
        #[cfg(feature = "perf-quic-listener-metrics")] init_rx_time: Option<
            SystemTime,
        >,
    ) -> io::Result<()> {
        let NewConnection {
            conn,
            pending_cid,
            handshake_start_time,
            initial_pkt,
        } = new_connection;

        let Some(ref shutdown_tx) = self.shutdown_tx else {
            // don't create new connections if we're shutting down.
            return Ok(());
        };
        let Ok(send_permit) = self.accept_sink.try_reserve() else {
            // drop the connection if the backlog is full. the client will
            // retry.
            return Err(
                labels::QuicInvalidInitialPacketError::AcceptQueueOverflow.into(),
            );
        };

        let scid = conn.source_id().into_owned();
        let writer_cfg = WriterConfig {
            peer_addr,
            pending_cid: pending_cid.clone(),
            with_gso: self.config.has_gso,
            with_pktinfo: if self.local_addr.is_ipv4() {
                self.config.has_ippktinfo
            } else {
                self.config.has_ipv6pktinfo
            },
            max_udp_payload: self.config.max_send_udp_payload_size,
            non_bbr_burst_packets: self.config.non_bbr_burst_packets,
            cc_is_bbr: self.config.cc_is_bbr,
        };

        let handshake_info = HandshakeInfo::new(
            handshake_start_time,
            self.config.handshake_timeout,
        );

        let conn = InitialQuicConnection::new(QuicConnectionParams {
            writer_cfg,
            initial_pkt,
            shutdown_tx: shutdown_tx.clone(),
            conn_map_cmd_tx: self.conn_map_cmd_tx.clone(),
            scid: scid.clone(),
            metrics: self.metrics.clone(),
            cid_gen: self.cid_gen.clone(),
            token_manager: self.token_manager.clone(),
            draining: self.draining.clone(),
            #[cfg(feature = "perf-quic-listener-metrics")]
            init_rx_time,
            handshake_info,
            quiche_conn: conn,
            socket: Arc::clone(&self.socket_tx),
            local_addr,
            peer_addr,
        });

        conn.audit_log_stats
            .set_transport_handshake_start(instant_to_system(
                handshake_start_time,
            ));

        self.conns.insert(scid, &conn);

        if let Some(pending_cid) = pending_cid {
            // Register the client-chosen DCID so packets sent before the
            // client adopts our CID still route here, plus the hashed alias
            // for the connection's initial 4-tuple.
            let hashed = hashed_cid(local_addr, peer_addr, &pending_cid);
            self.conns.map_cid(hashed, &conn);
            self.conns.map_cid(pending_cid, &conn);
        }

        self.metrics.accepted_initial_packet_count().inc();

        send_permit.send(Ok(conn));
        Ok(())
    }
}

impl<Tx, Rx, M, I> IngressPacketRouter<Tx, Rx, M, I>
where
    Tx: DatagramSocketSend + Send + Sync + 'static,
    Rx: DatagramSocketRecv,
    M: Metrics,
    I: InitialPacketHandler,
{
    /// [`IngressPacketRouter::poll_recv_from`] is used if the underlying
    /// system or socket does not support rx timestamps or GRO.
    fn poll_recv_from(
        &mut self, cx: &mut Context<'_>,
    ) -> Poll<io::Result<PollRecvData>> {
        let mut buf = tokio::io::ReadBuf::new(&mut self.current_buf);
        let addr = ready!(self.socket_rx.poll_recv_from(cx, &mut buf))?;
        Poll::Ready(Ok(PollRecvData {
            bytes: buf.filled().len(),
            src_addr: addr,
            rx_time: None,
            gro: None,
            dst_addr_override: None,
        }))
    }

    fn poll_recv_and_rx_time(
        &mut self, cx: &mut Context<'_>,
    ) -> Poll<io::Result<PollRecvData>> {
        #[cfg(not(target_os = "linux"))]
        {
            self.poll_recv_from(cx)
        }

        #[cfg(target_os = "linux")]
        {
            use nix::errno::Errno;
            use nix::sys::socket::*;
            use std::net::SocketAddrV4;
            use std::net::SocketAddrV6;
            use std::os::fd::AsRawFd;
            use tokio::io::Interest;

            let Some(udp_socket) = self.socket_rx.as_udp_socket() else {
                // the given socket is not a UDP socket, fall back to the
                // simple poll_recv_from.
                return self.poll_recv_from(cx);
            };

            self.reusable_cmsg_space.clear();

            loop {
                let iov_s = &mut [io::IoSliceMut::new(&mut self.current_buf)];
                match udp_socket.try_io(Interest::READABLE, || {
                    recvmsg::<SockaddrStorage>(
                        udp_socket.as_raw_fd(),
                        iov_s,
                        Some(&mut self.reusable_cmsg_space),
                        MsgFlags::empty(),
                    )
                    .map_err(|x| x.into())
                }) {
                    Ok(r) => {
                        let bytes = r.bytes;

                        let address = match r.address {
                            Some(inner) => inner,
                            _ => return Poll::Ready(Err(Errno::EINVAL.into())),
                        };

                        let peer_addr = match address.family() {
                            Some(AddressFamily::Inet) => SocketAddrV4::from(
                                *address.as_sockaddr_in().unwrap(),
                            )
                            .into(),
                            Some(AddressFamily::Inet6) => SocketAddrV6::from(
                                *address.as_sockaddr_in6().unwrap(),
                            )
                            .into(),
                            _ => {
                                return Poll::Ready(Err(Errno::EINVAL.into()));
                            },
                        };

                        let mut rx_time = None;
                        let mut gro = None;
                        let mut dst_addr_override = None;

                        for cmsg in r.cmsgs() {
                            match cmsg {
                                ControlMessageOwned::RxqOvfl(c) => {
                                    if c != self.udp_drop_count {
                                        self.metrics_udp_drop_count.inc_by(
                                            (c - self.udp_drop_count) as u64,
                                        );
                                        self.udp_drop_count = c;
                                    }
                                },
                                ControlMessageOwned::ScmTimestampns(val) => {
                                    rx_time = SystemTime::UNIX_EPOCH
                                        .checked_add(val.into());
                                },
                                ControlMessageOwned::UdpGroSegments(val) =>
                                    gro = Some(val),
                                ControlMessageOwned::Ipv4OrigDstAddr(val) => {
                                    let source_addr = std::net::Ipv4Addr::from(
                                        u32::to_be(val.sin_addr.s_addr),
                                    );
                                    let source_port = u16::to_be(val.sin_port);

                                    let parsed_addr =
                                        SocketAddr::V4(SocketAddrV4::new(
                                            source_addr,
                                            source_port,
                                        ));

                                    dst_addr_override = resolve_dst_addr(
                                        &self.local_addr,
                                        &parsed_addr,
                                    );
                                },
                                ControlMessageOwned::Ipv6OrigDstAddr(val) => {
                                    // No byte flipping for the IPv6 address:
                                    // it's a byte array, not a u32.
                                    let source_addr = std::net::Ipv6Addr::from(
                                        val.sin6_addr.s6_addr,
                                    );
                                    let source_port = u16::to_be(val.sin6_port);
                                    let source_flowinfo =
                                        u32::to_be(val.sin6_flowinfo);
                                    let source_scope =
                                        u32::to_be(val.sin6_scope_id);

                                    let parsed_addr =
                                        SocketAddr::V6(SocketAddrV6::new(
                                            source_addr,
                                            source_port,
                                            source_flowinfo,
                                            source_scope,
                                        ));

                                    dst_addr_override = resolve_dst_addr(
                                        &self.local_addr,
                                        &parsed_addr,
                                    );
                                },
                                ControlMessageOwned::Ipv4PacketInfo(_) |
                                ControlMessageOwned::Ipv6PacketInfo(_) => {
                                    // We only want the destination address
                                    // from IP_RECVORIGDSTADDR, but these
                                    // arrive because IP_PKTINFO is set on
                                    // the socket.
                                },
                                _ => {
                                    return Poll::Ready(
                                        Err(Errno::EINVAL.into()),
                                    );
                                },
                            };
                        }

                        return Poll::Ready(Ok(PollRecvData {
                            bytes,
                            src_addr: peer_addr,
                            dst_addr_override,
                            rx_time,
                            gro,
                        }));
                    },
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        // Manually poll the socket to register read interest
                        // for `cx`, so the task wakes when the socket is
                        // readable again.
                        ready!(udp_socket.poll_recv_ready(cx))?
                    },
                    Err(e) => return Poll::Ready(Err(e)),
                }
            }
        }
    }

    fn handle_conn_map_commands(&mut self) {
        while let Ok(req) = self.conn_map_cmd_rx.try_recv() {
            match req {
                ConnectionMapCommand::MapCid { cid, scid } =>
                    self.conns.alias(cid, &scid),
                ConnectionMapCommand::UnmapCid(cid) => self.conns.unmap_cid(&cid),
                ConnectionMapCommand::RemoveScid(scid) =>
                    self.conns.remove(&scid),
                ConnectionMapCommand::CloseWait {
                    scid,
                    cids,
                    close_pkt,
                    hold,
                } => {
                    self.conns.remove(&scid);
                    self.close_wait.insert(
                        cids,
                        close_pkt,
                        hold,
                        Instant::now(),
                    );
                },
            }
        }
    }
}

// Quickly extract the connection id of a short quic packet without allocating
fn short_dcid(buf: &[u8]) -> Option<ConnectionId<'_>> {
    let is_short_dcid = buf.first()? >> 7 == 0;

    if is_short_dcid {
        buf.get(1..1 + MAX_CONN_ID_LEN).map(ConnectionId::from_ref)
    } else {
        None
    }
}

/// Converts an [`Instant`] to a [`SystemTime`], based on the current delta
/// between both clocks.
pub(crate) fn instant_to_system(ts: Instant) -> SystemTime {
    let now = Instant::now();
    let system_now = SystemTime::now();
    if let Some(delta) = now.checked_duration_since(ts) {
        return system_now - delta;
    }

    let delta = ts.checked_duration_since(now).expect("now < ts");
    system_now + delta
}

/// Determine if we should store the destination address for a packet, based
/// on an address parsed from a
/// [`ControlMessageOwned`](nix::sys::socket::ControlMessageOwned).
///
/// This prevents overriding the destination address if the packet was
/// originally addressed to `local`, as that would cause us to incorrectly
/// address packets when sending.
#[cfg(target_os = "linux")]
fn resolve_dst_addr(
    local: &SocketAddr, parsed: &SocketAddr,
) -> Option<SocketAddr> {
    if local != parsed {
        return Some(*parsed);
    }

    None
}

impl<Tx, Rx, M, I> Future for IngressPacketRouter<Tx, Rx, M, I>
where
    Tx: DatagramSocketSend + Send + Sync + 'static,
    Rx: DatagramSocketRecv + Unpin,
    M: Metrics,
    I: InitialPacketHandler + Unpin,
{
    type Output = io::Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<io::Result<()>> {
        let server_addr = self.local_addr;

        // Apply pending map changes first so packets never race a teardown.
        self.handle_conn_map_commands();

        let mut burst = 0;
        loop {
            match self.poll_recv_and_rx_time(cx) {
                Poll::Ready(Ok(PollRecvData {
                    bytes,
                    src_addr: peer_addr,
                    dst_addr_override,
                    rx_time,
                    gro,
                })) => {
                    let mut buf = std::mem::replace(
                        &mut self.current_buf,
                        BufFactory::get_max_buf(),
                    );
                    buf.truncate(bytes);

                    let send_from = if let Some(dst_addr) = dst_addr_override {
                        log::trace!(
                            "overriding local address";
                            "actual_local" => format!("{dst_addr:?}"),
                            "configured_local" => format!("{server_addr:?}")
                        );
                        dst_addr
                    } else {
                        server_addr
                    };

                    let res = self.on_incoming(Incoming {
                        peer_addr,
                        local_addr: send_from,
                        buf,
                        rx_time,
                        gro,
                    });

                    if let Err(e) = res {
                        let err_type = initial_packet_error_type(&e);
                        self.metrics
                            .rejected_initial_packet_count(err_type.clone())
                            .inc();

                        if matches!(
                            err_type,
                            labels::QuicInvalidInitialPacketError::Unexpected
                        ) {
                            // don't block packet routing on errors
                            let _ = self.accept_sink.try_send(Err(e));
                        }
                    }

                    burst += 1;
                    if burst == MAX_RECV_BURST {
                        // Hand the worker back to the scheduler so one busy
                        // socket cannot starve connection tasks; the wake
                        // re-queues us immediately.
                        cx.waker().wake_by_ref();
                        return Poll::Pending;
                    }
                },

                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),

                Poll::Pending => {
                    // Check whether any connections are still active
                    if self.shutdown_tx.is_some() && self.accept_sink.is_closed()
                    {
                        self.shutdown_tx = None;
                    }

                    if self.shutdown_rx.poll_recv(cx).is_ready() {
                        return Poll::Ready(Ok(()));
                    }

                    if self.close_wait_sweep.poll_tick(cx).is_ready() {
                        self.close_wait.sweep(Instant::now());
                    }

                    // Process any connection map signals that arrived while
                    // draining the socket.
                    self.handle_conn_map_commands();

                    return Poll::Pending;
                },
            }
        }
    }
}

/// Categorizes errors that are returned when handling packets which are not
/// associated with an established connection. The purpose is to suppress
/// logging of 'expected' errors (e.g. junk data sent to the UDP socket) to
/// prevent DoS.
fn initial_packet_error_type(
    e: &io::Error,
) -> labels::QuicInvalidInitialPacketError {
    Some(e)
        .filter(|e| e.kind() == io::ErrorKind::Other)
        .and_then(io::Error::get_ref)
        .and_then(|e| e.downcast_ref())
        .map_or(
            labels::QuicInvalidInitialPacketError::Unexpected,
            Clone::clone,
        )
}

/// An [`InitialPacketHandler`] turns unknown QUIC Initials into accepted
/// connections, or answers them statelessly (Retry, version negotiation,
/// refusal during shutdown).
pub(crate) trait InitialPacketHandler {
    fn handle_initials(
        &mut self, incoming: Incoming, hdr: Header<'static>,
        quiche_config: &mut quiche::Config,
    ) -> io::Result<Option<NewConnection>>;
}

/// A [`NewConnection`] describes a new [`quiche::Connection`] that can be
/// driven by an io worker.
pub(crate) struct NewConnection {
    pub(crate) conn: quiche::Connection,
    pub(crate) pending_cid: Option<ConnectionId<'static>>,
    pub(crate) initial_pkt: Option<Incoming>,
    /// When the handshake started. Recorded before [`quiche::accept`].
    pub(crate) handshake_start_time: Instant,
}
