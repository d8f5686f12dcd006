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

use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::task::Poll;
use std::time::Duration;
use std::time::Instant;
#[cfg(feature = "perf-quic-listener-metrics")]
use std::time::SystemTime;

use super::connection_stage::Close;
use super::connection_stage::ConnectionStage;
use super::connection_stage::ConnectionStageContext;
use super::connection_stage::Handshake;
use super::connection_stage::RunningApplication;
use super::connection_stage::Teardown;
use super::gso::*;

use crate::metrics::labels;
use crate::metrics::Metrics;
use crate::quic::addr_validation_token::AddrValidationTokenManager;
use crate::quic::cid::ConnectionIdGenerator;
use crate::quic::cid::EncryptedCidGenerator;
use crate::quic::connection::HandshakeError;
use crate::quic::connection::Incoming;
use crate::quic::connection::QuicConnectionStats;
use crate::quic::connection::UpstreamApplication;
use crate::quic::router::ConnectionMapCommand;
use crate::settings::UDP_PAYLOAD_SIZE_FLOOR;
use crate::QuicResult;

use datagram_socket::DatagramSocketSend;
use datagram_socket::DatagramSocketSendExt;
use datagram_socket::MaybeConnectedSocket;
use datagram_socket::QuicAuditStats;
use foundations::telemetry::log;
use quiche::ConnectionId;
use quiche::Error as QuicheError;
use quiche::SendInfo;
use std::sync::Arc;
use tokio::select;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::time;

// Number of incoming packets to be buffered in the incoming channel.
pub(crate) const INCOMING_QUEUE_SIZE: usize = 2048;

// Check if there are any incoming packets while sending data every this
// number of sent packets, because incoming packets contain acks and the
// receive queue has limited size.
pub(crate) const CHECK_INCOMING_QUEUE_RATIO: usize = INCOMING_QUEUE_SIZE / 16;

/// Stop queuing GSO packets, if packet size is below this threshold.
const GSO_THRESHOLD: usize = 1_000;

pub struct WriterConfig {
    pub pending_cid: Option<ConnectionId<'static>>,
    pub peer_addr: SocketAddr,
    pub with_gso: bool,
    pub with_pktinfo: bool,
    /// Configured cap on outgoing UDP payloads (also the GSO segment size).
    pub max_udp_payload: usize,
    /// Per-burst packet cap for non-BBR congestion controllers.
    pub non_bbr_burst_packets: usize,
    pub cc_is_bbr: bool,
}

/// A packet carved off a batch because its path differed from the batch's.
struct CarriedPacket {
    pkt: Vec<u8>,
    info: SendInfo,
}

#[derive(Default)]
pub(crate) struct WriteState {
    bytes_written: usize,
    segment_size: usize,
    num_pkts: usize,
    has_pending_data: bool,
    // If set, outgoing packets will be sent to the peer from the `send_from`
    // address rather than the listening socket.
    send_from: Option<SocketAddr>,
    /// Effective UDP payload cap. Starts at the configured maximum and drops
    /// to the floor when the kernel rejects a datagram size.
    max_udp_payload: usize,
    /// First packet of the next batch, split off because of a path change.
    carry: Option<CarriedPacket>,
}

enum PacketOutcome {
    /// The transport has nothing more to send right now.
    Done,
    /// A packet of the given size was appended to the batch.
    Written(usize),
    /// The new packet's path differs from the batch's. It was moved to
    /// `WriteState::carry`; the current batch must flush first.
    SplitBatch,
}

pub(crate) struct IoWorkerParams<Tx, M> {
    pub(crate) socket: MaybeConnectedSocket<Tx>,
    pub(crate) shutdown_tx: mpsc::Sender<()>,
    pub(crate) cfg: WriterConfig,
    pub(crate) audit_log_stats: Arc<QuicAuditStats>,
    pub(crate) write_state: WriteState,
    pub(crate) conn_map_cmd_tx: mpsc::UnboundedSender<ConnectionMapCommand>,
    pub(crate) cid_gen: EncryptedCidGenerator,
    pub(crate) token_manager: AddrValidationTokenManager,
    /// Flips to true when the listener starts its graceful shutdown.
    pub(crate) draining: watch::Receiver<bool>,
    /// Saved CONNECTION_CLOSE datagram, carried between worker stages.
    pub(crate) close_datagram: Option<Vec<u8>>,
    #[cfg(feature = "perf-quic-listener-metrics")]
    pub(crate) init_rx_time: Option<SystemTime>,
    pub(crate) metrics: M,
}

pub(crate) struct IoWorker<Tx, M, S> {
    socket: MaybeConnectedSocket<Tx>,
    /// Signals to the listener task that the connection has gone away
    /// (nothing is sent here, the listener just detects the sender dropped).
    shutdown_tx: mpsc::Sender<()>,
    cfg: WriterConfig,
    audit_log_stats: Arc<QuicAuditStats>,
    write_state: WriteState,
    conn_map_cmd_tx: mpsc::UnboundedSender<ConnectionMapCommand>,
    cid_gen: EncryptedCidGenerator,
    token_manager: AddrValidationTokenManager,
    draining: watch::Receiver<bool>,
    /// Copy of the last flushed datagram that carried our CONNECTION_CLOSE,
    /// retained for the close-wait registry.
    close_datagram: Option<Vec<u8>>,
    #[cfg(feature = "perf-quic-listener-metrics")]
    init_rx_time: Option<SystemTime>,
    metrics: M,
    conn_stage: S,
}

impl<Tx, M, S> IoWorker<Tx, M, S>
where
    Tx: DatagramSocketSend + Send,
    M: Metrics,
    S: ConnectionStage,
{
    pub(crate) fn new(params: IoWorkerParams<Tx, M>, conn_stage: S) -> Self {
        log::trace!("creating io worker with stage: {conn_stage:?}");

        let mut write_state = params.write_state;
        if write_state.max_udp_payload == 0 {
            write_state.max_udp_payload = params.cfg.max_udp_payload;
        }

        Self {
            socket: params.socket,
            shutdown_tx: params.shutdown_tx,
            cfg: params.cfg,
            audit_log_stats: params.audit_log_stats,
            write_state,
            conn_map_cmd_tx: params.conn_map_cmd_tx,
            cid_gen: params.cid_gen,
            token_manager: params.token_manager,
            draining: params.draining,
            close_datagram: params.close_datagram,
            #[cfg(feature = "perf-quic-listener-metrics")]
            init_rx_time: params.init_rx_time,
            metrics: params.metrics,
            conn_stage,
        }
    }

    async fn work_loop<A: UpstreamApplication>(
        &mut self, qconn: &mut quiche::Connection,
        ctx: &mut ConnectionStageContext<A>,
    ) -> QuicResult<()> {
        const DEFAULT_SLEEP: Duration = Duration::from_secs(60);
        let mut current_deadline: Option<Instant> = None;
        let sleep = time::sleep(DEFAULT_SLEEP);
        tokio::pin!(sleep);

        // A dedicated wake handle for the shutdown signal; the stage's
        // pre-iteration check does the actual work on the next pass. One
        // wakeup is all it takes, and a closed channel (the shutdown handle
        // was dropped) must not keep completing the select arm.
        let mut draining_wake = self.draining.clone();
        let mut draining_signalled = false;

        loop {
            let now = Instant::now();

            self.write_state.has_pending_data = true;

            while self.write_state.has_pending_data {
                let mut packets_sent = 0;

                // Try to clear all received packets before writing, because
                // incoming packets contain acks and the receive queue stalls
                // once full.
                let mut did_recv = false;
                while let Some(pkt) = ctx
                    .in_pkt
                    .take()
                    .or_else(|| ctx.incoming_pkt_receiver.try_recv().ok())
                {
                    self.process_incoming(qconn, pkt)?;
                    did_recv = true;
                }

                self.conn_stage.on_read(did_recv, qconn, ctx)?;

                if qconn.is_established() {
                    self.provision_scids(qconn);
                }
                self.drain_retired_scids(qconn);

                while self.write_state.has_pending_data &&
                    packets_sent < CHECK_INCOMING_QUEUE_RATIO
                {
                    self.gather_data_from_quiche_conn(qconn, ctx.buffer())?;
                    self.maybe_capture_close(qconn, ctx.buffer());

                    // Break if the connection is closed
                    if qconn.is_closed() {
                        return Ok(());
                    }

                    self.flush_buffer_to_socket(ctx.buffer()).await;
                    packets_sent += self.write_state.num_pkts;

                    if let ControlFlow::Break(reason) =
                        self.conn_stage.on_flush(qconn, ctx)
                    {
                        return reason;
                    }
                }
            }

            let new_deadline =
                min_of_some(qconn.timeout_instant(), self.conn_stage.wait_deadline());

            if new_deadline != current_deadline {
                current_deadline = new_deadline;

                sleep
                    .as_mut()
                    .reset(new_deadline.unwrap_or(now + DEFAULT_SLEEP).into());
            }

            let incoming_recv = &mut ctx.incoming_pkt_receiver;
            let application = &mut ctx.application;
            select! {
                biased;
                () = &mut sleep => {
                    // The timeout arm stays at the top of this biased select
                    // so it is polled every time; burying it behind another
                    // arm could starve the sleep and hang connections.
                    qconn.on_timeout();

                    current_deadline = None;
                    sleep.as_mut().reset((now + DEFAULT_SLEEP).into());
                }
                Some(pkt) = incoming_recv.recv() => ctx.in_pkt = Some(pkt),
                _ = draining_wake.changed(), if !draining_signalled => {
                    draining_signalled = true;
                }
                status = self.wait_for_data_or_handshake(qconn, application) => status?,
            };

            if let ControlFlow::Break(reason) = self.conn_stage.post_wait(qconn) {
                return reason;
            }
        }
    }

    #[inline]
    fn gather_data_from_quiche_conn(
        &mut self, qconn: &mut quiche::Connection, send_buf: &mut [u8],
    ) -> QuicResult<usize> {
        self.fill_send_buffer(qconn, send_buf)
    }

    #[cfg(feature = "perf-quic-listener-metrics")]
    fn measure_complete_handshake_time(&mut self) {
        if let Some(init_rx_time) = self.init_rx_time.take() {
            if let Ok(delta) = init_rx_time.elapsed() {
                self.metrics
                    .handshake_time_seconds(
                        labels::QuicHandshakeStage::HandshakeResponse,
                    )
                    .observe(delta.as_nanos() as u64);
            }
        }
    }

    /// Tops up the source CIDs the transport advertises, registering each
    /// fresh CID with the packet router for ingress routing.
    fn provision_scids(&mut self, qconn: &mut quiche::Connection) {
        while qconn.scids_left() > 0 {
            let cid = self.cid_gen.new_connection_id();
            let reset_token = self.cid_gen.stateless_reset_token(&cid);

            match qconn.new_scid(&cid, reset_token, false) {
                Ok(_) => {
                    let scid = qconn.source_id().into_owned();
                    let _ = self
                        .conn_map_cmd_tx
                        .send(ConnectionMapCommand::MapCid { cid, scid });
                },
                Err(_) => break,
            }
        }
    }

    /// Unregisters CIDs the peer has retired.
    fn drain_retired_scids(&mut self, qconn: &mut quiche::Connection) {
        while let Some(cid) = qconn.retired_scid_next() {
            let _ = self
                .conn_map_cmd_tx
                .send(ConnectionMapCommand::UnmapCid(cid));
        }
    }

    /// Retains a copy of the outgoing datagram if it carries our
    /// CONNECTION_CLOSE, for retransmission from close-wait.
    fn maybe_capture_close(
        &mut self, qconn: &quiche::Connection, send_buf: &[u8],
    ) {
        if self.write_state.bytes_written > 0 && qconn.local_error().is_some() {
            self.close_datagram =
                Some(send_buf[..self.write_state.bytes_written].to_vec());
        }
    }

    fn fill_send_buffer(
        &mut self, qconn: &mut quiche::Connection, send_buf: &mut [u8],
    ) -> QuicResult<usize> {
        let mut segment_size = None;
        let mut send_info = None;

        self.write_state.num_pkts = 0;
        self.write_state.bytes_written = 0;

        let max_udp = self.write_state.max_udp_payload;
        let send_buf = {
            let trunc = UDP_MAX_GSO_PACKET_SIZE.min(send_buf.len());
            &mut send_buf[..trunc]
        };

        // A packet split off the previous batch restarts this one.
        if let Some(carried) = self.write_state.carry.take() {
            send_buf[..carried.pkt.len()].copy_from_slice(&carried.pkt);
            self.write_state.bytes_written = carried.pkt.len();
            self.write_state.num_pkts = 1;
            self.write_state.send_from = Some(carried.info.from);
            segment_size = Some(carried.pkt.len());
            send_info = Some(carried.info);
        }

        // Burst budget: what the congestion controller wants to emit in one
        // quantum, bounded by the GSO segment count and, for loss-based
        // controllers, the fixed burst cap.
        let max_segments = {
            let mut n = (qconn.send_quantum() / max_udp)
                .clamp(1, UDP_MAX_SEGMENT_COUNT);
            if !self.cfg.cc_is_bbr {
                n = n.min(self.cfg.non_bbr_burst_packets);
            }
            n
        };

        let buffer_write_outcome = loop {
            let outcome = self.write_packet_to_buffer(
                qconn,
                send_buf,
                &mut send_info,
                segment_size,
                max_udp,
            );

            let packet_size = match outcome {
                Ok(PacketOutcome::Done) => {
                    self.write_state.has_pending_data = false;

                    break Ok(0);
                },
                Ok(PacketOutcome::SplitBatch) => {
                    self.write_state.has_pending_data = true;

                    break Ok(self.write_state.bytes_written);
                },
                Ok(PacketOutcome::Written(bytes_written)) => {
                    self.write_state.has_pending_data = true;

                    bytes_written
                },
                Err(e) => break Err(e),
            };

            // Flush to network after generating a single packet when GSO
            // is disabled.
            if !self.cfg.with_gso {
                break Ok(packet_size);
            }

            let max_send_size = tune_max_send_size(
                segment_size,
                qconn.send_quantum(),
                send_buf.len(),
            );

            let buffer_is_full = self.write_state.num_pkts >= max_segments ||
                self.write_state.bytes_written >= max_send_size;

            if buffer_is_full {
                break Ok(packet_size);
            }

            // Flush to network when the newly generated packet size differs
            // from the previously written packet, as GSO needs packets of
            // equal size, except for the last one in the buffer.
            match segment_size {
                Some(size)
                    if packet_size != size || packet_size < GSO_THRESHOLD =>
                    break Ok(packet_size),
                None => segment_size = Some(packet_size),
                _ => (),
            }
        };

        self.write_state.segment_size =
            segment_size.unwrap_or(self.write_state.bytes_written);

        buffer_write_outcome
    }

    fn write_packet_to_buffer(
        &mut self, qconn: &mut quiche::Connection, send_buf: &mut [u8],
        send_info: &mut Option<SendInfo>, segment_size: Option<usize>,
        max_udp: usize,
    ) -> QuicResult<PacketOutcome> {
        let pkt_start = self.write_state.bytes_written;
        let mut pkt_buf = &mut send_buf[pkt_start..];
        // Never let one packet exceed the segment size, for GSO to function
        // properly; the floored payload cap bounds everything.
        let cap = segment_size.unwrap_or(max_udp).min(max_udp);
        if pkt_buf.len() > cap {
            pkt_buf = &mut pkt_buf[..cap];
        }

        match qconn.send(pkt_buf) {
            Ok((packet_size, info)) => {
                if let Some(prev) = send_info.as_ref() {
                    if prev.from != info.from || prev.to != info.to {
                        // Different path: finish the current batch and carry
                        // this packet into the next one.
                        self.write_state.carry = Some(CarriedPacket {
                            pkt: send_buf[pkt_start..pkt_start + packet_size]
                                .to_vec(),
                            info,
                        });

                        return Ok(PacketOutcome::SplitBatch);
                    }
                }

                let _ = send_info.get_or_insert(info);

                self.write_state.bytes_written += packet_size;
                self.write_state.num_pkts += 1;
                self.write_state.send_from =
                    send_info.as_ref().map(|info| info.from);

                Ok(PacketOutcome::Written(packet_size))
            },
            Err(QuicheError::Done) => {
                // Flush to network and yield when there are no more packets
                // to write.
                Ok(PacketOutcome::Done)
            },
            Err(e) => {
                if let Some(local_error) = qconn.local_error() {
                    self.audit_log_stats
                        .set_sent_conn_close_transport_error_code(
                            local_error.error_code as i64,
                        );
                    log::error!(
                        "quiche send failed, connection closed";
                        "error_code" => local_error.error_code
                    );
                } else {
                    let internal_error_code =
                        quiche::WireErrorCode::InternalError as u64;

                    self.audit_log_stats
                        .set_sent_conn_close_transport_error_code(
                            internal_error_code as i64,
                        );

                    let _ = qconn.close(false, internal_error_code, &[]);
                    log::error!(
                        "quiche send failed, closing with INTERNAL_ERROR";
                        "error" => %e
                    );
                }

                Err(Box::new(e))
            },
        }
    }

    async fn flush_buffer_to_socket(&mut self, send_buf: &[u8]) {
        if self.write_state.bytes_written == 0 {
            return;
        }

        let current_send_buf = &send_buf[..self.write_state.bytes_written];
        let send_res = if let (Some(udp_socket), true) =
            (self.socket.as_udp_socket(), self.cfg.with_gso)
        {
            // Only UDP supports GSO
            send_to(
                udp_socket,
                self.cfg.peer_addr,
                self.write_state.send_from.filter(|_| self.cfg.with_pktinfo),
                current_send_buf,
                self.write_state.segment_size,
                self.metrics.write_errors(labels::QuicWriteError::WouldBlock),
                self.metrics.send_to_wouldblock_duration_s(),
            )
            .await
        } else {
            self.socket
                .send_to(current_send_buf, self.cfg.peer_addr)
                .await
        };

        #[cfg(feature = "perf-quic-listener-metrics")]
        self.measure_complete_handshake_time();

        match send_res {
            Ok(n) =>
                if n < self.write_state.bytes_written {
                    self.metrics
                        .write_errors(labels::QuicWriteError::Partial)
                        .inc();
                },
            Err(e) if is_packet_too_large(&e) => {
                // The path rejected our datagram size. Fall back to the
                // payload floor for this connection; the transport
                // retransmits whatever the kernel refused.
                self.write_state.max_udp_payload = UDP_PAYLOAD_SIZE_FLOOR;
                self.metrics
                    .write_errors(labels::QuicWriteError::TooLarge)
                    .inc();
                log::debug!(
                    "datagram rejected by kernel, lowering payload cap";
                    "peer" => self.cfg.peer_addr,
                    "cap" => UDP_PAYLOAD_SIZE_FLOOR
                );
            },
            Err(_) => {
                self.metrics.write_errors(labels::QuicWriteError::Err).inc();
            },
        }
    }

    /// Process the incoming packet.
    fn process_incoming(
        &mut self, qconn: &mut quiche::Connection, mut pkt: Incoming,
    ) -> QuicResult<()> {
        let recv_info = quiche::RecvInfo {
            from: pkt.peer_addr,
            to: pkt.local_addr,
        };

        if let Some(gro) = pkt.gro {
            for dgram in pkt.buf.chunks_mut(gro as usize) {
                qconn.recv(dgram, recv_info)?;
            }
        } else {
            qconn.recv(&mut pkt.buf, recv_info)?;
        }

        Ok(())
    }

    /// When a connection is established, process application data; if not,
    /// the task was probably polled following a TLS wakeup, so check if
    /// quiche has any handshake packets to send.
    async fn wait_for_data_or_handshake<A: UpstreamApplication>(
        &mut self, qconn: &mut quiche::Connection, application: &mut A,
    ) -> QuicResult<()> {
        if application.should_act() {
            application.wait_for_data(qconn).await
        } else {
            self.wait_for_quiche(qconn, application).await
        }
    }

    /// Check if quiche has any packets to send and flush them to the socket.
    ///
    /// This drives the asynchronous TLS handshake: each call to
    /// `gather_data_from_quiche_conn` attempts to progress the handshake via
    /// `quiche::Connection::send`, and once something lands in the send
    /// buffer it is flushed to the network.
    async fn wait_for_quiche<A: UpstreamApplication>(
        &mut self, qconn: &mut quiche::Connection, app: &mut A,
    ) -> QuicResult<()> {
        let populate_send_buf = std::future::poll_fn(|_| {
            match self.gather_data_from_quiche_conn(qconn, app.buffer()) {
                Ok(bytes_written) => {
                    // Avoid consecutive calls to gather() without a flush();
                    // otherwise data in the buffer would be overwritten.
                    if bytes_written == 0 && self.write_state.bytes_written == 0 {
                        Poll::Pending
                    } else {
                        Poll::Ready(Ok(()))
                    }
                },
                _ => Poll::Ready(Err(quiche::Error::TlsFail)),
            }
        })
        .await;

        if populate_send_buf.is_err() {
            return Err(Box::new(quiche::Error::TlsFail));
        }

        self.maybe_capture_close(qconn, app.buffer());
        self.flush_buffer_to_socket(app.buffer()).await;

        Ok(())
    }
}

pub struct Running<Tx, M, A> {
    pub(crate) params: IoWorkerParams<Tx, M>,
    pub(crate) context: ConnectionStageContext<A>,
    pub(crate) qconn: quiche::Connection,
}

pub(crate) struct Closing<Tx, M, A> {
    pub(crate) params: IoWorkerParams<Tx, M>,
    pub(crate) context: ConnectionStageContext<A>,
    pub(crate) work_loop_result: QuicResult<()>,
    pub(crate) qconn: quiche::Connection,
}

pub enum RunningOrClosing<Tx, M, A> {
    Running(Running<Tx, M, A>),
    Closing(Closing<Tx, M, A>),
}

impl<Tx, M> IoWorker<Tx, M, Handshake>
where
    Tx: DatagramSocketSend + Send,
    M: Metrics,
{
    pub(crate) async fn run<A>(
        mut self, mut qconn: quiche::Connection,
        mut ctx: ConnectionStageContext<A>,
    ) -> RunningOrClosing<Tx, M, A>
    where
        A: UpstreamApplication,
    {
        let mut work_loop_result = self.work_loop(&mut qconn, &mut ctx).await;
        if work_loop_result.is_ok() && qconn.is_closed() {
            work_loop_result = Err(HandshakeError::ConnectionClosed.into());
        }

        if let Err(err) = &work_loop_result {
            self.metrics.failed_handshakes(err.into()).inc();

            return RunningOrClosing::Closing(Closing {
                params: self.into(),
                context: ctx,
                work_loop_result,
                qconn,
            });
        };

        match self.on_conn_established(&mut qconn, &mut ctx.application) {
            Ok(()) => RunningOrClosing::Running(Running {
                params: self.into(),
                context: ctx,
                qconn,
            }),
            Err(e) => {
                log::warn!("connection setup after handshake failed"; "error" => %e);

                RunningOrClosing::Closing(Closing {
                    params: self.into(),
                    context: ctx,
                    work_loop_result,
                    qconn,
                })
            },
        }
    }

    fn on_conn_established<A: UpstreamApplication>(
        &mut self, qconn: &mut quiche::Connection, driver: &mut A,
    ) -> QuicResult<()> {
        // Only calculate the handshake duration and run the post-handshake
        // work if this is the first time is_established == true.
        if self.audit_log_stats.transport_handshake_duration_us() == -1 {
            self.conn_stage.handshake_info.set_elapsed();

            // One fresh address-validation token per completed handshake.
            // The transport has no NEW_TOKEN submission API, so the token
            // rides on the handshake record for the embedder to deliver.
            let token = self.token_manager.gen_session(self.cfg.peer_addr);
            self.conn_stage.handshake_info.set_address_token(token);

            let handshake_info = &self.conn_stage.handshake_info;

            self.audit_log_stats
                .set_transport_handshake_duration(handshake_info.elapsed());

            driver.on_conn_established(qconn, handshake_info)?;
        }

        self.provision_scids(qconn);

        if let Some(cid) = self.cfg.pending_cid.take() {
            let _ = self
                .conn_map_cmd_tx
                .send(ConnectionMapCommand::UnmapCid(cid));
        }

        Ok(())
    }
}

impl<Tx, M, S> From<IoWorker<Tx, M, S>> for IoWorkerParams<Tx, M> {
    fn from(value: IoWorker<Tx, M, S>) -> Self {
        Self {
            socket: value.socket,
            shutdown_tx: value.shutdown_tx,
            cfg: value.cfg,
            audit_log_stats: value.audit_log_stats,
            write_state: value.write_state,
            conn_map_cmd_tx: value.conn_map_cmd_tx,
            cid_gen: value.cid_gen,
            token_manager: value.token_manager,
            draining: value.draining,
            close_datagram: value.close_datagram,
            #[cfg(feature = "perf-quic-listener-metrics")]
            init_rx_time: value.init_rx_time,
            metrics: value.metrics,
        }
    }
}

impl<Tx, M> IoWorker<Tx, M, RunningApplication>
where
    Tx: DatagramSocketSend + Send,
    M: Metrics,
{
    pub(crate) async fn run<A: UpstreamApplication>(
        mut self, mut qconn: quiche::Connection,
        mut ctx: ConnectionStageContext<A>,
    ) -> Closing<Tx, M, A> {
        let work_loop_result = self.work_loop(&mut qconn, &mut ctx).await;

        Closing {
            params: self.into(),
            context: ctx,
            work_loop_result,
            qconn,
        }
    }
}

impl<Tx, M> IoWorker<Tx, M, Close>
where
    Tx: DatagramSocketSend + Send,
    M: Metrics,
{
    pub(crate) async fn close<A: UpstreamApplication>(
        mut self, qconn: &mut quiche::Connection,
        ctx: &mut ConnectionStageContext<A>,
    ) {
        if ctx.application.should_act() {
            ctx.application.on_conn_close(
                qconn,
                &self.metrics,
                &self.conn_stage.work_loop_result,
            );
        }

        // Flush the final CONNECTION_CLOSE (flow control never blocks it).
        let _ = self.gather_data_from_quiche_conn(qconn, ctx.buffer());
        self.maybe_capture_close(qconn, ctx.buffer());
        self.flush_buffer_to_socket(ctx.buffer()).await;

        *ctx.stats.lock().unwrap() = QuicConnectionStats::from_conn(qconn);

        if let Some(err) = qconn.peer_error() {
            if err.is_app {
                self.audit_log_stats
                    .set_recvd_conn_close_application_error_code(
                        err.error_code as _,
                    );
            } else {
                self.audit_log_stats
                    .set_recvd_conn_close_transport_error_code(
                        err.error_code as _,
                    );
            }
        }

        if let Some(err) = qconn.local_error() {
            if err.is_app {
                self.audit_log_stats
                    .set_sent_conn_close_application_error_code(
                        err.error_code as _,
                    );
            } else {
                self.audit_log_stats
                    .set_sent_conn_close_transport_error_code(
                        err.error_code as _,
                    );
            }
        }

        self.retire_connection(qconn);

        if let Err(work_loop_error) = self.conn_stage.work_loop_result {
            self.audit_log_stats
                .set_connection_close_reason(work_loop_error);
        }
    }

    /// Removes the connection from the router map, applying the close
    /// stage's teardown policy.
    fn retire_connection(&mut self, qconn: &quiche::Connection) {
        let scid = qconn.source_id().into_owned();
        let close_datagram = self.close_datagram.take();

        let cmd = match self.conn_stage.teardown(qconn, close_datagram) {
            Teardown::CloseWait { close_pkt, hold } => {
                let mut cids: Vec<Vec<u8>> =
                    qconn.source_ids().map(|cid| cid.to_vec()).collect();
                if let Some(cid) = self.cfg.pending_cid.take() {
                    cids.push(cid.to_vec());
                }

                ConnectionMapCommand::CloseWait {
                    scid,
                    cids,
                    close_pkt,
                    hold,
                }
            },
            Teardown::Forget => {
                if let Some(cid) = self.cfg.pending_cid.take() {
                    let _ = self
                        .conn_map_cmd_tx
                        .send(ConnectionMapCommand::UnmapCid(cid));
                }

                ConnectionMapCommand::RemoveScid(scid)
            },
        };

        let _ = self.conn_map_cmd_tx.send(cmd);

        self.metrics.connections_in_memory().dec();
    }
}

/// Returns the minimum of `v1` and `v2`, ignoring `None`s.
fn min_of_some<T: Ord>(v1: Option<T>, v2: Option<T>) -> Option<T> {
    match (v1, v2) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (Some(v), _) | (_, Some(v)) => Some(v),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_of_some_prefers_present_values() {
        assert_eq!(min_of_some(Some(3), Some(5)), Some(3));
        assert_eq!(min_of_some(Some(3), None), Some(3));
        assert_eq!(min_of_some(None, Some(5)), Some(5));
        assert_eq!(min_of_some::<u8>(None, None), None);
    }
}
