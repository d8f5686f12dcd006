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

use std::fs::File;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use datagram_socket::DatagramSocketSend;
use datagram_socket::DatagramSocketSendExt;
use datagram_socket::MAX_DATAGRAM_SIZE;
use foundations::telemetry::log;
use quiche::ConnectionId;
use quiche::Header;
use quiche::RetryConnectionIds;
use quiche::Type as PacketType;
use task_killswitch::spawn_with_killswitch;
use tokio::sync::watch;

use crate::metrics::labels;
use crate::metrics::Metrics;
use crate::quic::addr_validation_token::AddrValidationTokenManager;
use crate::quic::addr_validation_token::TokenDisposition;
use crate::quic::cid::ConnectionIdGenerator;
use crate::quic::cid::EncryptedCidGenerator;
use crate::quic::make_qlog_writer;
use crate::quic::router::NewConnection;
use crate::quic::Incoming;
use crate::QuicResultExt;

use super::InitialPacketHandler;

/// A [`ConnectionAcceptor`] is an [`InitialPacketHandler`] that accepts QUIC
/// connections, forcing unvalidated clients through a stateless Retry first.
pub(crate) struct ConnectionAcceptor<S, M> {
    config: ConnectionAcceptorConfig,
    socket: Arc<S>,
    token_manager: AddrValidationTokenManager,
    cid_gen: EncryptedCidGenerator,
    /// Flips to `true` when the listener starts a graceful shutdown; new
    /// connections are refused from then on.
    draining: watch::Receiver<bool>,
    metrics: M,
}

pub(crate) struct ConnectionAcceptorConfig {
    pub(crate) disable_client_ip_validation: bool,
    pub(crate) qlog_dir: Option<String>,
    pub(crate) keylog_file: Option<File>,
    #[cfg(target_os = "linux")]
    pub(crate) with_pktinfo: bool,
}

impl<S, M> ConnectionAcceptor<S, M>
where
    S: DatagramSocketSend + Send + 'static,
    M: Metrics,
{
    pub(crate) fn new(
        config: ConnectionAcceptorConfig, socket: Arc<S>,
        token_manager: AddrValidationTokenManager,
        cid_gen: EncryptedCidGenerator, draining: watch::Receiver<bool>,
        metrics: M,
    ) -> Self {
        Self {
            config,
            socket,
            token_manager,
            cid_gen,
            draining,
            metrics,
        }
    }

    fn accept_conn(
        &mut self, incoming: Incoming, retry_cids: Option<RetryConnectionIds>,
        pending_cid: ConnectionId<'static>, quiche_config: &mut quiche::Config,
    ) -> io::Result<Option<NewConnection>> {
        let handshake_start_time = Instant::now();
        let scid = self.cid_gen.new_connection_id();

        let mut conn = if let Some(retry_cids) = retry_cids {
            quiche::accept_with_retry(
                &scid,
                retry_cids,
                incoming.local_addr,
                incoming.peer_addr,
                quiche_config,
            )
        } else {
            quiche::accept(
                &scid,
                None,
                incoming.local_addr,
                incoming.peer_addr,
                quiche_config,
            )
        }
        .into_io()?;

        if let Some(qlog_dir) = &self.config.qlog_dir {
            if let Ok(writer) = make_qlog_writer(qlog_dir, &scid) {
                conn.set_qlog(
                    Box::new(writer),
                    "h3-ingress qlog".to_string(),
                    format!("h3-ingress qlog scid={scid:?}"),
                );
            }
        }

        if let Some(keylog_file) = &self.config.keylog_file {
            if let Ok(keylog_clone) = keylog_file.try_clone() {
                conn.set_keylog(Box::new(keylog_clone));
            }
        }

        Ok(Some(NewConnection {
            conn,
            handshake_start_time,
            pending_cid: Some(pending_cid),
            initial_pkt: Some(incoming),
        }))
    }

    /// Answers an Initial with a stateless datagram produced by `writer`.
    fn handshake_reply(
        &self, incoming: Incoming,
        writer: impl FnOnce(&mut [u8]) -> io::Result<usize>,
    ) -> io::Result<Option<NewConnection>> {
        let mut send_buf = [0u8; MAX_DATAGRAM_SIZE];
        let written = writer(&mut send_buf)?;
        let socket = Arc::clone(&self.socket);
        #[cfg(target_os = "linux")]
        let with_pktinfo = self.config.with_pktinfo;
        #[cfg(target_os = "linux")]
        let would_block_metric = self
            .metrics
            .write_errors(labels::QuicWriteError::WouldBlock);
        #[cfg(target_os = "linux")]
        let send_to_wouldblock_duration_s =
            self.metrics.send_to_wouldblock_duration_s();

        spawn_with_killswitch(async move {
            let send_buf = &send_buf[..written];
            let to = incoming.peer_addr;

            #[allow(unused_variables)]
            let Some(udp) = socket.as_udp_socket() else {
                let _ = socket.send_to(send_buf, to).await;
                return;
            };

            #[cfg(target_os = "linux")]
            {
                let from = Some(incoming.local_addr).filter(|_| with_pktinfo);
                let _ = crate::quic::io::gso::send_to(
                    udp,
                    to,
                    from,
                    send_buf,
                    send_buf.len(),
                    would_block_metric,
                    send_to_wouldblock_duration_s,
                )
                .await;
            }

            #[cfg(not(target_os = "linux"))]
            let _ = socket.send_to(send_buf, to).await;
        });

        Ok(None)
    }

    fn stateless_retry(
        &mut self, incoming: Incoming, hdr: Header,
    ) -> io::Result<Option<NewConnection>> {
        let scid = self.cid_gen.new_connection_id();

        let token = self.token_manager.gen_retry(&hdr.dcid, incoming.peer_addr);

        self.metrics.retry_packet_count().inc();

        self.handshake_reply(incoming, move |buf| {
            quiche::retry(&hdr.scid, &hdr.dcid, &scid, &token, hdr.version, buf)
                .into_io()
        })
    }

    /// Refuses the connection attempt with a transport-level
    /// CONNECTION_REFUSED, used while the worker is gracefully shutting
    /// down. The short-lived connection only exists to encrypt the close.
    fn refuse_conn(
        &mut self, mut incoming: Incoming, quiche_config: &mut quiche::Config,
    ) -> io::Result<Option<NewConnection>> {
        let scid = self.cid_gen.new_connection_id();

        let mut conn = quiche::accept(
            &scid,
            None,
            incoming.local_addr,
            incoming.peer_addr,
            quiche_config,
        )
        .into_io()?;

        let recv_info = quiche::RecvInfo {
            from: incoming.peer_addr,
            to: incoming.local_addr,
        };
        let _ = conn.recv(&mut incoming.buf, recv_info);
        let _ = conn.close(
            false,
            quiche::WireErrorCode::ConnectionRefused as u64,
            b"",
        );

        log::debug!(
            "refusing connection during graceful shutdown";
            "peer" => incoming.peer_addr
        );

        self.handshake_reply(incoming, move |buf| match conn.send(buf) {
            Ok((n, _)) => Ok(n),
            Err(e) => Err(io::Error::other(e)),
        })
    }
}

impl<S, M> InitialPacketHandler for ConnectionAcceptor<S, M>
where
    S: DatagramSocketSend + Send + 'static,
    M: Metrics,
{
    fn handle_initials(
        &mut self, incoming: Incoming, hdr: quiche::Header<'static>,
        quiche_config: &mut quiche::Config,
    ) -> io::Result<Option<NewConnection>> {
        if hdr.ty != PacketType::Initial {
            // Non-initial packets should have a valid CID, but we want to
            // have some telemetry if this isn't the case.
            if let Err(e) = self.cid_gen.verify_connection_id(&hdr.dcid) {
                self.metrics.invalid_cid_packet_count(e).inc();
            }

            Err(labels::QuicInvalidInitialPacketError::WrongType(hdr.ty))?;
        }

        if !quiche::version_is_supported(hdr.version) {
            return self.handshake_reply(incoming, |buf| {
                quiche::negotiate_version(&hdr.scid, &hdr.dcid, buf).into_io()
            });
        }

        if *self.draining.borrow() {
            return self.refuse_conn(incoming, quiche_config);
        }

        if self.config.disable_client_ip_validation {
            return self.accept_conn(incoming, None, hdr.dcid, quiche_config);
        }

        // NOTE: token is always present in Initial packets
        let token = hdr.token.as_ref().unwrap();
        if token.is_empty() {
            return self.stateless_retry(incoming, hdr);
        }

        match self.token_manager.validate(token, incoming.peer_addr) {
            Ok(TokenDisposition::Retry { odcid }) => {
                let odcid = odcid.into_owned();
                let retry_cids = Some(RetryConnectionIds {
                    original_destination_cid: &odcid,
                    retry_source_cid: &hdr.dcid,
                });

                self.accept_conn(
                    incoming,
                    retry_cids,
                    hdr.dcid.clone(),
                    quiche_config,
                )
            },
            // An address already validated by an earlier handshake skips the
            // Retry round trip.
            Ok(TokenDisposition::Session) =>
                self.accept_conn(incoming, None, hdr.dcid, quiche_config),
            // A stale or foreign session token is no worse than an empty
            // one; re-validate the address with a Retry. A bad Retry token
            // means the exchange itself is broken and the packet is dropped.
            Err(_) if !token_is_retry(token) =>
                self.stateless_retry(incoming, hdr),
            Err(_) =>
                Err(labels::QuicInvalidInitialPacketError::TokenValidationFail
                    .into()),
        }
    }
}

fn token_is_retry(token: &[u8]) -> bool {
    crate::quic::addr_validation_token::token_kind_is_retry(token)
}
