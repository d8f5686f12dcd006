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

//! Lifecycle stages of an upstream connection.
//!
//! The I/O worker always moves packets; the stage decides what else one
//! loop iteration does. [`Handshake`] polices the handshake deadline and
//! ends itself once 1-RTT keys are up. [`RunningApplication`] runs the
//! upstream application and carries the pre-iteration graceful-shutdown
//! check: the first iteration after the listener flips into draining tells
//! the application to stop accepting work. [`Close`] owns the terminal
//! policy: whether the dead connection's CIDs and final CONNECTION_CLOSE
//! move into close-wait or are simply forgotten.

use std::fmt::Debug;
use std::ops::ControlFlow;
use std::time::Duration;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::sync::watch;

use crate::quic::close_wait::CLOSE_WAIT_PTO_FACTOR;
use crate::quic::connection::HandshakeError;
use crate::quic::connection::HandshakeInfo;
use crate::quic::connection::Incoming;
use crate::quic::connection::QuicConnectionStatsShared;
use crate::quic::connection::UpstreamApplication;
use crate::QuicResult;

/// Fallback PTO when the path has produced no RTT sample yet.
const DEFAULT_PTO: Duration = Duration::from_millis(333);

/// Conservative PTO estimate for the connection's active path.
///
/// Used to size the grace periods derived from "a few PTOs": the close-wait
/// hold and the gap between shutdown notice and final GOAWAY.
pub(crate) fn conservative_pto(qconn: &quiche::Connection) -> Duration {
    const MAX_ACK_DELAY: Duration = Duration::from_millis(25);

    qconn
        .path_stats()
        .next()
        .map(|p| p.rtt + 4 * p.rttvar + MAX_ACK_DELAY)
        .unwrap_or(DEFAULT_PTO)
}

/// Stage-specific behavior injected into the I/O worker's loop.
///
/// A `qconn` is passed into every method instead of living in the stage, so
/// the worker keeps sole ownership of the connection while reading,
/// gathering and flushing.
pub(crate) trait ConnectionStage: Send + Debug {
    /// Runs at the top of each loop iteration, after inbound packets were
    /// fed to the transport.
    fn on_read<A: UpstreamApplication>(
        &mut self, _received_packets: bool, _qconn: &mut quiche::Connection,
        _ctx: &mut ConnectionStageContext<A>,
    ) -> QuicResult<()> {
        Ok(())
    }

    /// Runs after each batch of outbound packets was flushed. Breaking ends
    /// the stage.
    fn on_flush<A: UpstreamApplication>(
        &mut self, _qconn: &mut quiche::Connection,
        _ctx: &mut ConnectionStageContext<A>,
    ) -> ControlFlow<QuicResult<()>> {
        ControlFlow::Continue(())
    }

    /// An additional deadline to wake the loop at, merged with the
    /// transport's own timers.
    fn wait_deadline(&mut self) -> Option<Instant> {
        None
    }

    /// Runs after the loop was woken. Breaking ends the stage.
    fn post_wait(
        &self, _qconn: &mut quiche::Connection,
    ) -> ControlFlow<QuicResult<()>> {
        ControlFlow::Continue(())
    }
}

/// State shared across all stages of one connection.
pub(crate) struct ConnectionStageContext<A> {
    pub in_pkt: Option<Incoming>,
    pub application: A,
    pub incoming_pkt_receiver: mpsc::Receiver<Incoming>,
    pub stats: QuicConnectionStatsShared,
}

impl<A> ConnectionStageContext<A>
where
    A: UpstreamApplication,
{
    pub fn buffer(&mut self) -> &mut [u8] {
        self.application.buffer()
    }
}

/// Driving the QUIC handshake to completion, bounded by the configured
/// handshake timeout.
#[derive(Debug)]
pub(crate) struct Handshake {
    pub handshake_info: HandshakeInfo,
}

impl ConnectionStage for Handshake {
    fn on_flush<A: UpstreamApplication>(
        &mut self, qconn: &mut quiche::Connection,
        _ctx: &mut ConnectionStageContext<A>,
    ) -> ControlFlow<QuicResult<()>> {
        if qconn.is_established() {
            ControlFlow::Break(Ok(()))
        } else {
            ControlFlow::Continue(())
        }
    }

    fn wait_deadline(&mut self) -> Option<Instant> {
        self.handshake_info.deadline()
    }

    fn post_wait(
        &self, qconn: &mut quiche::Connection,
    ) -> ControlFlow<QuicResult<()>> {
        if !self.handshake_info.is_expired() {
            return ControlFlow::Continue(());
        }

        // The peer ran out of handshake time. This is pre-application, so
        // the close is a bare transport-level one.
        let _ = qconn.close(
            false,
            quiche::WireErrorCode::ApplicationError as u64,
            &[],
        );

        ControlFlow::Break(Err(HandshakeError::Timeout.into()))
    }
}

/// Serving the upstream application over the established connection.
pub(crate) struct RunningApplication {
    /// Flips to true when the listener starts its graceful shutdown.
    draining: watch::Receiver<bool>,
    /// The application has been told about the shutdown.
    draining_signalled: bool,
}

impl RunningApplication {
    pub(crate) fn new(draining: watch::Receiver<bool>) -> Self {
        Self {
            draining,
            draining_signalled: false,
        }
    }
}

impl Debug for RunningApplication {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("RunningApplication")
            .field("draining_signalled", &self.draining_signalled)
            .finish()
    }
}

impl ConnectionStage for RunningApplication {
    fn on_read<A: UpstreamApplication>(
        &mut self, received_packets: bool, qconn: &mut quiche::Connection,
        ctx: &mut ConnectionStageContext<A>,
    ) -> QuicResult<()> {
        // Pre-iteration check: the listener flipping into graceful shutdown
        // must reach the application before it admits more work this
        // iteration. Exactly one notification per connection.
        if !self.draining_signalled && *self.draining.borrow() {
            self.draining_signalled = true;
            ctx.application.on_draining(qconn)?;
        }

        if ctx.application.should_act() {
            if received_packets {
                ctx.application.process_reads(qconn)?;
            }

            if qconn.is_established() {
                ctx.application.process_writes(qconn)?;
            }
        }

        Ok(())
    }
}

/// Flushing the terminal CONNECTION_CLOSE and retiring the connection.
#[derive(Debug)]
pub(crate) struct Close {
    pub work_loop_result: QuicResult<()>,
}

/// What happens to the connection's identity after teardown.
pub(crate) enum Teardown {
    /// Keep the CIDs resident and retransmit `close_pkt` to stray packets
    /// for `hold`.
    CloseWait { close_pkt: Vec<u8>, hold: Duration },
    /// Drop all routing state immediately.
    Forget,
}

impl Close {
    /// Decides the connection's afterlife.
    ///
    /// An idle timeout put nothing on the wire, and a draining connection
    /// was closed by the peer; neither leaves anything worth
    /// retransmitting. Only a locally sent CONNECTION_CLOSE, captured in
    /// `close_datagram`, earns a close-wait entry, held for a few PTOs.
    pub(crate) fn teardown(
        &self, qconn: &quiche::Connection, close_datagram: Option<Vec<u8>>,
    ) -> Teardown {
        if qconn.is_timed_out() || qconn.local_error().is_none() {
            return Teardown::Forget;
        }

        match close_datagram {
            Some(close_pkt) => Teardown::CloseWait {
                close_pkt,
                hold: CLOSE_WAIT_PTO_FACTOR * conservative_pto(qconn),
            },
            None => Teardown::Forget,
        }
    }
}

impl ConnectionStage for Close {}
