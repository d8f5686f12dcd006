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

//! Post-termination close-wait state.
//!
//! After a connection terminates with a CONNECTION_CLOSE, its connection IDs
//! and the final close datagram stay resident here for a multiple of the
//! path's PTO. A client that missed the close keeps sending packets; each
//! one earns at most one retransmission of the stored datagram, spaced out
//! exponentially so a blind sender cannot turn the registry into a packet
//! amplifier.

use std::collections::HashMap;
use std::time::Duration;
use std::time::Instant;

/// Close-wait duration as a multiple of the connection's PTO.
pub(crate) const CLOSE_WAIT_PTO_FACTOR: u32 = 3;

struct CloseWaitConn {
    close_pkt: Vec<u8>,
    deadline: Instant,
    /// Packets received for this connection since entering close-wait.
    pkts_recv: u64,
    /// Packet count at which the close datagram is retransmitted next.
    next_resend_at: u64,
}

/// Registry of terminated connections still owed a CONNECTION_CLOSE answer.
///
/// Owned by one packet router task; multiple CIDs of the same connection
/// share a single entry.
#[derive(Default)]
pub(crate) struct CloseWaitRegistry {
    cids: HashMap<Vec<u8>, u64>,
    conns: HashMap<u64, CloseWaitConn>,
    next_key: u64,
}

impl CloseWaitRegistry {
    /// Moves a terminated connection into close-wait.
    pub(crate) fn insert(
        &mut self, cids: Vec<Vec<u8>>, close_pkt: Vec<u8>, hold: Duration,
        now: Instant,
    ) {
        let key = self.next_key;
        self.next_key += 1;

        for cid in cids {
            self.cids.insert(cid, key);
        }

        self.conns.insert(key, CloseWaitConn {
            close_pkt,
            deadline: now + hold,
            pkts_recv: 0,
            next_resend_at: 1,
        });
    }

    /// Handles a datagram whose DCID matched no live connection.
    ///
    /// Returns the close datagram to retransmit, if the DCID belongs to a
    /// close-wait entry that is due for a resend. Expired entries are pruned
    /// on access.
    pub(crate) fn on_datagram(
        &mut self, dcid: &[u8], now: Instant,
    ) -> Option<&[u8]> {
        let key = *self.cids.get(dcid)?;

        let expired = self
            .conns
            .get(&key)
            .is_none_or(|conn| conn.deadline <= now);
        if expired {
            self.remove(key);
            return None;
        }

        let conn = self.conns.get_mut(&key).unwrap();
        conn.pkts_recv += 1;

        if conn.pkts_recv < conn.next_resend_at {
            return None;
        }

        conn.next_resend_at = conn.pkts_recv * 2;
        Some(&conn.close_pkt)
    }

    /// Eagerly drops all entries past their deadline.
    pub(crate) fn sweep(&mut self, now: Instant) {
        let expired: Vec<u64> = self
            .conns
            .iter()
            .filter(|(_, conn)| conn.deadline <= now)
            .map(|(key, _)| *key)
            .collect();

        for key in expired {
            self.remove(key);
        }
    }

    fn remove(&mut self, key: u64) {
        self.conns.remove(&key);
        self.cids.retain(|_, k| *k != key);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.conns.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOLD: Duration = Duration::from_millis(300);

    fn registry(now: Instant) -> CloseWaitRegistry {
        let mut registry = CloseWaitRegistry::default();
        registry.insert(
            vec![b"cid-one".to_vec(), b"cid-two".to_vec()],
            b"close-pkt".to_vec(),
            HOLD,
            now,
        );
        registry
    }

    #[test]
    fn unknown_cid_is_ignored() {
        let now = Instant::now();
        let mut registry = registry(now);

        assert!(registry.on_datagram(b"unknown", now).is_none());
    }

    #[test]
    fn retransmits_are_exponentially_spaced() {
        let now = Instant::now();
        let mut registry = registry(now);

        // Packets 1, 2, 4, 8, ... earn a resend; the rest are swallowed.
        let mut resends = 0;
        for _ in 0..16 {
            if registry.on_datagram(b"cid-one", now).is_some() {
                resends += 1;
            }
        }
        assert_eq!(resends, 5);
    }

    #[test]
    fn all_cids_reach_the_same_entry() {
        let now = Instant::now();
        let mut registry = registry(now);

        assert_eq!(
            registry.on_datagram(b"cid-one", now).unwrap(),
            b"close-pkt"
        );
        // The shared packet counter moved to 1, so the sibling CID's first
        // packet hits the threshold at 2.
        assert!(registry.on_datagram(b"cid-two", now).is_some());
    }

    #[test]
    fn entries_expire_lazily_and_eagerly() {
        let now = Instant::now();
        let mut registry = registry(now);
        let later = now + HOLD + Duration::from_millis(1);

        assert!(registry.on_datagram(b"cid-one", later).is_none());
        assert_eq!(registry.len(), 0);

        let mut registry = registry_pair(now);
        registry.sweep(later);
        assert_eq!(registry.len(), 0);
        assert!(registry.cids.is_empty());
    }

    fn registry_pair(now: Instant) -> CloseWaitRegistry {
        let mut r = registry(now);
        r.insert(vec![b"other".to_vec()], b"pkt".to_vec(), HOLD, now);
        r
    }
}
