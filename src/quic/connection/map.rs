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

use super::Incoming;
use super::InitialQuicConnection;
use crate::metrics::Metrics;

use datagram_socket::DatagramSocketSend;
use quiche::ConnectionId;
use quiche::MAX_CONN_ID_LEN;
use std::collections::BTreeMap;
use std::collections::HashMap;
use tokio::sync::mpsc;

const U64_SZ: usize = std::mem::size_of::<u64>();
const MAX_CONN_ID_QUADS: usize = MAX_CONN_ID_LEN.div_ceil(U64_SZ);
const CONN_ID_USABLE_LEN: usize = min_usize(
    // Last byte in CidOwned::Optimized stores CID length
    MAX_CONN_ID_QUADS * U64_SZ - 1,
    // CID length must fit in 1 byte
    min_usize(MAX_CONN_ID_LEN, u8::MAX as _),
);

const fn min_usize(v1: usize, v2: usize) -> usize {
    if v1 < v2 {
        v1
    } else {
        v2
    }
}

/// A non-unique connection identifier, multiple CIDs can map to the same
/// connection.
#[derive(PartialEq, Eq, PartialOrd, Ord)]
enum CidOwned {
    /// QUIC connection IDs theoretically have unbounded length, so for the
    /// generic case a boxed slice is used to store the ID.
    Generic(Box<[u8]>),
    /// For QUIC version 1 the maximal ID size is `20`, which corresponds to
    /// the `MAX_CONN_ID_LEN` value and also to this crate's issued CID
    /// length. For this common case, we store the ID in a u64 array for
    /// faster comparison (and therefore BTreeMap lookups).
    Optimized([u64; MAX_CONN_ID_QUADS]),
}

impl From<&ConnectionId<'_>> for CidOwned {
    #[inline(always)]
    fn from(value: &ConnectionId<'_>) -> Self {
        if value.len() > CONN_ID_USABLE_LEN {
            return CidOwned::Generic(value.as_ref().into());
        }

        let mut cid = [0; MAX_CONN_ID_QUADS];

        value
            .chunks(U64_SZ)
            .map(|c| match c.try_into() {
                Ok(v) => u64::from_le_bytes(v),
                Err(_) => {
                    let mut remainder = [0u8; U64_SZ];
                    remainder[..c.len()].copy_from_slice(c);
                    u64::from_le_bytes(remainder)
                },
            })
            .enumerate()
            .for_each(|(i, v)| cid[i] = v);

        // In order to differentiate cids with zeroes as opposed to shorter
        // cids, append the cid length.
        *cid.last_mut().unwrap() |= (value.len() as u64) << 56;

        CidOwned::Optimized(cid)
    }
}

/// A unique identifier assigned to each accepted connection.
type ConnKey = u64;

/// The worker-wide map from connection ID to live connection.
///
/// One connection is reachable under every CID the transport currently
/// advertises, plus the hashed CID derived from its initial 4-tuple.
#[derive(Default)]
pub(crate) struct ConnectionMap {
    cid_map: BTreeMap<CidOwned, (ConnKey, mpsc::Sender<Incoming>)>,
    conn_map: HashMap<ConnKey, mpsc::Sender<Incoming>>,
}

impl ConnectionMap {
    pub(crate) fn insert<Tx, M>(
        &mut self, cid: ConnectionId<'_>, conn: &InitialQuicConnection<Tx, M>,
    ) where
        Tx: DatagramSocketSend + Send + 'static,
        M: Metrics,
    {
        let key = conn.key;
        let ev_sender = conn.incoming_ev_sender.clone();

        self.conn_map.insert(key, ev_sender.clone());
        self.cid_map.insert((&cid).into(), (key, ev_sender));
    }

    /// Removes the connection reachable via `cid`, dropping every alias
    /// registered for it.
    pub(crate) fn remove(&mut self, cid: &ConnectionId<'_>) {
        if let Some((key, _)) = self.cid_map.remove(&cid.into()) {
            self.conn_map.remove(&key);
            self.cid_map.retain(|_, (k, _)| *k != key);
        }
    }

    pub(crate) fn map_cid<Tx, M>(
        &mut self, cid: ConnectionId<'_>, conn: &InitialQuicConnection<Tx, M>,
    ) where
        Tx: DatagramSocketSend + Send + 'static,
        M: Metrics,
    {
        if let Some(ev_sender) = self.conn_map.get(&conn.key) {
            self.cid_map
                .insert((&cid).into(), (conn.key, ev_sender.clone()));
        }
    }

    /// Adds `cid` as an additional route to the connection currently
    /// reachable via `existing`.
    pub(crate) fn alias(
        &mut self, cid: ConnectionId<'_>, existing: &ConnectionId<'_>,
    ) {
        let found = self
            .cid_map
            .get(&existing.into())
            .map(|(key, sender)| (*key, sender.clone()));

        if let Some((key, sender)) = found {
            self.cid_map.insert((&cid).into(), (key, sender));
        }
    }

    pub(crate) fn unmap_cid(&mut self, cid: &ConnectionId<'_>) {
        self.cid_map.remove(&cid.into());
    }

    pub(crate) fn get(
        &self, id: &ConnectionId,
    ) -> Option<&mpsc::Sender<Incoming>> {
        self.cid_map.get(&id.into()).map(|(_key, sender)| sender)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cid_storage() {
        let max_v1_cid = ConnectionId::from_ref(&[0xfa; MAX_CONN_ID_LEN]);
        let optimized = CidOwned::from(&max_v1_cid);
        assert!(
            matches!(optimized, CidOwned::Optimized(_)),
            "QUIC v1 CID is not stored inline"
        );

        let oversize_cid = ConnectionId::from_ref(&[0x1b; MAX_CONN_ID_LEN + 20]);
        let boxed = CidOwned::from(&oversize_cid);
        assert!(
            matches!(boxed, CidOwned::Generic(_)),
            "Oversized CID is not boxed"
        );
    }

    #[test]
    fn zero_cids_of_different_lengths_differ() {
        let short = ConnectionId::from_ref(&[0; 8]);
        let long = ConnectionId::from_ref(&[0; 12]);

        assert_ne!(CidOwned::from(&short), CidOwned::from(&long));
    }
}
