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

//! Bounded queue of in-flight requests on one connection.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;

use super::downstream::DispatchState;
use super::downstream::Downstream;
use crate::settings::ProxySettings;

/// Maps stream IDs to their [`Downstream`] and tracks admission.
///
/// Every resident request is in exactly one of the pending, blocked or
/// active sets until removal (failed requests leave the sets immediately but
/// stay in the map until their error reply finishes). The sets are ordered
/// by stream ID, so promotion after a removal picks the oldest blocked
/// request.
pub(crate) struct DownstreamQueue {
    map: BTreeMap<u64, Downstream>,
    pending: BTreeSet<u64>,
    blocked: BTreeSet<u64>,
    active: BTreeSet<u64>,
    /// Active request count per authority, maintained in host-affinity
    /// mode.
    active_per_host: HashMap<Vec<u8>, usize>,
    /// Cap on simultaneously active requests.
    cap: usize,
    /// Additional per-authority cap, enforced in host-affinity mode.
    per_host_cap: Option<usize>,
}

impl DownstreamQueue {
    pub(crate) fn new(settings: &ProxySettings) -> Self {
        Self {
            map: BTreeMap::new(),
            pending: BTreeSet::new(),
            blocked: BTreeSet::new(),
            active: BTreeSet::new(),
            active_per_host: HashMap::new(),
            cap: settings.active_request_cap().max(1),
            per_host_cap: settings
                .forward_proxy
                .then_some(settings.connections_per_host.max(1)),
        }
    }

    pub(crate) fn get(&self, stream_id: u64) -> Option<&Downstream> {
        self.map.get(&stream_id)
    }

    pub(crate) fn get_mut(&mut self, stream_id: u64) -> Option<&mut Downstream> {
        self.map.get_mut(&stream_id)
    }

    pub(crate) fn contains(&self, stream_id: u64) -> bool {
        self.map.contains_key(&stream_id)
    }

    pub(crate) fn active_len(&self) -> usize {
        self.active.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub(crate) fn stream_ids(&self) -> Vec<u64> {
        self.map.keys().copied().collect()
    }

    /// Registers a freshly created request as pending.
    pub(crate) fn add_pending(&mut self, downstream: Downstream) {
        let stream_id = downstream.stream_id;
        debug_assert_eq!(downstream.dispatch_state, DispatchState::Pending);

        self.map.insert(stream_id, downstream);
        self.pending.insert(stream_id);
    }

    /// Whether a request for `authority` may become active right now.
    pub(crate) fn can_activate(&self, authority: Option<&[u8]>) -> bool {
        if self.active.len() >= self.cap {
            return false;
        }

        let Some(per_host_cap) = self.per_host_cap else {
            return true;
        };

        let Some(authority) = authority else {
            return true;
        };

        self.active_per_host
            .get(authority)
            .is_none_or(|count| *count < per_host_cap)
    }

    pub(crate) fn mark_active(&mut self, stream_id: u64) {
        let Some(downstream) = self.map.get_mut(&stream_id) else {
            return;
        };
        debug_assert_ne!(downstream.dispatch_state, DispatchState::Failed);

        // Re-dispatch after a downstream reset keeps the admission slot.
        if downstream.dispatch_state == DispatchState::Active {
            return;
        }

        self.pending.remove(&stream_id);
        self.blocked.remove(&stream_id);
        self.active.insert(stream_id);
        downstream.dispatch_state = DispatchState::Active;

        if self.per_host_cap.is_some() {
            if let Some(authority) = &downstream.request.authority {
                *self
                    .active_per_host
                    .entry(authority.clone())
                    .or_default() += 1;
            }
        }
    }

    pub(crate) fn mark_blocked(&mut self, stream_id: u64) {
        let Some(downstream) = self.map.get_mut(&stream_id) else {
            return;
        };
        debug_assert_ne!(downstream.dispatch_state, DispatchState::Active);

        self.pending.remove(&stream_id);
        self.blocked.insert(stream_id);
        downstream.dispatch_state = DispatchState::Blocked;
    }

    /// Marks a request terminally failed. It leaves all admission sets but
    /// stays resident until its error reply drains.
    pub(crate) fn mark_failed(&mut self, stream_id: u64) {
        let Some(downstream) = self.map.get_mut(&stream_id) else {
            return;
        };

        let authority = downstream.request.authority.clone();
        downstream.dispatch_state = DispatchState::Failed;
        self.forget_admission(stream_id, authority.as_deref());
    }

    /// Removes a request. Returns it together with the oldest blocked
    /// request now eligible for promotion, if any.
    pub(crate) fn remove(
        &mut self, stream_id: u64,
    ) -> (Option<Downstream>, Option<u64>) {
        let Some(downstream) = self.map.remove(&stream_id) else {
            return (None, None);
        };

        self.forget_admission(
            stream_id,
            downstream.request.authority.as_deref(),
        );

        let promote = self.blocked.iter().next().copied();
        (Some(downstream), promote)
    }

    fn forget_admission(&mut self, stream_id: u64, authority: Option<&[u8]>) {
        self.pending.remove(&stream_id);
        self.blocked.remove(&stream_id);

        if self.active.remove(&stream_id) && self.per_host_cap.is_some() {
            if let Some(authority) = authority {
                if let Some(count) = self.active_per_host.get_mut(authority) {
                    *count -= 1;
                    if *count == 0 {
                        self.active_per_host.remove(authority);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downstream::RequestHead;

    fn settings(forward_proxy: bool, cap: usize) -> ProxySettings {
        let mut s: ProxySettings = serde_json::from_str("{}").unwrap();
        s.forward_proxy = forward_proxy;
        s.connections_per_frontend = cap;
        s.connections_per_host = cap;
        s
    }

    fn request(authority: &[u8]) -> RequestHead {
        RequestHead {
            method: b"GET".to_vec(),
            scheme: Some(b"https".to_vec()),
            authority: Some(authority.to_vec()),
            path: b"/".to_vec(),
            headers: Vec::new(),
            content_length: Some(0),
            connect_protocol: false,
            expect_body: false,
            peer_addr: "127.0.0.1:4433".parse().unwrap(),
        }
    }

    fn queue_with(
        settings: &ProxySettings, streams: &[u64],
    ) -> DownstreamQueue {
        let mut queue = DownstreamQueue::new(settings);
        for id in streams {
            queue.add_pending(Downstream::new(*id, request(b"example.org")));
        }
        queue
    }

    #[test]
    fn admission_respects_the_cap() {
        let settings = settings(false, 2);
        let mut queue = queue_with(&settings, &[0, 4, 8]);

        assert!(queue.can_activate(Some(b"example.org")));
        queue.mark_active(0);
        queue.mark_active(4);

        assert!(!queue.can_activate(Some(b"example.org")));
        queue.mark_blocked(8);

        assert_eq!(queue.get(8).unwrap().dispatch_state, DispatchState::Blocked);
        assert_eq!(queue.active_len(), 2);
    }

    #[test]
    fn removal_promotes_the_oldest_blocked() {
        let settings = settings(false, 1);
        let mut queue = queue_with(&settings, &[0, 4, 8]);

        queue.mark_active(0);
        queue.mark_blocked(4);
        queue.mark_blocked(8);

        let (removed, promote) = queue.remove(0);
        assert!(removed.is_some());
        assert_eq!(promote, Some(4));
        assert!(queue.can_activate(Some(b"example.org")));
    }

    #[test]
    fn per_host_cap_only_binds_in_affinity_mode() {
        let settings = settings(true, 4);
        let mut queue = DownstreamQueue::new(&settings);
        // Tighten the per-host cap below the global one.
        queue.per_host_cap = Some(1);

        queue.add_pending(Downstream::new(0, request(b"a.example")));
        queue.add_pending(Downstream::new(4, request(b"a.example")));
        queue.add_pending(Downstream::new(8, request(b"b.example")));

        queue.mark_active(0);
        assert!(!queue.can_activate(Some(b"a.example")));
        assert!(queue.can_activate(Some(b"b.example")));

        queue.mark_active(8);
        let (_, _) = queue.remove(0);
        assert!(queue.can_activate(Some(b"a.example")));
    }

    #[test]
    fn remarking_active_does_not_double_count_the_host() {
        let settings = settings(true, 4);
        let mut queue = DownstreamQueue::new(&settings);
        queue.per_host_cap = Some(2);

        queue.add_pending(Downstream::new(0, request(b"a.example")));
        queue.mark_active(0);
        // Re-dispatch after a downstream reset re-marks the same stream.
        queue.mark_active(0);

        assert_eq!(queue.active_len(), 1);
        assert!(queue.can_activate(Some(b"a.example")));
    }

    #[test]
    fn failed_requests_leave_admission_sets_but_stay_resident() {
        let settings = settings(false, 1);
        let mut queue = queue_with(&settings, &[0]);

        queue.mark_failed(0);
        assert!(queue.contains(0));
        assert_eq!(queue.active_len(), 0);
        assert!(queue.can_activate(Some(b"example.org")));
        assert_eq!(queue.get(0).unwrap().dispatch_state, DispatchState::Failed);
    }

    #[test]
    fn states_follow_the_dag() {
        let settings = settings(false, 4);
        let mut queue = queue_with(&settings, &[0]);
        assert_eq!(
            queue.get(0).unwrap().dispatch_state,
            DispatchState::Pending
        );

        queue.mark_blocked(0);
        assert_eq!(
            queue.get(0).unwrap().dispatch_state,
            DispatchState::Blocked
        );

        queue.mark_active(0);
        assert_eq!(queue.get(0).unwrap().dispatch_state, DispatchState::Active);

        let (removed, promote) = queue.remove(0);
        assert_eq!(
            removed.unwrap().dispatch_state,
            DispatchState::Active
        );
        assert_eq!(promote, None);
        assert!(queue.is_empty());
    }
}
