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

use std::future::poll_fn;
use std::task::Context;
use std::task::Poll;
use std::time::Duration;

use tokio_util::time::delay_queue::DelayQueue;
use tokio_util::time::delay_queue::{
    self,
};

/// HTTP/3 configuration for the upstream driver.
#[derive(Clone, Debug)]
pub struct Http3Settings {
    /// Maximum number of requests allowed per connection. Unlimited when
    /// `None`.
    pub max_requests_per_connection: Option<u64>,
    /// Maximum size of a single HEADERS frame, in bytes, advertised via
    /// SETTINGS.
    pub max_header_list_size: Option<u64>,
    /// Maximum value the QPACK encoder is permitted to set for the dynamic
    /// table capacity. See <https://www.rfc-editor.org/rfc/rfc9204.html#name-maximum-dynamic-table-capac>
    pub qpack_max_table_capacity: Option<u64>,
    /// Upper bound on the number of streams that can be blocked on the QPACK
    /// decoder. See <https://www.rfc-editor.org/rfc/rfc9204.html#name-blocked-streams>
    pub qpack_blocked_streams: Option<u64>,
    /// Advertise Extended CONNECT support (RFC 9220). Disabled automatically
    /// when running as a forward proxy.
    pub enable_connect_protocol: bool,
    /// Timeout between completing the QUIC handshake and receiving the
    /// first request on a connection.
    pub post_accept_timeout: Option<Duration>,
}

impl Default for Http3Settings {
    fn default() -> Self {
        Self {
            max_requests_per_connection: None,
            max_header_list_size: None,
            qpack_max_table_capacity: Some(4096),
            qpack_blocked_streams: None,
            enable_connect_protocol: true,
            post_accept_timeout: None,
        }
    }
}

impl From<&Http3Settings> for quiche::h3::Config {
    fn from(value: &Http3Settings) -> Self {
        let mut config = Self::new().unwrap();

        if let Some(v) = value.max_header_list_size {
            config.set_max_field_section_size(v);
        }
        if let Some(v) = value.qpack_max_table_capacity {
            config.set_qpack_max_table_capacity(v);
        }
        if let Some(v) = value.qpack_blocked_streams {
            config.set_qpack_blocked_streams(v);
        }
        config.enable_extended_connect(value.enable_connect_protocol);

        config
    }
}

/// Opaque handle to an entry in the driver's timeout queue.
pub(crate) struct TimeoutKey(delay_queue::Key);

/// Timed events the upstream driver waits on.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Http3TimeoutType {
    /// No request arrived after the handshake; close the connection.
    PostAccept,
    /// A dispatched request ran out of time; reply 408 or 504.
    Request(u64),
    /// The graceful-shutdown grace period elapsed; send the final GOAWAY.
    Shutdown,
}

/// Tracks the request-count limit and all pending timeouts for one
/// connection.
pub(crate) struct Http3SettingsEnforcer {
    max_requests_per_connection: Option<u64>,
    post_accept_timeout: Option<Duration>,
    delay_queue: DelayQueue<Http3TimeoutType>,
}

impl From<&Http3Settings> for Http3SettingsEnforcer {
    fn from(value: &Http3Settings) -> Self {
        Self {
            max_requests_per_connection: value.max_requests_per_connection,
            post_accept_timeout: value.post_accept_timeout,
            delay_queue: DelayQueue::new(),
        }
    }
}

impl Http3SettingsEnforcer {
    /// Returns whether the connection exceeded its request-count limit.
    pub fn enforce_requests_limit(&self, request_count: u64) -> bool {
        if let Some(limit) = self.max_requests_per_connection {
            return request_count >= limit;
        }

        false
    }

    /// Returns the configured post-accept timeout.
    pub fn post_accept_timeout(&self) -> Option<Duration> {
        self.post_accept_timeout
    }

    /// Registers a timeout of `typ` in this enforcer.
    pub fn add_timeout(
        &mut self, typ: Http3TimeoutType, duration: Duration,
    ) -> TimeoutKey {
        let key = self.delay_queue.insert(typ, duration);
        TimeoutKey(key)
    }

    /// Checks whether any timeouts are pending. Used to selectively poll
    /// `next_timeout`.
    pub fn has_pending_timeouts(&self) -> bool {
        !self.delay_queue.is_empty()
    }

    fn poll_timeouts(&mut self, cx: &mut Context) -> Poll<Http3TimeoutType> {
        match self.delay_queue.poll_expired(cx) {
            Poll::Ready(Some(exp)) => Poll::Ready(exp.into_inner()),
            _ => Poll::Pending,
        }
    }

    /// Waits for the next registered timeout to expire.
    pub async fn next_timeout(&mut self) -> Http3TimeoutType {
        poll_fn(|cx| self.poll_timeouts(cx)).await
    }

    /// Cancels a timeout that was previously registered with `add_timeout`.
    pub fn cancel_timeout(&mut self, key: TimeoutKey) {
        self.delay_queue.remove(&key.0);
    }
}
