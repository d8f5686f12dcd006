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

use foundations::settings::settings;
use serde_with::serde_as;
use serde_with::DurationMilliSeconds;
use std::time::Duration;

/// Request handling and response rewriting parameters for the ingress.
#[serde_as]
#[settings]
pub struct ProxySettings {
    /// Operate as a forward proxy instead of a reverse proxy.
    ///
    /// In this mode request paths are forwarded verbatim, `:authority` is
    /// mandatory for non-CONNECT requests, Extended CONNECT is not
    /// advertised, and admission is capped per backend host rather than per
    /// frontend.
    pub forward_proxy: bool,

    /// Maximum simultaneously active requests per backend authority when
    /// `forward_proxy` is set. Defaults to 8.
    #[serde(default = "ProxySettings::default_connections_per_host")]
    pub connections_per_host: usize,

    /// Maximum simultaneously active requests per frontend connection when
    /// `forward_proxy` is not set. Defaults to 100.
    #[serde(default = "ProxySettings::default_connections_per_frontend")]
    pub connections_per_frontend: usize,

    /// Upper bound on the number of header fields in a request section.
    /// Requests over the limit are answered with 431. Defaults to 100.
    #[serde(default = "ProxySettings::default_max_request_header_fields")]
    pub max_request_header_fields: usize,

    /// Upper bound on the total bytes of a request header section (names
    /// plus values). Requests over the limit are answered with 431.
    /// Defaults to 64 KB.
    #[serde(default = "ProxySettings::default_request_header_field_buffer")]
    pub request_header_field_buffer: usize,

    /// How often a request may be re-dispatched after its downstream
    /// connection reset, before giving up with 502. Defaults to 5.
    #[serde(default = "ProxySettings::default_max_downstream_retries")]
    pub max_downstream_retries: usize,

    /// Time budget for a dispatched request, in milliseconds. Expiry before
    /// response headers were sent yields 408, after them 504. Disabled by
    /// default.
    #[serde(rename = "request_timeout_ms")]
    #[serde_as(as = "Option<DurationMilliSeconds>")]
    pub request_timeout: Option<Duration>,

    /// Value of the synthesized `server` response header. Defaults to
    /// `h3-ingress`.
    #[serde(default = "ProxySettings::default_server_name")]
    pub server_name: String,

    /// Keep the backend's `server` header instead of synthesizing one.
    pub no_server_rewrite: bool,

    /// Do not append this hop to the `via` response header.
    pub no_via: bool,

    /// Strip every response header except `via` before forwarding.
    pub strip_response_headers_except_via: bool,

    /// Headers appended to every forwarded response.
    pub add_response_headers: Vec<(String, String)>,

    /// Name of the session affinity cookie. When set and the downstream
    /// connection reports an affinity token, a `set-cookie` header is added
    /// to the response.
    pub affinity_cookie_name: Option<String>,

    /// `path` attribute of the affinity cookie.
    pub affinity_cookie_path: Option<String>,

    /// Add the `Secure` attribute to the affinity cookie.
    pub affinity_cookie_secure: bool,
}

impl ProxySettings {
    #[inline]
    fn default_connections_per_host() -> usize {
        8
    }

    #[inline]
    fn default_connections_per_frontend() -> usize {
        100
    }

    #[inline]
    fn default_max_request_header_fields() -> usize {
        100
    }

    #[inline]
    fn default_request_header_field_buffer() -> usize {
        64 * 1024
    }

    #[inline]
    fn default_max_downstream_retries() -> usize {
        5
    }

    #[inline]
    fn default_server_name() -> String {
        "h3-ingress".to_string()
    }

    /// The active-request cap for one frontend connection's queue.
    pub fn active_request_cap(&self) -> usize {
        if self.forward_proxy {
            self.connections_per_host
        } else {
            self.connections_per_frontend
        }
    }
}
