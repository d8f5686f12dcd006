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

use std::sync::Arc;

use boring::ssl::SslContextBuilder;

use crate::downstream::RequestHead;
use crate::settings::TlsCertificatePaths;

/// A set of hooks executed at the level of a [quiche::Connection].
pub trait ConnectionHook {
    /// Constructs an optional [`SslContextBuilder`].
    ///
    /// This method allows full customization of quiche's SSL context, for
    /// example to specify async callbacks during the QUIC handshake. It is
    /// called once per socket during initial setup, and then reused across
    /// all connections on that socket.
    fn create_custom_ssl_context_builder(
        &self, settings: TlsCertificatePaths<'_>,
    ) -> Option<SslContextBuilder>;
}

/// Verdict returned by [`RequestHook::on_request_headers`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub enum RequestVerdict {
    /// Continue dispatching the request.
    #[default]
    Forward,
    /// Answer the request locally with the given status and body, never
    /// contacting a backend.
    Respond {
        status: u16,
        headers: Vec<(Vec<u8>, Vec<u8>)>,
        body: Vec<u8>,
    },
}

/// Scripting hooks invoked while a request moves through the upstream.
///
/// These are the embedder's extension points (e.g. for a mruby or WASM
/// layer). All hooks run synchronously on the connection task; expensive work
/// belongs in the dispatcher.
#[allow(unused_variables)] // for default implementations
pub trait RequestHook: Send + Sync + 'static {
    /// Runs after the request head is validated, before admission. The head
    /// may be rewritten in place.
    fn on_request_headers(&self, head: &mut RequestHead) -> RequestVerdict {
        RequestVerdict::Forward
    }

    /// Runs after a downstream connection has been selected for the request.
    fn on_downstream_selected(&self, head: &mut RequestHead) {}
}

/// Hook configuration for the QUIC connection lifecycle and request path.
#[derive(Default, Clone)]
pub struct Hooks {
    pub connection_hook: Option<Arc<dyn ConnectionHook + Send + Sync + 'static>>,
    pub request_hook: Option<Arc<dyn RequestHook>>,
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        fn hook_status<T>(val: &Option<T>) -> &'static str {
            match val {
                Some(_) => "enabled",
                None => "disabled",
            }
        }

        f.debug_struct("Hooks")
            .field("connection_hook", &hook_status(&self.connection_hook))
            .field("request_hook", &hook_status(&self.request_hook))
            .finish()
    }
}
