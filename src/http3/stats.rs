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

use std::sync::atomic::AtomicI64;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

/// Stream-level audit statistics recorded by the upstream driver, consumed
/// by the embedder's access log.
#[derive(Debug)]
pub struct H3AuditStats {
    /// The stream ID of this request.
    stream_id: u64,
    /// Response bytes sent towards the client.
    bytes_sent: AtomicU64,
    /// Request body bytes received from the client.
    bytes_recvd: AtomicU64,
    /// A STOP_SENDING error code received from the peer.
    ///
    /// -1 indicates that this error code was not received yet.
    recvd_stop_sending_error_code: AtomicI64,
    /// A RESET_STREAM error code received from the peer.
    ///
    /// -1 indicates that this error code was not received yet.
    recvd_reset_stream_error_code: AtomicI64,
    /// A STOP_SENDING error code sent to the peer.
    sent_stop_sending_error_code: AtomicI64,
    /// A RESET_STREAM error code sent to the peer.
    sent_reset_stream_error_code: AtomicI64,
}

impl H3AuditStats {
    pub fn new(stream_id: u64) -> Self {
        Self {
            stream_id,
            bytes_sent: AtomicU64::new(0),
            bytes_recvd: AtomicU64::new(0),
            recvd_stop_sending_error_code: AtomicI64::new(-1),
            recvd_reset_stream_error_code: AtomicI64::new(-1),
            sent_stop_sending_error_code: AtomicI64::new(-1),
            sent_reset_stream_error_code: AtomicI64::new(-1),
        }
    }

    #[inline]
    pub fn stream_id(&self) -> u64 {
        self.stream_id
    }

    #[inline]
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn bytes_recvd(&self) -> u64 {
        self.bytes_recvd.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn recvd_stop_sending_error_code(&self) -> i64 {
        self.recvd_stop_sending_error_code.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn recvd_reset_stream_error_code(&self) -> i64 {
        self.recvd_reset_stream_error_code.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn sent_stop_sending_error_code(&self) -> i64 {
        self.sent_stop_sending_error_code.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn sent_reset_stream_error_code(&self) -> i64 {
        self.sent_reset_stream_error_code.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn add_bytes_sent(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::SeqCst);
    }

    #[inline]
    pub fn add_bytes_recvd(&self, bytes: u64) {
        self.bytes_recvd.fetch_add(bytes, Ordering::SeqCst);
    }

    #[inline]
    pub fn set_recvd_stop_sending_error_code(&self, code: i64) {
        self.recvd_stop_sending_error_code
            .store(code, Ordering::SeqCst);
    }

    #[inline]
    pub fn set_recvd_reset_stream_error_code(&self, code: i64) {
        self.recvd_reset_stream_error_code
            .store(code, Ordering::SeqCst);
    }

    #[inline]
    pub fn set_sent_stop_sending_error_code(&self, code: i64) {
        self.sent_stop_sending_error_code
            .store(code, Ordering::SeqCst);
    }

    #[inline]
    pub fn set_sent_reset_stream_error_code(&self, code: i64) {
        self.sent_reset_stream_error_code
            .store(code, Ordering::SeqCst);
    }
}
