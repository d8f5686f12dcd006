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

//! Address-validation tokens.
//!
//! Two token flavors share one wire shape (`kind || hmac || ip || timestamp
//! || payload`): Retry tokens additionally carry the original DCID and are
//! only valid for a few seconds, while session tokens are handed out after a
//! completed handshake and let a returning client skip the Retry round trip
//! for a day.

use quiche::ConnectionId;
use std::io::Write;
use std::io::{
    self,
};
use std::net::IpAddr;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use std::time::SystemTime;

use boring::hash::hmac_sha256;

use crate::quic::cid::KeyingMaterials;
use crate::QuicResultExt;

const HMAC_TAG_LEN: usize = 32;
const TIMESTAMP_LEN: usize = 8;

const RETRY_TOKEN_MAGIC: u8 = 0xb6;
const SESSION_TOKEN_MAGIC: u8 = 0x36;

const RETRY_TOKEN_LIFETIME: Duration = Duration::from_secs(10);
const SESSION_TOKEN_LIFETIME: Duration = Duration::from_secs(86_400);

/// Outcome of validating a non-empty Initial token.
pub(crate) enum TokenDisposition<'t> {
    /// The token proves a completed Retry round trip; the embedded original
    /// DCID must be echoed in the transport parameters.
    Retry { odcid: ConnectionId<'t> },
    /// The token was issued after an earlier handshake; the address is
    /// validated and no Retry is required.
    Session,
}

#[derive(Clone)]
pub(crate) struct AddrValidationTokenManager {
    keys: Arc<KeyingMaterials>,
}

impl AddrValidationTokenManager {
    pub(crate) fn new(keys: Arc<KeyingMaterials>) -> Self {
        AddrValidationTokenManager { keys }
    }

    /// Generates a Retry token binding `original_dcid` to `client_addr`.
    pub(crate) fn gen_retry(
        &self, original_dcid: &[u8], client_addr: SocketAddr,
    ) -> Vec<u8> {
        self.gen(RETRY_TOKEN_MAGIC, client_addr, original_dcid, now_secs())
    }

    /// Generates a session token for `client_addr`, minted on handshake
    /// completion.
    pub(crate) fn gen_session(&self, client_addr: SocketAddr) -> Vec<u8> {
        self.gen(SESSION_TOKEN_MAGIC, client_addr, &[], now_secs())
    }

    fn gen(
        &self, kind: u8, client_addr: SocketAddr, payload: &[u8], ts: u64,
    ) -> Vec<u8> {
        let ip_bytes = ip_bytes(client_addr.ip());

        let token_len =
            1 + HMAC_TAG_LEN + ip_bytes.len() + TIMESTAMP_LEN + payload.len();
        let mut token = io::Cursor::new(vec![0u8; token_len]);

        token.write_all(&[kind]).unwrap();
        token.set_position(1 + HMAC_TAG_LEN as u64);
        token.write_all(&ip_bytes).unwrap();
        token.write_all(&ts.to_be_bytes()).unwrap();
        token.write_all(payload).unwrap();

        let mut token = token.into_inner();
        let tag = hmac_sha256(
            self.keys.current().secret(),
            &signed_parts(&token),
        )
        .unwrap();
        token[1..1 + HMAC_TAG_LEN].copy_from_slice(tag.as_ref());

        token
    }

    /// Validates `token` against `client_addr` and classifies it.
    pub(crate) fn validate<'t>(
        &self, token: &'t [u8], client_addr: SocketAddr,
    ) -> io::Result<TokenDisposition<'t>> {
        self.validate_at(token, client_addr, SystemTime::now())
    }

    fn validate_at<'t>(
        &self, token: &'t [u8], client_addr: SocketAddr, now: SystemTime,
    ) -> io::Result<TokenDisposition<'t>> {
        let ip_bytes = ip_bytes(client_addr.ip());
        let payload_off = 1 + HMAC_TAG_LEN + ip_bytes.len() + TIMESTAMP_LEN;

        if token.len() < payload_off {
            return Err("token is too short").into_io();
        }

        let kind = token[0];
        let lifetime = match kind {
            RETRY_TOKEN_MAGIC => RETRY_TOKEN_LIFETIME,
            SESSION_TOKEN_MAGIC => SESSION_TOKEN_LIFETIME,
            _ => return Err("unknown token type").into_io(),
        };

        let tag = &token[1..1 + HMAC_TAG_LEN];
        let signed = signed_parts(token);
        let verified = self.keys.all_secrets().any(|secret| {
            let expected = hmac_sha256(secret, &signed).unwrap();
            boring::memcmp::eq(expected.as_ref(), tag)
        });
        if !verified {
            return Err("signature verification failed").into_io();
        }

        let rest = &token[1 + HMAC_TAG_LEN..];
        if rest[..ip_bytes.len()] != *ip_bytes {
            return Err("IPs don't match").into_io();
        }

        let ts_bytes = &rest[ip_bytes.len()..ip_bytes.len() + TIMESTAMP_LEN];
        let ts = u64::from_be_bytes(ts_bytes.try_into().unwrap());
        let minted = SystemTime::UNIX_EPOCH + Duration::from_secs(ts);
        if now.duration_since(minted).unwrap_or(Duration::MAX) > lifetime {
            return Err("token expired").into_io();
        }

        match kind {
            RETRY_TOKEN_MAGIC => {
                let odcid = &token[payload_off..];
                if odcid.is_empty() || odcid.len() > quiche::MAX_CONN_ID_LEN {
                    return Err("bad original DCID length").into_io();
                }

                Ok(TokenDisposition::Retry {
                    odcid: ConnectionId::from_ref(odcid),
                })
            },
            _ => Ok(TokenDisposition::Session),
        }
    }
}

/// Reports whether a token claims to be a Retry token.
pub(crate) fn token_kind_is_retry(token: &[u8]) -> bool {
    token.first() == Some(&RETRY_TOKEN_MAGIC)
}

/// Everything covered by the HMAC: the kind byte plus all bytes after the
/// tag.
fn signed_parts(token: &[u8]) -> Vec<u8> {
    let mut signed = Vec::with_capacity(1 + token.len() - 1 - HMAC_TAG_LEN);
    signed.push(token[0]);
    signed.extend_from_slice(&token[1 + HMAC_TAG_LEN..]);
    signed
}

fn ip_bytes(ip: IpAddr) -> Vec<u8> {
    match ip {
        IpAddr::V4(addr) => addr.octets().to_vec(),
        IpAddr::V6(addr) => addr.octets().to_vec(),
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quic::cid::KeyingMaterial;

    fn manager() -> AddrValidationTokenManager {
        AddrValidationTokenManager::new(Arc::new(KeyingMaterials::default()))
    }

    #[test]
    fn retry_roundtrip() {
        let manager = manager();
        let addr = "127.0.0.1:1337".parse().unwrap();

        let token = manager.gen_retry(b"foo", addr);

        match manager.validate(&token, addr).unwrap() {
            TokenDisposition::Retry { odcid } => {
                assert_eq!(odcid, ConnectionId::from_ref(b"foo"));
            },
            _ => panic!("expected a retry token"),
        }

        let addr = "[::1]:1338".parse().unwrap();
        let token = manager.gen_retry(b"barbaz", addr);

        match manager.validate(&token, addr).unwrap() {
            TokenDisposition::Retry { odcid } => {
                assert_eq!(odcid, ConnectionId::from_ref(b"barbaz"));
            },
            _ => panic!("expected a retry token"),
        }
    }

    #[test]
    fn session_roundtrip() {
        let manager = manager();
        let addr = "127.0.0.1:1337".parse().unwrap();

        let token = manager.gen_session(addr);
        assert!(matches!(
            manager.validate(&token, addr).unwrap(),
            TokenDisposition::Session
        ));
    }

    #[test]
    fn validate_err_short_token() {
        let manager = manager();
        let v4_addr = "127.0.0.1:1337".parse().unwrap();
        let v6_addr = "[::1]:1338".parse().unwrap();

        for addr in [v4_addr, v6_addr] {
            assert!(manager.validate(b"", addr).is_err());
            assert!(manager.validate(&[1u8; HMAC_TAG_LEN], addr).is_err());
            assert!(manager.validate(&[1u8; HMAC_TAG_LEN + 1], addr).is_err());
        }
    }

    #[test]
    fn validate_err_ips_mismatch() {
        let manager = manager();

        let token = manager.gen_retry(b"foo", "127.0.0.1:1337".parse().unwrap());
        assert!(manager
            .validate(&token, "127.0.0.2:1337".parse().unwrap())
            .is_err());

        let token = manager.gen_session("[::1]:1338".parse().unwrap());
        assert!(manager
            .validate(&token, "[::2]:1338".parse().unwrap())
            .is_err());
    }

    #[test]
    fn validate_err_invalid_signature() {
        let manager = manager();

        let addr = "127.0.0.1:1337".parse().unwrap();
        let mut token = manager.gen_retry(b"foo", addr);

        token[1..1 + HMAC_TAG_LEN].copy_from_slice(&[1u8; HMAC_TAG_LEN]);

        assert!(manager.validate(&token, addr).is_err());
    }

    #[test]
    fn validate_err_expired() {
        let manager = manager();
        let addr = "127.0.0.1:1337".parse().unwrap();

        let stale = now_secs() - RETRY_TOKEN_LIFETIME.as_secs() - 5;
        let token = manager.gen(RETRY_TOKEN_MAGIC, addr, b"foo", stale);

        assert!(manager.validate(&token, addr).is_err());

        // A session token of the same age is still acceptable.
        let token = manager.gen(SESSION_TOKEN_MAGIC, addr, &[], stale);
        assert!(manager.validate(&token, addr).is_ok());
    }

    #[test]
    fn tokens_survive_key_rotation() {
        let mut keys = KeyingMaterials::default();
        let manager = AddrValidationTokenManager::new(Arc::new(keys.clone()));
        let addr = "127.0.0.1:1337".parse().unwrap();
        let token = manager.gen_session(addr);

        keys.rotate(KeyingMaterial::generate(1));
        let rotated = AddrValidationTokenManager::new(Arc::new(keys));

        assert!(rotated.validate(&token, addr).is_ok());
    }
}
