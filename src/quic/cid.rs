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

//! Server connection-ID generation.
//!
//! A server-issued CID is `worker_id || key_slot || aead(payload) || tag`.
//! The cleartext worker prefix lets a packet-steering layer route datagrams
//! to the owning worker without any key material; the payload is sealed
//! with a deterministic SIV-style AEAD so a short-header DCID only verifies
//! if this server minted it. The authentication tag covers the worker
//! prefix, the key slot and the payload, and it doubles as the cipher
//! nonce: equal inputs are impossible (the payload is fresh randomness) and
//! a forgery has to beat the full tag, not a single byte. Keys come from
//! rotating keying-material slots, so CIDs minted before a rotation stay
//! verifiable.

use std::net::SocketAddr;
use std::sync::Arc;

use boring::hash::hmac_sha256;
use boring::symm::encrypt;
use boring::symm::Cipher;
use quiche::ConnectionId;

use crate::metrics::labels::InvalidCid;
use crate::settings::QUIC_SCID_LEN;

/// Length of the random payload sealed into a CID.
const CID_PAYLOAD_LEN: usize = 10;
/// Offset of the sealed payload inside a CID.
const CID_PAYLOAD_OFFSET: usize = 2;
/// Length of the truncated authentication tag closing the CID.
const CID_TAG_LEN: usize =
    QUIC_SCID_LEN - CID_PAYLOAD_OFFSET - CID_PAYLOAD_LEN;
/// Domain separation label for the CID tag, so CID authentication can never
/// collide with the other HMAC uses of the slot secret.
const CID_TAG_LABEL: &[u8] = b"cid-aead";

/// Maximum number of keying-material slots retained for decryption.
const MAX_KEYING_MATERIALS: usize = 4;

/// One slot of CID/token secrets.
#[derive(Clone)]
pub struct KeyingMaterial {
    /// Slot identifier stamped into every CID minted with this material.
    id: u8,
    /// AES-128 key for the CID payload keystream.
    cid_key: [u8; 16],
    /// HMAC secret for CID tags, stateless-reset and address-validation
    /// tokens.
    secret: [u8; 32],
}

impl KeyingMaterial {
    /// Generates a fresh keying material with the given slot id.
    pub fn generate(id: u8) -> Self {
        let mut cid_key = [0; 16];
        let mut secret = [0; 32];
        boring::rand::rand_bytes(&mut cid_key).unwrap();
        boring::rand::rand_bytes(&mut secret).unwrap();

        KeyingMaterial {
            id,
            cid_key,
            secret,
        }
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub(crate) fn secret(&self) -> &[u8; 32] {
        &self.secret
    }
}

/// The worker's set of keying-material slots.
///
/// New CIDs and tokens always use the `current` slot; older slots stay
/// resident so material minted before a rotation still validates.
#[derive(Clone)]
pub struct KeyingMaterials {
    slots: Vec<KeyingMaterial>,
    current: usize,
}

impl KeyingMaterials {
    pub fn new(initial: KeyingMaterial) -> Self {
        KeyingMaterials {
            slots: vec![initial],
            current: 0,
        }
    }

    /// Installs a new current keying material, retiring the oldest slot once
    /// [`MAX_KEYING_MATERIALS`] are resident.
    pub fn rotate(&mut self, km: KeyingMaterial) {
        if self.slots.len() == MAX_KEYING_MATERIALS {
            self.slots.remove(0);
        }
        self.slots.push(km);
        self.current = self.slots.len() - 1;
    }

    pub fn current(&self) -> &KeyingMaterial {
        &self.slots[self.current]
    }

    pub fn lookup(&self, id: u8) -> Option<&KeyingMaterial> {
        self.slots.iter().find(|km| km.id == id)
    }

    /// Iterates the HMAC secrets of all resident slots, newest last.
    pub(crate) fn all_secrets(&self) -> impl Iterator<Item = &[u8; 32]> {
        self.slots.iter().map(|km| &km.secret)
    }
}

impl Default for KeyingMaterials {
    fn default() -> Self {
        Self::new(KeyingMaterial::generate(0))
    }
}

/// Issues and verifies server connection IDs.
///
/// The generator is shared between the packet router (verification of
/// short-header DCIDs) and the connection acceptor/workers (minting new
/// CIDs), hence the `Arc`-ed keying materials.
pub trait ConnectionIdGenerator: Send + Sync + 'static {
    /// Mints a fresh CID.
    fn new_connection_id(&self) -> ConnectionId<'static>;

    /// Checks that `cid` was issued by this generator.
    fn verify_connection_id(&self, cid: &ConnectionId) -> Result<(), InvalidCid>;

    /// Derives the stateless-reset token for `cid`.
    ///
    /// This is a pure function of the CID and the current secret: equal
    /// inputs always produce equal tokens.
    fn stateless_reset_token(&self, cid: &ConnectionId) -> u128;
}

/// The production [`ConnectionIdGenerator`] with AEAD-sealed payloads.
#[derive(Clone)]
pub struct EncryptedCidGenerator {
    worker_id: u8,
    keys: Arc<KeyingMaterials>,
}

impl EncryptedCidGenerator {
    pub fn new(worker_id: u8, keys: Arc<KeyingMaterials>) -> Self {
        EncryptedCidGenerator { worker_id, keys }
    }

    /// The worker prefix stamped into every CID from this generator.
    pub fn worker_id(&self) -> u8 {
        self.worker_id
    }

    /// The truncated tag binding a CID's header bytes to its payload.
    fn payload_tag(
        km: &KeyingMaterial, worker_id: u8, payload: &[u8; CID_PAYLOAD_LEN],
    ) -> [u8; CID_TAG_LEN] {
        let mut input =
            Vec::with_capacity(CID_TAG_LABEL.len() + 2 + CID_PAYLOAD_LEN);
        input.extend_from_slice(CID_TAG_LABEL);
        input.push(worker_id);
        input.push(km.id);
        input.extend_from_slice(payload);

        let tag = hmac_sha256(&km.secret, &input).unwrap();
        tag[..CID_TAG_LEN].try_into().unwrap()
    }

    /// Applies the AES-128-CTR keystream for `tag` to `data`.
    ///
    /// The tag is the synthetic IV; encryption and decryption are the same
    /// operation.
    fn payload_keystream(
        km: &KeyingMaterial, tag: &[u8; CID_TAG_LEN],
        data: &[u8; CID_PAYLOAD_LEN],
    ) -> [u8; CID_PAYLOAD_LEN] {
        let mut iv = [0; 16];
        iv[..CID_TAG_LEN].copy_from_slice(tag);

        let out =
            encrypt(Cipher::aes_128_ctr(), &km.cid_key, Some(&iv), data)
                .unwrap();

        out[..CID_PAYLOAD_LEN].try_into().unwrap()
    }

    /// Opens the sealed payload of `cid`, verifying its tag.
    fn open_payload(
        &self, cid: &ConnectionId,
    ) -> Result<[u8; CID_PAYLOAD_LEN], InvalidCid> {
        let km = self.keys.lookup(cid[1]).ok_or(InvalidCid::Decrypt)?;

        let tag: [u8; CID_TAG_LEN] = cid
            [CID_PAYLOAD_OFFSET + CID_PAYLOAD_LEN..]
            .try_into()
            .unwrap();
        let sealed: [u8; CID_PAYLOAD_LEN] = cid
            [CID_PAYLOAD_OFFSET..CID_PAYLOAD_OFFSET + CID_PAYLOAD_LEN]
            .try_into()
            .unwrap();

        let payload = Self::payload_keystream(km, &tag, &sealed);
        let expected = Self::payload_tag(km, cid[0], &payload);

        if !boring::memcmp::eq(&expected, &tag) {
            return Err(InvalidCid::Decrypt);
        }

        Ok(payload)
    }
}

impl ConnectionIdGenerator for EncryptedCidGenerator {
    fn new_connection_id(&self) -> ConnectionId<'static> {
        let km = self.keys.current();

        let mut payload = [0; CID_PAYLOAD_LEN];
        boring::rand::rand_bytes(&mut payload).unwrap();

        let tag = Self::payload_tag(km, self.worker_id, &payload);
        let sealed = Self::payload_keystream(km, &tag, &payload);

        let mut cid = [0; QUIC_SCID_LEN];
        cid[0] = self.worker_id;
        cid[1] = km.id;
        cid[CID_PAYLOAD_OFFSET..CID_PAYLOAD_OFFSET + CID_PAYLOAD_LEN]
            .copy_from_slice(&sealed);
        cid[CID_PAYLOAD_OFFSET + CID_PAYLOAD_LEN..].copy_from_slice(&tag);

        ConnectionId::from_vec(cid.to_vec())
    }

    fn verify_connection_id(&self, cid: &ConnectionId) -> Result<(), InvalidCid> {
        if cid.len() != QUIC_SCID_LEN {
            return Err(InvalidCid::Length);
        }

        if cid[0] != self.worker_id {
            return Err(InvalidCid::WorkerPrefix);
        }

        self.open_payload(cid).map(|_| ())
    }

    fn stateless_reset_token(&self, cid: &ConnectionId) -> u128 {
        let km = self
            .keys
            .lookup(cid.as_ref().get(1).copied().unwrap_or_default())
            .unwrap_or_else(|| self.keys.current());

        let tag = hmac_sha256(&km.secret, cid.as_ref()).unwrap();
        u128::from_be_bytes(tag[..16].try_into().unwrap())
    }
}

/// Derives the deterministic secondary CID for a connection's initial
/// 4-tuple.
///
/// Registered alongside the real SCID so packets sent before the client
/// adopts a server CID still route to the right connection. The result is a
/// digest, not an issued CID, so it never passes `verify_connection_id`.
pub fn hashed_cid(
    local: SocketAddr, peer: SocketAddr, initial_dcid: &ConnectionId,
) -> ConnectionId<'static> {
    let mut input = Vec::with_capacity(64);

    for addr in [local, peer] {
        match addr.ip() {
            std::net::IpAddr::V4(ip) => input.extend_from_slice(&ip.octets()),
            std::net::IpAddr::V6(ip) => input.extend_from_slice(&ip.octets()),
        }
        input.extend_from_slice(&addr.port().to_be_bytes());
    }
    input.extend_from_slice(initial_dcid.as_ref());

    let digest =
        boring::hash::hash(boring::hash::MessageDigest::sha256(), &input)
            .unwrap();

    ConnectionId::from_vec(digest[..QUIC_SCID_LEN].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generator(worker_id: u8) -> EncryptedCidGenerator {
        EncryptedCidGenerator::new(
            worker_id,
            Arc::new(KeyingMaterials::default()),
        )
    }

    #[test]
    fn roundtrip() {
        let gen = generator(7);

        let cid = gen.new_connection_id();
        assert_eq!(cid.len(), QUIC_SCID_LEN);
        assert_eq!(cid[0], 7);

        // Sealing is invertible: the opened payload re-seals to the same
        // CID bytes.
        let payload = gen.open_payload(&cid).unwrap();
        let km = gen.keys.current();
        let tag = EncryptedCidGenerator::payload_tag(km, 7, &payload);
        let sealed =
            EncryptedCidGenerator::payload_keystream(km, &tag, &payload);
        assert_eq!(
            &cid[CID_PAYLOAD_OFFSET..CID_PAYLOAD_OFFSET + CID_PAYLOAD_LEN],
            &sealed
        );
        assert_eq!(&cid[CID_PAYLOAD_OFFSET + CID_PAYLOAD_LEN..], &tag);

        assert!(gen.verify_connection_id(&cid).is_ok());
    }

    #[test]
    fn cids_are_distinct() {
        let gen = generator(0);
        let a = gen.new_connection_id();
        let b = gen.new_connection_id();
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_worker_prefix_rejected() {
        let cid = generator(1).new_connection_id();

        assert_eq!(
            generator(2).verify_connection_id(&cid),
            Err(InvalidCid::WorkerPrefix)
        );
    }

    #[test]
    fn tampered_payload_fails_authentication() {
        let gen = generator(3);

        let mut bytes = gen.new_connection_id().as_ref().to_vec();
        bytes[CID_PAYLOAD_OFFSET] ^= 0x80;
        let forged = ConnectionId::from_vec(bytes);

        assert_eq!(
            gen.verify_connection_id(&forged),
            Err(InvalidCid::Decrypt)
        );
    }

    #[test]
    fn tampered_tag_fails_authentication() {
        let gen = generator(3);

        let mut bytes = gen.new_connection_id().as_ref().to_vec();
        *bytes.last_mut().unwrap() ^= 0x01;
        let forged = ConnectionId::from_vec(bytes);

        assert_eq!(
            gen.verify_connection_id(&forged),
            Err(InvalidCid::Decrypt)
        );
    }

    #[test]
    fn rewritten_worker_prefix_fails_authentication() {
        // The tag binds the cleartext header bytes: redirecting a valid CID
        // at another worker must not verify there either.
        let keys = Arc::new(KeyingMaterials::default());
        let gen_one = EncryptedCidGenerator::new(1, Arc::clone(&keys));
        let gen_two = EncryptedCidGenerator::new(2, keys);

        let mut bytes = gen_one.new_connection_id().as_ref().to_vec();
        bytes[0] = 2;
        let redirected = ConnectionId::from_vec(bytes);

        assert_eq!(
            gen_two.verify_connection_id(&redirected),
            Err(InvalidCid::Decrypt)
        );
    }

    #[test]
    fn random_cids_do_not_verify() {
        let gen = generator(0);

        // Even with the right worker prefix and a known slot id, guessing
        // bytes has to beat the full tag.
        for i in 0..64u8 {
            let mut bytes = [i; QUIC_SCID_LEN];
            bytes[0] = 0;
            bytes[1] = 0;
            let cid = ConnectionId::from_vec(bytes.to_vec());
            assert_eq!(
                gen.verify_connection_id(&cid),
                Err(InvalidCid::Decrypt)
            );
        }

        let short = ConnectionId::from_ref(&[0; 8]);
        assert_eq!(gen.verify_connection_id(&short), Err(InvalidCid::Length));
    }

    #[test]
    fn old_slots_stay_valid_after_rotation() {
        let mut keys = KeyingMaterials::default();
        let gen_before = EncryptedCidGenerator::new(0, Arc::new(keys.clone()));
        let cid = gen_before.new_connection_id();

        keys.rotate(KeyingMaterial::generate(1));
        let gen_after = EncryptedCidGenerator::new(0, Arc::new(keys));

        assert!(gen_after.verify_connection_id(&cid).is_ok());
        assert_eq!(gen_after.new_connection_id()[1], 1);
    }

    #[test]
    fn reset_token_is_deterministic() {
        let keys = Arc::new(KeyingMaterials::default());
        let gen = EncryptedCidGenerator::new(0, Arc::clone(&keys));
        let other = EncryptedCidGenerator::new(0, keys);

        let cid = gen.new_connection_id();
        assert_eq!(
            gen.stateless_reset_token(&cid),
            other.stateless_reset_token(&cid)
        );
        assert_ne!(
            gen.stateless_reset_token(&cid),
            gen.stateless_reset_token(&gen.new_connection_id())
        );
    }

    #[test]
    fn hashed_cid_is_stable_per_tuple() {
        let local = "192.0.2.1:443".parse().unwrap();
        let peer = "198.51.100.7:50000".parse().unwrap();
        let dcid = ConnectionId::from_ref(&[0xab; 8]);

        assert_eq!(
            hashed_cid(local, peer, &dcid),
            hashed_cid(local, peer, &dcid)
        );

        let other_peer = "198.51.100.7:50001".parse().unwrap();
        assert_ne!(
            hashed_cid(local, peer, &dcid),
            hashed_cid(local, other_peer, &dcid)
        );
    }
}
