/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use blake2::{Blake2s256, Digest};
use chacha20poly1305::aead::{AeadInPlace, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce, Tag};
use zeroize::Zeroizing;

use crate::kdf::{kdf1, kdf2, kdf3};
use crate::proto::{AEAD_TAG_SIZE, INITIAL_CHAIN_KEY, INITIAL_HASH, KEY_SIZE, ZERO_NONCE};

/// The Noise symmetric state: a secret chain key threaded through every KDF
/// step, and a public transcript hash that doubles as the AAD for every
/// handshake AEAD call.
///
/// Consume paths clone this, advance the clone, and commit it back to the
/// handshake only once the whole message has authenticated, so a failed
/// message can never leave a half-advanced transcript behind.
#[derive(Clone)]
pub(crate) struct SymmetricState {
    pub(crate) chain_key: Zeroizing<[u8; KEY_SIZE]>,
    pub(crate) hash: [u8; KEY_SIZE],
}

impl SymmetricState {
    /// The all-zero placeholder a handshake record holds while no exchange
    /// is in flight.
    pub fn zeroed() -> Self {
        Self {
            chain_key: Zeroizing::new([0u8; KEY_SIZE]),
            hash: [0u8; KEY_SIZE],
        }
    }

    /// Start a transcript. Both roles seed it with the responder's static
    /// public key, which is what makes the initiator prove it knows who it
    /// is talking to.
    pub fn initialize(responder_static: &[u8; KEY_SIZE]) -> Self {
        let mut state = Self {
            chain_key: Zeroizing::new(*INITIAL_CHAIN_KEY),
            hash: *INITIAL_HASH,
        };
        state.mix_hash(responder_static);
        state
    }

    pub fn mix_hash(&mut self, data: &[u8]) {
        let mut h = Blake2s256::new();
        h.update(self.hash);
        h.update(data);
        self.hash = h.finalize().into();
    }

    pub fn mix_key(&mut self, input: &[u8]) {
        self.chain_key = kdf1(&self.chain_key, input);
    }

    /// Advance the chain key and return a one-shot AEAD key.
    pub fn mix_key_and_derive(&mut self, input: &[u8]) -> Zeroizing<[u8; KEY_SIZE]> {
        let (chain_key, key) = kdf2(&self.chain_key, input);
        self.chain_key = chain_key;
        key
    }

    /// The psk2 modifier: fold the pre-shared key into the chain, absorb
    /// the middle output into the transcript, return the AEAD key.
    pub fn mix_psk(&mut self, psk: &[u8; KEY_SIZE]) -> Zeroizing<[u8; KEY_SIZE]> {
        let (chain_key, tau, key) = kdf3(&self.chain_key, psk);
        self.chain_key = chain_key;
        self.mix_hash(&tau[..]);
        key
    }

    /// Seal `plaintext` into `out` (which must be exactly 16 bytes longer)
    /// under the zero nonce with the current hash as AAD, then absorb the
    /// ciphertext and tag into the transcript.
    pub fn encrypt_and_hash(&mut self, key: &[u8; KEY_SIZE], plaintext: &[u8], out: &mut [u8]) {
        debug_assert_eq!(out.len(), plaintext.len() + AEAD_TAG_SIZE);
        let aead = ChaCha20Poly1305::new(Key::from_slice(key.as_slice()));
        let (body, tag_out) = out.split_at_mut(plaintext.len());
        body.copy_from_slice(plaintext);
        let tag = aead
            .encrypt_in_place_detached(Nonce::from_slice(&ZERO_NONCE), &self.hash, body)
            .unwrap();
        tag_out.copy_from_slice(tag.as_slice());
        self.mix_hash(out);
    }

    /// Open `ciphertext` (body plus trailing tag) into `out`. On success the
    /// ciphertext is absorbed into the transcript; on failure the state is
    /// left as it was, which is fine because callers only commit fully
    /// authenticated clones.
    #[must_use]
    pub fn decrypt_and_hash(&mut self, key: &[u8; KEY_SIZE], ciphertext: &[u8], out: &mut [u8]) -> bool {
        if ciphertext.len() < AEAD_TAG_SIZE || out.len() != ciphertext.len() - AEAD_TAG_SIZE {
            return false;
        }
        let aead = ChaCha20Poly1305::new(Key::from_slice(key.as_slice()));
        let (body, tag) = ciphertext.split_at(ciphertext.len() - AEAD_TAG_SIZE);
        out.copy_from_slice(body);
        let ok = aead
            .decrypt_in_place_detached(
                Nonce::from_slice(&ZERO_NONCE),
                &self.hash,
                out,
                Tag::from_slice(tag),
            )
            .is_ok();
        if ok {
            self.mix_hash(ciphertext);
        }
        ok
    }

    /// Derive the directional transport keys from the final chain key.
    pub fn split(&self) -> (Zeroizing<[u8; KEY_SIZE]>, Zeroizing<[u8; KEY_SIZE]>) {
        kdf2(&self.chain_key, &[])
    }

    /// Overwrite the chain key. Called when the handshake returns to the
    /// zeroed state after the transport keys have been derived.
    pub fn clear_chain_key(&mut self) {
        self.chain_key = Zeroizing::new([0u8; KEY_SIZE]);
    }
}
