/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::{Mutex, Weak};

use rand_core::{CryptoRng, RngCore};

use crate::device::Peer;
use crate::error::HandshakeError;
use crate::keypair::KeyPair;

/// Give up allocating after this many collisions. A healthy RNG collides
/// roughly once per 2^32 live entries, so hitting the bound means the RNG
/// is returning constants.
const MAX_INDEX_ATTEMPTS: usize = 128;

/// What a session index currently resolves to. The peer owns the handshake
/// and the key-pair slots; the table only holds weak references, so entries
/// die with their owners instead of keeping them alive.
#[derive(Clone)]
pub(crate) enum IndexBinding {
    /// The index was allocated for an in-flight handshake; resolve through
    /// the peer's handshake record.
    Handshake,
    /// The handshake completed and the same index now addresses a transport
    /// key pair.
    Transport(Weak<KeyPair>),
}

pub(crate) struct IndexEntry<R: RngCore + CryptoRng> {
    pub peer: Weak<Peer<R>>,
    pub binding: IndexBinding,
}

impl<R: RngCore + CryptoRng> Clone for IndexEntry<R> {
    fn clone(&self) -> Self {
        Self { peer: self.peer.clone(), binding: self.binding.clone() }
    }
}

/// Process-wide map from 32-bit session index to whatever currently answers
/// to it. Indices are drawn uniformly at random; zero is never allocated,
/// so "no index" needs no sentinel value anywhere else in the crate.
pub(crate) struct IndexTable<R: RngCore + CryptoRng> {
    map: Mutex<HashMap<NonZeroU32, IndexEntry<R>>>,
}

impl<R: RngCore + CryptoRng> IndexTable<R> {
    pub fn new() -> Self {
        Self { map: Mutex::new(HashMap::new()) }
    }

    /// Allocate a fresh index bound to `peer`'s handshake. Retries on the
    /// (exhaustively improbable) collision with a live entry.
    pub fn new_index(
        &self,
        rng: &Mutex<R>,
        peer: Weak<Peer<R>>,
    ) -> Result<NonZeroU32, HandshakeError> {
        let mut map = self.map.lock().unwrap();
        for _ in 0..MAX_INDEX_ATTEMPTS {
            let candidate = rng.lock().unwrap().next_u32();
            let Some(index) = NonZeroU32::new(candidate) else {
                continue;
            };
            if let std::collections::hash_map::Entry::Vacant(slot) = map.entry(index) {
                slot.insert(IndexEntry { peer: peer.clone(), binding: IndexBinding::Handshake });
                return Ok(index);
            }
        }
        Err(HandshakeError::IndexExhausted)
    }

    /// Replace whatever the index resolves to. Used when a completed
    /// handshake hands its index over to the freshly derived key pair.
    pub fn insert(&self, index: NonZeroU32, entry: IndexEntry<R>) {
        self.map.lock().unwrap().insert(index, entry);
    }

    pub fn clear_index(&self, index: NonZeroU32) {
        self.map.lock().unwrap().remove(&index);
    }

    /// Resolve a receiver field from the wire. Entries whose owner has been
    /// dropped are pruned on the way through.
    pub fn lookup(&self, index: u32) -> Option<IndexEntry<R>> {
        let index = NonZeroU32::new(index)?;
        let mut map = self.map.lock().unwrap();
        let entry = map.get(&index)?;
        if entry.peer.strong_count() == 0 {
            map.remove(&index);
            return None;
        }
        Some(entry.clone())
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.map.lock().unwrap().len()
    }
}
