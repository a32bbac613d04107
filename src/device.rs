/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, Weak};

use rand_core::{CryptoRng, RngCore};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::handshake::{Handshake, HandshakeState};
use crate::index::{IndexBinding, IndexTable};
use crate::keypair::{KeyPair, KeyPairs};
use crate::proto::KEY_SIZE;

/// One tunnel endpoint: the long-term static key pair, the peers configured
/// to talk to it, and the table that demultiplexes inbound session indices.
///
/// Lock order: `handshake -> key_pairs -> indices -> rng`. Nothing here
/// acquires in the reverse direction, and no lock is held across a call
/// back into caller code.
pub struct Device<R: RngCore + CryptoRng> {
    static_secret: StaticSecret,
    static_public: PublicKey,
    peers: RwLock<HashMap<[u8; KEY_SIZE], Arc<Peer<R>>>>,
    pub(crate) indices: IndexTable<R>,
    pub(crate) rng: Mutex<R>,
}

/// A configured remote endpoint. The handshake record and the key-pair
/// rotation both live here; the device's index table only ever points back
/// at them through weak references.
pub struct Peer<R: RngCore + CryptoRng> {
    pub(crate) device: Weak<Device<R>>,
    pub(crate) remote_static: PublicKey,
    /// DH of our static secret with the peer's static key, computed once at
    /// registration. Both sides mix it into the timestamp encryption, which
    /// is what lets the responder authenticate before any response exists.
    pub(crate) precomputed_static_static: Zeroizing<[u8; KEY_SIZE]>,
    pub(crate) handshake: Mutex<Handshake>,
    key_pairs: KeyPairs,
}

impl<R: RngCore + CryptoRng> Device<R> {
    pub fn new(static_secret: StaticSecret, rng: R) -> Arc<Self> {
        let static_public = PublicKey::from(&static_secret);
        Arc::new(Self {
            static_secret,
            static_public,
            peers: RwLock::new(HashMap::new()),
            indices: IndexTable::new(),
            rng: Mutex::new(rng),
        })
    }

    pub fn public_key(&self) -> PublicKey {
        self.static_public
    }

    pub(crate) fn static_secret(&self) -> &StaticSecret {
        &self.static_secret
    }

    /// Register a peer by its static public key. Registering the same key
    /// again replaces the old entry and tears its sessions down, on the
    /// assumption that the caller is reconfiguring.
    pub fn add_peer(self: &Arc<Self>, remote_static: PublicKey) -> Arc<Peer<R>> {
        let shared = self.static_secret.diffie_hellman(&remote_static);
        let peer = Arc::new(Peer {
            device: Arc::downgrade(self),
            remote_static,
            precomputed_static_static: Zeroizing::new(shared.to_bytes()),
            handshake: Mutex::new(Handshake::new()),
            key_pairs: KeyPairs::new(),
        });
        let replaced = self
            .peers
            .write()
            .unwrap()
            .insert(remote_static.to_bytes(), peer.clone());
        if let Some(old) = replaced {
            self.teardown_peer(&old);
        }
        peer
    }

    pub fn lookup_peer(&self, public: &PublicKey) -> Option<Arc<Peer<R>>> {
        self.peers.read().unwrap().get(public.as_bytes()).cloned()
    }

    /// Drop a peer and retire every index its sessions held.
    pub fn remove_peer(&self, public: &PublicKey) -> bool {
        let removed = self.peers.write().unwrap().remove(public.as_bytes());
        match removed {
            Some(peer) => {
                self.teardown_peer(&peer);
                true
            }
            None => false,
        }
    }

    /// Resolve the receiver field of an inbound transport message to the
    /// peer and key pair it was encrypted under.
    pub fn lookup_key_pair(&self, receiver: u32) -> Option<(Arc<Peer<R>>, Arc<KeyPair>)> {
        let entry = self.indices.lookup(receiver)?;
        match entry.binding {
            IndexBinding::Transport(key_pair) => {
                Some((entry.peer.upgrade()?, key_pair.upgrade()?))
            }
            IndexBinding::Handshake => None,
        }
    }

    fn teardown_peer(&self, peer: &Arc<Peer<R>>) {
        peer.reset_handshake();
        for key_pair in peer.key_pairs.drain().into_iter().flatten() {
            self.indices.clear_index(key_pair.local_index);
        }
    }
}

impl<R: RngCore + CryptoRng> Peer<R> {
    pub fn remote_static(&self) -> PublicKey {
        self.remote_static
    }

    pub fn key_pairs(&self) -> &KeyPairs {
        &self.key_pairs
    }

    pub fn handshake_state(&self) -> HandshakeState {
        self.handshake.lock().unwrap().state
    }

    /// Set (or clear, with all zeroes) the optional pre-shared key. It is
    /// read at the psk2 stage, so it applies to the next response built or
    /// consumed with this peer.
    pub fn set_preshared_key(&self, psk: [u8; KEY_SIZE]) {
        self.handshake.lock().unwrap().preshared_key = Zeroizing::new(psk);
    }

    /// Abandon any in-flight handshake: retire its index, wipe the chain
    /// key and ephemeral, and return to the zeroed state. The replay
    /// timestamp survives so a restart cannot be used to replay an old
    /// initiation.
    pub fn reset_handshake(&self) {
        let mut handshake = self.handshake.lock().unwrap();
        if let Some(index) = handshake.local_index.take() {
            if let Some(device) = self.device.upgrade() {
                device.indices.clear_index(index);
            }
        }
        handshake.noise.clear_chain_key();
        handshake.local_ephemeral = None;
        handshake.state = HandshakeState::Zeroed;
    }

    /// Promote the parked `next` key pair to `current`; the transport layer
    /// calls this once the first packet authenticates under `next`. Returns
    /// whether a promotion happened.
    pub fn promote_next_key_pair(&self) -> bool {
        let (promoted, evicted) = self.key_pairs.promote_next();
        if let Some(old) = evicted {
            if let Some(device) = self.device.upgrade() {
                device.indices.clear_index(old.local_index);
            }
        }
        promoted
    }
}
