/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};

use log::debug;
use rand_core::{CryptoRng, RngCore};
use tai64::{Tai64, Tai64N};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, Zeroizing};

use crate::device::{Device, Peer};
use crate::error::HandshakeError;
use crate::index::{IndexBinding, IndexEntry};
use crate::keypair::KeyPair;
use crate::proto::{
    MessageInitiation, MessageResponse, AEAD_TAG_SIZE, KEY_SIZE, MAC_SIZE,
    MESSAGE_INITIATION_TYPE, MESSAGE_RESPONSE_TYPE, PUBLIC_KEY_SIZE, TAI64N_SIZE,
};
use crate::symmetric_state::SymmetricState;

/// Where a handshake stands. Initiators walk Zeroed -> InitiationCreated
/// -> ResponseConsumed; responders walk Zeroed -> InitiationConsumed ->
/// ResponseCreated. Both roles return to Zeroed when the transport keys are
/// derived, which is the only transition that erases secrets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Zeroed,
    InitiationCreated,
    InitiationConsumed,
    ResponseCreated,
    ResponseConsumed,
}

/// Per-peer handshake record. Every field is guarded by the owning mutex in
/// `Peer`; consume operations build replacement values on the stack and
/// assign them only once the whole message has authenticated.
pub(crate) struct Handshake {
    pub(crate) state: HandshakeState,
    pub(crate) noise: SymmetricState,
    pub(crate) preshared_key: Zeroizing<[u8; KEY_SIZE]>,
    pub(crate) local_ephemeral: Option<StaticSecret>,
    pub(crate) local_index: Option<NonZeroU32>,
    pub(crate) remote_index: u32,
    pub(crate) remote_ephemeral: PublicKey,
    /// Highest timestamp accepted in an initiation from this peer. Never
    /// reset, so replaying an old initiation stays rejected across
    /// handshake restarts.
    pub(crate) last_timestamp: Tai64N,
}

impl Handshake {
    pub fn new() -> Self {
        Self {
            state: HandshakeState::Zeroed,
            noise: SymmetricState::zeroed(),
            preshared_key: Zeroizing::new([0u8; KEY_SIZE]),
            local_ephemeral: None,
            local_index: None,
            remote_index: 0,
            remote_ephemeral: PublicKey::from([0u8; PUBLIC_KEY_SIZE]),
            last_timestamp: Tai64N(Tai64(0), 0),
        }
    }
}

fn generate_ephemeral<R: RngCore + CryptoRng>(
    rng: &Mutex<R>,
) -> Result<StaticSecret, HandshakeError> {
    let mut seed = [0u8; KEY_SIZE];
    rng.lock()
        .unwrap()
        .try_fill_bytes(&mut seed)
        .map_err(|_| HandshakeError::RngFailure)?;
    let secret = StaticSecret::from(seed);
    seed.zeroize();
    Ok(secret)
}

impl<R: RngCore + CryptoRng> Device<R> {
    /// Build the first handshake message for `peer`. Restarts any handshake
    /// already in flight with this peer: the old index is retired and a
    /// fresh ephemeral and transcript replace whatever was there.
    pub fn create_initiation(
        &self,
        peer: &Arc<Peer<R>>,
    ) -> Result<MessageInitiation, HandshakeError> {
        let mut guard = peer.handshake.lock().unwrap();
        let handshake = &mut *guard;

        // Generate the ephemeral before touching anything, so an RNG
        // failure leaves the record exactly as it was.
        let local_ephemeral = generate_ephemeral(&self.rng)?;
        let ephemeral_public = PublicKey::from(&local_ephemeral);

        handshake.noise = SymmetricState::initialize(peer.remote_static.as_bytes());

        if let Some(old) = handshake.local_index.take() {
            self.indices.clear_index(old);
        }
        let local_index = self.indices.new_index(&self.rng, Arc::downgrade(peer))?;
        handshake.local_index = Some(local_index);

        let mut msg = MessageInitiation {
            message_type: MESSAGE_INITIATION_TYPE,
            sender: local_index.get(),
            ephemeral: ephemeral_public.to_bytes(),
            static_encrypted: [0u8; PUBLIC_KEY_SIZE + AEAD_TAG_SIZE],
            timestamp_encrypted: [0u8; TAI64N_SIZE + AEAD_TAG_SIZE],
            mac1: [0u8; MAC_SIZE],
            mac2: [0u8; MAC_SIZE],
        };

        handshake.noise.mix_key(&msg.ephemeral);
        handshake.noise.mix_hash(&msg.ephemeral);

        // es: prove we can speak to this static key, and hide ours under
        // the result.
        let shared = local_ephemeral.diffie_hellman(&peer.remote_static);
        let key = handshake.noise.mix_key_and_derive(shared.as_bytes());
        handshake
            .noise
            .encrypt_and_hash(&key, self.public_key().as_bytes(), &mut msg.static_encrypted);

        // ss: the precomputed static-static secret keys the timestamp,
        // authenticating us to the responder within the first message.
        let timestamp = Tai64N::now();
        let key = handshake
            .noise
            .mix_key_and_derive(&peer.precomputed_static_static[..]);
        handshake
            .noise
            .encrypt_and_hash(&key, &timestamp.to_bytes(), &mut msg.timestamp_encrypted);

        handshake.local_ephemeral = Some(local_ephemeral);
        handshake.state = HandshakeState::InitiationCreated;
        debug!("created handshake initiation");
        Ok(msg)
    }

    /// Consume an inbound initiation. Returns the peer it authenticated as,
    /// or `None`, without distinguishing a bad tag, an unknown static key
    /// or a replayed timestamp, and without mutating any peer on failure.
    pub fn consume_initiation(&self, msg: &MessageInitiation) -> Option<Arc<Peer<R>>> {
        if msg.message_type != MESSAGE_INITIATION_TYPE {
            return None;
        }

        let mut noise = SymmetricState::initialize(self.public_key().as_bytes());
        noise.mix_key(&msg.ephemeral);
        noise.mix_hash(&msg.ephemeral);

        let remote_ephemeral = PublicKey::from(msg.ephemeral);
        let shared = self.static_secret().diffie_hellman(&remote_ephemeral);
        let key = noise.mix_key_and_derive(shared.as_bytes());
        let mut candidate = [0u8; PUBLIC_KEY_SIZE];
        if !noise.decrypt_and_hash(&key, &msg.static_encrypted, &mut candidate) {
            return None;
        }

        let peer = self.lookup_peer(&PublicKey::from(candidate))?;
        let mut guard = peer.handshake.lock().unwrap();
        let handshake = &mut *guard;

        let key = noise.mix_key_and_derive(&peer.precomputed_static_static[..]);
        let mut timestamp_bytes = [0u8; TAI64N_SIZE];
        if !noise.decrypt_and_hash(&key, &msg.timestamp_encrypted, &mut timestamp_bytes) {
            return None;
        }
        let timestamp = Tai64N::from_slice(&timestamp_bytes).ok()?;

        // The timestamp is the replay defense: anything at or below the
        // watermark is a copy of a message we already acted on.
        if timestamp <= handshake.last_timestamp {
            return None;
        }

        handshake.noise = noise;
        handshake.remote_index = msg.sender;
        handshake.remote_ephemeral = remote_ephemeral;
        handshake.last_timestamp = timestamp;
        handshake.state = HandshakeState::InitiationConsumed;
        drop(guard);
        debug!("consumed handshake initiation");
        Some(peer)
    }

    /// Build the second handshake message. Only valid once an initiation
    /// from this peer has been consumed.
    pub fn create_response(&self, peer: &Arc<Peer<R>>) -> Result<MessageResponse, HandshakeError> {
        let mut guard = peer.handshake.lock().unwrap();
        let handshake = &mut *guard;

        if handshake.state != HandshakeState::InitiationConsumed {
            return Err(HandshakeError::InvalidState);
        }

        let local_ephemeral = generate_ephemeral(&self.rng)?;

        if let Some(old) = handshake.local_index.take() {
            self.indices.clear_index(old);
        }
        let local_index = self.indices.new_index(&self.rng, Arc::downgrade(peer))?;
        handshake.local_index = Some(local_index);

        let mut msg = MessageResponse {
            message_type: MESSAGE_RESPONSE_TYPE,
            sender: local_index.get(),
            receiver: handshake.remote_index,
            ephemeral: PublicKey::from(&local_ephemeral).to_bytes(),
            empty: [0u8; AEAD_TAG_SIZE],
            mac1: [0u8; MAC_SIZE],
            mac2: [0u8; MAC_SIZE],
        };

        handshake.noise.mix_hash(&msg.ephemeral);

        // ee then se: both halves of the forward secrecy for this session.
        let shared = local_ephemeral.diffie_hellman(&handshake.remote_ephemeral);
        handshake.noise.mix_key(shared.as_bytes());
        let shared = local_ephemeral.diffie_hellman(&peer.remote_static);
        handshake.noise.mix_key(shared.as_bytes());

        let key = handshake.noise.mix_psk(&handshake.preshared_key);
        handshake.noise.encrypt_and_hash(&key, &[], &mut msg.empty);

        handshake.local_ephemeral = Some(local_ephemeral);
        handshake.state = HandshakeState::ResponseCreated;
        debug!("created handshake response");
        Ok(msg)
    }

    /// Consume an inbound response. Returns the peer whose initiation it
    /// answers, or `None` with no state change.
    pub fn consume_response(&self, msg: &MessageResponse) -> Option<Arc<Peer<R>>> {
        if msg.message_type != MESSAGE_RESPONSE_TYPE {
            return None;
        }

        let entry = self.indices.lookup(msg.receiver)?;
        if !matches!(entry.binding, IndexBinding::Handshake) {
            return None;
        }
        let peer = entry.peer.upgrade()?;

        let mut guard = peer.handshake.lock().unwrap();
        let handshake = &mut *guard;
        if handshake.state != HandshakeState::InitiationCreated {
            return None;
        }

        let mut noise = handshake.noise.clone();
        noise.mix_hash(&msg.ephemeral);

        let remote_ephemeral = PublicKey::from(msg.ephemeral);
        let local_ephemeral = handshake.local_ephemeral.as_ref()?;
        let shared = local_ephemeral.diffie_hellman(&remote_ephemeral);
        noise.mix_key(shared.as_bytes());
        let shared = self.static_secret().diffie_hellman(&remote_ephemeral);
        noise.mix_key(shared.as_bytes());

        let key = noise.mix_psk(&handshake.preshared_key);
        let mut empty = [0u8; 0];
        if !noise.decrypt_and_hash(&key, &msg.empty, &mut empty) {
            return None;
        }

        handshake.noise = noise;
        handshake.remote_index = msg.sender;
        handshake.state = HandshakeState::ResponseConsumed;
        drop(guard);
        debug!("consumed handshake response");
        Some(peer)
    }
}

impl<R: RngCore + CryptoRng> Peer<R> {
    /// Turn a completed handshake into transport keys and hand the session
    /// index over to them. Valid from ResponseConsumed (initiator) or
    /// ResponseCreated (responder); from anywhere else this returns `None`
    /// and changes nothing.
    ///
    /// The initiator's keys go straight into the `current` slot and the
    /// new-key-pair signal is raised; the responder's are parked in `next`
    /// until the transport layer promotes them.
    pub fn new_key_pair(self: &Arc<Self>) -> Option<Arc<KeyPair>> {
        let device = self.device.upgrade()?;
        let mut guard = self.handshake.lock().unwrap();
        let handshake = &mut *guard;

        let (send_key, recv_key, is_initiator) = match handshake.state {
            HandshakeState::ResponseConsumed => {
                let (send, recv) = handshake.noise.split();
                (send, recv, true)
            }
            HandshakeState::ResponseCreated => {
                let (recv, send) = handshake.noise.split();
                (send, recv, false)
            }
            _ => return None,
        };

        let local_index = handshake.local_index.take()?;
        let key_pair = Arc::new(KeyPair::new(
            send_key,
            recv_key,
            is_initiator,
            local_index,
            handshake.remote_index,
        ));

        // Same index, new binding: the remote side keeps addressing the
        // receiver field it already knows.
        device.indices.insert(
            local_index,
            IndexEntry {
                peer: Arc::downgrade(self),
                binding: IndexBinding::Transport(Arc::downgrade(&key_pair)),
            },
        );

        if let Some(old) = self.key_pairs().install(key_pair.clone()) {
            device.indices.clear_index(old.local_index);
        }

        handshake.noise.clear_chain_key();
        handshake.local_ephemeral = None;
        handshake.state = HandshakeState::Zeroed;
        debug!("derived transport key pair");
        Some(key_pair)
    }
}
