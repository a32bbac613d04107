/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use zeroize::Zeroizing;

use crate::error::SendError;
use crate::proto::{
    MessageTransport, AEAD_NONCE_SIZE, KEY_SIZE, MESSAGE_TRANSPORT_TYPE, REJECT_AFTER_MESSAGES,
};

// The transport nonce carries the message counter little-endian in its
// last eight bytes; only the handshake uses the fixed zero nonce.
fn transport_nonce(counter: u64) -> [u8; AEAD_NONCE_SIZE] {
    let mut nonce = [0u8; AEAD_NONCE_SIZE];
    nonce[4..].copy_from_slice(&counter.to_le_bytes());
    nonce
}

/// A directional pair of transport keys derived from one completed
/// handshake, with the counters that keep their nonces unique.
pub struct KeyPair {
    send: ChaCha20Poly1305,
    recv: ChaCha20Poly1305,
    send_counter: AtomicU64,
    /// One past the highest receive counter that has authenticated.
    recv_watermark: AtomicU64,
    is_initiator: bool,
    created: Instant,
    pub(crate) local_index: NonZeroU32,
    remote_index: u32,
}

impl KeyPair {
    pub(crate) fn new(
        send_key: Zeroizing<[u8; KEY_SIZE]>,
        recv_key: Zeroizing<[u8; KEY_SIZE]>,
        is_initiator: bool,
        local_index: NonZeroU32,
        remote_index: u32,
    ) -> Self {
        Self {
            send: ChaCha20Poly1305::new(Key::from_slice(send_key.as_slice())),
            recv: ChaCha20Poly1305::new(Key::from_slice(recv_key.as_slice())),
            send_counter: AtomicU64::new(0),
            recv_watermark: AtomicU64::new(0),
            is_initiator,
            created: Instant::now(),
            local_index,
            remote_index,
        }
    }

    /// True if this key pair came out of a handshake we initiated.
    pub fn is_initiator(&self) -> bool {
        self.is_initiator
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    /// Next send counter value (the number of messages sealed so far).
    pub fn send_counter(&self) -> u64 {
        self.send_counter.load(Ordering::Relaxed)
    }

    /// One past the highest counter accepted on the receive side.
    pub fn receive_watermark(&self) -> u64 {
        self.recv_watermark.load(Ordering::Relaxed)
    }

    /// Seal a transport message addressed to the remote session index. An
    /// empty `plaintext` produces a keepalive.
    pub fn seal(&self, plaintext: &[u8]) -> Result<MessageTransport, SendError> {
        let counter = self.send_counter.fetch_add(1, Ordering::Relaxed);
        if counter >= REJECT_AFTER_MESSAGES {
            return Err(SendError::KeyExpired);
        }
        let content = self
            .send
            .encrypt(Nonce::from_slice(&transport_nonce(counter)), plaintext)
            .unwrap();
        Ok(MessageTransport {
            message_type: MESSAGE_TRANSPORT_TYPE,
            receiver: self.remote_index,
            counter,
            content,
        })
    }

    /// Open an inbound transport message. Returns `None` on a wrong type
    /// tag, an expired or replayed counter, or a failed tag check; the
    /// watermark only advances after the message has authenticated.
    pub fn open(&self, msg: &MessageTransport) -> Option<Vec<u8>> {
        if msg.message_type != MESSAGE_TRANSPORT_TYPE || msg.counter >= REJECT_AFTER_MESSAGES {
            return None;
        }
        let plaintext = self
            .recv
            .decrypt(Nonce::from_slice(&transport_nonce(msg.counter)), msg.content.as_slice())
            .ok()?;
        let prev = self.recv_watermark.fetch_max(msg.counter + 1, Ordering::Relaxed);
        if prev > msg.counter {
            // Counter at or below the watermark: a replay or reordered
            // duplicate that lost the race. The watermark is already past
            // it, so dropping the plaintext is all that is left to do.
            return None;
        }
        Some(plaintext)
    }
}

/// Coalescing one-slot signal. Raising an already-raised signal is a no-op,
/// so a slow consumer sees one notification however many key pairs landed
/// in the meantime.
pub struct Signal(AtomicBool);

impl Signal {
    fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    pub(crate) fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Consume the pending notification, if any.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::Acquire)
    }
}

#[derive(Default)]
struct Slots {
    previous: Option<Arc<KeyPair>>,
    current: Option<Arc<KeyPair>>,
    next: Option<Arc<KeyPair>>,
}

/// The per-peer rotation of transport key pairs.
///
/// An initiator installs straight into `current` (it already knows the
/// responder has everything it needs). A responder parks the new keys in
/// `next` until the transport path sees the first packet authenticated
/// under them, then promotes.
pub struct KeyPairs {
    slots: Mutex<Slots>,
    new_current: Signal,
}

impl KeyPairs {
    pub(crate) fn new() -> Self {
        Self { slots: Mutex::new(Slots::default()), new_current: Signal::new() }
    }

    pub fn previous(&self) -> Option<Arc<KeyPair>> {
        self.slots.lock().unwrap().previous.clone()
    }

    pub fn current(&self) -> Option<Arc<KeyPair>> {
        self.slots.lock().unwrap().current.clone()
    }

    pub fn next(&self) -> Option<Arc<KeyPair>> {
        self.slots.lock().unwrap().next.clone()
    }

    /// Signal raised whenever a new `current` key pair is installed on the
    /// initiator side; the transport layer drains it to start sending.
    pub fn signal(&self) -> &Signal {
        &self.new_current
    }

    /// Install a freshly derived key pair, returning whichever key pair
    /// fell out of the rotation so the caller can retire its index.
    pub(crate) fn install(&self, key_pair: Arc<KeyPair>) -> Option<Arc<KeyPair>> {
        let mut slots = self.slots.lock().unwrap();
        if key_pair.is_initiator() {
            let evicted = slots.previous.take();
            slots.previous = slots.current.take();
            slots.current = Some(key_pair);
            drop(slots);
            self.new_current.raise();
            evicted
        } else {
            slots.next.replace(key_pair)
        }
    }

    /// Empty all three slots, handing the key pairs back so the caller can
    /// retire their indices. Used when a peer is torn down.
    pub(crate) fn drain(&self) -> [Option<Arc<KeyPair>>; 3] {
        let mut slots = self.slots.lock().unwrap();
        [slots.previous.take(), slots.current.take(), slots.next.take()]
    }

    /// Promote `next` to `current`. The transport layer calls this when the
    /// first packet authenticates under `next`. Returns the evicted key
    /// pair, or `None` if there was nothing to promote.
    pub(crate) fn promote_next(&self) -> (bool, Option<Arc<KeyPair>>) {
        let mut slots = self.slots.lock().unwrap();
        match slots.next.take() {
            Some(next) => {
                let evicted = slots.previous.take();
                slots.previous = slots.current.take();
                slots.current = Some(next);
                (true, evicted)
            }
            None => (false, None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(initiator: bool) -> KeyPair {
        KeyPair::new(
            Zeroizing::new([0x11; KEY_SIZE]),
            Zeroizing::new([0x11; KEY_SIZE]),
            initiator,
            NonZeroU32::new(77).unwrap(),
            42,
        )
    }

    // Same key both directions, so one object can open what it seals.
    #[test]
    fn seal_open_and_watermark() {
        let kp = pair(true);
        assert_eq!(kp.send_counter(), 0);
        assert_eq!(kp.receive_watermark(), 0);

        let msg = kp.seal(b"payload").unwrap();
        assert_eq!(msg.counter, 0);
        assert_eq!(msg.receiver, 42);

        assert_eq!(kp.open(&msg).unwrap(), b"payload");
        assert_eq!(kp.receive_watermark(), 1);
        // Replay of an accepted counter is dropped after authentication.
        assert!(kp.open(&msg).is_none());

        let keepalive = kp.seal(&[]).unwrap();
        assert_eq!(keepalive.counter, 1);
        assert_eq!(kp.open(&keepalive).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn open_rejects_tamper_and_type() {
        let kp = pair(true);
        let mut msg = kp.seal(b"x").unwrap();
        msg.content[0] ^= 1;
        assert!(kp.open(&msg).is_none());
        // Tamper failures do not advance the watermark.
        assert_eq!(kp.receive_watermark(), 0);

        let mut msg = kp.seal(b"x").unwrap();
        msg.message_type = 3;
        assert!(kp.open(&msg).is_none());
    }

    #[test]
    fn initiator_installs_current_and_signals() {
        let kps = KeyPairs::new();
        assert!(!kps.signal().take());

        kps.install(Arc::new(pair(true)));
        assert!(kps.current().is_some());
        assert!(kps.next().is_none());
        assert!(kps.signal().take());
        assert!(!kps.signal().take());

        // Two installs before the consumer drains coalesce to one signal.
        kps.install(Arc::new(pair(true)));
        kps.install(Arc::new(pair(true)));
        assert!(kps.signal().take());
        assert!(!kps.signal().take());
        assert!(kps.previous().is_some());
    }

    #[test]
    fn responder_installs_next_then_promotes() {
        let kps = KeyPairs::new();
        kps.install(Arc::new(pair(false)));
        assert!(kps.current().is_none());
        assert!(kps.next().is_some());
        assert!(!kps.signal().take());

        let (promoted, evicted) = kps.promote_next();
        assert!(promoted);
        assert!(evicted.is_none());
        assert!(kps.current().is_some());
        assert!(kps.next().is_none());

        let (promoted, _) = kps.promote_next();
        assert!(!promoted);
    }
}
