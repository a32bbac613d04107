/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use blake2::{Blake2s256, Digest};
use lazy_static::lazy_static;

/* Noise protocol constants */

pub const CONSTRUCTION: &str = "Noise_IKpsk2_25519_ChaChaPoly_BLAKE2s";
pub const IDENTIFIER: &str = "WireGuard v1 zx2c4 Jason@zx2c4.com";

pub const KEY_SIZE: usize = 32;
pub const PUBLIC_KEY_SIZE: usize = 32;

pub(crate) const AEAD_TAG_SIZE: usize = 16;
pub(crate) const AEAD_NONCE_SIZE: usize = 12;
pub(crate) const TAI64N_SIZE: usize = 12;
pub(crate) const MAC_SIZE: usize = 16;

/// Every handshake AEAD call runs under a one-shot key, so the nonce is
/// fixed at zero. Transport messages use a counter nonce instead.
pub(crate) const ZERO_NONCE: [u8; AEAD_NONCE_SIZE] = [0u8; AEAD_NONCE_SIZE];

lazy_static! {
    pub(crate) static ref INITIAL_CHAIN_KEY: [u8; KEY_SIZE] = {
        let mut h = Blake2s256::new();
        h.update(CONSTRUCTION.as_bytes());
        h.finalize().into()
    };
    pub(crate) static ref INITIAL_HASH: [u8; KEY_SIZE] = {
        let mut h = Blake2s256::new();
        h.update(INITIAL_CHAIN_KEY.as_slice());
        h.update(IDENTIFIER.as_bytes());
        h.finalize().into()
    };
}

/* Wire message constants */

// The type is a single octet followed by three zero octets; serializing
// little-endian lets both ends treat the field as a u32.
pub const MESSAGE_INITIATION_TYPE: u32 = 1;
pub const MESSAGE_RESPONSE_TYPE: u32 = 2;
/// Cookie responses belong to the MAC/cookie load-shedding layer; only the
/// type tag is reserved here.
pub const MESSAGE_COOKIE_RESPONSE_TYPE: u32 = 3;
pub const MESSAGE_TRANSPORT_TYPE: u32 = 4;

pub const MESSAGE_INITIATION_SIZE: usize = 148;
pub const MESSAGE_RESPONSE_SIZE: usize = 92;
pub const MESSAGE_TRANSPORT_HEADER_SIZE: usize = 16;

/// Hard per-key send limit. Chosen to leave room between it and the point
/// where a 64-bit counter would wrap.
pub(crate) const REJECT_AFTER_MESSAGES: u64 = u64::MAX - (1 << 4) - 1;

/// First handshake message. The static key and timestamp fields carry
/// their AEAD tags inline; `mac1`/`mac2` belong to the cookie layer and
/// are zero-filled here.
#[derive(Clone, Debug)]
pub struct MessageInitiation {
    pub message_type: u32,
    pub sender: u32,
    pub ephemeral: [u8; PUBLIC_KEY_SIZE],
    pub static_encrypted: [u8; PUBLIC_KEY_SIZE + AEAD_TAG_SIZE],
    pub timestamp_encrypted: [u8; TAI64N_SIZE + AEAD_TAG_SIZE],
    pub mac1: [u8; MAC_SIZE],
    pub mac2: [u8; MAC_SIZE],
}

/// Second handshake message. `empty` is the AEAD tag over a zero-length
/// plaintext, binding the responder's view of the transcript.
#[derive(Clone, Debug)]
pub struct MessageResponse {
    pub message_type: u32,
    pub sender: u32,
    pub receiver: u32,
    pub ephemeral: [u8; PUBLIC_KEY_SIZE],
    pub empty: [u8; AEAD_TAG_SIZE],
    pub mac1: [u8; MAC_SIZE],
    pub mac2: [u8; MAC_SIZE],
}

/// Data message. `content` is AEAD ciphertext plus tag; a keepalive is the
/// sealed empty plaintext.
#[derive(Clone, Debug)]
pub struct MessageTransport {
    pub message_type: u32,
    pub receiver: u32,
    pub counter: u64,
    pub content: Vec<u8>,
}

impl MessageInitiation {
    pub fn to_bytes(&self) -> [u8; MESSAGE_INITIATION_SIZE] {
        let mut b = [0u8; MESSAGE_INITIATION_SIZE];
        b[0..4].copy_from_slice(&self.message_type.to_le_bytes());
        b[4..8].copy_from_slice(&self.sender.to_le_bytes());
        b[8..40].copy_from_slice(&self.ephemeral);
        b[40..88].copy_from_slice(&self.static_encrypted);
        b[88..116].copy_from_slice(&self.timestamp_encrypted);
        b[116..132].copy_from_slice(&self.mac1);
        b[132..148].copy_from_slice(&self.mac2);
        b
    }

    /// Parse from the wire. Only the length is checked here; the type tag
    /// is validated by the consume path so that a wrong tag and a corrupt
    /// payload are indistinguishable to the sender.
    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        if b.len() != MESSAGE_INITIATION_SIZE {
            return None;
        }
        let mut msg = Self {
            message_type: u32::from_le_bytes(b[0..4].try_into().unwrap()),
            sender: u32::from_le_bytes(b[4..8].try_into().unwrap()),
            ephemeral: [0u8; PUBLIC_KEY_SIZE],
            static_encrypted: [0u8; PUBLIC_KEY_SIZE + AEAD_TAG_SIZE],
            timestamp_encrypted: [0u8; TAI64N_SIZE + AEAD_TAG_SIZE],
            mac1: [0u8; MAC_SIZE],
            mac2: [0u8; MAC_SIZE],
        };
        msg.ephemeral.copy_from_slice(&b[8..40]);
        msg.static_encrypted.copy_from_slice(&b[40..88]);
        msg.timestamp_encrypted.copy_from_slice(&b[88..116]);
        msg.mac1.copy_from_slice(&b[116..132]);
        msg.mac2.copy_from_slice(&b[132..148]);
        Some(msg)
    }
}

impl MessageResponse {
    pub fn to_bytes(&self) -> [u8; MESSAGE_RESPONSE_SIZE] {
        let mut b = [0u8; MESSAGE_RESPONSE_SIZE];
        b[0..4].copy_from_slice(&self.message_type.to_le_bytes());
        b[4..8].copy_from_slice(&self.sender.to_le_bytes());
        b[8..12].copy_from_slice(&self.receiver.to_le_bytes());
        b[12..44].copy_from_slice(&self.ephemeral);
        b[44..60].copy_from_slice(&self.empty);
        b[60..76].copy_from_slice(&self.mac1);
        b[76..92].copy_from_slice(&self.mac2);
        b
    }

    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        if b.len() != MESSAGE_RESPONSE_SIZE {
            return None;
        }
        let mut msg = Self {
            message_type: u32::from_le_bytes(b[0..4].try_into().unwrap()),
            sender: u32::from_le_bytes(b[4..8].try_into().unwrap()),
            receiver: u32::from_le_bytes(b[8..12].try_into().unwrap()),
            ephemeral: [0u8; PUBLIC_KEY_SIZE],
            empty: [0u8; AEAD_TAG_SIZE],
            mac1: [0u8; MAC_SIZE],
            mac2: [0u8; MAC_SIZE],
        };
        msg.ephemeral.copy_from_slice(&b[12..44]);
        msg.empty.copy_from_slice(&b[44..60]);
        msg.mac1.copy_from_slice(&b[60..76]);
        msg.mac2.copy_from_slice(&b[76..92]);
        Some(msg)
    }
}

impl MessageTransport {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut b = Vec::with_capacity(MESSAGE_TRANSPORT_HEADER_SIZE + self.content.len());
        b.extend_from_slice(&self.message_type.to_le_bytes());
        b.extend_from_slice(&self.receiver.to_le_bytes());
        b.extend_from_slice(&self.counter.to_le_bytes());
        b.extend_from_slice(&self.content);
        b
    }

    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        if b.len() < MESSAGE_TRANSPORT_HEADER_SIZE {
            return None;
        }
        Some(Self {
            message_type: u32::from_le_bytes(b[0..4].try_into().unwrap()),
            receiver: u32::from_le_bytes(b[4..8].try_into().unwrap()),
            counter: u64::from_le_bytes(b[8..16].try_into().unwrap()),
            content: b[MESSAGE_TRANSPORT_HEADER_SIZE..].to_vec(),
        })
    }
}
