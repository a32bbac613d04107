/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! The Noise_IKpsk2 handshake core of a WireGuard-compatible tunnel
//! endpoint: Curve25519, ChaCha20-Poly1305 and BLAKE2s, producing a pair of
//! authenticated transport keys from a two-message exchange.
//!
//! A [`Device`] owns the endpoint's static key pair, its registered
//! [`Peer`]s and the session index table. The four handshake operations
//! live on the device; a completed exchange is turned into a [`KeyPair`]
//! with [`Peer::new_key_pair`], which installs it into the peer's rotating
//! slots and raises the per-peer [`Signal`] on the initiator side.
//!
//! Everything outside the handshake (UDP sockets, IP routing, the
//! cookie/MAC load-shedding layer, timers) belongs to the caller. The
//! consume operations return bare `None` on any failure so that callers
//! cannot leak why a message was rejected.

pub mod error;
pub mod proto;

mod device;
mod handshake;
mod index;
mod kdf;
mod keypair;
mod symmetric_state;

pub use crate::device::{Device, Peer};
pub use crate::error::{HandshakeError, SendError};
pub use crate::handshake::HandshakeState;
pub use crate::keypair::{KeyPair, KeyPairs, Signal};
pub use crate::proto::{MessageInitiation, MessageResponse, MessageTransport};

// Re-exported so integrators build against the same versions we do.
pub use rand_core;
pub use x25519_dalek;
