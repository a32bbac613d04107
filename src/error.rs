/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

/// Errors surfaced while building a handshake message.
///
/// Consume-side failures (bad authentication tag, unknown peer, replayed
/// timestamp) are deliberately *not* represented here. Those paths return
/// `None` with no further detail so that a caller cannot accidentally turn
/// them into a decryption oracle by logging or answering differently per
/// cause.
#[derive(Debug, PartialEq, Eq)]
pub enum HandshakeError {
    /// The caller-supplied RNG failed while generating an ephemeral key.
    /// The handshake keeps whatever state it had before the call.
    RngFailure,

    /// The operation was invoked from a handshake state that forbids it,
    /// e.g. building a response before an initiation has been consumed.
    InvalidState,

    /// No unused 32-bit session index could be found after bounded retries.
    /// With a functioning RNG this requires on the order of 2^32 live
    /// sessions, so seeing it in practice means the RNG is broken.
    IndexExhausted,
}

/// Errors surfaced while sealing an outbound transport message.
#[derive(Debug, PartialEq, Eq)]
pub enum SendError {
    /// The send counter reached the hard usage limit for a single key pair.
    /// The key pair must no longer encrypt; the caller is expected to drop
    /// it and run a fresh handshake.
    KeyExpired,
}
