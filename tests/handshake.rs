/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! Two in-memory devices running the whole exchange over serialized
//! messages, the way a transport loop would drive the crate.

use ironwire::x25519_dalek::StaticSecret;
use ironwire::{
    Device, HandshakeError, HandshakeState, MessageInitiation, MessageResponse, MessageTransport,
};
use rand::rngs::StdRng;
use rand::SeedableRng;

fn device(tail: u8, seed: u64) -> std::sync::Arc<Device<StdRng>> {
    let mut bytes = [0xe8u8; 32];
    bytes[31] = tail;
    Device::new(StaticSecret::from(bytes), StdRng::seed_from_u64(seed))
}

#[test]
fn end_to_end_session() {
    let alice = device(0x01, 1);
    let bob = device(0x02, 2);
    let bob_peer = alice.add_peer(bob.public_key());
    let alice_peer = bob.add_peer(alice.public_key());

    // Initiation travels as 148 bytes on the wire.
    let init = alice.create_initiation(&bob_peer).unwrap();
    let wire = init.to_bytes();
    assert_eq!(wire.len(), 148);
    assert_eq!(bob_peer.handshake_state(), HandshakeState::InitiationCreated);

    let init = MessageInitiation::from_bytes(&wire).unwrap();
    let consumed = bob.consume_initiation(&init).unwrap();
    assert!(std::sync::Arc::ptr_eq(&consumed, &alice_peer));

    // Response is 92 bytes back.
    let resp = bob.create_response(&alice_peer).unwrap();
    let wire = resp.to_bytes();
    assert_eq!(wire.len(), 92);
    let resp = MessageResponse::from_bytes(&wire).unwrap();
    alice.consume_response(&resp).unwrap();

    // Both sides convert the completed handshake into transport keys.
    let kp_alice = bob_peer.new_key_pair().unwrap();
    let kp_bob = alice_peer.new_key_pair().unwrap();
    assert!(kp_alice.is_initiator());
    assert!(!kp_bob.is_initiator());
    assert_eq!(kp_alice.send_counter(), 0);
    assert_eq!(kp_bob.send_counter(), 0);

    // Alice, the initiator, gets the new-key-pair signal and a current
    // slot; Bob parks his keys in next until traffic arrives.
    assert!(bob_peer.key_pairs().signal().take());
    assert!(!bob_peer.key_pairs().signal().take());
    assert!(bob_peer.key_pairs().current().is_some());
    assert!(alice_peer.key_pairs().next().is_some());
    assert!(!alice_peer.key_pairs().signal().take());

    // Traffic flows both ways, through serialized transport messages.
    let msg = kp_alice.seal(b"first packet").unwrap();
    let wire = msg.to_bytes();
    let msg = MessageTransport::from_bytes(&wire).unwrap();
    let (peer, kp) = bob.lookup_key_pair(msg.receiver).unwrap();
    assert!(std::sync::Arc::ptr_eq(&peer, &alice_peer));
    assert_eq!(kp.open(&msg).unwrap(), b"first packet");

    // That first authenticated packet is Bob's cue to promote.
    assert!(alice_peer.promote_next_key_pair());
    assert!(alice_peer.key_pairs().current().is_some());

    let reply = kp_bob.seal(b"reply").unwrap();
    assert_eq!(kp_alice.open(&reply).unwrap(), b"reply");

    // Keepalives are sealed empty payloads.
    let keepalive = kp_alice.seal(&[]).unwrap();
    assert!(kp_bob.open(&keepalive).unwrap().is_empty());

    // Replayed transport counters are dropped.
    assert!(kp_bob.open(&msg).is_none());
}

#[test]
fn matching_preshared_keys_succeed_and_mismatched_fail() {
    let alice = device(0x01, 3);
    let bob = device(0x02, 4);
    let bob_peer = alice.add_peer(bob.public_key());
    let alice_peer = bob.add_peer(alice.public_key());

    let psk = [0x5au8; 32];
    bob_peer.set_preshared_key(psk);
    alice_peer.set_preshared_key(psk);

    let init = alice.create_initiation(&bob_peer).unwrap();
    bob.consume_initiation(&init).unwrap();
    let resp = bob.create_response(&alice_peer).unwrap();
    assert!(alice.consume_response(&resp).is_some());

    // Now desynchronize the keys and run it again: the responder's sealed
    // empty field no longer authenticates.
    alice_peer.set_preshared_key([0x5bu8; 32]);
    let init = alice.create_initiation(&bob_peer).unwrap();
    bob.consume_initiation(&init).unwrap();
    let resp = bob.create_response(&alice_peer).unwrap();
    assert!(alice.consume_response(&resp).is_none());
    assert_eq!(bob_peer.handshake_state(), HandshakeState::InitiationCreated);
}

#[test]
fn out_of_order_operations_are_refused() {
    let alice = device(0x01, 5);
    let bob = device(0x02, 6);
    let bob_peer = alice.add_peer(bob.public_key());
    let alice_peer = bob.add_peer(alice.public_key());

    // No initiation consumed yet.
    assert_eq!(
        bob.create_response(&alice_peer).unwrap_err(),
        HandshakeError::InvalidState
    );

    // A peer with no completed exchange has no keys to derive.
    assert!(bob_peer.new_key_pair().is_none());
    assert!(alice_peer.new_key_pair().is_none());
}

#[test]
fn corrupted_messages_never_reach_the_peer() {
    let alice = device(0x01, 7);
    let bob = device(0x02, 8);
    let bob_peer = alice.add_peer(bob.public_key());
    let alice_peer = bob.add_peer(alice.public_key());

    let init = alice.create_initiation(&bob_peer).unwrap();
    let mut wire = init.to_bytes();
    // Flip one bit of the sealed static key.
    wire[40] ^= 0x04;
    let tampered = MessageInitiation::from_bytes(&wire).unwrap();
    assert!(bob.consume_initiation(&tampered).is_none());
    assert_eq!(alice_peer.handshake_state(), HandshakeState::Zeroed);

    // Truncated datagrams fail to parse at all.
    assert!(MessageInitiation::from_bytes(&wire[..100]).is_none());
    assert!(MessageResponse::from_bytes(&wire).is_none());
}

#[test]
fn removing_a_peer_tears_its_sessions_down() {
    let alice = device(0x01, 9);
    let bob = device(0x02, 10);
    let bob_peer = alice.add_peer(bob.public_key());
    let alice_peer = bob.add_peer(alice.public_key());

    let init = alice.create_initiation(&bob_peer).unwrap();
    bob.consume_initiation(&init).unwrap();
    let resp = bob.create_response(&alice_peer).unwrap();
    alice.consume_response(&resp).unwrap();
    let kp = bob_peer.new_key_pair().unwrap();
    let receiver = kp.seal(b"x").unwrap().receiver;
    assert!(alice_peer.new_key_pair().is_some());
    assert!(bob.lookup_key_pair(receiver).is_some());

    assert!(bob.remove_peer(&alice.public_key()));
    assert!(bob.lookup_peer(&alice.public_key()).is_none());
    assert!(bob.lookup_key_pair(receiver).is_none());
    assert!(!bob.remove_peer(&alice.public_key()));
}
