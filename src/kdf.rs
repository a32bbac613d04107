/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use blake2::Blake2s256;
use hmac::{Mac, SimpleHmac};
use zeroize::Zeroizing;

use crate::proto::KEY_SIZE;

// BLAKE2 buffers lazily, so the hmac crate requires its `SimpleHmac`
// wrapper rather than the block-level `Hmac`.
type HmacBlake2s = SimpleHmac<Blake2s256>;

fn hmac(key: &[u8], parts: &[&[u8]]) -> Zeroizing<[u8; KEY_SIZE]> {
    let mut mac = <HmacBlake2s as Mac>::new_from_slice(key).unwrap();
    for p in parts {
        mac.update(p);
    }
    Zeroizing::new(mac.finalize().into_bytes().into())
}

/// HKDF expand to one key: extract with the chain key as salt, then the
/// first counter block.
pub(crate) fn kdf1(chain_key: &[u8; KEY_SIZE], input: &[u8]) -> Zeroizing<[u8; KEY_SIZE]> {
    let t0 = hmac(chain_key, &[input]);
    hmac(&t0[..], &[&[0x01]])
}

/// HKDF expand to two keys.
pub(crate) fn kdf2(
    chain_key: &[u8; KEY_SIZE],
    input: &[u8],
) -> (Zeroizing<[u8; KEY_SIZE]>, Zeroizing<[u8; KEY_SIZE]>) {
    let t0 = hmac(chain_key, &[input]);
    let t1 = hmac(&t0[..], &[&[0x01]]);
    let t2 = hmac(&t0[..], &[&t1[..], &[0x02]]);
    (t1, t2)
}

/// HKDF expand to three keys.
pub(crate) fn kdf3(
    chain_key: &[u8; KEY_SIZE],
    input: &[u8],
) -> (
    Zeroizing<[u8; KEY_SIZE]>,
    Zeroizing<[u8; KEY_SIZE]>,
    Zeroizing<[u8; KEY_SIZE]>,
) {
    let t0 = hmac(chain_key, &[input]);
    let t1 = hmac(&t0[..], &[&[0x01]]);
    let t2 = hmac(&t0[..], &[&t1[..], &[0x02]]);
    let t3 = hmac(&t0[..], &[&t2[..], &[0x03]]);
    (t1, t2, t3)
}
