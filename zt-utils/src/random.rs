// (c) 2020-2022 ZeroTier, Inc. -- currently propritery pending actual release and licensing. See LICENSE.md.

use std::cell::Cell;

use rand::RngCore;

thread_local! {
    static XORSHIFT_STATE: Cell<u64> = Cell::new(0);
}

/// Fast, non-cryptographic PRNG for load balancing and jitter decisions (port
/// selection trial order, socket fan-out, etc). Never use this for anything
/// that needs to be unpredictable to an adversary.
#[inline]
pub fn xorshift64_random() -> u64 {
    XORSHIFT_STATE.with(|s| {
        let mut x = s.get();
        if x == 0 {
            x = next_u64_secure() | 1;
        }
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        s.set(x);
        x
    })
}

/// Cryptographically secure u32, used for anything observable by a remote peer.
#[inline]
pub fn next_u32_secure() -> u32 {
    rand::rngs::OsRng.next_u32()
}

/// Cryptographically secure u64, used for anything observable by a remote peer.
#[inline]
pub fn next_u64_secure() -> u64 {
    rand::rngs::OsRng.next_u64()
}

/// Fill a buffer with cryptographically secure random bytes.
#[inline]
pub fn fill_secure(buf: &mut [u8]) {
    rand::rngs::OsRng.fill_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xorshift_is_deterministic_per_thread_and_nonzero() {
        let a = xorshift64_random();
        let b = xorshift64_random();
        assert_ne!(a, 0);
        assert_ne!(b, 0);
        assert_ne!(a, b);
    }
}
