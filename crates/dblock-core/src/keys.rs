//! Lock name to backend key mapping
//!
//! Backends only accept fixed-size lock keys, so arbitrary lock names are
//! hashed into the key space. The mapping is deterministic and stateless:
//! the same name yields the same key in every process, on every host.
//!
//! Two distinct names may hash to the same key; the two unrelated resources
//! then serialize against each other.

use sha1::{Digest, Sha1};

/// Map a lock name to a pair of PostgreSQL advisory lock keys
///
/// Postgres also accepts a single 64-bit key; the two-key form is used so the
/// keys fit 32-bit integer parameters. The first 8 bytes of the SHA-1 digest
/// are split into two big-endian words, each reinterpreted as a signed
/// two's-complement integer, which covers the whole `int4` range.
pub fn postgres_key(lock_name: &str) -> (i32, i32) {
    let digest = Sha1::digest(lock_name.as_bytes());

    let mut high = [0u8; 4];
    let mut low = [0u8; 4];
    high.copy_from_slice(&digest[0..4]);
    low.copy_from_slice(&digest[4..8]);

    (unpack_signed_32(high), unpack_signed_32(low))
}

/// Reinterpret 4 big-endian bytes as a signed 32-bit integer
///
/// Words of `0x80000000` and above come out negative.
pub fn unpack_signed_32(bytes: [u8; 4]) -> i32 {
    i32::from_be_bytes(bytes)
}

/// Map a lock name to a MySQL named-lock key
///
/// MySQL rejects lock names longer than 64 characters; the 40-character hex
/// SHA-1 digest always fits.
pub fn mysql_key(lock_name: &str) -> String {
    hex::encode(Sha1::digest(lock_name.as_bytes()))
}
