//! PicHash: exact-duplicate content hash of a function's normalized code.

use sha2::{Digest, Sha256};

/// First eight bytes (big-endian) of the SHA-256 of the normalized code.
pub fn compute_pichash(code: &[u8]) -> u64 {
    let digest = Sha256::digest(code);
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}

/// SQLite integers are signed; pichashes are stored bit-for-bit.
pub(crate) fn to_sql(pichash: u64) -> i64 {
    pichash as i64
}

pub(crate) fn from_sql(value: i64) -> u64 {
    value as u64
}
