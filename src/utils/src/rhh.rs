use std::hash::Hasher;

/// HashKey computes a hash of key. Hash is always non-zero.
pub fn hash_key(key: &[u8]) -> u64 {
    let mut xx_hash = twox_hash::XxHash64::with_seed(0);
    xx_hash.write(key);
    let mut h = xx_hash.finish();

    if h == 0 {
        h = 1;
    }

    h
}

/// HashUint64 computes a hash of an u64. Hash is always non-zero.
pub fn hash_u64(key: u64) -> u64 {
    let buf = key.to_be_bytes();
    hash_key(&buf)
}

/// Dist returns the probe distance for a hash in a slot index.
/// NOTE: Capacity must be a power of 2.
pub fn dist(hash: u64, i: u64, capacity: u64) -> u64 {
    let mask = capacity - 1;
    (i + capacity - (hash & mask)) & mask
}

/// pow2 returns the number that is the next highest power of 2.
/// Returns v if it is a power of 2. Capped at 2^62.
pub fn pow2(v: u64) -> u64 {
    let mut i = 2_u64;
    while i < 1 << 62 {
        if i >= v {
            return i;
        }
        i *= 2;
    }
    i
}
