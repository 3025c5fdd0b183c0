//! Hash functions used by the hash-based balancers, resolved by name the
//! way the selector plugins request them.

use std::io::Cursor;

use mesh_registry_core::{Criteria, RegistryError, Result, ReturnCode};

pub type HashFn = fn(&[u8]) -> u64;

/// murmur3 x64-128, low 64 bits, seed 0. The default ring/maglev hash.
pub fn murmur3_64(data: &[u8]) -> u64 {
    murmur3::murmur3_x64_128(&mut Cursor::new(data), 0)
        .map(|value| value as u64)
        .unwrap_or(0)
}

/// murmur3 x86-32, seed 0; the legacy-compatible hash.
pub fn murmur3_32(data: &[u8]) -> u32 {
    murmur3::murmur3_32(&mut Cursor::new(data), 0).unwrap_or(0)
}

/// FNV-1a 64, for embedders that want a dependency-free spread.
pub fn fnv1a_64(data: &[u8]) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    for byte in data {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// Resolves a hash function by its configured name.
pub fn by_name(name: &str) -> Result<HashFn> {
    match name {
        "murmur3" => Ok(murmur3_64),
        "fnv1a" => Ok(fnv1a_64),
        other => Err(RegistryError::with_detail(
            ReturnCode::InvalidConfig,
            format!("unknown hash function {other}"),
        )),
    }
}

/// The effective 64-bit key of a selection request: an explicit string is
/// hashed, otherwise the numeric key is used as-is.
pub fn criteria_key(criteria: &Criteria, hash: HashFn) -> u64 {
    match &criteria.hash_string {
        Some(text) if !text.is_empty() => hash(text.as_bytes()),
        _ => criteria.hash_key,
    }
}
