//! Stable 64-bit digest of symbolic paths.
//!
//! The same algorithm runs on both ends of a sync: the indexer fills
//! `file_info_by_hash` with it and the synchronizer keys operation-state
//! entries by it, so state files survive across processes and machines.
//! Pinned to XXH64 with seed 0 over the UTF-8 bytes of the path string.

use std::hash::Hasher;

use twox_hash::XxHash64;

/// Hash a symbolic file path to its stable 64-bit identity.
pub fn path_hash(symbolic_path: &str) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(symbolic_path.as_bytes());
    hasher.finish()
}
