//! Stable twin-id partitioning for ordered writes.
//!
//! The bulk writer serializes writes per partition; two twins that hash to
//! the same partition share an ordered sub-bulk. The hash must be stable
//! across processes and releases, so it is derived from SHA-256 of the id
//! string rather than the process-seeded `std` hasher.

use sha2::{Digest, Sha256};

use twindex_core::id::TwinId;

/// Returns the partition index for a twin id, in `0..partitions`.
///
/// # Panics
///
/// Panics if `partitions` is zero; the configuration layer rejects a zero
/// bulk size before any partitioning happens.
#[must_use]
pub fn partition_for(twin_id: &TwinId, partitions: usize) -> usize {
    assert!(partitions > 0, "partition count must be positive");
    let digest = Sha256::digest(twin_id.as_str().as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    let hash = u64::from_be_bytes(prefix);
    usize::try_from(hash % partitions as u64).unwrap_or(0)
}
