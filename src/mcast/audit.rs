//! Full consistency audit of a multicast table against its status cache.
use std::collections::HashSet;

use super::address::Gid;
use super::config::MulticastTableConfig;
use super::hardware::{HardwareAccessPort, HardwareError};
use super::manager::TableState;

/// A broken table invariant found by [`MulticastGroupManager::verify`].
///
/// [`MulticastGroupManager::verify`]: super::manager::MulticastGroupManager::verify
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum VerifyError {
    #[error(transparent)]
    Hardware(#[from] HardwareError),
    #[error("record {gid} at index {index} is not in the status cache")]
    Uncached { gid: Gid, index: u32 },
    #[error("group {gid} is cached at index {cached} but found at index {actual}")]
    WrongIndex { gid: Gid, cached: u32, actual: u32 },
    #[error("group {gid} is cached with predecessor {cached:?} but linked from {actual:?}")]
    WrongPredecessor {
        gid: Gid,
        cached: Option<u32>,
        actual: Option<u32>,
    },
    #[error("group {gid} is cached with {cached} members but the device holds {device}")]
    CountMismatch { gid: Gid, cached: usize, device: usize },
    #[error("record at index {index} holds {count} members")]
    BadMemberCount { index: u32, count: usize },
    #[error("record at index {index} links to {next}, outside the overflow region")]
    BadLink { index: u32, next: u32 },
    #[error("overflow index {index} is reachable more than once")]
    Cycle { index: u32 },
    #[error("overflow index {index} is in use but not allocated")]
    NotAllocated { index: u32 },
    #[error("{allocated} overflow slots are allocated but {reachable} are in use")]
    LeakedSlots { allocated: u32, reachable: u32 },
    #[error("{cached} groups are cached but {reachable} are on the device")]
    MissingGroups { cached: usize, reachable: usize },
}

/// Walk every chain from every hash bin and check it against the cache and the allocator.
pub(crate) fn verify_table<P: HardwareAccessPort>(
    config: &MulticastTableConfig, state: &mut TableState<P>,
) -> Result<(), VerifyError> {
    let mut seen = HashSet::new();
    let mut groups = 0usize;

    for bin in 0..config.hash_bins {
        let mut index = bin;
        let mut prev = None;
        let mut record = state.port.read(bin)?;

        if record.is_empty() {
            if record.valid_count() != 0 {
                return Err(VerifyError::BadMemberCount {
                    index,
                    count: record.valid_count(),
                });
            }
            if let Some(next) = record.next_index {
                return Err(VerifyError::BadLink { index, next });
            }
            continue;
        }

        loop {
            let count = record.valid_count();
            if count == 0 || count > config.max_members_per_group {
                return Err(VerifyError::BadMemberCount { index, count });
            }

            let gid = record.gid;
            let cached = state.cache.find(&gid).ok_or(VerifyError::Uncached { gid, index })?;
            if cached.absolute_index != index {
                return Err(VerifyError::WrongIndex {
                    gid,
                    cached: cached.absolute_index,
                    actual: index,
                });
            }
            if cached.prev_absolute_index != prev {
                return Err(VerifyError::WrongPredecessor {
                    gid,
                    cached: cached.prev_absolute_index,
                    actual: prev,
                });
            }
            if cached.cached_valid_count != count {
                return Err(VerifyError::CountMismatch {
                    gid,
                    cached: cached.cached_valid_count,
                    device: count,
                });
            }
            groups += 1;

            let Some(next) = record.next_index else {
                break;
            };
            if next < config.hash_bins || next >= config.total_entries {
                return Err(VerifyError::BadLink { index, next });
            }
            if !seen.insert(next) {
                return Err(VerifyError::Cycle { index: next });
            }
            if !state.allocator.is_allocated(next - config.hash_bins) {
                return Err(VerifyError::NotAllocated { index: next });
            }

            prev = Some(index);
            index = next;
            record = state.port.read(index)?;
        }
    }

    let allocated = state.allocator.capacity() - state.allocator.available();
    let reachable = seen.len() as u32;
    if allocated != reachable {
        return Err(VerifyError::LeakedSlots { allocated, reachable });
    }
    if groups != state.cache.len() {
        return Err(VerifyError::MissingGroups {
            cached: state.cache.len(),
            reachable: groups,
        });
    }

    Ok(())
}
