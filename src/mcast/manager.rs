//! The multicast group manager keeps the device multicast table and its status cache in step.
//!
//! The table has `hash_bins` directly hashed records followed by an overflow region. A group
//! lives in the bin its MGID hashes to, or, when that bin is taken, in an overflow record linked
//! from the end of the bin's chain. Records only link forward; the status cache remembers each
//! record's predecessor so that a record can be unlinked without scanning its chain.
use std::collections::TryReserveError;

use parking_lot::Mutex;
use tabled::{
    settings::{object::Segment, Alignment, Modify, Style},
    Table,
};

use super::address::Gid;
use super::allocator::FreeListAllocator;
use super::audit::{verify_table, VerifyError};
use super::config::MulticastTableConfig;
use super::hardware::{GroupEntry, HardwareAccessPort, HardwareError, MAX_QPN};
use super::status_cache::{StatusCache, StatusCacheEntry, StatusRow};

/// Error returned by [`MulticastGroupManager::create`] and the builder for a new table.
#[derive(Debug, thiserror::Error)]
#[error("failed to create multicast table")]
#[non_exhaustive]
pub struct CreateMulticastTableError(#[from] pub CreateMulticastTableErrorKind);

/// The enum type for [`CreateMulticastTableError`].
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
#[non_exhaustive]
pub enum CreateMulticastTableErrorKind {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("unsupported mailbox size {0}")]
    UnsupportedEntrySize(usize),
    #[error("not enough memory to track the overflow region")]
    ResourceExhausted(#[from] TryReserveError),
}

/// Error returned by [`MulticastGroupManager::attach`] for adding a QP to a multicast group.
#[derive(Debug, thiserror::Error)]
#[error("failed to attach QP {qpn:#x} to multicast group {gid}")]
#[non_exhaustive]
pub struct AttachMulticastError {
    pub qpn: u32,
    pub gid: Gid,
    pub source: AttachMulticastErrorKind,
}

/// The enum type for [`AttachMulticastError`].
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
#[non_exhaustive]
pub enum AttachMulticastErrorKind {
    Hardware(#[from] HardwareError),
    #[error("QP number does not fit in 24 bits")]
    InvalidQpn,
    #[error("the all-zero GID marks an empty entry and cannot name a group")]
    InvalidGid,
    #[error("no free entry left in the overflow region")]
    ResourceExhausted,
    #[error("group already has the maximum of {max} members")]
    GroupFull { max: usize },
    #[error("status cache expects {cached} members at index {index} but the device holds {device}")]
    ConsistencyViolation { index: u32, cached: usize, device: usize },
    #[error("chain of hash bin {bin} does not terminate inside the overflow region")]
    CorruptChain { bin: u32 },
}

/// Error returned by [`MulticastGroupManager::detach`] for removing a QP from a multicast group.
#[derive(Debug, thiserror::Error)]
#[error("failed to detach QP {qpn:#x} from multicast group {gid}")]
#[non_exhaustive]
pub struct DetachMulticastError {
    pub qpn: u32,
    pub gid: Gid,
    pub source: DetachMulticastErrorKind,
}

/// The enum type for [`DetachMulticastError`].
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
#[non_exhaustive]
pub enum DetachMulticastErrorKind {
    Hardware(#[from] HardwareError),
    #[error("QP number does not fit in 24 bits")]
    InvalidQpn,
    #[error("multicast group is not attached")]
    UnknownGroup,
    #[error("QP is not a member of the group")]
    UnknownMember,
}

/// Everything guarded by the manager's lock.
pub(crate) struct TableState<P> {
    pub(crate) port: P,
    pub(crate) allocator: FreeListAllocator,
    pub(crate) cache: StatusCache,
}

/// Owner of one adapter's multicast table.
///
/// All operations serialize on a single lock that is held across every device command they issue,
/// so a slow command stalls every other caller until it completes.
pub struct MulticastGroupManager<P> {
    config: MulticastTableConfig,
    state: Mutex<TableState<P>>,
}

impl<P: HardwareAccessPort> std::fmt::Debug for MulticastGroupManager<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MulticastGroupManager")
            .field("config", &self.config)
            .field("groups", &self.group_count())
            .finish()
    }
}

/// Builder for a [`MulticastGroupManager`].
#[derive(Debug, Clone)]
pub struct MulticastGroupManagerBuilder {
    config: MulticastTableConfig,
}

impl Default for MulticastGroupManagerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MulticastGroupManagerBuilder {
    pub fn new() -> Self {
        // 8192 hash bins followed by 8192 overflow entries, with as many members as a default mailbox holds
        MulticastGroupManagerBuilder {
            config: MulticastTableConfig::new(16384, 8192, 8),
        }
    }

    pub fn setup_total_entries(&mut self, total_entries: u32) -> &mut Self {
        self.config.total_entries = total_entries;
        self
    }

    pub fn setup_hash_bins(&mut self, hash_bins: u32) -> &mut Self {
        self.config.hash_bins = hash_bins;
        self
    }

    pub fn setup_max_members_per_group(&mut self, max_members_per_group: usize) -> &mut Self {
        self.config.max_members_per_group = max_members_per_group;
        self
    }

    pub fn setup_entry_size(&mut self, entry_size: usize) -> &mut Self {
        self.config.entry_size = entry_size;
        self
    }

    pub fn build<P: HardwareAccessPort>(&self, port: P) -> Result<MulticastGroupManager<P>, CreateMulticastTableError> {
        MulticastGroupManager::from_config(self.config, port)
    }
}

impl<P: HardwareAccessPort> MulticastGroupManager<P> {
    /// Create a manager for a table of `total_entries` records whose first `hash_bins` records are
    /// hash bins. The device table behind `port` must be empty.
    pub fn create(
        port: P, total_entries: u32, hash_bins: u32, max_members_per_group: usize,
    ) -> Result<Self, CreateMulticastTableError> {
        Self::from_config(
            MulticastTableConfig::new(total_entries, hash_bins, max_members_per_group),
            port,
        )
    }

    pub fn from_config(config: MulticastTableConfig, port: P) -> Result<Self, CreateMulticastTableError> {
        config.validate()?;
        let allocator = FreeListAllocator::new(config.overflow_entries()).map_err(CreateMulticastTableErrorKind::from)?;

        tracing::debug!(
            "multicast table with {} entries, {} hash bins, {} members per group",
            config.total_entries,
            config.hash_bins,
            config.max_members_per_group
        );

        Ok(MulticastGroupManager {
            config,
            state: Mutex::new(TableState {
                port,
                allocator,
                cache: StatusCache::new(),
            }),
        })
    }

    /// Tear the manager down and hand the port back.
    pub fn destroy(self) -> P {
        let state = self.state.into_inner();
        if !state.cache.is_empty() {
            tracing::warn!(
                "destroying multicast table with {} groups still attached",
                state.cache.len()
            );
        }
        state.port
    }

    pub fn config(&self) -> &MulticastTableConfig {
        &self.config
    }

    /// Add `qpn` to the group `gid`, creating the group on its first member.
    ///
    /// Attaching a QP that already is a member succeeds without writing to the device.
    pub fn attach(&self, qpn: u32, gid: &Gid) -> Result<(), AttachMulticastError> {
        let mut state = self.state.lock();
        let result = state.attach(&self.config, qpn, gid);
        #[cfg(feature = "debug")]
        self.debug_verify(&mut state);
        result.map_err(|source| AttachMulticastError { qpn, gid: *gid, source })
    }

    /// Remove `qpn` from the group `gid`, vacating the group's record with its last member.
    pub fn detach(&self, qpn: u32, gid: &Gid) -> Result<(), DetachMulticastError> {
        let mut state = self.state.lock();
        let result = state.detach(&self.config, qpn, gid);
        #[cfg(feature = "debug")]
        self.debug_verify(&mut state);
        result.map_err(|source| DetachMulticastError { qpn, gid: *gid, source })
    }

    /// Number of groups with at least one member.
    pub fn group_count(&self) -> usize {
        self.state.lock().cache.len()
    }

    /// Where `gid` lives in the table, without asking the device.
    pub fn group(&self, gid: &Gid) -> Option<StatusCacheEntry> {
        self.state.lock().cache.find(gid).copied()
    }

    /// Current members of `gid` as stored on the device, or `None` if the group does not exist.
    pub fn members(&self, gid: &Gid) -> Result<Option<Vec<u32>>, HardwareError> {
        let mut state = self.state.lock();
        let Some(entry) = state.cache.find(gid).copied() else {
            return Ok(None);
        };
        Ok(Some(state.port.read(entry.absolute_index)?.members))
    }

    /// Whether `qpn` is a member of `gid`. Unknown groups are answered from the cache alone.
    pub fn is_attached(&self, qpn: u32, gid: &Gid) -> Result<bool, HardwareError> {
        Ok(self.members(gid)?.is_some_and(|members| members.contains(&qpn)))
    }

    /// Walk the whole device table and check it against the status cache and the allocator.
    pub fn verify(&self) -> Result<(), VerifyError> {
        let mut state = self.state.lock();
        verify_table(&self.config, &mut state)
    }

    /// The status cache rendered as a text table, ordered by table index.
    pub fn status_table(&self) -> String {
        let state = self.state.lock();
        let mut entries: Vec<_> = state.cache.iter().collect();
        entries.sort_by_key(|entry| entry.absolute_index);

        Table::new(entries.into_iter().map(StatusRow::from))
            .with(Style::sharp())
            .with(Modify::new(Segment::all()).with(Alignment::center()))
            .to_string()
    }

    #[cfg(feature = "debug")]
    fn debug_verify(&self, state: &mut TableState<P>) {
        if let Err(err) = verify_table(&self.config, state) {
            tracing::error!("multicast table failed verification: {err}");
        }
    }
}

impl<P: HardwareAccessPort> TableState<P> {
    fn attach(&mut self, config: &MulticastTableConfig, qpn: u32, gid: &Gid) -> Result<(), AttachMulticastErrorKind> {
        if qpn > MAX_QPN {
            return Err(AttachMulticastErrorKind::InvalidQpn);
        }
        if gid.is_zero() {
            return Err(AttachMulticastErrorKind::InvalidGid);
        }

        let (index, prev, mut record, link) = match self.cache.find(gid).copied() {
            Some(entry) => {
                let record = self.port.read(entry.absolute_index)?;
                if record.valid_count() != entry.cached_valid_count {
                    tracing::warn!(
                        "multicast group {gid} at index {} has {} members, expected {}",
                        entry.absolute_index,
                        record.valid_count(),
                        entry.cached_valid_count
                    );
                    return Err(AttachMulticastErrorKind::ConsistencyViolation {
                        index: entry.absolute_index,
                        cached: entry.cached_valid_count,
                        device: record.valid_count(),
                    });
                }
                if record.contains(qpn) {
                    tracing::debug!("QP {qpn:#x} already attached to multicast group {gid}");
                    return Ok(());
                }
                if entry.cached_valid_count >= config.max_members_per_group {
                    return Err(AttachMulticastErrorKind::GroupFull {
                        max: config.max_members_per_group,
                    });
                }
                (entry.absolute_index, entry.prev_absolute_index, record, None)
            },
            None => {
                let bin = self.port.hash(gid)? % config.hash_bins;
                let head = self.port.read(bin)?;
                if head.is_empty() {
                    (bin, None, GroupEntry::new(*gid), None)
                } else {
                    let (tail_index, tail) = self.find_tail(config, bin, head)?;
                    let slot = self
                        .allocator
                        .allocate()
                        .ok_or(AttachMulticastErrorKind::ResourceExhausted)?;
                    let index = config.hash_bins + slot;
                    (index, Some(tail_index), GroupEntry::new(*gid), Some(tail))
                }
            },
        };

        record.members.push(qpn);
        if let Err(err) = self.port.write(index, &record) {
            if link.is_some() {
                self.allocator.free(index - config.hash_bins);
            }
            return Err(err.into());
        }

        // a new overflow record is written before it becomes reachable from its bin
        if let (Some(mut tail), Some(tail_index)) = (link, prev) {
            tail.next_index = Some(index);
            if let Err(err) = self.port.write(tail_index, &tail) {
                self.allocator.free(index - config.hash_bins);
                return Err(err.into());
            }
            tracing::debug!("multicast group {gid} chained at index {index} after index {tail_index}");
        }

        self.cache.upsert(StatusCacheEntry {
            gid: *gid,
            absolute_index: index,
            prev_absolute_index: prev,
            cached_valid_count: record.valid_count(),
        });
        Ok(())
    }

    /// Follow the chain starting at `bin` to its last record.
    fn find_tail(
        &mut self, config: &MulticastTableConfig, bin: u32, head: GroupEntry,
    ) -> Result<(u32, GroupEntry), AttachMulticastErrorKind> {
        let mut index = bin;
        let mut record = head;
        // a chain can never hold more records than the overflow region plus its head
        for _ in 0..=config.overflow_entries() {
            match record.next_index {
                None => return Ok((index, record)),
                Some(next) if next >= config.hash_bins && next < config.total_entries => {
                    index = next;
                    record = self.port.read(next)?;
                },
                Some(_) => break,
            }
        }
        Err(AttachMulticastErrorKind::CorruptChain { bin })
    }

    fn detach(&mut self, config: &MulticastTableConfig, qpn: u32, gid: &Gid) -> Result<(), DetachMulticastErrorKind> {
        if qpn > MAX_QPN {
            return Err(DetachMulticastErrorKind::InvalidQpn);
        }
        let entry = *self.cache.find(gid).ok_or(DetachMulticastErrorKind::UnknownGroup)?;
        let mut record = self.port.read(entry.absolute_index)?;
        if !record.swap_remove_member(qpn) {
            return Err(DetachMulticastErrorKind::UnknownMember);
        }

        if !record.members.is_empty() {
            self.port.write(entry.absolute_index, &record)?;
            self.cache.upsert(StatusCacheEntry {
                cached_valid_count: record.valid_count(),
                ..entry
            });
            return Ok(());
        }

        // Last member gone. Every path below reads what it needs first and then issues a single
        // write, so a failed command leaves both the device and the cache untouched.
        match entry.prev_absolute_index {
            None => {
                debug_assert!(entry.absolute_index < config.hash_bins);
                self.vacate_head(config, entry.absolute_index, record.next_index)?;
            },
            Some(prev_index) => {
                debug_assert!(entry.absolute_index >= config.hash_bins);
                let mut prev = self.port.read(prev_index)?;
                let successor = match record.next_index {
                    Some(next) => Some(self.port.read(next)?.gid),
                    None => None,
                };

                prev.next_index = record.next_index;
                self.port.write(prev_index, &prev)?;

                if let Some(successor_gid) = successor {
                    self.relink(&successor_gid, prev_index);
                }
                self.allocator.free(entry.absolute_index - config.hash_bins);
                tracing::debug!("freed multicast overflow index {}", entry.absolute_index);
            },
        }

        self.cache.remove(gid);
        Ok(())
    }

    /// Empty the hash bin `bin`, moving the next record of its chain into it if there is one.
    fn vacate_head(&mut self, config: &MulticastTableConfig, bin: u32, next: Option<u32>) -> Result<(), HardwareError> {
        let Some(next) = next else {
            return self.port.write(bin, &GroupEntry::empty());
        };

        let promoted = self.port.read(next)?;
        let after = match promoted.next_index {
            Some(after) => Some(self.port.read(after)?.gid),
            None => None,
        };

        self.port.write(bin, &promoted)?;
        self.allocator.free(next - config.hash_bins);
        tracing::debug!(
            "multicast group {} promoted from index {next} to hash bin {bin}",
            promoted.gid
        );

        self.cache.upsert(StatusCacheEntry {
            gid: promoted.gid,
            absolute_index: bin,
            prev_absolute_index: None,
            cached_valid_count: promoted.valid_count(),
        });
        if let Some(after_gid) = after {
            self.relink(&after_gid, bin);
        }
        Ok(())
    }

    /// Point the cached predecessor of `gid` at `prev`.
    fn relink(&mut self, gid: &Gid, prev: u32) {
        match self.cache.find(gid).copied() {
            Some(entry) => self.cache.upsert(StatusCacheEntry {
                prev_absolute_index: Some(prev),
                ..entry
            }),
            None => tracing::warn!("chained multicast record {gid} is missing from the status cache"),
        }
    }
}
