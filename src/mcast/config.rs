//! Geometry of a multicast table.
use serde::{Deserialize, Serialize};

use super::hardware::{members_per_entry, DEFAULT_ENTRY_SIZE};
use super::manager::{CreateMulticastTableError, CreateMulticastTableErrorKind};

fn default_entry_size() -> usize {
    DEFAULT_ENTRY_SIZE
}

/// Size and shape of a multicast table: how many records it holds, how many of them are directly
/// hashed bins, and how many QPs may join one group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MulticastTableConfig {
    pub total_entries: u32,
    pub hash_bins: u32,
    pub max_members_per_group: usize,
    /// Mailbox size in bytes; bounds `max_members_per_group`.
    #[serde(default = "default_entry_size")]
    pub entry_size: usize,
}

impl MulticastTableConfig {
    pub fn new(total_entries: u32, hash_bins: u32, max_members_per_group: usize) -> Self {
        MulticastTableConfig {
            total_entries,
            hash_bins,
            max_members_per_group,
            entry_size: DEFAULT_ENTRY_SIZE,
        }
    }

    /// Geometry as reported by the adapter: `num_mgms` hash bins followed by `num_amgms` overflow
    /// records of `entry_size` bytes, each group as large as a mailbox allows.
    pub fn from_device_limits(
        num_mgms: u32, num_amgms: u32, entry_size: usize,
    ) -> Result<Self, CreateMulticastTableError> {
        let max_members_per_group = members_per_entry(entry_size)
            .ok_or(CreateMulticastTableErrorKind::UnsupportedEntrySize(entry_size))?;
        let total_entries = num_mgms
            .checked_add(num_amgms)
            .ok_or(CreateMulticastTableErrorKind::InvalidArgument("table size overflows"))?;

        let config = MulticastTableConfig {
            total_entries,
            hash_bins: num_mgms,
            max_members_per_group,
            entry_size,
        };
        config.validate()?;
        Ok(config)
    }

    /// Number of records in the overflow region.
    pub fn overflow_entries(&self) -> u32 {
        self.total_entries - self.hash_bins
    }

    pub fn validate(&self) -> Result<(), CreateMulticastTableError> {
        if self.total_entries == 0 || self.hash_bins == 0 {
            return Err(CreateMulticastTableErrorKind::InvalidArgument("table must have at least one hash bin").into());
        }
        if self.hash_bins > self.total_entries {
            return Err(CreateMulticastTableErrorKind::InvalidArgument("more hash bins than table entries").into());
        }
        if self.max_members_per_group == 0 {
            return Err(CreateMulticastTableErrorKind::InvalidArgument("groups must admit at least one member").into());
        }
        let slots = members_per_entry(self.entry_size)
            .ok_or(CreateMulticastTableErrorKind::UnsupportedEntrySize(self.entry_size))?;
        if self.max_members_per_group > slots {
            return Err(
                CreateMulticastTableErrorKind::InvalidArgument("more members per group than mailbox slots").into(),
            );
        }
        Ok(())
    }
}
