//! Software mirror of where every multicast group lives in the device table.
//!
//! The device only stores forward links, so the cache is the one place that knows a record's
//! predecessor. It is also the source of truth for the member count of a group, which lets the
//! manager notice a device record that drifted from what was last written.
use std::collections::hash_map::{self, HashMap};

use serde::{Deserialize, Serialize};
use tabled::Tabled;

use super::address::Gid;

/// Cached location and member count of one multicast group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCacheEntry {
    pub gid: Gid,
    /// Absolute table index of the group's record.
    pub absolute_index: u32,
    /// Absolute index of the record linking to this one, `None` when the record is a hash bin head.
    pub prev_absolute_index: Option<u32>,
    pub cached_valid_count: usize,
}

impl StatusCacheEntry {
    pub fn is_chain_head(&self) -> bool {
        self.prev_absolute_index.is_none()
    }
}

#[derive(Debug, Default)]
pub struct StatusCache {
    entries: HashMap<Gid, StatusCacheEntry>,
}

impl StatusCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find(&self, gid: &Gid) -> Option<&StatusCacheEntry> {
        self.entries.get(gid)
    }

    /// Insert the entry or replace the one cached under the same GID.
    pub fn upsert(&mut self, entry: StatusCacheEntry) {
        self.entries.insert(entry.gid, entry);
    }

    pub fn remove(&mut self, gid: &Gid) -> Option<StatusCacheEntry> {
        self.entries.remove(gid)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> hash_map::Values<'_, Gid, StatusCacheEntry> {
        self.entries.values()
    }
}

/// One row of [`MulticastGroupManager::status_table`].
///
/// [`MulticastGroupManager::status_table`]: super::manager::MulticastGroupManager::status_table
#[derive(Tabled)]
pub(crate) struct StatusRow {
    #[tabled(rename = "MGID")]
    gid: Gid,
    #[tabled(rename = "index")]
    index: u32,
    #[tabled(rename = "prev")]
    prev: String,
    #[tabled(rename = "members")]
    members: usize,
}

impl From<&StatusCacheEntry> for StatusRow {
    fn from(entry: &StatusCacheEntry) -> Self {
        StatusRow {
            gid: entry.gid,
            index: entry.absolute_index,
            prev: entry
                .prev_absolute_index
                .map_or_else(|| "-".to_owned(), |prev| prev.to_string()),
            members: entry.cached_valid_count,
        }
    }
}
