//! A [`HardwareAccessPort`] backed by host memory.
//!
//! Every table slot is kept as an encoded mailbox, so records go through the same encoding the
//! device uses. Clones share the same table, which lets a caller keep a handle for inspection or
//! fault injection after handing the port to a manager.
use std::io;
use std::sync::Arc;

use parking_lot::Mutex;

use super::address::Gid;
use super::hardware::{
    members_per_entry, GroupEntry, HardwareAccessPort, HardwareCommand, HardwareError, HardwareErrorKind,
    MailboxError,
};

type HashFn = dyn Fn(&Gid) -> u32 + Send + Sync;

/// Command counters of a [`MemoryPort`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PortStats {
    pub hashes: u64,
    pub reads: u64,
    pub writes: u64,
}

#[derive(Debug)]
struct Fault {
    command: HardwareCommand,
    /// Calls of `command` to let through before failing.
    skip: usize,
}

struct MemoryTable {
    entry_size: usize,
    slots: Vec<Vec<u8>>,
    faults: Vec<Fault>,
    stats: PortStats,
}

impl MemoryTable {
    fn check_fault(&mut self, command: HardwareCommand, index: Option<u32>) -> Result<(), HardwareError> {
        let Some(pos) = self.faults.iter().position(|fault| fault.command == command) else {
            return Ok(());
        };
        if self.faults[pos].skip > 0 {
            self.faults[pos].skip -= 1;
            return Ok(());
        }
        self.faults.remove(pos);
        Err(HardwareError::new(command, index, io::Error::from_raw_os_error(libc::EIO)))
    }

    fn slot(&self, command: HardwareCommand, index: u32) -> Result<usize, HardwareError> {
        let pos = index as usize;
        if pos >= self.slots.len() {
            return Err(HardwareError::new(command, Some(index), HardwareErrorKind::IndexOutOfRange));
        }
        Ok(pos)
    }
}

/// An in-memory multicast table with a device-style GID hash.
#[derive(Clone)]
pub struct MemoryPort {
    table: Arc<Mutex<MemoryTable>>,
    hash: Arc<HashFn>,
}

impl std::fmt::Debug for MemoryPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let table = self.table.lock();
        f.debug_struct("MemoryPort")
            .field("entries", &table.slots.len())
            .field("entry_size", &table.entry_size)
            .field("stats", &table.stats)
            .finish()
    }
}

/// Hash used by [`MemoryPort`] unless another one is supplied: the GID words folded with a rotate
/// and xor, then mixed so that neighbouring MGIDs spread across bins.
pub fn default_gid_hash(gid: &Gid) -> u32 {
    let folded = gid.words().iter().fold(0u32, |hash, &word| hash.rotate_left(5) ^ word);
    folded.wrapping_mul(0x9e37_79b9) >> 8
}

impl MemoryPort {
    /// Create a zero-filled table of `total_entries` mailboxes, each `entry_size` bytes long.
    pub fn new(total_entries: u32, entry_size: usize) -> Result<Self, MailboxError> {
        members_per_entry(entry_size).ok_or(MailboxError::UnsupportedSize(entry_size))?;

        Ok(MemoryPort {
            table: Arc::new(Mutex::new(MemoryTable {
                entry_size,
                slots: vec![vec![0u8; entry_size]; total_entries as usize],
                faults: Vec::new(),
                stats: PortStats::default(),
            })),
            hash: Arc::new(default_gid_hash),
        })
    }

    /// Replace the GID hash, e.g. to force collisions.
    pub fn with_hash<F>(mut self, hash: F) -> Self
    where
        F: Fn(&Gid) -> u32 + Send + Sync + 'static,
    {
        self.hash = Arc::new(hash);
        self
    }

    pub fn total_entries(&self) -> u32 {
        self.table.lock().slots.len() as u32
    }

    pub fn entry_size(&self) -> usize {
        self.table.lock().entry_size
    }

    /// Decode the record at `index` without counting it as a device read.
    pub fn peek(&self, index: u32) -> Option<GroupEntry> {
        let table = self.table.lock();
        let raw = table.slots.get(index as usize)?;
        GroupEntry::decode(raw).ok()
    }

    /// Raw mailbox bytes stored at `index`.
    pub fn raw_slot(&self, index: u32) -> Option<Vec<u8>> {
        self.table.lock().slots.get(index as usize).cloned()
    }

    /// Overwrite the record at `index` behind the manager's back.
    pub fn poke(&self, index: u32, entry: &GroupEntry) -> Result<(), HardwareError> {
        let mut table = self.table.lock();
        let pos = table.slot(HardwareCommand::Write, index)?;
        let raw = entry
            .encode(table.entry_size)
            .map_err(|err| HardwareError::new(HardwareCommand::Write, Some(index), err))?;
        table.slots[pos] = raw;
        Ok(())
    }

    /// Make a future `command` fail with `EIO` after letting `skip` calls of it succeed.
    pub fn inject_fault(&self, command: HardwareCommand, skip: usize) {
        self.table.lock().faults.push(Fault { command, skip });
    }

    pub fn clear_faults(&self) {
        self.table.lock().faults.clear();
    }

    pub fn stats(&self) -> PortStats {
        self.table.lock().stats
    }
}

impl HardwareAccessPort for MemoryPort {
    fn hash(&mut self, gid: &Gid) -> Result<u32, HardwareError> {
        let mut table = self.table.lock();
        table.stats.hashes += 1;
        table.check_fault(HardwareCommand::Hash, None)?;
        Ok((self.hash)(gid))
    }

    fn read(&mut self, index: u32) -> Result<GroupEntry, HardwareError> {
        let mut table = self.table.lock();
        table.stats.reads += 1;
        table.check_fault(HardwareCommand::Read, Some(index))?;
        let pos = table.slot(HardwareCommand::Read, index)?;
        GroupEntry::decode(&table.slots[pos]).map_err(|err| HardwareError::new(HardwareCommand::Read, Some(index), err))
    }

    fn write(&mut self, index: u32, entry: &GroupEntry) -> Result<(), HardwareError> {
        let mut table = self.table.lock();
        table.stats.writes += 1;
        table.check_fault(HardwareCommand::Write, Some(index))?;
        let pos = table.slot(HardwareCommand::Write, index)?;
        let raw = entry
            .encode(table.entry_size)
            .map_err(|err| HardwareError::new(HardwareCommand::Write, Some(index), err))?;
        table.slots[pos] = raw;
        Ok(())
    }
}
