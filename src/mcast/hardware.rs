//! The boundary between the table manager and the adapter: the [`HardwareAccessPort`] trait, the
//! [`GroupEntry`] record it carries, and the mailbox layout records travel in.
use std::io;

use serde::{Deserialize, Serialize};

use super::address::Gid;

/// Default size in bytes of one multicast group mailbox.
pub const DEFAULT_ENTRY_SIZE: usize = 64;

/// Bytes in front of the member slots: next index word, reserved words and the GID.
const ENTRY_HEADER_SIZE: usize = 32;
const NEXT_INDEX_SHIFT: u32 = 6;
const MEMBER_VALID: u32 = 1 << 31;
const QPN_MASK: u32 = 0x00ff_ffff;

/// Largest QP number a member slot can hold.
pub const MAX_QPN: u32 = QPN_MASK;

/// Number of member slots in a mailbox of `entry_size` bytes.
///
/// Returns `None` for sizes the device cannot use: smaller than 48 bytes or not a multiple of 16.
pub fn members_per_entry(entry_size: usize) -> Option<usize> {
    if entry_size % 16 != 0 || entry_size < ENTRY_HEADER_SIZE + 16 {
        return None;
    }
    Some(4 * (entry_size / 16 - 2))
}

/// Error returned by a [`HardwareAccessPort`] when a command to the device fails.
#[derive(Debug, thiserror::Error)]
#[error("hardware command {command} failed (index={index:?})")]
#[non_exhaustive]
pub struct HardwareError {
    pub command: HardwareCommand,
    pub index: Option<u32>,
    pub source: HardwareErrorKind,
}

impl HardwareError {
    pub fn new(command: HardwareCommand, index: Option<u32>, source: impl Into<HardwareErrorKind>) -> Self {
        HardwareError {
            command,
            index,
            source: source.into(),
        }
    }
}

/// The enum type for [`HardwareError`].
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
#[non_exhaustive]
pub enum HardwareErrorKind {
    Transport(#[from] io::Error),
    #[error("device returned command status {0:#04x}")]
    CommandStatus(u8),
    #[error("table index out of range")]
    IndexOutOfRange,
    Mailbox(#[from] MailboxError),
}

/// The device command a [`HardwareError`] originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardwareCommand {
    Hash,
    Read,
    Write,
}

impl std::fmt::Display for HardwareCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            HardwareCommand::Hash => "MGID_HASH",
            HardwareCommand::Read => "READ_MGM",
            HardwareCommand::Write => "WRITE_MGM",
        };
        f.write_str(name)
    }
}

/// Error produced while encoding or decoding a group mailbox.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum MailboxError {
    #[error("unsupported mailbox size {0}")]
    UnsupportedSize(usize),
    #[error("{members} members do not fit in a mailbox with {slots} slots")]
    TooManyMembers { members: usize, slots: usize },
    #[error("next index {0} cannot be encoded")]
    NextIndexOverflow(u32),
}

/// One record of the device-resident multicast table.
///
/// An empty slot has an all-zero GID, no members and no successor.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupEntry {
    pub gid: Gid,
    pub members: Vec<u32>,
    /// Absolute index of the next record in this bin's chain.
    pub next_index: Option<u32>,
}

impl GroupEntry {
    /// A fresh record for `gid` with no members and no successor.
    pub fn new(gid: Gid) -> Self {
        GroupEntry {
            gid,
            members: Vec::new(),
            next_index: None,
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Whether no group occupies this slot.
    pub fn is_empty(&self) -> bool {
        self.gid.is_zero()
    }

    pub fn valid_count(&self) -> usize {
        self.members.len()
    }

    pub fn contains(&self, qpn: u32) -> bool {
        self.members.contains(&qpn)
    }

    /// Remove `qpn` by moving the last member into its place. Returns whether it was present.
    pub fn swap_remove_member(&mut self, qpn: u32) -> bool {
        match self.members.iter().position(|&member| member == qpn) {
            Some(pos) => {
                self.members.swap_remove(pos);
                true
            },
            None => false,
        }
    }

    /// Encode the record into a big-endian mailbox of `entry_size` bytes.
    pub fn encode(&self, entry_size: usize) -> Result<Vec<u8>, MailboxError> {
        let slots = members_per_entry(entry_size).ok_or(MailboxError::UnsupportedSize(entry_size))?;
        if self.members.len() > slots {
            return Err(MailboxError::TooManyMembers {
                members: self.members.len(),
                slots,
            });
        }

        let next = match self.next_index {
            Some(index) => index
                .checked_shl(NEXT_INDEX_SHIFT)
                .filter(|shifted| shifted >> NEXT_INDEX_SHIFT == index)
                .ok_or(MailboxError::NextIndexOverflow(index))?,
            None => 0,
        };

        let mut buf = vec![0u8; entry_size];
        buf[0..4].copy_from_slice(&next.to_be_bytes());
        buf[16..32].copy_from_slice(&self.gid.raw);
        for (slot, &qpn) in buf[ENTRY_HEADER_SIZE..].chunks_exact_mut(4).zip(&self.members) {
            slot.copy_from_slice(&((qpn & QPN_MASK) | MEMBER_VALID).to_be_bytes());
        }
        Ok(buf)
    }

    /// Decode a mailbox. Members are read up to the first slot without the valid bit.
    pub fn decode(buf: &[u8]) -> Result<Self, MailboxError> {
        members_per_entry(buf.len()).ok_or(MailboxError::UnsupportedSize(buf.len()))?;

        let next = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) >> NEXT_INDEX_SHIFT;
        let mut gid = Gid::ZERO;
        gid.raw.copy_from_slice(&buf[16..32]);

        let members = buf[ENTRY_HEADER_SIZE..]
            .chunks_exact(4)
            .map(|slot| u32::from_be_bytes([slot[0], slot[1], slot[2], slot[3]]))
            .take_while(|word| word & MEMBER_VALID != 0)
            .map(|word| word & QPN_MASK)
            .collect();

        Ok(GroupEntry {
            gid,
            members,
            // index 0 is always a hash bin and never a successor
            next_index: (next != 0).then_some(next),
        })
    }
}

/// Synchronous command channel to the multicast table of one adapter.
///
/// Every call may block until the device completes the command. Implementations report transport
/// and firmware failures as [`HardwareError`]; they never retry on their own.
pub trait HardwareAccessPort {
    /// Device-defined hash of `gid`. The manager reduces the result modulo its number of hash bins.
    fn hash(&mut self, gid: &Gid) -> Result<u32, HardwareError>;

    /// Read the record stored at absolute table index `index`.
    fn read(&mut self, index: u32) -> Result<GroupEntry, HardwareError>;

    /// Replace the record stored at absolute table index `index`.
    fn write(&mut self, index: u32, entry: &GroupEntry) -> Result<(), HardwareError>;
}

impl<P: HardwareAccessPort + ?Sized> HardwareAccessPort for Box<P> {
    fn hash(&mut self, gid: &Gid) -> Result<u32, HardwareError> {
        (**self).hash(gid)
    }

    fn read(&mut self, index: u32) -> Result<GroupEntry, HardwareError> {
        (**self).read(index)
    }

    fn write(&mut self, index: u32, entry: &GroupEntry) -> Result<(), HardwareError> {
        (**self).write(index, entry)
    }
}
