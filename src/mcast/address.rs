use serde::{Deserialize, Serialize};
use std::{fmt, net::Ipv6Addr, str::FromStr};

/// A 128-bit Global Identifier. For multicast groups this is the MGID the subnet manager assigned
/// to the group; an all-zero GID marks an unused table slot.
#[derive(Default, Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Gid {
    pub raw: [u8; 16],
}

impl From<[u8; 16]> for Gid {
    fn from(raw: [u8; 16]) -> Self {
        Gid { raw }
    }
}

impl From<Gid> for Ipv6Addr {
    fn from(gid: Gid) -> Self {
        Ipv6Addr::from(gid.raw)
    }
}

impl From<Ipv6Addr> for Gid {
    fn from(addr: Ipv6Addr) -> Self {
        Gid { raw: addr.octets() }
    }
}

impl From<u128> for Gid {
    fn from(value: u128) -> Self {
        Gid {
            raw: value.to_be_bytes(),
        }
    }
}

impl fmt::Display for Gid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (i, &byte) in self.raw.iter().enumerate() {
            if i > 0 && i % 2 == 0 {
                write!(f, ":")?;
            }
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// Error returned by [`Gid::from_str`].
#[derive(Debug, thiserror::Error)]
#[error("invalid GID string {input:?}")]
#[non_exhaustive]
pub struct ParseGidError {
    pub input: String,
}

impl FromStr for Gid {
    type Err = ParseGidError;

    /// Accepts any IPv6 textual form, including the fully expanded form produced by [`Display`].
    ///
    /// [`Display`]: fmt::Display
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ipv6Addr::from_str(s).map(Gid::from).map_err(|_| ParseGidError {
            input: s.to_owned(),
        })
    }
}

impl Gid {
    /// The all-zero GID stored in empty table slots.
    pub const ZERO: Gid = Gid { raw: [0; 16] };

    pub fn is_zero(&self) -> bool {
        u128::from_be_bytes(self.raw) == 0
    }

    /// Multicast GIDs carry `0xff` in their first byte.
    pub fn is_multicast(&self) -> bool {
        self.raw[0] == 0xff
    }

    pub fn is_unicast_link_local(&self) -> bool {
        self.raw[0] == 0xfe && self.raw[1] & 0xc0 == 0x80
    }

    /// The four big-endian 32-bit words of the GID, in wire order.
    pub fn words(&self) -> [u32; 4] {
        let mut words = [0u32; 4];
        for (word, chunk) in words.iter_mut().zip(self.raw.chunks_exact(4)) {
            *word = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        words
    }
}
