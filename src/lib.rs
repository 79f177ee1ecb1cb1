//! Multicast group membership table for InfiniBand / RoCE host channel adapters.
//!
//! The adapter keeps, for every multicast group (MGID), the list of local queue pairs that
//! receive its traffic. [`mcast::MulticastGroupManager`] owns that table through a
//! [`mcast::HardwareAccessPort`] and mirrors its layout in a status cache.

/// The multicast group table: the device record format, the overflow allocator, the status cache
/// and the manager that ties them together.
pub mod mcast;
