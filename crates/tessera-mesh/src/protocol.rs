//! Wire-level identifiers: communication contexts, message tags and the
//! subgroup handshake.
//!
//! Every point-to-point message is matched on `(context, source, tag)`.
//! User tags (the exchange tags of [`ExchangeConfig`](crate::ExchangeConfig))
//! live below [`tags::RESERVED_BASE`]; group construction and metadata
//! collectives use the tags above it.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Handshake format version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Identifies one communication context (a communicator's private message
/// space). Contexts are allocated fabric-wide and never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContextId(pub u64);

impl ContextId {
    /// Context of the world communicator, the root of every group.
    pub const WORLD: ContextId = ContextId(0);
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

/// Message tag.
pub type Tag = u32;

pub mod tags {
    use super::Tag;

    /// First tag reserved for internal traffic.
    pub const RESERVED_BASE: Tag = 0x4000_0000;

    /// Bits of a group-creation tag available for the caller's discriminator.
    pub const DISCRIMINATOR_MASK: Tag = 0x0fff_ffff;

    const GROUP_JOIN: Tag = RESERVED_BASE;
    const GROUP_ASSIGN: Tag = 0x5000_0000;

    /// Metadata broadcast.
    pub const BROADCAST: Tag = 0x6000_0001;
    /// Metadata all-gather.
    pub const ALLGATHER: Tag = 0x6000_0002;

    /// Member-to-leader join message of a subgroup creation.
    pub fn group_join(discriminator: Tag) -> Tag {
        GROUP_JOIN | (discriminator & DISCRIMINATOR_MASK)
    }

    /// Leader-to-member context assignment of a subgroup creation.
    pub fn group_assign(discriminator: Tag) -> Tag {
        GROUP_ASSIGN | (discriminator & DISCRIMINATOR_MASK)
    }

    /// Whether a user-chosen tag collides with internal traffic.
    pub fn is_reserved(tag: Tag) -> bool {
        tag >= RESERVED_BASE
    }
}

/// Messages exchanged while creating a subgroup communicator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Handshake {
    /// A member announces itself to the leader.
    Join { version: u32, members: Vec<usize> },
    /// The leader hands out the new context.
    Assign { context: ContextId },
}

impl Handshake {
    /// Serialize to postcard bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_allocvec(self)
    }

    /// Deserialize from postcard bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(bytes)
    }
}
