//! Communicators: an active member's view of one communication context.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;

use crate::error::{MeshError, Result};
use crate::protocol::{tags, ContextId, Handshake, Tag, PROTOCOL_VERSION};
use crate::transport::{Endpoint, Request};

/// A context plus this worker's rank within its ordered member list.
///
/// Ranks passed to the point-to-point methods are communicator ranks;
/// they are translated to world ranks through `members`.
#[derive(Clone, Debug)]
pub struct Communicator {
    endpoint: Endpoint,
    context: ContextId,
    members: Arc<[usize]>,
    rank: usize,
}

impl Communicator {
    /// The world communicator: every worker on the fabric, in world order.
    pub fn world(endpoint: Endpoint) -> Self {
        let members: Arc<[usize]> = (0..endpoint.world_size()).collect();
        let rank = endpoint.rank();
        Self {
            endpoint,
            context: ContextId::WORLD,
            members,
            rank,
        }
    }

    /// Create a communicator over `members` (world ranks, in rank order).
    ///
    /// Collective over `members` only: the first member leads, collects a
    /// join from every other member on the `parent` context, allocates a
    /// fresh context and hands it out. Workers not listed return `None`
    /// without communicating. `discriminator` separates creations that may
    /// be in flight at the same time on one parent.
    pub async fn create(
        endpoint: &Endpoint,
        parent: ContextId,
        members: &[usize],
        discriminator: Tag,
    ) -> Result<Option<Self>> {
        let mut seen = HashSet::with_capacity(members.len());
        for &m in members {
            if m >= endpoint.world_size() {
                return Err(MeshError::RankOutOfRange {
                    rank: m,
                    size: endpoint.world_size(),
                });
            }
            if !seen.insert(m) {
                return Err(MeshError::DuplicateRank { rank: m });
            }
        }

        let Some(rank) = members.iter().position(|&m| m == endpoint.rank()) else {
            return Ok(None);
        };
        let leader = members[0];
        let join_tag = tags::group_join(discriminator);
        let assign_tag = tags::group_assign(discriminator);

        let context = if rank == 0 {
            for &member in &members[1..] {
                let bytes = endpoint.recv(parent, member, join_tag).await?;
                match Handshake::from_bytes(&bytes)? {
                    Handshake::Join {
                        version,
                        members: theirs,
                    } if version == PROTOCOL_VERSION && theirs == members => {}
                    other => {
                        return Err(MeshError::Protocol(format!(
                            "unexpected join from rank {member} on {parent}: {other:?}"
                        )))
                    }
                }
            }
            let context = endpoint.allocate_context();
            let assign = Handshake::Assign { context }.to_bytes()?;
            for &member in &members[1..] {
                endpoint.isend(parent, member, assign_tag, assign.clone())?;
            }
            context
        } else {
            let join = Handshake::Join {
                version: PROTOCOL_VERSION,
                members: members.to_vec(),
            }
            .to_bytes()?;
            endpoint.isend(parent, leader, join_tag, join)?;
            let bytes = endpoint.recv(parent, leader, assign_tag).await?;
            match Handshake::from_bytes(&bytes)? {
                Handshake::Assign { context } => context,
                other => {
                    return Err(MeshError::Protocol(format!(
                        "unexpected reply from leader {leader} on {parent}: {other:?}"
                    )))
                }
            }
        };

        debug!(
            world_rank = endpoint.rank(),
            %parent,
            %context,
            rank,
            size = members.len(),
            "created communicator"
        );
        Ok(Some(Self {
            endpoint: endpoint.clone(),
            context,
            members: members.into(),
            rank,
        }))
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn size(&self) -> usize {
        self.members.len()
    }

    pub fn context(&self) -> ContextId {
        self.context
    }

    /// World ranks of the members, indexed by communicator rank.
    pub fn members(&self) -> &[usize] {
        &self.members
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn world_rank(&self, rank: usize) -> Result<usize> {
        self.members
            .get(rank)
            .copied()
            .ok_or(MeshError::RankOutOfRange {
                rank,
                size: self.size(),
            })
    }

    /// Post a send to communicator rank `dest`.
    pub fn isend(&self, dest: usize, tag: Tag, payload: Vec<u8>) -> Result<Request> {
        let dest = self.world_rank(dest)?;
        self.endpoint.isend(self.context, dest, tag, payload)
    }

    /// Post a receive from communicator rank `source`.
    pub fn irecv(&self, source: usize, tag: Tag) -> Result<Request> {
        let source = self.world_rank(source)?;
        self.endpoint.irecv(self.context, source, tag)
    }

    /// Receive from communicator rank `source`, waiting for the payload.
    pub async fn recv(&self, source: usize, tag: Tag) -> Result<Vec<u8>> {
        let source = self.world_rank(source)?;
        self.endpoint.recv(self.context, source, tag).await
    }
}
