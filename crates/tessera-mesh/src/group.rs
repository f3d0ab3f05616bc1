//! Worker groups and their algebra.
//!
//! A [`WorkerGroup`] is an ordered set of workers sharing a root context.
//! Every worker holds its own view: members see an active group with a
//! communicator and a rank; non-members see an inactive group that knows
//! only the membership. A group may additionally carry a Cartesian
//! topology (grid shape plus this worker's coordinate).
//!
//! Group constructors are collective over the members of the *result*:
//! workers outside it return an inactive view without communicating.

use std::sync::Arc;

use tracing::debug;

use crate::collective;
use crate::communicator::Communicator;
use crate::error::{MeshError, Result};
use crate::grid;
use crate::protocol::{ContextId, Tag};
use crate::transport::Endpoint;

const SUBSET_TAG: Tag = 0x0fff_fff0;
const UNION_TAG: Tag = 0x0fff_fff1;
const TOPOLOGY_TAG: Tag = 0x0fff_fff2;

/// Grid shape and this worker's row-major coordinate in it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Topology {
    shape: Vec<usize>,
    coord: Vec<usize>,
}

impl Topology {
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn coord(&self) -> &[usize] {
        &self.coord
    }
}

/// One worker's view of a group of workers.
#[derive(Clone, Debug)]
pub struct WorkerGroup {
    endpoint: Endpoint,
    root: ContextId,
    members: Arc<[usize]>,
    comm: Option<Communicator>,
    topology: Option<Topology>,
}

impl WorkerGroup {
    /// Every worker on the fabric, rooted at the world context.
    pub fn world(endpoint: Endpoint) -> Self {
        let comm = Communicator::world(endpoint.clone());
        Self {
            members: comm.members().into(),
            endpoint,
            root: ContextId::WORLD,
            comm: Some(comm),
            topology: None,
        }
    }

    /// A group with no members under `root`.
    pub fn null(endpoint: Endpoint, root: ContextId) -> Self {
        Self {
            endpoint,
            root,
            members: Arc::from(Vec::new()),
            comm: None,
            topology: None,
        }
    }

    fn derived(&self, members: Arc<[usize]>, comm: Option<Communicator>) -> Self {
        Self {
            endpoint: self.endpoint.clone(),
            root: self.root,
            members,
            comm,
            topology: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.comm.is_some()
    }

    /// This worker's rank, if it is a member.
    pub fn rank(&self) -> Option<usize> {
        self.comm.as_ref().map(Communicator::rank)
    }

    /// Group size, as seen by a member.
    pub fn size(&self) -> Option<usize> {
        self.comm.as_ref().map(Communicator::size)
    }

    /// Root context shared by every group derived from the same ancestor.
    pub fn root(&self) -> ContextId {
        self.root
    }

    /// World ranks of the members, indexed by group rank.
    pub fn members(&self) -> &[usize] {
        &self.members
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn communicator(&self) -> Option<&Communicator> {
        self.comm.as_ref()
    }

    pub fn has_topology(&self) -> bool {
        self.topology.is_some()
    }

    pub fn topology(&self) -> Option<&Topology> {
        self.topology.as_ref()
    }

    /// Grid shape, on an active Cartesian member.
    pub fn shape(&self) -> Option<&[usize]> {
        self.topology.as_ref().map(Topology::shape)
    }

    /// Grid coordinate, on an active Cartesian member.
    pub fn coord(&self) -> Option<&[usize]> {
        self.topology.as_ref().map(Topology::coord)
    }

    pub fn dim(&self) -> Option<usize> {
        self.shape().map(<[usize]>::len)
    }

    fn require_topology(&self, op: &'static str) -> Result<&Topology> {
        if !self.is_active() {
            return Err(MeshError::InactiveGroup(op));
        }
        self.topology.as_ref().ok_or(MeshError::NoTopology(op))
    }

    /// This worker's coordinate, or an error on an inactive member.
    pub fn cartesian_coord(&self) -> Result<&[usize]> {
        self.require_topology("cartesian_coord").map(Topology::coord)
    }

    /// Grid coordinate of any rank of this group.
    pub fn coordinate_of(&self, rank: usize) -> Result<Vec<usize>> {
        let topology = self.require_topology("coordinate_of")?;
        let size = self.members.len();
        if rank >= size {
            return Err(MeshError::RankOutOfRange { rank, size });
        }
        Ok(grid::coordinate_for_linear_index(rank, &topology.shape))
    }

    /// Rank at a grid coordinate, or `None` off the grid.
    pub fn rank_of(&self, coord: &[usize]) -> Result<Option<usize>> {
        let topology = self.require_topology("rank_of")?;
        Ok(grid::linear_index(coord, &topology.shape))
    }

    /// Per axis, the ranks one step below and above this worker; `None`
    /// at a grid boundary.
    pub fn neighbor_ranks(&self) -> Result<Vec<(Option<usize>, Option<usize>)>> {
        let topology = self.require_topology("neighbor_ranks")?;
        let mut neighbors = Vec::with_capacity(topology.shape.len());
        for axis in 0..topology.shape.len() {
            let mut lower = topology.coord.clone();
            let mut upper = topology.coord.clone();
            upper[axis] += 1;
            let below = match lower[axis].checked_sub(1) {
                Some(c) => {
                    lower[axis] = c;
                    grid::linear_index(&lower, &topology.shape)
                }
                None => None,
            };
            neighbors.push((below, grid::linear_index(&upper, &topology.shape)));
        }
        Ok(neighbors)
    }

    /// Translate `rank` of this group into the numbering of `other`.
    pub fn translate_rank(&self, rank: usize, other: &WorkerGroup) -> Option<usize> {
        let world = *self.members.get(rank)?;
        other.members.iter().position(|&m| m == world)
    }

    fn check_ranks(&self, ranks: &[usize]) -> Result<()> {
        let size = self.members.len();
        for (i, &rank) in ranks.iter().enumerate() {
            if rank >= size {
                return Err(MeshError::RankOutOfRange { rank, size });
            }
            if ranks[..i].contains(&rank) {
                return Err(MeshError::DuplicateRank { rank });
            }
        }
        Ok(())
    }

    /// Subgroup of exactly `ranks`, in the given order.
    ///
    /// Collective over the listed ranks; `ranks[0]` becomes rank 0.
    pub async fn inclusive_subset(&self, ranks: &[usize]) -> Result<Self> {
        self.subgroup(ranks, SUBSET_TAG).await
    }

    /// [`inclusive_subset`](Self::inclusive_subset) with an explicit
    /// creation discriminator, for subgroups created concurrently.
    pub(crate) async fn subgroup(&self, ranks: &[usize], discriminator: Tag) -> Result<Self> {
        self.check_ranks(ranks)?;
        let world: Vec<usize> = ranks.iter().map(|&r| self.members[r]).collect();
        let comm = match &self.comm {
            Some(parent) => {
                Communicator::create(&self.endpoint, parent.context(), &world, discriminator).await?
            }
            // Non-members of the parent cannot be in the subset.
            None => None,
        };
        Ok(self.derived(world.into(), comm))
    }

    /// Set union: this group's members first, then the new members of
    /// `other`, each in their own order.
    ///
    /// Fails unless both groups descend from the same root.
    pub async fn union(&self, other: &WorkerGroup) -> Result<Self> {
        if self.root != other.root {
            return Err(MeshError::RootMismatch {
                left: self.root,
                right: other.root,
            });
        }
        let mut members = self.members.to_vec();
        for &m in other.members.iter() {
            if !members.contains(&m) {
                members.push(m);
            }
        }
        let comm = Communicator::create(&self.endpoint, self.root, &members, UNION_TAG).await?;
        if comm.is_some() {
            debug!(
                world_rank = self.endpoint.rank(),
                left = self.members.len(),
                right = other.members.len(),
                size = members.len(),
                "formed union group"
            );
        }
        Ok(self.derived(members.into(), comm))
    }

    /// Arrange the members on a row-major grid of the given shape.
    ///
    /// Inactive members get an inactive view without a coordinate.
    pub async fn attach_cartesian_topology(&self, shape: &[usize]) -> Result<Self> {
        let Some(parent) = &self.comm else {
            return Ok(self.derived(Arc::clone(&self.members), None));
        };
        if grid::volume(shape) != parent.size() {
            return Err(MeshError::TopologyMismatch {
                shape: shape.to_vec(),
                size: parent.size(),
            });
        }

        let comm = Communicator::create(&self.endpoint, parent.context(), &self.members, TOPOLOGY_TAG)
            .await?
            .ok_or_else(|| MeshError::Protocol("member missing from its own topology".into()))?;
        let coord = grid::coordinate_for_linear_index(comm.rank(), shape);
        debug!(rank = comm.rank(), ?shape, ?coord, "attached Cartesian topology");
        Ok(Self {
            topology: Some(Topology {
                shape: shape.to_vec(),
                coord,
            }),
            ..self.derived(Arc::clone(&self.members), Some(comm))
        })
    }

    /// Project onto the axes where `axis_mask` is true.
    ///
    /// Workers agreeing on every dropped axis form one subgroup, ordered
    /// row-major over the kept axes.
    pub async fn cartesian_subtopology(&self, axis_mask: &[bool]) -> Result<Self> {
        let Some(comm) = &self.comm else {
            return Ok(Self::null(self.endpoint.clone(), self.root));
        };
        let topology = self.require_topology("cartesian_subtopology")?;
        if axis_mask.len() != topology.shape.len() {
            return Err(MeshError::AxisMaskMismatch {
                mask: axis_mask.len(),
                dim: topology.shape.len(),
            });
        }

        let dropped = |coord: &[i64]| -> Vec<i64> {
            coord
                .iter()
                .zip(axis_mask)
                .filter(|&(_, &keep)| !keep)
                .map(|(&c, _)| c)
                .collect()
        };
        let mine: Vec<i64> = topology.coord.iter().map(|&c| c as i64).collect();
        let all = collective::allgather(comm, &mine).await?;
        let key = dropped(&mine);
        let class: Vec<usize> = all
            .iter()
            .enumerate()
            .filter(|(_, coord)| dropped(coord) == key)
            .map(|(rank, _)| rank)
            .collect();

        let leader = class.first().copied().unwrap_or_default();
        let sub = self.subgroup(&class, leader as Tag).await?;
        let keep = |v: &[usize]| -> Vec<usize> {
            v.iter()
                .zip(axis_mask)
                .filter(|&(_, &keep)| keep)
                .map(|(&x, _)| x)
                .collect()
        };
        let shape = keep(&topology.shape);
        let coord = keep(&topology.coord);
        debug_assert_eq!(sub.rank(), grid::linear_index(&coord, &shape));
        Ok(Self {
            topology: Some(Topology { shape, coord }),
            ..sub
        })
    }

    /// Broadcast a small integer vector to every active member.
    ///
    /// `root_rank` is in this group's numbering, or in `source_group`'s when
    /// one is given. Only the root's `value` is read. Inactive members get
    /// `None`.
    pub async fn broadcast_value(
        &self,
        value: Option<&[i64]>,
        root_rank: usize,
        source_group: Option<&WorkerGroup>,
    ) -> Result<Option<Vec<i64>>> {
        let Some(comm) = &self.comm else {
            return Ok(None);
        };
        let data_root = match source_group {
            None => root_rank,
            Some(source) => {
                let mine = [source.rank().map_or(-1, |r| r as i64)];
                let rank_map = collective::allgather(comm, &mine).await?;
                rank_map
                    .iter()
                    .position(|r| r[0] == root_rank as i64)
                    .ok_or(MeshError::RootNotInSource { root: root_rank })?
            }
        };
        collective::broadcast(comm, data_root, value).await.map(Some)
    }

    /// Gather one fixed-length vector from every active member, in rank
    /// order. Inactive members get `None`.
    pub async fn allgather_vector(&self, value: &[i64]) -> Result<Option<Vec<Vec<i64>>>> {
        match &self.comm {
            Some(comm) => collective::allgather(comm, value).await.map(Some),
            None => Ok(None),
        }
    }

    /// Learn `group`'s grid shape from its rank 0. Collective over this
    /// group; every member of `group` must be a member of this one.
    ///
    /// The reply leads with a topology flag, so a group without a grid
    /// fails with `NoTopology` on every member of this group at once.
    pub(crate) async fn shape_of(&self, group: &WorkerGroup) -> Result<Option<Vec<usize>>> {
        let announced: Option<Vec<i64>> = group.is_active().then(|| {
            let shape = group.shape().unwrap_or_default();
            std::iter::once(i64::from(group.has_topology()))
                .chain(shape.iter().map(|&x| x as i64))
                .collect()
        });
        let Some(reply) = self.broadcast_value(announced.as_deref(), 0, Some(group)).await? else {
            return Ok(None);
        };
        let (&has_topology, shape) = reply
            .split_first()
            .ok_or_else(|| MeshError::Protocol("empty shape announcement".into()))?;
        if has_topology == 0 {
            return Err(MeshError::NoTopology("shape exchange"));
        }
        shape
            .iter()
            .map(|&x| usize::try_from(x).map_err(|_| MeshError::Protocol(format!("negative grid extent {x}"))))
            .collect::<Result<Vec<_>>>()
            .map(Some)
    }
}

impl PartialEq for WorkerGroup {
    /// Equal only when both views are active on the same context, with the
    /// same membership and the same rank. Inactive views never compare equal.
    fn eq(&self, other: &Self) -> bool {
        match (&self.comm, &other.comm) {
            (Some(a), Some(b)) => {
                a.context() == b.context() && a.members() == b.members() && a.rank() == b.rank()
            }
            _ => false,
        }
    }
}
