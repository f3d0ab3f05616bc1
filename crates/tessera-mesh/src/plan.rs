//! Redistribution plans: which block goes to which partner.
//!
//! A plan is pure index math over two decompositions of one global shape.
//! Each worker intersects its source block with every destination block
//! (outbound) and its destination block with every source block (inbound),
//! keeping one [`Overlap`] per partner it shares elements with.

use std::collections::HashMap;

use tessera_tensor::Region;
use tracing::info;

use crate::decomposition::Decomposition;
use crate::error::{MeshError, Result};
use crate::group::WorkerGroup;

/// One block exchanged with one partner.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Overlap {
    /// The block in this worker's local frame.
    pub region: Region,
    /// The same block in global coordinates.
    pub global: Region,
    /// Partner's rank in the union group.
    pub partner: usize,
}

impl Overlap {
    /// Per-axis extents.
    pub fn extents(&self) -> Vec<usize> {
        self.region.extents()
    }

    /// Number of elements.
    pub fn size(&self) -> usize {
        self.region.volume()
    }

    /// Whether any bytes move for this overlap.
    pub fn carries_data(&self) -> bool {
        self.size() > 0
    }
}

/// Outbound and inbound overlaps of one worker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RedistributionPlan {
    src: Decomposition,
    dest: Decomposition,
    src_coord: Option<Vec<usize>>,
    dest_coord: Option<Vec<usize>>,
    outbound: Vec<Overlap>,
    inbound: Vec<Overlap>,
}

impl RedistributionPlan {
    /// Compute the plan for the worker at `src_coord` / `dest_coord`
    /// (`None` where it is not a member).
    ///
    /// `src_partner` and `dest_partner` map grid coordinates to union ranks.
    pub fn compute(
        global: &[usize],
        src_grid: &[usize],
        dest_grid: &[usize],
        src_coord: Option<&[usize]>,
        dest_coord: Option<&[usize]>,
        src_partner: impl Fn(&[usize]) -> Option<usize>,
        dest_partner: impl Fn(&[usize]) -> Option<usize>,
    ) -> Result<Self> {
        let src = Decomposition::new(global, src_grid)?;
        let dest = Decomposition::new(global, dest_grid)?;

        let outbound = match src_coord {
            Some(coord) => overlaps(global, &src.block(coord), &dest, dest_partner)?,
            None => Vec::new(),
        };
        let inbound = match dest_coord {
            Some(coord) => overlaps(global, &dest.block(coord), &src, src_partner)?,
            None => Vec::new(),
        };
        check_disjoint(&outbound)?;
        check_disjoint(&inbound)?;

        Ok(Self {
            src,
            dest,
            src_coord: src_coord.map(<[usize]>::to_vec),
            dest_coord: dest_coord.map(<[usize]>::to_vec),
            outbound,
            inbound,
        })
    }

    /// Build the plan collectively over `union`.
    ///
    /// Grid shapes come from each group's rank 0 and coordinates from an
    /// all-gather, so every worker plans from the same picture. Workers
    /// outside the union get `None`.
    pub async fn build(
        union: &WorkerGroup,
        src: &WorkerGroup,
        dest: &WorkerGroup,
        global: &[usize],
    ) -> Result<Option<Self>> {
        if !union.is_active() {
            return Ok(None);
        }
        let src_grid = union.shape_of(src).await?.unwrap_or_default();
        let dest_grid = union.shape_of(dest).await?.unwrap_or_default();
        for grid in [&src_grid, &dest_grid] {
            if grid.len() != global.len() {
                return Err(MeshError::GridRankMismatch {
                    grid: grid.clone(),
                    global: global.to_vec(),
                });
            }
        }

        let ndim = global.len();
        let mut row = Vec::with_capacity(2 * ndim + 2);
        for group in [src, dest] {
            match group.coord() {
                Some(coord) => {
                    row.push(1);
                    row.extend(coord.iter().map(|&c| c as i64));
                }
                None => {
                    row.push(0);
                    row.extend(std::iter::repeat(-1).take(ndim));
                }
            }
        }
        let rows = union
            .allgather_vector(&row)
            .await?
            .ok_or(MeshError::InactiveGroup("plan construction"))?;

        let mut src_owner = HashMap::new();
        let mut dest_owner = HashMap::new();
        for (rank, row) in rows.iter().enumerate() {
            let (src_part, dest_part) = row.split_at(ndim + 1);
            for (owners, part) in [(&mut src_owner, src_part), (&mut dest_owner, dest_part)] {
                if part[0] == 1 {
                    let coord: Vec<usize> = part[1..].iter().map(|&c| c as usize).collect();
                    owners.insert(coord, rank);
                }
            }
        }

        let plan = Self::compute(
            global,
            &src_grid,
            &dest_grid,
            src.coord(),
            dest.coord(),
            |c| src_owner.get(c).copied(),
            |c| dest_owner.get(c).copied(),
        )?;
        info!(
            union_rank = ?union.rank(),
            ?global,
            ?src_grid,
            ?dest_grid,
            outbound = plan.outbound.len(),
            inbound = plan.inbound.len(),
            "built redistribution plan"
        );
        Ok(Some(plan))
    }

    pub fn global_shape(&self) -> &[usize] {
        self.src.global_shape()
    }

    pub fn src(&self) -> &Decomposition {
        &self.src
    }

    pub fn dest(&self) -> &Decomposition {
        &self.dest
    }

    /// Blocks this worker sends when moving data from source to destination.
    pub fn outbound(&self) -> &[Overlap] {
        &self.outbound
    }

    /// Blocks this worker receives when moving data from source to destination.
    pub fn inbound(&self) -> &[Overlap] {
        &self.inbound
    }

    /// This worker's source block extents, if it is a source member.
    pub fn src_local_shape(&self) -> Option<Vec<usize>> {
        self.src_coord.as_deref().map(|c| self.src.local_shape(c))
    }

    /// This worker's destination block extents, if it is a destination member.
    pub fn dest_local_shape(&self) -> Option<Vec<usize>> {
        self.dest_coord.as_deref().map(|c| self.dest.local_shape(c))
    }
}

/// Intersect `mine` with every block of `theirs`, in row-major grid order.
///
/// A pair overlaps when every axis shares at least one index, or has zero
/// global extent (such pairs exchange zero elements but keep their slot).
fn overlaps(
    global: &[usize],
    mine: &Region,
    theirs: &Decomposition,
    partner: impl Fn(&[usize]) -> Option<usize>,
) -> Result<Vec<Overlap>> {
    let origin = mine.origin();
    let mut found = Vec::new();
    for (coord, block) in theirs.blocks() {
        let shared = mine.intersect(&block);
        let overlapping = shared
            .spans()
            .iter()
            .zip(global)
            .all(|(span, &extent)| !span.is_empty() || extent == 0);
        if !overlapping {
            continue;
        }
        let partner = partner(&coord).ok_or_else(|| {
            MeshError::Protocol(format!("no union member at grid coordinate {coord:?}"))
        })?;
        found.push(Overlap {
            region: shared.relative_to(&origin),
            global: shared,
            partner,
        });
    }
    Ok(found)
}

fn check_disjoint(overlaps: &[Overlap]) -> Result<()> {
    for (i, a) in overlaps.iter().enumerate() {
        if let Some(b) = overlaps[i + 1..].iter().find(|b| a.region.overlaps(&b.region)) {
            return Err(MeshError::OverlappingInbound {
                first: a.partner,
                second: b.partner,
            });
        }
    }
    Ok(())
}
