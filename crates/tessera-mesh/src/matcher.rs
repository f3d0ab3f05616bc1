//! Broadcast and reduction subgroups between two Cartesian groups.
//!
//! A *distribution* sends from a lower-dimensional source grid to every
//! destination worker sharing its coordinate on the matching axes; a
//! *combination* is the reverse many-to-one relation. Each "one" side
//! worker gets a subgroup with itself at rank 0 and its partners after it.

use tracing::debug;

use crate::error::{MeshError, Result};
use crate::grid::{flat_index_c, flat_index_f};
use crate::group::WorkerGroup;
use crate::protocol::Tag;

/// Direction of the cross-group relation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MatchKind {
    /// One source worker to many destination workers.
    Distribution,
    /// Many source workers to one destination worker.
    Combination,
}

/// The subgroups this worker sends on and receives on.
///
/// When both roles use the same members, `send` and `recv` are the same
/// group. Either is inactive when the worker has no such role.
#[derive(Clone, Debug)]
pub struct SubgroupPair {
    pub send: WorkerGroup,
    pub recv: WorkerGroup,
}

/// Builds [`SubgroupPair`]s for a source/destination group pair.
#[derive(Clone, Copy, Debug)]
pub struct CrossGroupMatcher {
    kind: MatchKind,
    transpose_src: bool,
    transpose_dest: bool,
}

impl CrossGroupMatcher {
    pub fn new(kind: MatchKind) -> Self {
        Self {
            kind,
            transpose_src: false,
            transpose_dest: false,
        }
    }

    /// One-to-many matcher (shared weight broadcast).
    pub fn distribution() -> Self {
        Self::new(MatchKind::Distribution)
    }

    /// Many-to-one matcher (gradient reduction).
    pub fn combination() -> Self {
        Self::new(MatchKind::Combination)
    }

    /// Read the source grid axes in reverse (column-major) order.
    pub fn transpose_src(mut self, transpose: bool) -> Self {
        self.transpose_src = transpose;
        self
    }

    /// Read the destination grid axes in reverse (column-major) order.
    pub fn transpose_dest(mut self, transpose: bool) -> Self {
        self.transpose_dest = transpose;
        self
    }

    pub fn kind(&self) -> MatchKind {
        self.kind
    }

    /// Build this worker's send and receive subgroups.
    ///
    /// Collective over the union of `src` and `dest`; workers in neither
    /// get two inactive groups and do not communicate.
    pub async fn build(&self, src: &WorkerGroup, dest: &WorkerGroup) -> Result<SubgroupPair> {
        let null = || WorkerGroup::null(src.endpoint().clone(), src.root());
        if !src.is_active() && !dest.is_active() {
            return Ok(SubgroupPair {
                send: null(),
                recv: null(),
            });
        }

        let union = src.union(dest).await?;
        let src_shape = union.shape_of(src).await?.unwrap_or_default();
        let dest_shape = union.shape_of(dest).await?.unwrap_or_default();

        let axes = self.matching_axes(&src_shape, &dest_shape)?;
        let src_flat = match src.coord() {
            Some(coord) => axes.src_index(coord, self.transpose_src),
            None => -1,
        };
        let dest_flat = match dest.coord() {
            Some(coord) => axes.dest_index(coord, self.transpose_dest),
            None => -1,
        };

        let gathered = union
            .allgather_vector(&[src_flat, dest_flat])
            .await?
            .ok_or(MeshError::InactiveGroup("cross-group matching"))?;
        let src_indices: Vec<i64> = gathered.iter().map(|row| row[0]).collect();
        let dest_indices: Vec<i64> = gathered.iter().map(|row| row[1]).collect();

        let (send_ranks, recv_ranks) = match self.kind {
            MatchKind::Distribution => (
                partner_ranks(src.is_active(), src_flat, &src_indices, &dest_indices)?,
                partner_ranks(dest.is_active(), dest_flat, &src_indices, &dest_indices)?,
            ),
            MatchKind::Combination => (
                partner_ranks(src.is_active(), src_flat, &dest_indices, &src_indices)?,
                partner_ranks(dest.is_active(), dest_flat, &dest_indices, &src_indices)?,
            ),
        };
        debug!(
            kind = ?self.kind,
            union_rank = ?union.rank(),
            ?send_ranks,
            ?recv_ranks,
            "matched cross-group partners"
        );

        create_send_recv(&union, &send_ranks, &recv_ranks).await
    }

    fn matching_axes(&self, src_shape: &[usize], dest_shape: &[usize]) -> Result<MatchingAxes> {
        let incompatible = |rule| MeshError::IncompatibleGrids {
            src: src_shape.to_vec(),
            dest: dest_shape.to_vec(),
            rule,
        };
        let src = oriented(src_shape, self.transpose_src);
        let dest = oriented(dest_shape, self.transpose_dest);

        let (src, dest) = match self.kind {
            MatchKind::Distribution => {
                if src.len() > dest.len() {
                    return Err(incompatible("distribution"));
                }
                let src = pad_left(&src, dest.len());
                if src.iter().zip(&dest).any(|(&s, &d)| s != d && s != 1) {
                    return Err(incompatible("distribution"));
                }
                (src, dest)
            }
            MatchKind::Combination => {
                if dest.len() > src.len() {
                    return Err(incompatible("combination"));
                }
                let dest = pad_left(&dest, src.len());
                if src.iter().zip(&dest).any(|(&s, &d)| s != d && d != 1) {
                    return Err(incompatible("combination"));
                }
                (src, dest)
            }
        };

        let matching = src.iter().zip(&dest).map(|(s, d)| s == d).collect();
        Ok(MatchingAxes {
            src,
            dest,
            matching,
        })
    }
}

/// Both grids in a common padded orientation, plus which axes match.
#[derive(Debug)]
struct MatchingAxes {
    src: Vec<usize>,
    dest: Vec<usize>,
    matching: Vec<bool>,
}

impl MatchingAxes {
    fn src_index(&self, coord: &[usize], transpose: bool) -> i64 {
        self.flat(&self.src, coord, transpose)
    }

    fn dest_index(&self, coord: &[usize], transpose: bool) -> i64 {
        self.flat(&self.dest, coord, transpose)
    }

    /// Flattened index of `coord` over the matching axes of `shape`;
    /// column-major when the grid is read transposed.
    fn flat(&self, shape: &[usize], coord: &[usize], transpose: bool) -> i64 {
        let coord = pad_with(&oriented(coord, transpose), shape.len(), 0);
        let select = |v: &[usize]| -> Vec<usize> {
            v.iter()
                .zip(&self.matching)
                .filter(|&(_, &m)| m)
                .map(|(&x, _)| x)
                .collect()
        };
        let (shape, coord) = (select(shape), select(&coord));
        if transpose {
            flat_index_f(&shape, &coord)
        } else {
            flat_index_c(&shape, &coord)
        }
    }
}

fn oriented(v: &[usize], transpose: bool) -> Vec<usize> {
    if transpose {
        v.iter().rev().copied().collect()
    } else {
        v.to_vec()
    }
}

fn pad_left(v: &[usize], len: usize) -> Vec<usize> {
    pad_with(v, len, 1)
}

fn pad_with(v: &[usize], len: usize, fill: usize) -> Vec<usize> {
    let mut padded = vec![fill; len.saturating_sub(v.len())];
    padded.extend_from_slice(v);
    padded
}

/// Union ranks of the subgroup rooted at the owner of `root_index`.
///
/// The owner is the first union rank whose `owner_indices` entry equals
/// `root_index`; it is listed first, followed by every other union rank
/// whose `partner_indices` entry matches.
fn partner_ranks(
    active: bool,
    root_index: i64,
    owner_indices: &[i64],
    partner_indices: &[i64],
) -> Result<Vec<usize>> {
    if !active {
        return Ok(Vec::new());
    }
    let root = owner_indices
        .iter()
        .position(|&i| i == root_index)
        .ok_or(MeshError::UnmatchedIndex { index: root_index })?;

    let mut ranks = vec![root];
    ranks.extend(
        partner_indices
            .iter()
            .enumerate()
            .filter(|&(rank, &i)| i == root_index && rank != root)
            .map(|(rank, _)| rank),
    );
    Ok(ranks)
}

/// Create the send and receive subgroups of `union`.
///
/// When both are needed and differ, the one whose first-listed rank is
/// smaller is created first, so no two workers wait on each other's
/// creations.
async fn create_send_recv(union: &WorkerGroup, send: &[usize], recv: &[usize]) -> Result<SubgroupPair> {
    let null = || WorkerGroup::null(union.endpoint().clone(), union.root());
    let create = |ranks: &[usize]| {
        let ranks = ranks.to_vec();
        async move { union.subgroup(&ranks, ranks[0] as Tag).await }
    };

    let pair = match (send.first(), recv.first()) {
        (Some(_), Some(_)) if send == recv => {
            let shared = create(send).await?;
            SubgroupPair {
                send: shared.clone(),
                recv: shared,
            }
        }
        (Some(&s), Some(&r)) if r < s => {
            let recv = create(recv).await?;
            let send = create(send).await?;
            SubgroupPair { send, recv }
        }
        (Some(_), Some(_)) => {
            let send = create(send).await?;
            let recv = create(recv).await?;
            SubgroupPair { send, recv }
        }
        (Some(_), None) => SubgroupPair {
            send: create(send).await?,
            recv: null(),
        },
        (None, Some(_)) => SubgroupPair {
            send: null(),
            recv: create(recv).await?,
        },
        (None, None) => SubgroupPair {
            send: null(),
            recv: null(),
        },
    };
    Ok(pair)
}
