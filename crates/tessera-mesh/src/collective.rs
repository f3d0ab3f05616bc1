//! Small-payload collectives for metadata (shapes, flags, indices).
//!
//! These are the only full-group synchronization points. Bulk block data
//! never goes through here; see [`engine`](crate::engine).

use crate::communicator::Communicator;
use crate::error::{MeshError, Result};
use crate::protocol::tags;

/// Broadcast raw bytes from communicator rank `root`.
///
/// Only the root's `payload` is read; it must be `Some` there.
pub async fn broadcast_bytes(comm: &Communicator, root: usize, payload: Option<Vec<u8>>) -> Result<Vec<u8>> {
    if root >= comm.size() {
        return Err(MeshError::RankOutOfRange {
            rank: root,
            size: comm.size(),
        });
    }
    if comm.rank() != root {
        return comm.recv(root, tags::BROADCAST).await;
    }

    let payload = payload.ok_or(MeshError::MissingInput("broadcast"))?;
    for peer in (0..comm.size()).filter(|&r| r != root) {
        comm.isend(peer, tags::BROADCAST, payload.clone())?;
    }
    Ok(payload)
}

/// Gather every member's bytes, in communicator rank order.
pub async fn allgather_bytes(comm: &Communicator, payload: Vec<u8>) -> Result<Vec<Vec<u8>>> {
    let me = comm.rank();
    for peer in (0..comm.size()).filter(|&r| r != me) {
        comm.isend(peer, tags::ALLGATHER, payload.clone())?;
    }

    let mut gathered = Vec::with_capacity(comm.size());
    for peer in 0..comm.size() {
        if peer == me {
            gathered.push(payload.clone());
        } else {
            gathered.push(comm.recv(peer, tags::ALLGATHER).await?);
        }
    }
    Ok(gathered)
}

/// Broadcast an integer vector from `root`.
pub async fn broadcast(comm: &Communicator, root: usize, value: Option<&[i64]>) -> Result<Vec<i64>> {
    let payload = match value {
        Some(v) if comm.rank() == root => Some(postcard::to_allocvec(v)?),
        _ => None,
    };
    let bytes = broadcast_bytes(comm, root, payload).await?;
    Ok(postcard::from_bytes(&bytes)?)
}

/// All-gather fixed-length integer vectors, in communicator rank order.
pub async fn allgather(comm: &Communicator, value: &[i64]) -> Result<Vec<Vec<i64>>> {
    let gathered = allgather_bytes(comm, postcard::to_allocvec(value)?).await?;
    let rows = gathered
        .iter()
        .map(|bytes| postcard::from_bytes::<Vec<i64>>(bytes))
        .collect::<std::result::Result<Vec<_>, _>>()?;

    if let Some((rank, row)) = rows.iter().enumerate().find(|(_, r)| r.len() != value.len()) {
        return Err(MeshError::Protocol(format!(
            "allgather contribution of rank {rank} has {} entries, expected {}",
            row.len(),
            value.len()
        )));
    }
    Ok(rows)
}
