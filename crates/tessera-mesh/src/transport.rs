//! Transport layer: in-process message-passing fabric.
//!
//! A `Fabric` connects a fixed world of workers, each holding an
//! [`Endpoint`]. Messages are raw byte payloads matched on
//! `(context, source, tag)` with FIFO order per channel. Sends are eager
//! and complete as soon as the payload is deposited in the receiver's
//! mailbox; receives are posted as [`Request`]s and driven to completion
//! through a [`RequestSet`].

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::trace;

use crate::error::{MeshError, Result};
use crate::protocol::{ContextId, Tag};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct ChannelKey {
    context: ContextId,
    source: usize,
    tag: Tag,
}

/// Per-worker inbox: payloads that arrived before a matching receive, and
/// receives posted before their payload.
#[derive(Default)]
struct Mailbox {
    queued: HashMap<ChannelKey, VecDeque<Vec<u8>>>,
    waiting: HashMap<ChannelKey, VecDeque<oneshot::Sender<Vec<u8>>>>,
}

impl Mailbox {
    fn deliver(&mut self, key: ChannelKey, mut payload: Vec<u8>) {
        if let Some(waiters) = self.waiting.get_mut(&key) {
            while let Some(tx) = waiters.pop_front() {
                match tx.send(payload) {
                    Ok(()) => {
                        if waiters.is_empty() {
                            self.waiting.remove(&key);
                        }
                        return;
                    }
                    // Receiver dropped its request; try the next one.
                    Err(returned) => payload = returned,
                }
            }
            self.waiting.remove(&key);
        }
        self.queued.entry(key).or_default().push_back(payload);
    }

    fn take(&mut self, key: &ChannelKey) -> Option<Vec<u8>> {
        let queue = self.queued.get_mut(key)?;
        let payload = queue.pop_front();
        if queue.is_empty() {
            self.queued.remove(key);
        }
        payload
    }
}

struct Shared {
    mailboxes: Vec<Mutex<Mailbox>>,
    next_context: AtomicU64,
}

/// Entry point for constructing a fabric.
pub struct Fabric;

impl Fabric {
    /// Create a new fabric builder.
    pub fn builder() -> FabricBuilder {
        FabricBuilder { workers: 1 }
    }

    /// Shorthand for a fabric of `workers` endpoints.
    pub fn local(workers: usize) -> Vec<Endpoint> {
        Self::builder().workers(workers).build()
    }
}

/// Builder for an in-process [`Fabric`].
pub struct FabricBuilder {
    workers: usize,
}

impl FabricBuilder {
    /// Number of workers (world size).
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Build the fabric, returning one endpoint per world rank in rank order.
    pub fn build(self) -> Vec<Endpoint> {
        let shared = Arc::new(Shared {
            mailboxes: (0..self.workers).map(|_| Mutex::default()).collect(),
            // ContextId::WORLD is 0.
            next_context: AtomicU64::new(1),
        });
        (0..self.workers)
            .map(|rank| Endpoint {
                rank,
                shared: Arc::clone(&shared),
            })
            .collect()
    }
}

/// One worker's handle on the fabric.
#[derive(Clone)]
pub struct Endpoint {
    rank: usize,
    shared: Arc<Shared>,
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("rank", &self.rank)
            .field("world_size", &self.world_size())
            .finish()
    }
}

impl Endpoint {
    /// This worker's world rank.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Number of workers on the fabric.
    pub fn world_size(&self) -> usize {
        self.shared.mailboxes.len()
    }

    fn check_rank(&self, rank: usize) -> Result<()> {
        if rank >= self.world_size() {
            return Err(MeshError::RankOutOfRange {
                rank,
                size: self.world_size(),
            });
        }
        Ok(())
    }

    /// Post a send of `payload` to world rank `dest`.
    ///
    /// The payload is deposited immediately, so the returned request is
    /// already complete.
    pub fn isend(&self, context: ContextId, dest: usize, tag: Tag, payload: Vec<u8>) -> Result<Request> {
        self.check_rank(dest)?;
        trace!(from = self.rank, to = dest, %context, tag, bytes = payload.len(), "isend");
        let key = ChannelKey {
            context,
            source: self.rank,
            tag,
        };
        self.shared.mailboxes[dest].lock().deliver(key, payload);
        Ok(Request::Sent)
    }

    /// Post a receive from world rank `source`.
    pub fn irecv(&self, context: ContextId, source: usize, tag: Tag) -> Result<Request> {
        self.check_rank(source)?;
        let key = ChannelKey {
            context,
            source,
            tag,
        };
        let mut mailbox = self.shared.mailboxes[self.rank].lock();
        if let Some(payload) = mailbox.take(&key) {
            return Ok(Request::Ready(payload));
        }
        let (tx, rx) = oneshot::channel();
        mailbox.waiting.entry(key).or_default().push_back(tx);
        Ok(Request::Pending {
            rx,
            context,
            source,
            tag,
        })
    }

    /// Blocking-style receive: post and wait.
    pub async fn recv(&self, context: ContextId, source: usize, tag: Tag) -> Result<Vec<u8>> {
        let payload = self.irecv(context, source, tag)?.wait().await?;
        Ok(payload.unwrap_or_default())
    }

    /// Allocate a context id that no other communicator on this fabric uses.
    pub(crate) fn allocate_context(&self) -> ContextId {
        ContextId(self.shared.next_context.fetch_add(1, Ordering::Relaxed))
    }
}

/// An outstanding (or trivially complete) point-to-point operation.
#[derive(Debug)]
pub enum Request {
    /// Placeholder that moves no data.
    Null,
    /// Completed send.
    Sent,
    /// Receive whose payload was already queued.
    Ready(Vec<u8>),
    /// Receive still waiting for its payload.
    Pending {
        rx: oneshot::Receiver<Vec<u8>>,
        context: ContextId,
        source: usize,
        tag: Tag,
    },
}

impl Request {
    pub fn is_null(&self) -> bool {
        matches!(self, Request::Null)
    }

    /// Wait for completion. Receives yield their payload; sends and null
    /// requests yield `None`.
    pub async fn wait(self) -> Result<Option<Vec<u8>>> {
        match self {
            Request::Null | Request::Sent => Ok(None),
            Request::Ready(payload) => Ok(Some(payload)),
            Request::Pending {
                rx,
                context,
                source,
                tag,
            } => rx.await.map(Some).map_err(|_| MeshError::PeerHungUp {
                context,
                source_rank: source,
                tag,
            }),
        }
    }
}

/// Outcome of [`RequestSet::wait_any`].
#[derive(Debug, PartialEq, Eq)]
pub enum Completion {
    /// The request posted at `index` finished.
    Index {
        index: usize,
        payload: Option<Vec<u8>>,
    },
    /// Only null requests remain.
    Undefined,
}

/// An ordered set of posted requests completed in arbitrary order.
///
/// Indices follow post order, null requests included, so callers can keep
/// parallel sequences (descriptors, buffers) aligned with the requests.
#[derive(Default)]
pub struct RequestSet {
    in_flight: FuturesUnordered<BoxFuture<'static, (usize, Result<Option<Vec<u8>>>)>>,
    posted: usize,
}

impl RequestSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a request; returns its index.
    pub fn push(&mut self, request: Request) -> usize {
        let index = self.posted;
        self.posted += 1;
        if !request.is_null() {
            self.in_flight
                .push(Box::pin(async move { (index, request.wait().await) }));
        }
        index
    }

    /// Number of posted requests, null requests included.
    pub fn len(&self) -> usize {
        self.posted
    }

    pub fn is_empty(&self) -> bool {
        self.posted == 0
    }

    /// Number of non-null requests not yet observed complete.
    pub fn outstanding(&self) -> usize {
        self.in_flight.len()
    }

    /// Wait for any one outstanding request.
    pub async fn wait_any(&mut self) -> Result<Completion> {
        match self.in_flight.next().await {
            Some((index, payload)) => Ok(Completion::Index {
                index,
                payload: payload?,
            }),
            None => Ok(Completion::Undefined),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CTX: ContextId = ContextId::WORLD;

    #[tokio::test]
    async fn fifo_per_channel() {
        let eps = Fabric::local(2);
        eps[0].isend(CTX, 1, 5, vec![1]).unwrap();
        eps[0].isend(CTX, 1, 5, vec![2]).unwrap();
        assert_eq!(eps[1].recv(CTX, 0, 5).await.unwrap(), vec![1]);
        assert_eq!(eps[1].recv(CTX, 0, 5).await.unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn receive_posted_before_send() {
        let eps = Fabric::local(2);
        let req = eps[1].irecv(CTX, 0, 9).unwrap();
        assert!(matches!(req, Request::Pending { .. }));
        eps[0].isend(CTX, 1, 9, vec![7, 7]).unwrap();
        assert_eq!(req.wait().await.unwrap(), Some(vec![7, 7]));
    }

    #[tokio::test]
    async fn channels_are_separated_by_tag_and_context() {
        let eps = Fabric::local(2);
        eps[0].isend(CTX, 1, 1, vec![1]).unwrap();
        eps[0].isend(ContextId(4), 1, 1, vec![4]).unwrap();
        eps[0].isend(CTX, 1, 2, vec![2]).unwrap();
        assert_eq!(eps[1].recv(CTX, 0, 2).await.unwrap(), vec![2]);
        assert_eq!(eps[1].recv(ContextId(4), 0, 1).await.unwrap(), vec![4]);
        assert_eq!(eps[1].recv(CTX, 0, 1).await.unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn wait_any_reports_null_as_undefined() {
        let eps = Fabric::local(2);
        let mut set = RequestSet::new();
        assert_eq!(set.push(Request::Null), 0);
        assert_eq!(set.push(eps[1].irecv(CTX, 0, 3).unwrap()), 1);
        assert_eq!(set.push(Request::Null), 2);
        assert_eq!(set.len(), 3);
        assert_eq!(set.outstanding(), 1);

        eps[0].isend(CTX, 1, 3, vec![42]).unwrap();
        assert_eq!(
            set.wait_any().await.unwrap(),
            Completion::Index {
                index: 1,
                payload: Some(vec![42])
            }
        );
        assert_eq!(set.wait_any().await.unwrap(), Completion::Undefined);
    }

    #[test]
    fn drained_channels_leave_no_entries() {
        let key = ChannelKey {
            context: CTX,
            source: 0,
            tag: 6,
        };
        let mut mailbox = Mailbox::default();
        let (tx, mut rx) = oneshot::channel();
        mailbox.waiting.entry(key).or_default().push_back(tx);
        mailbox.deliver(key, vec![1]);
        assert_eq!(rx.try_recv().unwrap(), vec![1]);
        assert!(mailbox.waiting.is_empty());

        // A dropped waiter is skipped and the payload queued instead.
        let (tx, rx) = oneshot::channel::<Vec<u8>>();
        drop(rx);
        mailbox.waiting.entry(key).or_default().push_back(tx);
        mailbox.deliver(key, vec![2]);
        assert!(mailbox.waiting.is_empty());
        assert_eq!(mailbox.take(&key), Some(vec![2]));
        assert!(mailbox.queued.is_empty());
    }

    #[test]
    fn out_of_range_peer() {
        let eps = Fabric::local(2);
        let err = eps[0].isend(CTX, 2, 0, Vec::new()).unwrap_err();
        assert!(matches!(err, MeshError::RankOutOfRange { rank: 2, size: 2 }));
    }

    #[test]
    fn contexts_are_unique() {
        let eps = Fabric::local(3);
        let a = eps[0].allocate_context();
        let b = eps[2].allocate_context();
        assert_ne!(a, b);
        assert_ne!(a, ContextId::WORLD);
    }
}
