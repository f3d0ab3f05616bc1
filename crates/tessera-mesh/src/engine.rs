//! Redistribution engine: drives a plan's block exchange in both directions.
//!
//! Forward moves a tensor from the source decomposition to the destination
//! decomposition; backward moves gradients the other way over the same
//! overlaps with the roles swapped. One exchange:
//!
//! 0. all-gather each worker's verdict on its own input (and, forward, the
//!    gradient flag), so a bad input fails every worker before any data moves,
//! 1. post every receive (null for zero-volume overlaps),
//! 2. pack and send every outbound block,
//! 3. allocate the zero-filled output while sends are in flight,
//! 4. unpack each receive as it completes, in whatever order that is.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tessera::Element;
use tessera_tensor::{Local, Shape, Tensor};
use tracing::{debug, trace, warn};

use crate::config::ExchangeConfig;
use crate::decomposition::global_shape_from_local;
use crate::error::{MeshError, Result};
use crate::group::WorkerGroup;
use crate::plan::{Overlap, RedistributionPlan};
use crate::protocol::Tag;
use crate::transport::{Completion, Request, RequestSet};

/// Immutable setup shared by the forward and backward directions.
#[derive(Clone, Debug)]
pub struct ExchangePlan {
    union: WorkerGroup,
    src: WorkerGroup,
    dest: WorkerGroup,
    /// Union rank of the source group's rank 0.
    src_root: usize,
    layout: Option<RedistributionPlan>,
    config: ExchangeConfig,
}

impl ExchangePlan {
    /// Plan redistribution of a tensor of shape `global` from `src` to
    /// `dest`. Collective over the union of the two groups.
    pub async fn build(
        src: &WorkerGroup,
        dest: &WorkerGroup,
        global: &[usize],
        config: ExchangeConfig,
    ) -> Result<Self> {
        config.validate()?;
        let union = src.union(dest).await?;
        let src_root = source_root(&union, src)?;
        Self::with_union(union, src_root, src, dest, global, config).await
    }

    /// Like [`build`](Self::build), with the global shape reconstructed from
    /// the source workers' local block shapes.
    ///
    /// Every active source worker must pass `Some`, with one extent per
    /// grid axis. A worker that does not fails with the cause; every other
    /// union member fails with [`MeshError::PeerRejected`].
    pub async fn from_local_shape(
        src: &WorkerGroup,
        dest: &WorkerGroup,
        local_shape: Option<&[usize]>,
        config: ExchangeConfig,
    ) -> Result<Self> {
        config.validate()?;
        let union = src.union(dest).await?;
        let src_root = source_root(&union, src)?;

        let verdict = match (src.is_active(), local_shape) {
            (false, _) => Ok(()),
            (true, None) => Err(MeshError::MissingInput("from_local_shape")),
            (true, Some(local)) => match src.dim() {
                None => Err(MeshError::NoTopology("from_local_shape")),
                Some(dim) if dim != local.len() => Err(MeshError::GridRankMismatch {
                    grid: src.shape().unwrap_or_default().to_vec(),
                    global: local.to_vec(),
                }),
                Some(_) => Ok(()),
            },
        };
        agree_on_input(&union, "from_local_shape", 0, verdict).await?;

        let global = match (src.is_active(), local_shape) {
            (true, Some(local)) => global_shape_from_local(src, local).await?,
            _ => None,
        };
        let global: Option<Vec<i64>> = global.map(|g| g.iter().map(|&x| x as i64).collect());
        let shared = union.broadcast_value(global.as_deref(), src_root, None).await?;
        let global: Vec<usize> = shared
            .unwrap_or_default()
            .into_iter()
            .map(|x| x as usize)
            .collect();
        Self::with_union(union, src_root, src, dest, &global, config).await
    }

    async fn with_union(
        union: WorkerGroup,
        src_root: usize,
        src: &WorkerGroup,
        dest: &WorkerGroup,
        global: &[usize],
        config: ExchangeConfig,
    ) -> Result<Self> {
        let layout = RedistributionPlan::build(&union, src, dest, global).await?;
        Ok(Self {
            union,
            src: src.clone(),
            dest: dest.clone(),
            src_root,
            layout,
            config,
        })
    }

    pub fn union(&self) -> &WorkerGroup {
        &self.union
    }

    pub fn src(&self) -> &WorkerGroup {
        &self.src
    }

    pub fn dest(&self) -> &WorkerGroup {
        &self.dest
    }

    /// The overlap layout; `None` on workers outside the union.
    pub fn layout(&self) -> Option<&RedistributionPlan> {
        self.layout.as_ref()
    }

    pub fn config(&self) -> &ExchangeConfig {
        &self.config
    }
}

/// Union rank of `src`'s rank 0, from membership lists alone.
fn source_root(union: &WorkerGroup, src: &WorkerGroup) -> Result<usize> {
    src.members()
        .first()
        .and_then(|first| union.members().iter().position(|m| m == first))
        .ok_or(MeshError::RootNotInSource { root: 0 })
}

/// All-gather `value` together with this worker's verdict on its own input.
///
/// A worker that rejected its input still takes part, so the failure
/// reaches every union member instead of leaving peers waiting on data
/// that never comes. Returns every member's `value` in union rank order,
/// or `None` off the union.
async fn agree_on_input(
    union: &WorkerGroup,
    operation: &'static str,
    value: i64,
    verdict: Result<()>,
) -> Result<Option<Vec<i64>>> {
    let row = [value, i64::from(verdict.is_err())];
    let Some(rows) = union.allgather_vector(&row).await? else {
        return Ok(None);
    };
    verdict?;
    if let Some(rank) = rows.iter().position(|r| r[1] != 0) {
        return Err(MeshError::PeerRejected { rank, operation });
    }
    Ok(Some(rows.into_iter().map(|r| r[0]).collect()))
}

/// Which way data flows.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Direction {
    Forward,
    Backward,
}

impl Direction {
    fn name(self) -> &'static str {
        match self {
            Direction::Forward => "forward",
            Direction::Backward => "backward",
        }
    }
}

/// State carried from forward to backward.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Saved {
    /// Whether the source tensor required gradients, as agreed by the union.
    pub requires_grad: bool,
}

/// A function with a matched adjoint, callable by an external autodiff engine.
pub trait AdjointFunction<T: Element> {
    fn forward(&mut self, input: Local<T>) -> impl Future<Output = Result<(Local<T>, Saved)>> + Send;

    fn backward(
        &mut self,
        saved: &Saved,
        grad_output: Local<T>,
    ) -> impl Future<Output = Result<Local<T>>> + Send;
}

/// One buffer slot per overlap; `None` where the overlap moves no data.
struct ExchangeBuffers<T> {
    outbound: Vec<Option<Vec<T>>>,
    inbound: Vec<Option<Vec<T>>>,
}

impl<T: Element> ExchangeBuffers<T> {
    fn allocate(layout: &RedistributionPlan) -> Self {
        let slots = |overlaps: &[Overlap]| {
            overlaps
                .iter()
                .map(|o| o.carries_data().then(|| Vec::with_capacity(o.size())))
                .collect()
        };
        Self {
            outbound: slots(layout.outbound()),
            inbound: slots(layout.inbound()),
        }
    }
}

/// Executes an [`ExchangePlan`] for elements of type `T`.
///
/// Per-overlap element buffers are allocated on first use, keep their
/// capacity across calls and are dropped whenever the plan is replaced.
/// Wire payloads are not pooled: the fabric takes ownership of every sent
/// message, so each send encodes into a fresh byte vector and each receive
/// decodes into a fresh element vector that replaces its slot.
pub struct Redistributor<T: Element> {
    plan: Arc<ExchangePlan>,
    buffers: Option<ExchangeBuffers<T>>,
}

impl<T: Element> Redistributor<T> {
    pub fn new(plan: Arc<ExchangePlan>) -> Self {
        Self {
            plan,
            buffers: None,
        }
    }

    pub fn plan(&self) -> &Arc<ExchangePlan> {
        &self.plan
    }

    /// Swap in a new plan, discarding buffers sized for the old one.
    pub fn set_plan(&mut self, plan: Arc<ExchangePlan>) {
        self.plan = plan;
        self.buffers = None;
    }

    /// Redistribute `input` from the source to the destination layout.
    ///
    /// Workers outside the destination group get `Local::Empty`. A source
    /// worker whose block is missing or misshapen fails with the cause;
    /// every other union member fails with [`MeshError::PeerRejected`].
    pub async fn forward(&mut self, input: Local<T>) -> Result<(Local<T>, Saved)> {
        let plan = Arc::clone(&self.plan);
        if !plan.union.is_active() {
            return Ok((Local::Empty, Saved::default()));
        }

        let verdict = check_input(&plan, Direction::Forward, &input);
        let flags = agree_on_input(&plan.union, "forward", i64::from(input.requires_grad()), verdict)
            .await?
            .unwrap_or_default();
        // The source's rank 0 decides for everyone.
        let saved = Saved {
            requires_grad: flags.get(plan.src_root) == Some(&1),
        };

        let output = self
            .exchange(&plan, Direction::Forward, input, saved.requires_grad)
            .await?;
        Ok((output, saved))
    }

    /// Move `grad_output` from the destination back to the source layout.
    ///
    /// Workers outside the source group get `Local::Empty`. Input checks
    /// fail collectively as in [`forward`](Self::forward).
    pub async fn backward(&mut self, saved: &Saved, grad_output: Local<T>) -> Result<Local<T>> {
        let plan = Arc::clone(&self.plan);
        if !plan.union.is_active() {
            return Ok(Local::Empty);
        }
        let verdict = check_input(&plan, Direction::Backward, &grad_output);
        agree_on_input(&plan.union, "backward", 0, verdict).await?;
        self.exchange(&plan, Direction::Backward, grad_output, saved.requires_grad)
            .await
    }

    async fn exchange(
        &mut self,
        plan: &ExchangePlan,
        direction: Direction,
        input: Local<T>,
        requires_grad: bool,
    ) -> Result<Local<T>> {
        let layout = plan
            .layout
            .as_ref()
            .ok_or(MeshError::InactiveGroup("exchange"))?;
        let union = plan
            .union
            .communicator()
            .ok_or(MeshError::InactiveGroup("exchange"))?;
        let (sender, receiver, sends, recvs, tag): (_, _, _, _, Tag) = match direction {
            Direction::Forward => (
                &plan.src,
                &plan.dest,
                layout.outbound(),
                layout.inbound(),
                plan.config.forward_tag,
            ),
            Direction::Backward => (
                &plan.dest,
                &plan.src,
                layout.inbound(),
                layout.outbound(),
                plan.config.backward_tag,
            ),
        };
        let recv_shape = match direction {
            Direction::Forward => layout.dest_local_shape(),
            Direction::Backward => layout.src_local_shape(),
        };

        let buffers = self
            .buffers
            .get_or_insert_with(|| ExchangeBuffers::allocate(layout));
        let (send_buffers, recv_buffers) = match direction {
            Direction::Forward => (&mut buffers.outbound, &mut buffers.inbound),
            Direction::Backward => (&mut buffers.inbound, &mut buffers.outbound),
        };

        let mut requests = RequestSet::new();
        if receiver.is_active() {
            for overlap in recvs {
                let request = if overlap.carries_data() {
                    union.irecv(overlap.partner, tag)?
                } else {
                    Request::Null
                };
                requests.push(request);
            }
        }
        let recv_count = requests.len();

        if sender.is_active() {
            // Checked by `check_input` before anything was posted.
            let block = match &input {
                Local::Present(block) => block,
                Local::Empty => return Err(MeshError::MissingInput(direction.name())),
            };
            for (overlap, slot) in sends.iter().zip(send_buffers.iter_mut()) {
                let request = match slot {
                    Some(buffer) => {
                        block.pack_into(&overlap.region, buffer)?;
                        union.isend(overlap.partner, tag, postcard::to_allocvec(buffer.as_slice())?)?
                    }
                    None => Request::Null,
                };
                requests.push(request);
            }
        } else if input.is_present() {
            warn!(
                direction = direction.name(),
                "ignoring a block passed to a worker outside the sending group"
            );
        }

        // Allocate while the sends are in flight.
        let mut output = match (receiver.is_active(), recv_shape) {
            (true, Some(shape)) => Some(Tensor::<T>::zeros(Shape::new(shape))),
            _ => None,
        };

        debug!(
            direction = direction.name(),
            recvs = recv_count,
            sends = requests.len() - recv_count,
            elem = T::NAME,
            "exchange posted"
        );

        for _ in 0..requests.len() {
            let Completion::Index { index, payload } = requests.wait_any().await? else {
                continue;
            };
            let (Some(bytes), Some(out)) = (payload, output.as_mut()) else {
                continue;
            };
            if index >= recv_count {
                continue;
            }
            if let Some(buffer) = recv_buffers[index].as_mut() {
                *buffer = postcard::from_bytes(&bytes)?;
                // Each element has exactly one owner, so a copy suffices.
                out.unpack(&recvs[index].region, buffer)?;
                trace!(index, partner = recvs[index].partner, "unpacked");
            }
        }

        Ok(match output {
            Some(out) => Local::Present(out.with_requires_grad(requires_grad)),
            None => Local::Empty,
        })
    }
}

/// This worker's verdict on its own input for one direction.
fn check_input<T: Element>(plan: &ExchangePlan, direction: Direction, input: &Local<T>) -> Result<()> {
    let layout = plan
        .layout
        .as_ref()
        .ok_or(MeshError::InactiveGroup("exchange"))?;
    let (sender, expected) = match direction {
        Direction::Forward => (&plan.src, layout.src_local_shape()),
        Direction::Backward => (&plan.dest, layout.dest_local_shape()),
    };
    if !sender.is_active() {
        return Ok(());
    }
    let block = input
        .as_present()
        .ok_or(MeshError::MissingInput(direction.name()))?;
    let expected = expected.ok_or(MeshError::InactiveGroup("exchange"))?;
    if block.shape().dims() != expected.as_slice() {
        return Err(MeshError::LocalShapeMismatch {
            expected,
            got: block.shape().dims().to_vec(),
        });
    }
    Ok(())
}

impl<T: Element> AdjointFunction<T> for Redistributor<T> {
    fn forward(&mut self, input: Local<T>) -> impl Future<Output = Result<(Local<T>, Saved)>> + Send {
        Redistributor::forward(self, input)
    }

    fn backward(
        &mut self,
        saved: &Saved,
        grad_output: Local<T>,
    ) -> impl Future<Output = Result<Local<T>>> + Send {
        Redistributor::backward(self, saved, grad_output)
    }
}

/// What a worker knows locally about a group: its membership and, if it
/// is an active Cartesian member, the grid shape.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct GroupSignature {
    pub members: Vec<usize>,
    pub grid: Option<Vec<usize>>,
}

impl GroupSignature {
    pub fn of(group: &WorkerGroup) -> Self {
        Self {
            members: group.members().to_vec(),
            grid: group.shape().map(<[usize]>::to_vec),
        }
    }
}

/// Cache key of an [`ExchangePlan`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PlanKey {
    pub src: GroupSignature,
    pub dest: GroupSignature,
    pub global: Vec<usize>,
}

/// Plans keyed by source signature, destination signature and global shape.
///
/// Lookups happen on every worker of the union with the same key sequence,
/// so hits and misses (and therefore the collective builds) line up.
#[derive(Default)]
pub struct PlanCache {
    plans: HashMap<PlanKey, Arc<ExchangePlan>>,
}

impl PlanCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.plans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }

    /// Return the cached plan, building it collectively on a miss.
    pub async fn get_or_build(
        &mut self,
        src: &WorkerGroup,
        dest: &WorkerGroup,
        global: &[usize],
        config: &ExchangeConfig,
    ) -> Result<Arc<ExchangePlan>> {
        let key = PlanKey {
            src: GroupSignature::of(src),
            dest: GroupSignature::of(dest),
            global: global.to_vec(),
        };
        if let Some(plan) = self.plans.get(&key) {
            return Ok(Arc::clone(plan));
        }
        let plan = Arc::new(ExchangePlan::build(src, dest, global, config.clone()).await?);
        self.plans.insert(key, Arc::clone(&plan));
        Ok(plan)
    }

    pub fn clear(&mut self) {
        self.plans.clear();
    }
}
