//! Explicit record of how stages feed one another.
//!
//! Stages carry their own upstream link; the graph collects started stages of
//! any payload type behind [`StageHandle`], derives the edges, orders them
//! upstream-first and drives whole-chain operations (closing the sources,
//! joining everything).

use crate::pipeline::cancel::CancelToken;
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::id::{EdgeId, StageId};
use crate::pipeline::stage::{Stage, StageDescriptor, StageStats};
use std::collections::{HashMap, VecDeque};

/// Type-erased view of a started stage.
pub trait StageHandle: Send + Sync {
    fn descriptor(&self) -> StageDescriptor;
    fn stats(&self) -> StageStats;
    fn close_input(&self) -> PipelineResult<()>;
    fn join(&self) -> PipelineResult<()>;
}

impl<I, O> StageHandle for Stage<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    fn descriptor(&self) -> StageDescriptor {
        Stage::descriptor(self)
    }

    fn stats(&self) -> StageStats {
        Stage::stats(self)
    }

    fn close_input(&self) -> PipelineResult<()> {
        self.close()
    }

    fn join(&self) -> PipelineResult<()> {
        Stage::join(self)
    }
}

/// A link from an upstream stage's output to a downstream stage's input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub id: EdgeId,
    pub from: StageId,
    pub to: StageId,
}

/// Snapshot of a single stage together with its live counters.
#[derive(Debug, Clone)]
pub struct StageSnapshot {
    pub descriptor: StageDescriptor,
    pub stats: StageStats,
}

/// Complete topology snapshot of the pipeline graph.
#[derive(Debug, Clone)]
pub struct TopologySnapshot {
    pub stages: Vec<StageSnapshot>,
    pub edges: Vec<Edge>,
}

#[derive(Default)]
pub struct PipelineGraph {
    stages: Vec<Box<dyn StageHandle>>,
    index: HashMap<StageId, usize>,
    edges: Vec<Edge>,
}

impl PipelineGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a stage (usually a clone of the caller's handle).
    pub fn add<S>(&mut self, stage: S) -> StageId
    where
        S: StageHandle + 'static,
    {
        let descriptor = stage.descriptor();
        let id = descriptor.id;
        if self.index.contains_key(&id) {
            tracing::warn!("Stage '{}' ({}) is already in the graph", descriptor.name, id);
            return id;
        }

        if let Some(upstream) = descriptor.upstream {
            if self.index.contains_key(&upstream) {
                self.push_edge(upstream, id);
            }
        }
        let downstream: Vec<StageId> = self
            .stages
            .iter()
            .map(|s| s.descriptor())
            .filter(|d| d.upstream == Some(id))
            .map(|d| d.id)
            .collect();
        for to in downstream {
            self.push_edge(id, to);
        }

        self.index.insert(id, self.stages.len());
        self.stages.push(Box::new(stage));
        id
    }

    fn push_edge(&mut self, from: StageId, to: StageId) {
        let id = EdgeId(self.edges.len() as u32);
        self.edges.push(Edge { id, from, to });
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn contains(&self, id: StageId) -> bool {
        self.index.contains_key(&id)
    }

    /// Stages fed externally rather than by another stage.
    pub fn sources(&self) -> Vec<StageId> {
        self.stages
            .iter()
            .map(|s| s.descriptor())
            .filter(|d| d.upstream.is_none())
            .map(|d| d.id)
            .collect()
    }

    /// Stages whose output no registered stage consumes.
    pub fn sinks(&self) -> Vec<StageId> {
        self.stages
            .iter()
            .map(|s| s.descriptor().id)
            .filter(|id| !self.edges.iter().any(|e| e.from == *id))
            .collect()
    }

    /// Upstream-first order (Kahn's algorithm), ties broken by registration order.
    pub fn execution_order(&self) -> Vec<StageId> {
        let n = self.stages.len();
        let mut in_degree = vec![0u32; n];
        let mut adj: Vec<Vec<usize>> = vec![Vec::new(); n];

        for edge in &self.edges {
            if let (Some(&from), Some(&to)) = (self.index.get(&edge.from), self.index.get(&edge.to)) {
                adj[from].push(to);
                in_degree[to] += 1;
            }
        }

        let mut queue: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(n);

        while let Some(idx) = queue.pop_front() {
            order.push(idx);
            for &next in &adj[idx] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    queue.push_back(next);
                }
            }
        }

        // Links always point at an already-started stage, so the graph is acyclic.
        debug_assert_eq!(order.len(), n);

        order
            .into_iter()
            .map(|idx| self.stages[idx].descriptor().id)
            .collect()
    }

    pub fn snapshot(&self) -> TopologySnapshot {
        TopologySnapshot {
            stages: self
                .stages
                .iter()
                .map(|s| StageSnapshot {
                    descriptor: s.descriptor(),
                    stats: s.stats(),
                })
                .collect(),
            edges: self.edges.clone(),
        }
    }

    /// Close the input of every source stage.
    pub fn close_sources(&self) -> PipelineResult<()> {
        let errors: Vec<PipelineError> = self
            .sources()
            .into_iter()
            .filter_map(|id| self.stage(id))
            .filter_map(|stage| stage.close_input().err())
            .collect();
        collapse(errors)
    }

    /// Join every stage upstream-first, collecting all failures.
    pub fn join_all(&self) -> PipelineResult<()> {
        let order = self.execution_order();
        tracing::debug!("Joining {} stage(s)", order.len());

        let errors: Vec<PipelineError> = order
            .into_iter()
            .filter_map(|id| self.stage(id))
            .filter_map(|stage| stage.join().err())
            .collect();
        collapse(errors)
    }

    /// Join every stage sinks-first and fire `cancel` at the first failure.
    ///
    /// A failed downstream stage stops draining its input, which would leave
    /// its upstream blocked on a full queue; cancelling releases it.
    pub fn join_all_or_cancel(&self, cancel: &CancelToken) -> PipelineResult<()> {
        let order = self.execution_order();
        tracing::debug!("Joining {} stage(s), sinks first", order.len());

        let mut errors = Vec::new();
        for stage in order.into_iter().rev().filter_map(|id| self.stage(id)) {
            if let Err(e) = stage.join() {
                if errors.is_empty() {
                    tracing::warn!(
                        "Stage '{}' failed, cancelling the pipeline",
                        stage.descriptor().name
                    );
                    cancel.cancel();
                }
                errors.push(e);
            }
        }
        collapse(errors)
    }

    fn stage(&self, id: StageId) -> Option<&dyn StageHandle> {
        self.index.get(&id).map(|&idx| self.stages[idx].as_ref())
    }
}

fn collapse(mut errors: Vec<PipelineError>) -> PipelineResult<()> {
    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.remove(0)),
        _ => Err(PipelineError::Stages(errors)),
    }
}
