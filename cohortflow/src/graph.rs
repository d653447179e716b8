//! Explicit task graph and run status ledger.
//!
//! The graph is planned once per run from the shard count and the routing
//! decision, so it only ever contains the nodes of the chosen SNP strategy
//! and the chosen gather branch. Edges are typed by the artifact that flows
//! along them.
//!
//! The [`RunLedger`] tracks one status per node. When a node fails, every
//! pending transitive dependent is marked aborted in the same critical
//! section; unrelated siblings are left alone and finish normally.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt::{self, Display};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{TaskError, TaskFailure};
use crate::router::{GatherBranch, RouteDecision};
use crate::task::{ShardIndex, TaskKind};

/// One node in the run graph. Per-shard nodes carry their shard index.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum NodeKey {
    Import(ShardIndex),
    Genotype(ShardIndex),
    HardFilter(ShardIndex),
    SitesOnlyGather,
    IndelModel,
    SnpModel,
    SnpScattered(ShardIndex),
    SnpClassic,
    TrancheGather,
    ApplyIndel(ShardIndex),
    ApplySnp(ShardIndex),
    FinalGather,
    SelectSamples,
    MetricsFull,
    MetricsShard(ShardIndex),
    MetricsGather,
}

impl NodeKey {
    pub fn kind(&self) -> TaskKind {
        match self {
            NodeKey::Import(_) => TaskKind::ImportGvcfs,
            NodeKey::Genotype(_) => TaskKind::GenotypeGvcfs,
            NodeKey::HardFilter(_) => TaskKind::HardFilterAndMakeSitesOnly,
            NodeKey::SitesOnlyGather => TaskKind::SitesOnlyGather,
            NodeKey::IndelModel => TaskKind::IndelsVariantRecalibrator,
            NodeKey::SnpModel => TaskKind::SnpsVariantRecalibratorCreateModel,
            NodeKey::SnpScattered(_) => TaskKind::SnpsVariantRecalibratorScattered,
            NodeKey::SnpClassic => TaskKind::SnpsVariantRecalibratorClassic,
            NodeKey::TrancheGather => TaskKind::GatherTranches,
            NodeKey::ApplyIndel(_) => TaskKind::ApplyIndelRecalibration,
            NodeKey::ApplySnp(_) => TaskKind::ApplySnpRecalibration,
            NodeKey::FinalGather => TaskKind::FinalGatherVcf,
            NodeKey::SelectSamples => TaskKind::SelectSamples,
            NodeKey::MetricsFull => TaskKind::CollectMetricsOnFullVcf,
            NodeKey::MetricsShard(_) => TaskKind::CollectMetricsSharded,
            NodeKey::MetricsGather => TaskKind::GatherMetrics,
        }
    }

    pub fn shard(&self) -> Option<ShardIndex> {
        match self {
            NodeKey::Import(shard)
            | NodeKey::Genotype(shard)
            | NodeKey::HardFilter(shard)
            | NodeKey::SnpScattered(shard)
            | NodeKey::ApplyIndel(shard)
            | NodeKey::ApplySnp(shard)
            | NodeKey::MetricsShard(shard) => Some(*shard),
            _ => None,
        }
    }

    /// Fan-in points where every upstream shard must finish first.
    pub fn is_barrier(&self) -> bool {
        matches!(
            self,
            NodeKey::SitesOnlyGather
                | NodeKey::TrancheGather
                | NodeKey::FinalGather
                | NodeKey::MetricsGather
        )
    }
}

impl Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.shard() {
            Some(shard) => write!(f, "{}[{}]", self.kind(), shard),
            None => write!(f, "{}", self.kind()),
        }
    }
}

/// What flows along an edge.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    Workspace,
    GenotypedVcf,
    FilteredVcf,
    SitesOnlyVcf,
    GatheredSitesOnly,
    IndelModel,
    SnpModelReport,
    SnpRecalibration,
    Tranches,
    IndelRecalibratedVcf,
    RecalibratedVcf,
    MergedVcf,
    Metrics,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub from: NodeKey,
    pub to: NodeKey,
    pub kind: EdgeKind,
}

/// The planned DAG for one run.
#[derive(Clone, Debug, Default)]
pub struct TaskGraph {
    inbound: BTreeMap<NodeKey, Vec<Edge>>,
    outbound: BTreeMap<NodeKey, Vec<NodeKey>>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the graph for `shard_count` shards under `decision`.
    pub fn plan(shard_count: usize, decision: &RouteDecision, select_samples: bool) -> Self {
        let mut graph = Self::new();
        let shards: Vec<ShardIndex> = (0..shard_count).map(ShardIndex).collect();

        for &shard in &shards {
            graph.add_node(NodeKey::Import(shard));
            graph.add_edge(NodeKey::Import(shard), NodeKey::Genotype(shard), EdgeKind::Workspace);
            graph.add_edge(
                NodeKey::Genotype(shard),
                NodeKey::HardFilter(shard),
                EdgeKind::GenotypedVcf,
            );
            graph.add_edge(
                NodeKey::HardFilter(shard),
                NodeKey::SitesOnlyGather,
                EdgeKind::SitesOnlyVcf,
            );
        }
        graph.add_node(NodeKey::SitesOnlyGather);

        graph.add_edge(
            NodeKey::SitesOnlyGather,
            NodeKey::IndelModel,
            EdgeKind::GatheredSitesOnly,
        );
        if decision.train_model {
            graph.add_edge(
                NodeKey::SitesOnlyGather,
                NodeKey::SnpModel,
                EdgeKind::GatheredSitesOnly,
            );
            for &shard in &shards {
                graph.add_edge(
                    NodeKey::SnpModel,
                    NodeKey::SnpScattered(shard),
                    EdgeKind::SnpModelReport,
                );
                graph.add_edge(
                    NodeKey::HardFilter(shard),
                    NodeKey::SnpScattered(shard),
                    EdgeKind::SitesOnlyVcf,
                );
                graph.add_edge(
                    NodeKey::SnpScattered(shard),
                    NodeKey::TrancheGather,
                    EdgeKind::Tranches,
                );
            }
            graph.add_node(NodeKey::TrancheGather);
        } else {
            graph.add_edge(
                NodeKey::SitesOnlyGather,
                NodeKey::SnpClassic,
                EdgeKind::GatheredSitesOnly,
            );
        }

        for &shard in &shards {
            graph.add_edge(
                NodeKey::HardFilter(shard),
                NodeKey::ApplyIndel(shard),
                EdgeKind::FilteredVcf,
            );
            graph.add_edge(NodeKey::IndelModel, NodeKey::ApplyIndel(shard), EdgeKind::IndelModel);
            graph.add_edge(
                NodeKey::ApplyIndel(shard),
                NodeKey::ApplySnp(shard),
                EdgeKind::IndelRecalibratedVcf,
            );
            if decision.train_model {
                graph.add_edge(
                    NodeKey::SnpScattered(shard),
                    NodeKey::ApplySnp(shard),
                    EdgeKind::SnpRecalibration,
                );
                graph.add_edge(NodeKey::TrancheGather, NodeKey::ApplySnp(shard), EdgeKind::Tranches);
            } else {
                graph.add_edge(
                    NodeKey::SnpClassic,
                    NodeKey::ApplySnp(shard),
                    EdgeKind::SnpRecalibration,
                );
            }
        }

        match decision.gather {
            GatherBranch::Small => {
                for &shard in &shards {
                    graph.add_edge(
                        NodeKey::ApplySnp(shard),
                        NodeKey::FinalGather,
                        EdgeKind::RecalibratedVcf,
                    );
                }
                graph.add_node(NodeKey::FinalGather);
                graph.add_edge(NodeKey::FinalGather, NodeKey::MetricsFull, EdgeKind::MergedVcf);
                if select_samples {
                    graph.add_edge(
                        NodeKey::FinalGather,
                        NodeKey::SelectSamples,
                        EdgeKind::MergedVcf,
                    );
                }
            }
            GatherBranch::NonSmall => {
                for &shard in &shards {
                    graph.add_edge(
                        NodeKey::ApplySnp(shard),
                        NodeKey::MetricsShard(shard),
                        EdgeKind::RecalibratedVcf,
                    );
                    graph.add_edge(
                        NodeKey::MetricsShard(shard),
                        NodeKey::MetricsGather,
                        EdgeKind::Metrics,
                    );
                }
                graph.add_node(NodeKey::MetricsGather);
            }
        }

        graph
    }

    pub fn add_node(&mut self, node: NodeKey) {
        self.inbound.entry(node).or_default();
        self.outbound.entry(node).or_default();
    }

    pub fn add_edge(&mut self, from: NodeKey, to: NodeKey, kind: EdgeKind) {
        self.add_node(from);
        self.add_node(to);
        self.inbound.entry(to).or_default().push(Edge { from, to, kind });
        let targets = self.outbound.entry(from).or_default();
        if !targets.contains(&to) {
            targets.push(to);
        }
    }

    pub fn contains(&self, node: NodeKey) -> bool {
        self.inbound.contains_key(&node)
    }

    pub fn len(&self) -> usize {
        self.inbound.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inbound.is_empty()
    }

    pub fn nodes(&self) -> impl Iterator<Item = NodeKey> + '_ {
        self.inbound.keys().copied()
    }

    pub fn inbound_edges(&self, node: NodeKey) -> &[Edge] {
        self.inbound.get(&node).map(Vec::as_slice).unwrap_or_default()
    }

    /// Direct upstream nodes, deduplicated.
    pub fn dependencies(&self, node: NodeKey) -> Vec<NodeKey> {
        let deps: BTreeSet<NodeKey> = self.inbound_edges(node).iter().map(|e| e.from).collect();
        deps.into_iter().collect()
    }

    pub fn dependents(&self, node: NodeKey) -> &[NodeKey] {
        self.outbound.get(&node).map(Vec::as_slice).unwrap_or_default()
    }

    /// Every node reachable downstream of `node`, excluding `node` itself.
    pub fn transitive_dependents(&self, node: NodeKey) -> BTreeSet<NodeKey> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<NodeKey> = self.dependents(node).iter().copied().collect();
        while let Some(next) = queue.pop_front() {
            if seen.insert(next) {
                queue.extend(self.dependents(next).iter().copied());
            }
        }
        seen
    }

    /// Number of nodes that run the given tool.
    pub fn count_kind(&self, kind: TaskKind) -> usize {
        self.nodes().filter(|node| node.kind() == kind).count()
    }

    /// Kahn's algorithm over the ordered node set, so the result is stable.
    pub fn topological_order(&self) -> Vec<NodeKey> {
        let mut in_degree: BTreeMap<NodeKey, usize> = self
            .inbound
            .keys()
            .map(|node| (*node, self.dependencies(*node).len()))
            .collect();
        let mut ready: VecDeque<NodeKey> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(node, _)| *node)
            .collect();
        let mut order = Vec::with_capacity(self.len());

        while let Some(node) = ready.pop_front() {
            order.push(node);
            for dependent in self.dependents(node) {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push_back(*dependent);
                    }
                }
            }
        }
        order
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    /// An upstream node failed.
    Aborted,
    /// Never started; the run ended first.
    Skipped,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, NodeStatus::Pending | NodeStatus::Running)
    }
}

#[derive(Debug, Default)]
struct LedgerState {
    statuses: BTreeMap<NodeKey, NodeStatus>,
    failures: Vec<TaskFailure>,
    aborted_by: BTreeMap<NodeKey, NodeKey>,
}

/// Shared status ledger over a [`TaskGraph`]. Cloning shares the state.
#[derive(Clone)]
pub struct RunLedger {
    graph: Arc<TaskGraph>,
    state: Arc<Mutex<LedgerState>>,
}

impl fmt::Debug for RunLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("RunLedger");
        debug.field("nodes", &self.graph.len());
        match self.state.try_lock() {
            Some(state) => {
                debug.field("failures", &state.failures.len());
            }
            None => {
                debug.field("failures", &"<locked>");
            }
        }
        debug.finish_non_exhaustive()
    }
}

impl RunLedger {
    pub fn new(graph: TaskGraph) -> Self {
        let statuses = graph.nodes().map(|node| (node, NodeStatus::Pending)).collect();
        Self {
            graph: Arc::new(graph),
            state: Arc::new(Mutex::new(LedgerState {
                statuses,
                ..LedgerState::default()
            })),
        }
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    pub fn status(&self, node: NodeKey) -> Option<NodeStatus> {
        self.state.lock().statuses.get(&node).copied()
    }

    /// Pending with every dependency succeeded.
    pub fn is_ready(&self, node: NodeKey) -> bool {
        let state = self.state.lock();
        state.statuses.get(&node) == Some(&NodeStatus::Pending)
            && self
                .graph
                .dependencies(node)
                .iter()
                .all(|dep| state.statuses.get(dep) == Some(&NodeStatus::Succeeded))
    }

    /// The failed node that caused `node` to be aborted, if any.
    pub fn aborted_by(&self, node: NodeKey) -> Option<NodeKey> {
        self.state.lock().aborted_by.get(&node).copied()
    }

    /// Move a pending node to running. Returns false if the node is unknown
    /// or no longer pending (for example aborted by an upstream failure).
    pub fn mark_running(&self, node: NodeKey) -> bool {
        let mut state = self.state.lock();
        match state.statuses.get_mut(&node) {
            Some(status) if *status == NodeStatus::Pending => {
                *status = NodeStatus::Running;
                true
            }
            _ => false,
        }
    }

    pub fn mark_succeeded(&self, node: NodeKey) {
        if let Some(status) = self.state.lock().statuses.get_mut(&node) {
            *status = NodeStatus::Succeeded;
        }
    }

    /// Record a fatal failure and abort every pending transitive dependent.
    /// Returns the nodes aborted by this call.
    pub fn mark_failed(&self, node: NodeKey, error: TaskError) -> Vec<NodeKey> {
        let downstream = self.graph.transitive_dependents(node);
        let mut state = self.state.lock();
        if let Some(status) = state.statuses.get_mut(&node) {
            *status = NodeStatus::Failed;
        }
        state.failures.push(TaskFailure { node, error });

        let mut aborted = Vec::new();
        for dependent in downstream {
            if let Some(status) = state.statuses.get_mut(&dependent)
                && *status == NodeStatus::Pending
            {
                *status = NodeStatus::Aborted;
                aborted.push(dependent);
            }
        }
        for dependent in &aborted {
            state.aborted_by.insert(*dependent, node);
        }
        aborted
    }

    /// Mark every node still pending as skipped. Used when a run stops early.
    pub fn skip_pending(&self) -> Vec<NodeKey> {
        let mut state = self.state.lock();
        let mut skipped = Vec::new();
        for (node, status) in state.statuses.iter_mut() {
            if *status == NodeStatus::Pending {
                *status = NodeStatus::Skipped;
                skipped.push(*node);
            }
        }
        skipped
    }

    pub fn failures(&self) -> Vec<TaskFailure> {
        self.state.lock().failures.clone()
    }

    pub fn has_failures(&self) -> bool {
        !self.state.lock().failures.is_empty()
    }

    pub fn report(&self) -> RunReport {
        let state = self.state.lock();
        let nodes: Vec<NodeReport> = self
            .graph
            .topological_order()
            .into_iter()
            .map(|node| NodeReport {
                node,
                label: node.to_string(),
                status: state
                    .statuses
                    .get(&node)
                    .copied()
                    .unwrap_or(NodeStatus::Pending),
                aborted_by: state.aborted_by.get(&node).copied(),
            })
            .collect();

        let count = |wanted: NodeStatus| nodes.iter().filter(|n| n.status == wanted).count();
        RunReport {
            succeeded: count(NodeStatus::Succeeded),
            failed: count(NodeStatus::Failed),
            aborted: count(NodeStatus::Aborted),
            skipped: count(NodeStatus::Skipped),
            failures: state.failures.clone(),
            nodes,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct NodeReport {
    pub node: NodeKey,
    pub label: String,
    pub status: NodeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aborted_by: Option<NodeKey>,
}

/// Final per-node status of a run.
#[derive(Clone, Debug, Serialize)]
pub struct RunReport {
    pub succeeded: usize,
    pub failed: usize,
    pub aborted: usize,
    pub skipped: usize,
    pub failures: Vec<TaskFailure>,
    pub nodes: Vec<NodeReport>,
}

impl RunReport {
    pub fn status_of(&self, node: NodeKey) -> Option<NodeStatus> {
        self.nodes.iter().find(|n| n.node == node).map(|n| n.status)
    }

    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.aborted == 0 && self.skipped == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::route;

    fn permanent(node: NodeKey) -> TaskError {
        TaskError::Permanent {
            task: node.to_string(),
            message: "boom".to_string(),
        }
    }

    #[test]
    fn test_small_cohort_graph_shape() {
        let graph = TaskGraph::plan(3, &route(500), false);

        assert_eq!(graph.count_kind(TaskKind::ImportGvcfs), 3);
        assert_eq!(graph.count_kind(TaskKind::SnpsVariantRecalibratorClassic), 1);
        assert_eq!(graph.count_kind(TaskKind::SnpsVariantRecalibratorCreateModel), 0);
        assert_eq!(graph.count_kind(TaskKind::FinalGatherVcf), 1);
        assert_eq!(graph.count_kind(TaskKind::CollectMetricsSharded), 0);
        assert!(!graph.contains(NodeKey::SelectSamples));
        assert_eq!(graph.dependencies(NodeKey::SitesOnlyGather).len(), 3);
    }

    #[test]
    fn test_large_cohort_graph_shape() {
        let graph = TaskGraph::plan(4, &route(12000), false);

        assert_eq!(graph.count_kind(TaskKind::SnpsVariantRecalibratorCreateModel), 1);
        assert_eq!(graph.count_kind(TaskKind::SnpsVariantRecalibratorScattered), 4);
        assert_eq!(graph.count_kind(TaskKind::GatherTranches), 1);
        assert_eq!(graph.count_kind(TaskKind::SnpsVariantRecalibratorClassic), 0);
        assert_eq!(graph.count_kind(TaskKind::CollectMetricsSharded), 4);
        assert_eq!(graph.count_kind(TaskKind::GatherMetrics), 1);
        assert_eq!(graph.count_kind(TaskKind::FinalGatherVcf), 0);

        let apply_snp = graph.dependencies(NodeKey::ApplySnp(ShardIndex(2)));
        assert!(apply_snp.contains(&NodeKey::ApplyIndel(ShardIndex(2))));
        assert!(apply_snp.contains(&NodeKey::SnpScattered(ShardIndex(2))));
        assert!(apply_snp.contains(&NodeKey::TrancheGather));
    }

    #[test]
    fn test_apply_indel_does_not_wait_for_snp_model() {
        let graph = TaskGraph::plan(2, &route(12000), false);
        let deps = graph.dependencies(NodeKey::ApplyIndel(ShardIndex(0)));
        assert_eq!(
            deps,
            vec![NodeKey::HardFilter(ShardIndex(0)), NodeKey::IndelModel]
        );
    }

    #[test]
    fn test_topological_order_respects_edges() {
        let graph = TaskGraph::plan(3, &route(2000), false);
        let order = graph.topological_order();
        assert_eq!(order.len(), graph.len());

        let position: BTreeMap<NodeKey, usize> =
            order.iter().enumerate().map(|(i, n)| (*n, i)).collect();
        for node in graph.nodes() {
            for edge in graph.inbound_edges(node) {
                assert!(position[&edge.from] < position[&edge.to], "{edge:?}");
            }
        }
    }

    #[test]
    fn test_failure_aborts_only_transitive_dependents() {
        let graph = TaskGraph::plan(3, &route(2000), false);
        let ledger = RunLedger::new(graph);
        let failed = NodeKey::ApplySnp(ShardIndex(1));

        assert!(ledger.mark_running(failed));
        let aborted = ledger.mark_failed(failed, permanent(failed));

        assert_eq!(
            aborted,
            vec![NodeKey::MetricsShard(ShardIndex(1)), NodeKey::MetricsGather]
        );
        // Sibling shards keep going.
        assert_eq!(
            ledger.status(NodeKey::ApplySnp(ShardIndex(0))),
            Some(NodeStatus::Pending)
        );
        assert_eq!(
            ledger.status(NodeKey::MetricsShard(ShardIndex(2))),
            Some(NodeStatus::Pending)
        );
        assert_eq!(ledger.aborted_by(NodeKey::MetricsGather), Some(failed));
        assert!(!ledger.mark_running(NodeKey::MetricsGather));
    }

    #[test]
    fn test_is_ready_tracks_dependencies() {
        let ledger = RunLedger::new(TaskGraph::plan(1, &route(10), false));
        let import = NodeKey::Import(ShardIndex(0));
        let genotype = NodeKey::Genotype(ShardIndex(0));

        assert!(ledger.is_ready(import));
        assert!(!ledger.is_ready(genotype));

        ledger.mark_running(import);
        ledger.mark_succeeded(import);
        assert!(ledger.is_ready(genotype));
    }

    #[test]
    fn test_report_counts() {
        let ledger = RunLedger::new(TaskGraph::plan(2, &route(10), true));
        let sites = NodeKey::SitesOnlyGather;
        ledger.mark_running(sites);
        ledger.mark_failed(sites, permanent(sites));
        let skipped = ledger.skip_pending();

        let report = ledger.report();
        assert_eq!(report.failed, 1);
        assert!(report.aborted > 0);
        assert_eq!(report.skipped, skipped.len());
        assert_eq!(report.status_of(NodeKey::SelectSamples), Some(NodeStatus::Aborted));
        assert_eq!(report.failures.len(), 1);
        assert!(!report.is_clean());
    }
}
