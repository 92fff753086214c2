//! Static scheduling of circuit execution.
//!
//! A valid schedule evaluates each node exactly once, after all of its
//! upstream nodes.  Sinks are split out of the main order: they fire only
//! after the whole step has been evaluated and committed, in registration
//! order.

use crate::circuit::NodeId;
use petgraph::{algo::toposort, graph::DiGraph};

pub(crate) struct Schedule {
    /// Non-sink nodes in topological order.
    order: Vec<NodeId>,
    /// Sink nodes in registration order.
    sinks: Vec<NodeId>,
}

impl Schedule {
    /// Compute a schedule for a circuit with `node_count` nodes and the given
    /// edges.
    ///
    /// The construction API only wires operators to streams that already
    /// exist, so the graph is acyclic by construction; a cycle here would be
    /// a bug in the circuit builder.
    pub(crate) fn prepare(
        node_count: usize,
        edges: &[(NodeId, NodeId)],
        is_sink: impl Fn(NodeId) -> bool,
    ) -> Self {
        let mut graph = DiGraph::<usize, ()>::with_capacity(node_count, edges.len());
        let indices: Vec<_> = (0..node_count).map(|n| graph.add_node(n)).collect();
        for &(from, to) in edges {
            graph.add_edge(indices[from.0], indices[to.0], ());
        }

        let sorted = toposort(&graph, None).expect("operator graph is acyclic by construction");

        let order = sorted
            .into_iter()
            .map(|index| NodeId(graph[index]))
            .filter(|&id| !is_sink(id))
            .collect();
        let sinks = (0..node_count).map(NodeId).filter(|&id| is_sink(id)).collect();

        Self { order, sinks }
    }

    pub(crate) fn order(&self) -> &[NodeId] {
        &self.order
    }

    pub(crate) fn sinks(&self) -> &[NodeId] {
        &self.sinks
    }
}
