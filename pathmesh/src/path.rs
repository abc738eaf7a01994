// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! Critical path value types.
//!
//! Two representations exist on purpose: [`CriticalPath`] is the composable
//! tree produced by reconstruction, and [`Path`] is the flat wire form carried
//! between tiers in RPC metadata. They are joined by one pure conversion,
//! [`crate::codec::flatten`].

use faststr::FastStr;
use serde::{Deserialize, Serialize};

/// Source label for remote time the callee's own instrumentation never saw
/// (network, queueing, uninstrumented callees).
pub const UNATTRIBUTED_REMOTE_SOURCE: &str = "remote";

/// Source label for the portion of an RPC hidden behind local CPU overlap.
pub const RPC_GAP_SOURCE: &str = "rpc-gap";

/// Name of the synthetic node that buckets unexplained scheduling gaps.
pub const FRAMEWORK_NODE_NAME: &str = "<framework>";

pub(crate) fn nanos_to_secs(nanos: u64) -> f64 {
    nanos as f64 / 1_000_000_000.0
}

pub(crate) fn secs_to_nanos(secs: f64) -> u64 {
    (secs * 1_000_000_000.0).round() as u64
}

/// One element of a flat wire path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathElement {
    /// Slash-delimited hierarchical source label, e.g. `/GetGraph/fetch/remote`.
    pub source: String,
    /// Cost attributed to the label, in seconds.
    pub cost_secs: f64,
}

impl PathElement {
    /// Creates an element attributing `cost_secs` to `source`.
    pub fn new(source: impl Into<String>, cost_secs: f64) -> Self {
        Self {
            source: source.into(),
            cost_secs,
        }
    }
}

/// Ordered, flat, wire-transportable critical path.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Path {
    /// The path's elements, in pre-order of the tree they were flattened from.
    pub elements: Vec<PathElement>,
}

impl Path {
    /// Creates a path from flat elements.
    pub fn new(elements: Vec<PathElement>) -> Self {
        Self { elements }
    }

    /// Creates a path holding a single element.
    pub fn single(source: impl Into<String>, cost_secs: f64) -> Self {
        Self::new(vec![PathElement::new(source, cost_secs)])
    }

    /// Returns true when the path carries no elements.
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Total cost over all elements, in nanoseconds.
    pub fn total_cost_nanos(&self) -> u64 {
        self.elements.iter().map(|e| secs_to_nanos(e.cost_secs)).sum()
    }
}

/// Node of a composable critical path tree.
#[derive(Debug, Clone, PartialEq)]
pub struct PathNode {
    /// The node's path segment label.
    pub name: FastStr,
    /// CPU time attributed to the node, in nanoseconds.
    pub cpu_nanos: u64,
    /// Wall latency attributed to the node, in nanoseconds.
    pub latency_nanos: u64,
    /// Same-process child path.
    pub child_path: CriticalPath,
    /// Paths received from other processes; leaves of the local tree.
    pub child_remote_paths: Vec<Path>,
}

impl PathNode {
    /// Creates a leaf node with no children.
    pub fn new(name: impl Into<FastStr>, cpu_nanos: u64, latency_nanos: u64) -> Self {
        Self {
            name: name.into(),
            cpu_nanos,
            latency_nanos,
            child_path: CriticalPath::empty(),
            child_remote_paths: Vec::new(),
        }
    }

    /// Attaches a same-process child path.
    pub fn with_child_path(mut self, child_path: CriticalPath) -> Self {
        self.child_path = child_path;
        self
    }

    /// Attaches paths received from other processes.
    pub fn with_child_remote_paths(mut self, child_remote_paths: Vec<Path>) -> Self {
        self.child_remote_paths = child_remote_paths;
        self
    }
}

/// A critical path tree where each node has a unique name.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CriticalPath {
    /// The path's nodes, source to sink; a terminal synthetic node may follow.
    pub nodes: Vec<PathNode>,
}

impl CriticalPath {
    /// Returns an empty critical path.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Returns a critical path with a single node.
    pub fn single(node: PathNode) -> Self {
        Self { nodes: vec![node] }
    }

    /// Returns a critical path with a list of nodes.
    pub fn new(nodes: Vec<PathNode>) -> Self {
        Self { nodes }
    }

    /// Returns true when the path carries no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_cost_sums_elements() {
        let path = Path::new(vec![PathElement::new("/a", 0.25), PathElement::new("/a/b", 0.5)]);
        assert_eq!(path.total_cost_nanos(), 750_000_000);
        assert!(!path.is_empty());
        assert!(Path::default().is_empty());
    }

    #[test]
    fn unit_conversions_round_trip() {
        assert_eq!(secs_to_nanos(nanos_to_secs(123_456_789)), 123_456_789);
        assert_eq!(secs_to_nanos(0.0), 0);
    }
}
