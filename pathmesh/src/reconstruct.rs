// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! Backward critical path reconstruction.
//!
//! Runs once per request, synchronously, after the relevant tasks are known
//! complete. The algorithm assumes one logical causal thread per request:
//! every task was blocked either on the request thread executing a previously
//! scheduled task, or on an RPC returning. True intra-task parallelism is not
//! modeled.

use crate::ledger::RemoteChildLedger;
use crate::monitor::{ExecutionOrderTracker, TaskTimingRecorder};
use crate::path::{
    nanos_to_secs, CriticalPath, Path, PathNode, FRAMEWORK_NODE_NAME, RPC_GAP_SOURCE,
};
use crate::token::TaskToken;
use faststr::FastStr;
use tracing::error;

/// Reconstructs the critical path of one finished request from the recorders
/// the request scope accumulated.
pub struct PathReconstructor<'a> {
    scope: FastStr,
    order: &'a ExecutionOrderTracker,
    timing: &'a TaskTimingRecorder,
    ledger: &'a RemoteChildLedger,
}

impl<'a> PathReconstructor<'a> {
    /// Creates a reconstructor over one request's recorders.
    pub fn new(
        scope: FastStr,
        order: &'a ExecutionOrderTracker,
        timing: &'a TaskTimingRecorder,
        ledger: &'a RemoteChildLedger,
    ) -> Self {
        Self {
            scope,
            order,
            timing,
            ledger,
        }
    }

    /// Runs the backward reconstruction.
    ///
    /// Returns a tree with a single root named after the request scope whose
    /// child path lists the critical tasks source-to-sink, each carrying the
    /// reconciled remote sub-paths of its token. An empty or never-started
    /// execution order yields an empty path and an error log; it indicates
    /// the scheduler observer was never wired, not a caller mistake.
    pub fn reconstruct(&self) -> CriticalPath {
        let order = self.order.execution_order();
        if order.is_empty() {
            error!(
                "[PATHMESH] empty execution order for scope {}; scheduler observer not wired",
                self.scope
            );
            return CriticalPath::empty();
        }

        // The sink is the most recently started node; unstarted trailing
        // nodes carry no information.
        let Some(sink_index) = (0..order.len()).rev().find(|&i| self.timing.is_started(&order[i])) else {
            error!(
                "[PATHMESH] no task in scope {} ever started; timing recorder not wired",
                self.scope
            );
            return CriticalPath::empty();
        };
        let sink = &order[sink_index];

        let rpc_completion_order = self.rpc_nodes_by_end_time(&order[..sink_index]);
        let chain = self.backward_walk(&order, sink_index, &rpc_completion_order);
        let nodes = self.attribute_latency(&chain);

        CriticalPath::single(
            PathNode::new(self.scope.clone(), 0, self.timing.end_time(sink))
                .with_child_path(CriticalPath::new(nodes)),
        )
    }

    /// RPC nodes among `prefix`, ascending by end time.
    fn rpc_nodes_by_end_time(&self, prefix: &[TaskToken]) -> Vec<TaskToken> {
        let mut nodes: Vec<TaskToken> = prefix
            .iter()
            .filter(|token| self.ledger.is_rpc_node(token))
            .cloned()
            .collect();
        nodes.sort_by_key(|token| self.timing.end_time(token));
        nodes
    }

    /// Walks backward from the sink, at each step choosing between the
    /// nearest preceding task and the most recent RPC node finishing at or
    /// before the current path start: whichever finished closer to that start
    /// is the true blocking cause. Returns the chain sink-first.
    fn backward_walk(
        &self,
        order: &[TaskToken],
        sink_index: usize,
        rpc_completion_order: &[TaskToken],
    ) -> Vec<TaskToken> {
        let mut chain = vec![order[sink_index].clone()];
        let mut index = sink_index;
        let mut rpc_index = rpc_completion_order.len() as isize - 1;
        let mut critical_start = self.timing.start_time(&order[sink_index]) as i64;

        while index > 0 {
            index -= 1;
            let mut current = &order[index];
            if !self.timing.is_known(current) {
                error!("[PATHMESH] no timing recorded for {current}; skipping");
                continue;
            }
            if !self.timing.is_started(current) {
                error!("[PATHMESH] {current} appears in execution order but never started; skipping");
                continue;
            }

            let cpu_finish =
                (self.timing.start_time(current) + self.timing.cpu_duration(current)) as i64;
            // A negative slack means the candidate was still on CPU after the
            // current path start; the blocking cause must have finished at or
            // before the start it explains, so such a candidate is ineligible.
            let cpu_slack = match critical_start - cpu_finish {
                slack if slack < 0 => i64::MAX,
                slack => slack,
            };

            let mut rpc_slack = i64::MAX;
            let mut rpc_token = None;
            while rpc_index >= 0 {
                let candidate = &rpc_completion_order[rpc_index as usize];
                let end = self.timing.end_time(candidate) as i64;
                if end <= critical_start {
                    rpc_slack = critical_start - end;
                    rpc_token = Some(candidate);
                    break;
                }
                rpc_index -= 1;
            }

            // Ties favor the immediately preceding task.
            if let Some(rpc) = rpc_token {
                if rpc_slack < cpu_slack {
                    while index > 0 && &order[index] != rpc {
                        index -= 1;
                    }
                    current = &order[index];
                }
            }

            critical_start = self.timing.start_time(current) as i64;
            chain.push(current.clone());
        }
        chain
    }

    /// Attributes latency walking sink to source, then reverses the chain
    /// into source-to-sink order with any residual scheduling gap bucketed in
    /// a terminal synthetic node.
    fn attribute_latency(&self, chain: &[TaskToken]) -> Vec<PathNode> {
        let mut nodes = Vec::with_capacity(chain.len() + 1);
        let mut framework_nanos: i64 = 0;
        let mut sinkward_start: Option<u64> = None;

        for token in chain {
            let start = self.timing.start_time(token);
            let end = self.timing.end_time(token);
            let cpu = self.timing.cpu_duration(token);

            let (latency, child_remote_paths) = match sinkward_start {
                // The first node of the walk is the sink; nothing bounds it
                // from above, so it takes its own wall latency.
                None => (self.timing.wall_latency(token), self.ledger.paths_for(token)),
                Some(next_start) => {
                    let effective_end = next_start.min(end);
                    let latency = effective_end.saturating_sub(start);
                    framework_nanos += next_start as i64 - effective_end as i64;

                    // An RPC node whose end passes the sink-ward start was
                    // picked on CPU slack; its recorded remote time did not
                    // bound the path, only the slice between its CPU finish
                    // and the next start did.
                    let children = if self.ledger.is_rpc_node(token) && end > next_start {
                        let gap = next_start as i64 - (start + cpu) as i64;
                        if gap > 0 {
                            vec![Path::single(RPC_GAP_SOURCE, nanos_to_secs(gap as u64))]
                        } else {
                            Vec::new()
                        }
                    } else {
                        self.ledger.paths_for(token)
                    };
                    (latency, children)
                },
            };

            nodes.push(
                PathNode::new(token.name(), cpu.min(latency), latency)
                    .with_child_remote_paths(child_remote_paths),
            );
            sinkward_start = Some(start);
        }

        nodes.reverse();
        if framework_nanos > 0 {
            nodes.push(PathNode::new(
                FastStr::from_static_str(FRAMEWORK_NODE_NAME),
                framework_nanos as u64,
                framework_nanos as u64,
            ));
        }
        nodes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualTicker;
    use crate::monitor::{GraphMonitor, SchedulerObserver};
    use crate::token::TaskOutcome;
    use std::sync::Arc;
    use std::time::Duration;

    const MS: u64 = 1_000_000;

    struct Harness {
        ticker: Arc<ManualTicker>,
        monitor: GraphMonitor,
        ledger: RemoteChildLedger,
    }

    impl Harness {
        fn new() -> Self {
            let ticker = Arc::new(ManualTicker::new());
            let monitor = GraphMonitor::new(ticker.clone());
            Self {
                ticker,
                monitor,
                ledger: RemoteChildLedger::new(),
            }
        }

        fn token(&self, name: &str, id: u32) -> TaskToken {
            TaskToken::new("Graph", name.to_owned(), id)
        }

        /// Plays a task that starts at `start`, finishes CPU at `cpu_finish`
        /// and completes at `end` (all in milliseconds). Out-of-order play is
        /// handled by the monotonic manual ticker only moving forward, so
        /// tests must play events in time order.
        fn start(&self, token: &TaskToken, at_ms: u64) {
            self.ticker.set_nanos(at_ms * MS);
            self.monitor.on_start(token);
        }

        fn finish_cpu(&self, token: &TaskToken, at_ms: u64) {
            self.ticker.set_nanos(at_ms * MS);
            self.monitor.on_finish_executing(token);
        }

        fn complete(&self, token: &TaskToken, at_ms: u64) {
            self.ticker.set_nanos(at_ms * MS);
            self.monitor.on_complete(token, TaskOutcome::Succeeded);
        }

        fn reconstruct(&self) -> CriticalPath {
            PathReconstructor::new(
                FastStr::from_static_str("Graph"),
                self.monitor.order(),
                self.monitor.timing(),
                &self.ledger,
            )
            .reconstruct()
        }

        fn chain_names(&self, path: &CriticalPath) -> Vec<String> {
            path.nodes[0]
                .child_path
                .nodes
                .iter()
                .map(|n| n.name.to_string())
                .collect()
        }
    }

    #[test]
    fn empty_order_yields_empty_path() {
        let harness = Harness::new();
        assert!(harness.reconstruct().is_empty());
    }

    #[test]
    fn single_task_yields_single_node_with_cpu_cost() {
        let harness = Harness::new();
        let work = harness.token("work", 0);
        harness.start(&work, 1);
        harness.finish_cpu(&work, 11);
        harness.complete(&work, 11);

        let path = harness.reconstruct();
        assert_eq!(path.nodes.len(), 1);
        let root = &path.nodes[0];
        assert_eq!(&*root.name, "Graph");
        assert_eq!(root.cpu_nanos, 0);
        assert_eq!(root.child_path.nodes.len(), 1);
        let node = &root.child_path.nodes[0];
        assert_eq!(&*node.name, "work");
        assert_eq!(node.cpu_nanos, 10 * MS);
        assert_eq!(node.latency_nanos, 10 * MS);
        assert!(node.child_remote_paths.is_empty());
    }

    #[test]
    fn rpc_node_with_smaller_slack_wins_over_preceding_task() {
        // X runs [0, 10ms] of CPU; Y is an RPC node [2ms, 8ms]; the sink Z
        // starts at 9ms. X's CPU finish (10ms) postdates Z's start, so X is
        // ineligible; Y's end-based slack of 1ms wins.
        let harness = Harness::new();
        let x = harness.token("x", 0);
        let y = harness.token("y", 1);
        let z = harness.token("z", 2);
        harness.ledger.record_rpc_issued(&y);

        harness.start(&x, 0);
        harness.start(&y, 2);
        harness.finish_cpu(&y, 3);
        harness.complete(&y, 8);
        harness.start(&z, 9);
        harness.finish_cpu(&x, 10);
        harness.complete(&x, 10);
        harness.finish_cpu(&z, 20);
        harness.complete(&z, 20);

        let path = harness.reconstruct();
        assert_eq!(harness.chain_names(&path), vec!["x", "y", "z"]);
    }

    #[test]
    fn preceding_task_wins_when_its_cpu_slack_is_smaller() {
        let harness = Harness::new();
        let rpc = harness.token("rpc", 0);
        let near = harness.token("near", 1);
        let sink = harness.token("sink", 2);
        harness.ledger.record_rpc_issued(&rpc);

        harness.start(&rpc, 0);
        harness.finish_cpu(&rpc, 1);
        harness.start(&near, 2);
        harness.complete(&rpc, 5);
        harness.finish_cpu(&near, 8);
        harness.complete(&near, 8);
        harness.start(&sink, 9);
        harness.finish_cpu(&sink, 12);
        harness.complete(&sink, 12);

        // near's cpu slack is 1ms; rpc's end slack is 4ms; near is the
        // sink's predecessor and rpc only follows further down the chain.
        let path = harness.reconstruct();
        assert_eq!(harness.chain_names(&path), vec!["rpc", "near", "sink"]);
    }

    #[test]
    fn unstarted_trailing_tasks_are_skipped_for_sink_selection() {
        let harness = Harness::new();
        let work = harness.token("work", 0);
        harness.start(&work, 1);
        harness.finish_cpu(&work, 3);
        harness.complete(&work, 3);
        // A token that reached the order tracker but never the timing
        // recorder, e.g. a scheduling wiring defect.
        let ghost = harness.token("ghost", 1);
        harness.monitor.order().on_start(&ghost);

        let path = harness.reconstruct();
        assert_eq!(harness.chain_names(&path), vec!["work"]);
    }

    #[test]
    fn latency_is_bounded_by_successor_start() {
        let harness = Harness::new();
        let early = harness.token("early", 0);
        let late = harness.token("late", 1);

        harness.start(&early, 0);
        harness.finish_cpu(&early, 4);
        harness.start(&late, 4);
        harness.complete(&early, 6);
        harness.finish_cpu(&late, 10);
        harness.complete(&late, 10);

        let path = harness.reconstruct();
        let nodes = &path.nodes[0].child_path.nodes;
        assert_eq!(&*nodes[0].name, "early");
        // early ran until 6ms but late started at 4ms; only [0, 4ms) counts.
        assert_eq!(nodes[0].latency_nanos, 4 * MS);
        assert_eq!(nodes[1].latency_nanos, 6 * MS);
    }

    #[test]
    fn scheduling_gap_is_bucketed_into_a_framework_node() {
        let harness = Harness::new();
        let first = harness.token("first", 0);
        let second = harness.token("second", 1);

        harness.start(&first, 0);
        harness.finish_cpu(&first, 2);
        harness.complete(&first, 2);
        // 3ms of unexplained scheduling delay before the sink starts.
        harness.start(&second, 5);
        harness.finish_cpu(&second, 9);
        harness.complete(&second, 9);

        let path = harness.reconstruct();
        let nodes = &path.nodes[0].child_path.nodes;
        assert_eq!(nodes.len(), 3);
        let framework = &nodes[2];
        assert_eq!(&*framework.name, FRAMEWORK_NODE_NAME);
        assert_eq!(framework.latency_nanos, 3 * MS);
    }

    #[test]
    fn rpc_node_picked_on_cpu_slack_gets_a_gap_element() {
        // The RPC node keeps running past the sink's start; it was picked for
        // its CPU share, so its remote paths are replaced by the gap between
        // its CPU finish and the sink start.
        let harness = Harness::new();
        let rpc = harness.token("rpc", 0);
        let sink = harness.token("sink", 1);
        harness.ledger.record_rpc_issued(&rpc);
        harness
            .ledger
            .record_serial_remote_duration(&rpc, Duration::from_millis(50));

        harness.start(&rpc, 0);
        harness.finish_cpu(&rpc, 2);
        harness.start(&sink, 6);
        harness.complete(&rpc, 30);
        harness.finish_cpu(&sink, 40);
        harness.complete(&sink, 40);

        let path = harness.reconstruct();
        let nodes = &path.nodes[0].child_path.nodes;
        assert_eq!(&*nodes[0].name, "rpc");
        assert_eq!(nodes[0].child_remote_paths.len(), 1);
        let gap = &nodes[0].child_remote_paths[0];
        assert_eq!(gap.elements[0].source, RPC_GAP_SOURCE);
        // 6ms sink start - 2ms CPU finish.
        assert_eq!(gap.total_cost_nanos(), 4 * MS);
    }

    #[test]
    fn still_running_sink_gets_nonnegative_latency_from_now() {
        let harness = Harness::new();
        let work = harness.token("work", 0);
        harness.start(&work, 1);
        harness.ticker.set_nanos(12 * MS);

        let path = harness.reconstruct();
        let node = &path.nodes[0].child_path.nodes[0];
        assert_eq!(node.latency_nanos, 11 * MS);
    }

    #[test]
    fn remote_sub_paths_are_attached_to_their_node() {
        let harness = Harness::new();
        let fetch = harness.token("fetch", 0);
        let sink = harness.token("assemble", 1);
        harness.ledger.record_rpc_issued(&fetch);
        harness
            .ledger
            .record_serial_remote_duration(&fetch, Duration::from_millis(8));

        harness.start(&fetch, 0);
        harness.finish_cpu(&fetch, 1);
        harness.complete(&fetch, 9);
        harness.start(&sink, 9);
        harness.finish_cpu(&sink, 10);
        harness.complete(&sink, 10);

        let path = harness.reconstruct();
        let nodes = &path.nodes[0].child_path.nodes;
        assert_eq!(&*nodes[0].name, "fetch");
        assert_eq!(nodes[0].child_remote_paths.len(), 1);
        assert_eq!(nodes[0].child_remote_paths[0].total_cost_nanos(), 8 * MS);
    }

    #[test]
    fn sink_end_time_becomes_root_latency() {
        let harness = Harness::new();
        let work = harness.token("work", 0);
        harness.start(&work, 2);
        harness.finish_cpu(&work, 5);
        harness.complete(&work, 5);

        let path = harness.reconstruct();
        assert_eq!(path.nodes[0].latency_nanos, 5 * MS);
    }
}
