// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! Accumulation of remote call durations and child paths per task node.

use crate::path::{nanos_to_secs, Path, UNATTRIBUTED_REMOTE_SOURCE};
use crate::token::TaskToken;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, Clone)]
struct ChildPath {
    path: Path,
    remote: bool,
}

#[derive(Debug, Default)]
struct LedgerState {
    rpc_tokens: HashSet<TaskToken>,
    sub_paths: HashMap<TaskToken, Vec<ChildPath>>,
    remote_nanos: HashMap<TaskToken, u64>,
}

/// Accumulates, per task node of one request, the durations of the RPCs the
/// task issued and the sub-paths received from downstream tiers.
///
/// Must be request-scoped: it stores mutable state for a single request.
/// Recording calls arrive from whichever threads complete the RPCs.
#[derive(Debug, Default)]
pub struct RemoteChildLedger {
    state: Mutex<LedgerState>,
}

impl RemoteChildLedger {
    /// Creates an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records that the task issued at least one RPC. Once recorded, the flag
    /// is never lost.
    pub fn record_rpc_issued(&self, token: &TaskToken) {
        self.lock().rpc_tokens.insert(token.clone());
    }

    /// Accumulates remote time for an RPC detected as overlapping another in
    /// the same trace: only the longest call bounds the path, so the total is
    /// the max over calls.
    pub fn record_parallel_remote_duration(&self, token: &TaskToken, duration: Duration) {
        let mut state = self.lock();
        let total = state.remote_nanos.entry(token.clone()).or_default();
        *total = (*total).max(duration.as_nanos() as u64);
        state.rpc_tokens.insert(token.clone());
    }

    /// Accumulates remote time for an RPC detected as serial: back-to-back
    /// calls all bound the path, so the total is the sum over calls.
    pub fn record_serial_remote_duration(&self, token: &TaskToken, duration: Duration) {
        let mut state = self.lock();
        *state.remote_nanos.entry(token.clone()).or_default() += duration.as_nanos() as u64;
        state.rpc_tokens.insert(token.clone());
    }

    /// Stores a sub-path for work the task delegated. `remote` marks paths
    /// that crossed a process boundary; those also flag the task as an RPC
    /// node.
    pub fn record_sub_path(&self, token: &TaskToken, path: Path, remote: bool) {
        let mut state = self.lock();
        state
            .sub_paths
            .entry(token.clone())
            .or_default()
            .push(ChildPath { path, remote });
        if remote {
            state.rpc_tokens.insert(token.clone());
        }
    }

    /// Returns true if the task issued any RPC during its execution.
    pub fn is_rpc_node(&self, token: &TaskToken) -> bool {
        self.lock().rpc_tokens.contains(token)
    }

    /// Returns the reconciled sub-paths for the token. Pure with respect to
    /// ledger state: repeated calls without new recordings return identical
    /// results.
    ///
    /// For a token with total known remote duration `D` and remote-flagged
    /// sub-paths summing to `S`: if `S < D`, one synthetic element carrying
    /// `D - S` is appended, covering network and queue time the callee's own
    /// instrumentation never saw. If `S >= D` the sub-paths pass through
    /// unchanged; when several sub-paths exist and `D` cannot disambiguate,
    /// they are assumed sequential (the common case), not overlapping.
    pub fn paths_for(&self, token: &TaskToken) -> Vec<Path> {
        let state = self.lock();
        let recorded = state.sub_paths.get(token);
        let remote_nanos = state.remote_nanos.get(token).copied();
        match (recorded, remote_nanos) {
            (None, None) => Vec::new(),
            (None, Some(total)) => vec![unattributed_remote(total)],
            (Some(recorded), None) => recorded.iter().map(|c| c.path.clone()).collect(),
            (Some(recorded), Some(total)) => {
                let attributed: u64 = recorded
                    .iter()
                    .filter(|c| c.remote)
                    .map(|c| c.path.total_cost_nanos())
                    .sum();
                let mut paths: Vec<Path> = recorded.iter().map(|c| c.path.clone()).collect();
                if attributed < total {
                    paths.push(unattributed_remote(total - attributed));
                }
                paths
            },
        }
    }
}

fn unattributed_remote(nanos: u64) -> Path {
    Path::single(UNATTRIBUTED_REMOTE_SOURCE, nanos_to_secs(nanos))
}

/// Handle that records into a [`RemoteChildLedger`] on behalf of one task.
///
/// The handle may be held across threads and called after the task yielded;
/// it always serves the task it was created for.
#[derive(Debug, Clone)]
pub struct TaskLedger {
    token: TaskToken,
    ledger: Arc<RemoteChildLedger>,
}

impl TaskLedger {
    /// Binds `token` to the shared request ledger.
    pub fn new(token: TaskToken, ledger: Arc<RemoteChildLedger>) -> Self {
        Self { token, ledger }
    }

    /// The task this handle records for.
    pub fn token(&self) -> &TaskToken {
        &self.token
    }

    /// Records that the task issued an RPC.
    pub fn record_rpc_issued(&self) {
        self.ledger.record_rpc_issued(&self.token);
    }

    /// Records remote time for an RPC that overlapped another in the trace.
    pub fn record_parallel_remote_duration(&self, duration: Duration) {
        self.ledger.record_parallel_remote_duration(&self.token, duration);
    }

    /// Records remote time for a serially issued RPC.
    pub fn record_serial_remote_duration(&self, duration: Duration) {
        self.ledger.record_serial_remote_duration(&self.token, duration);
    }

    /// Records a sub-path computed by delegated local work.
    pub fn record_sub_path(&self, path: Path) {
        self.ledger.record_sub_path(&self.token, path, false);
    }

    /// Records a sub-path received from a remote system; marks the task an
    /// RPC node.
    pub fn record_remote_sub_path(&self, path: Path) {
        self.ledger.record_sub_path(&self.token, path, true);
    }
}
