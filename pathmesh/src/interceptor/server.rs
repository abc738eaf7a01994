// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! Server-side tracing interceptor.

use super::{Metadata, CRITICAL_PATH_KEY, ELAPSED_TIME_KEY, TRACE_ID_KEY};
use crate::clock::Ticker;
use crate::codec;
use crate::context::{TaskContext, TraceIdMinter};
use crate::ledger::{RemoteChildLedger, TaskLedger};
use crate::monitor::{GraphMonitor, Instrumented, SchedulerObserver};
use crate::path::CriticalPath;
use crate::reconstruct::PathReconstructor;
use crate::token::TaskToken;
use faststr::FastStr;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Wraps every inbound RPC: adopts or mints the trace id, measures wall time,
/// and opens the per-request attribution scope.
#[derive(Clone)]
pub struct ServerTracer {
    minter: Arc<TraceIdMinter>,
    ticker: Arc<dyn Ticker>,
}

impl ServerTracer {
    /// Creates a tracer over the process-wide trace id minter.
    pub fn new(minter: Arc<TraceIdMinter>, ticker: Arc<dyn Ticker>) -> Self {
        Self { minter, ticker }
    }

    /// Opens the attribution scope for one inbound request.
    ///
    /// An inbound trace id is adopted and propagated unchanged; when the
    /// request carries none, this tier mints one and becomes the attribution
    /// root for its subtree.
    pub fn begin_request(&self, scope: impl Into<FastStr>, request_meta: &Metadata) -> RequestScope {
        let started_nanos = self.ticker.now_nanos();
        let scope = scope.into();
        let trace_id = match request_meta.get_str(TRACE_ID_KEY).and_then(|raw| raw.parse::<u64>().ok()) {
            Some(trace_id) => {
                debug!("[PATHMESH] {scope} serving downstream request with trace id {trace_id}");
                trace_id
            },
            None => {
                let trace_id = self.minter.mint();
                debug!("[PATHMESH] {scope} is the attribution root; minted trace id {trace_id}");
                trace_id
            },
        };
        RequestScope {
            scope,
            trace_id,
            started_nanos,
            monitor: GraphMonitor::new(self.ticker.clone()),
            ledger: Arc::new(RemoteChildLedger::new()),
            ticker: self.ticker.clone(),
            next_task_id: AtomicU32::new(0),
        }
    }
}

/// Per-request attribution scope.
///
/// Owns the request's recorders; one instance per request, shared with
/// nothing. Tasks are minted, instrumented and reconstructed through it.
pub struct RequestScope {
    scope: FastStr,
    trace_id: u64,
    started_nanos: u64,
    monitor: GraphMonitor,
    ledger: Arc<RemoteChildLedger>,
    ticker: Arc<dyn Ticker>,
    next_task_id: AtomicU32,
}

impl RequestScope {
    /// The trace id governing this request.
    pub fn trace_id(&self) -> u64 {
        self.trace_id
    }

    /// The name of the request scope.
    pub fn scope(&self) -> FastStr {
        self.scope.clone()
    }

    /// Mints the token for one node of the request's task graph.
    pub fn token(&self, name: impl Into<FastStr>) -> TaskToken {
        TaskToken::new(
            self.scope.clone(),
            name,
            self.next_task_id.fetch_add(1, Ordering::Relaxed),
        )
    }

    /// The scheduler-observer surface for task-graph runtimes with native
    /// lifecycle hooks.
    pub fn observer(&self) -> &dyn SchedulerObserver {
        &self.monitor
    }

    /// The request's ledger of remote child paths.
    pub fn ledger(&self) -> &Arc<RemoteChildLedger> {
        &self.ledger
    }

    /// The ledger handle serving `token`.
    pub fn task_ledger(&self, token: &TaskToken) -> TaskLedger {
        TaskLedger::new(token.clone(), self.ledger.clone())
    }

    /// The context value installed around `token`'s polls.
    pub fn task_context(&self, token: &TaskToken) -> TaskContext {
        TaskContext::new(self.trace_id, self.task_ledger(token))
    }

    /// Instruments one task future of the request's graph.
    pub fn instrument<F: Future>(&self, token: TaskToken, fut: F) -> Instrumented<F> {
        let context = self.task_context(&token);
        Instrumented::new(token, self.monitor.clone(), context, fut)
    }

    /// Reconstructs the request's critical path. The egress query for
    /// logging and export; normally called once the task graph is complete.
    pub fn critical_path(&self) -> CriticalPath {
        PathReconstructor::new(
            self.scope.clone(),
            self.monitor.order(),
            self.monitor.timing(),
            &self.ledger,
        )
        .reconstruct()
    }

    /// Reconstructs the path and attaches it, plus the measured wall time, to
    /// the response metadata. Returns the path for local logging.
    pub fn finish_response(&self, response_meta: &mut Metadata) -> CriticalPath {
        let path = self.critical_path();
        match codec::encode(&codec::flatten(&path)) {
            Ok(blob) => response_meta.insert_bin(CRITICAL_PATH_KEY, blob),
            Err(err) => warn!("[PATHMESH] failed to encode critical path of {}: {err}", self.scope),
        }
        let elapsed_nanos = self.ticker.now_nanos().saturating_sub(self.started_nanos);
        response_meta.insert_str(ELAPSED_TIME_KEY, elapsed_nanos.to_string());
        path
    }
}
