// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! Client-side tracing interceptor.

use super::{Metadata, ParallelRpcMonitor, CRITICAL_PATH_KEY, TRACE_ID_KEY};
use crate::clock::Ticker;
use crate::codec;
use crate::context::{TaskContext, TraceIdMinter};
use crate::ledger::TaskLedger;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Wraps every outbound RPC: stamps trace identity on the request, measures
/// wall time, and feeds the response's path data into the ledger of the task
/// that issued the call.
#[derive(Clone)]
pub struct ClientTracer {
    minter: Arc<TraceIdMinter>,
    parallel_monitor: Arc<ParallelRpcMonitor>,
    ticker: Arc<dyn Ticker>,
}

impl ClientTracer {
    /// Creates a tracer over the process-wide minter and overlap cache.
    pub fn new(
        minter: Arc<TraceIdMinter>,
        parallel_monitor: Arc<ParallelRpcMonitor>,
        ticker: Arc<dyn Ticker>,
    ) -> Self {
        Self {
            minter,
            parallel_monitor,
            ticker,
        }
    }

    /// Records the start of an outbound call and stamps the current trace id
    /// into the request metadata.
    ///
    /// The issuing task is identified through the async-scoped
    /// [`TaskContext`]. Without one, a fresh trace id is minted and this call
    /// becomes the first hop of a new trace downstream.
    pub fn start_call(&self, request_meta: &mut Metadata) -> OutboundCall {
        let started_nanos = self.ticker.now_nanos();
        let context = TaskContext::current();
        let trace_id = match &context {
            Some(cx) => cx.trace_id(),
            None => {
                let trace_id = self.minter.mint();
                debug!("[PATHMESH] outbound call outside any task context; minted trace id {trace_id}");
                trace_id
            },
        };
        request_meta.insert_str(TRACE_ID_KEY, trace_id.to_string());
        OutboundCall {
            tracer: self.clone(),
            ledger: context.map(|cx| cx.ledger().clone()),
            trace_id,
            started_nanos,
        }
    }
}

/// One in-flight outbound RPC started by [`ClientTracer::start_call`].
///
/// May be held across an await and completed from whichever context the
/// response arrives in; it records into the ledger captured at start time.
pub struct OutboundCall {
    tracer: ClientTracer,
    ledger: Option<TaskLedger>,
    trace_id: u64,
    started_nanos: u64,
}

impl OutboundCall {
    /// The trace id stamped on the request.
    pub fn trace_id(&self) -> u64 {
        self.trace_id
    }

    /// Records the arrival of the response headers: measures the call's wall
    /// time, classifies it serial or parallel against the trace's previous
    /// calls, and decodes the peer's path into the issuing task's ledger.
    ///
    /// A malformed or absent path blob contributes nothing and never fails
    /// the call.
    pub fn on_response(&self, response_meta: &Metadata) {
        let end_nanos = self.tracer.ticker.now_nanos();
        let Some(ledger) = &self.ledger else {
            warn!("[PATHMESH] outbound call completed outside any task context; dropping path data");
            return;
        };
        ledger.record_rpc_issued();

        let duration = Duration::from_nanos(end_nanos.saturating_sub(self.started_nanos));
        if !duration.is_zero() {
            // A call whose window opens before the previous call's end for
            // the same trace ran in parallel with it.
            match self.tracer.parallel_monitor.last_end_nanos(self.trace_id) {
                Some(prior_end) if self.started_nanos < prior_end => {
                    ledger.record_parallel_remote_duration(duration)
                },
                _ => ledger.record_serial_remote_duration(duration),
            }
            self.tracer.parallel_monitor.advance(self.trace_id, end_nanos);
        }

        match response_meta.get_bin(CRITICAL_PATH_KEY) {
            Some(blob) => match codec::decode(blob) {
                Ok(path) => ledger.record_remote_sub_path(path),
                Err(err) => {
                    warn!("[PATHMESH] dropping malformed critical path from peer: {err}")
                },
            },
            None => debug!("[PATHMESH] peer response carried no critical path"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualTicker;
    use crate::ledger::RemoteChildLedger;
    use crate::path::Path;
    use crate::token::TaskToken;
    use bytes::Bytes;

    struct Harness {
        ticker: Arc<ManualTicker>,
        tracer: ClientTracer,
        ledger: Arc<RemoteChildLedger>,
        token: TaskToken,
    }

    impl Harness {
        fn new() -> Self {
            let ticker = Arc::new(ManualTicker::new());
            let tracer = ClientTracer::new(
                Arc::new(TraceIdMinter::new()),
                Arc::new(ParallelRpcMonitor::new(ticker.clone())),
                ticker.clone(),
            );
            Self {
                ticker,
                tracer,
                ledger: Arc::new(RemoteChildLedger::new()),
                token: TaskToken::new("Graph", "fetch", 0),
            }
        }

        fn context(&self, trace_id: u64) -> TaskContext {
            TaskContext::new(trace_id, TaskLedger::new(self.token.clone(), self.ledger.clone()))
        }
    }

    const MS: u64 = 1_000_000;

    #[test]
    fn sequential_calls_sum_their_durations() {
        let harness = Harness::new();
        harness.context(9).sync_scope(|| {
            let mut meta = Metadata::new();
            let call = harness.tracer.start_call(&mut meta);
            assert_eq!(meta.get_str(TRACE_ID_KEY), Some("9"));
            harness.ticker.set_nanos(100 * MS);
            call.on_response(&Metadata::new());

            let call = harness.tracer.start_call(&mut Metadata::new());
            harness.ticker.set_nanos(150 * MS);
            call.on_response(&Metadata::new());
        });

        let paths = harness.ledger.paths_for(&harness.token);
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].total_cost_nanos(), 150 * MS);
    }

    #[test]
    fn overlapping_calls_keep_the_max_duration() {
        let harness = Harness::new();
        harness.context(9).sync_scope(|| {
            // First call [0, 100ms] lands its end in the cache; the second
            // call's window [90ms, 170ms] opens before that end, so it is
            // classified parallel.
            let first = harness.tracer.start_call(&mut Metadata::new());
            harness.ticker.set_nanos(90 * MS);
            let second = harness.tracer.start_call(&mut Metadata::new());
            harness.ticker.set_nanos(100 * MS);
            first.on_response(&Metadata::new());
            harness.ticker.set_nanos(170 * MS);
            second.on_response(&Metadata::new());
        });

        let paths = harness.ledger.paths_for(&harness.token);
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].total_cost_nanos(), 100 * MS);
    }

    #[test]
    fn decoded_peer_path_reaches_the_ledger() {
        let harness = Harness::new();
        let peer_path = Path::single("/Backend/lookup", 0.080);
        let blob = codec::encode(&peer_path).unwrap();

        harness.context(9).sync_scope(|| {
            let call = harness.tracer.start_call(&mut Metadata::new());
            harness.ticker.set_nanos(100 * MS);
            let mut response = Metadata::new();
            response.insert_bin(CRITICAL_PATH_KEY, blob);
            call.on_response(&response);
        });

        let paths = harness.ledger.paths_for(&harness.token);
        // The peer attributed 80ms of the 100ms call; the remainder becomes
        // one unattributed element.
        assert_eq!(paths.len(), 2);
        assert_eq!(paths[0], peer_path);
        assert_eq!(paths[1].total_cost_nanos(), 20 * MS);
    }

    #[test]
    fn malformed_peer_path_is_dropped() {
        let harness = Harness::new();
        harness.context(9).sync_scope(|| {
            let call = harness.tracer.start_call(&mut Metadata::new());
            harness.ticker.set_nanos(10 * MS);
            let mut response = Metadata::new();
            response.insert_bin(CRITICAL_PATH_KEY, Bytes::from_static(&[0xde, 0xad]));
            call.on_response(&response);
        });

        let paths = harness.ledger.paths_for(&harness.token);
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].total_cost_nanos(), 10 * MS);
        assert!(harness.ledger.is_rpc_node(&harness.token));
    }

    #[test]
    fn call_without_context_mints_a_fresh_trace_id() {
        let harness = Harness::new();
        let mut meta = Metadata::new();
        let call = harness.tracer.start_call(&mut meta);
        assert_eq!(meta.get_str(TRACE_ID_KEY), Some("1"));
        // Without a task to attribute to, the response is a no-op.
        harness.ticker.set_nanos(5 * MS);
        call.on_response(&Metadata::new());
        assert!(harness.ledger.paths_for(&harness.token).is_empty());
    }

    #[test]
    fn zero_duration_calls_record_no_remote_time() {
        let harness = Harness::new();
        harness.context(9).sync_scope(|| {
            let call = harness.tracer.start_call(&mut Metadata::new());
            call.on_response(&Metadata::new());
        });
        assert!(harness.ledger.is_rpc_node(&harness.token));
        assert!(harness.ledger.paths_for(&harness.token).is_empty());
    }
}
