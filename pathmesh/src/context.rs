// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! Trace identity minting and async-scoped task context.
//!
//! Task bodies resume on arbitrary pool threads, so the "currently executing
//! task" is carried as an explicit context value scoped around every poll of
//! an instrumented future, never as a raw thread-local.

use crate::ledger::TaskLedger;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

tokio::task_local! {
    static CURRENT_TASK: TaskContext;
}

/// Mints process-unique trace ids.
///
/// An explicit process-wide singleton, constructed once at startup and
/// injected into the interceptors. Monotonic; no teardown required.
#[derive(Debug, Default)]
pub struct TraceIdMinter {
    next: AtomicU64,
}

impl TraceIdMinter {
    /// Creates a minter starting at one.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a fresh trace id. Zero is never minted.
    pub fn mint(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Identity of the task the calling code is running inside.
///
/// Carries the request's trace id and the ledger handle of the current task;
/// the client interceptor reads it to attribute an outbound RPC to its
/// issuing task node.
#[derive(Debug, Clone)]
pub struct TaskContext {
    trace_id: u64,
    ledger: TaskLedger,
}

impl TaskContext {
    /// Creates a context for one task of one request.
    pub fn new(trace_id: u64, ledger: TaskLedger) -> Self {
        Self { trace_id, ledger }
    }

    /// The trace id of the request the task belongs to.
    pub fn trace_id(&self) -> u64 {
        self.trace_id
    }

    /// The ledger handle of the current task.
    pub fn ledger(&self) -> &TaskLedger {
        &self.ledger
    }

    /// Returns the context installed around the calling code, if any.
    pub fn current() -> Option<TaskContext> {
        CURRENT_TASK.try_with(TaskContext::clone).ok()
    }

    /// Runs `f` with this context installed. Used by the instrumentation
    /// adapter around each poll, so continuations resuming on a different
    /// worker thread still observe the context.
    pub fn sync_scope<R>(self, f: impl FnOnce() -> R) -> R {
        CURRENT_TASK.sync_scope(self, f)
    }

    /// Runs a future with this context installed across all of its polls.
    pub async fn scope<F: Future>(self, fut: F) -> F::Output {
        CURRENT_TASK.scope(self, fut).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::RemoteChildLedger;
    use crate::token::TaskToken;
    use std::sync::Arc;

    fn context(trace_id: u64) -> TaskContext {
        let ledger = Arc::new(RemoteChildLedger::new());
        let token = TaskToken::new("Graph", "work", 0);
        TaskContext::new(trace_id, TaskLedger::new(token, ledger))
    }

    #[test]
    fn minted_ids_are_unique_and_nonzero() {
        let minter = TraceIdMinter::new();
        let first = minter.mint();
        let second = minter.mint();
        assert_ne!(first, 0);
        assert_ne!(first, second);
    }

    #[test]
    fn current_is_none_outside_any_scope() {
        assert!(TaskContext::current().is_none());
    }

    #[tokio::test]
    async fn scope_carries_context_across_awaits() {
        let observed = context(42)
            .scope(async {
                tokio::task::yield_now().await;
                TaskContext::current().map(|cx| cx.trace_id())
            })
            .await;
        assert_eq!(observed, Some(42));
    }

    #[test]
    fn sync_scope_nests() {
        let outer = context(1);
        let inner = context(2);
        let seen = outer.sync_scope(|| {
            let before = TaskContext::current().map(|cx| cx.trace_id());
            let within = inner.sync_scope(|| TaskContext::current().map(|cx| cx.trace_id()));
            (before, within)
        });
        assert_eq!(seen, (Some(1), Some(2)));
    }
}
