// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! Request-scoped task graph monitors.
//!
//! The task-graph runtime reports lifecycle transitions through
//! [`SchedulerObserver`]; [`GraphMonitor`] fans them out to the per-request
//! recorders. Runtimes without native hooks can wrap each task future in
//! [`Instrumented`], which derives the three transitions from its polls.

mod order;
mod timing;

pub use order::ExecutionOrderTracker;
pub use timing::{TaskTiming, TaskTimingRecorder};

use crate::clock::Ticker;
use crate::context::TaskContext;
use crate::token::{TaskOutcome, TaskToken};
use pin_project::{pin_project, pinned_drop};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

/// Lifecycle notifications delivered by the task-graph runtime.
///
/// Implementations must be non-blocking and callable from any thread;
/// completions arrive out of order and concurrently.
pub trait SchedulerObserver: Send + Sync {
    /// The task began executing.
    fn on_start(&self, token: &TaskToken);
    /// The task's synchronous body returned.
    fn on_finish_executing(&self, token: &TaskToken);
    /// The task's future resolved, or was dropped without resolving.
    fn on_complete(&self, token: &TaskToken, outcome: TaskOutcome);
}

/// Fans scheduler notifications out to the timing and order recorders of one
/// request scope.
#[derive(Clone)]
pub struct GraphMonitor {
    timing: Arc<TaskTimingRecorder>,
    order: Arc<ExecutionOrderTracker>,
}

impl GraphMonitor {
    /// Creates the recorder set for one request scope.
    pub fn new(ticker: Arc<dyn Ticker>) -> Self {
        Self {
            timing: Arc::new(TaskTimingRecorder::new(ticker)),
            order: Arc::new(ExecutionOrderTracker::new()),
        }
    }

    /// The request's timing recorder.
    pub fn timing(&self) -> &TaskTimingRecorder {
        &self.timing
    }

    /// The request's execution order tracker.
    pub fn order(&self) -> &ExecutionOrderTracker {
        &self.order
    }
}

impl SchedulerObserver for GraphMonitor {
    fn on_start(&self, token: &TaskToken) {
        self.order.on_start(token);
        self.timing.on_start(token);
    }

    fn on_finish_executing(&self, token: &TaskToken) {
        self.timing.on_finish_executing(token);
    }

    fn on_complete(&self, token: &TaskToken, outcome: TaskOutcome) {
        self.timing.on_complete(token, outcome);
    }
}

/// Future adapter that reports one task's lifecycle to a [`GraphMonitor`]
/// and installs its [`TaskContext`] around every poll.
///
/// The first poll marks the start; when it returns, the synchronous head of
/// the task (where RPCs are issued) is over and the CPU share is recorded.
/// Readiness marks completion; dropping an unfinished task records a
/// cancellation, so reconstruction stays bounded.
#[pin_project(PinnedDrop)]
pub struct Instrumented<F> {
    #[pin]
    inner: F,
    token: TaskToken,
    monitor: GraphMonitor,
    context: TaskContext,
    started: bool,
    head_done: bool,
    completed: bool,
}

impl<F> Instrumented<F> {
    /// Wraps `inner` as the task identified by `token`.
    pub fn new(token: TaskToken, monitor: GraphMonitor, context: TaskContext, inner: F) -> Self {
        Self {
            inner,
            token,
            monitor,
            context,
            started: false,
            head_done: false,
            completed: false,
        }
    }
}

impl<F: Future> Future for Instrumented<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        if !*this.started {
            *this.started = true;
            this.monitor.on_start(this.token);
        }
        let inner = this.inner;
        let poll = this.context.clone().sync_scope(|| inner.poll(cx));
        if !*this.head_done {
            *this.head_done = true;
            this.monitor.on_finish_executing(this.token);
        }
        if poll.is_ready() {
            *this.completed = true;
            this.monitor.on_complete(this.token, TaskOutcome::Succeeded);
        }
        poll
    }
}

#[pinned_drop]
impl<F> PinnedDrop for Instrumented<F> {
    fn drop(self: Pin<&mut Self>) {
        let this = self.project();
        if *this.started && !*this.completed {
            this.monitor.on_complete(this.token, TaskOutcome::Cancelled);
        }
    }
}
