// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! Per-task timing capture.

use crate::clock::Ticker;
use crate::token::{TaskOutcome, TaskToken};
use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::debug;

const UNSET: i64 = -1;

/// Timing cells for one task.
///
/// Written at most three times (start, finish-executing, complete) by
/// whichever thread runs the task; read many times by the reconstructor.
/// First write wins, so a cancellation racing a normal completion cannot move
/// a recorded timestamp.
#[derive(Debug)]
pub struct TaskTiming {
    started_nanos: AtomicI64,
    cpu_nanos: AtomicI64,
    completed_nanos: AtomicI64,
}

impl TaskTiming {
    fn new() -> Self {
        Self {
            started_nanos: AtomicI64::new(UNSET),
            cpu_nanos: AtomicI64::new(UNSET),
            completed_nanos: AtomicI64::new(UNSET),
        }
    }

    fn record_start(&self, now: u64) {
        let _ = self
            .started_nanos
            .compare_exchange(UNSET, now as i64, Ordering::AcqRel, Ordering::Acquire);
    }

    fn record_cpu_finished(&self, now: u64) {
        let started = self.started_nanos.load(Ordering::Acquire);
        if started == UNSET {
            return;
        }
        let _ = self
            .cpu_nanos
            .compare_exchange(UNSET, now as i64 - started, Ordering::AcqRel, Ordering::Acquire);
    }

    fn record_completed(&self, now: u64) {
        let _ = self
            .completed_nanos
            .compare_exchange(UNSET, now as i64, Ordering::AcqRel, Ordering::Acquire);
    }

    fn started(&self) -> Option<u64> {
        match self.started_nanos.load(Ordering::Acquire) {
            UNSET => None,
            nanos => Some(nanos as u64),
        }
    }

    fn cpu(&self) -> u64 {
        self.cpu_nanos.load(Ordering::Acquire).max(0) as u64
    }

    fn completed(&self) -> Option<u64> {
        match self.completed_nanos.load(Ordering::Acquire) {
            UNSET => None,
            nanos => Some(nanos as u64),
        }
    }
}

/// Records start/finish/completion timestamps for every task in one request
/// scope.
///
/// All recording calls are non-blocking and callable from any thread;
/// completions routinely arrive out of order. Queries issued before a task
/// completes substitute the current ticker reading as a degraded snapshot and
/// flag it in the log; they never block and never panic.
pub struct TaskTimingRecorder {
    ticker: Arc<dyn Ticker>,
    timings: DashMap<TaskToken, Arc<TaskTiming>>,
}

impl TaskTimingRecorder {
    /// Creates a recorder reading time from `ticker`.
    pub fn new(ticker: Arc<dyn Ticker>) -> Self {
        Self {
            ticker,
            timings: DashMap::new(),
        }
    }

    fn timing(&self, token: &TaskToken) -> Arc<TaskTiming> {
        Arc::clone(
            self.timings
                .entry(token.clone())
                .or_insert_with(|| Arc::new(TaskTiming::new()))
                .value(),
        )
    }

    fn read(&self, token: &TaskToken) -> Option<Arc<TaskTiming>> {
        self.timings.get(token).map(|entry| Arc::clone(entry.value()))
    }

    /// The task began executing.
    pub fn on_start(&self, token: &TaskToken) {
        self.timing(token).record_start(self.ticker.now_nanos());
    }

    /// The task's synchronous body returned; its CPU share is now known.
    pub fn on_finish_executing(&self, token: &TaskToken) {
        self.timing(token).record_cpu_finished(self.ticker.now_nanos());
    }

    /// The task's future resolved. Failed and cancelled tasks still record a
    /// completion timestamp so reconstruction stays bounded.
    pub fn on_complete(&self, token: &TaskToken, outcome: TaskOutcome) {
        self.timing(token).record_completed(self.ticker.now_nanos());
        if outcome != TaskOutcome::Succeeded {
            debug!("[PATHMESH] task {token} completed with outcome {outcome:?}");
        }
    }

    /// Returns true when any timestamp was recorded for the token.
    pub fn is_known(&self, token: &TaskToken) -> bool {
        self.timings.contains_key(token)
    }

    /// Returns true once the task's start was observed.
    pub fn is_started(&self, token: &TaskToken) -> bool {
        self.read(token).and_then(|t| t.started()).is_some()
    }

    /// The recorded start time; zero when the task never started.
    pub fn start_time(&self, token: &TaskToken) -> u64 {
        self.read(token).and_then(|t| t.started()).unwrap_or(0)
    }

    /// The task's CPU duration; zero until finish-executing was observed.
    pub fn cpu_duration(&self, token: &TaskToken) -> u64 {
        self.read(token).map(|t| t.cpu()).unwrap_or(0)
    }

    /// The recorded end time.
    ///
    /// Zero when the task never started; the current ticker reading while the
    /// task is still running (a degraded snapshot, flagged in the log).
    pub fn end_time(&self, token: &TaskToken) -> u64 {
        let Some(timing) = self.read(token) else {
            return 0;
        };
        match (timing.started(), timing.completed()) {
            (None, _) => 0,
            (Some(_), Some(completed)) => completed,
            (Some(_), None) => {
                debug!("[PATHMESH] end time of {token} queried before completion; substituting now");
                self.ticker.now_nanos()
            },
        }
    }

    /// The task's wall latency, degraded to `now - start` while still running.
    pub fn wall_latency(&self, token: &TaskToken) -> u64 {
        let Some(timing) = self.read(token) else {
            return 0;
        };
        match (timing.started(), timing.completed()) {
            (None, _) => 0,
            (Some(started), Some(completed)) => completed.saturating_sub(started),
            (Some(started), None) => {
                debug!("[PATHMESH] latency of {token} queried before completion; substituting now");
                self.ticker.now_nanos().saturating_sub(started)
            },
        }
    }
}
