// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! Execution order capture.

use crate::token::TaskToken;
use std::sync::{Mutex, PoisonError};

/// Records the order in which task nodes began executing.
///
/// One instance per request scope. The order is append-only under a single
/// writer lock; execution order between tasks is the implicit dependency the
/// reconstructor leans on.
#[derive(Debug, Default)]
pub struct ExecutionOrderTracker {
    order: Mutex<Vec<TaskToken>>,
}

impl ExecutionOrderTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends the token of a task that just began executing.
    pub fn on_start(&self, token: &TaskToken) {
        self.order
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(token.clone());
    }

    /// Returns a snapshot of the execution order.
    pub fn execution_order(&self) -> Vec<TaskToken> {
        self.order.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}
