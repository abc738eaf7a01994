// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! Identity of the nodes in a request's task graph.

use faststr::FastStr;
use std::fmt;

/// Identifies one unit of work within one request's task graph.
///
/// Tokens are minted when the graph is built and live for the request; `id`
/// is unique within the scope. Cloning is cheap, so a token can be handed to
/// whichever thread ends up executing or completing the task.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskToken {
    scope: FastStr,
    name: FastStr,
    id: u32,
}

impl TaskToken {
    /// Creates a token for the task `name` within the request scope `scope`.
    pub fn new(scope: impl Into<FastStr>, name: impl Into<FastStr>, id: u32) -> Self {
        Self {
            scope: scope.into(),
            name: name.into(),
            id,
        }
    }

    /// Returns the name of the request scope that owns the task.
    pub fn scope(&self) -> FastStr {
        self.scope.clone()
    }

    /// Returns the task's name, used as its path segment label.
    pub fn name(&self) -> FastStr {
        self.name.clone()
    }

    /// Returns the scope-unique task id.
    pub fn id(&self) -> u32 {
        self.id
    }
}

impl fmt::Display for TaskToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}#{}", self.scope, self.name, self.id)
    }
}

/// Terminal state reported when a task completes.
///
/// Failed and cancelled tasks still record a completion timestamp so that
/// reconstruction always produces bounded output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The task's future resolved normally.
    Succeeded,
    /// The task's future resolved with an application error.
    Failed,
    /// The task was dropped before resolving.
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_with_same_name_but_different_ids_are_distinct() {
        let a = TaskToken::new("GetGraph", "fetch", 0);
        let b = TaskToken::new("GetGraph", "fetch", 1);
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
        assert_eq!(a.to_string(), "GetGraph/fetch#0");
    }
}
