// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//!
//! pathmesh computes, for each request entering a multi-tier RPC service, the
//! critical path: the causal chain of local computation and remote calls that
//! determines end-to-end latency, attributed to named path segments that span
//! process boundaries.
//!
//! It is a lightweight, embedded alternative to full distributed tracing. A
//! request scope observes the lifecycle of the tasks in its asynchronous task
//! graph, a client interceptor measures outbound RPCs and collects the paths
//! returned by downstream tiers, and a backward reconstruction pass joins both
//! into a single [`path::CriticalPath`] that is carried upstream in response
//! metadata.
#![deny(missing_docs)]
#![allow(clippy::type_complexity)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod clock;
pub mod codec;
pub mod context;
pub mod interceptor;
pub mod ledger;
pub mod monitor;
pub mod path;
pub mod reconstruct;
pub mod token;

pub use crate::context::{TaskContext, TraceIdMinter};
pub use crate::interceptor::{ClientTracer, Metadata, ParallelRpcMonitor, RequestScope, ServerTracer};
pub use crate::path::{CriticalPath, Path, PathElement, PathNode};
pub use crate::token::{TaskOutcome, TaskToken};
