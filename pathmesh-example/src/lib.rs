// Modifications Copyright Andeya Lee 2024
// Based on original source code from Google LLC licensed under MIT
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! Shared service definitions for the two-tier key-value demo.
//!
//! Request and response bodies travel inside a [`Traced`] envelope so that
//! pathmesh metadata rides along with every call on any transport.

use pathmesh::Metadata;
use serde::{Deserialize, Serialize};

/// Envelope pairing a message body with pathmesh metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Traced<T> {
    /// Trace identity on requests; elapsed time and path blob on responses.
    pub meta: Metadata,
    /// The message body.
    pub body: T,
}

impl<T> Traced<T> {
    /// Wraps a body with empty metadata.
    pub fn new(body: T) -> Self {
        Self {
            meta: Metadata::new(),
            body,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetRequest {
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetReply {
    pub value: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutRequest {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutReply {
    pub previous: Option<String>,
}

/// The frontend tier: the service clients talk to.
#[tarpc::service]
pub trait KvStore {
    /// Returns the value stored under a key.
    async fn get(req: Traced<GetRequest>) -> Traced<GetReply>;
    /// Stores a value, returning the previous one.
    async fn put(req: Traced<PutRequest>) -> Traced<PutReply>;
}

/// The backend tier: storage, called by the frontend.
#[tarpc::service]
pub trait KvBackend {
    /// Reads a key from storage.
    async fn fetch(req: Traced<GetRequest>) -> Traced<GetReply>;
    /// Writes a key to storage.
    async fn store(req: Traced<PutRequest>) -> Traced<PutReply>;
}

/// Installs a process-wide log subscriber for the demo binaries.
pub fn init_tracing(service_name: &str) -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init()
        .map_err(|err| anyhow::anyhow!("{err}"))?;
    tracing::info!("[KV] {service_name} started");
    Ok(())
}
