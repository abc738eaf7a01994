// Modifications Copyright Andeya Lee 2024
// Based on original source code from Google LLC licensed under MIT
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use clap::Parser;
use kv::{init_tracing, GetRequest, KvStoreClient, PutRequest, Traced};
use pathmesh::interceptor::{CRITICAL_PATH_KEY, ELAPSED_TIME_KEY};
use pathmesh::Metadata;
use std::net::SocketAddr;
use tarpc::tokio_serde::formats::Bincode;
use tarpc::{context, serde_transport};

#[derive(Parser)]
struct Flags {
    /// Sets the frontend server address to connect to.
    #[clap(long)]
    server_addr: SocketAddr,
    /// The key to operate on.
    #[clap(long)]
    key: String,
    /// When set, puts this value before reading the key back.
    #[clap(long)]
    value: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let flags = Flags::parse();
    init_tracing("Pathmesh KV Client")?;

    let transport = serde_transport::tcp::connect(flags.server_addr, Bincode::default).await?;
    let client = KvStoreClient::new(tarpc::client::Config::default(), transport).spawn();

    if let Some(value) = flags.value {
        let reply = client
            .put(
                context::current(),
                Traced::new(PutRequest {
                    key: flags.key.clone(),
                    value,
                }),
            )
            .await?;
        tracing::info!("[KV] put {}: previous value {:?}", flags.key, reply.body.previous);
        log_reply_path(&reply.meta);
    }

    let reply = client
        .get(context::current(), Traced::new(GetRequest { key: flags.key.clone() }))
        .await?;
    tracing::info!("[KV] get {} = {:?}", flags.key, reply.body.value);
    log_reply_path(&reply.meta);

    Ok(())
}

/// Logs the attribution the server attached to a response.
fn log_reply_path(meta: &Metadata) {
    if let Some(elapsed) = meta.get_str(ELAPSED_TIME_KEY) {
        tracing::info!("[KV] server elapsed: {elapsed}ns");
    }
    let Some(blob) = meta.get_bin(CRITICAL_PATH_KEY) else {
        tracing::warn!("[KV] response carried no critical path");
        return;
    };
    match pathmesh::codec::decode(blob) {
        Ok(path) => {
            for element in path.elements {
                tracing::info!("[KV] {} = {:.6}s", element.source, element.cost_secs);
            }
        },
        Err(err) => tracing::warn!("[KV] undecodable critical path: {err}"),
    }
}
