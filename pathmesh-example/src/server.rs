// Modifications Copyright Andeya Lee 2024
// Based on original source code from Google LLC licensed under MIT
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use clap::Parser;
use dashmap::DashMap;
use futures::{future, prelude::*};
use kv::{
    init_tracing, GetReply, GetRequest, KvBackend, KvBackendClient, KvStore, PutReply, PutRequest,
    Traced,
};
use pathmesh::clock::{SystemTicker, Ticker};
use pathmesh::{ClientTracer, CriticalPath, ParallelRpcMonitor, ServerTracer, TraceIdMinter};
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tarpc::server::{self, Channel};
use tarpc::tokio_serde::formats::Bincode;
use tarpc::{context, serde_transport};

#[derive(Parser)]
struct Flags {
    /// Sets the port number to listen on.
    #[clap(long)]
    port: u16,
    /// Serve the frontend tier against this backend address; without it,
    /// this process is the backend tier.
    #[clap(long)]
    backend_addr: Option<SocketAddr>,
}

/// Frontend tier: instruments a small task graph per request and delegates
/// storage to the backend tier.
#[derive(Clone)]
struct FrontendServer {
    tracer: ServerTracer,
    client_tracer: ClientTracer,
    backend: KvBackendClient,
}

impl KvStore for FrontendServer {
    async fn get(self, _: context::Context, req: Traced<GetRequest>) -> Traced<GetReply> {
        let scope = self.tracer.begin_request("GetGraph", &req.meta);

        let key = scope
            .instrument(scope.token("normalize_key"), {
                let key = req.body.key;
                async move { key.trim().to_owned() }
            })
            .await;

        let value = scope
            .instrument(scope.token("fetch_backend"), {
                let backend = self.backend.clone();
                let client_tracer = self.client_tracer.clone();
                async move {
                    let mut backend_req = Traced::new(GetRequest { key });
                    let call = client_tracer.start_call(&mut backend_req.meta);
                    match backend.fetch(context::current(), backend_req).await {
                        Ok(reply) => {
                            call.on_response(&reply.meta);
                            reply.body.value
                        },
                        Err(err) => {
                            tracing::warn!("[KV] backend fetch failed: {err}");
                            None
                        },
                    }
                }
            })
            .await;

        let mut reply = Traced::new(GetReply { value });
        let path = scope.finish_response(&mut reply.meta);
        log_path("get", &path);
        reply
    }

    async fn put(self, _: context::Context, req: Traced<PutRequest>) -> Traced<PutReply> {
        let scope = self.tracer.begin_request("PutGraph", &req.meta);

        let request = scope
            .instrument(scope.token("normalize_key"), {
                let body = req.body;
                async move {
                    PutRequest {
                        key: body.key.trim().to_owned(),
                        value: body.value,
                    }
                }
            })
            .await;

        let previous = scope
            .instrument(scope.token("store_backend"), {
                let backend = self.backend.clone();
                let client_tracer = self.client_tracer.clone();
                async move {
                    let mut backend_req = Traced::new(request);
                    let call = client_tracer.start_call(&mut backend_req.meta);
                    match backend.store(context::current(), backend_req).await {
                        Ok(reply) => {
                            call.on_response(&reply.meta);
                            reply.body.previous
                        },
                        Err(err) => {
                            tracing::warn!("[KV] backend store failed: {err}");
                            None
                        },
                    }
                }
            })
            .await;

        let mut reply = Traced::new(PutReply { previous });
        let path = scope.finish_response(&mut reply.meta);
        log_path("put", &path);
        reply
    }
}

/// Backend tier: in-process storage behind its own attribution scope.
#[derive(Clone)]
struct BackendServer {
    tracer: ServerTracer,
    store: Arc<DashMap<String, String>>,
}

impl KvBackend for BackendServer {
    async fn fetch(self, _: context::Context, req: Traced<GetRequest>) -> Traced<GetReply> {
        let scope = self.tracer.begin_request("FetchGraph", &req.meta);
        let value = scope
            .instrument(scope.token("lookup"), {
                let store = self.store.clone();
                let key = req.body.key;
                async move { store.get(&key).map(|entry| entry.value().clone()) }
            })
            .await;
        let mut reply = Traced::new(GetReply { value });
        scope.finish_response(&mut reply.meta);
        reply
    }

    async fn store(self, _: context::Context, req: Traced<PutRequest>) -> Traced<PutReply> {
        let scope = self.tracer.begin_request("StoreGraph", &req.meta);
        let previous = scope
            .instrument(scope.token("write"), {
                let store = self.store.clone();
                let body = req.body;
                async move { store.insert(body.key, body.value) }
            })
            .await;
        let mut reply = Traced::new(PutReply { previous });
        scope.finish_response(&mut reply.meta);
        reply
    }
}

fn log_path(op: &str, path: &CriticalPath) {
    for element in pathmesh::codec::flatten(path).elements {
        tracing::info!("[KV] {op}: {} = {:.6}s", element.source, element.cost_secs);
    }
}

async fn spawn(fut: impl Future<Output = ()> + Send + 'static) {
    tokio::spawn(fut);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let flags = Flags::parse();
    init_tracing("Pathmesh KV Server")?;

    // Process-wide singletons, built once and injected.
    let ticker: Arc<dyn Ticker> = Arc::new(SystemTicker::new());
    let minter = Arc::new(TraceIdMinter::new());
    let server_tracer = ServerTracer::new(minter.clone(), ticker.clone());

    let listen_addr = (IpAddr::V6(Ipv6Addr::LOCALHOST), flags.port);

    match flags.backend_addr {
        Some(backend_addr) => {
            let mut listener =
                serde_transport::tcp::listen(&listen_addr, Bincode::default).await?;
            tracing::info!("[KV] listening on {}", listener.local_addr());
            listener.config_mut().max_frame_length(usize::MAX);
            let transport = serde_transport::tcp::connect(backend_addr, Bincode::default).await?;
            let backend = KvBackendClient::new(tarpc::client::Config::default(), transport).spawn();
            let server = FrontendServer {
                tracer: server_tracer,
                client_tracer: ClientTracer::new(
                    minter,
                    Arc::new(ParallelRpcMonitor::new(ticker.clone())),
                    ticker,
                ),
                backend,
            };
            listener
                .filter_map(|r| future::ready(r.ok()))
                .map(server::BaseChannel::with_defaults)
                .map(|channel| channel.execute(server.clone().serve()).for_each(spawn))
                .buffer_unordered(10)
                .for_each(|_| async {})
                .await;
        },
        None => {
            let mut listener =
                serde_transport::tcp::listen(&listen_addr, Bincode::default).await?;
            tracing::info!("[KV] listening on {}", listener.local_addr());
            listener.config_mut().max_frame_length(usize::MAX);
            let server = BackendServer {
                tracer: server_tracer,
                store: Arc::new(DashMap::new()),
            };
            listener
                .filter_map(|r| future::ready(r.ok()))
                .map(server::BaseChannel::with_defaults)
                .map(|channel| channel.execute(server.clone().serve()).for_each(spawn))
                .buffer_unordered(10)
                .for_each(|_| async {})
                .await;
        },
    }

    Ok(())
}
