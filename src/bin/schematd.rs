//! `schematd` — the Schemat runtime launcher.
//!
//! A node's master process (`WORKER_ID` absent or `0`) loads the cluster
//! manifest, brings up its master kernel and node agent, spawns its
//! worker processes, and optionally listens for peer-node TCP
//! connections. A worker process (`WORKER_ID >= 1`) instead serves its
//! parent master over stdio, per spec §6 "CLI surface of the runtime
//! launcher".

use clap::Parser;
use dashmap::DashMap;
use schemat_runtime::agent::{Agent, CallContext};
use schemat_runtime::atlas::{Atlas, GlobalAtlas, LocalAtlas};
use schemat_runtime::config::ClusterManifest;
use schemat_runtime::envelope::{RpcRequest, RpcResponse};
use schemat_runtime::error::SchematError;
use schemat_runtime::ids::{NodeId, ObjectId, WorkerId};
use schemat_runtime::kernel::{Kernel, MasterKernel, WorkerKernel};
use schemat_runtime::node::NodeAgent;
use serde_json::Value as JsonValue;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{error, info, warn};

/// Demo object id the echo agent is registered under, since the real
/// object model (schemas, property imputation) is out of scope and has
/// no concrete agent types of its own (spec §1).
const DEMO_OBJECT_ID: u64 = 0;

const IPC_TIMEOUT: Duration = Duration::from_secs(10);
const RETRY_BACKOFF: Duration = Duration::from_millis(200);
const MAX_CONNECT_ATTEMPTS: u32 = 10;

#[derive(Parser, Debug)]
#[command(version = env!("CARGO_PKG_VERSION"), about = "Schemat cluster runtime launcher")]
struct Args {
    /// Path to the cluster bootstrap manifest (YAML). Without one, the
    /// kernel uses an empty default manifest.
    #[arg(long)]
    config: Option<std::path::PathBuf>,

    /// Node selector; a trailing `.<int>` names this node's id (e.g.
    /// `us-east.1` selects node id 1).
    #[arg(long, default_value = "local.1")]
    node: String,

    /// Number of worker processes to spawn under this node's master.
    #[arg(long, default_value_t = 0)]
    workers: u32,

    /// Bind host for the edge server (reserved; the HTTP/edge surface is
    /// out of scope for this kernel).
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Bind port for the edge server (reserved; see `--host`).
    #[arg(long, default_value_t = 0)]
    port: u16,

    /// Override of this node's peer TCP port; `0` disables the peer
    /// listener.
    #[arg(long, default_value_t = 0)]
    tcp_port: u16,
}

fn node_id_from_selector(selector: &str) -> NodeId {
    let trailing = selector.rsplit('.').next().unwrap_or(selector);
    let raw: u32 = trailing.parse().unwrap_or(1);
    NodeId::new(raw)
}

#[tokio::main]
async fn main() {
    let worker_id: u16 = std::env::var("WORKER_ID").ok().and_then(|v| v.parse().ok()).unwrap_or(0);

    if let Err(e) = schemat_runtime::observability::init_tracing() {
        eprintln!("failed to initialize logging: {e}");
        std::process::exit(1);
    }

    let exit_code = if worker_id == 0 {
        run_master().await
    } else {
        run_worker(WorkerId::new(worker_id)).await
    };
    std::process::exit(exit_code);
}

async fn run_master() -> i32 {
    let args = Args::parse();
    let node_id = node_id_from_selector(&args.node);

    let manifest = match &args.config {
        Some(path) => match ClusterManifest::load_from_file(path) {
            Ok(m) => m,
            Err(e) => {
                error!(error = %e, path = %path.display(), "failed to load cluster manifest");
                return 1;
            }
        },
        None => ClusterManifest::default_manifest(),
    };
    info!(%node_id, rings = manifest.bootstrap_rings.len(), "booting master");

    let local_atlas = Arc::new(LocalAtlas::default());
    let global_atlas = Arc::new(GlobalAtlas::default());
    let master = Arc::new(MasterKernel::new(node_id, local_atlas, global_atlas));
    let node = NodeAgent::new(node_id, Arc::clone(&master), IPC_TIMEOUT);

    node.register_factory(ObjectId::new(DEMO_OBJECT_ID), || {
        Arc::new(schemat_runtime::agent::EchoAgent::new(ObjectId::new(DEMO_OBJECT_ID), Duration::from_secs(60)))
    });

    dial_bootstrap_rings(&node, &manifest).await;

    let exe = match std::env::current_exe() {
        Ok(p) => p,
        Err(e) => {
            error!(error = %e, "could not resolve own executable path to spawn workers");
            return 1;
        }
    };
    for n in 1..=args.workers {
        let mut command = Command::new(&exe);
        command.env("WORKER_ID", n.to_string());
        if let Err(e) = node.spawn_worker(WorkerId::new(u16::try_from(n).unwrap_or(u16::MAX)), command) {
            error!(worker = n, error = %e, "failed to spawn worker process");
            return 1;
        }
    }
    info!(count = args.workers, "worker processes spawned");

    let mut tcp_task = None;
    if args.tcp_port != 0 {
        let addr: SocketAddr = match format!("{}:{}", args.host, args.tcp_port).parse() {
            Ok(a) => a,
            Err(e) => {
                error!(error = %e, "invalid --host/--tcp-port combination");
                return 1;
            }
        };
        match schemat_runtime::transport::tcp::TcpReceiver::bind(addr).await {
            Ok(receiver) => {
                info!(%addr, "listening for peer node connections");
                let node_for_peers = Arc::clone(&node);
                tcp_task = Some(tokio::spawn(async move {
                    let result = receiver
                        .serve(IPC_TIMEOUT, move |_peer| {
                            let node = Arc::clone(&node_for_peers);
                            schemat_runtime::mailbox::callback_fn(move |msg| {
                                let node = Arc::clone(&node);
                                async move { handle_remote_rpc(node, msg).await }
                            })
                        })
                        .await;
                    if let Err(e) = result {
                        error!(error = %e, "tcp listener stopped");
                    }
                }));
            }
            Err(e) => {
                error!(error = %e, %addr, "failed to bind peer tcp listener");
                return 1;
            }
        }
    }

    if args.port != 0 {
        warn!(host = %args.host, port = args.port, "edge server binding requested but the HTTP edge surface is out of scope for this kernel; ignoring");
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(e) => error!(error = %e, "failed to listen for shutdown signal"),
    }

    if let Some(handle) = tcp_task {
        handle.abort();
    }
    master.shutdown().await;
    node.wait_for_workers().await;
    info!("master shut down cleanly");
    0
}

/// Dials every peer named in the manifest's bootstrap rings and registers
/// the resulting links with `node` so cluster-scope RPCs can reach them.
/// Ring files list one `<node_id>@<host>:<port>` entry per line; blank
/// lines and `#`-prefixed comments are ignored.
async fn dial_bootstrap_rings(node: &Arc<NodeAgent>, manifest: &ClusterManifest) {
    for ring in &manifest.bootstrap_rings {
        let raw = match tokio::fs::read_to_string(&ring.file).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(ring = %ring.name, file = %ring.file, error = %e, "could not read bootstrap ring file");
                continue;
            }
        };
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((id_part, addr_part)) = line.split_once('@') else {
                warn!(ring = %ring.name, entry = line, "skipping malformed bootstrap ring entry");
                continue;
            };
            let (Ok(raw_id), Ok(addr)) = (id_part.parse::<u32>(), addr_part.parse::<SocketAddr>()) else {
                warn!(ring = %ring.name, entry = line, "skipping malformed bootstrap ring entry");
                continue;
            };
            let peer_node_id = NodeId::new(raw_id);
            if peer_node_id == node.node_id() {
                continue;
            }
            let node_for_peer = Arc::clone(node);
            let callback = schemat_runtime::mailbox::callback_fn(move |msg| {
                let node = Arc::clone(&node_for_peer);
                async move { handle_remote_rpc(node, msg).await }
            });
            match schemat_runtime::transport::tcp::TcpSender::connect_with_retry(
                addr,
                IPC_TIMEOUT,
                MAX_CONNECT_ATTEMPTS,
                RETRY_BACKOFF,
                callback,
            )
            .await
            {
                Ok(sender) => {
                    node.register_peer(peer_node_id, sender);
                    info!(ring = %ring.name, %peer_node_id, %addr, "joined bootstrap ring peer");
                }
                Err(e) => warn!(ring = %ring.name, %peer_node_id, %addr, error = %e, "could not dial bootstrap ring peer"),
            }
        }
    }
}

async fn handle_remote_rpc(node: Arc<NodeAgent>, msg: JsonValue) -> Result<Option<JsonValue>, SchematError> {
    let request: RpcRequest = serde_json::from_value(msg)?;
    let response = node.rpc(request).await;
    Ok(Some(serde_json::to_value(response)?))
}

/// Runs this process as a worker: serves `$worker`-scoped agent commands
/// over stdio to the parent master, using its own small in-process
/// factory registry (the out-of-scope object model's stand-in, as in
/// [`schemat_runtime::node::NodeAgent`]).
async fn run_worker(worker_id: WorkerId) -> i32 {
    info!(%worker_id, "booting worker");
    let atlas = Arc::new(LocalAtlas::default());
    let kernel = Arc::new(WorkerKernel::new(worker_id, atlas));

    type Factory = dyn Fn() -> Arc<dyn Agent> + Send + Sync;
    let factories: Arc<DashMap<ObjectId, Arc<Factory>>> = Arc::new(DashMap::new());
    factories.insert(
        ObjectId::new(DEMO_OBJECT_ID),
        Arc::new(|| Arc::new(schemat_runtime::agent::EchoAgent::new(ObjectId::new(DEMO_OBJECT_ID), Duration::from_secs(60))) as Arc<dyn Agent>),
    );

    let (out_tx, out_rx) = mpsc::unbounded_channel::<String>();
    let writer_task = spawn_stdio_writer(tokio::io::stdout(), out_rx);

    let kernel_for_callback = Arc::clone(&kernel);
    let factories_for_callback = Arc::clone(&factories);
    let callback = schemat_runtime::mailbox::callback_fn(move |msg| {
        let kernel = Arc::clone(&kernel_for_callback);
        let factories = Arc::clone(&factories_for_callback);
        async move { handle_worker_rpc(kernel, factories, msg).await }
    });
    let mailbox = schemat_runtime::mailbox::Mailbox::new(out_tx, IPC_TIMEOUT, callback);

    let reader_mailbox = Arc::clone(&mailbox);
    let reader_task = spawn_stdio_reader(tokio::io::stdin(), move |line| {
        let mailbox = Arc::clone(&reader_mailbox);
        async move { mailbox.on_line(&line).await }
    });

    let _ = reader_task.await;
    mailbox.close();
    writer_task.abort();
    kernel.shutdown().await;
    info!(%worker_id, "worker shut down");
    0
}

async fn handle_worker_rpc(
    kernel: Arc<WorkerKernel>,
    factories: Arc<DashMap<ObjectId, Arc<dyn Fn() -> Arc<dyn Agent> + Send + Sync>>>,
    msg: JsonValue,
) -> Result<Option<JsonValue>, SchematError> {
    let request: RpcRequest = serde_json::from_value(msg)?;
    let role = request.opts.role_or_default();
    let response = match request.command() {
        "_start_agent" => {
            let object_id = request.agent_id();
            let factory = factories
                .get(&object_id)
                .map(|e| Arc::clone(e.value()))
                .ok_or_else(|| SchematError::NotFound(format!("no agent factory registered for {object_id}")))?;
            let target_role = request
                .rpc
                .2
                .as_slice()
                .first()
                .and_then(JsonValue::as_str)
                .map(schemat_runtime::ids::Role::try_new)
                .transpose()
                .map_err(|e| SchematError::SchemaValue(e.to_string()))?
                .unwrap_or_else(schemat_runtime::ids::Role::agent);
            let fid = kernel.start_agent(factory(), target_role).await?;
            RpcResponse::ok(JsonValue::from(fid.to_string()), Vec::new())
        }
        "_stop_agent" => {
            let raw = request
                .rpc
                .2
                .as_slice()
                .first()
                .and_then(JsonValue::as_str)
                .ok_or_else(|| SchematError::SchemaValue("expected a fid string".into()))?;
            let uuid = uuid::Uuid::parse_str(raw).map_err(|e| SchematError::SchemaValue(e.to_string()))?;
            kernel.stop_agent(schemat_runtime::ids::Fid::new(uuid)).await?;
            RpcResponse::ok(JsonValue::Null, Vec::new())
        }
        _ => {
            let frame = kernel
                .find(request.agent_id(), &role)
                .into_iter()
                .next()
                .ok_or_else(|| SchematError::FrameNotFound {
                    agent: request.agent_id(),
                    role: role.to_string(),
                })?;
            let ctx = CallContext::new(request.opts.ctx.clone(), request.opts.tx.clone());
            let ret = frame.exec(request.command(), request.rpc.2.as_slice().to_vec(), &ctx).await?;
            RpcResponse::ok(ret, ctx.take_records())
        }
    };
    Ok(Some(serde_json::to_value(response)?))
}

fn spawn_stdio_writer<W>(writer: W, mut rx: mpsc::UnboundedReceiver<String>) -> tokio::task::JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        use futures::SinkExt;
        let mut framed = FramedWrite::new(writer, LinesCodec::new());
        while let Some(line) = rx.recv().await {
            if framed.send(line).await.is_err() {
                break;
            }
        }
    })
}

fn spawn_stdio_reader<R, F, Fut>(reader: R, mut handler: F) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    F: FnMut(String) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        use futures::StreamExt;
        let mut framed = FramedRead::new(reader, LinesCodec::new());
        while let Some(line) = framed.next().await {
            match line {
                Ok(line) => handler(line).await,
                Err(e) => {
                    tracing::error!(error = %e, "stdio read error");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_selector_parses_trailing_integer() {
        assert_eq!(node_id_from_selector("us-east.7"), NodeId::new(7));
        assert_eq!(node_id_from_selector("12"), NodeId::new(12));
    }

    #[test]
    fn node_selector_without_integer_defaults_to_one() {
        assert_eq!(node_id_from_selector("not-a-number"), NodeId::new(1));
    }
}
