//! The node agent (C8, spec §4.8): resolves an [`RpcRequest`] to a place
//! to run it — locally, on a sibling worker via IPC, or on another node
//! via TCP — and carries the built-in `$master`/`$worker` control
//! commands used to start and stop agents.
//!
//! Routing follows five steps: (1) `$master`/`$worker` commands are
//! handled directly, bypassing normal dispatch; (2) an explicit
//! `opts.worker` pin routes straight to that place; (3) otherwise the
//! node's own atlas is consulted for a local match; (4) failing that, a
//! cluster-scoped request escalates to the global atlas, either picking
//! one node or (5) broadcasting to every node currently serving the role.

use crate::agent::{Agent, CallContext};
use crate::atlas::Atlas;
use crate::envelope::{RpcRequest, RpcResponse, Scope};
use crate::error::SchematError;
use crate::ids::{Fid, NodeId, ObjectId, Role, WorkerId};
use crate::kernel::{Kernel, MasterKernel};
use crate::transport::ipc::{IpcChannel, WorkerProcess};
use crate::transport::tcp::TcpSender;
use dashmap::DashMap;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, instrument, warn};
use uuid::Uuid;

type AgentFactory = dyn Fn() -> Arc<dyn Agent> + Send + Sync;

struct WorkerLink {
    channel: Arc<IpcChannel>,
    process: AsyncMutex<WorkerProcess>,
}

/// Per-node orchestrator: owns the master kernel, the links to this
/// node's worker processes, and the TCP connections to peer nodes.
pub struct NodeAgent {
    node_id: NodeId,
    master: Arc<MasterKernel>,
    workers: DashMap<WorkerId, Arc<WorkerLink>>,
    peers: DashMap<NodeId, Arc<TcpSender>>,
    factories: DashMap<ObjectId, Arc<AgentFactory>>,
    timeout: Duration,
}

impl NodeAgent {
    /// Builds a node agent around an already-constructed master kernel.
    #[must_use]
    pub fn new(node_id: NodeId, master: Arc<MasterKernel>, timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            node_id,
            master,
            workers: DashMap::new(),
            peers: DashMap::new(),
            factories: DashMap::new(),
            timeout,
        })
    }

    /// This node's id.
    #[must_use]
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Registers a TCP link to a peer node, used by cluster-scope routing
    /// (spec §4.2, §4.5).
    pub fn register_peer(&self, node_id: NodeId, sender: Arc<TcpSender>) {
        self.peers.insert(node_id, sender);
    }

    /// The worker ids currently spawned on this node, sorted ascending.
    /// Used by [`crate::placement`] controllers to spread replicas.
    #[must_use]
    pub fn worker_ids(&self) -> Vec<WorkerId> {
        let mut ids: Vec<WorkerId> = self.workers.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Registers how to construct a fresh agent instance for `object_id`.
    /// The object model that would normally supply this (schemas,
    /// property imputation) is out of scope (spec §1); callers (tests,
    /// the single-process demo binary) install factories directly.
    pub fn register_factory<F>(&self, object_id: ObjectId, factory: F)
    where
        F: Fn() -> Arc<dyn Agent> + Send + Sync + 'static,
    {
        self.factories.insert(object_id, Arc::new(factory));
    }

    /// Spawns a worker process and wires its stdio as an IPC channel
    /// (spec §4.3, §4.7).
    ///
    /// # Errors
    ///
    /// Returns [`SchematError::Io`]/[`SchematError::Fatal`] if the
    /// process cannot be spawned or its stdio was not piped.
    #[instrument(skip(self, command), fields(%worker_id))]
    pub fn spawn_worker(&self, worker_id: WorkerId, command: Command) -> Result<(), SchematError> {
        let callback = crate::mailbox::callback_fn(|_msg| async move {
            // Workers only push informational events upstream today
            // (none defined yet); acknowledge without a value.
            Ok(None)
        });
        let process = WorkerProcess::spawn(command, self.timeout, callback)?;
        let channel = process.channel();
        self.workers.insert(
            worker_id,
            Arc::new(WorkerLink {
                channel,
                process: AsyncMutex::new(process),
            }),
        );
        info!("worker process spawned");
        Ok(())
    }

    /// Executes `request`, never propagating a Rust error: failures are
    /// folded into [`RpcResponse::failed`], matching spec §4.4's "errors
    /// travel in-band, not as a transport-level fault".
    pub async fn rpc(self: &Arc<Self>, request: RpcRequest) -> RpcResponse {
        match self.rpc_inner(request).await {
            Ok(response) => response,
            Err(e) => RpcResponse::failed(&e),
        }
    }

    async fn rpc_inner(self: &Arc<Self>, request: RpcRequest) -> Result<RpcResponse, SchematError> {
        let command = request.command().to_string();
        let scope = request.opts.effective_scope(&command);
        let role = request.opts.role_or_default();

        // Step 1: built-in node-control roles bypass agent dispatch.
        if role == Role::master() {
            return self.handle_master_command(&command, &request).await;
        }
        if role == Role::worker() {
            return self.handle_worker_command(&command, &request).await;
        }

        // Step 2: an explicit worker pin routes straight there.
        if let Some(worker) = request.opts.worker {
            return self.deliver_to_place(worker, request).await;
        }

        // Step 3: this node's own atlas.
        let ranked = self.master.local_atlas().rank_places(request.agent_id(), &role);
        if let Some(&place) = ranked.first() {
            return self.deliver_to_place(place, request).await;
        }

        // Steps 4/5: escalate cluster-wide if scope allows it.
        if scope == Scope::Cluster {
            if request.opts.broadcast {
                return self.broadcast_cluster(request).await;
            }
            return self.forward_cluster(request).await;
        }

        Err(SchematError::NotDeployed {
            agent: request.agent_id(),
            role: role.to_string(),
        })
    }

    async fn deliver_to_place(&self, place: WorkerId, request: RpcRequest) -> Result<RpcResponse, SchematError> {
        if place == WorkerId::new(0) {
            return self.deliver_locally(request).await;
        }
        let link = self.workers.get(&place).map(|e| Arc::clone(e.value())).ok_or_else(|| {
            SchematError::FrameNotFound {
                agent: request.agent_id(),
                role: request.command().to_string(),
            }
        })?;
        let payload = serde_json::to_value(&request)?;
        let raw = link.channel.mailbox().send(payload).await?;
        match raw {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(RpcResponse::default()),
        }
    }

    async fn deliver_locally(&self, request: RpcRequest) -> Result<RpcResponse, SchematError> {
        let role = request.opts.role_or_default();
        let frame = self
            .master
            .find(request.agent_id(), &role)
            .into_iter()
            .next()
            .ok_or_else(|| SchematError::FrameNotFound {
                agent: request.agent_id(),
                role: role.to_string(),
            })?;
        let ctx = CallContext::new(request.opts.ctx.clone(), request.opts.tx.clone());
        let ret = frame.exec(request.command(), request.rpc.2.as_slice().to_vec(), &ctx).await?;
        Ok(RpcResponse::ok(ret, ctx.take_records()))
    }

    async fn forward_cluster(&self, request: RpcRequest) -> Result<RpcResponse, SchematError> {
        let role = request.opts.role_or_default();
        let ranked = self.master.global_atlas().rank_places(request.agent_id(), &role);
        let Some(&node) = ranked.first() else {
            return Err(SchematError::NotDeployed {
                agent: request.agent_id(),
                role: role.to_string(),
            });
        };
        self.forward_to_node(node, request).await
    }

    async fn broadcast_cluster(&self, request: RpcRequest) -> Result<RpcResponse, SchematError> {
        let role = request.opts.role_or_default();
        let targets = self.master.global_atlas().by_id_role(request.agent_id(), &role);
        if targets.is_empty() {
            return Err(SchematError::NotDeployed {
                agent: request.agent_id(),
                role: role.to_string(),
            });
        }
        let mut per_node_results = Vec::with_capacity(targets.len());
        let mut records = Vec::new();
        for target in targets {
            let mut single = request.clone();
            single.opts.broadcast = false;
            single.opts.node = Some(target.place);
            let response = match self.forward_to_node(target.place, single).await {
                Ok(r) => r,
                Err(e) => RpcResponse::failed(&e),
            };
            records.extend(response.records.iter().cloned());
            per_node_results.push(serde_json::to_value(&response)?);
        }
        Ok(RpcResponse::ok(JsonValue::Array(per_node_results), records))
    }

    async fn forward_to_node(&self, node: NodeId, request: RpcRequest) -> Result<RpcResponse, SchematError> {
        let sender = self
            .peers
            .get(&node)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| SchematError::Fatal(format!("no peer connection to node {node}")))?;
        let payload = serde_json::to_value(&request)?;
        let raw = match sender.mailbox().send(payload).await {
            Ok(v) => v,
            Err(SchematError::Ipc { message, cause }) => return Err(SchematError::Rpc { message, cause }),
            Err(other) => return Err(other),
        };
        match raw {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(RpcResponse::default()),
        }
    }

    async fn handle_master_command(&self, command: &str, request: &RpcRequest) -> Result<RpcResponse, SchematError> {
        match command {
            "start_agent" => self.master_start_agent(request).await,
            "stop_agent" => self.master_stop_agent(request).await,
            other => Err(SchematError::NotFound(format!("$master.{other}"))),
        }
    }

    async fn master_start_agent(&self, request: &RpcRequest) -> Result<RpcResponse, SchematError> {
        let object_id = request.agent_id();
        let role = role_arg(request, 0)?;
        let place = request.opts.worker.unwrap_or(WorkerId::new(0));
        let factory = self.factory_for(object_id)?;

        let fid = if place == WorkerId::new(0) {
            self.master.start_agent(factory(), role.clone()).await?
        } else {
            let inner = RpcRequest {
                rpc: (object_id, "_start_agent".into(), request.rpc.2.clone()),
                opts: crate::envelope::RpcOptions {
                    role: Some(Role::worker()),
                    worker: Some(place),
                    scope: Some(Scope::Node),
                    ..Default::default()
                },
            };
            let response = self.deliver_to_place(place, inner).await?;
            let (ret, _) = response.into_result()?;
            let fid = parse_fid(ret)?;
            self.master.local_atlas().insert(crate::atlas::RoutingRecord {
                fid: Some(fid),
                object_id,
                role: role.clone(),
                place,
                load: 0,
            });
            fid
        };
        info!(%object_id, %place, %fid, "$master.start_agent");
        Ok(RpcResponse::ok(JsonValue::from(fid.to_string()), Vec::new()))
    }

    async fn master_stop_agent(&self, request: &RpcRequest) -> Result<RpcResponse, SchematError> {
        let fid = parse_fid(request.rpc.2.as_slice().first().cloned())?;
        let record = self
            .master
            .local_atlas()
            .by_fid(fid)
            .ok_or_else(|| SchematError::FrameNotFound {
                agent: request.agent_id(),
                role: "unknown".into(),
            })?;
        if record.place == WorkerId::new(0) {
            self.master.stop_agent(fid).await?;
        } else {
            let inner = RpcRequest {
                rpc: (request.agent_id(), "_stop_agent".into(), crate::envelope::EncodedArgs(vec![JsonValue::from(fid.to_string())])),
                opts: crate::envelope::RpcOptions {
                    role: Some(Role::worker()),
                    worker: Some(record.place),
                    scope: Some(Scope::Node),
                    ..Default::default()
                },
            };
            self.deliver_to_place(record.place, inner).await?.into_result()?;
            self.master.local_atlas().remove_by_fid(fid);
        }
        Ok(RpcResponse::ok(JsonValue::Null, Vec::new()))
    }

    /// Handles `$worker._start_agent`/`_stop_agent` against this node's
    /// own in-process kernel. Real (separate-process) workers handle
    /// these themselves against their own `WorkerKernel`; this path
    /// serves single-process deployments where place 0 hosts everything.
    async fn handle_worker_command(&self, command: &str, request: &RpcRequest) -> Result<RpcResponse, SchematError> {
        if !Role::is_private_command(command) {
            return Err(SchematError::NotFound(format!("$worker.{command} is not a recognized command")));
        }
        match command {
            "_start_agent" => {
                let object_id = request.agent_id();
                let role = role_arg(request, 0)?;
                let factory = self.factory_for(object_id)?;
                let fid = self.master.start_agent(factory(), role).await?;
                Ok(RpcResponse::ok(JsonValue::from(fid.to_string()), Vec::new()))
            }
            "_stop_agent" => {
                let fid = parse_fid(request.rpc.2.as_slice().first().cloned())?;
                self.master.stop_agent(fid).await?;
                Ok(RpcResponse::ok(JsonValue::Null, Vec::new()))
            }
            other => Err(SchematError::NotFound(format!("$worker.{other}"))),
        }
    }

    fn factory_for(&self, object_id: ObjectId) -> Result<Arc<AgentFactory>, SchematError> {
        self.factories
            .get(&object_id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| SchematError::NotFound(format!("no agent factory registered for {object_id}")))
    }

    /// Waits for every worker process to exit, logging any unexpected
    /// exit status. Used by the daemon's shutdown path.
    pub async fn wait_for_workers(&self) {
        for entry in self.workers.iter() {
            let mut process = entry.value().process.lock().await;
            match process.wait().await {
                Ok(status) if status.success() => {}
                Ok(status) => warn!(worker = %entry.key(), %status, "worker exited with non-zero status"),
                Err(e) => warn!(worker = %entry.key(), error = %e, "error waiting for worker"),
            }
        }
    }
}

fn role_arg(request: &RpcRequest, index: usize) -> Result<Role, SchematError> {
    let raw = request
        .rpc
        .2
        .as_slice()
        .get(index)
        .and_then(JsonValue::as_str)
        .unwrap_or("$agent");
    Role::try_new(raw).map_err(|e| SchematError::SchemaValue(e.to_string()))
}

fn parse_fid(value: Option<JsonValue>) -> Result<Fid, SchematError> {
    let raw = value
        .and_then(|v| v.as_str().map(str::to_string))
        .ok_or_else(|| SchematError::SchemaValue("expected a fid string".into()))?;
    let uuid = Uuid::parse_str(&raw).map_err(|e| SchematError::SchemaValue(e.to_string()))?;
    Ok(Fid::new(uuid))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::EchoAgent;
    use crate::atlas::{GlobalAtlas, LocalAtlas};
    use crate::envelope::RpcOptions;

    fn test_node() -> Arc<NodeAgent> {
        let local = Arc::new(LocalAtlas::default());
        let global = Arc::new(GlobalAtlas::default());
        let master = Arc::new(MasterKernel::new(NodeId::new(1), local, global));
        NodeAgent::new(NodeId::new(1), master, Duration::from_secs(1))
    }

    #[tokio::test]
    async fn master_start_agent_then_rpc_reaches_frame() {
        let node = test_node();
        let object_id = ObjectId::new(100);
        node.register_factory(object_id, move || Arc::new(EchoAgent::new(object_id, Duration::from_secs(60))));

        let start = RpcRequest {
            rpc: (object_id, "start_agent".into(), crate::envelope::EncodedArgs(vec![JsonValue::from("$agent")])),
            opts: RpcOptions {
                role: Some(Role::master()),
                ..Default::default()
            },
        };
        let response = node.rpc(start).await;
        assert!(response.err.is_none(), "{:?}", response.err);

        let ping = RpcRequest::new(object_id, "ping", vec![JsonValue::from(99)]);
        let response = node.rpc(ping).await;
        let (ret, _) = response.into_result().unwrap();
        assert_eq!(ret, Some(JsonValue::from(99)));
    }

    #[tokio::test]
    async fn rpc_against_undeployed_agent_is_not_deployed() {
        let node = test_node();
        let request = RpcRequest::new(ObjectId::new(5), "ping", vec![]);
        let response = node.rpc(request).await;
        assert!(response.err.is_some());
        let err = response.err.unwrap().decode();
        assert!(matches!(err, SchematError::NotDeployed { .. }));
    }

    #[tokio::test]
    async fn master_stop_agent_removes_routing_record() {
        let node = test_node();
        let object_id = ObjectId::new(200);
        node.register_factory(object_id, move || Arc::new(EchoAgent::new(object_id, Duration::from_secs(60))));

        let start = RpcRequest {
            rpc: (object_id, "start_agent".into(), crate::envelope::EncodedArgs(vec![JsonValue::from("$agent")])),
            opts: RpcOptions {
                role: Some(Role::master()),
                ..Default::default()
            },
        };
        let started = node.rpc(start).await;
        let (fid_value, _) = started.into_result().unwrap();
        let fid = parse_fid(fid_value).unwrap();

        let stop = RpcRequest {
            rpc: (object_id, "stop_agent".into(), crate::envelope::EncodedArgs(vec![JsonValue::from(fid.to_string())])),
            opts: RpcOptions {
                role: Some(Role::master()),
                ..Default::default()
            },
        };
        let stopped = node.rpc(stop).await;
        assert!(stopped.err.is_none(), "{:?}", stopped.err);
        assert!(node.master.local_atlas().by_fid(fid).is_none());
    }
}
