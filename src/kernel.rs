//! The per-process kernel (C7, spec §4.7): owns every [`Frame`] running in
//! this process, indexes them into a [`LocalAtlas`], and shuts them down
//! in the reverse of their creation order so dependents stop before the
//! agents they depend on.
//!
//! [`WorkerKernel`] runs inside an ordinary worker process, hosting
//! regular agent frames. [`MasterKernel`] runs in a node's place-0
//! process, additionally owning the node-wide [`GlobalAtlas`] and the
//! frames for node-scoped pseudo-agents (`$master`, the placement
//! controller).

use crate::agent::Agent;
use crate::atlas::{Atlas, GlobalAtlas, LocalAtlas, RoutingRecord};
use crate::error::SchematError;
use crate::frame::Frame;
use crate::ids::{Fid, NodeId, ObjectId, Role, WorkerId};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::{Arc, Mutex};
use tracing::{info, instrument, warn};

/// Operations every kernel flavor exposes to the node-level RPC router
/// (spec §4.8 steps that resolve a local frame).
#[async_trait]
pub trait Kernel: Send + Sync {
    /// This process's place within its node (`0` for a master process).
    fn place(&self) -> WorkerId;

    /// Starts `agent` under `role`, returning its new frame id.
    async fn start_agent(&self, agent: Arc<dyn Agent>, role: Role) -> Result<Fid, SchematError>;

    /// Hot-swaps the agent reference backing an existing frame, keeping
    /// its `fid` and routing record intact.
    async fn refresh_agent(&self, fid: Fid, new_agent: Arc<dyn Agent>) -> Result<(), SchematError>;

    /// Stops and deregisters a frame.
    async fn stop_agent(&self, fid: Fid) -> Result<(), SchematError>;

    /// Looks up a frame by id.
    fn frame(&self, fid: Fid) -> Option<Arc<Frame>>;

    /// All frames currently serving `(object_id, role)` locally.
    fn find(&self, object_id: ObjectId, role: &Role) -> Vec<Arc<Frame>>;

    /// Stops every frame, reverse creation order first.
    async fn shutdown(&self);
}

/// Shared bookkeeping used by both [`WorkerKernel`] and [`MasterKernel`]:
/// the live frame table, a creation-order log, and the local atlas those
/// frames are indexed into.
struct FrameRegistry {
    place: WorkerId,
    frames: DashMap<Fid, Arc<Frame>>,
    creation_order: Mutex<Vec<Fid>>,
    atlas: Arc<LocalAtlas>,
}

impl FrameRegistry {
    fn new(place: WorkerId, atlas: Arc<LocalAtlas>) -> Self {
        Self {
            place,
            frames: DashMap::new(),
            creation_order: Mutex::new(Vec::new()),
            atlas,
        }
    }

    /// Creates and registers the frame *before* calling `start()` (spec
    /// §4.7: "creates the Frame, registers it before calling `start()`,
    /// then delegates to `Frame.start`"), so a `start` hook that issues a
    /// self-directed RPC can already find its own frame. If `start` fails,
    /// the registration is rolled back.
    #[instrument(skip(self, agent), fields(place = %self.place, role = %role))]
    async fn start_agent(&self, agent: Arc<dyn Agent>, role: Role) -> Result<Fid, SchematError> {
        let frame = Frame::new(agent, role.clone());
        let fid = frame.fid();
        let object_id = frame.object_id();

        self.frames.insert(fid, Arc::clone(&frame));
        self.creation_order.lock().expect("creation order lock poisoned").push(fid);
        self.atlas.insert(RoutingRecord {
            fid: Some(fid),
            object_id,
            role,
            place: self.place,
            load: 0,
        });

        if let Err(e) = frame.start().await {
            self.frames.remove(&fid);
            self.creation_order.lock().expect("creation order lock poisoned").retain(|f| *f != fid);
            self.atlas.remove_by_fid(fid);
            return Err(e);
        }

        info!(%fid, %object_id, "agent started");
        Ok(fid)
    }

    async fn refresh_agent(&self, fid: Fid, new_agent: Arc<dyn Agent>) -> Result<(), SchematError> {
        let frame = self
            .frames
            .get(&fid)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| SchematError::FrameNotFound {
                agent: new_agent.id(),
                role: "unknown".into(),
            })?;
        frame.hot_swap(new_agent).await
    }

    async fn stop_agent(&self, fid: Fid) -> Result<(), SchematError> {
        let Some((_, frame)) = self.frames.remove(&fid) else {
            return Err(SchematError::FrameNotFound {
                agent: ObjectId::new(0),
                role: "unknown".into(),
            });
        };
        self.atlas.remove_by_fid(fid);
        self.creation_order
            .lock()
            .expect("creation order lock poisoned")
            .retain(|f| *f != fid);
        frame.stop().await
    }

    fn frame(&self, fid: Fid) -> Option<Arc<Frame>> {
        self.frames.get(&fid).map(|e| Arc::clone(e.value()))
    }

    fn find(&self, object_id: ObjectId, role: &Role) -> Vec<Arc<Frame>> {
        self.atlas
            .by_id_role(object_id, role)
            .into_iter()
            .filter_map(|record| self.frame(record.fid?))
            .collect()
    }

    /// Stops every frame in the reverse of its start order (spec §4.7).
    async fn shutdown_all(&self) {
        let order = {
            let mut guard = self.creation_order.lock().expect("creation order lock poisoned");
            std::mem::take(&mut *guard)
        };
        for fid in order.into_iter().rev() {
            if let Some((_, frame)) = self.frames.remove(&fid) {
                self.atlas.remove_by_fid(fid);
                if let Err(e) = frame.stop().await {
                    warn!(%fid, error = %e, "error stopping frame during shutdown");
                }
            }
        }
    }
}

/// The kernel running inside an ordinary worker process.
pub struct WorkerKernel {
    registry: FrameRegistry,
}

impl WorkerKernel {
    /// Builds a worker kernel at `worker_id`, indexing into `atlas`.
    #[must_use]
    pub fn new(worker_id: WorkerId, atlas: Arc<LocalAtlas>) -> Self {
        Self {
            registry: FrameRegistry::new(worker_id, atlas),
        }
    }
}

#[async_trait]
impl Kernel for WorkerKernel {
    fn place(&self) -> WorkerId {
        self.registry.place
    }

    async fn start_agent(&self, agent: Arc<dyn Agent>, role: Role) -> Result<Fid, SchematError> {
        self.registry.start_agent(agent, role).await
    }

    async fn refresh_agent(&self, fid: Fid, new_agent: Arc<dyn Agent>) -> Result<(), SchematError> {
        self.registry.refresh_agent(fid, new_agent).await
    }

    async fn stop_agent(&self, fid: Fid) -> Result<(), SchematError> {
        self.registry.stop_agent(fid).await
    }

    fn frame(&self, fid: Fid) -> Option<Arc<Frame>> {
        self.registry.frame(fid)
    }

    fn find(&self, object_id: ObjectId, role: &Role) -> Vec<Arc<Frame>> {
        self.registry.find(object_id, role)
    }

    async fn shutdown(&self) {
        self.registry.shutdown_all().await;
    }
}

/// The kernel running in a node's place-0 process: everything
/// [`WorkerKernel`] does, plus ownership of the node-wide
/// [`GlobalAtlas`] used to answer cluster-scope routing questions
/// (spec §4.7 "the master is just worker 0 with one extra
/// responsibility").
pub struct MasterKernel {
    node_id: NodeId,
    registry: FrameRegistry,
    global_atlas: Arc<GlobalAtlas>,
}

impl MasterKernel {
    /// Builds the master kernel for `node_id`.
    #[must_use]
    pub fn new(node_id: NodeId, local_atlas: Arc<LocalAtlas>, global_atlas: Arc<GlobalAtlas>) -> Self {
        Self {
            node_id,
            registry: FrameRegistry::new(WorkerId::new(0), local_atlas),
            global_atlas,
        }
    }

    /// This node's id.
    #[must_use]
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// The node-wide atlas this master maintains.
    #[must_use]
    pub fn global_atlas(&self) -> Arc<GlobalAtlas> {
        Arc::clone(&self.global_atlas)
    }

    /// The node-local atlas, shared with the `NodeAgent` so it can
    /// register routing records for frames hosted on sibling worker
    /// processes (whose `Frame` objects live outside this kernel).
    #[must_use]
    pub fn local_atlas(&self) -> Arc<LocalAtlas> {
        Arc::clone(&self.registry.atlas)
    }

    /// Publishes (or refreshes) this node's claim to serve `(object_id,
    /// role)`, for the cluster-wide atlas. A single node may host several
    /// workers all serving the same role; at the global scope they
    /// collapse to one [`RoutingRecord`] per node (spec §4.5's "the
    /// global atlas ranks nodes, the local atlas ranks workers within the
    /// chosen node").
    pub fn publish_global_record(&self, fid: Fid, object_id: ObjectId, role: Role, load: u32) {
        self.global_atlas.insert(RoutingRecord {
            fid: Some(fid),
            object_id,
            role,
            place: self.node_id,
            load,
        });
    }
}

#[async_trait]
impl Kernel for MasterKernel {
    fn place(&self) -> WorkerId {
        self.registry.place
    }

    async fn start_agent(&self, agent: Arc<dyn Agent>, role: Role) -> Result<Fid, SchematError> {
        self.registry.start_agent(agent, role).await
    }

    async fn refresh_agent(&self, fid: Fid, new_agent: Arc<dyn Agent>) -> Result<(), SchematError> {
        self.registry.refresh_agent(fid, new_agent).await
    }

    async fn stop_agent(&self, fid: Fid) -> Result<(), SchematError> {
        self.registry.stop_agent(fid).await
    }

    fn frame(&self, fid: Fid) -> Option<Arc<Frame>> {
        self.registry.frame(fid)
    }

    fn find(&self, object_id: ObjectId, role: &Role) -> Vec<Arc<Frame>> {
        self.registry.find(object_id, role)
    }

    async fn shutdown(&self) {
        self.registry.shutdown_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::EchoAgent;
    use std::time::Duration;

    #[tokio::test]
    async fn start_then_find_resolves_via_atlas() {
        let atlas = Arc::new(LocalAtlas::default());
        let kernel = WorkerKernel::new(WorkerId::new(1), atlas);
        let agent = Arc::new(EchoAgent::new(ObjectId::new(42), Duration::from_secs(60)));
        let fid = kernel.start_agent(agent, Role::agent()).await.unwrap();

        let found = kernel.find(ObjectId::new(42), &Role::agent());
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].fid(), fid);
    }

    #[tokio::test]
    async fn stop_agent_removes_from_atlas() {
        let atlas = Arc::new(LocalAtlas::default());
        let kernel = WorkerKernel::new(WorkerId::new(1), atlas);
        let agent = Arc::new(EchoAgent::new(ObjectId::new(7), Duration::from_secs(60)));
        let fid = kernel.start_agent(agent, Role::agent()).await.unwrap();
        kernel.stop_agent(fid).await.unwrap();
        assert!(kernel.find(ObjectId::new(7), &Role::agent()).is_empty());
        assert!(kernel.frame(fid).is_none());
    }

    #[tokio::test]
    async fn shutdown_stops_frames_in_reverse_creation_order() {
        let atlas = Arc::new(LocalAtlas::default());
        let kernel = WorkerKernel::new(WorkerId::new(1), atlas);
        let mut fids = Vec::new();
        for i in 0..3 {
            let agent = Arc::new(EchoAgent::new(ObjectId::new(i), Duration::from_secs(60)));
            fids.push(kernel.start_agent(agent, Role::agent()).await.unwrap());
        }
        kernel.shutdown().await;
        for fid in fids {
            assert!(kernel.frame(fid).is_none());
        }
    }

    #[tokio::test]
    async fn refresh_agent_preserves_fid() {
        let atlas = Arc::new(LocalAtlas::default());
        let kernel = WorkerKernel::new(WorkerId::new(1), atlas);
        let agent = Arc::new(EchoAgent::new(ObjectId::new(9), Duration::from_secs(60)));
        let fid = kernel.start_agent(agent, Role::agent()).await.unwrap();

        let new_agent = Arc::new(EchoAgent::concurrent(ObjectId::new(9), Duration::from_secs(60)));
        kernel.refresh_agent(fid, new_agent).await.unwrap();
        let frame = kernel.frame(fid).unwrap();
        assert_eq!(frame.fid(), fid);
        assert!(frame.current_agent().concurrent());
    }
}
