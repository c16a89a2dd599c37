//! Deployment controllers (C9, spec §4.9): decide how many replicas of
//! `(object_id, role)` should run, where, and — for shard-partitioned
//! deployments — which slice of the keyspace each replica owns.
//!
//! [`GenericController`] runs N interchangeable replicas, load-balanced
//! through the atlas at call time. [`BlocksController`] additionally
//! assigns each replica a disjoint [`Shard`] of a fixed `base`, the way a
//! partitioned store divides its keyspace across workers.

use crate::atlas::Shard;
use crate::envelope::{EncodedArgs, RpcOptions, RpcRequest};
use crate::error::SchematError;
use crate::ids::{Fid, ObjectId, Role, WorkerId};
use crate::node::NodeAgent;
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tracing::{info, instrument};

/// A deployment policy: how many replicas of `(object_id, role)` run, and
/// where.
#[async_trait]
pub trait Controller: Send + Sync {
    /// Brings a fresh deployment of `object_id`/`role` up to `replicas`
    /// instances, returning the frame ids created.
    ///
    /// # Errors
    ///
    /// Propagates any `$master.start_agent` failure.
    async fn deploy(&self, node: &Arc<NodeAgent>, object_id: ObjectId, role: Role, replicas: u32) -> Result<Vec<Fid>, SchematError>;

    /// Scales an existing deployment to `replicas`, starting or stopping
    /// instances as needed.
    ///
    /// # Errors
    ///
    /// Propagates any `$master.start_agent`/`stop_agent` failure.
    async fn adjust_replicas(&self, node: &Arc<NodeAgent>, object_id: ObjectId, role: Role, replicas: u32) -> Result<Vec<Fid>, SchematError>;

    /// The distinct roles this controller currently tracks deployments
    /// for, for status/introspection.
    fn get_roles(&self, object_id: ObjectId) -> Vec<Role>;
}

async fn start_one(node: &Arc<NodeAgent>, object_id: ObjectId, role: &Role, worker: WorkerId) -> Result<Fid, SchematError> {
    let request = RpcRequest {
        rpc: (
            object_id,
            "start_agent".to_string(),
            EncodedArgs(vec![JsonValue::from(role.to_string())]),
        ),
        opts: RpcOptions {
            role: Some(Role::master()),
            worker: Some(worker),
            ..Default::default()
        },
    };
    let response = node.rpc(request).await;
    let (ret, _) = response.into_result()?;
    let raw = ret.and_then(|v| v.as_str().map(str::to_string)).ok_or_else(|| {
        SchematError::SchemaValue("start_agent did not return a fid".into())
    })?;
    let uuid = uuid::Uuid::parse_str(&raw).map_err(|e| SchematError::SchemaValue(e.to_string()))?;
    Ok(Fid::new(uuid))
}

async fn stop_one(node: &Arc<NodeAgent>, object_id: ObjectId, fid: Fid) -> Result<(), SchematError> {
    let request = RpcRequest {
        rpc: (
            object_id,
            "stop_agent".to_string(),
            EncodedArgs(vec![JsonValue::from(fid.to_string())]),
        ),
        opts: RpcOptions {
            role: Some(Role::master()),
            ..Default::default()
        },
    };
    node.rpc(request).await.into_result()?;
    Ok(())
}

/// Picks the `n`th worker to place a replica on, round-robining across
/// the node's spawned workers (or place 0 if none were spawned — the
/// single-process deployment shape used in tests and the demo).
fn worker_for_replica(node: &Arc<NodeAgent>, n: usize) -> WorkerId {
    let workers = node.worker_ids();
    if workers.is_empty() {
        WorkerId::new(0)
    } else {
        workers[n % workers.len()]
    }
}

/// N interchangeable replicas of an agent/role, load-balanced by the
/// atlas at call time rather than statically partitioned.
#[derive(Default)]
pub struct GenericController {
    deployments: DashMap<(ObjectId, Role), Vec<Fid>>,
}

#[async_trait]
impl Controller for GenericController {
    #[instrument(skip(self, node), fields(%object_id, %role, replicas))]
    async fn deploy(&self, node: &Arc<NodeAgent>, object_id: ObjectId, role: Role, replicas: u32) -> Result<Vec<Fid>, SchematError> {
        let mut fids = Vec::with_capacity(replicas as usize);
        for n in 0..replicas {
            let worker = worker_for_replica(node, n as usize);
            fids.push(start_one(node, object_id, &role, worker).await?);
        }
        self.deployments.insert((object_id, role), fids.clone());
        info!(count = fids.len(), "deployed generic controller replicas");
        Ok(fids)
    }

    async fn adjust_replicas(&self, node: &Arc<NodeAgent>, object_id: ObjectId, role: Role, replicas: u32) -> Result<Vec<Fid>, SchematError> {
        let current = self
            .deployments
            .get(&(object_id, role.clone()))
            .map(|e| e.value().clone())
            .unwrap_or_default();

        match (current.len() as u32).cmp(&replicas) {
            std::cmp::Ordering::Less => {
                let mut fids = current;
                for n in fids.len()..replicas as usize {
                    let worker = worker_for_replica(node, n);
                    fids.push(start_one(node, object_id, &role, worker).await?);
                }
                self.deployments.insert((object_id, role), fids.clone());
                Ok(fids)
            }
            std::cmp::Ordering::Greater => {
                let mut fids = current;
                while fids.len() as u32 > replicas {
                    if let Some(fid) = fids.pop() {
                        stop_one(node, object_id, fid).await?;
                    }
                }
                self.deployments.insert((object_id, role), fids.clone());
                Ok(fids)
            }
            std::cmp::Ordering::Equal => Ok(current),
        }
    }

    fn get_roles(&self, object_id: ObjectId) -> Vec<Role> {
        self.deployments
            .iter()
            .filter(|e| e.key().0 == object_id)
            .map(|e| e.key().1.clone())
            .collect()
    }
}

/// Replicas that each own a disjoint [`Shard`] of a fixed `base`,
/// partitioning the deployment's keyspace instead of load-balancing
/// identical instances.
#[derive(Default)]
pub struct BlocksController {
    deployments: DashMap<(ObjectId, Role), Vec<(Fid, Shard)>>,
}

impl BlocksController {
    /// The shard assignment for a deployed `(object_id, role)`, empty if
    /// nothing is deployed.
    #[must_use]
    pub fn shards_for(&self, object_id: ObjectId, role: &Role) -> Vec<(Fid, Shard)> {
        self.deployments
            .get(&(object_id, role.clone()))
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Controller for BlocksController {
    #[instrument(skip(self, node), fields(%object_id, %role, replicas))]
    async fn deploy(&self, node: &Arc<NodeAgent>, object_id: ObjectId, role: Role, replicas: u32) -> Result<Vec<Fid>, SchematError> {
        let base = replicas.max(1);
        let mut assignments = Vec::with_capacity(replicas as usize);
        for offset in 0..replicas {
            let worker = worker_for_replica(node, offset as usize);
            let fid = start_one(node, object_id, &role, worker).await?;
            assignments.push((fid, Shard::new(base, offset)));
        }
        crate::atlas::assert_no_duplicate_offsets(&assignments.iter().map(|(_, s)| *s).collect::<Vec<_>>())?;
        let fids = assignments.iter().map(|(fid, _)| *fid).collect();
        self.deployments.insert((object_id, role), assignments);
        Ok(fids)
    }

    async fn adjust_replicas(&self, node: &Arc<NodeAgent>, object_id: ObjectId, role: Role, replicas: u32) -> Result<Vec<Fid>, SchematError> {
        // Repartitioning the keyspace changes every shard's base, so a
        // resize tears down and redeploys rather than incrementally
        // adding/removing members (spec §4.9: "Blocks deployments resize
        // by full redeployment, never by growing the shard count in
        // place").
        let previous = self.deployments.remove(&(object_id, role.clone()));
        if let Some((_, assignments)) = previous {
            for (fid, _) in assignments {
                stop_one(node, object_id, fid).await?;
            }
        }
        self.deploy(node, object_id, role, replicas).await
    }

    fn get_roles(&self, object_id: ObjectId) -> Vec<Role> {
        self.deployments
            .iter()
            .filter(|e| e.key().0 == object_id)
            .map(|e| e.key().1.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::EchoAgent;
    use crate::atlas::{GlobalAtlas, LocalAtlas};
    use crate::ids::NodeId;
    use crate::kernel::MasterKernel;
    use std::time::Duration;

    fn test_node() -> Arc<NodeAgent> {
        let local = Arc::new(LocalAtlas::default());
        let global = Arc::new(GlobalAtlas::default());
        let master = Arc::new(MasterKernel::new(NodeId::new(1), local, global));
        NodeAgent::new(NodeId::new(1), master, Duration::from_secs(1))
    }

    #[tokio::test]
    async fn generic_controller_deploys_requested_replica_count() {
        let node = test_node();
        let object_id = ObjectId::new(1);
        node.register_factory(object_id, move || Arc::new(EchoAgent::concurrent(object_id, Duration::from_secs(60))));

        let controller = GenericController::default();
        let fids = controller.deploy(&node, object_id, Role::agent(), 3).await.unwrap();
        assert_eq!(fids.len(), 3);
        assert_eq!(controller.get_roles(object_id), vec![Role::agent()]);
    }

    #[tokio::test]
    async fn generic_controller_scales_down() {
        let node = test_node();
        let object_id = ObjectId::new(2);
        node.register_factory(object_id, move || Arc::new(EchoAgent::concurrent(object_id, Duration::from_secs(60))));

        let controller = GenericController::default();
        controller.deploy(&node, object_id, Role::agent(), 3).await.unwrap();
        let fids = controller.adjust_replicas(&node, object_id, Role::agent(), 1).await.unwrap();
        assert_eq!(fids.len(), 1);
    }

    #[tokio::test]
    async fn blocks_controller_assigns_disjoint_shards() {
        let node = test_node();
        let object_id = ObjectId::new(3);
        node.register_factory(object_id, move || Arc::new(EchoAgent::concurrent(object_id, Duration::from_secs(60))));

        let controller = BlocksController::default();
        controller.deploy(&node, object_id, Role::agent(), 4).await.unwrap();
        let shards = controller.shards_for(object_id, &Role::agent());
        assert_eq!(shards.len(), 4);
        let mut offsets: Vec<u32> = shards.iter().map(|(_, s)| s.offset).collect();
        offsets.sort_unstable();
        assert_eq!(offsets, vec![0, 1, 2, 3]);
    }
}
