//! # Schemat Runtime
//!
//! The cluster runtime kernel for Schemat, a distributed object platform:
//! agent lifecycle and frame supervision, the routing atlas that resolves
//! a call to a place to run it, and the RPC/IPC/TCP transport that
//! carries calls across worker and node boundaries.
//!
//! ## Architecture
//!
//! - [`ids`] / [`error`] / [`envelope`] — the shared vocabulary: typed
//!   identifiers, the closed error set, and the RPC request/response
//!   wire shapes.
//! - [`agent`] — the narrow trait boundary the (out-of-scope) object
//!   model implements against.
//! - [`mailbox`] — correlation-id request/response multiplexing over a
//!   single ordered line stream.
//! - [`transport`] — the IPC (worker sibling) and TCP (peer node)
//!   concrete transports built on [`mailbox`].
//! - [`atlas`] — the routing index, at both worker and node scope, plus
//!   the shard arithmetic used to partition deployments.
//! - [`recurrent`] — the jittered periodic scheduler shared by scheduled
//!   restarts and agent background ticks.
//! - [`frame`] — the per-agent state machine: start/stop, pause/resume,
//!   hot reload, and call dispatch.
//! - [`kernel`] — the per-process registry of frames, in worker and
//!   master flavors.
//! - [`node`] — the node-level RPC router tying kernels, workers, and
//!   peer nodes together.
//! - [`placement`] — deployment controllers that decide replica counts
//!   and (for sharded deployments) keyspace partitioning.
//! - [`collections`] — small utility containers used throughout.
//! - [`config`] — cluster bootstrap manifests and the persisted
//!   deployment table.
//! - [`observability`] — structured logging setup and frame lifecycle
//!   events.

pub mod agent;
pub mod atlas;
pub mod collections;
pub mod config;
pub mod envelope;
pub mod error;
pub mod frame;
pub mod ids;
pub mod kernel;
pub mod mailbox;
pub mod node;
pub mod observability;
pub mod placement;
pub mod recurrent;
pub mod transport;

pub use agent::{Agent, CallContext, TxHandle};
pub use atlas::{Atlas, GlobalAtlas, LocalAtlas, Place, RoutingRecord, Shard};
pub use envelope::{EncodedArgs, RpcOptions, RpcRequest, RpcResponse, Scope};
pub use error::{EncodedError, SchematError};
pub use frame::{Frame, FrameState};
pub use ids::{CorrelationId, Fid, NodeId, ObjectId, Role, WorkerId};
pub use kernel::{Kernel, MasterKernel, WorkerKernel};
pub use node::NodeAgent;
