//! Error types for the runtime kernel.
//!
//! Mirrors spec §7: a closed set of error kinds the core must distinguish,
//! plus the tagged sum type used to carry errors across a process boundary
//! (spec §9 "Serialization of errors across processes").

use crate::ids::{NodeId, ObjectId, WorkerId};
use serde::{Deserialize, Serialize};

/// Main error type for runtime kernel operations.
#[derive(Debug, thiserror::Error)]
pub enum SchematError {
    /// URL path not routable, or object id not present in the store.
    #[error("not found: {0}")]
    NotFound(String),

    /// A mailbox request outlived its budget.
    #[error("response timeout for message {0}")]
    Timeout(String),

    /// A remote failure reported over IPC, wrapping the decoded cause.
    #[error("error processing request: {message}")]
    Ipc {
        /// Human-readable label.
        message: String,
        /// The decoded remote error.
        #[source]
        cause: Box<SchematError>,
    },

    /// A remote failure reported over TCP, wrapping the decoded cause.
    #[error("error processing request: {message}")]
    Rpc {
        /// Human-readable label.
        message: String,
        /// The decoded remote error.
        #[source]
        cause: Box<SchematError>,
    },

    /// Raised by a frame to reject new calls once `stopping` is set.
    #[error("frame is stopping, retry on another host")]
    StoppingNow,

    /// Raised by argument validation inside an agent method.
    #[error("schema/value error: {0}")]
    SchemaValue(String),

    /// Unrecoverable boot failure or worker crash; aborts the process.
    #[error("fatal: {0}")]
    Fatal(String),

    /// No frame is registered for the given (agent, role) pair.
    #[error("no frame for agent {agent} role {role}")]
    FrameNotFound {
        /// The target agent id.
        agent: ObjectId,
        /// The target role.
        role: String,
    },

    /// No deployment exists anywhere in the cluster for (agent, role).
    #[error("agent {agent} role {role} is not deployed anywhere")]
    NotDeployed {
        /// The target agent id.
        agent: ObjectId,
        /// The target role.
        role: String,
    },

    /// A nested `lock()` was attempted on a frame already held exclusively
    /// by the current call chain.
    #[error("nested lock on frame for agent {0}")]
    NestedLock(ObjectId),

    /// Invariant violation in shard arithmetic (spec §4.5: at most one
    /// offset may be shared between two shards of a common base).
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Wraps a lower-level I/O failure (socket, pipe).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Wraps a JSON (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SchematError {
    /// Stable tag used on the wire (`EncodedError::kind`), so a caller on
    /// the far side of a process boundary can match on error kind without
    /// depending on any language's exception class identity (spec §9).
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NotFound",
            Self::Timeout(_) => "Timeout",
            Self::Ipc { .. } => "IpcError",
            Self::Rpc { .. } => "RpcError",
            Self::StoppingNow => "StoppingNow",
            Self::SchemaValue(_) => "SchemaValue",
            Self::Fatal(_) => "Fatal",
            Self::FrameNotFound { .. } => "FrameNotFound",
            Self::NotDeployed { .. } => "NotDeployed",
            Self::NestedLock(_) => "NestedLock",
            Self::InvariantViolation(_) => "InvariantViolation",
            Self::Io(_) => "Io",
            Self::Serialization(_) => "Serialization",
        }
    }

    /// Encode for the wire (spec §4.4: a response's `err` field).
    #[must_use]
    pub fn encode(&self) -> EncodedError {
        let cause = match self {
            Self::Ipc { cause, .. } | Self::Rpc { cause, .. } => Some(Box::new(cause.encode())),
            _ => None,
        };
        EncodedError {
            kind: self.kind().to_string(),
            message: self.to_string(),
            cause,
        }
    }

    /// Attach additional diagnostic fields before rethrowing at the
    /// originator, matching the source's `_rich_exception` (spec §7).
    #[must_use]
    pub fn enrich(self, node: NodeId, worker: WorkerId, request_json: &str) -> RichError {
        RichError {
            error: self,
            node,
            worker,
            request_json: request_json.to_string(),
        }
    }
}

/// A [`SchematError`] decorated with the context the originator observed,
/// for diagnostics. Never itself crosses the wire — only [`EncodedError`]
/// does.
#[derive(Debug, thiserror::Error)]
#[error("{error} (node={node}, worker={worker})")]
pub struct RichError {
    /// The underlying error.
    pub error: SchematError,
    /// Node the request was issued from.
    pub node: NodeId,
    /// Worker the request was issued from.
    pub worker: WorkerId,
    /// The originating request, serialized, for post-mortem debugging.
    pub request_json: String,
}

/// Tagged sum type carried across process boundaries (spec §4.4, §9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncodedError {
    /// Stable error kind tag (see [`SchematError::kind`]).
    pub kind: String,
    /// Human-readable message.
    pub message: String,
    /// Optional nested cause (for `IpcError`/`RpcError`).
    pub cause: Option<Box<EncodedError>>,
}

impl EncodedError {
    /// Decode back into a [`SchematError`], preserving the remote kind so
    /// callers can match on it (spec §7 "IPC_Error / RPC_Error").
    #[must_use]
    pub fn decode(self) -> SchematError {
        match self.kind.as_str() {
            "NotFound" => SchematError::NotFound(self.message),
            "Timeout" => SchematError::Timeout(self.message),
            "StoppingNow" => SchematError::StoppingNow,
            "SchemaValue" => SchematError::SchemaValue(self.message),
            "Fatal" => SchematError::Fatal(self.message),
            "InvariantViolation" => SchematError::InvariantViolation(self.message),
            _ => SchematError::SchemaValue(self.message),
        }
    }

    /// Wrap a decoded error as an `IpcError`, per spec §7 propagation
    /// policy ("the target encodes the error ... Mailbox on receipt
    /// rejects the correlated future").
    #[must_use]
    pub fn into_ipc_error(self, label: impl Into<String>) -> SchematError {
        SchematError::Ipc {
            message: label.into(),
            cause: Box::new(self.decode()),
        }
    }

    /// Wrap a decoded error as an `RpcError` (TCP hop variant).
    #[must_use]
    pub fn into_rpc_error(self, label: impl Into<String>) -> SchematError {
        SchematError::Rpc {
            message: label.into(),
            cause: Box::new(self.decode()),
        }
    }
}
