//! The RPC request/response envelope (C4, spec §4.4 and §6 "RPC wire
//! format").

use crate::agent::TxHandle;
use crate::ids::{NodeId, ObjectId, Role, WorkerId};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Routing restriction attached to an RPC (spec §4.4, GLOSSARY "Scope").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// May travel anywhere in the cluster.
    Cluster,
    /// Restricted to the current node.
    Node,
    /// Restricted to the current process (no IPC/TCP hop at all).
    Process,
}

impl Scope {
    /// The most restrictive of `self` and `other`.
    #[must_use]
    pub fn clamp_to(self, other: Self) -> Self {
        use Scope::{Cluster, Node, Process};
        match (self, other) {
            (Process, _) | (_, Process) => Process,
            (Node, _) | (_, Node) => Node,
            (Cluster, Cluster) => Cluster,
        }
    }
}

/// Routing and execution options carried alongside an RPC call (spec §4.4).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RpcOptions {
    /// Routing restriction; `None` means the implicit default (`Cluster`,
    /// narrowed to `Node` automatically for private commands).
    #[serde(default)]
    pub scope: Option<Scope>,
    /// Explicit worker index, when the caller already knows the placement.
    #[serde(default)]
    pub worker: Option<WorkerId>,
    /// Explicit target node id.
    #[serde(default)]
    pub node: Option<NodeId>,
    /// Target role string; default is `$agent`.
    #[serde(default)]
    pub role: Option<Role>,
    /// Deliver to every known deployment instead of a single chosen one.
    #[serde(default)]
    pub broadcast: bool,
    /// Current database/app id.
    #[serde(default)]
    pub ctx: Option<JsonValue>,
    /// Caller's transaction descriptor, re-entered at the target.
    #[serde(default)]
    pub tx: TxHandle,
    /// Caller-provided timeout override, in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl RpcOptions {
    /// Resolves the effective role, defaulting to `$agent`.
    #[must_use]
    pub fn role_or_default(&self) -> Role {
        self.role.clone().unwrap_or_else(Role::agent)
    }

    /// Resolves the effective scope: the caller's request, narrowed to
    /// `Node` for private (`_`-prefixed) commands per spec §4.4.
    #[must_use]
    pub fn effective_scope(&self, command: &str) -> Scope {
        let requested = self.scope.unwrap_or(Scope::Cluster);
        if Role::is_private_command(command) {
            requested.clamp_to(Scope::Node)
        } else {
            requested
        }
    }
}

/// Encoded, JSON-safe argument list. Trailing `null`s are truncated;
/// interior `null`s are preserved (spec §4.4).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EncodedArgs(pub Vec<JsonValue>);

impl EncodedArgs {
    /// Encodes a raw argument list: replaces missing/undefined-like
    /// interior values with `null`, then truncates trailing `null`s.
    #[must_use]
    pub fn encode(mut args: Vec<Option<JsonValue>>) -> Self {
        while matches!(args.last(), Some(None)) {
            args.pop();
        }
        let values = args
            .into_iter()
            .map(|a| a.unwrap_or(JsonValue::Null))
            .collect();
        Self(values)
    }

    /// Borrow the argument list.
    #[must_use]
    pub fn as_slice(&self) -> &[JsonValue] {
        &self.0
    }

    /// Consumes self, returning the argument list.
    #[must_use]
    pub fn into_vec(self) -> Vec<JsonValue> {
        self.0
    }
}

/// An RPC request: `{"rpc": [agentId, command, encodedArgs], ...opts}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    /// `(target agent id, command name, encoded args)`.
    pub rpc: (ObjectId, String, EncodedArgs),
    /// Routing/execution options.
    #[serde(flatten)]
    pub opts: RpcOptions,
}

impl RpcRequest {
    /// Builds a request with default options.
    #[must_use]
    pub fn new(agent: ObjectId, command: impl Into<String>, args: Vec<JsonValue>) -> Self {
        Self {
            rpc: (
                agent,
                command.into(),
                EncodedArgs::encode(args.into_iter().map(Some).collect()),
            ),
            opts: RpcOptions::default(),
        }
    }

    /// Target agent id.
    #[must_use]
    pub fn agent_id(&self) -> ObjectId {
        self.rpc.0
    }

    /// Command name.
    #[must_use]
    pub fn command(&self) -> &str {
        &self.rpc.1
    }
}

/// An RPC response: `{ret?, err?, records?}` (spec §4.4).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RpcResponse {
    /// The command's return value, when it succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ret: Option<JsonValue>,
    /// The encoded error, when it failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<crate::error::EncodedError>,
    /// Object mutations captured during execution, for the caller to
    /// refresh its local registry.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub records: Vec<JsonValue>,
}

impl RpcResponse {
    /// A successful response carrying `ret` and any mutation records.
    #[must_use]
    pub fn ok(ret: JsonValue, records: Vec<JsonValue>) -> Self {
        Self {
            ret: Some(ret),
            err: None,
            records,
        }
    }

    /// A failed response.
    #[must_use]
    pub fn failed(err: &crate::error::SchematError) -> Self {
        Self {
            ret: None,
            err: Some(err.encode()),
            records: Vec::new(),
        }
    }

    /// Converts into a `Result`, decoding `err` back into a
    /// [`crate::error::SchematError`] when present.
    ///
    /// # Errors
    ///
    /// Returns the decoded error when this response carries one.
    pub fn into_result(self) -> Result<(Option<JsonValue>, Vec<JsonValue>), crate::error::SchematError> {
        match self.err {
            Some(encoded) => Err(encoded.decode()),
            None => Ok((self.ret, self.records)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoded_args_truncates_trailing_nulls_keeps_interior() {
        let args = EncodedArgs::encode(vec![Some(JsonValue::from(1)), None, Some(JsonValue::from(3)), None]);
        assert_eq!(
            args.as_slice(),
            &[JsonValue::from(1), JsonValue::Null, JsonValue::from(3)]
        );
    }

    #[test]
    fn private_command_clamps_scope_to_node() {
        let opts = RpcOptions {
            scope: Some(Scope::Cluster),
            ..Default::default()
        };
        assert_eq!(opts.effective_scope("_start_agent"), Scope::Node);
        assert_eq!(opts.effective_scope("ping"), Scope::Cluster);
    }

    #[test]
    fn response_without_ret_is_distinct_from_null() {
        let response = RpcResponse {
            ret: None,
            err: None,
            records: Vec::new(),
        };
        let (ret, _) = response.into_result().unwrap();
        assert_eq!(ret, None);

        let response_null = RpcResponse {
            ret: Some(JsonValue::Null),
            err: None,
            records: Vec::new(),
        };
        let (ret_null, _) = response_null.into_result().unwrap();
        assert_eq!(ret_null, Some(JsonValue::Null));
    }
}
