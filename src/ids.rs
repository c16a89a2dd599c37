//! Strongly-typed identifiers for the runtime kernel.
//!
//! Every cross-process reference in the kernel is a small validated newtype
//! rather than a bare integer or string, so illegal ids (empty roles,
//! correlation ids past the `2^53-1` wire-safe ceiling) are unrepresentable.

use nutype::nutype;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Upper bound for correlation ids: the largest integer a JSON number can
/// carry without precision loss (`2^53 - 1`), per spec §3 "Mailbox entry".
pub const MAX_CORRELATION_ID: u64 = (1u64 << 53) - 1;

/// Cluster-unique identifier of a node in the compute cluster.
#[nutype(
    derive(
        Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display,
        From, Into
    )
)]
pub struct NodeId(u32);

/// 1-based identifier of a worker process within a node; `0` denotes the
/// node's own master process ("place 0" per the GLOSSARY).
#[nutype(derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display,
    From, Into
))]
pub struct WorkerId(u16);

/// Numeric id of a web object (the agent's identity in the object store).
#[nutype(derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display,
    From, Into
))]
pub struct ObjectId(u64);

/// Cluster-unique identifier of a specific running frame, per spec §3.
#[nutype(derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From, Into
))]
pub struct Fid(Uuid);

impl Fid {
    /// Mints a fresh frame id.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// A role name; must start with `$` (e.g. `$agent`, `$leader`, `$master`).
#[nutype(
    sanitize(trim),
    validate(predicate = |s: &str| s.starts_with('$') && s.len() > 1),
    derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, Borrow)
)]
pub struct Role(String);

impl Role {
    /// The implicit default role every agent has.
    #[must_use]
    pub fn agent() -> Self {
        Self::try_new("$agent").expect("'$agent' is a valid role")
    }

    /// The pseudo-role of a node's master process.
    #[must_use]
    pub fn master() -> Self {
        Self::try_new("$master").expect("'$master' is a valid role")
    }

    /// The pseudo-role of a node's worker process.
    #[must_use]
    pub fn worker() -> Self {
        Self::try_new("$worker").expect("'$worker' is a valid role")
    }

    /// Whether `command` is private, i.e. its name starts with `_`
    /// (forces `Scope::Node` at most, per spec §4.4).
    #[must_use]
    pub fn is_private_command(command: &str) -> bool {
        command.starts_with('_')
    }
}

/// Mailbox correlation id. Wraps at [`MAX_CORRELATION_ID`] back to 1 (`0` is
/// reserved for fire-and-forget `notify` messages, per spec §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CorrelationId(u64);

impl CorrelationId {
    /// The sentinel used for fire-and-forget messages.
    pub const NOTIFY: Self = Self(0);

    /// Builds a correlation id, wrapping back to `1` once
    /// [`MAX_CORRELATION_ID`] is exceeded.
    #[must_use]
    pub fn next(prev: u64) -> Self {
        let n = prev.wrapping_add(1);
        if n == 0 || n > MAX_CORRELATION_ID {
            Self(1)
        } else {
            Self(n)
        }
    }

    /// Is this the fire-and-forget sentinel?
    #[must_use]
    pub fn is_notify(self) -> bool {
        self.0 == 0
    }

    /// Raw numeric value.
    #[must_use]
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correlation_id_wraps_at_ceiling() {
        let near_max = CorrelationId::next(MAX_CORRELATION_ID - 1);
        assert_eq!(near_max.value(), MAX_CORRELATION_ID);
        let wrapped = CorrelationId::next(MAX_CORRELATION_ID);
        assert_eq!(wrapped.value(), 1);
    }

    #[test]
    fn role_requires_dollar_prefix() {
        assert!(Role::try_new("agent").is_err());
        assert!(Role::try_new("$agent").is_ok());
        assert!(Role::try_new("$").is_err());
    }

    #[test]
    fn private_commands_start_with_underscore() {
        assert!(Role::is_private_command("_start_agent"));
        assert!(!Role::is_private_command("ping"));
    }
}
