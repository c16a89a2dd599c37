//! Structured observability: a `tracing` subscriber builder shared by
//! both binaries, and the event payloads emitted around frame lifecycle
//! transitions for anything downstream that wants them as data rather
//! than log lines.

use crate::ids::{Fid, NodeId, ObjectId, Role, WorkerId};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

/// Initializes the process-wide `tracing` subscriber: JSON output,
/// `RUST_LOG`-driven filtering defaulting to `info` for this crate.
///
/// # Errors
///
/// Returns an error if `RUST_LOG` (or the default directive) fails to
/// parse.
pub fn init_tracing() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("schemat_runtime=info"))?;
    tracing_subscriber::fmt().with_env_filter(filter).json().init();
    Ok(())
}

/// A frame's lifecycle transition, for consumers (metrics exporters,
/// audit logs) that want structured data instead of parsing log text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FrameEventKind {
    /// The frame finished `start` and began serving calls.
    Started,
    /// The frame's agent reference was hot-swapped.
    Reloaded,
    /// The frame was paused.
    Paused,
    /// A paused frame resumed serving calls.
    Resumed,
    /// The frame finished `stop` and was deregistered.
    Stopped,
    /// A call against the frame failed.
    CallFailed {
        /// The command that failed.
        command: String,
        /// The error kind (see [`crate::error::SchematError::kind`]).
        kind: String,
    },
}

/// A structured frame lifecycle event (spec §4.6's state machine,
/// externalized for observability rather than control flow).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameEvent {
    /// The frame this event describes.
    pub fid: Fid,
    /// The agent's object id.
    pub object_id: ObjectId,
    /// The role the frame serves.
    pub role: Role,
    /// The node this frame is running on.
    pub node_id: NodeId,
    /// The worker place within that node.
    pub worker_id: WorkerId,
    /// What happened.
    pub kind: FrameEventKind,
}

impl FrameEvent {
    /// Emits this event as a structured `tracing` event at an
    /// appropriate level (`CallFailed` logs as a warning, everything
    /// else as info).
    pub fn emit(&self) {
        match &self.kind {
            FrameEventKind::CallFailed { command, kind } => {
                tracing::warn!(
                    fid = %self.fid,
                    object_id = %self.object_id,
                    role = %self.role,
                    node_id = %self.node_id,
                    worker_id = %self.worker_id,
                    command,
                    error_kind = kind,
                    "frame call failed"
                );
            }
            other => {
                tracing::info!(
                    fid = %self.fid,
                    object_id = %self.object_id,
                    role = %self.role,
                    node_id = %self.node_id,
                    worker_id = %self.worker_id,
                    event = ?other,
                    "frame lifecycle event"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_event_serializes_round_trip() {
        let event = FrameEvent {
            fid: Fid::generate(),
            object_id: ObjectId::new(1),
            role: Role::agent(),
            node_id: NodeId::new(1),
            worker_id: WorkerId::new(2),
            kind: FrameEventKind::Started,
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: FrameEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.fid, event.fid);
    }

    #[test]
    fn call_failed_event_emits_without_panicking() {
        let event = FrameEvent {
            fid: Fid::generate(),
            object_id: ObjectId::new(1),
            role: Role::agent(),
            node_id: NodeId::new(1),
            worker_id: WorkerId::new(0),
            kind: FrameEventKind::CallFailed {
                command: "ping".to_string(),
                kind: "NotFound".to_string(),
            },
        };
        event.emit();
    }
}
