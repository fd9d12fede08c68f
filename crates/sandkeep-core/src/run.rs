use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use crate::ids::{NodeId, OverlayId, SandboxId, SnapshotId, TemplateId};

/// Lifecycle status of a [`SandboxRun`]. Only a run has runtime state;
/// requests, templates and policies are immutable once admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Scheduled,
    Preparing,
    Running,
    Pausing,
    Sleeping,
    Terminating,
    Succeeded,
    Failed,
    Canceled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Scheduled => "scheduled",
            Self::Preparing => "preparing",
            Self::Running => "running",
            Self::Pausing => "pausing",
            Self::Sleeping => "sleeping",
            Self::Terminating => "terminating",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        };
        write!(f, "{s}")
    }
}

/// Validate that a status transition is allowed.
///
/// Only the owning node may advance a non-terminal run,
/// except the control plane may advance `Pending -> Canceled` before a
/// lease exists; that carve-out is enforced by the caller (the control
/// plane never holds a node-scoped writer for any other transition), not
/// by this pure function, which only knows the state shapes.
pub fn validate_transition(from: RunStatus, to: RunStatus) -> Result<()> {
    use RunStatus::*;

    if from.is_terminal() {
        bail!("cannot transition out of terminal status {from}");
    }

    let valid = matches!(
        (from, to),
        (Pending, Scheduled)
            | (Pending, Canceled)
            | (Scheduled, Preparing)
            | (Scheduled, Canceled)
            | (Scheduled, Failed)
            | (Preparing, Running)
            | (Preparing, Failed)
            | (Preparing, Canceled)
            | (Running, Pausing)
            | (Running, Terminating)
            | (Running, Failed)
            | (Pausing, Sleeping)
            | (Pausing, Running)
            | (Pausing, Failed)
            | (Sleeping, Running)
            | (Sleeping, Terminating)
            | (Terminating, Succeeded)
            | (Terminating, Failed)
    );

    if valid {
        Ok(())
    } else {
        bail!("invalid run status transition: {from} -> {to}")
    }
}

/// A single sandbox execution, owned exclusively by `node_id` while
/// non-terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxRun {
    pub id: SandboxId,
    pub template_id: TemplateId,
    pub node_id: Option<NodeId>,
    pub status: RunStatus,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub ended_at: Option<chrono::DateTime<chrono::Utc>>,
    pub exit_code: Option<i32>,
    pub overlay_id: Option<OverlayId>,
    pub tap_device: Option<String>,
    pub ip: Option<String>,
    pub snapshot_id: Option<SnapshotId>,
    pub last_event_at: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl SandboxRun {
    pub fn pending(id: SandboxId, template_id: TemplateId, now: chrono::DateTime<chrono::Utc>) -> Self {
        Self {
            id,
            template_id,
            node_id: None,
            status: RunStatus::Pending,
            started_at: None,
            ended_at: None,
            exit_code: None,
            overlay_id: None,
            tap_device: None,
            ip: None,
            snapshot_id: None,
            last_event_at: now,
            error_message: None,
        }
    }

    /// Advance `self.status`, validating the transition, and stamp
    /// `last_event_at`. Returns an error without mutating on an invalid
    /// transition.
    pub fn transition(&mut self, to: RunStatus, now: chrono::DateTime<chrono::Utc>) -> Result<()> {
        validate_transition(self.status, to)?;
        self.status = to;
        self.last_event_at = now;
        if to == RunStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if to.is_terminal() {
            self.ended_at = Some(now);
        }
        Ok(())
    }
}
