//! Poisoned pipeline execution: inject a CI definition into one project,
//! run it, read the exported variables back from the job log, and remove
//! every artifact again.

pub mod payload;
pub mod session;

use std::fmt;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::context::ReconContext;
use crate::error::{CleanupWarning, ReconError};
use crate::hierarchy::{NodeId, Tier};

pub use payload::{Harvest, HarvestStatus};
pub use session::AttackSession;

// ---------------------------------------------------------------------------
// States
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttackState {
    Idle,
    Preparing,
    Triggered,
    Polling,
    Harvesting,
    CleaningUp,
    Succeeded,
    Failed,
}

impl AttackState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Allowed transitions. Idle may fail directly because nothing remote
    /// exists yet; every later state leaves through `CleaningUp`.
    pub fn can_transition_to(self, next: Self) -> bool {
        use AttackState::{
            CleaningUp, Failed, Harvesting, Idle, Polling, Preparing, Succeeded, Triggered,
        };
        matches!(
            (self, next),
            (Idle, Preparing | Failed)
                | (Preparing, Triggered | CleaningUp)
                | (Triggered, Polling | CleaningUp)
                | (Polling, Harvesting | CleaningUp)
                | (Harvesting, CleaningUp)
                | (CleaningUp, Succeeded | Failed)
        )
    }
}

impl fmt::Display for AttackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Preparing => "preparing",
            Self::Triggered => "triggered",
            Self::Polling => "polling",
            Self::Harvesting => "harvesting",
            Self::CleaningUp => "cleaning_up",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        })
    }
}

// ---------------------------------------------------------------------------
// Request / report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct AttackRequest {
    /// Full path or numeric id of the target project.
    pub project: Option<String>,
    /// Existing or new branch to inject on; generated when absent.
    pub branch: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HarvestedRecord {
    pub key: String,
    pub value: String,
    /// Where the effective value is defined, when that could be determined.
    pub source_tier: Option<Tier>,
}

#[derive(Debug, Clone)]
pub struct AttackReport {
    /// Correlates the report with the session's log lines.
    pub session: Uuid,
    pub project: Option<NodeId>,
    pub project_path: Option<String>,
    pub branch: Option<String>,
    pub branch_created: bool,
    pub pipeline_id: Option<u64>,
    pub job_id: Option<u64>,
    pub harvest: Option<HarvestStatus>,
    pub records: Vec<HarvestedRecord>,
    pub outcome: Result<(), ReconError>,
    pub cleanup_warnings: Vec<CleanupWarning>,
    /// Every state entered, starting with `Idle`.
    pub trace: Vec<AttackState>,
}

impl AttackReport {
    pub fn succeeded(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn error(&self) -> Option<&ReconError> {
        self.outcome.as_ref().err()
    }

    pub fn final_state(&self) -> AttackState {
        self.trace.last().copied().unwrap_or(AttackState::Idle)
    }

    pub fn cleanup_attempts(&self) -> usize {
        self.trace
            .iter()
            .filter(|s| **s == AttackState::CleaningUp)
            .count()
    }
}

/// Run one attack session to completion.
pub async fn run_attack(
    ctx: &ReconContext,
    request: AttackRequest,
    cancel: &CancellationToken,
) -> AttackReport {
    AttackSession::new(ctx).run(request, cancel).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use AttackState::*;

    const ALL: [AttackState; 8] = [
        Idle, Preparing, Triggered, Polling, Harvesting, CleaningUp, Succeeded, Failed,
    ];

    #[test]
    fn every_active_state_can_reach_cleanup() {
        for s in [Preparing, Triggered, Polling, Harvesting] {
            assert!(s.can_transition_to(CleaningUp), "{s} cannot clean up");
            assert!(!s.can_transition_to(Failed), "{s} skips cleanup");
            assert!(!s.can_transition_to(Succeeded), "{s} skips cleanup");
        }
    }

    #[test]
    fn idle_fails_without_cleanup() {
        assert!(Idle.can_transition_to(Failed));
        assert!(!Idle.can_transition_to(CleaningUp));
        assert!(!Idle.can_transition_to(Succeeded));
    }

    #[test]
    fn cleanup_is_entered_once() {
        assert!(!CleaningUp.can_transition_to(CleaningUp));
        assert!(CleaningUp.can_transition_to(Succeeded));
        assert!(CleaningUp.can_transition_to(Failed));
    }

    #[test]
    fn terminal_states_are_final() {
        for from in [Succeeded, Failed] {
            assert!(from.is_terminal());
            for to in ALL {
                assert!(!from.can_transition_to(to));
            }
        }
    }

    #[test]
    fn forward_path() {
        let path = [Idle, Preparing, Triggered, Polling, Harvesting, CleaningUp, Succeeded];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }
}
