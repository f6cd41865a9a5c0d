//! In-memory job lifecycle.

use serde::{Deserialize, Serialize};

/// Worker-side job state.
///
/// State transitions:
/// ```text
/// CREATED → RUNNING → {SUSPENDED | DONE | FAILED}
///              ↑          ↓
///              └──────────┘
/// ```
/// Any live state may drop to ABANDONED when the backend rejects a write; the
/// persisted record is then someone else's to recover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Created,
    Running,
    Suspended,
    Done,
    Failed,
    Abandoned,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Done | JobState::Failed | JobState::Abandoned)
    }

    pub fn can_transition_to(self, to: JobState) -> bool {
        match (self, to) {
            (JobState::Created, JobState::Running) => true,
            (JobState::Running, JobState::Suspended) => true,
            (JobState::Running, JobState::Done) => true,
            (JobState::Running, JobState::Failed) => true,
            (JobState::Suspended, JobState::Running) => true,
            // Cancel observed in a checkpoint reply
            (JobState::Suspended, JobState::Failed) => true,
            (from, JobState::Abandoned) => !from.is_terminal(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_transitions() {
        assert!(JobState::Created.can_transition_to(JobState::Running));
        assert!(JobState::Running.can_transition_to(JobState::Suspended));
        assert!(JobState::Suspended.can_transition_to(JobState::Running));
        assert!(JobState::Running.can_transition_to(JobState::Done));
        assert!(JobState::Suspended.can_transition_to(JobState::Abandoned));
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(!JobState::Created.can_transition_to(JobState::Done));
        assert!(!JobState::Done.can_transition_to(JobState::Running));
        assert!(!JobState::Failed.can_transition_to(JobState::Abandoned));
        assert!(!JobState::Suspended.can_transition_to(JobState::Done));
    }
}
