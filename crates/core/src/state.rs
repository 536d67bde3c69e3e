//! Job lifecycle state machine.
//!
//! - no status, `Waiting`, `Throttled`, `Failed` → `Executing`, `Waiting`,
//!   `Throttled`, `Aborted`
//! - `Executing` → `Succeeded`, `Failed`, `Waiting`, `Throttled`, `Aborted`
//!
//! `Succeeded` and `Aborted` are terminal. A job with no status row yet is
//! treated as waiting.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// State recorded by a job status row.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Waiting,
    Executing,
    Succeeded,
    Failed,
    Aborted,
    Throttled,
}

impl JobState {
    pub const ALL: [JobState; 6] = [
        JobState::Waiting,
        JobState::Executing,
        JobState::Succeeded,
        JobState::Failed,
        JobState::Aborted,
        JobState::Throttled,
    ];

    /// Persisted representation (also used in artifact file names).
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Executing => "executing",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Aborted => "aborted",
            JobState::Throttled => "throttled",
        }
    }

    /// No further status is accepted once a job reaches a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Aborted)
    }

    /// States exported by failed-only archival.
    pub fn is_failure(&self) -> bool {
        matches!(self, JobState::Failed | JobState::Aborted)
    }

    /// Whether a job whose latest state is `latest` can be handed to a consumer.
    ///
    /// `Failed` jobs are pickable once their retry time has passed; that check
    /// needs a clock and is left to the store.
    pub fn is_pickable(latest: Option<JobState>) -> bool {
        match latest {
            None => true,
            Some(state) => matches!(
                state,
                JobState::Waiting | JobState::Failed | JobState::Throttled
            ),
        }
    }

    /// Whether the lifecycle allows moving from `from` (latest recorded state,
    /// `None` when the job has no status yet) to `to`.
    pub fn can_transition(from: Option<JobState>, to: JobState) -> bool {
        match from {
            None | Some(JobState::Waiting) | Some(JobState::Failed) | Some(JobState::Throttled) => {
                matches!(
                    to,
                    JobState::Executing | JobState::Waiting | JobState::Throttled | JobState::Aborted
                )
            }
            Some(JobState::Executing) => to != JobState::Executing,
            Some(JobState::Succeeded) | Some(JobState::Aborted) => false,
        }
    }

    /// Same as [`JobState::can_transition`], as a `DomainResult`.
    pub fn check_transition(from: Option<JobState>, to: JobState) -> DomainResult<()> {
        if Self::can_transition(from, to) {
            return Ok(());
        }
        let from = from.map(|s| s.as_str()).unwrap_or("none");
        Err(DomainError::invalid_transition(format!(
            "{from} -> {}",
            to.as_str()
        )))
    }
}

impl core::fmt::Display for JobState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown job state '{s}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn terminal_states_accept_nothing() {
        for to in JobState::ALL {
            assert!(!JobState::can_transition(Some(JobState::Succeeded), to));
            assert!(!JobState::can_transition(Some(JobState::Aborted), to));
        }
    }

    #[test]
    fn outcomes_require_an_executing_job() {
        assert!(JobState::can_transition(Some(JobState::Executing), JobState::Succeeded));
        assert!(JobState::can_transition(Some(JobState::Executing), JobState::Failed));
        assert!(!JobState::can_transition(None, JobState::Succeeded));
        assert!(!JobState::can_transition(Some(JobState::Waiting), JobState::Failed));
    }

    #[test]
    fn failed_jobs_can_be_retried() {
        assert!(JobState::can_transition(Some(JobState::Failed), JobState::Executing));
        assert!(JobState::can_transition(Some(JobState::Failed), JobState::Aborted));
    }

    #[test]
    fn check_transition_names_both_states() {
        let err = JobState::check_transition(Some(JobState::Succeeded), JobState::Executing)
            .unwrap_err();
        assert_eq!(
            err,
            DomainError::InvalidTransition("succeeded -> executing".to_string())
        );
    }

    #[test]
    fn pickable_states() {
        assert!(JobState::is_pickable(None));
        assert!(JobState::is_pickable(Some(JobState::Failed)));
        assert!(!JobState::is_pickable(Some(JobState::Executing)));
        assert!(!JobState::is_pickable(Some(JobState::Succeeded)));
    }

    fn any_state() -> impl Strategy<Value = JobState> {
        prop::sample::select(JobState::ALL.to_vec())
    }

    proptest! {
        /// Property: once the latest state is terminal, every later write is rejected,
        /// whatever sequence of writes is attempted.
        #[test]
        fn terminal_is_absorbing(writes in prop::collection::vec(any_state(), 1..20)) {
            let mut latest: Option<JobState> = None;
            let mut terminal_seen = false;

            for to in writes {
                let allowed = JobState::can_transition(latest, to);
                if terminal_seen {
                    prop_assert!(!allowed);
                }
                if allowed {
                    latest = Some(to);
                    terminal_seen = to.is_terminal();
                }
            }
        }

        #[test]
        fn state_names_parse_back(state in any_state()) {
            prop_assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
    }
}
