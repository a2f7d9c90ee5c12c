//! Job state machine.
//!
//! The table below is the single definition of which transitions are legal.
//! The in-memory store applies it through [`JobRecord`](crate::JobRecord)
//! methods; the Postgres store builds its `WHERE state = ANY(..)` guards from
//! [`Transition::sources`].

use crate::error::{DomainError, DomainResult};
use crate::job::JobState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transition {
    /// Dequeue: a worker takes the lease.
    Lease,
    /// Handler succeeded.
    Complete,
    /// Handler failed, retry later.
    Retry,
    /// Handler failed for good, or a cap was hit.
    Fail,
    /// Lease expired without heartbeats.
    Reset,
    /// Owner handed the lease back (shutdown).
    Release,
    /// Operator asked for another attempt.
    Requeue,
}

impl Transition {
    pub fn name(&self) -> &'static str {
        match self {
            Transition::Lease => "lease",
            Transition::Complete => "complete",
            Transition::Retry => "retry",
            Transition::Fail => "fail",
            Transition::Reset => "reset",
            Transition::Release => "release",
            Transition::Requeue => "requeue",
        }
    }

    /// States the transition may start from.
    pub fn sources(&self) -> &'static [JobState] {
        match self {
            Transition::Lease => &[JobState::Queued, JobState::Errored],
            Transition::Complete
            | Transition::Retry
            | Transition::Fail
            | Transition::Reset
            | Transition::Release => &[JobState::Processing],
            Transition::Requeue => &[JobState::Errored, JobState::Failed],
        }
    }

    pub fn target(&self) -> JobState {
        match self {
            Transition::Lease => JobState::Processing,
            Transition::Complete => JobState::Completed,
            Transition::Retry => JobState::Errored,
            Transition::Fail => JobState::Failed,
            Transition::Reset | Transition::Release | Transition::Requeue => JobState::Queued,
        }
    }

    pub fn allowed_from(&self, from: JobState) -> bool {
        self.sources().contains(&from)
    }

    /// Resolve the target state, or reject the transition.
    pub fn apply(&self, from: JobState) -> DomainResult<JobState> {
        if self.allowed_from(from) {
            Ok(self.target())
        } else {
            Err(DomainError::IllegalTransition {
                from,
                transition: self.name(),
            })
        }
    }

    /// Source states as their persisted names.
    pub fn source_names(&self) -> Vec<&'static str> {
        self.sources().iter().map(JobState::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_TRANSITIONS: [Transition; 7] = [
        Transition::Lease,
        Transition::Complete,
        Transition::Retry,
        Transition::Fail,
        Transition::Reset,
        Transition::Release,
        Transition::Requeue,
    ];

    #[test]
    fn terminal_states_are_never_leased() {
        assert!(Transition::Lease.apply(JobState::Completed).is_err());
        assert!(Transition::Lease.apply(JobState::Failed).is_err());
        assert!(Transition::Lease.apply(JobState::Processing).is_err());
    }

    #[test]
    fn only_requeue_leaves_a_terminal_state() {
        for t in ALL_TRANSITIONS {
            for from in [JobState::Completed, JobState::Failed] {
                if t.allowed_from(from) {
                    assert_eq!(t, Transition::Requeue);
                    assert_eq!(from, JobState::Failed);
                }
            }
        }
    }

    #[test]
    fn completed_is_final() {
        for t in ALL_TRANSITIONS {
            assert!(!t.allowed_from(JobState::Completed), "{} left Completed", t.name());
        }
    }

    #[test]
    fn reset_and_retry_are_distinct_paths() {
        assert_eq!(Transition::Reset.apply(JobState::Processing), Ok(JobState::Queued));
        assert_eq!(Transition::Retry.apply(JobState::Processing), Ok(JobState::Errored));
        assert_eq!(Transition::Lease.apply(JobState::Errored), Ok(JobState::Processing));
    }

    #[test]
    fn illegal_transition_reports_source_state() {
        let err = Transition::Complete.apply(JobState::Queued).unwrap_err();
        assert_eq!(
            err,
            DomainError::IllegalTransition {
                from: JobState::Queued,
                transition: "complete"
            }
        );
    }
}
