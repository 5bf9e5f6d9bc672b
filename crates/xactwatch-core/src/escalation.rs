//! Escalation policy: cancel first, terminate second, bounded per run.
//!
//! The attempt counter is per scan, not per transaction, and is threaded
//! through the iteration as an explicit accumulator. In non-exhaustive mode
//! only the first qualifying transaction in priority order is ever touched;
//! in exhaustive mode every qualifying transaction is. The single budget is
//! shared across cancel and terminate: a terminate that follows a failed
//! cancel consumes the same slot.
//!
//! Everything here is best-effort. A declined or failed administrative
//! request becomes a reported outcome, never an error; the scan always
//! continues to the next transaction.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::ScanParams;
use crate::db::{DbHandle, ExecutionState, TransactionRecord};

/// Thresholds and mode for destructive action.
#[derive(Debug, Clone, Copy, Default)]
pub struct EscalationPolicy {
    /// Attempt cancellation past this age. `None` disables escalation
    /// entirely.
    pub cancel_after: Option<Duration>,
    /// Attempt termination past this age, only after a failed or
    /// inapplicable cancel. `None` means termination is never attempted.
    pub terminate_after: Option<Duration>,
    /// Touch every qualifying transaction instead of at most one per run.
    pub cancel_all: bool,
}

impl EscalationPolicy {
    /// Extract the escalation-relevant subset of scan parameters.
    pub fn from_params(params: &ScanParams) -> Self {
        Self {
            cancel_after: params.cancel_after,
            terminate_after: params.terminate_after,
            cancel_all: params.cancel_all,
        }
    }
}

/// What a single escalation evaluation did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationOutcome {
    /// The running statement was cancelled.
    Cancelled,
    /// The backend connection was terminated.
    Terminated,
    /// Cancellation failed or was inapplicable, and no terminate threshold
    /// applied.
    CancelFailed,
    /// Termination was attempted and the server declined it.
    TerminateFailed,
}

/// Whether a transaction qualifies for a destructive attempt given the
/// policy and the attempts already made this run.
pub fn qualifies(policy: &EscalationPolicy, attempts: u32, elapsed: Duration) -> bool {
    (attempts == 0 || policy.cancel_all)
        && policy.cancel_after.is_some_and(|threshold| elapsed > threshold)
}

/// Applies the policy to one transaction at a time, threading the attempt
/// accumulator through the caller's fold.
pub struct EscalationController {
    db: DbHandle,
    policy: EscalationPolicy,
}

impl EscalationController {
    pub fn new(db: DbHandle, policy: EscalationPolicy) -> Self {
        Self { db, policy }
    }

    /// Evaluate one transaction. Returns the updated attempt count and the
    /// outcome to report, if any.
    ///
    /// A cancel is attempted only when the session has a running statement;
    /// idle-in-transaction skips straight to the terminate evaluation. A
    /// primitive returning `false` means the target was already gone or the
    /// server declined, which is the benign stale-state case.
    pub async fn apply(
        &self,
        attempts: u32,
        rec: &TransactionRecord,
    ) -> (u32, Option<EscalationOutcome>) {
        if !qualifies(&self.policy, attempts, rec.elapsed) {
            return (attempts, None);
        }
        let attempts = attempts + 1;

        let cancelled = if rec.execution_state == ExecutionState::IdleInTransaction {
            false
        } else {
            match self.db.cancel_backend(rec.backend_id).await {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!(error = %err, pid = rec.backend_id, "cancel request failed");
                    false
                }
            }
        };
        if cancelled {
            return (attempts, Some(EscalationOutcome::Cancelled));
        }

        let terminate_due = self
            .policy
            .terminate_after
            .is_some_and(|threshold| rec.elapsed > threshold);
        if !terminate_due {
            return (attempts, Some(EscalationOutcome::CancelFailed));
        }

        let terminated = match self.db.terminate_backend(rec.backend_id).await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(error = %err, pid = rec.backend_id, "terminate request failed");
                false
            }
        };
        if terminated {
            (attempts, Some(EscalationOutcome::Terminated))
        } else {
            (attempts, Some(EscalationOutcome::TerminateFailed))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{AdminCall, MockDatabase};
    use std::sync::Arc;

    fn record(pid: i32, elapsed: Duration, state: ExecutionState) -> TransactionRecord {
        TransactionRecord {
            backend_id: pid,
            actor: "app_rw".to_string(),
            origin_app: "[unknown]".to_string(),
            origin_client: "[local]".to_string(),
            statement_text: "SELECT 1".to_string(),
            execution_state: state,
            elapsed,
            is_waiting: false,
            wait_detail: None,
        }
    }

    fn policy(cancel_secs: u64, terminate_secs: Option<u64>, cancel_all: bool) -> EscalationPolicy {
        EscalationPolicy {
            cancel_after: Some(Duration::from_secs(cancel_secs)),
            terminate_after: terminate_secs.map(Duration::from_secs),
            cancel_all,
        }
    }

    #[test]
    fn qualifies_requires_cancel_threshold() {
        let policy = EscalationPolicy::default();
        assert!(!qualifies(&policy, 0, Duration::from_secs(3600)));
    }

    #[test]
    fn qualifies_requires_threshold_exceeded() {
        let policy = policy(60, None, false);
        assert!(!qualifies(&policy, 0, Duration::from_secs(60)));
        assert!(qualifies(&policy, 0, Duration::from_secs(61)));
    }

    #[test]
    fn qualifies_budget_spent_unless_exhaustive() {
        let single = policy(60, None, false);
        assert!(!qualifies(&single, 1, Duration::from_secs(3600)));

        let exhaustive = policy(60, None, true);
        assert!(qualifies(&exhaustive, 1, Duration::from_secs(3600)));
        assert!(qualifies(&exhaustive, 7, Duration::from_secs(3600)));
    }

    #[tokio::test]
    async fn active_session_is_cancelled() {
        let mock = Arc::new(MockDatabase::new());
        let controller = EscalationController::new(mock.clone(), policy(1, None, false));
        let rec = record(10, Duration::from_secs(5), ExecutionState::Active);

        let (attempts, outcome) = controller.apply(0, &rec).await;
        assert_eq!(attempts, 1);
        assert_eq!(outcome, Some(EscalationOutcome::Cancelled));
        assert_eq!(mock.calls(), vec![AdminCall::Cancel(10)]);
    }

    #[tokio::test]
    async fn idle_session_skips_cancel_entirely() {
        let mock = Arc::new(MockDatabase::new());
        let controller = EscalationController::new(mock.clone(), policy(1, Some(2), false));
        let rec = record(11, Duration::from_secs(5), ExecutionState::IdleInTransaction);

        let (attempts, outcome) = controller.apply(0, &rec).await;
        assert_eq!(attempts, 1);
        assert_eq!(outcome, Some(EscalationOutcome::Terminated));
        // No cancel call was ever issued for the idle session.
        assert_eq!(mock.calls(), vec![AdminCall::Terminate(11)]);
    }

    #[tokio::test]
    async fn failed_cancel_without_terminate_threshold() {
        let mock = Arc::new(MockDatabase::new());
        mock.set_cancel_result(12, false);
        let controller = EscalationController::new(mock.clone(), policy(1, None, false));
        let rec = record(12, Duration::from_secs(5), ExecutionState::Active);

        let (_, outcome) = controller.apply(0, &rec).await;
        assert_eq!(outcome, Some(EscalationOutcome::CancelFailed));
        assert_eq!(mock.calls(), vec![AdminCall::Cancel(12)]);
    }

    #[tokio::test]
    async fn failed_cancel_below_terminate_threshold() {
        let mock = Arc::new(MockDatabase::new());
        mock.set_cancel_result(13, false);
        let controller = EscalationController::new(mock.clone(), policy(1, Some(600), false));
        let rec = record(13, Duration::from_secs(5), ExecutionState::Active);

        let (_, outcome) = controller.apply(0, &rec).await;
        assert_eq!(outcome, Some(EscalationOutcome::CancelFailed));
    }

    #[tokio::test]
    async fn failed_cancel_then_failed_terminate() {
        let mock = Arc::new(MockDatabase::new());
        mock.set_cancel_result(14, false);
        mock.set_terminate_result(14, false);
        let controller = EscalationController::new(mock.clone(), policy(1, Some(2), false));
        let rec = record(14, Duration::from_secs(5), ExecutionState::Active);

        let (_, outcome) = controller.apply(0, &rec).await;
        assert_eq!(outcome, Some(EscalationOutcome::TerminateFailed));
        assert_eq!(
            mock.calls(),
            vec![AdminCall::Cancel(14), AdminCall::Terminate(14)]
        );
    }

    #[tokio::test]
    async fn spent_budget_makes_apply_a_no_op() {
        let mock = Arc::new(MockDatabase::new());
        let controller = EscalationController::new(mock.clone(), policy(1, Some(2), false));
        let rec = record(15, Duration::from_secs(5), ExecutionState::Active);

        let (attempts, outcome) = controller.apply(1, &rec).await;
        assert_eq!(attempts, 1);
        assert_eq!(outcome, None);
        assert!(mock.calls().is_empty());
    }
}
