//! Report modes, the per-run sink, and the output line formats.
//!
//! The mode is resolved exactly once per run: either every line is emitted
//! live through `tracing` at a fixed severity, or every line is accumulated
//! and returned as the run's row set. There is no per-line mode drift.
//!
//! Line field order is part of the compatibility contract; changing it
//! breaks downstream consumers that parse these lines.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::db::{BlockerRecord, TransactionRecord};
use crate::escalation::EscalationOutcome;

/// Prefix of every output line.
const LINE_TAG: &str = "long_xact";

/// How a run reports its findings.
///
/// The five severity names select live emission; any other string selects
/// row accumulation, so parsing never fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportMode {
    Debug,
    Log,
    Info,
    Notice,
    Warning,
    /// Accumulate lines and return them as the run's result set.
    Rows,
}

impl ReportMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ReportMode::Debug => "debug",
            ReportMode::Log => "log",
            ReportMode::Info => "info",
            ReportMode::Notice => "notice",
            ReportMode::Warning => "warning",
            ReportMode::Rows => "rows",
        }
    }
}

impl From<&str> for ReportMode {
    fn from(s: &str) -> Self {
        match s {
            "debug" => ReportMode::Debug,
            "log" => ReportMode::Log,
            "info" => ReportMode::Info,
            "notice" => ReportMode::Notice,
            "warning" => ReportMode::Warning,
            _ => ReportMode::Rows,
        }
    }
}

impl std::fmt::Display for ReportMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-run sink: emit lines live or collect them.
///
/// Severity mapping onto `tracing` is one-way and collapses levels the
/// subscriber cannot distinguish: debug maps to DEBUG, log/info/notice map
/// to INFO, warning maps to WARN.
#[derive(Debug)]
pub enum ReportSink {
    Emit(ReportMode),
    Collect(Vec<String>),
}

impl ReportSink {
    /// Resolve a mode into a sink, once per run.
    pub fn for_mode(mode: ReportMode) -> Self {
        match mode {
            ReportMode::Rows => ReportSink::Collect(Vec::new()),
            other => ReportSink::Emit(other),
        }
    }

    /// Emit or accumulate one line.
    pub fn push(&mut self, line: String) {
        match self {
            ReportSink::Emit(ReportMode::Debug) => debug!("{line}"),
            ReportSink::Emit(ReportMode::Warning) => warn!("{line}"),
            ReportSink::Emit(_) => info!("{line}"),
            ReportSink::Collect(rows) => rows.push(line),
        }
    }

    /// The run's result set: the accumulated rows, or empty for emission
    /// modes after all side effects have happened.
    pub fn into_rows(self) -> Vec<String> {
        match self {
            ReportSink::Emit(_) => Vec::new(),
            ReportSink::Collect(rows) => rows,
        }
    }
}

/// One-line summary of a long transaction.
pub fn summary_line(rec: &TransactionRecord) -> String {
    let wait = rec
        .wait_detail
        .as_ref()
        .map(|d| format!("wait: {}/{} ", d.category, d.event))
        .unwrap_or_default();
    format!(
        "{LINE_TAG} pid: {} duration: {} ms user: {} application: {} client: {} {wait}statement: {}",
        rec.backend_id,
        rec.elapsed_ms(),
        rec.actor,
        rec.origin_app,
        rec.origin_client,
        rec.statement_text,
    )
}

/// Blocker detail for a waiting transaction.
pub fn blocker_line(waiter: &TransactionRecord, blocker: &BlockerRecord) -> String {
    format!(
        "{LINE_TAG} waiter pid: {} blocker detail is; pid: {} duration: {} ms relation: {} \
         lock type: {} user: {} application: {} client: {} statement: {}",
        waiter.backend_id,
        blocker.backend_id,
        blocker.elapsed_ms(),
        blocker.locked_resource,
        blocker.lock_kind,
        blocker.actor,
        blocker.origin_app,
        blocker.origin_client,
        blocker.statement_text,
    )
}

/// Escalation outcome line for a backend.
pub fn outcome_line(outcome: EscalationOutcome, pid: i32) -> String {
    let verb = match outcome {
        EscalationOutcome::Cancelled => "cancelled",
        EscalationOutcome::Terminated => "terminated",
        EscalationOutcome::CancelFailed => "unable to cancel",
        EscalationOutcome::TerminateFailed => "unable to terminate",
    };
    format!("{LINE_TAG} {verb} backend with pid: {pid}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{ExecutionState, LockKind, LockedResource, WaitDetail};
    use std::time::Duration;

    fn record() -> TransactionRecord {
        TransactionRecord {
            backend_id: 9001,
            actor: "app_rw".to_string(),
            origin_app: "billing".to_string(),
            origin_client: "10.0.0.8".to_string(),
            statement_text: "UPDATE accounts SET balance = 0".to_string(),
            execution_state: ExecutionState::Active,
            elapsed: Duration::from_millis(2430),
            is_waiting: false,
            wait_detail: None,
        }
    }

    #[test]
    fn mode_parsing_is_infallible() {
        assert_eq!(ReportMode::from("debug"), ReportMode::Debug);
        assert_eq!(ReportMode::from("log"), ReportMode::Log);
        assert_eq!(ReportMode::from("info"), ReportMode::Info);
        assert_eq!(ReportMode::from("notice"), ReportMode::Notice);
        assert_eq!(ReportMode::from("warning"), ReportMode::Warning);
        // Anything else switches the whole call into row accumulation.
        assert_eq!(ReportMode::from("text"), ReportMode::Rows);
        assert_eq!(ReportMode::from(""), ReportMode::Rows);
        assert_eq!(ReportMode::from("WARNING"), ReportMode::Rows);
    }

    #[test]
    fn mode_round_trip() {
        for mode in [
            ReportMode::Debug,
            ReportMode::Log,
            ReportMode::Info,
            ReportMode::Notice,
            ReportMode::Warning,
        ] {
            assert_eq!(ReportMode::from(mode.as_str()), mode);
        }
    }

    #[test]
    fn rows_sink_accumulates_in_order() {
        let mut sink = ReportSink::for_mode(ReportMode::Rows);
        sink.push("first".to_string());
        sink.push("second".to_string());
        assert_eq!(sink.into_rows(), vec!["first", "second"]);
    }

    #[test]
    fn emit_sink_returns_no_rows() {
        let mut sink = ReportSink::for_mode(ReportMode::Notice);
        sink.push("emitted".to_string());
        assert!(sink.into_rows().is_empty());
    }

    #[test]
    fn summary_field_order() {
        let line = summary_line(&record());
        assert_eq!(
            line,
            "long_xact pid: 9001 duration: 2430 ms user: app_rw application: billing \
             client: 10.0.0.8 statement: UPDATE accounts SET balance = 0"
        );
    }

    #[test]
    fn summary_includes_wait_segment_before_statement() {
        let mut rec = record();
        rec.is_waiting = true;
        rec.wait_detail = Some(WaitDetail {
            category: "Lock".to_string(),
            event: "transactionid".to_string(),
        });
        let line = summary_line(&rec);
        assert_eq!(
            line,
            "long_xact pid: 9001 duration: 2430 ms user: app_rw application: billing \
             client: 10.0.0.8 wait: Lock/transactionid statement: UPDATE accounts SET balance = 0"
        );
    }

    #[test]
    fn blocker_field_order() {
        let blocker = BlockerRecord {
            backend_id: 8001,
            actor: "etl".to_string(),
            origin_app: "[unknown]".to_string(),
            origin_client: "[local]".to_string(),
            statement_text: "DELETE FROM accounts".to_string(),
            execution_state: ExecutionState::IdleInTransaction,
            elapsed: Duration::from_millis(5120),
            locked_resource: LockedResource::Relation {
                name: "accounts".to_string(),
                mode: "RowExclusiveLock".to_string(),
            },
            lock_kind: LockKind::TransactionId("7811".to_string()),
        };
        let line = blocker_line(&record(), &blocker);
        assert_eq!(
            line,
            "long_xact waiter pid: 9001 blocker detail is; pid: 8001 duration: 5120 ms \
             relation: accounts (RowExclusiveLock) lock type: transaction id 7811 user: etl \
             application: [unknown] client: [local] statement: DELETE FROM accounts"
        );
    }

    #[test]
    fn outcome_lines() {
        assert_eq!(
            outcome_line(EscalationOutcome::Cancelled, 17),
            "long_xact cancelled backend with pid: 17"
        );
        assert_eq!(
            outcome_line(EscalationOutcome::Terminated, 17),
            "long_xact terminated backend with pid: 17"
        );
        assert_eq!(
            outcome_line(EscalationOutcome::CancelFailed, 17),
            "long_xact unable to cancel backend with pid: 17"
        );
        assert_eq!(
            outcome_line(EscalationOutcome::TerminateFailed, 17),
            "long_xact unable to terminate backend with pid: 17"
        );
    }
}
