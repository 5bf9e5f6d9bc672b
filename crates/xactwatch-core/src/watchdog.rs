//! The scan loop: one stateless pass over the live session set.
//!
//! Each run fetches a fresh snapshot, orders it, reports every record,
//! optionally resolves blocker detail, and folds the set through the
//! escalation controller. Nothing survives the call except the side effects
//! already issued against the server.

use std::cmp::Reverse;

use tracing::{debug, instrument};

use crate::config::ScanParams;
use crate::db::{DbHandle, TransactionRecord};
use crate::error::Result;
use crate::escalation::{EscalationController, EscalationPolicy};
use crate::report::{ReportSink, blocker_line, outcome_line, summary_line};

/// Fix the scan priority order: non-waiting transactions first, then
/// waiting, with elapsed time descending within each class.
///
/// This determines who gets escalated first, so the most urgent non-waiting
/// long transaction is not starved behind waiters, and within each class the
/// oldest is handled first. The ordering is a preserved policy choice; do
/// not change it without changing the consumers that rely on it.
pub fn sort_records(records: &mut [TransactionRecord]) {
    records.sort_by_key(|rec| (rec.is_waiting, Reverse(rec.elapsed)));
}

/// Drives the per-run scan against a database interface.
pub struct Watchdog {
    db: DbHandle,
}

impl Watchdog {
    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }

    /// Run one scan.
    ///
    /// Returns the ordered line set in rows mode, an empty vector in
    /// emission modes. A failed snapshot or blocker query is fatal to the
    /// call; per-transaction escalation failures are reported lines, not
    /// errors.
    #[instrument(skip(self, params), fields(mode = %params.report_mode))]
    pub async fn run(&self, params: &ScanParams) -> Result<Vec<String>> {
        params.validate()?;

        let mut records = self.db.snapshot(params.min_duration).await?;
        sort_records(&mut records);
        debug!(count = records.len(), "scanning long transactions");

        let mut sink = ReportSink::for_mode(params.report_mode);
        let controller =
            EscalationController::new(self.db.clone(), EscalationPolicy::from_params(params));

        let mut attempts = 0u32;
        for rec in &records {
            sink.push(summary_line(rec));

            if params.report_blockers && rec.is_waiting {
                if let Some(blocker) = self.db.resolve_blocker(rec.backend_id).await? {
                    sink.push(blocker_line(rec, &blocker));
                }
            }

            let (next_attempts, outcome) = controller.apply(attempts, rec).await;
            attempts = next_attempts;
            if let Some(outcome) = outcome {
                sink.push(outcome_line(outcome, rec.backend_id));
            }
        }

        debug!(scanned = records.len(), attempts, "scan complete");
        Ok(sink.into_rows())
    }
}
