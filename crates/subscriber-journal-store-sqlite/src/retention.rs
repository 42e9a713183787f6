use std::collections::hash_map::Entry;
use std::collections::HashMap;

use rusqlite::{params, OptionalExtension};
use subscriber_journal_core::{
    day_end, decide_retention, format_date, format_rfc3339, now_utc, parse_date, JournalEntry,
    JournalSettings, RetentionResult, VerdictReason,
};
use time::{Date, OffsetDateTime};
use tracing::{info, warn};

use crate::{
    join_class_sql, RecordOutcome, Result, SqliteJournalStore, StorageContext, ENTRY_COLUMNS,
};

pub const EVALUATOR_NAME: &str = "retention_v1";

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct RetentionRunReport {
    #[serde(with = "subscriber_journal_core::serde_date")]
    pub check_date: Date,
    pub retention_days: u16,
    pub candidates: usize,
    /// New verdicts written by this pass.
    pub recorded: usize,
    pub already_existed: usize,
    pub retained: usize,
    pub not_retained: usize,
    pub pending: usize,
}

/// Bookkeeping for the scheduler. Evaluation never reads it back.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct EvaluationState {
    pub evaluator_name: String,
    #[serde(with = "subscriber_journal_core::serde_date")]
    pub last_check_date: Date,
    #[serde(with = "subscriber_journal_core::serde_date")]
    pub last_run_check_date: Date,
    pub retention_days: u16,
    pub verdicts_recorded: u64,
    pub updated_at: String,
}

impl SqliteJournalStore {
    /// Runs one evaluation pass for `as_of`.
    ///
    /// Every join-class entry up to the end of `as_of` without a verdict for
    /// that date, and without a final verdict on an earlier date, receives
    /// one verdict. Each write is its own statement, so an interrupted pass
    /// resumes on the next run.
    pub fn evaluate_retention(
        &self,
        as_of: Date,
        settings: &JournalSettings,
    ) -> Result<RetentionRunReport> {
        settings.validate()?;
        let offset = settings.offset()?;
        let cutoff = day_end(as_of, offset)?;
        let candidates = self.retention_candidates(as_of, cutoff)?;

        let mut report = RetentionRunReport {
            check_date: as_of,
            retention_days: settings.retention_days,
            candidates: candidates.len(),
            recorded: 0,
            already_existed: 0,
            retained: 0,
            not_retained: 0,
            pending: 0,
        };
        let mut histories: HashMap<i64, Vec<JournalEntry>> = HashMap::new();

        for candidate in &candidates {
            let history = match histories.entry(candidate.tg_user_id) {
                Entry::Occupied(found) => found.into_mut(),
                Entry::Vacant(slot) => {
                    slot.insert(self.list_user_entries_before(candidate.tg_user_id, cutoff)?)
                }
            };

            let verdict =
                decide_retention(candidate, history, as_of, settings.retention_days, offset)?;
            if let VerdictReason::Ambiguous {
                journal_id,
                event_kind,
            } = &verdict.reason
            {
                warn!(
                    candidate_id = candidate.id,
                    tg_user_id = candidate.tg_user_id,
                    latest_id = journal_id,
                    latest_kind = %event_kind,
                    "latest membership event is ambiguous; verdict left pending"
                );
            }

            match self.record_retention_check(candidate.id, as_of, verdict.result)? {
                RecordOutcome::Recorded(_) => {
                    report.recorded += 1;
                    match verdict.result {
                        RetentionResult::Retained => report.retained += 1,
                        RetentionResult::NotRetained => report.not_retained += 1,
                        RetentionResult::Pending => report.pending += 1,
                    }
                }
                RecordOutcome::AlreadyExists => report.already_existed += 1,
            }
        }

        self.upsert_evaluation_state(&report)?;
        info!(
            check_date = %as_of,
            candidates = report.candidates,
            recorded = report.recorded,
            retained = report.retained,
            not_retained = report.not_retained,
            pending = report.pending,
            "retention pass complete"
        );

        Ok(report)
    }

    pub fn evaluation_state(&self) -> Result<Option<EvaluationState>> {
        let raw = self
            .conn
            .query_row(
                "SELECT evaluator_name, last_check_date, last_run_check_date,
                        retention_days, verdicts_recorded, updated_at
                 FROM retention_evaluation_state
                 WHERE evaluator_name = ?1",
                params![EVALUATOR_NAME],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()
            .context("failed to load evaluation state")?;

        let Some((evaluator_name, last_check, last_run, days, recorded, updated_at)) = raw else {
            return Ok(None);
        };

        let retention_days = u16::try_from(days).map_err(|_| {
            subscriber_journal_core::JournalError::Corrupt(format!(
                "invalid retention_days in evaluation state: {days}"
            ))
        })?;

        Ok(Some(EvaluationState {
            evaluator_name,
            last_check_date: parse_date(&last_check)?,
            last_run_check_date: parse_date(&last_run)?,
            retention_days,
            verdicts_recorded: u64::try_from(recorded).unwrap_or(0),
            updated_at,
        }))
    }

    fn retention_candidates(&self, as_of: Date, cutoff: OffsetDateTime) -> Result<Vec<JournalEntry>> {
        let check_date = format_date(as_of)?;
        self.query_entries(
            &format!(
                "SELECT {ENTRY_COLUMNS} FROM journal j
                 WHERE j.event_type IN ({})
                   AND j.event_time < ?1
                   AND NOT EXISTS (
                     SELECT 1 FROM retention_checks c
                     WHERE c.journal_id = j.id
                       AND (
                         c.check_date = ?2
                         OR (c.check_date < ?2 AND c.result IN ('retained', 'not_retained'))
                       )
                   )
                 ORDER BY j.event_time ASC, j.id ASC",
                join_class_sql()
            ),
            params![format_rfc3339(cutoff)?, check_date],
        )
    }

    fn upsert_evaluation_state(&self, report: &RetentionRunReport) -> Result<()> {
        let check_date = format_date(report.check_date)?;
        let now = format_rfc3339(now_utc())?;
        let recorded = i64::try_from(report.recorded).unwrap_or(i64::MAX);

        self.conn
            .execute(
                "INSERT INTO retention_evaluation_state(
                    evaluator_name, last_check_date, last_run_check_date,
                    retention_days, verdicts_recorded, updated_at
                 ) VALUES (?1, ?2, ?2, ?3, ?4, ?5)
                 ON CONFLICT(evaluator_name) DO UPDATE SET
                   last_check_date = MAX(retention_evaluation_state.last_check_date, excluded.last_check_date),
                   last_run_check_date = excluded.last_run_check_date,
                   retention_days = excluded.retention_days,
                   verdicts_recorded = retention_evaluation_state.verdicts_recorded + excluded.verdicts_recorded,
                   updated_at = excluded.updated_at",
                params![
                    EVALUATOR_NAME,
                    check_date,
                    i64::from(report.retention_days),
                    recorded,
                    now
                ],
            )
            .context("failed to update evaluation state")?;

        Ok(())
    }
}
