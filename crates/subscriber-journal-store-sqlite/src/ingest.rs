use subscriber_journal_core::{
    JournalEntry, JournalError, JournalSettings, MembershipEvent, NewJournalEntry,
    NormalizedEvent,
};
use tracing::{debug, info, warn};

use crate::{AppendOutcome, Result, SqliteJournalStore};

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IngestOutcome {
    Recorded(JournalEntry),
    DuplicateIgnored { existing_id: i64 },
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct BatchIngestError {
    pub index: usize,
    pub error: String,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct BatchIngestReport {
    pub recorded: usize,
    pub duplicates: usize,
    pub rejected: usize,
    pub errors: Vec<BatchIngestError>,
}

impl SqliteJournalStore {
    /// Turns one membership notification into at most one journal entry.
    ///
    /// Redelivery of the same idempotency key is reported as a duplicate.
    /// An invite link that cannot be resolved, or an inviter that disappears
    /// before the insert, leaves the entry unattributed instead of failing.
    pub fn ingest_event(
        &mut self,
        event: &MembershipEvent,
        settings: &JournalSettings,
    ) -> Result<IngestOutcome> {
        let normalized = event.normalize()?;
        let inviter_id = self.resolve_inviter(&normalized, settings)?;

        self.upsert_user(
            normalized.tg_user_id,
            normalized.username.as_deref(),
            normalized.name.as_deref(),
        )?;

        let entry = normalized.into_entry(inviter_id);
        let outcome = match self.append_journal_entry(&entry) {
            Err(JournalError::ReferentialIntegrity(message)) => {
                warn!(
                    tg_user_id = entry.tg_user_id,
                    inviter_id = ?entry.inviter_id,
                    %message,
                    "inviter missing at insert; recording entry without attribution"
                );
                let fallback = NewJournalEntry {
                    inviter_id: None,
                    ..entry
                };
                self.append_journal_entry(&fallback)?
            }
            other => other?,
        };

        match outcome {
            AppendOutcome::Inserted(stored) => {
                debug!(
                    journal_id = stored.id,
                    tg_user_id = stored.tg_user_id,
                    event_kind = %stored.event_kind,
                    "journal entry recorded"
                );
                Ok(IngestOutcome::Recorded(stored))
            }
            AppendOutcome::DuplicateIgnored { existing_id } => {
                info!(existing_id, "duplicate delivery ignored");
                Ok(IngestOutcome::DuplicateIgnored { existing_id })
            }
        }
    }

    /// Ingests events in order. Malformed events are logged, counted and
    /// skipped; only a retryable storage failure stops the batch.
    pub fn ingest_batch(
        &mut self,
        events: &[MembershipEvent],
        settings: &JournalSettings,
    ) -> Result<BatchIngestReport> {
        settings.validate()?;
        let mut report = BatchIngestReport::default();

        for (index, event) in events.iter().enumerate() {
            match self.ingest_event(event, settings) {
                Ok(IngestOutcome::Recorded(_)) => report.recorded += 1,
                Ok(IngestOutcome::DuplicateIgnored { .. }) => report.duplicates += 1,
                Err(err) if err.is_retryable() => return Err(err),
                Err(err) => {
                    warn!(index, error = %err, "skipping event that could not be ingested");
                    report.rejected += 1;
                    report.errors.push(BatchIngestError {
                        index,
                        error: err.to_string(),
                    });
                }
            }
        }

        info!(
            recorded = report.recorded,
            duplicates = report.duplicates,
            rejected = report.rejected,
            "batch ingested"
        );
        Ok(report)
    }

    fn resolve_inviter(
        &self,
        event: &NormalizedEvent,
        settings: &JournalSettings,
    ) -> Result<Option<i64>> {
        let Some(link) = event.invite_link_hint.as_deref() else {
            return Ok(None);
        };

        if settings.auto_register_invite_links {
            let inviter =
                self.find_or_create_inviter(Some(link), event.channel_id.as_deref(), None, None)?;
            return Ok(Some(inviter.id));
        }

        match self.find_inviter_by_link(link)? {
            Some(inviter) => Ok(Some(inviter.id)),
            None => {
                warn!(
                    tg_user_id = event.tg_user_id,
                    invite_link = link,
                    "invite link not registered; recording entry without attribution"
                );
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use subscriber_journal_core::{EventKind, JournalError, JournalSettings, MembershipEvent};

    use crate::tests::{fixture_store, membership_event, must};
    use crate::IngestOutcome;

    fn recorded(outcome: IngestOutcome) -> subscriber_journal_core::JournalEntry {
        match outcome {
            IngestOutcome::Recorded(entry) => entry,
            IngestOutcome::DuplicateIgnored { existing_id } => {
                panic!("expected a new entry, got duplicate of {existing_id}")
            }
        }
    }

    #[test]
    fn ingest_records_entry_and_upserts_user() {
        let mut store = fixture_store();
        let settings = JournalSettings::v1();
        let entry = recorded(must(store.ingest_event(
            &membership_event(10, EventKind::Subscribe, "2026-03-01T10:00:00Z", Some(1), None),
            &settings,
        )));

        assert_eq!(entry.tg_user_id, 10);
        assert_eq!(entry.inviter_id, None);
        assert_eq!(entry.telegram_update_id, Some(1));
        let user = must(store.get_user(10));
        assert_eq!(user.and_then(|found| found.name), Some("User 10".to_string()));
    }

    #[test]
    fn redelivered_update_is_ignored() {
        let mut store = fixture_store();
        let settings = JournalSettings::v1();
        let event = membership_event(10, EventKind::Subscribe, "2026-03-01T10:00:00Z", Some(9), None);

        let first = recorded(must(store.ingest_event(&event, &settings)));
        let second = must(store.ingest_event(&event, &settings));
        assert_eq!(
            second,
            IngestOutcome::DuplicateIgnored {
                existing_id: first.id
            }
        );
        assert_eq!(must(store.list_entries_for(10)).len(), 1);
    }

    #[test]
    fn registered_link_attributes_entry_and_flags_repeat() {
        let mut store = fixture_store();
        let settings = JournalSettings::v1();
        let inviter = must(store.find_or_create_inviter(
            Some("https://t.me/+alpha"),
            None,
            Some("Vadim"),
            None,
        ));

        let first = recorded(must(store.ingest_event(
            &membership_event(
                10,
                EventKind::Subscribe,
                "2026-03-01T10:00:00Z",
                Some(1),
                Some("https://t.me/+alpha"),
            ),
            &settings,
        )));
        let _ = recorded(must(store.ingest_event(
            &membership_event(10, EventKind::Unsubscribe, "2026-03-02T10:00:00Z", Some(2), None),
            &settings,
        )));
        let again = recorded(must(store.ingest_event(
            &membership_event(
                10,
                EventKind::Subscribe,
                "2026-03-03T10:00:00Z",
                Some(3),
                Some("https://t.me/+alpha"),
            ),
            &settings,
        )));

        assert_eq!(first.inviter_id, Some(inviter.id));
        assert!(!first.is_repeat());
        assert_eq!(again.inviter_id, Some(inviter.id));
        assert!(again.is_repeat());
    }

    #[test]
    fn unknown_link_falls_back_to_unattributed_entry() {
        let mut store = fixture_store();
        let entry = recorded(must(store.ingest_event(
            &membership_event(
                10,
                EventKind::Subscribe,
                "2026-03-01T10:00:00Z",
                Some(1),
                Some("https://t.me/+unknown"),
            ),
            &JournalSettings::v1(),
        )));
        assert_eq!(entry.inviter_id, None);
        assert_eq!(must(store.find_inviter_by_link("https://t.me/+unknown")), None);
    }

    #[test]
    fn auto_registration_creates_inviter_for_new_link() {
        let mut store = fixture_store();
        let mut settings = JournalSettings::v1();
        settings.auto_register_invite_links = true;

        let entry = recorded(must(store.ingest_event(
            &membership_event(
                10,
                EventKind::Subscribe,
                "2026-03-01T10:00:00Z",
                Some(1),
                Some("https://t.me/+fresh"),
            ),
            &settings,
        )));
        let inviter = must(store.find_inviter_by_link("https://t.me/+fresh"));
        assert_eq!(entry.inviter_id, inviter.map(|found| found.id));
        assert!(entry.inviter_id.is_some());
    }

    #[test]
    fn missing_time_or_user_is_rejected() {
        let mut store = fixture_store();
        let settings = JournalSettings::v1();
        let mut event = membership_event(10, EventKind::Subscribe, "2026-03-01T10:00:00Z", Some(1), None);
        event.event_time = None;
        assert!(matches!(
            store.ingest_event(&event, &settings),
            Err(JournalError::Validation(_))
        ));

        let mut event = membership_event(10, EventKind::Subscribe, "2026-03-01T10:00:00Z", Some(1), None);
        event.tg_user_id = None;
        assert!(matches!(
            store.ingest_event(&event, &settings),
            Err(JournalError::Validation(_))
        ));
        assert_eq!(must(store.get_user(10)), None);
    }

    #[test]
    fn batch_skips_malformed_events_and_counts_duplicates() {
        let mut store = fixture_store();
        let mut broken: MembershipEvent =
            membership_event(11, EventKind::Subscribe, "2026-03-01T10:00:00Z", Some(2), None);
        broken.tg_user_id = Some(-1);

        let events = vec![
            membership_event(10, EventKind::Subscribe, "2026-03-01T10:00:00Z", Some(1), None),
            broken,
            membership_event(10, EventKind::Subscribe, "2026-03-01T10:00:00Z", Some(1), None),
            membership_event(12, EventKind::JoinRequest, "2026-03-01T11:00:00Z", Some(3), None),
        ];

        let report = must(store.ingest_batch(&events, &JournalSettings::v1()));
        assert_eq!(report.recorded, 2);
        assert_eq!(report.duplicates, 1);
        assert_eq!(report.rejected, 1);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].index, 1);
    }
}
