use subscriber_journal_core::{
    aggregate, day_end, DailyAggregateRow, DateRange, InviterLeaderboardRow, JournalExportRow,
    JournalSettings, PeriodSummary, RetentionSummary, UserSummary,
};
use time::Date;

use crate::{Result, SqliteJournalStore};

impl SqliteJournalStore {
    pub fn daily_aggregate(
        &self,
        range: DateRange,
        settings: &JournalSettings,
    ) -> Result<Vec<DailyAggregateRow>> {
        let offset = settings.offset()?;
        let (_, end) = range.utc_bounds(offset)?;
        let entries = self.list_entries_before(end)?;
        Ok(aggregate::daily_rows(&entries, range, offset))
    }

    pub fn inviter_leaderboard(
        &self,
        range: DateRange,
        settings: &JournalSettings,
    ) -> Result<Vec<InviterLeaderboardRow>> {
        let offset = settings.offset()?;
        let (_, end) = range.utc_bounds(offset)?;
        let entries = self.list_entries_before(end)?;
        let inviters = self.list_inviters()?;
        Ok(aggregate::inviter_leaderboard(
            &entries, &inviters, range, offset,
        ))
    }

    pub fn retention_summary(
        &self,
        range: DateRange,
        settings: &JournalSettings,
    ) -> Result<RetentionSummary> {
        let offset = settings.offset()?;
        let (start, end) = range.utc_bounds(offset)?;
        let cohort = self.list_join_entries_between(start, end)?;
        let checks = self.list_checks_for_entries_between(start, end)?;
        Ok(aggregate::retention_summary(&cohort, &checks, range, offset))
    }

    pub fn period_summary(
        &self,
        range: DateRange,
        settings: &JournalSettings,
    ) -> Result<PeriodSummary> {
        let offset = settings.offset()?;
        let (_, end) = range.utc_bounds(offset)?;
        let entries = self.list_entries_before(end)?;
        Ok(aggregate::period_summary(&entries, range, offset))
    }

    /// Per-user activity up to the end of `as_of`.
    pub fn user_summaries(
        &self,
        as_of: Date,
        settings: &JournalSettings,
    ) -> Result<Vec<UserSummary>> {
        let end = day_end(as_of, settings.offset()?)?;
        let entries = self.list_entries_before(end)?;
        Ok(aggregate::user_summaries(&entries))
    }

    pub fn journal_export(
        &self,
        range: DateRange,
        settings: &JournalSettings,
    ) -> Result<Vec<JournalExportRow>> {
        let (start, end) = range.utc_bounds(settings.offset()?)?;
        let entries = self.list_entries_between(start, end)?;
        let inviters = self.list_inviters()?;
        Ok(aggregate::export_rows(&entries, &inviters))
    }
}

#[cfg(test)]
mod tests {
    use subscriber_journal_core::{
        DateRange, EventKind, JournalSettings, DIRECT_INVITER_NAME,
    };

    use crate::tests::{day, fixture_store, membership_event, must};
    use crate::SqliteJournalStore;

    fn utc_settings() -> JournalSettings {
        let mut settings = JournalSettings::v1();
        settings.utc_offset = "+00:00".to_string();
        settings
    }

    fn range(start: &str, end: &str) -> DateRange {
        must(DateRange::new(day(start), day(end)))
    }

    fn ingest(
        store: &mut SqliteJournalStore,
        user: i64,
        kind: EventKind,
        at: &str,
        key: i64,
        link: Option<&str>,
    ) {
        if let Err(err) = store.ingest_event(
            &membership_event(user, kind, at, Some(key), link),
            &utc_settings(),
        ) {
            panic!("ingest failed: {err}");
        }
    }

    #[test]
    fn daily_aggregate_matches_subscribe_unsubscribe_subscribe() {
        let mut store = fixture_store();
        ingest(&mut store, 1, EventKind::Subscribe, "2026-03-01T10:00:00Z", 1, None);
        ingest(&mut store, 2, EventKind::Unsubscribe, "2026-03-02T10:00:00Z", 2, None);
        ingest(&mut store, 3, EventKind::Subscribe, "2026-03-03T10:00:00Z", 3, None);

        let rows = must(store.daily_aggregate(range("2026-03-01", "2026-03-03"), &utc_settings()));
        let nets: Vec<i64> = rows.iter().map(|row| row.net_change).collect();
        assert_eq!(nets, vec![1, -1, 1]);
        assert_eq!(rows.last().map(|row| row.total_active), Some(2));
    }

    #[test]
    fn leaderboard_counts_inviter_joins_and_activity() {
        let mut store = fixture_store();
        let _ = must(store.find_or_create_inviter(
            Some("https://t.me/+alpha"),
            None,
            Some("Vadim"),
            Some("vadim"),
        ));
        let alpha = Some("https://t.me/+alpha");
        ingest(&mut store, 1, EventKind::Subscribe, "2026-03-01T10:00:00Z", 1, alpha);
        ingest(&mut store, 2, EventKind::Subscribe, "2026-03-01T11:00:00Z", 2, alpha);
        ingest(&mut store, 2, EventKind::Unsubscribe, "2026-03-02T11:00:00Z", 3, None);
        ingest(&mut store, 2, EventKind::Subscribe, "2026-03-02T12:00:00Z", 4, alpha);
        ingest(&mut store, 3, EventKind::Subscribe, "2026-03-02T12:00:00Z", 5, None);
        ingest(&mut store, 1, EventKind::Unsubscribe, "2026-03-02T13:00:00Z", 6, None);

        let rows = must(store.inviter_leaderboard(range("2026-03-01", "2026-03-02"), &utc_settings()));
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].inviter_name, "@vadim");
        assert_eq!(rows[0].invited, 3);
        assert_eq!(rows[0].unique_users, 2);
        assert_eq!(rows[0].repeat_subscribes, 1);
        assert_eq!(rows[0].active_at_end, 1);
        assert_eq!(rows[1].inviter_id, None);
        assert_eq!(rows[1].inviter_name, DIRECT_INVITER_NAME);
    }

    #[test]
    fn retention_summary_reflects_recorded_verdicts() {
        let mut store = fixture_store();
        let mut settings = utc_settings();
        settings.retention_days = 2;
        ingest(&mut store, 1, EventKind::Subscribe, "2026-03-01T10:00:00Z", 1, None);
        ingest(&mut store, 2, EventKind::Subscribe, "2026-03-01T11:00:00Z", 2, None);
        ingest(&mut store, 2, EventKind::Unsubscribe, "2026-03-02T11:00:00Z", 3, None);
        ingest(&mut store, 3, EventKind::GroupJoin, "2026-03-04T11:00:00Z", 4, None);

        let before = must(store.retention_summary(range("2026-03-01", "2026-03-04"), &settings));
        assert_eq!(before.retention_rate, None);
        assert_eq!(before.unchecked, 3);

        let _ = must(store.evaluate_retention(day("2026-03-04"), &settings));
        let after = must(store.retention_summary(range("2026-03-01", "2026-03-04"), &settings));
        assert_eq!(after.cohort, 3);
        assert_eq!(after.retained, 1);
        assert_eq!(after.not_retained, 1);
        assert_eq!(after.pending, 1);
        assert_eq!(after.retention_rate, Some(0.5));
    }

    #[test]
    fn period_user_and_export_views() {
        let mut store = fixture_store();
        let _ = must(store.find_or_create_inviter(
            Some("https://t.me/+alpha"),
            None,
            Some("Vadim"),
            None,
        ));
        ingest(
            &mut store,
            1,
            EventKind::Subscribe,
            "2026-03-02T10:00:00Z",
            1,
            Some("https://t.me/+alpha"),
        );
        ingest(&mut store, 2, EventKind::Subscribe, "2026-03-03T10:00:00Z", 2, None);
        ingest(&mut store, 1, EventKind::Unsubscribe, "2026-03-04T10:00:00Z", 3, None);

        let week = must(store.period_summary(
            must(subscriber_journal_core::week_of(day("2026-03-04"))),
            &utc_settings(),
        ));
        assert_eq!(week.subscribes, 2);
        assert_eq!(week.unsubscribes, 1);
        assert_eq!(week.net_growth, 1);
        assert_eq!(week.total_active_at_end, 1);

        let users = must(store.user_summaries(day("2026-03-04"), &utc_settings()));
        assert_eq!(users.len(), 2);
        assert_eq!(users[0].tg_user_id, 1);
        assert!(!users[0].active);

        let export = must(store.journal_export(range("2026-03-01", "2026-03-04"), &utc_settings()));
        assert_eq!(export.len(), 3);
        assert_eq!(export[0].event_kind, EventKind::Unsubscribe);
        assert_eq!(export[0].inviter_name, DIRECT_INVITER_NAME);
        assert_eq!(export[2].inviter_name, "Vadim");
    }

    #[test]
    fn auto_registered_inviter_is_labelled_by_its_link() {
        let mut store = fixture_store();
        let mut settings = utc_settings();
        settings.auto_register_invite_links = true;
        if let Err(err) = store.ingest_event(
            &membership_event(
                1,
                EventKind::Subscribe,
                "2026-03-01T10:00:00Z",
                Some(1),
                Some("https://t.me/+fresh"),
            ),
            &settings,
        ) {
            panic!("ingest failed: {err}");
        }
        ingest(&mut store, 2, EventKind::Subscribe, "2026-03-01T11:00:00Z", 2, None);

        let rows = must(store.inviter_leaderboard(range("2026-03-01", "2026-03-01"), &settings));
        let names: Vec<&str> = rows.iter().map(|row| row.inviter_name.as_str()).collect();
        assert!(names.contains(&"https://t.me/+fresh"));
        assert!(names.contains(&DIRECT_INVITER_NAME));

        let export = must(store.journal_export(range("2026-03-01", "2026-03-01"), &settings));
        assert_eq!(export[1].inviter_name, "https://t.me/+fresh");
        assert_eq!(export[0].inviter_name, DIRECT_INVITER_NAME);
    }
}
