//! Read-side folds over the journal.
//!
//! Every view here is recomputed from entries and verdicts; callers pass the
//! rows they loaded and the deployment offset. Input order does not matter:
//! each fold replays entries by `(event_time, id)`.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime, UtcOffset};

use crate::{
    local_date, serde_date, serde_rfc3339, DateRange, EventKind, Inviter, JournalEntry,
    MembershipEffect, RetentionCheck, RetentionResult, DIRECT_INVITER_NAME,
};

/// Replays membership effects and tracks each user's current state.
#[derive(Debug, Default, Clone)]
pub struct MembershipFold {
    latest: HashMap<i64, MembershipEffect>,
}

impl MembershipFold {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Neutral kinds leave the user's state untouched.
    pub fn apply(&mut self, entry: &JournalEntry) {
        let effect = entry.event_kind.membership();
        if effect != MembershipEffect::Neutral {
            self.latest.insert(entry.tg_user_id, effect);
        }
    }

    #[must_use]
    pub fn is_active(&self, tg_user_id: i64) -> bool {
        self.latest.get(&tg_user_id) == Some(&MembershipEffect::Active)
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.latest
            .values()
            .filter(|effect| **effect == MembershipEffect::Active)
            .count()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct DailyAggregateRow {
    #[serde(with = "serde_date")]
    pub date: Date,
    pub subscribes: u64,
    pub unsubscribes: u64,
    pub net_change: i64,
    pub unique_subscribers: u64,
    pub repeat_subscribes: u64,
    pub total_active: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InviterLeaderboardRow {
    pub inviter_id: Option<i64>,
    pub inviter_name: String,
    pub invite_link: Option<String>,
    pub invited: u64,
    pub unique_users: u64,
    pub repeat_subscribes: u64,
    pub active_at_end: u64,
    pub active_percent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetentionSummary {
    pub range: DateRange,
    pub cohort: u64,
    pub retained: u64,
    pub not_retained: u64,
    pub pending: u64,
    pub unchecked: u64,
    pub retention_rate: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct PeriodSummary {
    pub range: DateRange,
    pub subscribes: u64,
    pub unsubscribes: u64,
    pub net_growth: i64,
    pub unique_subscribers: u64,
    pub repeat_subscribes: u64,
    pub total_active_at_end: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct UserSummary {
    pub tg_user_id: i64,
    pub username: Option<String>,
    pub name: Option<String>,
    pub subscribes: u64,
    pub unsubscribes: u64,
    #[serde(with = "serde_rfc3339::option")]
    pub first_subscribed_at: Option<OffsetDateTime>,
    #[serde(with = "serde_rfc3339")]
    pub last_activity: OffsetDateTime,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct JournalExportRow {
    pub id: i64,
    #[serde(with = "serde_rfc3339")]
    pub event_time: OffsetDateTime,
    pub event_kind: EventKind,
    pub tg_user_id: i64,
    pub username: Option<String>,
    pub name: Option<String>,
    pub inviter_name: String,
    pub status: Option<String>,
    pub note: Option<String>,
}

fn chronological(entries: &[JournalEntry]) -> Vec<&JournalEntry> {
    let mut ordered: Vec<&JournalEntry> = entries.iter().collect();
    ordered.sort_by(|lhs, rhs| {
        lhs.event_time
            .cmp(&rhs.event_time)
            .then(lhs.id.cmp(&rhs.id))
    });
    ordered
}

fn count(value: usize) -> u64 {
    u64::try_from(value).unwrap_or(u64::MAX)
}

fn signed(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[derive(Debug, Default)]
struct Tally {
    subscribes: u64,
    unsubscribes: u64,
    repeats: u64,
    subscribers: BTreeSet<i64>,
}

impl Tally {
    fn observe(&mut self, entry: &JournalEntry) {
        if entry.event_kind.is_join_class() {
            self.subscribes += 1;
            self.subscribers.insert(entry.tg_user_id);
            if entry.is_repeat() {
                self.repeats += 1;
            }
        } else if entry.event_kind.membership() == MembershipEffect::Departed {
            self.unsubscribes += 1;
        }
    }

    fn net(&self) -> i64 {
        signed(self.subscribes) - signed(self.unsubscribes)
    }
}

/// One row per local date in `range`, including empty days.
///
/// `entries` must contain every entry before the end of the range so that
/// `total_active` reflects the whole history.
#[must_use]
pub fn daily_rows(
    entries: &[JournalEntry],
    range: DateRange,
    offset: UtcOffset,
) -> Vec<DailyAggregateRow> {
    let ordered = chronological(entries);
    let mut fold = MembershipFold::new();
    let mut cursor = 0;
    let mut rows = Vec::new();

    for day in range.days() {
        let mut tally = Tally::default();
        while let Some(entry) = ordered.get(cursor) {
            let entry_day = local_date(entry.event_time, offset);
            if entry_day > day {
                break;
            }
            fold.apply(entry);
            if entry_day == day {
                tally.observe(entry);
            }
            cursor += 1;
        }

        rows.push(DailyAggregateRow {
            date: day,
            subscribes: tally.subscribes,
            unsubscribes: tally.unsubscribes,
            net_change: tally.net(),
            unique_subscribers: count(tally.subscribers.len()),
            repeat_subscribes: tally.repeats,
            total_active: count(fold.active_count()),
        });
    }

    rows
}

/// Totals for a week, month or any other date range.
#[must_use]
pub fn period_summary(
    entries: &[JournalEntry],
    range: DateRange,
    offset: UtcOffset,
) -> PeriodSummary {
    let mut fold = MembershipFold::new();
    let mut tally = Tally::default();

    for entry in chronological(entries) {
        let day = local_date(entry.event_time, offset);
        if day > range.end {
            break;
        }
        fold.apply(entry);
        if range.contains(day) {
            tally.observe(entry);
        }
    }

    PeriodSummary {
        range,
        subscribes: tally.subscribes,
        unsubscribes: tally.unsubscribes,
        net_growth: tally.net(),
        unique_subscribers: count(tally.subscribers.len()),
        repeat_subscribes: tally.repeats,
        total_active_at_end: count(fold.active_count()),
    }
}

#[derive(Debug, Default)]
struct InviterTally {
    invited: u64,
    repeats: u64,
    users: BTreeSet<i64>,
}

/// Per-inviter join counts in `range`, sorted by invited count descending.
/// Unattributed joins are reported under the direct label with no id.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn inviter_leaderboard(
    entries: &[JournalEntry],
    inviters: &[Inviter],
    range: DateRange,
    offset: UtcOffset,
) -> Vec<InviterLeaderboardRow> {
    let mut fold = MembershipFold::new();
    let mut tallies: BTreeMap<Option<i64>, InviterTally> = BTreeMap::new();

    for entry in chronological(entries) {
        let day = local_date(entry.event_time, offset);
        if day > range.end {
            break;
        }
        fold.apply(entry);
        if range.contains(day) && entry.event_kind.is_join_class() {
            let tally = tallies.entry(entry.inviter_id).or_default();
            tally.invited += 1;
            tally.users.insert(entry.tg_user_id);
            if entry.is_repeat() {
                tally.repeats += 1;
            }
        }
    }

    let by_id: HashMap<i64, &Inviter> = inviters.iter().map(|inviter| (inviter.id, inviter)).collect();
    let mut rows: Vec<InviterLeaderboardRow> = tallies
        .into_iter()
        .map(|(inviter_id, tally)| {
            let inviter = inviter_id.and_then(|id| by_id.get(&id).copied());
            let active = count(
                tally
                    .users
                    .iter()
                    .filter(|user| fold.is_active(**user))
                    .count(),
            );
            let unique = count(tally.users.len());
            let percent = if unique == 0 {
                0.0
            } else {
                ((active as f64 / unique as f64) * 10_000.0).round() / 100.0
            };

            InviterLeaderboardRow {
                inviter_id,
                inviter_name: inviter.map_or_else(|| DIRECT_INVITER_NAME.to_string(), |found| found.display_name()),
                invite_link: inviter.and_then(|found| found.invite_link.clone()),
                invited: tally.invited,
                unique_users: unique,
                repeat_subscribes: tally.repeats,
                active_at_end: active,
                active_percent: percent,
            }
        })
        .collect();

    rows.sort_by_key(|row| (Reverse(row.invited), row.inviter_id.unwrap_or(i64::MAX)));
    rows
}

/// Retention outcome of the join-class cohort in `range`.
///
/// Each cohort entry counts once, by its most recent final verdict. Entries
/// with only pending checks are pending; entries never evaluated are
/// unchecked.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn retention_summary(
    cohort: &[JournalEntry],
    checks: &[RetentionCheck],
    range: DateRange,
    offset: UtcOffset,
) -> RetentionSummary {
    let mut by_entry: HashMap<i64, Vec<&RetentionCheck>> = HashMap::new();
    for check in checks {
        by_entry.entry(check.journal_id).or_default().push(check);
    }

    let mut summary = RetentionSummary {
        range,
        cohort: 0,
        retained: 0,
        not_retained: 0,
        pending: 0,
        unchecked: 0,
        retention_rate: None,
    };

    for entry in cohort {
        if !entry.event_kind.is_join_class() || !range.contains(local_date(entry.event_time, offset)) {
            continue;
        }
        summary.cohort += 1;

        let entry_checks = by_entry.get(&entry.id).map_or(&[][..], Vec::as_slice);
        let final_check = entry_checks
            .iter()
            .filter(|check| check.result.is_final())
            .max_by_key(|check| (check.check_date, check.id));

        match final_check.map(|check| check.result) {
            Some(RetentionResult::Retained) => summary.retained += 1,
            Some(RetentionResult::NotRetained) => summary.not_retained += 1,
            Some(RetentionResult::Pending) | None if !entry_checks.is_empty() => {
                summary.pending += 1;
            }
            _ => summary.unchecked += 1,
        }
    }

    let completed = summary.retained + summary.not_retained;
    if completed > 0 {
        summary.retention_rate = Some(summary.retained as f64 / completed as f64);
    }

    summary
}

/// Per-user activity, most recently active first.
#[must_use]
pub fn user_summaries(entries: &[JournalEntry]) -> Vec<UserSummary> {
    let mut fold = MembershipFold::new();
    let mut users: BTreeMap<i64, UserSummary> = BTreeMap::new();

    for entry in chronological(entries) {
        fold.apply(entry);
        let summary = users.entry(entry.tg_user_id).or_insert_with(|| UserSummary {
            tg_user_id: entry.tg_user_id,
            username: None,
            name: None,
            subscribes: 0,
            unsubscribes: 0,
            first_subscribed_at: None,
            last_activity: entry.event_time,
            active: false,
        });

        if entry.username.is_some() {
            summary.username.clone_from(&entry.username);
        }
        if entry.name.is_some() {
            summary.name.clone_from(&entry.name);
        }
        if entry.event_kind.is_join_class() {
            summary.subscribes += 1;
            summary.first_subscribed_at.get_or_insert(entry.event_time);
        } else if entry.event_kind.membership() == MembershipEffect::Departed {
            summary.unsubscribes += 1;
        }
        summary.last_activity = entry.event_time;
    }

    let mut rows: Vec<UserSummary> = users
        .into_values()
        .map(|mut summary| {
            summary.active = fold.is_active(summary.tg_user_id);
            summary
        })
        .collect();
    rows.sort_by_key(|row| (Reverse(row.last_activity), row.tg_user_id));
    rows
}

/// Entries newest first, joined with the inviter display name.
#[must_use]
pub fn export_rows(entries: &[JournalEntry], inviters: &[Inviter]) -> Vec<JournalExportRow> {
    let by_id: HashMap<i64, &Inviter> = inviters.iter().map(|inviter| (inviter.id, inviter)).collect();
    let mut ordered = chronological(entries);
    ordered.reverse();

    ordered
        .into_iter()
        .map(|entry| JournalExportRow {
            id: entry.id,
            event_time: entry.event_time,
            event_kind: entry.event_kind.clone(),
            tg_user_id: entry.tg_user_id,
            username: entry.username.clone(),
            name: entry.name.clone(),
            inviter_name: entry
                .inviter_id
                .and_then(|id| by_id.get(&id))
                .map_or_else(|| DIRECT_INVITER_NAME.to_string(), |inviter| inviter.display_name()),
            status: entry.status.clone(),
            note: entry.note.clone(),
        })
        .collect()
}
