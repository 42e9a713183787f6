//! Domain model for the subscriber journal.
//!
//! Everything in this crate is pure: record types for the append-only
//! journal, the event-kind taxonomy, persisted settings, the error taxonomy,
//! the retention verdict rule and (in [`aggregate`]) the read-side folds.
//! Persistence lives in `subscriber-journal-store-sqlite`.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::macros::format_description;
use time::{Date, Duration, OffsetDateTime, UtcOffset};

pub mod aggregate;

pub use aggregate::{
    daily_rows, export_rows, inviter_leaderboard, period_summary, retention_summary,
    user_summaries, DailyAggregateRow, InviterLeaderboardRow, JournalExportRow, MembershipFold,
    PeriodSummary, RetentionSummary, UserSummary,
};

/// Name of the sentinel inviter used when no invite link is known.
pub const DIRECT_INVITER_NAME: &str = "Direct / unknown";
/// Reserved `invite_link` value identifying the direct sentinel inviter.
pub const DIRECT_INVITE_LINK: &str = "direct";
pub const REPEAT_NOTE: &str = "repeat";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum JournalError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("referential integrity error: {0}")]
    ReferentialIntegrity(String),
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl JournalError {
    /// Only transient storage failures may be retried by the caller.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StorageUnavailable(_))
    }
}

/// Effect an event has on a user's membership.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MembershipEffect {
    Active,
    Departed,
    Neutral,
}

/// Journal event kind. The set is open: unrecognized kinds are preserved
/// verbatim in [`EventKind::Other`] and treated as neutral.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(from = "String", into = "String")]
pub enum EventKind {
    Subscribe,
    Unsubscribe,
    JoinRequest,
    ManualAdd,
    GroupJoin,
    GroupLeave,
    ChannelBanned,
    ChannelUnbanned,
    GroupBanned,
    GroupUnbanned,
    GroupPromoted,
    GroupDemoted,
    Other(String),
}

/// Kinds that start a retention window.
pub const JOIN_CLASS_KINDS: [EventKind; 3] =
    [EventKind::Subscribe, EventKind::GroupJoin, EventKind::ManualAdd];

/// Known kinds recorded in [`EventKind::Other`] that never change a
/// user's membership: private chat blocks and the bot's own status.
pub const AUXILIARY_EVENT_KINDS: [&str; 8] = [
    "private_blocked",
    "private_unblocked",
    "bot_added",
    "bot_removed",
    "bot_banned",
    "bot_unbanned",
    "bot_promoted",
    "bot_demoted",
];

impl EventKind {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
            Self::JoinRequest => "join_request",
            Self::ManualAdd => "manual_add",
            Self::GroupJoin => "group_join",
            Self::GroupLeave => "group_leave",
            Self::ChannelBanned => "channel_banned",
            Self::ChannelUnbanned => "channel_unbanned",
            Self::GroupBanned => "group_banned",
            Self::GroupUnbanned => "group_unbanned",
            Self::GroupPromoted => "group_promoted",
            Self::GroupDemoted => "group_demoted",
            Self::Other(value) => value,
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value.trim() {
            "subscribe" => Self::Subscribe,
            "unsubscribe" => Self::Unsubscribe,
            "join_request" => Self::JoinRequest,
            "manual_add" => Self::ManualAdd,
            "group_join" => Self::GroupJoin,
            "group_leave" => Self::GroupLeave,
            "channel_banned" => Self::ChannelBanned,
            "channel_unbanned" => Self::ChannelUnbanned,
            "group_banned" => Self::GroupBanned,
            "group_unbanned" => Self::GroupUnbanned,
            "group_promoted" => Self::GroupPromoted,
            "group_demoted" => Self::GroupDemoted,
            other => Self::Other(other.to_string()),
        }
    }

    #[must_use]
    pub fn membership(&self) -> MembershipEffect {
        match self {
            Self::Subscribe
            | Self::ManualAdd
            | Self::GroupJoin
            | Self::ChannelUnbanned
            | Self::GroupUnbanned
            | Self::GroupPromoted
            | Self::GroupDemoted => MembershipEffect::Active,
            Self::Unsubscribe | Self::GroupLeave | Self::ChannelBanned | Self::GroupBanned => {
                MembershipEffect::Departed
            }
            Self::JoinRequest | Self::Other(_) => MembershipEffect::Neutral,
        }
    }

    #[must_use]
    pub fn is_join_class(&self) -> bool {
        JOIN_CLASS_KINDS.contains(self)
    }

    /// False only for open kinds outside [`AUXILIARY_EVENT_KINDS`].
    #[must_use]
    pub fn is_recognized(&self) -> bool {
        match self {
            Self::Other(value) => AUXILIARY_EVENT_KINDS.contains(&value.as_str()),
            _ => true,
        }
    }
}

impl From<String> for EventKind {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<EventKind> for String {
    fn from(value: EventKind) -> Self {
        value.as_str().to_string()
    }
}

impl Display for EventKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ChatKind {
    Channel,
    Group,
    Supergroup,
    Private,
}

impl ChatKind {
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "channel" => Some(Self::Channel),
            "group" => Some(Self::Group),
            "supergroup" => Some(Self::Supergroup),
            "private" => Some(Self::Private),
            _ => None,
        }
    }
}

/// Chat member status as reported by the transport.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum MemberStatus {
    Creator,
    Administrator,
    Member,
    Restricted,
    Left,
    Banned,
}

impl MemberStatus {
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "creator" | "owner" => Some(Self::Creator),
            "administrator" => Some(Self::Administrator),
            "member" => Some(Self::Member),
            "restricted" => Some(Self::Restricted),
            "left" => Some(Self::Left),
            "banned" | "kicked" => Some(Self::Banned),
            _ => None,
        }
    }
}

/// Maps a chat-member status transition to the journal event kind it
/// represents. Transitions that are not tracked return `None`.
#[must_use]
pub fn classify_membership_change(
    chat: ChatKind,
    old: MemberStatus,
    new: MemberStatus,
) -> Option<EventKind> {
    use MemberStatus::{Administrator, Banned, Left, Member, Restricted};

    match chat {
        ChatKind::Channel => match (old, new) {
            (Left, Member) => Some(EventKind::Subscribe),
            (Member, Left) => Some(EventKind::Unsubscribe),
            (Member, Banned) => Some(EventKind::ChannelBanned),
            (Banned, Member) => Some(EventKind::ChannelUnbanned),
            _ => None,
        },
        ChatKind::Group | ChatKind::Supergroup => match (old, new) {
            (Left, Member | Restricted) => Some(EventKind::GroupJoin),
            (Member | Restricted, Left) => Some(EventKind::GroupLeave),
            (Member | Restricted, Banned) => Some(EventKind::GroupBanned),
            (Banned, Member | Restricted) => Some(EventKind::GroupUnbanned),
            (Member, Administrator) => Some(EventKind::GroupPromoted),
            (Administrator, Member) => Some(EventKind::GroupDemoted),
            _ => None,
        },
        ChatKind::Private => match (old, new) {
            (Left, Member) => Some(EventKind::Other("private_unblocked".to_string())),
            (Member, Banned) => Some(EventKind::Other("private_blocked".to_string())),
            _ => None,
        },
    }
}

/// Maps a status transition of the bot itself, in any chat kind.
#[must_use]
pub fn classify_bot_membership_change(old: MemberStatus, new: MemberStatus) -> Option<EventKind> {
    use MemberStatus::{Administrator, Banned, Left, Member};

    let kind = match (old, new) {
        (Left, Member | Administrator) => "bot_added",
        (Member | Administrator, Left) => "bot_removed",
        (Member | Administrator, Banned) => "bot_banned",
        (Banned, Member | Administrator) => "bot_unbanned",
        (Member, Administrator) => "bot_promoted",
        (Administrator, Member) => "bot_demoted",
        _ => return None,
    };
    Some(EventKind::Other(kind.to_string()))
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct User {
    pub id: i64,
    pub tg_user_id: i64,
    pub username: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Inviter {
    pub id: i64,
    pub name: Option<String>,
    pub username: Option<String>,
    pub invite_link: Option<String>,
    pub channel_id: Option<String>,
}

impl Inviter {
    #[must_use]
    pub fn is_direct(&self) -> bool {
        self.invite_link.as_deref() == Some(DIRECT_INVITE_LINK)
    }

    /// Username first, then name, then the invite link, then the direct
    /// sentinel label.
    #[must_use]
    pub fn display_name(&self) -> String {
        if let Some(username) = self.username.as_deref() {
            return username.to_string();
        }
        if let Some(name) = self.name.as_deref() {
            return name.to_string();
        }
        match self.invite_link.as_deref() {
            Some(link) if !self.is_direct() => link.to_string(),
            _ => DIRECT_INVITER_NAME.to_string(),
        }
    }
}

/// An immutable journal row.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct JournalEntry {
    pub id: i64,
    #[serde(with = "serde_rfc3339")]
    pub event_time: OffsetDateTime,
    pub event_kind: EventKind,
    pub tg_user_id: i64,
    pub username: Option<String>,
    pub name: Option<String>,
    pub inviter_id: Option<i64>,
    pub status: Option<String>,
    pub note: Option<String>,
    pub telegram_update_id: Option<i64>,
}

impl JournalEntry {
    #[must_use]
    pub fn is_repeat(&self) -> bool {
        self.note
            .as_deref()
            .is_some_and(|note| note.split(',').any(|part| part.trim() == REPEAT_NOTE))
    }
}

/// A journal row that has not been persisted yet.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct NewJournalEntry {
    #[serde(with = "serde_rfc3339")]
    pub event_time: OffsetDateTime,
    pub event_kind: EventKind,
    pub tg_user_id: i64,
    pub username: Option<String>,
    pub name: Option<String>,
    pub inviter_id: Option<i64>,
    pub status: Option<String>,
    pub note: Option<String>,
    pub telegram_update_id: Option<i64>,
}

impl NewJournalEntry {
    /// # Errors
    /// Returns [`JournalError::Validation`] for a non-positive user id or an
    /// empty event kind.
    pub fn validate(&self) -> Result<(), JournalError> {
        if self.tg_user_id <= 0 {
            return Err(JournalError::Validation(format!(
                "tg_user_id MUST be positive, got {}",
                self.tg_user_id
            )));
        }

        if self.event_kind.as_str().trim().is_empty() {
            return Err(JournalError::Validation(
                "event_kind MUST be provided".to_string(),
            ));
        }

        Ok(())
    }
}

/// Membership-change notification as delivered by the transport.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct MembershipEvent {
    #[serde(default, with = "serde_rfc3339::option")]
    pub event_time: Option<OffsetDateTime>,
    pub event_kind: EventKind,
    #[serde(default)]
    pub tg_user_id: Option<i64>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub idempotency_key: Option<i64>,
    #[serde(default)]
    pub invite_link_hint: Option<String>,
    #[serde(default)]
    pub channel_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct NormalizedEvent {
    #[serde(with = "serde_rfc3339")]
    pub event_time: OffsetDateTime,
    pub event_kind: EventKind,
    pub tg_user_id: i64,
    pub username: Option<String>,
    pub name: Option<String>,
    pub status: Option<String>,
    pub note: Option<String>,
    pub idempotency_key: Option<i64>,
    pub invite_link_hint: Option<String>,
    pub channel_id: Option<String>,
}

impl MembershipEvent {
    /// Trims optional text, drops empty strings and normalizes the event
    /// time to whole-second UTC.
    ///
    /// # Errors
    /// Returns [`JournalError::Validation`] when the event time or user id is
    /// missing, the user id is not positive, or the kind is empty.
    pub fn normalize(&self) -> Result<NormalizedEvent, JournalError> {
        let Some(event_time) = self.event_time else {
            return Err(JournalError::Validation(
                "event_time MUST be provided".to_string(),
            ));
        };
        let Some(tg_user_id) = self.tg_user_id else {
            return Err(JournalError::Validation(
                "tg_user_id MUST be provided".to_string(),
            ));
        };
        if tg_user_id <= 0 {
            return Err(JournalError::Validation(format!(
                "tg_user_id MUST be positive, got {tg_user_id}"
            )));
        }

        let event_kind = EventKind::parse(self.event_kind.as_str());
        if event_kind.as_str().is_empty() {
            return Err(JournalError::Validation(
                "event_kind MUST be provided".to_string(),
            ));
        }

        Ok(NormalizedEvent {
            event_time: normalize_event_time(event_time)?,
            event_kind,
            tg_user_id,
            username: clean_text(self.username.as_deref()),
            name: clean_text(self.name.as_deref()),
            status: clean_text(self.status.as_deref()),
            note: clean_text(self.note.as_deref()),
            idempotency_key: self.idempotency_key,
            invite_link_hint: clean_text(self.invite_link_hint.as_deref()),
            channel_id: clean_text(self.channel_id.as_deref()),
        })
    }
}

impl NormalizedEvent {
    #[must_use]
    pub fn into_entry(self, inviter_id: Option<i64>) -> NewJournalEntry {
        NewJournalEntry {
            event_time: self.event_time,
            event_kind: self.event_kind,
            tg_user_id: self.tg_user_id,
            username: self.username,
            name: self.name,
            inviter_id,
            status: self.status,
            note: self.note,
            telegram_update_id: self.idempotency_key,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RetentionResult {
    Retained,
    NotRetained,
    Pending,
}

impl RetentionResult {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Retained => "retained",
            Self::NotRetained => "not_retained",
            Self::Pending => "pending",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "retained" => Some(Self::Retained),
            "not_retained" => Some(Self::NotRetained),
            "pending" => Some(Self::Pending),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_final(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RetentionCheck {
    pub id: i64,
    pub journal_id: i64,
    #[serde(with = "serde_date")]
    pub check_date: Date,
    pub result: RetentionResult,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum VerdictReason {
    WindowOpen {
        #[serde(with = "serde_date")]
        matures_on: Date,
    },
    LatestActive {
        journal_id: i64,
    },
    LatestDeparted {
        journal_id: i64,
    },
    Ambiguous {
        journal_id: i64,
        event_kind: EventKind,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RetentionVerdict {
    pub result: RetentionResult,
    pub reason: VerdictReason,
}

/// Decides the retention verdict for a join-class entry as of `as_of`.
///
/// The window is elapsed once `as_of` is at least `retention_days` after the
/// local join date. The user's latest entry before the end of `as_of`
/// (ordered by event time, then id) decides the verdict. Known neutral kinds
/// (join requests, [`AUXILIARY_EVENT_KINDS`]) are skipped; an unrecognized
/// latest kind is reported as [`VerdictReason::Ambiguous`] and stays pending.
///
/// # Errors
/// Returns [`JournalError::Validation`] when date arithmetic overflows.
pub fn decide_retention(
    candidate: &JournalEntry,
    history: &[JournalEntry],
    as_of: Date,
    retention_days: u16,
    offset: UtcOffset,
) -> Result<RetentionVerdict, JournalError> {
    let joined_on = local_date(candidate.event_time, offset);
    let matures_on = joined_on
        .checked_add(Duration::days(i64::from(retention_days)))
        .ok_or_else(|| JournalError::Validation(format!("retention window overflows {joined_on}")))?;

    if matures_on > as_of {
        return Ok(RetentionVerdict {
            result: RetentionResult::Pending,
            reason: VerdictReason::WindowOpen { matures_on },
        });
    }

    let cutoff = day_end(as_of, offset)?;
    let latest = history
        .iter()
        .filter(|entry| entry.tg_user_id == candidate.tg_user_id && entry.event_time < cutoff)
        .filter(|entry| {
            entry.event_kind.membership() != MembershipEffect::Neutral
                || !entry.event_kind.is_recognized()
        })
        .max_by(|lhs, rhs| {
            lhs.event_time
                .cmp(&rhs.event_time)
                .then(lhs.id.cmp(&rhs.id))
        })
        .unwrap_or(candidate);

    let verdict = match latest.event_kind.membership() {
        MembershipEffect::Active => RetentionVerdict {
            result: RetentionResult::Retained,
            reason: VerdictReason::LatestActive {
                journal_id: latest.id,
            },
        },
        MembershipEffect::Departed => RetentionVerdict {
            result: RetentionResult::NotRetained,
            reason: VerdictReason::LatestDeparted {
                journal_id: latest.id,
            },
        },
        MembershipEffect::Neutral => RetentionVerdict {
            result: RetentionResult::Pending,
            reason: VerdictReason::Ambiguous {
                journal_id: latest.id,
                event_kind: latest.event_kind.clone(),
            },
        },
    };

    Ok(verdict)
}

/// Deployment configuration, persisted alongside the journal and passed
/// explicitly to evaluation and aggregation.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct JournalSettings {
    pub settings_version: u32,
    pub retention_days: u16,
    /// Fixed offset of the reporting timezone, e.g. `+05:00`.
    pub utc_offset: String,
    /// Register unknown invite links as new inviters during ingestion
    /// instead of recording the entry without attribution.
    pub auto_register_invite_links: bool,
}

impl JournalSettings {
    #[must_use]
    pub fn v1() -> Self {
        Self {
            settings_version: 1,
            retention_days: 7,
            utc_offset: "+05:00".to_string(),
            auto_register_invite_links: false,
        }
    }

    /// # Errors
    /// Returns [`JournalError::Configuration`] when a field is out of range
    /// or the offset cannot be parsed.
    pub fn validate(&self) -> Result<(), JournalError> {
        if self.settings_version == 0 {
            return Err(JournalError::Configuration(
                "settings_version MUST be >= 1".to_string(),
            ));
        }

        if !(1..=365).contains(&self.retention_days) {
            return Err(JournalError::Configuration(format!(
                "retention_days MUST be within [1, 365], got {}",
                self.retention_days
            )));
        }

        self.offset()?;
        Ok(())
    }

    /// # Errors
    /// Returns [`JournalError::Configuration`] when `utc_offset` is invalid.
    pub fn offset(&self) -> Result<UtcOffset, JournalError> {
        parse_utc_offset(&self.utc_offset)
    }

    /// # Errors
    /// Returns [`JournalError::Configuration`] when the JSON does not decode
    /// or the decoded settings fail validation.
    pub fn from_json(value: &Value) -> Result<Self, JournalError> {
        let settings: Self = serde_json::from_value(value.clone())
            .map_err(|err| JournalError::Configuration(format!("invalid settings JSON: {err}")))?;
        settings.validate()?;
        Ok(settings)
    }
}

impl Default for JournalSettings {
    fn default() -> Self {
        Self::v1()
    }
}

/// Inclusive range of local calendar dates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct DateRange {
    #[serde(with = "serde_date")]
    pub start: Date,
    #[serde(with = "serde_date")]
    pub end: Date,
}

impl DateRange {
    const MAX_DAYS: i64 = 3_660;

    /// # Errors
    /// Returns [`JournalError::Validation`] when `end` precedes `start` or the
    /// range spans more than ten years.
    pub fn new(start: Date, end: Date) -> Result<Self, JournalError> {
        if end < start {
            return Err(JournalError::Validation(format!(
                "date range end {end} precedes start {start}"
            )));
        }
        if (end - start).whole_days() > Self::MAX_DAYS {
            return Err(JournalError::Validation(format!(
                "date range {start}..{end} exceeds {} days",
                Self::MAX_DAYS
            )));
        }
        Ok(Self { start, end })
    }

    #[must_use]
    pub fn single(day: Date) -> Self {
        Self {
            start: day,
            end: day,
        }
    }

    #[must_use]
    pub fn contains(&self, day: Date) -> bool {
        self.start <= day && day <= self.end
    }

    #[must_use]
    pub fn days(&self) -> Vec<Date> {
        let mut days = Vec::new();
        let mut cursor = Some(self.start);
        while let Some(day) = cursor {
            if day > self.end {
                break;
            }
            days.push(day);
            cursor = day.next_day();
        }
        days
    }

    /// Half-open UTC instants `[start of first day, start of day after end)`.
    ///
    /// # Errors
    /// Returns [`JournalError::Validation`] when the bounds overflow.
    pub fn utc_bounds(
        &self,
        offset: UtcOffset,
    ) -> Result<(OffsetDateTime, OffsetDateTime), JournalError> {
        Ok((day_start(self.start, offset)?, day_end(self.end, offset)?))
    }
}

/// Monday-to-Sunday week containing `day`.
///
/// # Errors
/// Returns [`JournalError::Validation`] at the edges of the supported range.
pub fn week_of(day: Date) -> Result<DateRange, JournalError> {
    let back = i64::from(day.weekday().number_days_from_monday());
    let start = day
        .checked_sub(Duration::days(back))
        .ok_or_else(|| JournalError::Validation(format!("week start overflows for {day}")))?;
    let end = start
        .checked_add(Duration::days(6))
        .ok_or_else(|| JournalError::Validation(format!("week end overflows for {day}")))?;
    DateRange::new(start, end)
}

/// Calendar month containing `day`.
///
/// # Errors
/// Returns [`JournalError::Validation`] when the month bounds are invalid.
pub fn month_of(day: Date) -> Result<DateRange, JournalError> {
    let last = day.month().length(day.year());
    let start = day
        .replace_day(1)
        .map_err(|err| JournalError::Validation(format!("invalid month start: {err}")))?;
    let end = day
        .replace_day(last)
        .map_err(|err| JournalError::Validation(format!("invalid month end: {err}")))?;
    DateRange::new(start, end)
}

#[must_use]
pub fn local_date(value: OffsetDateTime, offset: UtcOffset) -> Date {
    value.to_offset(offset).date()
}

/// First instant of `day` in the given offset, expressed in UTC.
///
/// # Errors
/// Returns [`JournalError::Validation`] when the instant is out of range.
pub fn day_start(day: Date, offset: UtcOffset) -> Result<OffsetDateTime, JournalError> {
    if day == Date::MIN || day == Date::MAX {
        return Err(JournalError::Validation(format!(
            "day start out of range for {day}"
        )));
    }
    Ok(day
        .midnight()
        .assume_offset(offset)
        .to_offset(UtcOffset::UTC))
}

/// First instant after `day` in the given offset, expressed in UTC.
///
/// # Errors
/// Returns [`JournalError::Validation`] when the instant is out of range.
pub fn day_end(day: Date, offset: UtcOffset) -> Result<OffsetDateTime, JournalError> {
    let next = day
        .next_day()
        .ok_or_else(|| JournalError::Validation(format!("no day after {day}")))?;
    day_start(next, offset)
}

/// Parses an RFC3339 timestamp with any offset and normalizes it to UTC.
///
/// # Errors
/// Returns [`JournalError::Validation`] when parsing fails.
pub fn parse_rfc3339(value: &str) -> Result<OffsetDateTime, JournalError> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map(|parsed| parsed.to_offset(UtcOffset::UTC))
        .map_err(|err| JournalError::Validation(format!("invalid RFC3339 timestamp: {err}")))
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`JournalError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, JournalError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            JournalError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

/// Normalizes an event time to UTC with whole seconds, which keeps the
/// stored text representation sortable.
///
/// # Errors
/// Returns [`JournalError::Validation`] when the timestamp cannot be
/// truncated.
pub fn normalize_event_time(value: OffsetDateTime) -> Result<OffsetDateTime, JournalError> {
    value
        .to_offset(UtcOffset::UTC)
        .replace_nanosecond(0)
        .map_err(|err| JournalError::Validation(format!("invalid event_time: {err}")))
}

/// Parses a `YYYY-MM-DD` calendar date.
///
/// # Errors
/// Returns [`JournalError::Validation`] when parsing fails.
pub fn parse_date(value: &str) -> Result<Date, JournalError> {
    Date::parse(value.trim(), format_description!("[year]-[month]-[day]"))
        .map_err(|err| JournalError::Validation(format!("invalid date {value:?}: {err}")))
}

/// Formats a calendar date as `YYYY-MM-DD`.
///
/// # Errors
/// Returns [`JournalError::Validation`] when formatting fails.
pub fn format_date(value: Date) -> Result<String, JournalError> {
    value
        .format(format_description!("[year]-[month]-[day]"))
        .map_err(|err| JournalError::Validation(format!("failed to format date: {err}")))
}

/// Parses a fixed offset such as `+05:00`, `-03:30`, `Z` or `UTC`.
///
/// # Errors
/// Returns [`JournalError::Configuration`] when parsing fails.
pub fn parse_utc_offset(value: &str) -> Result<UtcOffset, JournalError> {
    let trimmed = value.trim();
    if trimmed == "Z" || trimmed.eq_ignore_ascii_case("utc") {
        return Ok(UtcOffset::UTC);
    }

    UtcOffset::parse(
        trimmed,
        format_description!("[offset_hour sign:mandatory]:[offset_minute]"),
    )
    .map_err(|err| JournalError::Configuration(format!("invalid utc_offset {value:?}: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

/// Today's date in the given offset.
#[must_use]
pub fn today(offset: UtcOffset) -> Date {
    local_date(now_utc(), offset)
}

/// Trims text and maps empty strings to `None`.
#[must_use]
pub fn clean_text(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|inner| !inner.is_empty())
        .map(str::to_string)
}

/// Stores inviter usernames with a leading `@`.
#[must_use]
pub fn normalize_inviter_username(value: Option<&str>) -> Option<String> {
    clean_text(value).map(|raw| {
        if raw.starts_with('@') {
            raw
        } else {
            format!("@{raw}")
        }
    })
}

/// Appends `addition` to a comma-separated note unless already present.
#[must_use]
pub fn merge_note(existing: Option<&str>, addition: &str) -> String {
    match clean_text(existing) {
        Some(note) if note.split(',').any(|part| part.trim() == addition) => note,
        Some(note) => format!("{note},{addition}"),
        None => addition.to_string(),
    }
}

pub mod serde_rfc3339 {
    use serde::{Deserialize, Deserializer, Serializer};
    use time::OffsetDateTime;

    /// # Errors
    /// Fails when the timestamp cannot be formatted.
    pub fn serialize<S: Serializer>(
        value: &OffsetDateTime,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let formatted = super::format_rfc3339(*value).map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(&formatted)
    }

    /// # Errors
    /// Fails when the input is not an RFC3339 string.
    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<OffsetDateTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_rfc3339(&raw).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};
        use time::OffsetDateTime;

        /// # Errors
        /// Fails when the timestamp cannot be formatted.
        pub fn serialize<S: Serializer>(
            value: &Option<OffsetDateTime>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(inner) => super::serialize(inner, serializer),
                None => serializer.serialize_none(),
            }
        }

        /// # Errors
        /// Fails when a present value is not an RFC3339 string.
        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<OffsetDateTime>, D::Error> {
            let raw = Option::<String>::deserialize(deserializer)?;
            raw.map(|value| super::super::parse_rfc3339(&value))
                .transpose()
                .map_err(serde::de::Error::custom)
        }
    }
}

pub mod serde_date {
    use serde::{Deserialize, Deserializer, Serializer};
    use time::Date;

    /// # Errors
    /// Fails when the date cannot be formatted.
    pub fn serialize<S: Serializer>(value: &Date, serializer: S) -> Result<S::Ok, S::Error> {
        let formatted = super::format_date(*value).map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(&formatted)
    }

    /// # Errors
    /// Fails when the input is not a `YYYY-MM-DD` string.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Date, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_date(&raw).map_err(serde::de::Error::custom)
    }
}
