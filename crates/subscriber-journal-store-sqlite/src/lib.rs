#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::path::Path;

use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use subscriber_journal_core::{
    clean_text, format_date, format_rfc3339, merge_note, normalize_event_time,
    normalize_inviter_username, now_utc, parse_date, parse_rfc3339, EventKind, Inviter,
    JournalEntry, JournalError, JournalSettings, NewJournalEntry, RetentionCheck, RetentionResult,
    User, DIRECT_INVITER_NAME, DIRECT_INVITE_LINK, JOIN_CLASS_KINDS, REPEAT_NOTE,
};
use time::{Date, OffsetDateTime};

mod ingest;
mod reader;
mod retention;

pub use ingest::{BatchIngestError, BatchIngestReport, IngestOutcome};
pub use retention::{EvaluationState, RetentionRunReport, EVALUATOR_NAME};

pub type Result<T> = std::result::Result<T, JournalError>;

const JOURNAL_MIGRATION_VERSION: i64 = 1;
pub const DEFAULT_SETTINGS_NAME: &str = "default";

const SCHEMA_JOURNAL_TABLES_V1: &str = r"
CREATE TABLE IF NOT EXISTS users (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  tg_user_id INTEGER UNIQUE NOT NULL,
  username TEXT,
  name TEXT
);

CREATE TABLE IF NOT EXISTS inviters (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT,
  username TEXT,
  invite_link TEXT UNIQUE,
  channel_id TEXT
);

CREATE TABLE IF NOT EXISTS journal (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  event_time TEXT NOT NULL,
  event_type TEXT NOT NULL,
  tg_user_id INTEGER NOT NULL,
  username TEXT,
  name TEXT,
  inviter_id INTEGER REFERENCES inviters(id),
  status TEXT,
  note TEXT,
  telegram_update_id INTEGER
);

CREATE TABLE IF NOT EXISTS retention_checks (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  journal_id INTEGER NOT NULL REFERENCES journal(id),
  check_date TEXT NOT NULL,
  result TEXT NOT NULL CHECK (result IN ('retained', 'not_retained', 'pending')),
  UNIQUE(journal_id, check_date)
);

CREATE TABLE IF NOT EXISTS journal_settings (
  settings_name TEXT PRIMARY KEY,
  settings_json TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS retention_evaluation_state (
  evaluator_name TEXT PRIMARY KEY,
  last_check_date TEXT NOT NULL,
  last_run_check_date TEXT NOT NULL,
  retention_days INTEGER NOT NULL CHECK (retention_days >= 1),
  verdicts_recorded INTEGER NOT NULL DEFAULT 0,
  updated_at TEXT NOT NULL
);
";

const SCHEMA_JOURNAL_INDEXES_V1: &str = r"
CREATE UNIQUE INDEX IF NOT EXISTS idx_journal_telegram_update_id
  ON journal(telegram_update_id)
  WHERE telegram_update_id IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_journal_event_time ON journal(event_time);
CREATE INDEX IF NOT EXISTS idx_journal_tg_user_id ON journal(tg_user_id);
CREATE INDEX IF NOT EXISTS idx_journal_event_type ON journal(event_type);
CREATE INDEX IF NOT EXISTS idx_retention_checks_journal_id ON retention_checks(journal_id);
CREATE INDEX IF NOT EXISTS idx_retention_checks_check_date ON retention_checks(check_date);

CREATE TRIGGER IF NOT EXISTS trg_journal_no_update
BEFORE UPDATE ON journal
BEGIN
  SELECT RAISE(FAIL, 'journal is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_journal_no_delete
BEFORE DELETE ON journal
BEGIN
  SELECT RAISE(FAIL, 'journal is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_retention_checks_no_update
BEFORE UPDATE ON retention_checks
BEGIN
  SELECT RAISE(FAIL, 'retention_checks is write-once');
END;

CREATE TRIGGER IF NOT EXISTS trg_retention_checks_no_delete
BEFORE DELETE ON retention_checks
BEGIN
  SELECT RAISE(FAIL, 'retention_checks is write-once');
END;
";

const ENTRY_COLUMNS: &str = "id, event_time, event_type, tg_user_id, username, name, inviter_id, status, note, telegram_update_id";
const INVITER_COLUMNS: &str = "id, name, username, invite_link, channel_id";
const CHECK_COLUMNS: &str = "id, journal_id, check_date, result";

/// Single-connection handle over the journal database. Concurrent writers
/// open their own handles; SQLite constraints arbitrate between them.
pub struct SqliteJournalStore {
    conn: Connection,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AppendOutcome {
    Inserted(JournalEntry),
    DuplicateIgnored { existing_id: i64 },
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RecordOutcome {
    Recorded(RetentionCheck),
    AlreadyExists,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IntegrityIssueSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct IntegrityIssue {
    pub code: String,
    pub severity: IntegrityIssueSeverity,
    pub message: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct IntegrityCounts {
    pub users: u64,
    pub inviters: u64,
    pub journal_entries: u64,
    pub retention_checks: u64,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub contract_version: String,
    pub healthy: bool,
    pub counts: IntegrityCounts,
    pub issues: Vec<IntegrityIssue>,
    pub duplicate_idempotency_keys: Vec<i64>,
}

/// Maps rusqlite failures onto the journal error taxonomy.
trait StorageContext<T> {
    fn context(self, what: &str) -> Result<T>;
}

impl<T> StorageContext<T> for rusqlite::Result<T> {
    fn context(self, what: &str) -> Result<T> {
        self.map_err(|err| classify_sqlite_error(what, &err))
    }
}

fn classify_sqlite_error(what: &str, err: &rusqlite::Error) -> JournalError {
    match err {
        rusqlite::Error::SqliteFailure(failure, _) => match failure.code {
            ErrorCode::DatabaseBusy
            | ErrorCode::DatabaseLocked
            | ErrorCode::CannotOpen
            | ErrorCode::SystemIoFailure
            | ErrorCode::DiskFull => JournalError::StorageUnavailable(format!("{what}: {err}")),
            _ => JournalError::Storage(format!("{what}: {err}")),
        },
        rusqlite::Error::FromSqlConversionFailure(..)
        | rusqlite::Error::InvalidColumnType(..)
        | rusqlite::Error::IntegralValueOutOfRange(..) => {
            JournalError::Corrupt(format!("{what}: {err}"))
        }
        _ => JournalError::Storage(format!("{what}: {err}")),
    }
}

fn has_extended_code(err: &rusqlite::Error, extended: std::os::raw::c_int) -> bool {
    matches!(err, rusqlite::Error::SqliteFailure(failure, _) if failure.extended_code == extended)
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    has_extended_code(err, rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE)
        || has_extended_code(err, rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY)
}

fn is_foreign_key_violation(err: &rusqlite::Error) -> bool {
    has_extended_code(err, rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY)
}

/// `'subscribe', 'group_join', 'manual_add'` for use in SQL `IN` lists.
fn join_class_sql() -> String {
    JOIN_CLASS_KINDS
        .iter()
        .map(|kind| format!("'{}'", kind.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

impl SqliteJournalStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .context(&format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA busy_timeout = 5000;
             PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Creates or upgrades the schema. Safe to run on every start.
    ///
    /// Legacy databases get the `inviters.username` and
    /// `journal.telegram_update_id` columns added. Duplicate update ids block
    /// the idempotency index and fail the migration with a configuration
    /// error; they are never removed here.
    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_JOURNAL_TABLES_V1)
            .context("failed to apply journal tables")?;

        ensure_column(&self.conn, "inviters", "username", "TEXT")?;
        ensure_column(&self.conn, "journal", "telegram_update_id", "INTEGER")?;

        if !index_exists(&self.conn, "idx_journal_telegram_update_id")? {
            let duplicates = duplicate_update_ids(&self.conn, 5)?;
            if !duplicates.is_empty() {
                return Err(JournalError::Configuration(format!(
                    "journal contains duplicate telegram_update_id values (sample: {:?}); \
                     deduplicate them before migrating so the idempotency index can be created",
                    duplicates
                )));
            }
        }

        self.conn
            .execute_batch(SCHEMA_JOURNAL_INDEXES_V1)
            .context("failed to apply journal indexes and triggers")?;

        let now = format_rfc3339(now_utc())?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![JOURNAL_MIGRATION_VERSION, now],
            )
            .context("failed to register journal schema migration")?;

        self.conn
            .execute(
                "INSERT OR IGNORE INTO inviters(name, username, invite_link, channel_id)
                 VALUES (?1, NULL, ?2, NULL)",
                params![DIRECT_INVITER_NAME, DIRECT_INVITE_LINK],
            )
            .context("failed to seed direct inviter")?;

        let defaults = serde_json::to_string(&JournalSettings::v1())
            .map_err(|err| JournalError::Configuration(err.to_string()))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO journal_settings(settings_name, settings_json, updated_at)
                 VALUES (?1, ?2, ?3)",
                params![DEFAULT_SETTINGS_NAME, defaults, now],
            )
            .context("failed to seed default settings")?;

        Ok(())
    }

    pub fn load_settings(&self) -> Result<JournalSettings> {
        let stored: Option<String> = self
            .conn
            .query_row(
                "SELECT settings_json FROM journal_settings WHERE settings_name = ?1",
                params![DEFAULT_SETTINGS_NAME],
                |row| row.get(0),
            )
            .optional()
            .context("failed to load settings")?;

        match stored {
            Some(json) => {
                let value: serde_json::Value = serde_json::from_str(&json).map_err(|err| {
                    JournalError::Configuration(format!("invalid stored settings JSON: {err}"))
                })?;
                JournalSettings::from_json(&value)
            }
            None => Ok(JournalSettings::v1()),
        }
    }

    pub fn save_settings(&self, settings: &JournalSettings) -> Result<()> {
        settings.validate()?;

        let payload = serde_json::to_string(settings)
            .map_err(|err| JournalError::Configuration(format!("failed to serialize settings: {err}")))?;
        let now = format_rfc3339(now_utc())?;

        self.conn
            .execute(
                "INSERT INTO journal_settings(settings_name, settings_json, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(settings_name) DO UPDATE SET
                   settings_json = excluded.settings_json,
                   updated_at = excluded.updated_at",
                params![DEFAULT_SETTINGS_NAME, payload, now],
            )
            .context("failed to save settings")?;

        Ok(())
    }

    /// Creates the user on first sight; later calls only overwrite
    /// username and name with non-empty values.
    pub fn upsert_user(
        &self,
        tg_user_id: i64,
        username: Option<&str>,
        name: Option<&str>,
    ) -> Result<User> {
        if tg_user_id <= 0 {
            return Err(JournalError::Validation(format!(
                "tg_user_id MUST be positive, got {tg_user_id}"
            )));
        }

        self.conn
            .query_row(
                "INSERT INTO users(tg_user_id, username, name) VALUES (?1, ?2, ?3)
                 ON CONFLICT(tg_user_id) DO UPDATE SET
                   username = COALESCE(excluded.username, users.username),
                   name = COALESCE(excluded.name, users.name)
                 RETURNING id, tg_user_id, username, name",
                params![tg_user_id, clean_text(username), clean_text(name)],
                parse_user_row,
            )
            .context("failed to upsert user")
    }

    pub fn get_user(&self, tg_user_id: i64) -> Result<Option<User>> {
        self.conn
            .query_row(
                "SELECT id, tg_user_id, username, name FROM users WHERE tg_user_id = ?1",
                params![tg_user_id],
                parse_user_row,
            )
            .optional()
            .context("failed to load user")
    }

    /// The invite link is authoritative: an existing link keeps its row and
    /// only display metadata is refreshed. No link resolves to the direct
    /// sentinel inviter.
    pub fn find_or_create_inviter(
        &self,
        invite_link: Option<&str>,
        channel_id: Option<&str>,
        name: Option<&str>,
        username: Option<&str>,
    ) -> Result<Inviter> {
        let Some(link) = clean_text(invite_link) else {
            return self.direct_inviter();
        };
        if link == DIRECT_INVITE_LINK {
            return self.direct_inviter();
        }

        self.conn
            .query_row(
                &format!(
                    "INSERT INTO inviters(name, username, invite_link, channel_id)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(invite_link) DO UPDATE SET
                       name = COALESCE(excluded.name, inviters.name),
                       username = COALESCE(excluded.username, inviters.username),
                       channel_id = COALESCE(inviters.channel_id, excluded.channel_id)
                     RETURNING {INVITER_COLUMNS}"
                ),
                params![
                    clean_text(name),
                    normalize_inviter_username(username),
                    link,
                    clean_text(channel_id),
                ],
                parse_inviter_row,
            )
            .context("failed to upsert inviter")
    }

    pub fn direct_inviter(&self) -> Result<Inviter> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO inviters(name, username, invite_link, channel_id)
                 VALUES (?1, NULL, ?2, NULL)",
                params![DIRECT_INVITER_NAME, DIRECT_INVITE_LINK],
            )
            .context("failed to ensure direct inviter")?;

        self.find_inviter_by_link(DIRECT_INVITE_LINK)?.ok_or_else(|| {
            JournalError::Storage("direct inviter missing after insert".to_string())
        })
    }

    pub fn find_inviter_by_link(&self, invite_link: &str) -> Result<Option<Inviter>> {
        self.conn
            .query_row(
                &format!("SELECT {INVITER_COLUMNS} FROM inviters WHERE invite_link = ?1"),
                params![invite_link.trim()],
                parse_inviter_row,
            )
            .optional()
            .context("failed to look up inviter by link")
    }

    pub fn get_inviter(&self, inviter_id: i64) -> Result<Option<Inviter>> {
        self.conn
            .query_row(
                &format!("SELECT {INVITER_COLUMNS} FROM inviters WHERE id = ?1"),
                params![inviter_id],
                parse_inviter_row,
            )
            .optional()
            .context("failed to load inviter")
    }

    pub fn list_inviters(&self) -> Result<Vec<Inviter>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {INVITER_COLUMNS} FROM inviters ORDER BY id ASC"))
            .context("failed to prepare inviter listing")?;
        let rows = stmt
            .query_map([], parse_inviter_row)
            .context("failed to list inviters")?;
        collect_rows(rows, "failed to decode inviter row")
    }

    /// Appends one entry inside an IMMEDIATE transaction.
    ///
    /// A `subscribe` through an inviter the user already has any recorded
    /// subscribe through is noted as `repeat`, regardless of event time.
    /// Stored rows are never re-marked. A colliding
    /// idempotency key leaves the journal untouched and reports the existing
    /// row.
    pub fn append_journal_entry(&mut self, entry: &NewJournalEntry) -> Result<AppendOutcome> {
        entry.validate()?;

        let event_time = normalize_event_time(entry.event_time)?;
        let event_time_raw = format_rfc3339(event_time)?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start journal transaction")?;

        let mut note = clean_text(entry.note.as_deref());
        if let (EventKind::Subscribe, Some(inviter_id)) = (&entry.event_kind, entry.inviter_id) {
            let prior: bool = tx
                .query_row(
                    "SELECT EXISTS(
                        SELECT 1 FROM journal
                        WHERE tg_user_id = ?1
                          AND inviter_id = ?2
                          AND event_type = 'subscribe'
                     )",
                    params![entry.tg_user_id, inviter_id],
                    |row| row.get(0),
                )
                .context("failed to check prior subscriptions")?;
            if prior {
                note = Some(merge_note(note.as_deref(), REPEAT_NOTE));
            }
        }

        let username = clean_text(entry.username.as_deref());
        let name = clean_text(entry.name.as_deref());
        let status = clean_text(entry.status.as_deref());

        let inserted = tx.execute(
            "INSERT INTO journal(
                event_time, event_type, tg_user_id, username, name,
                inviter_id, status, note, telegram_update_id
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                event_time_raw,
                entry.event_kind.as_str(),
                entry.tg_user_id,
                username,
                name,
                entry.inviter_id,
                status,
                note,
                entry.telegram_update_id,
            ],
        );

        match inserted {
            Ok(_) => {
                let id = tx.last_insert_rowid();
                tx.commit().context("failed to commit journal entry")?;
                Ok(AppendOutcome::Inserted(JournalEntry {
                    id,
                    event_time,
                    event_kind: entry.event_kind.clone(),
                    tg_user_id: entry.tg_user_id,
                    username,
                    name,
                    inviter_id: entry.inviter_id,
                    status,
                    note,
                    telegram_update_id: entry.telegram_update_id,
                }))
            }
            Err(err) if is_unique_violation(&err) => {
                let existing_id: i64 = tx
                    .query_row(
                        "SELECT id FROM journal WHERE telegram_update_id = ?1",
                        params![entry.telegram_update_id],
                        |row| row.get(0),
                    )
                    .context("failed to resolve duplicate journal entry")?;
                tx.rollback().context("failed to roll back duplicate entry")?;
                Ok(AppendOutcome::DuplicateIgnored { existing_id })
            }
            Err(err) if is_foreign_key_violation(&err) => {
                tx.rollback().context("failed to roll back orphan entry")?;
                Err(JournalError::ReferentialIntegrity(format!(
                    "inviter {:?} does not exist",
                    entry.inviter_id
                )))
            }
            Err(err) => Err(classify_sqlite_error("failed to append journal entry", &err)),
        }
    }

    pub fn get_journal_entry(&self, journal_id: i64) -> Result<Option<JournalEntry>> {
        self.conn
            .query_row(
                &format!("SELECT {ENTRY_COLUMNS} FROM journal WHERE id = ?1"),
                params![journal_id],
                parse_entry_row,
            )
            .optional()
            .context("failed to load journal entry")
    }

    /// Entries for one user in reporting order.
    pub fn list_entries_for(&self, tg_user_id: i64) -> Result<Vec<JournalEntry>> {
        self.query_entries(
            &format!(
                "SELECT {ENTRY_COLUMNS} FROM journal
                 WHERE tg_user_id = ?1
                 ORDER BY event_time ASC, id ASC"
            ),
            params![tg_user_id],
        )
    }

    /// Entries with `start <= event_time < end`.
    pub fn list_entries_between(
        &self,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Result<Vec<JournalEntry>> {
        self.query_entries(
            &format!(
                "SELECT {ENTRY_COLUMNS} FROM journal
                 WHERE event_time >= ?1 AND event_time < ?2
                 ORDER BY event_time ASC, id ASC"
            ),
            params![format_rfc3339(start)?, format_rfc3339(end)?],
        )
    }

    pub fn list_entries_before(&self, end: OffsetDateTime) -> Result<Vec<JournalEntry>> {
        self.query_entries(
            &format!(
                "SELECT {ENTRY_COLUMNS} FROM journal
                 WHERE event_time < ?1
                 ORDER BY event_time ASC, id ASC"
            ),
            params![format_rfc3339(end)?],
        )
    }

    pub(crate) fn list_user_entries_before(
        &self,
        tg_user_id: i64,
        end: OffsetDateTime,
    ) -> Result<Vec<JournalEntry>> {
        self.query_entries(
            &format!(
                "SELECT {ENTRY_COLUMNS} FROM journal
                 WHERE tg_user_id = ?1 AND event_time < ?2
                 ORDER BY event_time ASC, id ASC"
            ),
            params![tg_user_id, format_rfc3339(end)?],
        )
    }

    pub(crate) fn list_join_entries_between(
        &self,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Result<Vec<JournalEntry>> {
        self.query_entries(
            &format!(
                "SELECT {ENTRY_COLUMNS} FROM journal
                 WHERE event_type IN ({})
                   AND event_time >= ?1 AND event_time < ?2
                 ORDER BY event_time ASC, id ASC",
                join_class_sql()
            ),
            params![format_rfc3339(start)?, format_rfc3339(end)?],
        )
    }

    fn query_entries(&self, sql: &str, args: impl rusqlite::Params) -> Result<Vec<JournalEntry>> {
        let mut stmt = self
            .conn
            .prepare(sql)
            .context("failed to prepare journal query")?;
        let rows = stmt
            .query_map(args, parse_entry_row)
            .context("failed to query journal")?;
        collect_rows(rows, "failed to decode journal row")
    }

    /// Writes a verdict once. The entry must exist and be join-class; a
    /// second write for the same `(journal_id, check_date)` is reported as
    /// [`RecordOutcome::AlreadyExists`].
    pub fn record_retention_check(
        &self,
        journal_id: i64,
        check_date: Date,
        result: RetentionResult,
    ) -> Result<RecordOutcome> {
        let kind: Option<String> = self
            .conn
            .query_row(
                "SELECT event_type FROM journal WHERE id = ?1",
                params![journal_id],
                |row| row.get(0),
            )
            .optional()
            .context("failed to load journal entry for retention check")?;

        let Some(kind) = kind else {
            return Err(JournalError::ReferentialIntegrity(format!(
                "journal entry {journal_id} does not exist"
            )));
        };
        if !EventKind::parse(&kind).is_join_class() {
            return Err(JournalError::Validation(format!(
                "journal entry {journal_id} is {kind}; retention checks only apply to join-class entries"
            )));
        }

        let inserted = self.conn.execute(
            "INSERT INTO retention_checks(journal_id, check_date, result) VALUES (?1, ?2, ?3)",
            params![journal_id, format_date(check_date)?, result.as_str()],
        );

        match inserted {
            Ok(_) => Ok(RecordOutcome::Recorded(RetentionCheck {
                id: self.conn.last_insert_rowid(),
                journal_id,
                check_date,
                result,
            })),
            Err(err) if is_unique_violation(&err) => Ok(RecordOutcome::AlreadyExists),
            Err(err) => Err(classify_sqlite_error("failed to record retention check", &err)),
        }
    }

    pub fn list_checks_for(&self, journal_id: i64) -> Result<Vec<RetentionCheck>> {
        self.query_checks(
            &format!(
                "SELECT {CHECK_COLUMNS} FROM retention_checks
                 WHERE journal_id = ?1
                 ORDER BY check_date ASC, id ASC"
            ),
            params![journal_id],
        )
    }

    pub fn list_checks_on(&self, check_date: Date) -> Result<Vec<RetentionCheck>> {
        self.query_checks(
            &format!(
                "SELECT {CHECK_COLUMNS} FROM retention_checks
                 WHERE check_date = ?1
                 ORDER BY journal_id ASC"
            ),
            params![format_date(check_date)?],
        )
    }

    /// Checks attached to entries with `start <= event_time < end`.
    pub(crate) fn list_checks_for_entries_between(
        &self,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Result<Vec<RetentionCheck>> {
        self.query_checks(
            "SELECT c.id, c.journal_id, c.check_date, c.result
             FROM retention_checks c
             JOIN journal j ON j.id = c.journal_id
             WHERE j.event_time >= ?1 AND j.event_time < ?2
             ORDER BY c.journal_id ASC, c.check_date ASC",
            params![format_rfc3339(start)?, format_rfc3339(end)?],
        )
    }

    fn query_checks(&self, sql: &str, args: impl rusqlite::Params) -> Result<Vec<RetentionCheck>> {
        let mut stmt = self
            .conn
            .prepare(sql)
            .context("failed to prepare retention check query")?;
        let rows = stmt
            .query_map(args, parse_check_row)
            .context("failed to query retention checks")?;
        collect_rows(rows, "failed to decode retention check row")
    }

    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let counts = IntegrityCounts {
            users: self.count("SELECT COUNT(*) FROM users")?,
            inviters: self.count("SELECT COUNT(*) FROM inviters")?,
            journal_entries: self.count("SELECT COUNT(*) FROM journal")?,
            retention_checks: self.count("SELECT COUNT(*) FROM retention_checks")?,
        };
        let mut issues = Vec::new();

        let duplicate_idempotency_keys = duplicate_update_ids(&self.conn, 50)?;
        if !duplicate_idempotency_keys.is_empty() {
            issues.push(IntegrityIssue {
                code: "duplicate_idempotency_keys".to_string(),
                severity: IntegrityIssueSeverity::Error,
                message: format!(
                    "duplicate telegram_update_id values detected: {} keys",
                    duplicate_idempotency_keys.len()
                ),
            });
        }

        let dangling = self.count(
            "SELECT COUNT(*) FROM journal j
             LEFT JOIN inviters i ON i.id = j.inviter_id
             WHERE j.inviter_id IS NOT NULL AND i.id IS NULL",
        )?;
        if dangling > 0 {
            issues.push(IntegrityIssue {
                code: "dangling_inviter_refs".to_string(),
                severity: IntegrityIssueSeverity::Error,
                message: format!("journal entries referencing missing inviters: {dangling}"),
            });
        }

        let orphan_checks = self.count(
            "SELECT COUNT(*) FROM retention_checks c
             LEFT JOIN journal j ON j.id = c.journal_id
             WHERE j.id IS NULL",
        )?;
        if orphan_checks > 0 {
            issues.push(IntegrityIssue {
                code: "orphan_retention_checks".to_string(),
                severity: IntegrityIssueSeverity::Error,
                message: format!("retention checks without a journal entry: {orphan_checks}"),
            });
        }

        let misplaced = self.count(&format!(
            "SELECT COUNT(*) FROM retention_checks c
             JOIN journal j ON j.id = c.journal_id
             WHERE j.event_type NOT IN ({})",
            join_class_sql()
        ))?;
        if misplaced > 0 {
            issues.push(IntegrityIssue {
                code: "checks_on_non_join_entries".to_string(),
                severity: IntegrityIssueSeverity::Error,
                message: format!("retention checks attached to non join-class entries: {misplaced}"),
            });
        }

        let pending = self.count(
            "SELECT COUNT(*) FROM retention_checks c
             WHERE c.result = 'pending'
               AND c.check_date = (
                 SELECT MAX(latest.check_date) FROM retention_checks latest
                 WHERE latest.journal_id = c.journal_id
               )",
        )?;
        if pending > 0 {
            issues.push(IntegrityIssue {
                code: "pending_backlog".to_string(),
                severity: IntegrityIssueSeverity::Warning,
                message: format!("entries whose latest verdict is pending: {pending}"),
            });
        }

        let healthy = !issues
            .iter()
            .any(|item| item.severity == IntegrityIssueSeverity::Error);

        Ok(IntegrityReport {
            contract_version: "integrity_check.v1".to_string(),
            healthy,
            counts,
            issues,
            duplicate_idempotency_keys,
        })
    }

    fn count(&self, sql: &str) -> Result<u64> {
        let value: i64 = self
            .conn
            .query_row(sql, [], |row| row.get(0))
            .context("failed to count rows")?;
        Ok(u64::try_from(value).unwrap_or(0))
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn invalid_column(index: usize, kind: rusqlite::types::Type, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        kind,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn parse_entry_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<JournalEntry> {
    let event_time_raw: String = row.get(1)?;
    let event_type_raw: String = row.get(2)?;

    let event_time = parse_rfc3339(&event_time_raw).map_err(|err| {
        invalid_column(
            1,
            rusqlite::types::Type::Text,
            format!("invalid event_time {event_time_raw:?}: {err}"),
        )
    })?;

    Ok(JournalEntry {
        id: row.get(0)?,
        event_time,
        event_kind: EventKind::parse(&event_type_raw),
        tg_user_id: row.get(3)?,
        username: row.get(4)?,
        name: row.get(5)?,
        inviter_id: row.get(6)?,
        status: row.get(7)?,
        note: row.get(8)?,
        telegram_update_id: row.get(9)?,
    })
}

fn parse_check_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RetentionCheck> {
    let check_date_raw: String = row.get(2)?;
    let result_raw: String = row.get(3)?;

    let check_date = parse_date(&check_date_raw).map_err(|err| {
        invalid_column(2, rusqlite::types::Type::Text, err.to_string())
    })?;
    let result = RetentionResult::parse(&result_raw).ok_or_else(|| {
        invalid_column(
            3,
            rusqlite::types::Type::Text,
            format!("invalid retention result: {result_raw}"),
        )
    })?;

    Ok(RetentionCheck {
        id: row.get(0)?,
        journal_id: row.get(1)?,
        check_date,
        result,
    })
}

fn parse_user_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        tg_user_id: row.get(1)?,
        username: row.get(2)?,
        name: row.get(3)?,
    })
}

fn parse_inviter_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Inviter> {
    Ok(Inviter {
        id: row.get(0)?,
        name: row.get(1)?,
        username: row.get(2)?,
        invite_link: row.get(3)?,
        channel_id: row.get(4)?,
    })
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
    what: &str,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row.context(what)?);
    }
    Ok(values)
}

fn table_columns(conn: &Connection, table_name: &str) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table_name})"))
        .context(&format!("failed to inspect table_info for {table_name}"))?;
    let rows = stmt
        .query_map([], |row| row.get::<_, String>(1))
        .context(&format!("failed to read table_info for {table_name}"))?;
    collect_rows(rows, "failed to decode table_info row")
}

/// Adds a nullable column that older databases were created without.
fn ensure_column(conn: &Connection, table_name: &str, column: &str, sql_type: &str) -> Result<()> {
    if table_columns(conn, table_name)?
        .iter()
        .any(|candidate| candidate == column)
    {
        return Ok(());
    }

    conn.execute_batch(&format!("ALTER TABLE {table_name} ADD COLUMN {column} {sql_type};"))
        .context(&format!("failed to add {table_name}.{column}"))
}

fn index_exists(conn: &Connection, index_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT 1
             FROM sqlite_master
             WHERE type = 'index' AND name = ?1
             LIMIT 1",
            params![index_name],
            |_| Ok(()),
        )
        .optional()
        .context("failed to query sqlite_master")?
        .is_some();

    Ok(exists)
}

fn duplicate_update_ids(conn: &Connection, limit: usize) -> Result<Vec<i64>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT telegram_update_id
             FROM journal
             WHERE telegram_update_id IS NOT NULL
             GROUP BY telegram_update_id
             HAVING COUNT(*) > 1
             ORDER BY telegram_update_id ASC
             LIMIT {limit}"
        ))
        .context("failed to prepare duplicate key query")?;
    let rows = stmt
        .query_map([], |row| row.get::<_, i64>(0))
        .context("failed to query duplicate keys")?;
    collect_rows(rows, "failed to decode duplicate key row")
}
