//! Embeddable command surface for the subscriber journal.
//!
//! Transport, reporting and scheduler hosts drive the journal through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_journal_with_db`] for direct [`JournalCommand`] execution against a DB path.
//! - [`run_journal`] for execution against an existing [`SqliteJournalStore`].
//!
//! Every command prints JSON on stdout unless it offers a table view and
//! `--json` is not set. Logs go to stderr.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::Value;
use subscriber_journal_core::{
    classify_bot_membership_change, classify_membership_change, month_of, now_utc, parse_date,
    parse_rfc3339, today, week_of, ChatKind, DailyAggregateRow, DateRange, EventKind, Inviter, InviterLeaderboardRow,
    JournalExportRow, JournalSettings, MemberStatus, MembershipEvent, PeriodSummary,
    RetentionSummary, UserSummary,
};
use subscriber_journal_store_sqlite::{IntegrityIssueSeverity, IntegrityReport, SqliteJournalStore};
use tracing::{debug, info, warn};

#[derive(Debug, Parser)]
#[command(name = "sj")]
#[command(about = "Subscriber journal and retention analytics CLI")]
pub struct Cli {
    #[arg(
        long,
        env = "SUBSCRIBER_JOURNAL_DB",
        default_value = "./subscriber_journal.sqlite3"
    )]
    db: PathBuf,

    /// Log filter used when `RUST_LOG` is not set.
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    #[must_use]
    pub fn log_level(&self) -> &str {
        &self.log_level
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Journal {
        #[command(subcommand)]
        command: Box<JournalCommand>,
    },
}

#[derive(Debug, Subcommand)]
pub enum JournalCommand {
    /// Ingest membership events from a JSON file or from flags.
    Ingest(IngestArgs),
    /// Run one retention evaluation pass.
    Evaluate(EvaluateArgs),
    Report {
        #[command(subcommand)]
        command: Box<ReportCommand>,
    },
    /// List a user's journal entries in event-time order.
    Entries(EntriesArgs),
    Inviter {
        #[command(subcommand)]
        command: Box<InviterCommand>,
    },
    Settings {
        #[command(subcommand)]
        command: Box<SettingsCommand>,
    },
    /// Report integrity issues; exits non-zero when an error is found.
    Check(JsonArgs),
    /// Map a chat member status transition to an event kind.
    Classify(ClassifyArgs),
}

#[derive(Debug, Args)]
pub struct IngestArgs {
    /// JSON file holding one event object or an array of events.
    #[arg(long, conflicts_with_all = ["event_kind", "tg_user_id"])]
    file: Option<PathBuf>,
    #[arg(long, required_unless_present = "file")]
    event_kind: Option<String>,
    #[arg(long, required_unless_present = "file")]
    tg_user_id: Option<i64>,
    /// RFC3339 timestamp; defaults to now.
    #[arg(long)]
    event_time: Option<String>,
    #[arg(long)]
    username: Option<String>,
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    status: Option<String>,
    #[arg(long)]
    note: Option<String>,
    #[arg(long)]
    update_id: Option<i64>,
    #[arg(long)]
    invite_link: Option<String>,
    #[arg(long)]
    channel_id: Option<String>,
}

#[derive(Debug, Args)]
pub struct EvaluateArgs {
    /// Local date to evaluate (YYYY-MM-DD); defaults to today.
    #[arg(long)]
    as_of: Option<String>,
    /// Override the stored retention window for this pass.
    #[arg(long)]
    retention_days: Option<u16>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
pub enum ReportCommand {
    Daily(RangeArgs),
    Leaderboard(RangeArgs),
    Retention(RangeArgs),
    Period(PeriodArgs),
    Users(UsersArgs),
    Export(RangeArgs),
}

#[derive(Debug, Args)]
pub struct RangeArgs {
    #[arg(long)]
    from: String,
    /// Inclusive end date; defaults to `--from`.
    #[arg(long)]
    to: Option<String>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct PeriodArgs {
    #[arg(long, value_enum, default_value_t = PeriodKindArg::Week)]
    kind: PeriodKindArg,
    /// Any date inside the period; defaults to today.
    #[arg(long)]
    date: Option<String>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum PeriodKindArg {
    Week,
    Month,
}

#[derive(Debug, Args)]
pub struct UsersArgs {
    #[arg(long)]
    as_of: Option<String>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct EntriesArgs {
    #[arg(long)]
    tg_user_id: i64,
}

#[derive(Debug, Subcommand)]
pub enum InviterCommand {
    Add(InviterAddArgs),
    List(JsonArgs),
}

#[derive(Debug, Args)]
pub struct InviterAddArgs {
    #[arg(long)]
    invite_link: String,
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    username: Option<String>,
    #[arg(long)]
    channel_id: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum SettingsCommand {
    Show,
    Set(SettingsSetArgs),
}

#[derive(Debug, Args)]
pub struct SettingsSetArgs {
    #[arg(long)]
    retention_days: Option<u16>,
    #[arg(long)]
    utc_offset: Option<String>,
    #[arg(long)]
    auto_register_invite_links: Option<bool>,
}

#[derive(Debug, Args)]
pub struct JsonArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct ClassifyArgs {
    /// Classify a transition of the bot itself; `--chat` is then ignored.
    #[arg(long)]
    bot: bool,
    #[arg(long, value_enum, default_value_t = ChatKindArg::Channel)]
    chat: ChatKindArg,
    #[arg(long, value_enum)]
    old: MemberStatusArg,
    #[arg(long, value_enum)]
    new: MemberStatusArg,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ChatKindArg {
    Channel,
    Group,
    Supergroup,
    Private,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum MemberStatusArg {
    Creator,
    Administrator,
    Member,
    Restricted,
    Left,
    Banned,
}

/// Installs the stderr `tracing` subscriber. `RUST_LOG` wins over `level`;
/// repeated calls are no-ops.
pub fn init_logging(level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .compact()
        .try_init();
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when store open, migration, or command execution fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Journal { command } => run_journal_with_db(&cli.db, *command),
    }
}

/// Executes a parsed journal command using the provided `SQLite` DB path.
///
/// # Errors
/// Returns an error when store open/migrate fails or the requested command fails.
pub fn run_journal_with_db(db_path: &Path, command: JournalCommand) -> Result<()> {
    if let JournalCommand::Classify(args) = command {
        return run_classify(&args);
    }

    let mut store = SqliteJournalStore::open(db_path)?;
    store.migrate()?;
    debug!(db = %db_path.display(), "journal store opened");
    run_journal(command, &mut store)
}

/// Executes a parsed journal command against an existing store handle.
///
/// # Errors
/// Returns an error when argument parsing, validation, persistence, or
/// reporting fails, and when `check` finds error-severity issues.
pub fn run_journal(command: JournalCommand, store: &mut SqliteJournalStore) -> Result<()> {
    match command {
        JournalCommand::Ingest(args) => run_ingest(args, store),
        JournalCommand::Evaluate(args) => {
            let settings =
                settings_with_overrides(&store.load_settings()?, args.retention_days, None)?;
            let as_of = match args.as_of.as_deref() {
                Some(raw) => parse_cli_date("--as-of", raw)?,
                None => today(settings.offset()?),
            };

            info!(%as_of, retention_days = settings.retention_days, "running retention pass");
            let report = store.evaluate_retention(as_of, &settings)?;
            if args.json {
                print_json(&report)?;
            } else {
                println!(
                    "check_date={} retention_days={} candidates={} recorded={} already_existed={}",
                    report.check_date,
                    report.retention_days,
                    report.candidates,
                    report.recorded,
                    report.already_existed
                );
                println!(
                    "retained={} not_retained={} pending={}",
                    report.retained, report.not_retained, report.pending
                );
            }
            Ok(())
        }
        JournalCommand::Report { command } => run_report(*command, store),
        JournalCommand::Entries(args) => {
            let entries = store.list_entries_for(args.tg_user_id)?;
            print_json(&entries)
        }
        JournalCommand::Inviter { command } => run_inviter(*command, store),
        JournalCommand::Settings { command } => run_settings(*command, store),
        JournalCommand::Check(args) => {
            let report = store.integrity_check()?;
            if args.json {
                print_json(&report)?;
            } else {
                print_integrity_report(&report);
            }

            if !report.healthy {
                warn!(issues = report.issues.len(), "journal integrity check failed");
                return Err(anyhow!(
                    "journal integrity check failed: {}",
                    report
                        .issues
                        .iter()
                        .filter(|item| item.severity == IntegrityIssueSeverity::Error)
                        .map(|item| format!("{}:{}", item.code, item.message))
                        .collect::<Vec<_>>()
                        .join("; ")
                ));
            }
            Ok(())
        }
        JournalCommand::Classify(args) => run_classify(&args),
    }
}

fn run_ingest(args: IngestArgs, store: &mut SqliteJournalStore) -> Result<()> {
    let settings = store.load_settings()?;

    if let Some(path) = args.file {
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed reading events file {}", path.display()))?;
        let events = parse_events_payload(&raw)?;
        info!(file = %path.display(), events = events.len(), "ingesting events file");
        let report = store.ingest_batch(&events, &settings)?;
        return print_json(&report);
    }

    let event = MembershipEvent {
        event_time: Some(match args.event_time.as_deref() {
            Some(raw) => parse_rfc3339(raw).with_context(|| format!("invalid --event-time: {raw}"))?,
            None => now_utc(),
        }),
        event_kind: EventKind::parse(args.event_kind.as_deref().unwrap_or_default()),
        tg_user_id: args.tg_user_id,
        username: args.username,
        name: args.name,
        status: args.status,
        note: args.note,
        idempotency_key: args.update_id,
        invite_link_hint: args.invite_link,
        channel_id: args.channel_id,
    };

    let outcome = store.ingest_event(&event, &settings)?;
    print_json(&outcome)
}

fn run_report(command: ReportCommand, store: &SqliteJournalStore) -> Result<()> {
    let settings = store.load_settings()?;

    match command {
        ReportCommand::Daily(args) => {
            let rows = store.daily_aggregate(parse_range(&args)?, &settings)?;
            if args.json {
                print_json(&rows)
            } else {
                print_daily_table(&rows);
                Ok(())
            }
        }
        ReportCommand::Leaderboard(args) => {
            let rows = store.inviter_leaderboard(parse_range(&args)?, &settings)?;
            if args.json {
                print_json(&rows)
            } else {
                print_leaderboard_table(&rows);
                Ok(())
            }
        }
        ReportCommand::Retention(args) => {
            let summary = store.retention_summary(parse_range(&args)?, &settings)?;
            if args.json {
                print_json(&summary)
            } else {
                print_retention_summary(&summary);
                Ok(())
            }
        }
        ReportCommand::Period(args) => {
            let anchor = match args.date.as_deref() {
                Some(raw) => parse_cli_date("--date", raw)?,
                None => today(settings.offset()?),
            };
            let range = match args.kind {
                PeriodKindArg::Week => week_of(anchor)?,
                PeriodKindArg::Month => month_of(anchor)?,
            };
            let summary = store.period_summary(range, &settings)?;
            if args.json {
                print_json(&summary)
            } else {
                print_period_summary(&summary);
                Ok(())
            }
        }
        ReportCommand::Users(args) => {
            let as_of = match args.as_of.as_deref() {
                Some(raw) => parse_cli_date("--as-of", raw)?,
                None => today(settings.offset()?),
            };
            let rows = store.user_summaries(as_of, &settings)?;
            if args.json {
                print_json(&rows)
            } else {
                print_users_table(&rows);
                Ok(())
            }
        }
        ReportCommand::Export(args) => {
            let rows = store.journal_export(parse_range(&args)?, &settings)?;
            if args.json {
                print_json(&rows)
            } else {
                print_export_table(&rows);
                Ok(())
            }
        }
    }
}

fn run_inviter(command: InviterCommand, store: &SqliteJournalStore) -> Result<()> {
    match command {
        InviterCommand::Add(args) => {
            let inviter = store.find_or_create_inviter(
                Some(&args.invite_link),
                args.channel_id.as_deref(),
                args.name.as_deref(),
                args.username.as_deref(),
            )?;
            print_json(&inviter)
        }
        InviterCommand::List(args) => {
            let inviters = store.list_inviters()?;
            if args.json {
                print_json(&inviters)
            } else {
                print_inviters_table(&inviters);
                Ok(())
            }
        }
    }
}

fn run_settings(command: SettingsCommand, store: &SqliteJournalStore) -> Result<()> {
    match command {
        SettingsCommand::Show => print_json(&store.load_settings()?),
        SettingsCommand::Set(args) => {
            let mut settings = store.load_settings()?;
            if let Some(days) = args.retention_days {
                settings.retention_days = days;
            }
            if let Some(offset) = args.utc_offset {
                settings.utc_offset = offset;
            }
            if let Some(flag) = args.auto_register_invite_links {
                settings.auto_register_invite_links = flag;
            }
            store.save_settings(&settings)?;
            print_json(&settings)
        }
    }
}

fn run_classify(args: &ClassifyArgs) -> Result<()> {
    let old = map_member_status(args.old);
    let new = map_member_status(args.new);
    let kind = if args.bot {
        classify_bot_membership_change(old, new)
    } else {
        classify_membership_change(map_chat_kind(args.chat), old, new)
    };
    print_json(&serde_json::json!({
        "contract_version": "classification.v1",
        "event_kind": kind,
    }))
}

fn map_chat_kind(value: ChatKindArg) -> ChatKind {
    match value {
        ChatKindArg::Channel => ChatKind::Channel,
        ChatKindArg::Group => ChatKind::Group,
        ChatKindArg::Supergroup => ChatKind::Supergroup,
        ChatKindArg::Private => ChatKind::Private,
    }
}

fn map_member_status(value: MemberStatusArg) -> MemberStatus {
    match value {
        MemberStatusArg::Creator => MemberStatus::Creator,
        MemberStatusArg::Administrator => MemberStatus::Administrator,
        MemberStatusArg::Member => MemberStatus::Member,
        MemberStatusArg::Restricted => MemberStatus::Restricted,
        MemberStatusArg::Left => MemberStatus::Left,
        MemberStatusArg::Banned => MemberStatus::Banned,
    }
}

fn parse_events_payload(raw: &str) -> Result<Vec<MembershipEvent>> {
    let value: Value = serde_json::from_str(raw).context("events file must be valid JSON")?;
    match value {
        Value::Array(items) => items
            .into_iter()
            .enumerate()
            .map(|(index, item)| {
                serde_json::from_value(item)
                    .with_context(|| format!("event #{index} does not match the event shape"))
            })
            .collect(),
        other => Ok(vec![serde_json::from_value(other)
            .context("event does not match the event shape")?]),
    }
}

fn parse_cli_date(flag: &str, raw: &str) -> Result<time::Date> {
    parse_date(raw).with_context(|| format!("invalid {flag} value: {raw}"))
}

fn parse_range(args: &RangeArgs) -> Result<DateRange> {
    let start = parse_cli_date("--from", &args.from)?;
    let end = match args.to.as_deref() {
        Some(raw) => parse_cli_date("--to", raw)?,
        None => start,
    };
    Ok(DateRange::new(start, end)?)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn opt(value: Option<&str>) -> &str {
    value.unwrap_or("-")
}

fn print_daily_table(rows: &[DailyAggregateRow]) {
    println!(
        "{:<12} {:>10} {:>12} {:>6} {:>8} {:>8} {:>12}",
        "date", "subscribes", "unsubscribes", "net", "unique", "repeat", "total_active"
    );
    println!("{}", "-".repeat(76));
    for row in rows {
        println!(
            "{:<12} {:>10} {:>12} {:>6} {:>8} {:>8} {:>12}",
            row.date.to_string(),
            row.subscribes,
            row.unsubscribes,
            row.net_change,
            row.unique_subscribers,
            row.repeat_subscribes,
            row.total_active
        );
    }
}

fn print_leaderboard_table(rows: &[InviterLeaderboardRow]) {
    println!(
        "{:<6} {:<28} {:>8} {:>7} {:>7} {:>7} {:>8}",
        "id", "inviter", "invited", "unique", "repeat", "active", "active%"
    );
    println!("{}", "-".repeat(80));
    for row in rows {
        println!(
            "{:<6} {:<28} {:>8} {:>7} {:>7} {:>7} {:>8.1}",
            row.inviter_id
                .map_or_else(|| "-".to_string(), |value| value.to_string()),
            row.inviter_name,
            row.invited,
            row.unique_users,
            row.repeat_subscribes,
            row.active_at_end,
            row.active_percent
        );
    }
}

fn print_retention_summary(summary: &RetentionSummary) {
    println!(
        "range={}..{} cohort={} retained={} not_retained={} pending={} unchecked={}",
        summary.range.start,
        summary.range.end,
        summary.cohort,
        summary.retained,
        summary.not_retained,
        summary.pending,
        summary.unchecked
    );
    println!(
        "retention_rate={}",
        summary
            .retention_rate
            .map_or_else(|| "n/a".to_string(), |rate| format!("{:.1}%", rate * 100.0))
    );
}

fn print_period_summary(summary: &PeriodSummary) {
    println!(
        "range={}..{} subscribes={} unsubscribes={} net_growth={} unique_subscribers={} repeat={} total_active={}",
        summary.range.start,
        summary.range.end,
        summary.subscribes,
        summary.unsubscribes,
        summary.net_growth,
        summary.unique_subscribers,
        summary.repeat_subscribes,
        summary.total_active_at_end
    );
}

fn print_users_table(rows: &[UserSummary]) {
    println!(
        "{:<14} {:<20} {:>10} {:>12} {:<7} last_activity",
        "tg_user_id", "username", "subscribes", "unsubscribes", "active"
    );
    println!("{}", "-".repeat(90));
    for row in rows {
        println!(
            "{:<14} {:<20} {:>10} {:>12} {:<7} {}",
            row.tg_user_id,
            opt(row.username.as_deref()),
            row.subscribes,
            row.unsubscribes,
            if row.active { "yes" } else { "no" },
            row.last_activity
        );
    }
}

fn print_export_table(rows: &[JournalExportRow]) {
    println!(
        "{:<8} {:<26} {:<16} {:<14} {:<20} {:<24} note",
        "id", "event_time", "event_kind", "tg_user_id", "username", "inviter"
    );
    println!("{}", "-".repeat(120));
    for row in rows {
        println!(
            "{:<8} {:<26} {:<16} {:<14} {:<20} {:<24} {}",
            row.id,
            row.event_time.to_string(),
            row.event_kind.as_str(),
            row.tg_user_id,
            opt(row.username.as_deref()),
            row.inviter_name,
            opt(row.note.as_deref())
        );
    }
}

fn print_inviters_table(inviters: &[Inviter]) {
    println!(
        "{:<6} {:<24} {:<20} {:<40} channel_id",
        "id", "name", "username", "invite_link"
    );
    println!("{}", "-".repeat(110));
    for inviter in inviters {
        println!(
            "{:<6} {:<24} {:<20} {:<40} {}",
            inviter.id,
            opt(inviter.name.as_deref()),
            opt(inviter.username.as_deref()),
            opt(inviter.invite_link.as_deref()),
            opt(inviter.channel_id.as_deref())
        );
    }
}

fn print_integrity_report(report: &IntegrityReport) {
    println!(
        "contract={} healthy={} users={} inviters={} journal_entries={} retention_checks={}",
        report.contract_version,
        if report.healthy { "yes" } else { "no" },
        report.counts.users,
        report.counts.inviters,
        report.counts.journal_entries,
        report.counts.retention_checks
    );
    if !report.issues.is_empty() {
        let formatted = report
            .issues
            .iter()
            .map(|item| {
                let severity = match item.severity {
                    IntegrityIssueSeverity::Warning => "warning",
                    IntegrityIssueSeverity::Error => "error",
                };
                format!("{severity}:{}:{}", item.code, item.message)
            })
            .collect::<Vec<_>>()
            .join(" | ");
        println!("issues={formatted}");
    }
}

/// Applies per-run overrides on top of stored settings without persisting them.
///
/// # Errors
/// Returns an error when the resulting settings are invalid.
pub fn settings_with_overrides(
    base: &JournalSettings,
    retention_days: Option<u16>,
    utc_offset: Option<&str>,
) -> Result<JournalSettings> {
    let mut settings = base.clone();
    if let Some(days) = retention_days {
        settings.retention_days = days;
    }
    if let Some(offset) = utc_offset {
        settings.utc_offset = offset.to_string();
    }
    settings.validate()?;
    Ok(settings)
}
