#![allow(clippy::single_match_else, clippy::uninlined_format_args)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use rusqlite::Connection;
use serde_json::Value;
use ulid::Ulid;

fn sj_binary_path() -> PathBuf {
    match std::env::var("CARGO_BIN_EXE_sj") {
        Ok(value) => PathBuf::from(value),
        Err(_) => {
            let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../target/debug/sj");
            if !path.exists() {
                let status = Command::new("cargo")
                    .args(["build", "-p", "subscriber-journal-cli", "--bin", "sj"])
                    .status();
                match status {
                    Ok(value) if value.success() => {}
                    Ok(value) => panic!("failed to build sj binary (status={value})"),
                    Err(err) => panic!("failed to invoke cargo build: {err}"),
                }
            }
            path
        }
    }
}

fn sj_output(db_path: &Path, args: &[&str]) -> Output {
    let mut command = Command::new(sj_binary_path());
    command.arg("--db").arg(db_path);
    for arg in args {
        command.arg(arg);
    }

    match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to run sj command {:?}: {err}", args),
    }
}

fn stdout_json(output: &Output) -> Value {
    match serde_json::from_slice::<Value>(&output.stdout) {
        Ok(value) => value,
        Err(err) => panic!(
            "failed to parse stdout as JSON: {err}\nstdout={}\nstderr={}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ),
    }
}

fn temp_db(prefix: &str) -> PathBuf {
    std::env::temp_dir().join(format!("{prefix}-{}.sqlite3", Ulid::new()))
}

#[test]
fn journal_help_contract_lists_expected_subcommands() {
    let output = match Command::new(sj_binary_path())
        .args(["journal", "--help"])
        .output()
    {
        Ok(value) => value,
        Err(err) => panic!("failed to run help command: {err}"),
    };

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for required in [
        "ingest", "evaluate", "report", "entries", "inviter", "settings", "check", "classify",
    ] {
        assert!(
            stdout.contains(required),
            "expected help output to contain subcommand {required}; output={stdout}"
        );
    }
}

#[test]
fn batch_ingest_reports_recorded_duplicate_and_rejected_counts() {
    let db_path = temp_db("journal-contract-batch");
    let events_path =
        std::env::temp_dir().join(format!("journal-contract-events-{}.json", Ulid::new()));
    let events = serde_json::json!([
        {"event_time": "2026-03-01T10:00:00Z", "event_kind": "subscribe", "tg_user_id": 1, "idempotency_key": 11},
        {"event_time": "2026-03-01T10:00:00Z", "event_kind": "subscribe", "tg_user_id": 1, "idempotency_key": 11},
        {"event_kind": "subscribe", "tg_user_id": 2, "idempotency_key": 12},
        {"event_time": "2026-03-01T12:00:00Z", "event_kind": "join_request", "tg_user_id": 3}
    ]);
    if let Err(err) = std::fs::write(&events_path, events.to_string()) {
        panic!("failed to write events file: {err}");
    }

    let output = sj_output(
        &db_path,
        &[
            "journal",
            "ingest",
            "--file",
            events_path.to_str().unwrap_or(""),
        ],
    );
    assert!(
        output.status.success(),
        "ingest failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let payload = stdout_json(&output);
    assert_eq!(payload["recorded"], Value::Number(2_u64.into()));
    assert_eq!(payload["duplicates"], Value::Number(1_u64.into()));
    assert_eq!(payload["rejected"], Value::Number(1_u64.into()));
    assert_eq!(payload["errors"][0]["index"], Value::Number(2_u64.into()));

    let _ = std::fs::remove_file(&db_path);
    let _ = std::fs::remove_file(&events_path);
}

#[test]
fn evaluate_json_contract_is_stable_across_reruns() {
    let db_path = temp_db("journal-contract-evaluate");

    let ingest = sj_output(
        &db_path,
        &[
            "journal",
            "ingest",
            "--event-kind",
            "subscribe",
            "--tg-user-id",
            "42",
            "--event-time",
            "2026-03-01T10:00:00Z",
            "--update-id",
            "1",
        ],
    );
    assert!(ingest.status.success());
    assert_eq!(stdout_json(&ingest)["outcome"], Value::String("recorded".to_string()));

    let first = sj_output(
        &db_path,
        &["journal", "evaluate", "--as-of", "2026-03-15", "--json"],
    );
    assert!(first.status.success());
    let payload = stdout_json(&first);
    assert_eq!(payload["check_date"], Value::String("2026-03-15".to_string()));
    assert_eq!(payload["recorded"], Value::Number(1_u64.into()));
    assert_eq!(payload["retained"], Value::Number(1_u64.into()));

    let second = sj_output(
        &db_path,
        &["journal", "evaluate", "--as-of", "2026-03-15", "--json"],
    );
    assert!(second.status.success());
    let payload = stdout_json(&second);
    assert_eq!(payload["recorded"], Value::Number(0_u64.into()));
    assert_eq!(payload["candidates"], Value::Number(0_u64.into()));

    let _ = std::fs::remove_file(&db_path);
}

#[test]
fn error_shape_for_invalid_report_date_is_stable() {
    let db_path = temp_db("journal-contract-bad-date");
    let output = sj_output(
        &db_path,
        &["journal", "report", "daily", "--from", "2026-13-01"],
    );
    assert!(!output.status.success());

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("invalid --from value"),
        "expected stable error shape, got stderr={stderr}"
    );

    let _ = std::fs::remove_file(&db_path);
}

#[test]
fn check_exits_non_zero_on_dangling_inviter_reference() {
    let db_path = temp_db("journal-contract-check");
    let healthy = sj_output(&db_path, &["journal", "check", "--json"]);
    assert!(healthy.status.success());
    assert_eq!(
        stdout_json(&healthy)["contract_version"],
        Value::String("integrity_check.v1".to_string())
    );

    let conn = match Connection::open(&db_path) {
        Ok(value) => value,
        Err(err) => panic!("failed to open setup db: {err}"),
    };
    if let Err(err) = conn.execute_batch(
        "PRAGMA foreign_keys = OFF;
         INSERT INTO journal(event_time, event_type, tg_user_id, inviter_id)
         VALUES ('2026-03-01T10:00:00Z', 'subscribe', 5, 404);",
    ) {
        panic!("failed to seed dangling row: {err}");
    }
    drop(conn);

    let output = sj_output(&db_path, &["journal", "check"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("journal integrity check failed: dangling_inviter_refs"),
        "expected stable violation error shape, got stderr={stderr}"
    );

    let _ = std::fs::remove_file(&db_path);
}

#[test]
fn classify_contract_maps_status_transitions() {
    let db_path = temp_db("journal-contract-classify");
    let cases = [
        ("channel", "left", "member", Some("subscribe")),
        ("channel", "member", "banned", Some("channel_banned")),
        ("supergroup", "left", "member", Some("group_join")),
        ("group", "member", "left", Some("group_leave")),
        ("private", "member", "banned", Some("private_blocked")),
        ("channel", "member", "administrator", None),
    ];

    for (chat, old, new, expected) in cases {
        let output = sj_output(
            &db_path,
            &["journal", "classify", "--chat", chat, "--old", old, "--new", new],
        );
        assert!(output.status.success());
        let payload = stdout_json(&output);
        assert_eq!(
            payload["contract_version"],
            Value::String("classification.v1".to_string())
        );
        let expected = expected.map_or(Value::Null, |kind| Value::String(kind.to_string()));
        assert_eq!(
            payload["event_kind"], expected,
            "unexpected classification for {chat} {old}->{new}"
        );
    }

    let _ = std::fs::remove_file(&db_path);
}

#[test]
fn classify_contract_maps_bot_transitions() {
    let db_path = temp_db("journal-contract-classify-bot");
    let cases = [
        ("left", "administrator", Some("bot_added")),
        ("member", "left", Some("bot_removed")),
        ("administrator", "banned", Some("bot_banned")),
        ("banned", "member", Some("bot_unbanned")),
        ("member", "administrator", Some("bot_promoted")),
        ("administrator", "member", Some("bot_demoted")),
        ("member", "restricted", None),
    ];

    for (old, new, expected) in cases {
        let output = sj_output(
            &db_path,
            &["journal", "classify", "--bot", "--old", old, "--new", new],
        );
        assert!(output.status.success());
        let expected = expected.map_or(Value::Null, |kind| Value::String(kind.to_string()));
        assert_eq!(
            stdout_json(&output)["event_kind"], expected,
            "unexpected bot classification for {old}->{new}"
        );
    }

    assert!(!db_path.exists());
}
