#![allow(clippy::single_match_else, clippy::uninlined_format_args)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

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
        Err(err) => panic!("failed to execute sj command {:?}: {err}", args),
    }
}

fn parse_json(output: &Output) -> Value {
    match serde_json::from_slice::<Value>(&output.stdout) {
        Ok(value) => value,
        Err(err) => panic!(
            "failed to parse stdout json: {err}\nstdout={}\nstderr={}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ),
    }
}

fn pretty(value: &Value) -> String {
    match serde_json::to_string_pretty(value) {
        Ok(text) => text,
        Err(err) => panic!("failed to serialize snapshot payload: {err}"),
    }
}

fn ingest(db_path: &Path, kind: &str, user: &str, at: &str, update: &str) {
    let output = sj_output(
        db_path,
        &[
            "journal",
            "ingest",
            "--event-kind",
            kind,
            "--tg-user-id",
            user,
            "--event-time",
            at,
            "--update-id",
            update,
        ],
    );
    assert!(
        output.status.success(),
        "ingest failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}

#[test]
fn snapshot_default_settings_json_v1() {
    let db_path =
        std::env::temp_dir().join(format!("journal-snapshot-settings-{}.sqlite3", Ulid::new()));

    let output = sj_output(&db_path, &["journal", "settings", "show"]);
    assert!(output.status.success());

    let expected = r#"{
  "settings_version": 1,
  "retention_days": 7,
  "utc_offset": "+05:00",
  "auto_register_invite_links": false
}"#;
    assert_eq!(pretty(&parse_json(&output)), expected);
    let _ = std::fs::remove_file(&db_path);
}

#[test]
fn snapshot_integrity_check_json_v1() {
    let db_path =
        std::env::temp_dir().join(format!("journal-snapshot-check-{}.sqlite3", Ulid::new()));

    let output = sj_output(&db_path, &["journal", "check", "--json"]);
    assert!(output.status.success());

    let expected = r#"{
  "contract_version": "integrity_check.v1",
  "healthy": true,
  "counts": {
    "users": 0,
    "inviters": 1,
    "journal_entries": 0,
    "retention_checks": 0
  },
  "issues": [],
  "duplicate_idempotency_keys": []
}"#;
    assert_eq!(pretty(&parse_json(&output)), expected);
    let _ = std::fs::remove_file(&db_path);
}

#[test]
fn snapshot_daily_report_json_v1() {
    let db_path =
        std::env::temp_dir().join(format!("journal-snapshot-daily-{}.sqlite3", Ulid::new()));

    let settings = sj_output(
        &db_path,
        &["journal", "settings", "set", "--utc-offset", "+00:00"],
    );
    assert!(settings.status.success());

    ingest(&db_path, "subscribe", "1", "2026-03-01T10:00:00Z", "1");
    ingest(&db_path, "unsubscribe", "2", "2026-03-02T10:00:00Z", "2");
    ingest(&db_path, "subscribe", "3", "2026-03-03T10:00:00Z", "3");

    let output = sj_output(
        &db_path,
        &[
            "journal",
            "report",
            "daily",
            "--from",
            "2026-03-01",
            "--to",
            "2026-03-03",
            "--json",
        ],
    );
    assert!(output.status.success());

    let expected = r#"[
  {
    "date": "2026-03-01",
    "subscribes": 1,
    "unsubscribes": 0,
    "net_change": 1,
    "unique_subscribers": 1,
    "repeat_subscribes": 0,
    "total_active": 1
  },
  {
    "date": "2026-03-02",
    "subscribes": 0,
    "unsubscribes": 1,
    "net_change": -1,
    "unique_subscribers": 0,
    "repeat_subscribes": 0,
    "total_active": 1
  },
  {
    "date": "2026-03-03",
    "subscribes": 1,
    "unsubscribes": 0,
    "net_change": 1,
    "unique_subscribers": 1,
    "repeat_subscribes": 0,
    "total_active": 2
  }
]"#;
    assert_eq!(pretty(&parse_json(&output)), expected);
    let _ = std::fs::remove_file(&db_path);
}

#[test]
fn snapshot_check_error_stderr_v1() {
    let db_path =
        std::env::temp_dir().join(format!("journal-snapshot-check-err-{}.sqlite3", Ulid::new()));

    let setup = sj_output(&db_path, &["journal", "check"]);
    assert!(setup.status.success());

    let conn = match rusqlite::Connection::open(&db_path) {
        Ok(value) => value,
        Err(err) => panic!("failed to open setup db: {err}"),
    };
    if let Err(err) = conn.execute_batch(
        "PRAGMA foreign_keys = OFF;
         INSERT INTO retention_checks(journal_id, check_date, result)
         VALUES (777, '2026-03-01', 'retained');",
    ) {
        panic!("failed to seed orphan check: {err}");
    }
    drop(conn);

    let output = sj_output(&db_path, &["journal", "check"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains(
            "journal integrity check failed: orphan_retention_checks:retention checks without a journal entry: 1"
        ),
        "unexpected stderr snapshot: {stderr}"
    );

    let _ = std::fs::remove_file(&db_path);
}
