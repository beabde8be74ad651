use std::ffi::OsStr;
use std::fs;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

use jsonschema::JSONSchema;
use rusqlite::Connection;
use serde_json::Value;

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|err| panic!("clock should be >= UNIX_EPOCH: {err}"))
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("{prefix}-{now}-{}", std::process::id()));
    fs::create_dir_all(&dir)
        .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
    dir
}

fn run_drift_repair<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_drift-repair"))
        .args(args)
        .env_remove("DRIFT_REPAIR_SOURCE_URL")
        .env_remove("DRIFT_REPAIR_TARGET_URL")
        .env("RUST_LOG", "warn")
        .output()
        .unwrap_or_else(|err| panic!("failed to execute drift-repair binary: {err}"))
}

fn stdout_json(output: &Output) -> Value {
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout).unwrap_or_else(|err| {
        panic!(
            "stdout is not valid JSON: {err}\nstdout:\n{stdout}\nstderr:\n{}",
            String::from_utf8_lossy(&output.stderr)
        )
    })
}

fn exit_code(output: &Output) -> i32 {
    output
        .status
        .code()
        .unwrap_or_else(|| panic!("drift-repair terminated by signal: {}", output.status))
}

fn as_i64(value: &Value, key: &str) -> i64 {
    value
        .get(key)
        .and_then(Value::as_i64)
        .unwrap_or_else(|| panic!("missing integer field `{key}` in payload: {value}"))
}

fn as_str<'a>(value: &'a Value, key: &str) -> &'a str {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string field `{key}` in payload: {value}"))
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

fn repo_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .unwrap_or_else(|err| panic!("failed to canonicalize repo root: {err}"))
}

fn read_json_file(path: &Path) -> Value {
    let body = fs::read_to_string(path)
        .unwrap_or_else(|err| panic!("failed to read JSON file {}: {err}", path.display()));
    serde_json::from_str(&body)
        .unwrap_or_else(|err| panic!("failed to parse JSON file {}: {err}", path.display()))
}

fn validate_schema(schema_file: &str, instance: &Value) {
    let schema_path = repo_root().join("contracts/v1/schemas").join(schema_file);
    let schema_json = read_json_file(&schema_path);
    let compiled = JSONSchema::compile(&schema_json)
        .unwrap_or_else(|err| panic!("failed to compile schema {}: {err}", schema_path.display()));

    let errors = compiled
        .validate(instance)
        .err()
        .map(|iter| iter.map(|err| err.to_string()).collect::<Vec<_>>());
    if let Some(errors) = errors {
        panic!("schema validation failed for {}:\n{}", schema_file, errors.join("\n"));
    }
}

/// An address nothing listens on.
fn closed_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap_or_else(|err| panic!("{err}"));
    let addr = listener.local_addr().unwrap_or_else(|err| panic!("{err}"));
    drop(listener);
    format!("redis://{addr}")
}

fn write_catalog(dir: &Path, rows: &[(&str, &str)]) -> PathBuf {
    let path = dir.join("result.db");
    let conn = Connection::open(&path).unwrap_or_else(|err| panic!("failed to create catalog: {err}"));
    conn.execute_batch(
        "CREATE TABLE key (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            key TEXT NOT NULL,
            type TEXT NOT NULL,
            conflict_type TEXT NOT NULL,
            db INTEGER NOT NULL,
            source_len INTEGER NOT NULL,
            target_len INTEGER NOT NULL
        );",
    )
    .unwrap_or_else(|err| panic!("failed to create key table: {err}"));
    for (key, kind) in rows {
        conn.execute(
            "INSERT INTO key (key, type, conflict_type, db, source_len, target_len)
             VALUES (?1, ?2, 'value', 0, 1, 1)",
            [key, kind],
        )
        .unwrap_or_else(|err| panic!("failed to insert catalog row: {err}"));
    }
    path
}

/// Loopback server speaking just enough RESP2 for a ttl pass over an empty
/// keyspace and a string value pass over persistent keys.
fn start_resp_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap_or_else(|err| panic!("{err}"));
    let addr = listener.local_addr().unwrap_or_else(|err| panic!("{err}"));
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(stream) = stream else { return };
            thread::spawn(move || serve(stream));
        }
    });
    addr
}

fn read_request(reader: &mut BufReader<TcpStream>) -> Option<Vec<String>> {
    let mut line = String::new();
    if reader.read_line(&mut line).ok()? == 0 {
        return None;
    }
    let count = line.trim_end().strip_prefix('*')?.parse::<usize>().ok()?;
    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        line.clear();
        reader.read_line(&mut line).ok()?;
        let len = line.trim_end().strip_prefix('$')?.parse::<usize>().ok()?;
        let mut data = vec![0_u8; len + 2];
        reader.read_exact(&mut data).ok()?;
        data.truncate(len);
        args.push(String::from_utf8_lossy(&data).into_owned());
    }
    Some(args)
}

fn serve(stream: TcpStream) {
    let mut writer = stream.try_clone().unwrap_or_else(|err| panic!("{err}"));
    let mut reader = BufReader::new(stream);
    while let Some(args) = read_request(&mut reader) {
        let reply = match args[0].as_str() {
            "PING" => "+PONG\r\n".to_string(),
            "SCAN" => "*2\r\n$1\r\n0\r\n*0\r\n".to_string(),
            "MGET" => {
                let mut reply = format!("*{}\r\n", args.len() - 1);
                for key in &args[1..] {
                    reply.push_str(&format!("${}\r\nv-{key}\r\n", key.len() + 2));
                }
                reply
            }
            "MSET" => "+OK\r\n".to_string(),
            "PEXPIRETIME" => ":-1\r\n".to_string(),
            other => format!("-ERR unsupported command {other}\r\n"),
        };
        if writer.write_all(reply.as_bytes()).is_err() {
            return;
        }
    }
}

#[test]
fn help_exits_zero() {
    let output = run_drift_repair(["--help"]);
    assert_eq!(exit_code(&output), 0);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("ttl"));
    assert!(stdout.contains("values"));
    assert!(stdout.contains("check"));
}

#[test]
fn usage_errors_exit_one_not_two() {
    let output = run_drift_repair(["ttl", "--page-size", "lots"]);
    assert_eq!(exit_code(&output), 1);
    assert!(output.stdout.is_empty());
}

#[test]
fn invalid_page_size_is_rejected_before_any_work() {
    let url = closed_url();
    let output = run_drift_repair(["--source", &url, "--target", &url, "ttl", "--page-size", "0"]);
    assert_eq!(exit_code(&output), 1);
    assert!(output.stdout.is_empty());
    assert!(String::from_utf8_lossy(&output.stderr).contains("page_size"));
}

#[test]
fn missing_target_is_a_configuration_error() {
    let url = closed_url();
    let output = run_drift_repair(["--source", &url, "ttl"]);
    assert_eq!(exit_code(&output), 1);
    assert!(String::from_utf8_lossy(&output.stderr).contains("DRIFT_REPAIR_TARGET_URL"));
}

#[test]
fn unknown_config_field_is_rejected() {
    let dir = unique_temp_dir("drift-repair-config");
    let config = dir.join("drift-repair.yaml");
    fs::write(&config, "options:\n  pagesize: 5\n")
        .unwrap_or_else(|err| panic!("failed to write config: {err}"));

    let output = run_drift_repair(["--config", path_str(&config), "ttl"]);

    assert_eq!(exit_code(&output), 1);
    assert!(String::from_utf8_lossy(&output.stderr).contains("failed to parse config file"));
}

#[test]
fn unreachable_target_aborts_with_a_report() {
    let url = closed_url();
    let output = run_drift_repair([
        "--source",
        &url,
        "--target",
        &url,
        "--retries",
        "0",
        "--connect-timeout-ms",
        "200",
        "ttl",
    ]);

    assert_eq!(exit_code(&output), 1);
    let report = stdout_json(&output);
    validate_schema("report.schema.json", &report);
    assert_eq!(as_str(&report, "pass"), "ttl");
    assert!(as_str(&report, "aborted").starts_with("target store unreachable"));
    assert_eq!(report["changes"], Value::Array(Vec::new()));
}

#[test]
fn ttl_pass_over_empty_keyspace_completes() {
    let addr = start_resp_server();
    let url = format!("redis://{addr}");
    let dir = unique_temp_dir("drift-repair-ttl");
    let config = dir.join("drift-repair.yaml");
    fs::write(
        &config,
        format!("source:\n  url: {url}\ntarget:\n  url: {url}\noptions:\n  dry_run: true\n"),
    )
    .unwrap_or_else(|err| panic!("failed to write config: {err}"));

    let output = run_drift_repair(["--config", path_str(&config), "ttl", "--page-size", "50"]);

    assert_eq!(exit_code(&output), 0, "stderr:\n{}", String::from_utf8_lossy(&output.stderr));
    let report = stdout_json(&output);
    validate_schema("report.schema.json", &report);
    assert_eq!(report["dry_run"], Value::Bool(true));
    assert_eq!(as_i64(&report["ttl"], "scanned_keys"), 0);
    assert_eq!(as_i64(&report["ttl"], "pages"), 1);
    assert_eq!(report["aborted"], Value::Null);
}

#[test]
fn string_value_dry_run_reports_digests() {
    let addr = start_resp_server();
    let url = format!("redis://{addr}");
    let dir = unique_temp_dir("drift-repair-values");
    let catalog = write_catalog(&dir, &[("a", "string"), ("b", "string"), ("a", "string"), ("s", "set")]);

    let output = run_drift_repair([
        "--source",
        &url,
        "--target",
        &url,
        "--dry-run",
        "values",
        "--catalog",
        path_str(&catalog),
        "--kind",
        "string",
    ]);

    assert_eq!(exit_code(&output), 0, "stderr:\n{}", String::from_utf8_lossy(&output.stderr));
    let report = stdout_json(&output);
    validate_schema("report.schema.json", &report);
    assert_eq!(as_str(&report, "pass"), "values");
    assert_eq!(as_i64(&report["values"]["string"], "discovered"), 2);
    assert_eq!(as_i64(&report["values"]["string"], "repaired"), 2);
    assert_eq!(as_i64(&report["values"]["set"], "discovered"), 0);

    let changes = report["changes"].as_array().cloned().unwrap_or_default();
    assert_eq!(changes.len(), 2);
    assert_eq!(as_str(&changes[0], "key"), "a");
    assert_eq!(changes[0]["old"], Value::String("unknown".to_string()));
    assert_eq!(as_i64(&changes[0]["new"]["value"], "bytes"), 3);
}

#[test]
fn missing_catalog_aborts_the_value_pass() {
    let url = closed_url();
    let dir = unique_temp_dir("drift-repair-no-catalog");

    let output = run_drift_repair([
        "--source",
        &url,
        "--target",
        &url,
        "values",
        "--catalog",
        path_str(&dir.join("absent.db")),
    ]);

    assert_eq!(exit_code(&output), 1);
    let report = stdout_json(&output);
    validate_schema("report.schema.json", &report);
    assert!(as_str(&report, "aborted").starts_with("catalog unreadable"));
}

#[test]
fn check_reports_each_store_and_the_catalog() {
    let addr = start_resp_server();
    let reachable = format!("redis://{addr}");
    let unreachable = closed_url();
    let dir = unique_temp_dir("drift-repair-check");
    let catalog = write_catalog(&dir, &[("a", "string"), ("s", "set"), ("h", "hash"), ("z", "zset")]);

    let output = run_drift_repair([
        "--source",
        &reachable,
        "--target",
        &unreachable,
        "--retries",
        "0",
        "check",
        "--catalog",
        path_str(&catalog),
    ]);

    assert_eq!(exit_code(&output), 1);
    let check = stdout_json(&output);
    validate_schema("check.schema.json", &check);
    assert_eq!(check["healthy"], Value::Bool(false));
    assert_eq!(check["source"]["reachable"], Value::Bool(true));
    assert_eq!(check["target"]["reachable"], Value::Bool(false));
    assert_eq!(as_i64(&check["catalog"], "rows"), 4);
    assert_eq!(as_i64(&check["catalog"], "other_keys"), 1);
}
