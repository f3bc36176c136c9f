use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde_json::Value;

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("{prefix}-{}", ulid::Ulid::new()));
    fs::create_dir_all(&dir)
        .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
    dir
}

fn run_oraculo<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_oraculo"))
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .unwrap_or_else(|err| panic!("failed to execute oraculo binary: {err}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_oraculo(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "oraculo command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
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

fn as_array<'a>(value: &'a Value, key: &str) -> &'a Vec<Value> {
    value
        .get(key)
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("missing array field `{key}` in payload: {value}"))
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

// Test IDs: TCLI-001
#[test]
fn db_commands_cover_schema_migrate_integrity_and_backup() {
    let sandbox = unique_temp_dir("oraculo-cli-db");
    let db = sandbox.join("oraculo.sqlite3");
    let backup_file = sandbox.join("backup.sqlite3");

    let schema_before = run_json(["--db", path_str(&db), "db", "schema-version"]);
    assert_eq!(as_i64(&schema_before, "current_version"), 0);
    assert_eq!(as_str(&schema_before, "contract_version"), "cli.v1");

    let dry_run = run_json(["--db", path_str(&db), "db", "migrate", "--dry-run"]);
    assert_eq!(as_array(&dry_run, "would_apply_versions").len(), 2);
    let schema_after_dry_run = run_json(["--db", path_str(&db), "db", "schema-version"]);
    assert_eq!(as_i64(&schema_after_dry_run, "current_version"), 0);

    let migrate = run_json(["--db", path_str(&db), "db", "migrate"]);
    assert_eq!(as_i64(&migrate, "after_version"), 2);
    assert_eq!(migrate.get("up_to_date").and_then(Value::as_bool), Some(true));

    let integrity = run_json(["--db", path_str(&db), "db", "integrity-check"]);
    assert_eq!(integrity.get("quick_check_ok").and_then(Value::as_bool), Some(true));

    let backup = run_json(["--db", path_str(&db), "db", "backup", "--out", path_str(&backup_file)]);
    assert_eq!(as_str(&backup, "status"), "ok");
    assert!(backup_file.exists());

    let _ = fs::remove_dir_all(&sandbox);
}

// Test IDs: TCLI-002
#[test]
fn category_and_procedure_management_round_trip() {
    let sandbox = unique_temp_dir("oraculo-cli-procedures");
    let db = sandbox.join("oraculo.sqlite3");
    let body_file = sandbox.join("ferias.md");
    fs::write(&body_file, "# Férias\n\nSolicite com 30 dias de antecedência.")
        .unwrap_or_else(|err| panic!("failed to write body file: {err}"));

    let category = run_json(["--db", path_str(&db), "category", "add", "--name", "RH"]);
    let category_id = as_str(&category, "id").to_string();
    let _ = run_json(["--db", path_str(&db), "category", "add", "--name", "Financeiro"]);
    let categories = run_json(["--db", path_str(&db), "category", "list"]);
    let names: Vec<&str> = as_array(&categories, "categories")
        .iter()
        .map(|category| as_str(category, "name"))
        .collect();
    assert_eq!(names, vec!["Financeiro", "RH"]);

    let procedure = run_json([
        "--db",
        path_str(&db),
        "procedure",
        "add",
        "--title",
        "Solicitação de Férias",
        "--content-file",
        path_str(&body_file),
        "--summary",
        "Como pedir férias",
        "--category-id",
        &category_id,
        "--tag",
        " rh ",
        "--tag",
        "rh",
        "--tag",
        "ferias",
    ]);
    let procedure_id = as_str(&procedure, "id").to_string();
    assert_eq!(as_str(&procedure, "status"), "active");
    assert_eq!(as_i64(&procedure, "version"), 1);
    assert_eq!(as_array(&procedure, "tags").len(), 2);

    let retagged = run_json([
        "--db",
        path_str(&db),
        "procedure",
        "tag",
        "--id",
        &procedure_id,
        "--remove",
        "rh",
        "--add",
        "beneficios",
    ]);
    let tags: Vec<&str> =
        as_array(&retagged, "tags").iter().filter_map(Value::as_str).collect();
    assert_eq!(tags, vec!["ferias", "beneficios"]);
    assert_eq!(as_i64(&retagged, "version"), 1);

    let found = run_json(["--db", path_str(&db), "procedure", "list", "--query", "FÉRIAS"]);
    assert_eq!(as_array(&found, "procedures").len(), 1);

    let archived =
        run_json(["--db", path_str(&db), "procedure", "archive", "--id", &procedure_id]);
    assert_eq!(as_str(&archived, "status"), "archived");

    let active = run_json(["--db", path_str(&db), "procedure", "list", "--status", "active"]);
    assert!(as_array(&active, "procedures").is_empty());

    let _ = fs::remove_dir_all(&sandbox);
}

// Test IDs: TCLI-003
#[test]
fn procedure_add_rejects_blank_content() {
    let sandbox = unique_temp_dir("oraculo-cli-validation");
    let db = sandbox.join("oraculo.sqlite3");

    let output = run_oraculo([
        "--db",
        path_str(&db),
        "procedure",
        "add",
        "--title",
        "Sem corpo",
        "--content",
        "   ",
    ]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("content_md"));

    let _ = fs::remove_dir_all(&sandbox);
}

// Test IDs: TCLI-004
#[test]
fn user_add_and_set_role() {
    let sandbox = unique_temp_dir("oraculo-cli-users");
    let db = sandbox.join("oraculo.sqlite3");

    let user = run_json([
        "--db",
        path_str(&db),
        "user",
        "add",
        "--email",
        "Ana@Empresa.com",
        "--password",
        "senha-segura",
        "--full-name",
        "Ana Souza",
    ]);
    assert_eq!(as_str(&user, "email"), "ana@empresa.com");
    assert_eq!(as_str(&user, "role"), "user");
    assert!(user.get("password_hash").is_none());

    let promoted = run_json([
        "--db",
        path_str(&db),
        "user",
        "set-role",
        "--email",
        "ana@empresa.com",
        "--role",
        "admin",
    ]);
    assert_eq!(as_str(&promoted, "role"), "admin");

    let users = run_json(["--db", path_str(&db), "user", "list"]);
    assert_eq!(as_array(&users, "users").len(), 1);

    let missing = run_oraculo([
        "--db",
        path_str(&db),
        "user",
        "set-role",
        "--email",
        "ninguem@empresa.com",
        "--role",
        "admin",
    ]);
    assert!(!missing.status.success());

    let _ = fs::remove_dir_all(&sandbox);
}

// Test IDs: TCLI-005
#[test]
fn ask_without_matches_answers_with_fallback_and_no_llm() {
    let sandbox = unique_temp_dir("oraculo-cli-ask");
    let db = sandbox.join("oraculo.sqlite3");
    let _ = run_json([
        "--db",
        path_str(&db),
        "user",
        "add",
        "--email",
        "ana@empresa.com",
        "--password",
        "senha-segura",
        "--full-name",
        "Ana Souza",
    ]);

    let answer = run_json([
        "--db",
        path_str(&db),
        "ask",
        "--email",
        "ana@empresa.com",
        "--question",
        "Qual o horário da cantina",
    ]);
    assert_eq!(answer.get("created_conversation").and_then(Value::as_bool), Some(true));
    let assistant = answer
        .get("assistant_message")
        .unwrap_or_else(|| panic!("assistant_message missing: {answer}"));
    assert!(as_str(assistant, "content").starts_with("Desculpe"));
    assert!(as_array(assistant, "sources").is_empty());

    let conversation_id = as_str(&answer, "conversation_id").to_string();
    let follow_up = run_json([
        "--db",
        path_str(&db),
        "ask",
        "--email",
        "ana@empresa.com",
        "--question",
        "E aos sábados",
        "--conversation-id",
        &conversation_id,
    ]);
    assert_eq!(follow_up.get("created_conversation").and_then(Value::as_bool), Some(false));
    assert_eq!(as_str(&follow_up, "conversation_id"), conversation_id);

    let _ = fs::remove_dir_all(&sandbox);
}

// Test IDs: TCLI-006
#[test]
fn ask_with_matching_procedure_fails_at_invoke_llm_when_unconfigured() {
    let sandbox = unique_temp_dir("oraculo-cli-ask-llm");
    let db = sandbox.join("oraculo.sqlite3");
    let _ = run_json([
        "--db",
        path_str(&db),
        "user",
        "add",
        "--email",
        "ana@empresa.com",
        "--password",
        "senha-segura",
        "--full-name",
        "Ana Souza",
    ]);
    let _ = run_json([
        "--db",
        path_str(&db),
        "procedure",
        "add",
        "--title",
        "Política de Reembolso",
        "--content",
        "Envie o comprovante ao financeiro.",
    ]);

    let output = run_oraculo([
        "--db",
        path_str(&db),
        "ask",
        "--email",
        "ana@empresa.com",
        "--question",
        "Como pedir reembolso",
    ]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("invoke_llm"), "stderr should name the failed stage:\n{stderr}");

    let _ = fs::remove_dir_all(&sandbox);
}

// Test IDs: TCLI-007
#[test]
fn ask_rejects_unknown_user() {
    let sandbox = unique_temp_dir("oraculo-cli-ask-unknown");
    let db = sandbox.join("oraculo.sqlite3");

    let output = run_oraculo([
        "--db",
        path_str(&db),
        "ask",
        "--email",
        "ninguem@empresa.com",
        "--question",
        "Oi",
    ]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("no user with email"));

    let _ = fs::remove_dir_all(&sandbox);
}
