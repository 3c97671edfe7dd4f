use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use jsonschema::JSONSchema;
use serde_json::Value;
use ulid::Ulid;

fn repo_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .unwrap_or_else(|err| panic!("failed to canonicalize repo root: {err}"))
}

fn read_json(path: &Path) -> Value {
    let body = fs::read_to_string(path)
        .unwrap_or_else(|err| panic!("failed to read {}: {err}", path.display()));
    serde_json::from_str(&body)
        .unwrap_or_else(|err| panic!("failed to parse {}: {err}", path.display()))
}

fn schema_path() -> PathBuf {
    repo_root().join("contracts/v1/action-result.schema.json")
}

fn assert_schema(schema_path: &Path, value: &Value) {
    let schema = read_json(schema_path);
    let compiled = JSONSchema::compile(&schema)
        .unwrap_or_else(|err| panic!("failed to compile {}: {err}", schema_path.display()));
    if let Some(errors) = compiled
        .validate(value)
        .err()
        .map(|iter| iter.map(|err| err.to_string()).collect::<Vec<_>>())
    {
        panic!(
            "schema validation failed for {}:\n{}\nvalue={value}",
            schema_path.display(),
            errors.join("\n")
        );
    }
}

fn squad_json(db_path: &Path, args: &[&str]) -> Value {
    let output = Command::new(env!("CARGO_BIN_EXE_squad"))
        .arg("--db")
        .arg(db_path)
        .env("SQUAD_LOG", "off")
        .args(args)
        .output()
        .unwrap_or_else(|err| panic!("failed to run squad {args:?}: {err}"));
    serde_json::from_slice(&output.stdout).unwrap_or_else(|err| {
        panic!(
            "failed to parse stdout as JSON: {err}\nstderr={}",
            String::from_utf8_lossy(&output.stderr)
        )
    })
}

#[test]
fn contract_fixtures_validate() {
    let fixtures = repo_root().join("contracts/v1/fixtures");

    for name in [
        "action-result.created.sample.json",
        "action-result.validation.sample.json",
    ] {
        assert_schema(&schema_path(), &read_json(&fixtures.join(name)));
    }
}

#[test]
fn schema_rejects_a_result_with_both_data_and_error() {
    let schema = read_json(&schema_path());
    let compiled = JSONSchema::compile(&schema)
        .unwrap_or_else(|err| panic!("failed to compile schema: {err}"));
    let mut value = read_json(&repo_root().join("contracts/v1/fixtures/action-result.created.sample.json"));
    value["error"] = serde_json::json!({ "type": "not_found", "message": "member x not found" });

    assert!(!compiled.is_valid(&value));
}

#[test]
fn binary_results_match_the_contract() {
    let db_path = std::env::temp_dir().join(format!("squad-contract-{}.sqlite3", Ulid::new()));
    squad_json(
        &db_path,
        &[
            "--json",
            "account",
            "add",
            "--email",
            "coach@example.com",
            "--password",
            "whistle",
            "--display-name",
            "Coach",
            "--role",
            "coach",
        ],
    );
    squad_json(
        &db_path,
        &[
            "--json",
            "login",
            "--email",
            "coach@example.com",
            "--password",
            "whistle",
        ],
    );

    let created = squad_json(
        &db_path,
        &[
            "training",
            "add",
            "--field",
            "title=Finishing",
            "--field",
            "session_date=2026-10-14",
            "--field",
            "duration_minutes=60",
        ],
    );
    let invalid = squad_json(
        &db_path,
        &["training", "add", "--field", "duration_minutes=0"],
    );
    let missing = squad_json(&db_path, &["training", "delete", "missing-id"]);

    for value in [&created, &invalid, &missing] {
        assert_schema(&schema_path(), value);
    }
    assert_eq!(created["data"]["fields"]["status"], Value::from("scheduled"));
    assert_eq!(invalid["error"]["type"], Value::from("validation"));
    assert_eq!(missing["error"]["type"], Value::from("not_found"));

    let _ = fs::remove_file(&db_path);
}
