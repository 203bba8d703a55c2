//! Integration tests for netpolc
//!
//! These tests run the whole pipeline on the policy in `tests/fixtures/`,
//! from JSON import to the files written into a temporary output directory.
//!
//! ```bash
//! cargo test --test integration_tests
//! ```

#![allow(clippy::uninlined_format_args)]

use netpolc::config::{CompilerConfig, load_config};
use netpolc::core::diag::DiagKind;
use netpolc::core::distribute::DeviceConfig;
use netpolc::core::emit::{INDEX_FILE_NAME, Index, emit, verify_output};
use netpolc::core::import::{load_policy, parse_policy};
use netpolc::core::redundancy::RemovalKind;
use netpolc::{Error, compile};
use std::path::PathBuf;

fn fixture_path() -> PathBuf {
    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.push("tests");
    path.push("fixtures");
    path.push("office.json");
    path
}

fn fixture_json() -> serde_json::Value {
    let text = std::fs::read_to_string(fixture_path()).unwrap();
    serde_json::from_str(&text).unwrap()
}

#[tokio::test]
async fn test_compile_fixture_and_emit() {
    let model = load_policy(&fixture_path()).await.unwrap();
    let compiled = compile(&model, &CompilerConfig::default()).unwrap();
    assert_eq!(compiled.diagnostics.error_count(), 0);

    let dir = tempfile::tempdir().unwrap();
    let index = emit(dir.path(), &compiled).await.unwrap();
    assert_eq!(index.devices.len(), 1);
    assert_eq!(index.removed_rules, 2);
    assert!(verify_output(dir.path()).await.unwrap().is_empty());

    let text = tokio::fs::read_to_string(dir.path().join("fw.json")).await.unwrap();
    let fw: DeviceConfig = serde_json::from_str(&text).unwrap();
    assert_eq!(fw.model.as_deref(), Some("ASA"));
    assert_eq!(fw.policy_distribution_ip, Some("10.1.1.1".parse().unwrap()));
    let names: Vec<&str> = fw.interfaces.iter().map(|a| a.interface.as_str()).collect();
    assert_eq!(names, vec!["fw.dmz", "fw.extern", "fw.lan"]);

    // www rules from lan are covered by dmz-web
    let lan = fw.acl("fw.lan").unwrap();
    assert_eq!(lan.lines.len(), 3);
    assert!(lan.lines.iter().all(|l| !l.comment.contains("(rule:www)")));
    let ssh = lan.lines.iter().find(|l| l.prt.to_string() == "tcp 22").unwrap();
    assert_eq!(ssh.src, "10.1.1.10/32".parse().unwrap());
    assert_eq!(ssh.dst, "10.2.2.1/32".parse().unwrap());

    let ext = fw.acl("fw.extern").unwrap();
    assert_eq!(ext.lines.len(), 2);
    assert!(ext.lines.iter().all(|l| l.dst == "10.2.2.80/32".parse().unwrap()));
    assert!(fw.acl("fw.dmz").unwrap().lines.is_empty());

    let audit = tokio::fs::read_to_string(dir.path().join("audit.jsonl")).await.unwrap();
    let records: Vec<serde_json::Value> = audit
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(records.len(), 2);
    for record in &records {
        assert_eq!(record["kind"], RemovalKind::Supernet.as_ref());
        assert_eq!(record["interface"], "fw.lan");
        assert_eq!(record["run_id"], index.run_id.to_string());
    }
}

#[tokio::test]
async fn test_config_next_to_input_is_used() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("office.json");
    tokio::fs::copy(fixture_path(), &input).await.unwrap();
    tokio::fs::write(
        dir.path().join("netpolc.json"),
        r#"{ "report_redundant_rules": true }"#,
    )
    .await
    .unwrap();

    let config = load_config(None, &input).await.unwrap();
    assert!(config.report_redundant_rules);
    let model = load_policy(&input).await.unwrap();
    let compiled = compile(&model, &config).unwrap();
    assert_eq!(compiled.diagnostics.messages(DiagKind::Redundancy).len(), 2);
}

#[tokio::test]
async fn test_emitting_twice_appends_audit_log() {
    let model = load_policy(&fixture_path()).await.unwrap();
    let compiled = compile(&model, &CompilerConfig::default()).unwrap();
    let dir = tempfile::tempdir().unwrap();

    let first = emit(dir.path(), &compiled).await.unwrap();
    let second = emit(dir.path(), &compiled).await.unwrap();
    assert_ne!(first.run_id, second.run_id);
    assert_eq!(first.devices, second.devices);

    let audit = tokio::fs::read_to_string(dir.path().join("audit.jsonl")).await.unwrap();
    assert_eq!(audit.lines().count(), 4);
    let text = tokio::fs::read_to_string(dir.path().join(INDEX_FILE_NAME)).await.unwrap();
    let index: Index = serde_json::from_str(&text).unwrap();
    assert_eq!(index.run_id, second.run_id);
}

#[test]
fn test_dangling_reference_is_import_error() {
    let mut json = fixture_json();
    json["rules"][0]["dst"] = serde_json::json!(["host:nope"]);
    let err = parse_policy(&json.to_string()).unwrap_err();
    assert!(matches!(err, Error::Import { .. }), "{err}");
}

#[test]
fn test_unmanaged_fixture_has_nothing_to_emit() {
    let mut json = fixture_json();
    json["routers"][0]
        .as_object_mut()
        .unwrap()
        .remove("managed");
    json["routers"][0]
        .as_object_mut()
        .unwrap()
        .remove("policy_distribution_point");
    let model = parse_policy(&json.to_string()).unwrap();
    let compiled = compile(&model, &CompilerConfig::default()).unwrap();
    assert!(compiled.devices.is_empty());
    assert!(
        !compiled
            .diagnostics
            .messages(DiagKind::Path)
            .is_empty()
    );
}
