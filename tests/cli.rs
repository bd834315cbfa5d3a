use std::fs;

use assert_cmd::Command;
use tempfile::tempdir;

fn graphflow() -> Command {
    let mut cmd = Command::cargo_bin("graphflow").unwrap();
    cmd.env_remove("GRAPHFLOW_CONFIG").env_remove("RUST_LOG");
    cmd
}

#[test]
fn compiles_a_tree_to_json() {
    let dir = tempdir().unwrap();
    let tree = dir.path().join("tree.json");
    fs::write(
        &tree,
        r#"{"step":"range","low":2,"high":5,"inputs":[{"step":"v"}]}"#,
    )
    .unwrap();
    let config = dir.path().join("frontend.toml");

    let output = graphflow()
        .args(["--config", config.to_str().unwrap(), "--format", "json", "compile"])
        .arg(&tree)
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let plan: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let ops: Vec<&str> = plan["plan"]["vertices"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v["op"].as_str().unwrap())
        .collect();
    assert_eq!(ops, vec!["V", "COMBINER_RANGE", "RANGE"]);
    assert_eq!(plan["plan"]["finish"], serde_json::json!([3]));
}

#[test]
fn explains_with_schema() {
    let dir = tempdir().unwrap();
    let tree = dir.path().join("tree.json");
    let schema = dir.path().join("schema.json");
    fs::write(
        &tree,
        r#"{"step":"count","inputs":[{"step":"expand","edge_labels":["knows"],"inputs":[{"step":"v"}]}]}"#,
    )
    .unwrap();
    fs::write(&schema, r#"{"edge_labels":{"knows":4}}"#).unwrap();
    let config = dir.path().join("frontend.toml");

    let output = graphflow()
        .args(["--config", config.to_str().unwrap(), "compile"])
        .arg(&tree)
        .arg("--schema")
        .arg(&schema)
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let text = String::from_utf8(output.stdout).unwrap();
    assert!(text.starts_with("plan "));
    assert!(text.contains("SUM"));
    assert!(text.contains("COMBINER_COUNT"));
    assert!(text.contains("OUT [id=#2 args=4"));
}

#[test]
fn compile_reports_unknown_labels() {
    let dir = tempdir().unwrap();
    let tree = dir.path().join("tree.json");
    fs::write(
        &tree,
        r#"{"step":"select","labels":["x"],"inputs":[{"step":"v"}]}"#,
    )
    .unwrap();
    let config = dir.path().join("frontend.toml");
    let output = graphflow()
        .args(["--config", config.to_str().unwrap(), "compile"])
        .arg(&tree)
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("unresolved label 'x'"));
}

#[test]
fn session_encode_and_decode() {
    let dir = tempdir().unwrap();
    let config = dir.path().join("frontend.toml");
    let config = config.to_str().unwrap();

    let output = graphflow()
        .args(["--config", config, "session", "encode", "--node", "2", "--seq", "17", "--timestamp", "99"])
        .output()
        .unwrap();
    assert!(output.status.success());
    assert_eq!(String::from_utf8(output.stdout).unwrap().trim(), "2-17-99");

    let output = graphflow()
        .args(["--config", config, "session", "decode", "2-17-99"])
        .output()
        .unwrap();
    assert!(output.status.success());
    assert_eq!(String::from_utf8(output.stdout).unwrap().trim(), "17");

    let output = graphflow()
        .args(["--config", config, "session", "decode", "only-two"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("malformed write session"));
}

#[test]
fn config_init_writes_file_used_by_issue() {
    let dir = tempdir().unwrap();
    let config = dir.path().join("conf").join("frontend.toml");
    let config_arg = config.to_str().unwrap();

    let output = graphflow()
        .args(["--config", config_arg, "config", "init"])
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert!(config.exists());

    let text = fs::read_to_string(&config).unwrap().replace("node_id = 0", "node_id = 5");
    fs::write(&config, text).unwrap();

    let output = graphflow()
        .args(["--config", config_arg, "session", "issue", "--seq", "40"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let token = String::from_utf8(output.stdout).unwrap();
    assert!(token.trim().starts_with("5-40-"));
}

#[test]
fn missing_tree_file_is_an_io_error() {
    let dir = tempdir().unwrap();
    let config = dir.path().join("frontend.toml");
    let output = graphflow()
        .args(["--config", config.to_str().unwrap(), "compile"])
        .arg(dir.path().join("absent.json"))
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("error: I/O error:"));
}
