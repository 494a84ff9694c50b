use assert_cmd::Command;
use serde_json::Value;
use std::time::Duration;
use tempfile::tempdir;

fn ref_js_cli() -> Command {
  assert_cmd::cargo::cargo_bin_cmd!("ref-js-cli")
}

fn parse_stdout_json(stdout: &[u8]) -> Value {
  serde_json::from_slice(stdout).expect("stdout should be valid JSON")
}

const DENSITY: &str = r#"{
  "shape": "sequence",
  "events": [
    {"op": "register", "key": 2},
    {"op": "register", "key": 0},
    {"op": "register", "key": 5},
    {"op": "set", "key": 2, "value": "a"},
    {"op": "set", "key": 0, "value": "b"},
    {"op": "set", "key": 5, "value": "c"},
    {"op": "snapshot"}
  ]
}"#;

#[test]
fn replays_script_from_stdin() {
  let assert = ref_js_cli()
    .timeout(Duration::from_secs(5))
    .write_stdin(DENSITY)
    .assert()
    .success()
    .code(0);

  assert!(
    assert.get_output().stderr.is_empty(),
    "expected stderr to be empty, got: {}",
    String::from_utf8_lossy(&assert.get_output().stderr)
  );

  let output = parse_stdout_json(&assert.get_output().stdout);
  assert_eq!(output["schema_version"], 1);
  assert_eq!(output["shape"], "sequence");
  assert_eq!(output["log"][0]["event"], "settle");
  assert_eq!(output["log"][0]["wave"], 1);
  assert_eq!(
    output["log"][0]["values"],
    serde_json::json!(["b", null, "a", null, null, "c"])
  );
  assert_eq!(output["log"][1]["event"], "snapshot");
  assert_eq!(output["log"][1]["pending"], 0);
  assert_eq!(output["log"][1]["mounted"], 3);
  assert_eq!(output["log"][1]["values"][1], "hole");
  assert_eq!(output["log"][1]["values"][0]["value"], "b");
}

#[test]
fn reads_script_from_file_and_flags_override_shape() {
  let dir = tempdir().unwrap();
  let path = dir.path().join("script.json");
  std::fs::write(
    &path,
    r#"{
      "shape": "sequence",
      "events": [
        {"op": "register", "key": "header"},
        {"op": "register_root"},
        {"op": "set", "key": "header", "value": {"tag": "h1"}},
        {"op": "settle_root"},
        {"op": "release", "key": "header"},
        {"op": "release_root"}
      ]
    }"#,
  )
  .unwrap();

  let assert = ref_js_cli()
    .timeout(Duration::from_secs(5))
    .arg("--input")
    .arg(&path)
    .arg("--shape")
    .arg("mapping")
    .assert()
    .success();

  let output = parse_stdout_json(&assert.get_output().stdout);
  assert_eq!(output["shape"], "mapping");
  assert_eq!(output["log"][0]["event"], "settle");
  assert_eq!(output["log"][0]["values"]["header"]["tag"], "h1");
  assert_eq!(output["log"][1]["event"], "teardown");
  assert_eq!(output["log"][1]["wave"], 1);
}

#[test]
fn aggregator_errors_are_logged_not_fatal() {
  let assert = ref_js_cli()
    .timeout(Duration::from_secs(5))
    .arg("--shape")
    .arg("sequence")
    .write_stdin(r#"{"events": [{"op": "register", "key": -1}]}"#)
    .assert()
    .success();

  let output = parse_stdout_json(&assert.get_output().stdout);
  assert_eq!(output["log"][0]["event"], "error");
  assert_eq!(output["log"][0]["index"], 0);
  assert_eq!(output["log"][0]["code"], "RA0001");
}

#[test]
fn oversized_sequence_index_is_logged() {
  let assert = ref_js_cli()
    .timeout(Duration::from_secs(5))
    .arg("--shape")
    .arg("sequence")
    .write_stdin(
      r#"{"events": [
        {"op": "register", "key": 4294967295},
        {"op": "register", "key": 1},
        {"op": "snapshot"}
      ]}"#,
    )
    .assert()
    .success();

  let output = parse_stdout_json(&assert.get_output().stdout);
  assert_eq!(output["log"][0]["event"], "error");
  assert_eq!(output["log"][0]["code"], "RA0001");
  assert_eq!(output["log"][1]["event"], "snapshot");
  assert_eq!(output["log"][1]["pending"], 1);
  assert_eq!(output["log"][1]["values"], serde_json::json!(["hole", "unwritten"]));
}

#[test]
fn reject_flag_refuses_late_registration() {
  let assert = ref_js_cli()
    .timeout(Duration::from_secs(5))
    .arg("--rearm")
    .arg("reject")
    .write_stdin(
      r#"{"events": [
        {"op": "register", "key": "a"},
        {"op": "set", "key": "a", "value": 1},
        {"op": "register", "key": "b"}
      ]}"#,
    )
    .assert()
    .success();

  let output = parse_stdout_json(&assert.get_output().stdout);
  assert_eq!(output["log"][1]["event"], "error");
  assert_eq!(output["log"][1]["code"], "RA0002");
}

#[test]
fn double_release_is_a_fatal_script_error() {
  let assert = ref_js_cli()
    .timeout(Duration::from_secs(5))
    .write_stdin(
      r#"{"events": [
        {"op": "register", "key": "a"},
        {"op": "set", "key": "a", "value": 1},
        {"op": "release", "key": "a"},
        {"op": "release", "key": "a"}
      ]}"#,
    )
    .assert()
    .failure()
    .code(1);

  let stderr = String::from_utf8_lossy(&assert.get_output().stderr);
  assert!(stderr.contains("error[RC0004]"), "stderr: {stderr}");
  assert!(stderr.contains("event 3"), "stderr: {stderr}");
  assert!(assert.get_output().stdout.is_empty());
}

#[test]
fn invalid_json_is_reported() {
  let assert = ref_js_cli()
    .timeout(Duration::from_secs(5))
    .write_stdin("{\"events\": [")
    .assert()
    .failure()
    .code(1);

  let stderr = String::from_utf8_lossy(&assert.get_output().stderr);
  assert!(stderr.contains("error[RC0002]"), "stderr: {stderr}");
  assert!(stderr.contains("<stdin>"), "stderr: {stderr}");
}

#[test]
fn missing_input_file_is_reported() {
  let dir = tempdir().unwrap();
  let assert = ref_js_cli()
    .timeout(Duration::from_secs(5))
    .arg("--input")
    .arg(dir.path().join("missing.json"))
    .assert()
    .failure()
    .code(1);

  let stderr = String::from_utf8_lossy(&assert.get_output().stderr);
  assert!(stderr.contains("error[RC0001]"), "stderr: {stderr}");
}

#[test]
fn verbose_logs_slot_operations_to_stderr() {
  let assert = ref_js_cli()
    .timeout(Duration::from_secs(5))
    .arg("--verbose")
    .arg("--log-json")
    .env_remove("REF_JS_LOG")
    .write_stdin(DENSITY)
    .assert()
    .success();

  let stderr = String::from_utf8_lossy(&assert.get_output().stderr);
  assert!(stderr.contains("allocated slot"), "stderr: {stderr}");
  assert!(stderr.contains("aggregate settled"), "stderr: {stderr}");
  for line in stderr.lines() {
    serde_json::from_str::<Value>(line).expect("JSON log line");
  }
}
