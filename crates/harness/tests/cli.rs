use std::{fs, process::Command};

const WPTNN: &str = env!("CARGO_BIN_EXE_wptnn");

const FIXTURE: &str = "const reluTests = [{
  name: 'relu',
  graph: {
    inputs: {x: {data: [1], descriptor: {shape: [1], dataType: 'float32'}}},
    operators: [{name: 'relu', arguments: [{input: 'x'}], outputs: 'y'}],
    expectedOutputs: {y: {data: [1], descriptor: {shape: [1], dataType: 'float32'}}}
  }
}];
reluTests.forEach(run);
";

#[test]
fn missing_fixture_directory_is_an_invocation_error() {
    let dir = tempfile::tempdir().unwrap();
    let status = Command::new(WPTNN)
        .arg("--fixtures")
        .arg(dir.path().join("nope"))
        .arg("--backend")
        .arg("true")
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(2));

    let status = Command::new(WPTNN)
        .arg("--fixtures")
        .arg(dir.path())
        .arg("--backend")
        .arg("true")
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(2));
}

#[test]
fn spawn_failure_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("relu.https.any.js"), FIXTURE).unwrap();
    let json_path = dir.path().join("report.json");
    let text_path = dir.path().join("report.txt");

    let output = Command::new(WPTNN)
        .arg("--fixtures")
        .arg(dir.path())
        .arg("--backend")
        .arg(dir.path().join("no-such-backend"))
        .arg("--json-report")
        .arg(&json_path)
        .arg("--text-report")
        .arg(&text_path)
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));

    let json: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&json_path).unwrap()).unwrap();
    assert!(json["meta"]["fatalError"]
        .as_str()
        .unwrap()
        .starts_with("Failed to spawn backend"));
    assert_eq!(json["summary"]["total"], 0);
    assert!(fs::read_to_string(&text_path).unwrap().contains("FATAL: Failed to spawn backend"));
}
