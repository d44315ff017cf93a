use std::{
    cell::{Cell, RefCell},
    collections::BTreeMap,
    fs, io,
};

use wptnn_bridge::{ExecutionError, Executor, GraphExecution, Outputs};
use wptnn_harness::{
    options::RunOptions,
    orchestrator::run,
    report::CaseStatus,
    source::{DirectorySource, FixtureSource},
};

/// Answers with the expected outputs, corrupted for the markers in `wrong`.
#[derive(Default)]
struct FakeExecutor {
    wrong: Vec<f64>,
    exit_on: Option<f64>,
    seen: RefCell<Vec<(f64, String)>>,
    closed: Cell<usize>,
}

impl FakeExecutor {
    fn marker(execution: &GraphExecution) -> f64 {
        execution.inputs["x"].data[0].as_f64().unwrap_or(f64::NAN)
    }
}

impl Executor for FakeExecutor {
    fn execute(&self, execution: GraphExecution) -> Result<Outputs, ExecutionError> {
        let marker = Self::marker(&execution);
        let variant = execution.context_options["deviceType"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        self.seen.borrow_mut().push((marker, variant));

        if self.exit_on == Some(marker) {
            return Err(ExecutionError::ProcessExited("killed".into()));
        }
        let mut outputs = execution.expected_outputs;
        if self.wrong.contains(&marker) {
            for tensor in outputs.values_mut() {
                for v in tensor.data.iter_mut() {
                    *v = serde_json::json!(v.as_f64().unwrap_or_default() * 2.0 + 1.0);
                }
            }
        }
        Ok(outputs)
    }

    fn close(&self) {
        self.closed.set(self.closed.get() + 1);
    }
}

#[derive(Default)]
struct MemorySource {
    files: BTreeMap<String, String>,
    broken: bool,
}

impl MemorySource {
    fn with(mut self, name: &str, text: String) -> Self {
        self.files.insert(name.to_string(), text);
        self
    }
}

impl FixtureSource for MemorySource {
    fn list(&self) -> io::Result<Vec<String>> {
        if self.broken {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "denied"));
        }
        Ok(self.files.keys().cloned().collect())
    }

    fn read(&self, name: &str) -> io::Result<String> {
        self.files
            .get(name)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, name.to_string()))
    }
}

/// A fixture with one `relu` case per marker. The marker is the value of
/// input `x`, so the fake executor can tell cases apart.
fn fixture(markers: &[f64]) -> String {
    let cases = markers
        .iter()
        .map(|m| {
            format!(
                "{{
  name: 'relu {m}',
  graph: {{
    inputs: {{x: {{data: [{m}], descriptor: {{shape: [1], dataType: 'float32'}}}}}},
    operators: [{{name: 'relu', arguments: [{{input: 'x'}}], outputs: 'y'}}],
    expectedOutputs: {{y: {{data: [{m}], descriptor: {{shape: [1], dataType: 'float32'}}}}}}
  }}
}}"
            )
        })
        .collect::<Vec<_>>()
        .join(",\n");
    format!("'use strict';\nconst reluTests = [\n{cases}\n];\nreluTests.forEach(run);\n")
}

#[test]
fn failed_extraction_does_not_stop_the_run() {
    let source = MemorySource::default()
        .with("a_broken.https.any.js", "const x = 1;".to_string())
        .with("b_relu.https.any.js", fixture(&[1.0, 2.0]));
    let executor = FakeExecutor::default();

    let report = run(&RunOptions::new("mem"), &source, &executor);

    assert_eq!(report.files.len(), 2);
    assert_eq!(
        report.files[0].file_error.as_deref(),
        Some("No top-level array declaration found")
    );
    assert!(report.files[0].cases.is_empty());
    assert_eq!(report.files[1].file_error, None);
    assert_eq!(report.files[1].selected_tests, 2);
    assert_eq!(report.summary.passed, 2);
    assert_eq!(report.summary.total, 2);
    assert_eq!(report.failures.len(), 1);
    assert!(report.succeeded());
    assert_eq!(executor.closed.get(), 1);
}

#[test]
fn stop_on_fail_halts_immediately() {
    let source = MemorySource::default()
        .with("a.js", fixture(&[1.0, 2.0, 3.0]))
        .with("b.js", fixture(&[4.0]));
    let executor = FakeExecutor {
        wrong: vec![2.0],
        ..Default::default()
    };

    let options = RunOptions::new("mem").with_stop_on_fail(true);
    let report = run(&options, &source, &executor);

    assert_eq!(report.summary.failed, 1);
    assert_eq!(report.summary.passed, 1);
    assert_eq!(report.files.len(), 1);
    let seen = executor.seen.borrow();
    assert_eq!(seen.iter().map(|(m, _)| *m).collect::<Vec<_>>(), vec![1.0, 2.0]);
    assert!(report.failures[0].starts_with("a.js :: relu 2 [cpu]: Output 'y'"));
}

#[test]
fn every_variant_runs_through_one_path() {
    let source = MemorySource::default().with("a.js", fixture(&[1.0, 2.0]));
    let executor = FakeExecutor::default();

    let options = RunOptions::new("mem").with_variants(["cpu", "gpu"]);
    let report = run(&options, &source, &executor);

    assert_eq!(report.summary.passed, 4);
    let variants = executor
        .seen
        .borrow()
        .iter()
        .map(|(_, v)| v.clone())
        .collect::<Vec<_>>();
    assert_eq!(variants, vec!["cpu", "cpu", "gpu", "gpu"]);
    assert_eq!(report.files[0].cases[2].variant, "gpu");
}

#[test]
fn selection_filters() {
    let source = MemorySource::default()
        .with("add.js", fixture(&[1.0]))
        .with("relu.js", fixture(&[1.0, 2.0, 3.0]))
        .with("relu_more.js", fixture(&[4.0]));
    let executor = FakeExecutor::default();

    let options = RunOptions::new("mem")
        .with_file_filter("relu")
        .with_max_files(1)
        .with_max_tests(2);
    let report = run(&options, &source, &executor);
    assert_eq!(report.files.len(), 1);
    assert_eq!(report.files[0].file_name, "relu.js");
    assert_eq!(report.files[0].selected_tests, 2);

    let options = RunOptions::new("mem").with_op_filter("conv2d");
    let report = run(&options, &source, &executor);
    assert_eq!(report.summary.total, 0);
    assert!(report.files.iter().all(|f| f.selected_tests == 0));
}

#[test]
fn skipped_cases_are_not_executed() {
    let source = MemorySource::default().with(
        "a.js",
        fixture(&[1.0]).replace("reluTests = [", "reluTests = [{name: 'odd', graph: {inputs: {x: {data: [1], descriptor: {shape: [1], dataType: 'float64'}}}}},"),
    );
    let executor = FakeExecutor::default();

    let report = run(&RunOptions::new("mem"), &source, &executor);
    let statuses = report.files[0]
        .cases
        .iter()
        .map(|c| c.status)
        .collect::<Vec<_>>();
    assert_eq!(statuses, vec![CaseStatus::Skip, CaseStatus::Pass]);
    assert_eq!(
        report.files[0].cases[0].reason.as_deref(),
        Some("unsupported data type 'float64'")
    );
    assert_eq!(report.summary.pass_rate_pct, 50.0);
    assert_eq!(report.summary.pass_rate_excluding_skips_pct, 100.0);
    assert!(report.succeeded());
    assert_eq!(executor.seen.borrow().len(), 1);
}

#[test]
fn backend_exit_is_fatal() {
    let source = MemorySource::default()
        .with("a.js", fixture(&[1.0, 2.0, 3.0]))
        .with("b.js", fixture(&[4.0]));
    let executor = FakeExecutor {
        exit_on: Some(2.0),
        ..Default::default()
    };

    let report = run(&RunOptions::new("mem"), &source, &executor);
    assert_eq!(report.summary.passed, 1);
    assert_eq!(report.summary.failed, 1);
    assert_eq!(report.files.len(), 1);
    assert!(report.meta.fatal_error.as_deref().unwrap().contains("killed"));
    assert_eq!(executor.closed.get(), 1);
}

#[test]
fn listing_failure_is_fatal() {
    let source = MemorySource {
        broken: true,
        ..Default::default()
    };
    let executor = FakeExecutor::default();

    let report = run(&RunOptions::new("mem"), &source, &executor);
    assert_eq!(
        report.meta.fatal_error.as_deref(),
        Some("Cannot list fixtures: denied")
    );
    assert!(report.files.is_empty());
    assert!(!report.succeeded());
    assert_eq!(executor.closed.get(), 1);
}

#[test]
fn directory_run_writes_reports() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("relu.https.any.js"), fixture(&[0.5])).unwrap();
    let executor = FakeExecutor::default();

    let report = run(
        &RunOptions::new(dir.path()),
        &DirectorySource::new(dir.path()),
        &executor,
    );
    let path = dir.path().join("report.json");
    report.write_json(&path).unwrap();

    let json: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(json["summary"]["passed"], 1);
    assert_eq!(json["files"][0]["fileName"], "relu.https.any.js");
    assert_eq!(json["files"][0]["cases"][0]["testName"], "relu 0.5");
    assert_eq!(json["failures"], serde_json::json!([]));
}
