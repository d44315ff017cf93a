use std::{fmt::Write as _, fs, io, path::Path, time::Duration};

use serde::Serialize;
use serde_json::Value;

use crate::options::RunOptions;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CaseStatus {
    Pass,
    Fail,
    Skip,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaseReport {
    pub test_name: String,
    pub variant: String,
    pub status: CaseStatus,
    /// Why the case was skipped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: f64,
}

impl CaseReport {
    pub fn passed(test_name: &str, variant: &str, elapsed: Duration) -> Self {
        Self::new(test_name, variant, CaseStatus::Pass, elapsed)
    }

    pub fn failed(test_name: &str, variant: &str, error: String, elapsed: Duration) -> Self {
        Self {
            error: Some(error),
            ..Self::new(test_name, variant, CaseStatus::Fail, elapsed)
        }
    }

    pub fn skipped(test_name: &str, variant: &str, reason: String, elapsed: Duration) -> Self {
        Self {
            reason: Some(reason),
            ..Self::new(test_name, variant, CaseStatus::Skip, elapsed)
        }
    }

    fn new(test_name: &str, variant: &str, status: CaseStatus, elapsed: Duration) -> Self {
        Self {
            test_name: test_name.to_string(),
            variant: variant.to_string(),
            status,
            reason: None,
            error: None,
            duration_ms: elapsed.as_secs_f64() * 1000.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub total: usize,
    pub pass_rate_pct: f64,
    pub pass_rate_excluding_skips_pct: f64,
}

impl Summary {
    pub fn record(&mut self, status: CaseStatus) {
        match status {
            CaseStatus::Pass => self.passed += 1,
            CaseStatus::Fail => self.failed += 1,
            CaseStatus::Skip => self.skipped += 1,
        }
        self.total += 1;
        self.pass_rate_pct = percentage(self.passed, self.total);
        self.pass_rate_excluding_skips_pct = percentage(self.passed, self.passed + self.failed);
    }

    fn absorb(&mut self, other: &Summary) {
        self.passed += other.passed;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.total += other.total;
        self.pass_rate_pct = percentage(self.passed, self.total);
        self.pass_rate_excluding_skips_pct = percentage(self.passed, self.passed + self.failed);
    }
}

/// `part / whole` in percent, rounded to two decimals. 0 when `whole` is 0.
fn percentage(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    (part as f64 / whole as f64 * 10000.0).round() / 100.0
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileReport {
    pub file_name: String,
    pub selected_tests: usize,
    pub summary: Summary,
    pub file_error: Option<String>,
    pub cases: Vec<CaseReport>,
}

impl FileReport {
    pub fn new(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            selected_tests: 0,
            summary: Summary::default(),
            file_error: None,
            cases: vec![],
        }
    }

    pub fn push(&mut self, case: CaseReport) {
        self.summary.record(case.status);
        self.cases.push(case);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Meta {
    pub started_at: String,
    pub ended_at: Option<String>,
    pub options: RunOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_provenance: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fatal_error: Option<String>,
}

/// The outcome of a whole run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub meta: Meta,
    pub summary: Summary,
    pub files: Vec<FileReport>,
    pub failures: Vec<String>,
}

impl RunReport {
    pub fn new(options: &RunOptions) -> Self {
        Self {
            meta: Meta {
                started_at: now(),
                ended_at: None,
                options: options.clone(),
                backend_provenance: options
                    .backend
                    .as_ref()
                    .and_then(|b| serde_json::to_value(b).ok()),
                fatal_error: None,
            },
            summary: Summary::default(),
            files: vec![],
            failures: vec![],
        }
    }

    pub fn push_file(&mut self, file: FileReport) {
        if let Some(err) = &file.file_error {
            self.failures.push(format!("{}: {err}", file.file_name));
        }
        for case in &file.cases {
            if let Some(err) = &case.error {
                self.failures.push(format!(
                    "{} :: {} [{}]: {err}",
                    file.file_name, case.test_name, case.variant
                ));
            }
        }
        self.summary.absorb(&file.summary);
        self.files.push(file);
    }

    pub fn set_fatal_error(&mut self, error: String) {
        self.failures.push(format!("fatal: {error}"));
        self.meta.fatal_error = Some(error);
    }

    pub fn finish(&mut self) {
        self.meta.ended_at = Some(now());
    }

    /// No failed case and no fatal error. File errors are reported but do
    /// not fail the run.
    pub fn succeeded(&self) -> bool {
        self.summary.failed == 0 && self.meta.fatal_error.is_none()
    }

    pub fn write_json(&self, path: &Path) -> io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json + "\n")
    }

    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let s = &self.summary;
        let _ = writeln!(out, "WebNN conformance run");
        let _ = writeln!(out, "  started:  {}", self.meta.started_at);
        if let Some(ended) = &self.meta.ended_at {
            let _ = writeln!(out, "  ended:    {ended}");
        }
        let _ = writeln!(
            out,
            "  variants: {}",
            self.meta.options.variants.join(", ")
        );
        let _ = writeln!(
            out,
            "  passed {}, failed {}, skipped {}, total {} ({:.2}%, {:.2}% excluding skips)",
            s.passed, s.failed, s.skipped, s.total, s.pass_rate_pct, s.pass_rate_excluding_skips_pct
        );
        if let Some(err) = &self.meta.fatal_error {
            let _ = writeln!(out, "  FATAL: {err}");
        }

        let _ = writeln!(out);
        for file in &self.files {
            let counts = &file.summary;
            match &file.file_error {
                Some(err) => {
                    let _ = writeln!(out, "{}: ERROR {err}", file.file_name);
                }
                None => {
                    let _ = writeln!(
                        out,
                        "{}: {}/{} passed, {} failed, {} skipped",
                        file.file_name, counts.passed, counts.total, counts.failed, counts.skipped
                    );
                }
            }
        }

        if !self.failures.is_empty() {
            let _ = writeln!(out, "\nFailures:");
            for failure in &self.failures {
                let _ = writeln!(out, "  {failure}");
            }
        }
        out
    }
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[test]
fn test_summary_rates() {
    let mut summary = Summary::default();
    assert_eq!(summary.pass_rate_pct, 0.0);
    summary.record(CaseStatus::Pass);
    summary.record(CaseStatus::Skip);
    summary.record(CaseStatus::Fail);
    assert_eq!(summary.total, 3);
    assert_eq!(summary.pass_rate_pct, 33.33);
    assert_eq!(summary.pass_rate_excluding_skips_pct, 50.0);

    let mut skips = Summary::default();
    skips.record(CaseStatus::Skip);
    assert_eq!(skips.pass_rate_excluding_skips_pct, 0.0);
}

#[test]
fn test_run_report() {
    let mut report = RunReport::new(&RunOptions::new("fixtures"));

    let mut file = FileReport::new("add.https.any.js");
    file.selected_tests = 2;
    file.push(CaseReport::passed("add a", "cpu", Duration::from_millis(2)));
    file.push(CaseReport::failed(
        "add b",
        "cpu",
        "Missing output 'y'".into(),
        Duration::from_millis(3),
    ));
    report.push_file(file);

    let mut broken = FileReport::new("relu.https.any.js");
    broken.file_error = Some("No top-level array declaration found".into());
    report.push_file(broken);
    report.finish();

    assert!(!report.succeeded());
    assert_eq!(
        report.failures,
        vec![
            "add.https.any.js :: add b [cpu]: Missing output 'y'".to_string(),
            "relu.https.any.js: No top-level array declaration found".to_string(),
        ]
    );

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["summary"]["passRatePct"], 50.0);
    assert_eq!(json["files"][0]["selectedTests"], 2);
    assert_eq!(json["files"][0]["cases"][0]["status"], "pass");
    assert_eq!(json["files"][0]["cases"][0].get("error"), None);
    assert_eq!(json["files"][1]["fileError"], "No top-level array declaration found");
    assert!(json["meta"].get("fatalError").is_none());
    assert!(chrono::DateTime::parse_from_rfc3339(json["meta"]["endedAt"].as_str().unwrap()).is_ok());

    let mut clean = RunReport::new(&RunOptions::new("fixtures"));
    let mut broken = FileReport::new("relu.https.any.js");
    broken.file_error = Some("No top-level array declaration found".into());
    clean.push_file(broken);
    assert!(clean.succeeded());
    assert_eq!(clean.failures.len(), 1);
    clean.set_fatal_error("Backend is gone: killed".into());
    assert!(!clean.succeeded());

    let text = report.render_text();
    assert!(text.contains("passed 1, failed 1, skipped 0, total 2 (50.00%, 50.00% excluding skips)"));
    assert!(text.contains("relu.https.any.js: ERROR No top-level array declaration found"));
}
