use std::{collections::BTreeSet, path::PathBuf, time::Duration};

use serde::Serialize;

pub use wptnn_bridge::BackendCommand;

use crate::classify::DEFAULT_UNIMPLEMENTED_OPERATORS;

pub const DEFAULT_VARIANT: &str = "cpu";
pub const DEFAULT_EXTRACTION_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything that shapes a run. Serialized verbatim into the report.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOptions {
    pub fixtures_dir: PathBuf,
    pub backend: Option<BackendCommand>,
    pub op_filter: Option<String>,
    pub file_filter: Option<String>,
    pub max_tests: Option<usize>,
    pub max_files: Option<usize>,
    pub variants: Vec<String>,
    pub skip_unimplemented: bool,
    pub unimplemented_operators: BTreeSet<String>,
    pub stop_on_fail: bool,
    pub extraction_timeout_ms: u64,
}

impl RunOptions {
    pub fn new(fixtures_dir: impl Into<PathBuf>) -> Self {
        Self {
            fixtures_dir: fixtures_dir.into(),
            backend: None,
            op_filter: None,
            file_filter: None,
            max_tests: None,
            max_files: None,
            variants: vec![DEFAULT_VARIANT.to_string()],
            skip_unimplemented: false,
            unimplemented_operators: DEFAULT_UNIMPLEMENTED_OPERATORS
                .iter()
                .map(|op| op.to_string())
                .collect(),
            stop_on_fail: false,
            extraction_timeout_ms: DEFAULT_EXTRACTION_TIMEOUT.as_millis() as u64,
        }
    }

    pub fn with_backend(mut self, backend: BackendCommand) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn with_op_filter(mut self, op: impl Into<String>) -> Self {
        self.op_filter = Some(op.into());
        self
    }

    pub fn with_file_filter(mut self, file: impl Into<String>) -> Self {
        self.file_filter = Some(file.into());
        self
    }

    pub fn with_max_tests(mut self, max_tests: usize) -> Self {
        self.max_tests = Some(max_tests);
        self
    }

    pub fn with_max_files(mut self, max_files: usize) -> Self {
        self.max_files = Some(max_files);
        self
    }

    /// Ignored when `variants` is empty.
    pub fn with_variants(mut self, variants: impl IntoIterator<Item = impl Into<String>>) -> Self {
        let variants = variants.into_iter().map(Into::into).collect::<Vec<_>>();
        if !variants.is_empty() {
            self.variants = variants;
        }
        self
    }

    pub fn with_skip_unimplemented(mut self, skip: bool) -> Self {
        self.skip_unimplemented = skip;
        self
    }

    pub fn with_unimplemented_operators(
        mut self,
        ops: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.unimplemented_operators = ops.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_stop_on_fail(mut self, stop: bool) -> Self {
        self.stop_on_fail = stop;
        self
    }

    pub fn with_extraction_timeout(mut self, timeout: Duration) -> Self {
        self.extraction_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn extraction_timeout(&self) -> Duration {
        Duration::from_millis(self.extraction_timeout_ms)
    }
}

#[test]
fn test_run_options() {
    let options = RunOptions::new("/tmp/webnn")
        .with_variants(Vec::<String>::new())
        .with_max_tests(3)
        .with_extraction_timeout(Duration::from_millis(250));
    assert_eq!(options.variants, vec!["cpu".to_string()]);
    assert_eq!(options.extraction_timeout(), Duration::from_millis(250));

    let json = serde_json::to_value(
        options
            .with_variants(["cpu", "gpu"])
            .with_backend(BackendCommand::new("/usr/bin/worker")),
    )
    .unwrap();
    assert_eq!(json["variants"], serde_json::json!(["cpu", "gpu"]));
    assert_eq!(json["maxTests"], 3);
    assert_eq!(json["extractionTimeoutMs"], 250);
    assert_eq!(json["backend"]["program"], "/usr/bin/worker");
}
