use std::fmt;

use wptnn_core::{resources::GraphResources, tensor::DataType};

use crate::options::RunOptions;

/// Operators the reference backend does not convert yet.
pub const DEFAULT_UNIMPLEMENTED_OPERATORS: &[&str] = &[
    "gru",
    "gruCell",
    "lstm",
    "lstmCell",
    "scatterElements",
    "scatterND",
    "cumulativeSum",
    "reverse",
];

/// Why a test case is not executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    UnsupportedDataType(String),
    UnimplementedOperator(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::UnsupportedDataType(ty) => write!(f, "unsupported data type '{ty}'"),
            SkipReason::UnimplementedOperator(op) => {
                write!(f, "operator '{op}' is not implemented by the backend")
            }
        }
    }
}

/// Decides whether a case can run at all. `None` means it should be executed.
pub fn classify(resources: &GraphResources, options: &RunOptions) -> Option<SkipReason> {
    if let Some(ty) = resources
        .data_types()
        .find(|ty| ty.parse::<DataType>().is_err())
    {
        return Some(SkipReason::UnsupportedDataType(ty.to_string()));
    }

    if options.skip_unimplemented {
        if let Some(op) = resources
            .operator_names()
            .find(|op| options.unimplemented_operators.contains(*op))
        {
            return Some(SkipReason::UnimplementedOperator(op.to_string()));
        }
    }

    None
}

#[test]
fn test_classify() {
    use serde_json::json;

    let graph = |ty: &str, op: &str| {
        GraphResources::from_fixture(&json!({
            "inputs": {"x": {"data": [1], "descriptor": {"shape": [1], "dataType": ty}}},
            "operators": [{"name": op, "arguments": [{"input": "x"}], "outputs": "y"}],
            "expectedOutputs": {"y": {"data": [1], "descriptor": {"shape": [1], "dataType": "float32"}}}
        }))
        .unwrap()
    };

    let options = RunOptions::new("fixtures");
    assert_eq!(classify(&graph("float32", "relu"), &options), None);
    assert_eq!(
        classify(&graph("float64", "relu"), &options),
        Some(SkipReason::UnsupportedDataType("float64".into()))
    );

    // Only checked when enabled.
    assert_eq!(classify(&graph("float32", "lstm"), &options), None);
    let options = options.with_skip_unimplemented(true);
    assert_eq!(
        classify(&graph("float32", "lstm"), &options),
        Some(SkipReason::UnimplementedOperator("lstm".into()))
    );
    let options = options.with_unimplemented_operators(["relu"]);
    assert!(classify(&graph("int8", "relu"), &options).is_some());
    assert!(classify(&graph("int8", "lstm"), &options).is_none());
}
