use std::time::Duration;

use serde_json::Value;
use wptnn_core::resources::GraphResources;

use crate::{eval::Script, ExtractionError};

/// One entry of a fixture's test array.
#[derive(Debug, Clone, PartialEq)]
pub struct TestCase {
    pub name: String,
    pub resources: GraphResources,
    /// The `graph` object as written in the fixture.
    pub graph: Value,
}

impl TestCase {
    pub fn from_value(index: usize, value: &Value) -> Result<Self, ExtractionError> {
        let invalid = |message: String| ExtractionError::InvalidCase { index, message };

        let name = value
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid("missing 'name'".into()))?;
        let graph = value
            .get("graph")
            .ok_or_else(|| invalid(format!("'{name}' has no 'graph'")))?;
        let resources =
            GraphResources::from_fixture(graph).map_err(|err| invalid(format!("'{name}': {err}")))?;

        Ok(Self {
            name: name.to_string(),
            resources,
            graph: graph.clone(),
        })
    }
}

/// Extracts every test case of a fixture script, spending at most `budget`
/// on locating and evaluating the test array.
pub fn extract_test_cases(source: &str, budget: Duration) -> Result<Vec<TestCase>, ExtractionError> {
    let export = Script::new(source, budget).evaluate_export()?;
    let cases = export
        .value
        .as_array()
        .ok_or_else(|| ExtractionError::NotAnArray(export.name.clone()))?;
    log::debug!("'{}' holds {} test cases", export.name, cases.len());

    cases
        .iter()
        .enumerate()
        .map(|(index, value)| TestCase::from_value(index, value))
        .collect()
}

#[cfg(test)]
const FIXTURE: &str = r#"// META: title=test that WebNN API add operation works
// META: global=window,dedicatedworker
// META: variant=?cpu
// META: script=../resources/utils.js
// META: timeout=long

'use strict';

// https://www.w3.org/TR/webnn/#api-mlgraphbuilder-binary
// MLOperand add(MLOperand a, MLOperand b);

const getAddPrecisionTolerance = (graphResources) => {
  return {metricType: 'ULP', value: 1};
};

const addTests = [
  {
    'name': 'add float32 1D constant tensors',
    'graph': {
      'inputs': {
        'inputA': {
          'data': [94.23322296142578, -10.962236404418945],
          'descriptor': {shape: [2], dataType: 'float32'},
          'constant': true
        },
        'inputB': {
          'data': [-26.556602478027344, 40.98426818847656],
          'descriptor': {shape: [2], dataType: 'float32'},
          'constant': true
        }
      },
      'operators': [{
        'name': 'add',
        'arguments': [{'a': 'inputA'}, {'b': 'inputB'}],
        'outputs': 'output'
      }],
      'expectedOutputs': {
        'output': {
          'data': [67.6766128540039, 30.022031784057617],
          'descriptor': {shape: [2], dataType: 'float32'}
        }
      }
    }
  },
  {
    'name': 'add int64 scalars',
    'graph': {
      'inputs': {
        'a': {'data': [2n ** 40n], 'descriptor': {shape: [], dataType: 'int64'}},
        'b': {'data': [-1n], 'descriptor': {shape: [], dataType: 'int64'}},
      },
      'operators': [{
        'name': 'add',
        'arguments': [{'a': 'a'}, {'b': 'b'}],
        'outputs': 'output'
      }],
      'expectedOutputs': {
        'output': {'data': [1099511627775n], 'descriptor': {shape: [], dataType: 'int64'}}
      }
    }
  },
];

if (navigator.ml) {
  addTests.filter(isTargetTest).forEach((test) => {
    webnn_conformance_test(
        buildAndExecuteGraph, getAddPrecisionTolerance, test);
  });
} else {
  test(() => assert_implements(navigator.ml, 'missing navigator.ml'));
}
"#;

#[test]
fn extract_fixture() {
    use serde_json::json;

    let cases = extract_test_cases(FIXTURE, Duration::from_secs(5)).unwrap();
    assert_eq!(cases.len(), 2);

    let add = &cases[0];
    assert_eq!(add.name, "add float32 1D constant tensors");
    assert_eq!(add.resources.outputs, vec!["output".to_string()]);
    assert!(add.resources.inputs["inputB"].constant);
    assert_eq!(
        add.graph["inputs"]["inputA"]["data"],
        json!([94.23322296142578, -10.962236404418945])
    );

    let int64 = &cases[1];
    assert_eq!(
        int64.resources.inputs["a"].data,
        Some(json!(["1099511627776"]))
    );
    assert_eq!(int64.resources.inputs["a"].shape, Vec::<usize>::new());
    assert!(int64.resources.uses_operator("add"));
}

#[test]
fn extract_rejects_malformed_cases() {
    let src = "const tests = [{name: 'ok', graph: {}}, {graph: {}}];\nrun(tests);";
    let err = extract_test_cases(src, Duration::from_secs(5)).unwrap_err();
    insta::assert_snapshot!(err.to_string(), @"Test case #1: missing 'name'");

    let src = "const tests = [{name: 'no graph'}];\nrun(tests);";
    assert_eq!(
        extract_test_cases(src, Duration::from_secs(5)),
        Err(ExtractionError::InvalidCase {
            index: 0,
            message: "'no graph' has no 'graph'".into()
        })
    );

    let src = "const tests = [{name: 'bad', graph: {inputs: 1}}];\nrun(tests);";
    assert!(matches!(
        extract_test_cases(src, Duration::from_secs(5)),
        Err(ExtractionError::InvalidCase { index: 0, .. })
    ));
}

#[test]
fn extract_empty_array() {
    let src = "const tests = [];\ntests.forEach(run);";
    assert_eq!(extract_test_cases(src, Duration::from_secs(5)), Ok(vec![]));
}
