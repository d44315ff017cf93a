use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::{
    node::{Argument, OperatorNode},
    normalize::NormalizeError,
};

/// A tensor declaration before normalization. The data type is kept as
/// written so that unsupported types can be classified instead of rejected.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorResource {
    pub data_type: String,
    pub shape: Vec<usize>,
    pub data: Option<Value>,
    pub constant: bool,
}

/// Graph description shared by the builder and the fixture reader; the input
/// of [`normalize`](crate::normalize::normalize).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphResources {
    pub inputs: BTreeMap<String, TensorResource>,
    pub operators: Vec<OperatorNode>,
    pub expected_outputs: BTreeMap<String, TensorResource>,
    /// Names exported as graph outputs.
    pub outputs: Vec<String>,
}

impl GraphResources {
    /// Reads the `graph` object of a fixture test case:
    ///
    /// ```json
    /// {
    ///   "inputs": {"x": {"data": [1, 2], "descriptor": {"shape": [2], "dataType": "float32"}}},
    ///   "operators": [{"name": "relu", "arguments": [{"input": "x"}], "outputs": "y"}],
    ///   "expectedOutputs": {"y": {"data": [1, 2], "descriptor": {"shape": [2], "dataType": "float32"}}}
    /// }
    /// ```
    pub fn from_fixture(graph: &Value) -> Result<Self, NormalizeError> {
        let graph = graph
            .as_object()
            .ok_or_else(|| NormalizeError::InvalidFixture("graph must be an object".into()))?;

        let inputs = match graph.get("inputs") {
            Some(inputs) => tensor_resources(inputs, "inputs")?,
            None => BTreeMap::new(),
        };
        let expected_outputs = match graph.get("expectedOutputs") {
            Some(outputs) => tensor_resources(outputs, "expectedOutputs")?,
            None => BTreeMap::new(),
        };

        let operators = match graph.get("operators") {
            Some(Value::Array(ops)) => ops.iter().map(operator_node).collect::<Result<_, _>>()?,
            Some(op @ Value::Object(_)) => vec![operator_node(op)?],
            Some(_) => {
                return Err(NormalizeError::InvalidFixture(
                    "operators must be an array".into(),
                ))
            }
            None => Vec::new(),
        };

        let outputs = expected_outputs.keys().cloned().collect();
        Ok(Self {
            inputs,
            operators,
            expected_outputs,
            outputs,
        })
    }

    /// Every data type named by an input or an expected output.
    pub fn data_types(&self) -> impl Iterator<Item = &str> {
        self.inputs
            .values()
            .chain(self.expected_outputs.values())
            .map(|t| t.data_type.as_str())
    }

    pub fn operator_names(&self) -> impl Iterator<Item = &str> {
        self.operators.iter().map(|op| op.op.as_str())
    }

    pub fn uses_operator(&self, name: &str) -> bool {
        self.operator_names().any(|op| op == name)
    }
}

fn tensor_resources(
    value: &Value,
    what: &'static str,
) -> Result<BTreeMap<String, TensorResource>, NormalizeError> {
    let map = value
        .as_object()
        .ok_or_else(|| NormalizeError::InvalidFixture(format!("{what} must be an object").into()))?;
    map.iter()
        .map(|(name, v)| Ok((name.clone(), tensor_resource(name, v)?)))
        .collect()
}

fn tensor_resource(name: &str, value: &Value) -> Result<TensorResource, NormalizeError> {
    let invalid = |msg: &str| NormalizeError::InvalidFixture(format!("'{name}': {msg}").into());

    let descriptor = value
        .get("descriptor")
        .and_then(Value::as_object)
        .ok_or_else(|| invalid("missing descriptor"))?;
    let data_type = descriptor
        .get("dataType")
        .and_then(Value::as_str)
        .ok_or_else(|| invalid("missing descriptor.dataType"))?
        .to_string();
    let shape = descriptor
        .get("shape")
        .or_else(|| descriptor.get("dimensions"))
        .and_then(Value::as_array)
        .ok_or_else(|| invalid("missing descriptor.shape"))?
        .iter()
        .map(|dim| {
            dim.as_u64()
                .map(|d| d as usize)
                .ok_or_else(|| invalid("shape dimensions must be non-negative integers"))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(TensorResource {
        data_type,
        shape,
        data: value.get("data").cloned(),
        constant: value
            .get("constant")
            .and_then(Value::as_bool)
            .unwrap_or(false),
    })
}

fn operator_node(value: &Value) -> Result<OperatorNode, NormalizeError> {
    let op = value
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| NormalizeError::InvalidFixture("operator without a name".into()))?;
    let mut node = OperatorNode::new(op);

    match value.get("arguments") {
        Some(Value::Array(args)) => {
            for arg in args {
                let arg: &Map<String, Value> = arg.as_object().ok_or_else(|| {
                    NormalizeError::InvalidFixture(
                        format!("'{op}': arguments must be objects").into(),
                    )
                })?;
                for (key, v) in arg {
                    node = node.with_arg(Argument::Keyed(key.clone(), v.clone()));
                }
            }
        }
        Some(Value::Null) | None => {}
        Some(_) => {
            return Err(NormalizeError::InvalidFixture(
                format!("'{op}': arguments must be an array").into(),
            ))
        }
    }

    match value.get("outputs") {
        Some(Value::String(name)) => node = node.with_out(name.clone()),
        Some(Value::Array(names)) => {
            for name in names {
                let name = name.as_str().ok_or_else(|| {
                    NormalizeError::InvalidFixture(
                        format!("'{op}': output names must be strings").into(),
                    )
                })?;
                node = node.with_out(name);
            }
        }
        _ => {
            return Err(NormalizeError::InvalidFixture(
                format!("'{op}': missing outputs").into(),
            ))
        }
    }

    Ok(node)
}

#[test]
fn test_from_fixture() {
    let graph = serde_json::json!({
        "inputs": {
            "a": {"data": [1, 2], "descriptor": {"shape": [2], "dataType": "float32"}},
            "b": {"data": [3, 4], "descriptor": {"dimensions": [2], "dataType": "float32"}, "constant": true}
        },
        "operators": [
            {"name": "add", "arguments": [{"a": "a"}, {"b": "b"}], "outputs": "sum"},
            {"name": "split", "arguments": [{"input": "sum"}, {"splits": 2}], "outputs": ["s0", "s1"]}
        ],
        "expectedOutputs": {
            "s0": {"data": [4], "descriptor": {"shape": [1], "dataType": "float32"}},
            "s1": {"data": [6], "descriptor": {"shape": [1], "dataType": "float32"}}
        }
    });
    let res = GraphResources::from_fixture(&graph).unwrap();
    assert_eq!(res.inputs.len(), 2);
    assert!(res.inputs["b"].constant);
    assert_eq!(res.inputs["b"].shape, vec![2]);
    assert_eq!(res.operators[1].outputs, vec!["s0".to_string(), "s1".to_string()]);
    assert_eq!(res.outputs, vec!["s0".to_string(), "s1".to_string()]);
    assert!(res.uses_operator("split"));
    assert_eq!(res.data_types().count(), 4);
}

#[test]
fn test_from_fixture_rejects_bad_shapes() {
    let graph = serde_json::json!({
        "inputs": {"a": {"data": [1], "descriptor": {"shape": [-1], "dataType": "float32"}}},
        "operators": []
    });
    assert!(matches!(
        GraphResources::from_fixture(&graph),
        Err(NormalizeError::InvalidFixture(_))
    ));
}
