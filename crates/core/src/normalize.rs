use std::{borrow::Cow, collections::BTreeMap};

use rustc_hash::FxHashSet;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::{
    graph::{GraphDocument, GraphNode},
    node::{Argument, OperatorNode},
    resources::{GraphResources, TensorResource},
    tensor::{
        DataType, RuntimeTensor, TensorDescriptor, TensorError, UnknownDataType,
        MAX_SAFE_INTEGER,
    },
};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum NormalizeError {
    #[error("{0}")]
    UnknownDataType(#[from] UnknownDataType),

    #[error("Tensor '{name}': {source}")]
    Tensor {
        name: String,
        #[source]
        source: TensorError,
    },

    #[error("Invalid fixture: {0}")]
    InvalidFixture(Cow<'static, str>),
}

/// Everything a single execution request needs: the canonical document, the
/// runtime inputs (free inputs and constant payloads) and the expected outputs.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedGraph {
    pub document: GraphDocument,
    pub inputs: BTreeMap<String, RuntimeTensor>,
    pub expected_outputs: BTreeMap<String, RuntimeTensor>,
}

impl NormalizedGraph {
    /// The operator producing the graph output `name`.
    pub fn operator_for_output(&self, name: &str) -> Option<&str> {
        let operand = self
            .document
            .outputs
            .get(name)
            .map_or(name, |operand| operand.as_str());
        self.document
            .producer_of(operand)
            .map(|node| node.op.as_str())
    }
}

pub fn normalize(resources: &GraphResources) -> Result<NormalizedGraph, NormalizeError> {
    let mut document = GraphDocument::default();
    let mut inputs = BTreeMap::new();

    for (name, resource) in &resources.inputs {
        let descriptor = descriptor_of(resource)?;
        document.inputs.insert(name.clone(), descriptor.clone());
        // Inputs without a payload are declared only.
        if let Some(data) = &resource.data {
            inputs.insert(name.clone(), runtime_tensor(name, descriptor, data)?);
        }
    }

    let mut expected_outputs = BTreeMap::new();
    for (name, resource) in &resources.expected_outputs {
        let data = resource.data.as_ref().ok_or_else(|| {
            NormalizeError::InvalidFixture(format!("expected output '{name}' has no data").into())
        })?;
        expected_outputs.insert(
            name.clone(),
            runtime_tensor(name, descriptor_of(resource)?, data)?,
        );
    }

    let known: FxHashSet<&str> = resources
        .inputs
        .keys()
        .map(String::as_str)
        .chain(
            resources
                .operators
                .iter()
                .flat_map(|op| op.outputs.iter().map(String::as_str)),
        )
        .collect();

    for (index, op) in resources.operators.iter().enumerate() {
        document.add_node(graph_node(index, op, &known));
    }

    let outputs = if resources.outputs.is_empty() {
        resources.expected_outputs.keys().cloned().collect::<Vec<_>>()
    } else {
        resources.outputs.clone()
    };
    document.outputs = outputs
        .into_iter()
        .map(|name| (name.clone(), name))
        .collect();

    log::debug!(
        "normalized graph: {} inputs, {} nodes, {} outputs",
        document.inputs.len(),
        document.nodes.len(),
        document.outputs.len()
    );

    Ok(NormalizedGraph {
        document,
        inputs,
        expected_outputs,
    })
}

fn graph_node(index: usize, op: &OperatorNode, known: &FxHashSet<&str>) -> GraphNode {
    let is_operand = |v: &Value| v.as_str().map_or(false, |s| known.contains(s));

    let mut inputs = Vec::new();
    let mut options = Map::new();
    for arg in &op.arguments {
        match arg {
            Argument::Operand(name) => inputs.push(name.clone()),
            Argument::Operands(names) => inputs.extend(names.iter().cloned()),
            Argument::Options(map) => merge_options(&mut options, map),
            Argument::Keyed(key, Value::Object(map)) if key == "options" => {
                merge_options(&mut options, map)
            }
            Argument::Keyed(_, v) if is_operand(v) => {
                inputs.extend(v.as_str().map(str::to_string))
            }
            Argument::Keyed(_, Value::Array(vs)) if !vs.is_empty() && vs.iter().all(is_operand) => {
                inputs.extend(vs.iter().filter_map(Value::as_str).map(str::to_string))
            }
            Argument::Keyed(_, Value::Null) => {}
            Argument::Keyed(key, v) => {
                options.insert(key.clone(), normalize_option_value(v));
            }
        }
    }

    GraphNode {
        id: GraphDocument::node_id(index),
        op: op.op.clone(),
        inputs,
        options,
        outputs: op.outputs.clone(),
    }
}

fn merge_options(options: &mut Map<String, Value>, map: &Map<String, Value>) {
    for (key, v) in map {
        if !v.is_null() {
            options.insert(key.clone(), normalize_option_value(v));
        }
    }
}

/// Normalizes an option value recursively. Integers a double cannot hold
/// exactly become decimal strings and `null` map entries are dropped.
pub fn normalize_option_value(value: &Value) -> Value {
    match value {
        Value::Number(n) => {
            let unsafe_int = match (n.as_i64(), n.as_u64()) {
                (Some(i), _) => !(-MAX_SAFE_INTEGER..=MAX_SAFE_INTEGER).contains(&i),
                (None, Some(_)) => true,
                (None, None) => false,
            };
            if unsafe_int {
                Value::String(n.to_string())
            } else {
                value.clone()
            }
        }
        Value::Array(vs) => Value::Array(vs.iter().map(normalize_option_value).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k.clone(), normalize_option_value(v)))
                .collect(),
        ),
        _ => value.clone(),
    }
}

/// Flattens nested arrays into one element list. A scalar becomes a single element.
pub fn flatten_data(value: &Value) -> Vec<Value> {
    fn walk(value: &Value, out: &mut Vec<Value>) {
        match value {
            Value::Array(vs) => vs.iter().for_each(|v| walk(v, out)),
            _ => out.push(value.clone()),
        }
    }

    let mut out = Vec::new();
    walk(value, &mut out);
    out
}

fn descriptor_of(resource: &TensorResource) -> Result<TensorDescriptor, NormalizeError> {
    let data_type = resource.data_type.parse::<DataType>()?;
    Ok(TensorDescriptor::new(data_type, resource.shape.clone()))
}

fn runtime_tensor(
    name: &str,
    descriptor: TensorDescriptor,
    data: &Value,
) -> Result<RuntimeTensor, NormalizeError> {
    let tensor_error = |source| NormalizeError::Tensor {
        name: name.to_string(),
        source,
    };
    let mut elems = flatten_data(data);
    let count = descriptor.checked_element_count().map_err(tensor_error)?;
    if elems.len() == 1 && count != 1 {
        elems = vec![elems[0].clone(); count];
    }
    RuntimeTensor::new(descriptor, elems).map_err(tensor_error)
}

#[cfg(test)]
fn fixture(graph: Value) -> GraphResources {
    GraphResources::from_fixture(&graph).unwrap()
}

#[test]
fn normalize_fixture_graph() {
    use serde_json::json;

    let res = fixture(json!({
        "inputs": {
            "x": {"data": [[1, 2], [3, 4]], "descriptor": {"shape": [2, 2], "dataType": "float32"}},
            "w": {"data": 0.5, "descriptor": {"shape": [2, 2], "dataType": "float32"}, "constant": true}
        },
        "operators": [
            {"name": "mul", "arguments": [{"a": "x"}, {"b": "w"}], "outputs": "m"},
            {"name": "concat", "arguments": [{"inputs": ["m", "x"]}, {"axis": 0}], "outputs": "y"},
            {"name": "transpose", "arguments": [{"input": "y"}, {"options": {"permutation": [1, 0], "label": null}}], "outputs": "out"}
        ],
        "expectedOutputs": {
            "out": {"data": [0, 0, 0, 0, 0, 0, 0, 0], "descriptor": {"shape": [2, 4], "dataType": "float32"}}
        }
    }));
    let g = normalize(&res).unwrap();
    let doc = &g.document;

    assert!(doc.has_canonical_ids());
    assert!(doc.constants.is_empty());
    assert_eq!(doc.inputs.len(), 2);
    assert_eq!(g.inputs["w"].data, vec![Value::from(0.5); 4]);
    assert_eq!(g.inputs["x"].data.len(), 4);

    assert_eq!(doc.nodes[0].inputs, vec!["x", "w"]);
    assert_eq!(doc.nodes[1].inputs, vec!["m", "x"]);
    assert_eq!(doc.nodes[1].options["axis"], json!(0));
    assert_eq!(doc.nodes[2].options, json!({"permutation": [1, 0]}).as_object().unwrap().clone());
    assert_eq!(doc.outputs["out"], "out");
    assert_eq!(g.operator_for_output("out"), Some("transpose"));
}

#[test]
fn normalize_int64_tensors_and_options() {
    use serde_json::json;

    let res = fixture(json!({
        "inputs": {
            "x": {"data": [1, "9007199254740993"], "descriptor": {"shape": [2], "dataType": "int64"}}
        },
        "operators": [
            {"name": "clamp", "arguments": [{"input": "x"}, {"options": {"minValue": 9007199254740993u64, "maxValue": 3}}], "outputs": "y"}
        ],
        "expectedOutputs": {
            "y": {"data": ["1", "3"], "descriptor": {"shape": [2], "dataType": "int64"}}
        }
    }));
    let g = normalize(&res).unwrap();
    assert_eq!(g.inputs["x"].data, vec![json!("1"), json!("9007199254740993")]);
    let options = &g.document.nodes[0].options;
    assert_eq!(options["minValue"], json!("9007199254740993"));
    assert_eq!(options["maxValue"], json!(3));
}

#[test]
fn normalize_rejects_bad_payloads() {
    use serde_json::json;

    let res = fixture(json!({
        "inputs": {"x": {"data": [1, 2, 3], "descriptor": {"shape": [2, 2], "dataType": "float32"}}},
        "operators": [{"name": "relu", "arguments": [{"input": "x"}], "outputs": "y"}]
    }));
    assert!(matches!(
        normalize(&res),
        Err(NormalizeError::Tensor { ref name, source: TensorError::DataLength { .. } }) if name == "x"
    ));

    let res = fixture(json!({
        "inputs": {"x": {"data": [1], "descriptor": {"shape": [1], "dataType": "bfloat16"}}},
        "operators": []
    }));
    assert!(matches!(
        normalize(&res),
        Err(NormalizeError::UnknownDataType(_))
    ));

    for shape in [json!([4294967296u64, 4294967296u64]), json!([1 << 20, 1 << 20])] {
        let res = fixture(json!({
            "inputs": {"x": {"data": [1], "descriptor": {"shape": shape, "dataType": "float32"}}},
            "operators": [{"name": "relu", "arguments": [{"input": "x"}], "outputs": "y"}]
        }));
        assert!(matches!(
            normalize(&res),
            Err(NormalizeError::Tensor { ref name, source: TensorError::TooLarge(_) }) if name == "x"
        ));
    }
}

#[test]
fn test_normalize_option_value() {
    use serde_json::json;

    let v = json!({"a": null, "b": [1, -9007199254740992i64, {"c": null, "d": 2.5}], "e": "s"});
    assert_eq!(
        normalize_option_value(&v),
        json!({"b": [1, "-9007199254740992", {"d": 2.5}], "e": "s"})
    );
    assert_eq!(flatten_data(&json!([[1], [2, [3]]])), vec![json!(1), json!(2), json!(3)]);
    assert_eq!(flatten_data(&json!(4)), vec![json!(4)]);
}
