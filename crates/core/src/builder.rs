use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::{
    node::{Argument, OperatorNode},
    normalize::{normalize, NormalizeError, NormalizedGraph},
    op::is_known_operator,
    resources::{GraphResources, TensorResource},
    tensor::{RuntimeTensor, TensorDescriptor, TensorError},
    value::{Operand, OperandArena, OperandId, OperandKind},
};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BuildError {
    #[error("Unknown operator '{0}'")]
    UnknownOperator(String),

    #[error("Operand name '{0}' is already in use")]
    DuplicateName(String),

    #[error("Operand '{0}' is not produced by an operator")]
    NotAnOperatorOutput(String),

    #[error("Operand '{0}' is named more than once")]
    DuplicateOutput(String),

    #[error("Operand does not belong to this builder")]
    ForeignOperand,

    #[error("Constant: {0}")]
    Tensor(#[from] TensorError),

    #[error("{0}")]
    Normalize(#[from] NormalizeError),
}

/// One argument of [`GraphBuilder::invoke`].
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Operand(OperandId),
    Operands(Vec<OperandId>),
    Options(Map<String, Value>),
}

impl From<OperandId> for Arg {
    fn from(id: OperandId) -> Self {
        Arg::Operand(id)
    }
}

impl From<Vec<OperandId>> for Arg {
    fn from(ids: Vec<OperandId>) -> Self {
        Arg::Operands(ids)
    }
}

impl From<&[OperandId]> for Arg {
    fn from(ids: &[OperandId]) -> Self {
        Arg::Operands(ids.to_vec())
    }
}

impl From<Map<String, Value>> for Arg {
    fn from(options: Map<String, Value>) -> Self {
        Arg::Options(options)
    }
}

/// Records operator invocations on symbolic operands and emits a
/// [`GraphDocument`](crate::graph::GraphDocument).
///
/// ```
/// use wptnn_core::{builder::GraphBuilder, tensor::{DataType, TensorDescriptor}};
///
/// let mut b = GraphBuilder::new();
/// let x = b.input("x", TensorDescriptor::new(DataType::Float32, vec![2])).unwrap();
/// let y = b.relu(x).unwrap();
/// let graph = b.build(&[("y", y)]).unwrap();
/// assert_eq!(graph.document.nodes[0].outputs, vec!["y".to_string()]);
/// ```
#[derive(Debug, Default)]
pub struct GraphBuilder {
    operands: OperandArena,
    names: FxHashSet<String>,
    resources: GraphResources,
    constant_count: usize,
    op_counts: FxHashMap<String, usize>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn operand(&self, id: OperandId) -> Option<&Operand> {
        self.operands.inner().get(id)
    }

    pub fn input(
        &mut self,
        name: impl Into<String>,
        descriptor: TensorDescriptor,
    ) -> Result<OperandId, BuildError> {
        let name = name.into();
        if !self.names.insert(name.clone()) {
            return Err(BuildError::DuplicateName(name));
        }
        self.resources.inputs.insert(
            name.clone(),
            TensorResource {
                data_type: descriptor.data_type.to_string(),
                shape: descriptor.shape.clone(),
                data: None,
                constant: false,
            },
        );
        Ok(self.operands.new_input(name, descriptor))
    }

    pub fn constant(
        &mut self,
        descriptor: TensorDescriptor,
        data: Vec<Value>,
    ) -> Result<OperandId, BuildError> {
        let tensor = RuntimeTensor::new(descriptor, data)?;
        let name = loop {
            let name = format!("constant_{}", self.constant_count);
            self.constant_count += 1;
            if self.names.insert(name.clone()) {
                break name;
            }
        };
        self.resources.inputs.insert(
            name.clone(),
            TensorResource {
                data_type: tensor.descriptor.data_type.to_string(),
                shape: tensor.descriptor.shape.clone(),
                data: Some(Value::Array(tensor.data)),
                constant: true,
            },
        );
        Ok(self.operands.new_constant(name, tensor.descriptor))
    }

    /// Appends one `op` node and returns its (untyped) output operand.
    pub fn invoke(&mut self, op: &str, args: Vec<Arg>) -> Result<OperandId, BuildError> {
        if !is_known_operator(op) {
            return Err(BuildError::UnknownOperator(op.to_string()));
        }

        let mut node = OperatorNode::new(op);
        for arg in args {
            node = node.with_arg(match arg {
                Arg::Operand(id) => Argument::Operand(self.name_of(id)?),
                Arg::Operands(ids) => Argument::Operands(
                    ids.into_iter()
                        .map(|id| self.name_of(id))
                        .collect::<Result<_, _>>()?,
                ),
                Arg::Options(options) => Argument::Options(options),
            });
        }

        let name = self.fresh_name(op);
        self.resources.operators.push(node.with_out(name.clone()));
        Ok(self.operands.new_output(name))
    }

    /// Names the given operator outputs and emits the normalized graph.
    pub fn build(mut self, outputs: &[(&str, OperandId)]) -> Result<NormalizedGraph, BuildError> {
        let mut seen = FxHashSet::default();
        for &(name, id) in outputs {
            let operand = self
                .operands
                .inner()
                .get(id)
                .ok_or(BuildError::ForeignOperand)?;
            if operand.kind != OperandKind::Output {
                return Err(BuildError::NotAnOperatorOutput(operand.name.clone()));
            }
            if !seen.insert(id) {
                return Err(BuildError::DuplicateOutput(operand.name.clone()));
            }

            let old = operand.name.clone();
            if old != name {
                if !self.names.insert(name.to_string()) {
                    return Err(BuildError::DuplicateName(name.to_string()));
                }
                self.names.remove(&old);
                for node in &mut self.resources.operators {
                    node.rename_operand(&old, name);
                }
                self.operands[id].name = name.to_string();
            }
            self.resources.outputs.push(name.to_string());
        }

        Ok(normalize(&self.resources)?)
    }

    pub fn add(&mut self, a: OperandId, b: OperandId) -> Result<OperandId, BuildError> {
        self.invoke("add", vec![a.into(), b.into()])
    }

    pub fn sub(&mut self, a: OperandId, b: OperandId) -> Result<OperandId, BuildError> {
        self.invoke("sub", vec![a.into(), b.into()])
    }

    pub fn mul(&mut self, a: OperandId, b: OperandId) -> Result<OperandId, BuildError> {
        self.invoke("mul", vec![a.into(), b.into()])
    }

    pub fn div(&mut self, a: OperandId, b: OperandId) -> Result<OperandId, BuildError> {
        self.invoke("div", vec![a.into(), b.into()])
    }

    pub fn matmul(&mut self, a: OperandId, b: OperandId) -> Result<OperandId, BuildError> {
        self.invoke("matmul", vec![a.into(), b.into()])
    }

    pub fn relu(&mut self, x: OperandId) -> Result<OperandId, BuildError> {
        self.invoke("relu", vec![x.into()])
    }

    pub fn sigmoid(&mut self, x: OperandId) -> Result<OperandId, BuildError> {
        self.invoke("sigmoid", vec![x.into()])
    }

    pub fn tanh(&mut self, x: OperandId) -> Result<OperandId, BuildError> {
        self.invoke("tanh", vec![x.into()])
    }

    pub fn concat(&mut self, inputs: &[OperandId], axis: u32) -> Result<OperandId, BuildError> {
        let mut options = Map::new();
        options.insert("axis".into(), axis.into());
        self.invoke("concat", vec![inputs.into(), options.into()])
    }

    pub fn reshape(&mut self, x: OperandId, new_shape: &[usize]) -> Result<OperandId, BuildError> {
        let mut options = Map::new();
        options.insert("newShape".into(), new_shape.into());
        self.invoke("reshape", vec![x.into(), options.into()])
    }

    fn name_of(&self, id: OperandId) -> Result<String, BuildError> {
        self.operands
            .inner()
            .get(id)
            .map(|operand| operand.name.clone())
            .ok_or(BuildError::ForeignOperand)
    }

    fn fresh_name(&mut self, op: &str) -> String {
        let count = self.op_counts.entry(op.to_string()).or_insert(0);
        loop {
            let name = format!("{op}_{count}");
            *count += 1;
            if self.names.insert(name.clone()) {
                return name;
            }
        }
    }
}

#[cfg(test)]
fn f32_desc(shape: &[usize]) -> TensorDescriptor {
    TensorDescriptor::new(crate::tensor::DataType::Float32, shape)
}

#[test]
fn build_add_relu() {
    let mut b = GraphBuilder::new();
    let x = b.input("x", f32_desc(&[2])).unwrap();
    let c = b
        .constant(f32_desc(&[2]), vec![Value::from(1), Value::from(2)])
        .unwrap();
    let s = b.add(x, c).unwrap();
    let y = b.relu(s).unwrap();
    let graph = b.build(&[("out", y)]).unwrap();

    assert!(graph.inputs.contains_key("constant_0"));
    assert!(!graph.inputs.contains_key("x"));
    insta::assert_snapshot!(serde_json::to_string_pretty(&graph.document).unwrap(), @r###"
    {
      "format": "webnn-graph-json",
      "version": 2,
      "inputs": {
        "constant_0": {
          "dataType": "float32",
          "shape": [
            2
          ]
        },
        "x": {
          "dataType": "float32",
          "shape": [
            2
          ]
        }
      },
      "constants": {},
      "nodes": [
        {
          "id": "op_0",
          "op": "add",
          "inputs": [
            "x",
            "constant_0"
          ],
          "options": {},
          "outputs": [
            "add_0"
          ]
        },
        {
          "id": "op_1",
          "op": "relu",
          "inputs": [
            "add_0"
          ],
          "options": {},
          "outputs": [
            "out"
          ]
        }
      ],
      "outputs": {
        "out": "out"
      }
    }
    "###);
}

#[test]
fn build_renames_later_references() {
    let mut b = GraphBuilder::new();
    let x = b.input("x", f32_desc(&[1, 2])).unwrap();
    let y = b.input("y", f32_desc(&[1, 2])).unwrap();
    let m = b.mul(x, y).unwrap();
    let c = b.concat(&[m, x, m], 0).unwrap();
    let graph = b.build(&[("product", m), ("joined", c)]).unwrap();

    let nodes = &graph.document.nodes;
    assert_eq!(nodes[0].outputs, vec!["product".to_string()]);
    assert_eq!(nodes[1].inputs, vec!["product", "x", "product"]);
    assert_eq!(nodes[1].options["axis"], Value::from(0));
    assert_eq!(graph.document.outputs.len(), 2);
}

#[test]
fn build_errors() {
    let mut b = GraphBuilder::new();
    let x = b.input("x", f32_desc(&[2])).unwrap();
    assert_eq!(
        b.input("x", f32_desc(&[2])),
        Err(BuildError::DuplicateName("x".into()))
    );
    assert_eq!(
        b.invoke("frobnicate", vec![x.into()]),
        Err(BuildError::UnknownOperator("frobnicate".into()))
    );
    assert!(matches!(
        b.constant(f32_desc(&[2]), vec![Value::from(1)]),
        Err(BuildError::Tensor(TensorError::DataLength { .. }))
    ));

    let y = b.relu(x).unwrap();
    let z = b.relu(y).unwrap();
    assert_eq!(
        GraphBuilder::new().build(&[]).map(|g| g.document.nodes.len()),
        Ok(0)
    );

    let mut b2 = GraphBuilder::new();
    b2.input("other", f32_desc(&[2])).unwrap();
    assert_eq!(b2.invoke("relu", vec![x.into()]), Err(BuildError::ForeignOperand));

    let err = {
        let mut b = GraphBuilder::new();
        let x = b.input("x", f32_desc(&[2])).unwrap();
        b.build(&[("out", x)])
    };
    assert_eq!(err, Err(BuildError::NotAnOperatorOutput("x".into())));

    assert_eq!(
        b.build(&[("a", y), ("b", y), ("c", z)]),
        Err(BuildError::DuplicateOutput("a".into()))
    );
}

#[test]
fn build_rejects_clashing_output_names() {
    let mut b = GraphBuilder::new();
    let x = b.input("x", f32_desc(&[2])).unwrap();
    let y = b.relu(x).unwrap();
    assert_eq!(
        b.build(&[("x", y)]),
        Err(BuildError::DuplicateName("x".into()))
    );
}

#[test]
fn placeholder_names_avoid_user_names() {
    let mut b = GraphBuilder::new();
    let x = b.input("relu_0", f32_desc(&[2])).unwrap();
    let y = b.relu(x).unwrap();
    assert_eq!(b.operand(y).map(|o| o.name.as_str()), Some("relu_1"));
}
