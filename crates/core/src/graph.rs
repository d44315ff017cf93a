use std::collections::BTreeMap;

use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::tensor::TensorDescriptor;

pub const GRAPH_FORMAT: &str = "webnn-graph-json";
pub const GRAPH_VERSION: u32 = 2;

/// The canonical graph document shipped to the backend with every request.
///
/// Constants are declared in `inputs` exactly like free inputs and their
/// payload travels with the runtime inputs, so `constants` stays empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphDocument {
    pub format: String,
    pub version: u32,
    pub inputs: BTreeMap<String, TensorDescriptor>,
    #[serde(default)]
    pub constants: BTreeMap<String, TensorDescriptor>,
    pub nodes: Vec<GraphNode>,
    pub outputs: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    pub op: String,
    pub inputs: Vec<String>,
    #[serde(default)]
    pub options: Map<String, Value>,
    pub outputs: Vec<String>,
}

impl Default for GraphDocument {
    fn default() -> Self {
        Self {
            format: GRAPH_FORMAT.to_string(),
            version: GRAPH_VERSION,
            inputs: BTreeMap::new(),
            constants: BTreeMap::new(),
            nodes: Vec::new(),
            outputs: BTreeMap::new(),
        }
    }
}

impl GraphDocument {
    pub fn node_id(index: usize) -> String {
        format!("op_{index}")
    }

    pub fn add_node(&mut self, node: GraphNode) {
        self.nodes.push(node);
    }

    /// Returns the node producing the operand `name`, if any.
    pub fn producer_of(&self, name: &str) -> Option<&GraphNode> {
        self.nodes
            .iter()
            .find(|node| node.outputs.iter().any(|output| output == name))
    }

    pub fn operators(&self) -> FxHashSet<&str> {
        self.nodes.iter().map(|node| node.op.as_str()).collect()
    }

    /// Checks that node ids are exactly `op_0..op_{N-1}` in order.
    pub fn has_canonical_ids(&self) -> bool {
        self.nodes
            .iter()
            .enumerate()
            .all(|(i, node)| node.id == Self::node_id(i))
    }
}

#[test]
fn test_producer_of() {
    let mut doc = GraphDocument::default();
    doc.add_node(GraphNode {
        id: GraphDocument::node_id(0),
        op: "relu".into(),
        inputs: vec!["x".into()],
        options: Map::new(),
        outputs: vec!["y".into()],
    });
    assert_eq!(doc.producer_of("y").map(|n| n.op.as_str()), Some("relu"));
    assert!(doc.producer_of("x").is_none());
    assert!(doc.has_canonical_ids());
    assert!(doc.operators().contains("relu"));
}
