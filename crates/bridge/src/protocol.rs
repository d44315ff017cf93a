//! Newline-delimited JSON messages exchanged with the backend worker.
//!
//! ```text
//! -> {"cmd":"execute_graph","id":"req-1","graph":{..},"inputs":{..},"expected_outputs":{..},"context_options":{..}}
//! <- {"id":"req-1","ok":true,"outputs":{..}}
//! <- {"id":"req-1","ok":false,"error":{"kind":"GraphValidationError","message":".."}}
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use wptnn_core::{graph::GraphDocument, tensor::RuntimeTensor};

use crate::{ExecutionError, Outputs};

/// Error kinds the backend reports.
pub mod error_kind {
    pub const BAD_REQUEST: &str = "BadRequestError";
    pub const GRAPH_VALIDATION: &str = "GraphValidationError";
    pub const GRAPH_CONVERSION: &str = "GraphConversionError";
    pub const RUNTIME_EXECUTION: &str = "RuntimeExecutionError";
}

/// Id the backend uses when it cannot read the request's own id.
pub const UNKNOWN_ID: &str = "unknown";

/// Payload of one `execute_graph` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphExecution {
    pub graph: GraphDocument,
    pub inputs: BTreeMap<String, RuntimeTensor>,
    #[serde(default)]
    pub expected_outputs: BTreeMap<String, RuntimeTensor>,
    #[serde(default)]
    pub context_options: Map<String, Value>,
}

impl GraphExecution {
    pub fn new(graph: GraphDocument, inputs: BTreeMap<String, RuntimeTensor>) -> Self {
        Self {
            graph,
            inputs,
            expected_outputs: BTreeMap::new(),
            context_options: Map::new(),
        }
    }

    pub fn with_expected_outputs(mut self, outputs: BTreeMap<String, RuntimeTensor>) -> Self {
        self.expected_outputs = outputs;
        self
    }

    pub fn with_context_option(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context_options.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Request {
    ExecuteGraph {
        id: String,
        #[serde(flatten)]
        execution: GraphExecution,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Outputs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub kind: String,
    pub message: String,
}

impl Request {
    pub fn id(&self) -> &str {
        match self {
            Request::ExecuteGraph { id, .. } => id,
        }
    }
}

impl Response {
    pub fn success(id: impl Into<String>, outputs: Outputs) -> Self {
        Self {
            id: id.into(),
            ok: true,
            outputs: Some(outputs),
            error: None,
        }
    }

    pub fn failure(id: impl Into<String>, kind: &str, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ok: false,
            outputs: None,
            error: Some(ErrorPayload {
                kind: kind.to_string(),
                message: message.into(),
            }),
        }
    }

    pub fn into_result(self) -> Result<Outputs, ExecutionError> {
        match (self.ok, self.outputs, self.error) {
            (true, Some(outputs), _) => Ok(outputs),
            (true, None, _) => Err(ExecutionError::Protocol(
                format!("response '{}' has no outputs", self.id).into(),
            )),
            (false, _, Some(ErrorPayload { kind, message })) => {
                Err(ExecutionError::Backend { kind, message })
            }
            (false, _, None) => Err(ExecutionError::Backend {
                kind: "UnknownError".into(),
                message: "backend reported a failure without details".into(),
            }),
        }
    }
}

#[test]
fn request_wire_format() {
    let execution = GraphExecution::new(
        GraphDocument::default(),
        [(
            "x".to_string(),
            RuntimeTensor::from_i64(vec![1], &[i64::MAX]).unwrap(),
        )]
        .into_iter()
        .collect(),
    )
    .with_context_option("deviceType", "cpu");
    let request = Request::ExecuteGraph {
        id: "req-1".into(),
        execution,
    };
    let json = serde_json::to_value(&request).unwrap();
    assert_eq!(json["cmd"], "execute_graph");
    assert_eq!(json["id"], "req-1");
    assert_eq!(json["graph"]["format"], "webnn-graph-json");
    assert_eq!(
        json["inputs"]["x"],
        serde_json::json!({"descriptor": {"dataType": "int64", "shape": [1]}, "data": ["9223372036854775807"]})
    );
    assert_eq!(json["expected_outputs"], serde_json::json!({}));
    assert_eq!(json["context_options"]["deviceType"], "cpu");

    let back: Request = serde_json::from_value(json).unwrap();
    assert_eq!(back, request);
}

#[test]
fn response_results() {
    let ok: Response = serde_json::from_str(r#"{"id":"req-2","ok":true,"outputs":{}}"#).unwrap();
    assert_eq!(ok.into_result(), Ok(BTreeMap::new()));

    let failed: Response = serde_json::from_str(
        r#"{"id":"req-3","ok":false,"error":{"kind":"GraphValidationError","message":"bad axis"}}"#,
    )
    .unwrap();
    assert_eq!(
        failed.into_result(),
        Err(ExecutionError::Backend {
            kind: error_kind::GRAPH_VALIDATION.into(),
            message: "bad axis".into()
        })
    );

    let json = serde_json::to_string(&Response::failure("req-4", error_kind::BAD_REQUEST, "x")).unwrap();
    assert!(!json.contains("outputs"));
}
