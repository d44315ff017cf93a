pub mod bridge;
pub mod pending;
pub mod protocol;
pub mod transport;

use std::{borrow::Cow, collections::BTreeMap, io};

use thiserror::Error;
use wptnn_core::tensor::RuntimeTensor;

pub use bridge::Bridge;
pub use protocol::GraphExecution;
pub use transport::BackendCommand;

/// Why a single execution request failed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExecutionError {
    /// The backend answered with `ok: false`.
    #[error("{kind}: {message}")]
    Backend { kind: String, message: String },

    /// The backend process is gone. No later request can succeed.
    #[error("Backend process exited: {0}")]
    ProcessExited(Cow<'static, str>),

    #[error("Protocol: {0}")]
    Protocol(Cow<'static, str>),

    #[error("Io: {0}")]
    Io(Cow<'static, str>),
}

impl ExecutionError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ExecutionError::ProcessExited(_))
    }
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Failed to spawn backend '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("Backend {0} is unavailable")]
    Stream(&'static str),

    #[error("Io: {0}")]
    Io(#[from] io::Error),
}

pub type Outputs = BTreeMap<String, RuntimeTensor>;

/// Something that runs a graph and returns its named outputs.
pub trait Executor {
    fn execute(&self, execution: GraphExecution) -> Result<Outputs, ExecutionError>;

    /// Releases the backend. Calling it more than once is a no-op.
    fn close(&self);
}
