use std::{
    io,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use crate::{
    pending::PendingTable,
    protocol::{GraphExecution, Request},
    transport::{BackendCommand, ProcessTransport, Transport},
    BridgeError, ExecutionError, Executor, Outputs,
};

/// Client side of the execution protocol.
///
/// Any number of threads may have requests in flight at once. The backend is
/// never restarted: once it exits every later call fails with
/// [`ExecutionError::ProcessExited`].
pub struct Bridge<T: Transport = ProcessTransport> {
    transport: T,
    pending: Arc<PendingTable>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl Bridge<ProcessTransport> {
    pub fn spawn(command: &BackendCommand) -> Result<Self, BridgeError> {
        let pending = Arc::new(PendingTable::new());
        let transport = ProcessTransport::spawn(command, Arc::clone(&pending))?;
        Ok(Self::new(transport, pending))
    }
}

impl<T: Transport> Bridge<T> {
    /// `pending` must be the table `transport` delivers responses to.
    pub fn new(transport: T, pending: Arc<PendingTable>) -> Self {
        Self {
            transport,
            pending,
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn call(&self, execution: GraphExecution) -> Result<Outputs, ExecutionError> {
        if self.is_closed() {
            return Err(ExecutionError::ProcessExited("bridge is closed".into()));
        }

        let id = format!("req-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let completion = self.pending.register(&id)?;
        let request = Request::ExecuteGraph {
            id: id.clone(),
            execution,
        };
        let line = match serde_json::to_string(&request) {
            Ok(line) => line,
            Err(err) => {
                self.pending.remove(&id);
                return Err(ExecutionError::Protocol(
                    format!("cannot encode request: {err}").into(),
                ));
            }
        };

        log::debug!("-> {id} ({} bytes)", line.len());
        if let Err(err) = self.transport.send_line(&line) {
            self.pending.remove(&id);
            return Err(match err.kind() {
                io::ErrorKind::BrokenPipe => {
                    ExecutionError::ProcessExited(format!("write failed: {err}").into())
                }
                _ => ExecutionError::Io(err.to_string().into()),
            });
        }

        let result = completion.recv().unwrap_or_else(|_| {
            Err(ExecutionError::ProcessExited(
                "request was dropped without an answer".into(),
            ))
        });
        log::debug!("<- {id} ({})", if result.is_ok() { "ok" } else { "error" });
        result
    }

    /// Closes the backend's input and stops it. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.transport.shutdown();
        self.pending
            .reject_all(ExecutionError::ProcessExited("bridge is closed".into()));
    }
}

impl<T: Transport> Executor for Bridge<T> {
    fn execute(&self, execution: GraphExecution) -> Result<Outputs, ExecutionError> {
        self.call(execution)
    }

    fn close(&self) {
        Bridge::close(self)
    }
}

impl<T: Transport> Drop for Bridge<T> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod loopback {
    use std::{
        io,
        sync::{atomic::AtomicUsize, Arc},
    };

    use super::*;
    use crate::protocol::{error_kind, Response};

    /// Answers each request in the sending thread.
    pub struct Loopback {
        pub pending: Arc<PendingTable>,
        pub answer: fn(Request) -> Option<String>,
        pub shutdowns: AtomicUsize,
    }

    impl Transport for Loopback {
        fn send_line(&self, line: &str) -> io::Result<()> {
            let request: Request = serde_json::from_str(line)
                .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
            if let Some(answer) = (self.answer)(request) {
                self.pending.dispatch_line(&answer);
            }
            Ok(())
        }

        fn shutdown(&self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn bridge(answer: fn(Request) -> Option<String>) -> Bridge<Loopback> {
        let pending = Arc::new(PendingTable::new());
        Bridge::new(
            Loopback {
                pending: Arc::clone(&pending),
                answer,
                shutdowns: AtomicUsize::new(0),
            },
            pending,
        )
    }

    pub fn echo(request: Request) -> Option<String> {
        let Request::ExecuteGraph { id, execution } = request;
        serde_json::to_string(&Response::success(id, execution.expected_outputs)).ok()
    }

    pub fn fail(request: Request) -> Option<String> {
        serde_json::to_string(&Response::failure(
            request.id(),
            error_kind::GRAPH_CONVERSION,
            "no converter",
        ))
        .ok()
    }

    pub fn bad_body(request: Request) -> Option<String> {
        Some(format!(r#"{{"id":"{}","ok":true,"outputs":[1,2]}}"#, request.id()))
    }

    pub fn silent(_: Request) -> Option<String> {
        None
    }
}

#[cfg(test)]
fn execution() -> GraphExecution {
    use wptnn_core::{graph::GraphDocument, tensor::RuntimeTensor};

    let y = RuntimeTensor::from_f32(vec![2], &[1.0, 2.0]).unwrap();
    GraphExecution::new(GraphDocument::default(), Default::default())
        .with_expected_outputs([("y".to_string(), y)].into_iter().collect())
}

#[test]
fn call_roundtrip() {
    let bridge = loopback::bridge(loopback::echo);
    let outputs = bridge.call(execution()).unwrap();
    assert_eq!(outputs["y"].data.len(), 2);
    assert_eq!(bridge.pending_count(), 0);
    assert_eq!(bridge.next_id.load(Ordering::SeqCst), 2);
}

#[test]
fn call_backend_failure() {
    let bridge = loopback::bridge(loopback::fail);
    assert_eq!(
        bridge.call(execution()),
        Err(ExecutionError::Backend {
            kind: "GraphConversionError".into(),
            message: "no converter".into()
        })
    );
}

#[test]
fn call_rejects_undecodable_answer() {
    let bridge = loopback::bridge(loopback::bad_body);
    assert!(matches!(
        bridge.call(execution()),
        Err(ExecutionError::Protocol(_))
    ));
    assert_eq!(bridge.pending_count(), 0);
}

#[test]
fn close_is_idempotent() {
    let bridge = loopback::bridge(loopback::silent);
    bridge.close();
    bridge.close();
    assert_eq!(bridge.transport.shutdowns.load(Ordering::SeqCst), 1);
    assert!(matches!(
        bridge.call(execution()),
        Err(ExecutionError::ProcessExited(_))
    ));
}

#[test]
fn broken_pipe_means_process_exited() {
    struct Closed;

    impl Transport for Closed {
        fn send_line(&self, _: &str) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"))
        }

        fn shutdown(&self) {}
    }

    let pending = Arc::new(PendingTable::new());
    let bridge = Bridge::new(Closed, Arc::clone(&pending));
    let err = bridge.call(execution()).unwrap_err();
    assert!(err.is_fatal());
    assert!(pending.is_empty());
}
