use std::sync::{
    mpsc::{self, Receiver, Sender},
    Mutex, MutexGuard, PoisonError,
};

use rustc_hash::FxHashMap;
use serde_json::Value;

use crate::{protocol::Response, ExecutionError, Outputs};

pub type Completion = Result<Outputs, ExecutionError>;

/// Correlates request ids with the callers waiting on them.
///
/// Every entry is completed at most once and removed when completed. Once
/// [`reject_all`](Self::reject_all) runs the table is closed and later
/// registrations fail with the same error.
#[derive(Debug, Default)]
pub struct PendingTable {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    entries: FxHashMap<String, Sender<Completion>>,
    closed: Option<ExecutionError>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, id: &str) -> Result<Receiver<Completion>, ExecutionError> {
        let mut inner = self.lock();
        if let Some(err) = &inner.closed {
            return Err(err.clone());
        }
        let (tx, rx) = mpsc::channel();
        inner.entries.insert(id.to_string(), tx);
        Ok(rx)
    }

    /// Completes `id`. Returns false if nothing was waiting on it.
    pub fn complete(&self, id: &str, completion: Completion) -> bool {
        let sender = self.lock().entries.remove(id);
        match sender {
            // The caller may have given up; nothing to do then.
            Some(sender) => {
                let _ = sender.send(completion);
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, id: &str) -> bool {
        self.lock().entries.remove(id).is_some()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().entries.contains_key(id)
    }

    /// Rejects every outstanding entry with `err` and closes the table.
    pub fn reject_all(&self, err: ExecutionError) {
        let entries = {
            let mut inner = self.lock();
            if inner.closed.is_none() {
                inner.closed = Some(err.clone());
            }
            std::mem::take(&mut inner.entries)
        };
        if !entries.is_empty() {
            log::debug!("rejecting {} pending request(s): {err}", entries.len());
        }
        for (_, sender) in entries {
            let _ = sender.send(Err(err.clone()));
        }
    }

    /// Routes one line from the backend to the entry it answers.
    ///
    /// Lines that are not JSON or that name no pending id are dropped. A line
    /// naming a pending id whose body does not decode rejects that entry.
    pub fn dispatch_line(&self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        let value: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(err) => {
                log::debug!("dropping malformed backend line ({err}): {line}");
                return;
            }
        };
        let id = match value.get("id").and_then(Value::as_str) {
            Some(id) if self.contains(id) => id.to_string(),
            _ => {
                log::debug!("dropping unmatched backend line: {line}");
                return;
            }
        };
        let completion = match serde_json::from_value::<Response>(value) {
            Ok(response) => response.into_result(),
            Err(err) => Err(ExecutionError::Protocol(
                format!("malformed response to '{id}': {err}").into(),
            )),
        };
        self.complete(&id, completion);
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed.is_some()
    }
}

#[test]
fn routes_by_id() {
    let table = PendingTable::new();
    let a = table.register("req-1").unwrap();
    let b = table.register("req-2").unwrap();
    assert_eq!(table.len(), 2);

    table.dispatch_line(r#"{"id":"req-2","ok":true,"outputs":{}}"#);
    table.dispatch_line(r#"{"id":"req-1","ok":false,"error":{"kind":"RuntimeExecutionError","message":"boom"}}"#);

    assert_eq!(b.recv().unwrap(), Ok(Outputs::new()));
    assert!(matches!(
        a.recv().unwrap(),
        Err(ExecutionError::Backend { ref message, .. }) if message == "boom"
    ));
    assert!(table.is_empty());
}

#[test]
fn drops_malformed_and_unmatched_lines() {
    let table = PendingTable::new();
    let rx = table.register("req-1").unwrap();
    table.dispatch_line("not json");
    table.dispatch_line("");
    table.dispatch_line(r#"{"id":"req-9","ok":true,"outputs":{}}"#);
    table.dispatch_line(r#"{"ok":true}"#);
    assert_eq!(table.len(), 1);
    assert!(rx.try_recv().is_err());

    table.dispatch_line(r#"{"id":"req-1","ok":"yes"}"#);
    assert!(matches!(rx.recv().unwrap(), Err(ExecutionError::Protocol(_))));
    assert!(table.is_empty());
}

#[test]
fn reject_all_closes_the_table() {
    let table = PendingTable::new();
    let receivers = (0..3)
        .map(|i| table.register(&format!("req-{i}")).unwrap())
        .collect::<Vec<_>>();
    let exited = ExecutionError::ProcessExited("gone".into());
    table.reject_all(exited.clone());

    for rx in receivers {
        assert_eq!(rx.recv().unwrap(), Err(exited.clone()));
    }
    assert!(table.is_closed());
    assert_eq!(table.register("req-4").unwrap_err(), exited);
    assert!(!table.complete("req-0", Ok(Outputs::new())));
}
