use std::{
    thread,
    time::{Duration, Instant},
};

use wptnn_bridge::{
    BackendCommand, Bridge, BridgeError, ExecutionError, Executor, GraphExecution,
};
use wptnn_core::{
    builder::GraphBuilder,
    tensor::{DataType, RuntimeTensor, TensorDescriptor},
};

fn echo_backend() -> Bridge {
    Bridge::spawn(&BackendCommand::new(env!("CARGO_BIN_EXE_wptnn-echo-backend"))).unwrap()
}

fn add_graph(simulate: Option<&str>) -> GraphExecution {
    let desc = TensorDescriptor::new(DataType::Float32, vec![2]);
    let mut b = GraphBuilder::new();
    let x = b.input("x", desc.clone()).unwrap();
    let y = b.input("y", desc).unwrap();
    let z = b.add(x, y).unwrap();
    let graph = b.build(&[("z", z)]).unwrap();

    let mut inputs = graph.inputs;
    inputs.insert("x".into(), RuntimeTensor::from_f32(vec![2], &[1.0, 2.0]).unwrap());
    inputs.insert("y".into(), RuntimeTensor::from_f32(vec![2], &[3.0, 4.0]).unwrap());
    let expected = RuntimeTensor::from_f32(vec![2], &[4.0, 6.0]).unwrap();

    let execution = GraphExecution::new(graph.document, inputs)
        .with_expected_outputs([("z".to_string(), expected)].into_iter().collect())
        .with_context_option("deviceType", "cpu");
    match simulate {
        Some(mode) => execution.with_context_option("simulate", mode),
        None => execution,
    }
}

#[test]
fn echo_roundtrip() {
    let bridge = echo_backend();
    for _ in 0..3 {
        let outputs = bridge.execute(add_graph(None)).unwrap();
        assert_eq!(
            outputs["z"],
            RuntimeTensor::from_f32(vec![2], &[4.0, 6.0]).unwrap()
        );
    }
    assert_eq!(bridge.pending_count(), 0);
    bridge.close();
    bridge.close();
}

#[test]
fn backend_failures_are_per_request() {
    let bridge = echo_backend();
    assert!(matches!(
        bridge.execute(add_graph(Some("fail"))),
        Err(ExecutionError::Backend { ref kind, .. }) if kind == "RuntimeExecutionError"
    ));
    assert!(matches!(
        bridge.execute(add_graph(Some("garbage"))),
        Err(ExecutionError::Protocol(_))
    ));
    assert!(bridge.execute(add_graph(None)).is_ok());
}

#[test]
fn crash_rejects_every_outstanding_request() {
    let bridge = echo_backend();

    thread::scope(|s| {
        let waiting = (0..3)
            .map(|_| s.spawn(|| bridge.execute(add_graph(Some("silent")))))
            .collect::<Vec<_>>();

        let started = Instant::now();
        while bridge.pending_count() < 3 {
            assert!(started.elapsed() < Duration::from_secs(10));
            thread::sleep(Duration::from_millis(5));
        }

        let crashed = bridge.execute(add_graph(Some("crash")));
        assert!(matches!(crashed, Err(ExecutionError::ProcessExited(_))));

        for handle in waiting {
            let result = handle.join().unwrap();
            assert!(matches!(result, Err(ExecutionError::ProcessExited(_))));
        }
    });

    assert_eq!(bridge.pending_count(), 0);
    let later = bridge.execute(add_graph(None)).unwrap_err();
    assert!(later.is_fatal());
}

#[test]
fn close_stops_a_silent_backend() {
    let bridge = echo_backend();
    thread::scope(|s| {
        let waiting = s.spawn(|| bridge.execute(add_graph(Some("silent"))));
        let started = Instant::now();
        while bridge.pending_count() < 1 {
            assert!(started.elapsed() < Duration::from_secs(10));
            thread::sleep(Duration::from_millis(5));
        }
        bridge.close();
        assert!(waiting.join().unwrap().unwrap_err().is_fatal());
    });
}

#[test]
fn spawn_failure() {
    let err = Bridge::spawn(&BackendCommand::new("/nonexistent/wptnn-backend")).err();
    assert!(matches!(err, Some(BridgeError::Spawn { .. })));
}
