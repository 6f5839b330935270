//! Integration tests for linked stages
//!
//! These tests drive complete chains through the public API:
//! - Linking, feeding and draining
//! - Error aggregation across stages
//! - Cancellation and illegal lifecycle calls

mod common;

use common::builders::{multiplier, passthrough};
use common::{assert_same_items, test_timeout};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::thread;
use workers_rs::pipeline::{
    CancelToken, FailureKind, PipelineError, PipelineGraph, Stage, StageState, Worker,
};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct MultiplyConfig {
    amount_to_multiply: i64,
}

#[test]
fn test_two_linked_multipliers() {
    let cancel = CancelToken::new();
    let two = multiplier("x2", cancel.clone(), 2).capacity(8).start().unwrap();
    let four = multiplier("x4", cancel, 4)
        .capacity(8)
        .link_from(&two)
        .start()
        .unwrap();

    for i in 1..=3 {
        two.send(i).unwrap();
    }
    two.close().unwrap();

    let observed: Vec<i64> = four.outputs().collect();
    assert_eq!(observed, vec![8, 16, 24]);

    two.join().unwrap();
    four.join().unwrap();
    assert_eq!(four.state(), StageState::Completed);
}

#[test]
fn test_passing_fields_with_ten_instances() {
    let cancel = CancelToken::new();
    let two = multiplier("multiply-by-two", cancel.clone(), 2)
        .concurrency(10)
        .start()
        .unwrap();
    let four = Stage::builder("multiply-by-four", cancel, |w: &Worker<i64, i64>| {
        let config: MultiplyConfig = w.get_field_object("amountToMultiply")?;
        for item in w.inputs() {
            w.emit(item * config.amount_to_multiply)?;
        }
        Ok(())
    })
    .concurrency(10)
    .field_object(
        "amountToMultiply",
        &MultiplyConfig {
            amount_to_multiply: 4,
        },
    )
    .link_from(&two)
    .start()
    .unwrap();

    let inputs: Vec<i64> = (0..200).collect();
    let feeder = {
        let two = two.clone();
        let inputs = inputs.clone();
        thread::spawn(move || {
            for item in inputs {
                two.send(item).unwrap();
            }
            two.close().unwrap();
        })
    };

    let observed: Vec<i64> = four.outputs().collect();
    feeder.join().unwrap();

    let expected: Vec<i64> = inputs.iter().map(|v| v * 8).collect();
    assert_same_items(&observed, &expected);

    let mut graph = PipelineGraph::new();
    graph.add(two.clone());
    graph.add(four.clone());
    graph.join_all().unwrap();

    assert_eq!(two.stats().items_received, 200);
    assert_eq!(four.stats().items_emitted, 200);
}

#[test]
fn test_object_field_is_copied_per_decode() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let record = seen.clone();
    let stage = Stage::builder("decode", CancelToken::new(), move |w: &Worker<(), ()>| {
        let mut first = MultiplyConfig::default();
        w.get_field_object_into("config", &mut first)?;
        first.amount_to_multiply = 99;
        let second: MultiplyConfig = w.get_field_object("config")?;
        if let Ok(mut seen) = record.lock() {
            seen.push((first.amount_to_multiply, second.amount_to_multiply));
        }
        Ok(())
    })
    .field_object(
        "config",
        &MultiplyConfig {
            amount_to_multiply: 4,
        },
    )
    .start()
    .unwrap();

    stage.close().unwrap();
    stage.join().unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![(99, 4)]);
}

#[test]
fn test_send_after_close_returns_item() {
    let stage = passthrough("p", CancelToken::new()).start().unwrap();
    stage.close().unwrap();

    let err = stage.send(42).unwrap_err();
    assert!(matches!(err.reason, PipelineError::InputClosed));
    assert_eq!(err.into_inner(), 42);

    stage.join().unwrap();
}

#[test]
fn test_linked_input_rejects_direct_use() {
    let up = passthrough("up", CancelToken::new()).start().unwrap();
    let down = passthrough("down", CancelToken::new())
        .link_from(&up)
        .start()
        .unwrap();

    let err = down.send(1).unwrap_err();
    assert!(matches!(err.reason, PipelineError::Configuration(_)));
    assert_eq!(err.item, 1);
    assert!(matches!(down.close(), Err(PipelineError::Configuration(_))));
    assert_eq!(down.upstream(), Some(up.id()));

    up.close().unwrap();
    assert_eq!(down.outputs().count(), 0);
    up.join().unwrap();
    down.join().unwrap();
}

#[test]
fn test_failed_upstream_still_closes_downstream() {
    let cancel = CancelToken::new();
    let up = Stage::builder("picky", cancel.clone(), |w: &Worker<i64, i64>| {
        for item in w.inputs() {
            if item == 3 {
                anyhow::bail!("cannot handle {}", item);
            }
            w.emit(item)?;
        }
        Ok(())
    })
    .capacity(8)
    .start()
    .unwrap();
    let down = passthrough("after", cancel).capacity(8).link_from(&up).start().unwrap();

    for i in 1..=4 {
        // The only instance may already have failed on 3 when 4 arrives.
        if let Err(e) = up.send(i) {
            assert_eq!(e.item, 4);
            assert!(matches!(e.reason, PipelineError::Stopped));
        }
    }
    up.close().unwrap();

    // Item 4 is never processed once the only instance has failed.
    assert_eq!(down.outputs().collect::<Vec<_>>(), vec![1, 2]);

    let mut graph = PipelineGraph::new();
    graph.add(up.clone());
    graph.add(down.clone());

    match graph.join_all() {
        Err(PipelineError::Join(report)) => {
            assert_eq!(report.stage, up.id());
            assert_eq!(report.failures.len(), 1);
            assert_eq!(report.failures[0].kind, FailureKind::Processing);
            assert!(report.failures[0].message.contains("cannot handle 3"));
        }
        other => panic!("expected upstream failure, got {:?}", other),
    }
}

#[test]
fn test_cancel_stops_whole_chain() {
    let cancel = CancelToken::new();
    let up = passthrough("idle-up", cancel.clone())
        .concurrency(3)
        .start()
        .unwrap();
    let down = passthrough("idle-down", cancel.clone())
        .concurrency(3)
        .link_from(&up)
        .start()
        .unwrap();

    cancel.cancel();

    match up.join_timeout(test_timeout()) {
        Err(PipelineError::Join(report)) => {
            assert!(report.is_cancellation());
            assert_eq!(report.failures.len(), 3);
        }
        other => panic!("expected cancellation, got {:?}", other),
    }

    // Downstream instances stop either on the signal or on the closed input.
    match down.join_timeout(test_timeout()) {
        Ok(()) => {}
        Err(PipelineError::Join(report)) => assert!(report.is_cancellation()),
        Err(other) => panic!("unexpected downstream error {:?}", other),
    }
    assert_eq!(up.state(), StageState::Completed);
}

#[test]
fn test_graph_drives_chain() {
    let cancel = CancelToken::new();
    let a = multiplier("a", cancel.clone(), 2).capacity(16).start().unwrap();
    let b = passthrough("b", cancel.clone()).capacity(16).link_from(&a).start().unwrap();
    let c = multiplier("c", cancel, 3).capacity(16).link_from(&b).start().unwrap();

    let mut graph = PipelineGraph::new();
    graph.add(c.clone());
    graph.add(b.clone());
    graph.add(a.clone());
    assert_eq!(graph.execution_order(), vec![a.id(), b.id(), c.id()]);

    for i in 0..5 {
        a.send(i).unwrap();
    }
    graph.close_sources().unwrap();

    assert_eq!(c.outputs().collect::<Vec<_>>(), vec![0, 6, 12, 18, 24]);
    graph.join_all().unwrap();

    let snapshot = graph.snapshot();
    assert_eq!(snapshot.edges.len(), 2);
    assert!(snapshot
        .stages
        .iter()
        .all(|s| s.descriptor.state == StageState::Completed));
}

#[test]
fn test_failed_sink_cancels_fed_chain() {
    let cancel = CancelToken::new();
    let source = multiplier("source", cancel.clone(), 2)
        .capacity(2)
        .start()
        .unwrap();
    let sink = Stage::builder("sink", cancel.clone(), |w: &Worker<i64, ()>| {
        w.try_field_int("missing")?;
        for _ in w.inputs() {}
        Ok(())
    })
    .link_from(&source)
    .start()
    .unwrap();

    let mut graph = PipelineGraph::new();
    graph.add(source.clone());
    graph.add(sink.clone());

    let feeder = {
        let source = source.clone();
        thread::spawn(move || {
            let mut fed = 0;
            for i in 0..100 {
                match source.send(i) {
                    Ok(()) => fed += 1,
                    Err(e) => return (fed, Some(e.reason)),
                }
            }
            source.close().unwrap();
            (fed, None)
        })
    };

    let joined = graph.join_all_or_cancel(&cancel);
    let (fed, rejection) = feeder.join().unwrap();

    assert!(cancel.is_cancelled());
    assert!(fed < 100, "feeder should have been stopped, fed {}", fed);
    assert!(matches!(rejection, Some(PipelineError::Cancelled)));

    match joined {
        Err(PipelineError::Stages(errors)) => {
            assert_eq!(errors.len(), 2);
            match &errors[0] {
                PipelineError::Join(report) => {
                    assert_eq!(report.stage, sink.id());
                    assert_eq!(report.failures[0].kind, FailureKind::Processing);
                }
                other => panic!("expected sink report first, got {:?}", other),
            }
            match &errors[1] {
                PipelineError::Join(report) => assert!(report.is_cancellation()),
                other => panic!("expected source cancellation, got {:?}", other),
            }
        }
        other => panic!("expected both stages to fail, got {:?}", other),
    }
}
