//! Workflow flows: chains, groups, and chord fan-in.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::Mutex;

use machina::{
    Backend, Chain, Chord, FnHandler, Group, HandlerDescriptor, HandlerRegistry,
    InMemoryBackend, ParamKind, Signature, Slot, StateKind,
};

use crate::common::{self, register_sum};

/// Registers an `arity`-argument handler that records each invocation's
/// arguments.
fn register_collector(
    registry: &mut HandlerRegistry,
    name: &str,
    arity: usize,
) -> Arc<Mutex<Vec<Vec<Value>>>> {
    let calls: Arc<Mutex<Vec<Vec<Value>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&calls);
    registry.register(
        name,
        HandlerDescriptor::new(FnHandler::arc(move |_ctx, args: Vec<Value>| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().await.push(args);
                vec![Slot::value(json!("collected")), Slot::nil()]
            }
        }))
        .with_params(vec![ParamKind::Any; arity]),
    );
    calls
}

/// Registers a handler returning its single integer argument.
fn register_echo(registry: &mut HandlerRegistry, name: &str) {
    registry.register(
        name,
        HandlerDescriptor::new(FnHandler::arc(|_ctx, args: Vec<Value>| async move {
            vec![Slot::value(args[0].clone()), Slot::nil()]
        }))
        .with_params(vec![ParamKind::Int]),
    );
}

#[tokio::test]
async fn test_chain_forwards_results_downstream() {
    let mut registry = HandlerRegistry::new();
    register_sum(&mut registry, "sum2", 2);
    register_sum(&mut registry, "sum3", 3);
    let harness = common::start(registry).await;

    // sum2(1, 2) = 3, then sum3(5, 6, 3) = 14
    let first = Signature::new("sum2", vec![json!(1), json!(2)]);
    let second = Signature::new("sum3", vec![json!(5), json!(6)]);
    let second_id = second.id.clone();
    let chain = Chain::new(vec![first.clone(), second]).expect("non-empty chain");

    harness.submit(&chain.head).await;

    let tail = harness.wait_for_state(&second_id, StateKind::Success).await;
    assert_eq!(tail.results[0].value, json!(14));

    // the child only ran after the parent's SUCCESS transition
    let head_state = harness.backend.task_state(&first.id).await.unwrap();
    assert!(head_state.is_success());
    harness.shutdown().await;
}

#[tokio::test]
async fn test_group_members_run_and_complete() {
    let mut registry = HandlerRegistry::new();
    register_echo(&mut registry, "echo");
    let harness = common::start(registry).await;

    let group = Group::new(vec![
        Signature::new("echo", vec![json!(1)]),
        Signature::new("echo", vec![json!(2)]),
        Signature::new("echo", vec![json!(3)]),
    ]);
    harness
        .backend
        .init_group(&group.group_uuid, &group.task_ids())
        .await
        .unwrap();

    for member in &group.tasks {
        harness.submit(member).await;
    }
    for member in &group.tasks {
        harness.wait_for_state(&member.id, StateKind::Success).await;
    }

    assert!(harness
        .backend
        .group_completed(&group.group_uuid, group.tasks.len())
        .await
        .unwrap());
    harness.shutdown().await;
}

#[tokio::test]
async fn test_chord_fires_once_with_aggregated_results() {
    let mut registry = HandlerRegistry::new();
    register_echo(&mut registry, "echo");
    let calls = register_collector(&mut registry, "collect", 3);
    let harness = common::start(registry).await;

    let group = Group::new(vec![
        Signature::new("echo", vec![json!(10)]),
        Signature::new("echo", vec![json!(20)]),
        Signature::new("echo", vec![json!(30)]),
    ]);
    let callback = Signature::new("collect", vec![]);
    let chord = Chord::new(group, callback.clone());

    harness
        .backend
        .init_group(&chord.group.group_uuid, &chord.group.task_ids())
        .await
        .unwrap();
    for member in &chord.group.tasks {
        harness.submit(member).await;
    }

    harness.wait_for_state(&callback.id, StateKind::Success).await;
    // give any duplicate trigger a chance to surface before asserting
    tokio::time::sleep(Duration::from_millis(200)).await;

    let calls = calls.lock().await;
    assert_eq!(calls.len(), 1, "chord callback must fire exactly once");
    // members' results concatenated in submission order
    assert_eq!(calls[0], vec![json!(10), json!(20), json!(30)]);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_immutable_chord_callback_keeps_its_args() {
    let mut registry = HandlerRegistry::new();
    register_echo(&mut registry, "echo");
    let calls = register_collector(&mut registry, "collect", 1);
    let harness = common::start(registry).await;

    let group = Group::new(vec![
        Signature::new("echo", vec![json!(1)]),
        Signature::new("echo", vec![json!(2)]),
    ]);
    let callback = Signature::new("collect", vec![json!("pinned")]).immutable();
    let chord = Chord::new(group, callback.clone());

    harness
        .backend
        .init_group(&chord.group.group_uuid, &chord.group.task_ids())
        .await
        .unwrap();
    for member in &chord.group.tasks {
        harness.submit(member).await;
    }

    harness.wait_for_state(&callback.id, StateKind::Success).await;
    let calls = calls.lock().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0], vec![json!("pinned")]);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_chord_abandoned_when_a_member_fails() {
    let mut registry = HandlerRegistry::new();
    register_echo(&mut registry, "echo");
    registry.register(
        "always_fails",
        HandlerDescriptor::new(FnHandler::arc(|_ctx, _args| async {
            vec![Slot::error("no dice")]
        })),
    );
    let chord_runs = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&chord_runs);
    registry.register(
        "collect",
        HandlerDescriptor::new(FnHandler::arc(move |_ctx, _args| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                vec![Slot::nil()]
            }
        })),
    );
    let harness = common::start(registry).await;

    let group = Group::new(vec![
        Signature::new("echo", vec![json!(1)]),
        Signature::new("always_fails", vec![]),
    ]);
    let callback = Signature::new("collect", vec![]);
    let chord = Chord::new(group, callback);

    harness
        .backend
        .init_group(&chord.group.group_uuid, &chord.group.task_ids())
        .await
        .unwrap();
    for member in &chord.group.tasks {
        harness.submit(member).await;
    }
    for member in &chord.group.tasks {
        harness.wait_for_terminal(&member.id).await;
    }

    // a non-success member silently abandons the chord: no terminal
    // state is ever written for the callback
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(chord_runs.load(Ordering::SeqCst), 0);
    assert!(harness.backend.task_state(&chord.callback.id).await.is_err());
    harness.shutdown().await;
}

#[tokio::test]
async fn test_amqp_flavored_backend_purges_group_meta_after_chord() {
    let mut registry = HandlerRegistry::new();
    register_echo(&mut registry, "echo");
    register_collector(&mut registry, "collect", 2);
    let backend = InMemoryBackend::new().with_amqp_semantics();
    // one worker task at a time: a losing member must not purge the
    // group while the winner is still reading member states
    let harness = common::start_with(registry, backend, 1).await;

    let group = Group::new(vec![
        Signature::new("echo", vec![json!(1)]),
        Signature::new("echo", vec![json!(2)]),
    ]);
    let callback = Signature::new("collect", vec![]);
    let chord = Chord::new(group, callback.clone());

    harness
        .backend
        .init_group(&chord.group.group_uuid, &chord.group.task_ids())
        .await
        .unwrap();
    for member in &chord.group.tasks {
        harness.submit(member).await;
    }

    harness.wait_for_state(&callback.id, StateKind::Success).await;

    // bookkeeping reclaimed once the group was consumed
    for _ in 0..100 {
        if harness
            .backend
            .group_meta(&chord.group.group_uuid)
            .await
            .is_none()
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(harness
        .backend
        .group_meta(&chord.group.group_uuid)
        .await
        .is_none());
    harness.shutdown().await;
}
