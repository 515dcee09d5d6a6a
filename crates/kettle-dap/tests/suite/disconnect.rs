use kettle_jdb::mock::{BackendCall, MockBackend};
use kettle_jdb::{Backend, RunState};
use serde_json::json;

use crate::harness::{event_name, is_response_to, TestClient};

#[tokio::test]
async fn disconnect_during_continue_kills_backend_and_settles_the_request() {
    let backend = MockBackend::new();
    backend.push_run_state(RunState::BreakpointHit { location: None });
    let mut client = TestClient::start(&backend);
    client.initialize().await;
    client
        .request("launch", json!({ "mainClass": "Foo", "classesDir": "." }))
        .await;
    client.read_until_event("stopped").await;

    // The next run command blocks inside the backend until it is terminated.
    backend.hold_run_commands();
    let calls_before = backend.calls().len();
    let continue_seq = client.send("continue", json!({ "threadId": 1 })).await;
    backend.wait_for_call_count(calls_before + 1).await;

    let disconnect_seq = client.send("disconnect", json!({})).await;
    let messages = client.finish().await;

    let disconnect = messages
        .iter()
        .find(|msg| is_response_to(msg, disconnect_seq))
        .expect("disconnect response");
    assert_eq!(disconnect["success"], true);

    let continued = messages
        .iter()
        .find(|msg| is_response_to(msg, continue_seq))
        .expect("in-flight continue must still be answered");
    assert_eq!(continued["success"], false);
    assert_eq!(continued["message"], "session disconnected");

    assert!(
        messages.iter().all(|msg| event_name(msg).is_none()),
        "no events after disconnect: {messages:#?}"
    );

    let calls = backend.calls();
    assert!(calls.contains(&BackendCall::Terminate));
    assert!(backend.is_terminated());

    // Nothing was sent to the backend after termination began.
    let records = backend.records();
    let terminate = records
        .iter()
        .find(|r| r.call == BackendCall::Terminate)
        .unwrap();
    assert!(records
        .iter()
        .filter(|r| r.call != BackendCall::Terminate)
        .all(|r| r.started <= terminate.started));
}

#[tokio::test]
async fn disconnect_during_initial_run_suppresses_the_launch_outcome() {
    let backend = MockBackend::new();
    backend.hold_run_commands();
    let mut client = TestClient::start(&backend);
    client.initialize().await;

    let launch = client
        .request("launch", json!({ "mainClass": "Foo", "classesDir": "." }))
        .await;
    assert_eq!(launch["success"], true);
    backend.wait_for_call_count(2).await;

    let seq = client.send("disconnect", json!({})).await;
    let messages = client.finish().await;
    assert!(messages.iter().any(|msg| is_response_to(msg, seq)));
    assert!(messages.iter().all(|msg| event_name(msg).is_none()));
    assert_eq!(
        backend.calls().iter().filter(|c| **c == BackendCall::Continue).count(),
        1
    );
}

#[tokio::test]
async fn requests_queued_behind_a_disconnect_are_answered() {
    let backend = MockBackend::new();
    backend.push_run_state(RunState::BreakpointHit { location: None });
    let mut client = TestClient::start(&backend);
    client.initialize().await;
    client
        .request("launch", json!({ "mainClass": "Foo", "classesDir": "." }))
        .await;
    client.read_until_event("stopped").await;

    backend.hold_run_commands();
    let first = client.send("next", json!({ "threadId": 1 })).await;
    let second = client.send("stepIn", json!({ "threadId": 1 })).await;
    let disconnect = client.send("disconnect", json!({})).await;
    let messages = client.finish().await;

    for seq in [first, second, disconnect] {
        assert!(
            messages.iter().any(|msg| is_response_to(msg, seq)),
            "missing response for {seq}: {messages:#?}"
        );
    }
    assert!(!backend.calls().contains(&BackendCall::StepInto));
}
