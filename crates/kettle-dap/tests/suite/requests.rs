use kettle_jdb::mock::MockBackend;
use serde_json::json;

use crate::harness::TestClient;

#[tokio::test]
async fn initialize_is_answered_before_the_initialized_event() {
    let backend = MockBackend::new();
    let mut client = TestClient::start(&backend);

    let seq = client.send("initialize", json!({ "adapterID": "kettle" })).await;
    let response = client.next_message().await;
    assert_eq!(response["type"], "response");
    assert_eq!(response["request_seq"], seq);
    assert_eq!(response["success"], true);
    assert_eq!(response["body"]["supportsConfigurationDoneRequest"], true);

    let event = client.next_message().await;
    assert_eq!(event["type"], "event");
    assert_eq!(event["event"], "initialized");
    assert!(event["seq"].as_i64().unwrap() > response["seq"].as_i64().unwrap());

    client.request("disconnect", json!({})).await;
    client.finish().await;
}

#[tokio::test]
async fn placeholder_requests_return_fixed_payloads() {
    let backend = MockBackend::new();
    let mut client = TestClient::start(&backend);
    client.initialize().await;

    let threads = client.request("threads", json!({})).await;
    assert_eq!(threads["body"], json!({ "threads": [{ "id": 1, "name": "thread 1" }] }));

    let scopes = client.request("scopes", json!({ "frameId": 0 })).await;
    let names: Vec<_> = scopes["body"]["scopes"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| (s["name"].as_str().unwrap(), s["variablesReference"].as_i64().unwrap()))
        .collect();
    assert_eq!(names, vec![("Local", 1), ("Arguments", 2)]);

    let variables = client.request("variables", json!({ "variablesReference": 1 })).await;
    assert_eq!(variables["body"]["variables"], json!([]));

    let evaluate = client
        .request("evaluate", json!({ "expression": "x + 1", "context": "hover" }))
        .await;
    assert_eq!(evaluate["body"]["result"], "evaluate(context: 'hover', 'x + 1')");

    for command in ["infoRequest", "info"] {
        let info = client.request(command, json!({})).await;
        assert_eq!(info["body"], json!({ "currentFile": "Foo.bar", "currentLine": 42 }));
    }

    let done = client.request("configurationDone", json!({})).await;
    assert_eq!(done["success"], true);

    client.request("disconnect", json!({})).await;
    client.finish().await;

    // None of this needs the backend beyond shutting it down.
    assert_eq!(backend.calls(), vec![kettle_jdb::mock::BackendCall::Terminate]);
}

#[tokio::test]
async fn unknown_requests_fail_with_the_command_name() {
    let backend = MockBackend::new();
    let mut client = TestClient::start(&backend);
    let response = client.request("setExpression", json!({})).await;
    assert_eq!(response["success"], false);
    assert!(response["message"].as_str().unwrap().contains("setExpression"));
    client.hang_up().await;
}

#[tokio::test]
async fn control_requests_before_launch_fail_without_touching_the_backend() {
    let backend = MockBackend::new();
    let mut client = TestClient::start(&backend);
    client.initialize().await;

    for command in ["continue", "next", "stepIn", "stepOut", "stackTrace"] {
        let response = client.request(command, json!({ "threadId": 1 })).await;
        assert_eq!(response["success"], false, "{command}");
        assert_eq!(response["message"], "program is not launched", "{command}");
    }
    assert!(backend.calls().is_empty());
    client.hang_up().await;
}

#[tokio::test]
async fn launch_without_main_class_is_rejected() {
    let backend = MockBackend::new();
    let mut client = TestClient::start(&backend);
    let response = client.request("launch", json!({ "classesDir": "." })).await;
    assert_eq!(response["success"], false);
    assert_eq!(response["message"], "launch.mainClass is required");
    client.hang_up().await;
    assert_eq!(backend.calls(), vec![kettle_jdb::mock::BackendCall::Terminate]);
}

#[tokio::test]
async fn closing_the_stream_terminates_the_backend() {
    let backend = MockBackend::new();
    let client = TestClient::start(&backend);
    client.hang_up().await;
    assert!(backend.calls().contains(&kettle_jdb::mock::BackendCall::Terminate));
}

#[tokio::test]
async fn breakpoint_lines_beyond_the_line_range_are_not_wrapped() {
    let dir = tempfile::tempdir().unwrap();
    let foo = dir.path().join("Foo.java");
    std::fs::write(&foo, "public class Foo {}\n").unwrap();

    let backend = MockBackend::new();
    let mut client = TestClient::start(&backend);
    client.initialize().await;

    let response = client
        .request(
            "setBreakpoints",
            json!({
                "source": { "path": foo.display().to_string() },
                "breakpoints": [{ "line": 4_294_967_296u64 }, { "line": 7 }],
            }),
        )
        .await;
    let breakpoints = response["body"]["breakpoints"].as_array().unwrap();
    assert_eq!(breakpoints.len(), 1);
    assert_eq!(breakpoints[0]["line"], 7);

    let legacy = client
        .request(
            "setBreakpoints",
            json!({
                "source": { "path": foo.display().to_string() },
                "lines": [4_294_967_297u64, 3],
            }),
        )
        .await;
    let breakpoints = legacy["body"]["breakpoints"].as_array().unwrap();
    assert_eq!(breakpoints.len(), 1);
    assert_eq!(breakpoints[0]["line"], 3);

    client.request("disconnect", json!({})).await;
    client.finish().await;
}
