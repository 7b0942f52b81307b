//! HTTP binding end-to-end tests against the router.

mod common;

use axum::{
    body::Body,
    http::{header::CONTENT_TYPE, Request, StatusCode},
    response::Response,
};
use serde_json::{json, Value};
use tower::ServiceExt;

use ulgw_bindings::router;
use ulgw_core::{
    Attribute, CommandStatus, CommandStore, Device, QueuedCommand, SinkCall, TIME_INSTANT,
};

use common::{default_setup, TestContext};

async fn send(t: &TestContext, request: Request<Body>) -> Response {
    router(t.ctx.clone()).oneshot(request).await.unwrap()
}

async fn get(t: &TestContext, uri: &str) -> Response {
    send(t, Request::builder().uri(uri).body(Body::empty()).unwrap()).await
}

async fn post(t: &TestContext, uri: &str, content_type: &str, body: &str) -> Response {
    send(
        t,
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(CONTENT_TYPE, content_type)
            .body(Body::from(body.to_string()))
            .unwrap(),
    )
    .await
}

async fn body_text(response: Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn body_json(response: Response) -> Value {
    serde_json::from_str(&body_text(response).await).unwrap()
}

#[tokio::test]
async fn test_get_single_measure() {
    let t = default_setup();
    let response = get(&t, "/iot/d?i=dev1&k=1234&d=a%7C23").await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "");
    assert_eq!(
        t.sink.updates().await,
        vec![vec![Attribute::new("a", "Text", "23")]]
    );
}

#[tokio::test]
async fn test_post_multiple_groups_in_order() {
    let t = default_setup();
    let response = post(&t, "/iot/d?i=dev1&k=1234", "text/plain", "c|7#b|18").await;

    assert_eq!(response.status(), StatusCode::OK);
    let updates = t.sink.updates().await;
    assert_eq!(updates.len(), 2);
    assert_eq!(updates[0][0].name, "c");
    assert_eq!(updates[1][0].name, "b");
    assert_eq!(updates[1][0].value, json!("18"));
}

#[tokio::test]
async fn test_missing_params() {
    let t = default_setup();

    let response = get(&t, "/iot/d?i=dev1&d=a%7C1").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["name"], "MANDATORY_PARAMS_NOT_FOUND");
    assert!(body["message"].as_str().unwrap().contains('k'));

    let response = get(&t, "/iot/d?i=dev1&k=1234").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    assert!(t.sink.calls().await.is_empty());
}

#[tokio::test]
async fn test_post_requires_text_plain() {
    let t = default_setup();
    let response = post(&t, "/iot/d?i=dev1&k=1234", "application/json", "a|1").await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["name"], "UNSUPPORTED_TYPE");
    assert!(t.sink.calls().await.is_empty());
}

#[tokio::test]
async fn test_parse_error_makes_no_updates() {
    let t = default_setup();
    let response = get(&t, "/iot/d?i=dev1&k=1234&d=a%7C10%7Cb%7C11%23%23t%7C3").await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["name"], "PARSE_ERROR");
    assert!(t.sink.calls().await.is_empty());
}

#[tokio::test]
async fn test_unknown_apikey() {
    let t = default_setup();
    let response = get(&t, "/iot/d?i=devX&k=nokey&d=a%7C1").await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await["name"], "GROUP_NOT_FOUND");
}

#[tokio::test]
async fn test_unknown_device_is_provisioned() {
    let t = default_setup();
    let response = get(&t, "/iot/d?i=dev7&k=1234&d=a%7C1").await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(t.registry.devices().await.len(), 2);
    assert!(matches!(
        &t.sink.calls().await[0],
        SinkCall::Update { device_id, .. } if device_id == "dev7"
    ));
}

#[tokio::test]
async fn test_timestamp_param_is_stamped() {
    let t = default_setup();
    let response = get(
        &t,
        "/iot/d?i=dev1&k=1234&d=a%7C1%23b%7C2&t=2016-06-13T00:35:30Z",
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    for update in t.sink.updates().await {
        assert_eq!(update[0].name, TIME_INSTANT);
        assert_eq!(update[0].value, json!("2016-06-13T00:35:30Z"));
        assert_eq!(update[0].kind, "DateTime");
    }

    let response = get(&t, "/iot/d?i=dev1&k=1234&d=a%7C1&t=later").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_poll_returns_queued_commands() {
    let t = default_setup();
    let device = Device::new("dev1", "1234");
    t.ctx
        .correlator
        .register(&device, "ping", json!("1"))
        .await
        .unwrap();
    for (name, value) in [("ping", json!("1")), ("reset", Value::Null)] {
        t.store
            .enqueue_command(QueuedCommand {
                api_key: "1234".to_string(),
                device_id: "dev1".to_string(),
                name: name.to_string(),
                kind: "command".to_string(),
                value,
            })
            .await
            .unwrap();
    }

    let response = get(&t, "/iot/d?i=dev1&k=1234&d=a%7C1&getCmd=1").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "dev1@ping|1|dev1@reset");
    assert!(t.store.is_empty().await);

    let statuses: Vec<(String, CommandStatus)> = t
        .sink
        .command_results()
        .await
        .into_iter()
        .map(|(name, _, status)| (name, status))
        .collect();
    assert_eq!(
        statuses,
        vec![
            ("ping".to_string(), CommandStatus::Pending),
            ("ping".to_string(), CommandStatus::Delivered),
            ("reset".to_string(), CommandStatus::Delivered),
        ]
    );

    let response = get(&t, "/iot/d?i=dev1&k=1234&d=a%7C2&getCmd=1").await;
    assert_eq!(body_text(response).await, "");
}

#[tokio::test]
async fn test_command_result_in_measures() {
    let t = default_setup();
    let response = post(
        &t,
        "/iot/d?i=dev1&k=1234",
        "text/plain",
        "a|1#dev1@ping|Ping ok",
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(t.sink.updates().await.len(), 1);
    assert_eq!(
        t.sink.command_results().await,
        vec![(
            "ping".to_string(),
            "Ping ok".to_string(),
            CommandStatus::Completed
        )]
    );
}

#[tokio::test]
async fn test_command_result_endpoint() {
    let t = default_setup();
    let response = post(
        &t,
        "/iot/d/commands?i=dev1&k=1234",
        "text/plain",
        "dev1@reset|done",
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        t.sink.command_results().await,
        vec![(
            "reset".to_string(),
            "done".to_string(),
            CommandStatus::Completed
        )]
    );

    let response = post(&t, "/iot/d/commands?i=dev1&k=1234", "text/plain", "garbage").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
