use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use rkserve_common::GatewayConfig;
use rkserve_engine::{EngineInput, GenerationEngine, ScriptedBackend};
use rkserve_server::{create_router, AppState};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

fn state_with(backend: ScriptedBackend) -> AppState {
    let engine = Arc::new(GenerationEngine::with_backend(Arc::new(backend)));
    AppState::new(engine, GatewayConfig::default())
}

fn chat_request(body: Value) -> Request<Body> {
    raw_chat_request(serde_json::to_string(&body).unwrap())
}

fn raw_chat_request(body: impl Into<String>) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/rkllm_chat")
        .header("content-type", "application/json")
        .body(Body::from(body.into()))
        .unwrap()
}

fn hello(stream: bool) -> Value {
    json!({"messages": [{"role": "user", "content": "hello"}], "stream": stream})
}

async fn body_json(resp: axum::response::Response) -> Value {
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&body).unwrap()
}

fn parse_frames(body: &str) -> Vec<Value> {
    body.split("\n\n")
        .filter(|f| !f.is_empty())
        .map(|f| serde_json::from_str(f).unwrap())
        .collect()
}

async fn wait_until_busy(state: &AppState) {
    for _ in 0..200 {
        if state.gate.is_busy() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("generation never started");
}

async fn wait_until_free(state: &AppState) {
    for _ in 0..200 {
        if !state.gate.is_busy() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("admission slot was never released");
}

async fn send(app: &Router, req: Request<Body>) -> axum::response::Response {
    app.clone().oneshot(req).await.unwrap()
}

// -- Aggregate mode --

#[tokio::test]
async fn aggregate_hello() {
    let app = create_router(state_with(ScriptedBackend::new(["Hi", " there"])));

    let resp = send(&app, chat_request(hello(false))).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let json = body_json(resp).await;

    assert_eq!(json["object"], "rkllm_chat");
    assert!(json["id"].as_str().unwrap().starts_with("rkllm_chat-"));
    assert!(json["created"].as_i64().unwrap() > 0);
    assert_eq!(json["choices"][0]["index"], 0);
    assert_eq!(json["choices"][0]["message"]["role"], "assistant");
    assert_eq!(json["choices"][0]["message"]["content"], "Hi there");
    assert_eq!(json["choices"][0]["finish_reason"], "stop");
    assert!(json["choices"][0]["logprobs"].is_null());
    assert!(json["usage"]["total_tokens"].is_null());
}

#[tokio::test]
async fn aggregate_one_choice_per_message_in_order() {
    let backend = Arc::new(ScriptedBackend::new(["ok"]));
    let engine = Arc::new(GenerationEngine::with_backend(backend.clone()));
    let app = create_router(AppState::new(engine, GatewayConfig::default()));

    let resp = send(
        &app,
        chat_request(json!({"messages": [
            {"role": "user", "content": "one"},
            {"role": "user", "content": "two"},
            {"content": "three"}
        ]})),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let json = body_json(resp).await;

    let choices = json["choices"].as_array().unwrap();
    assert_eq!(choices.len(), 3);
    for (i, choice) in choices.iter().enumerate() {
        assert_eq!(choice["index"], i);
    }

    assert_eq!(
        backend.inputs(),
        vec![
            EngineInput::from("one"),
            EngineInput::from("two"),
            EngineInput::from("three"),
        ]
    );
}

#[tokio::test]
async fn aggregate_empty_messages() {
    let app = create_router(state_with(ScriptedBackend::new(["x"])));

    let resp = send(&app, chat_request(json!({"messages": []}))).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let json = body_json(resp).await;
    assert!(json["choices"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn aggregate_engine_error_keeps_partial_text() {
    let app = create_router(state_with(
        ScriptedBackend::new(["par", "tial"]).failing_with_status("npu fault"),
    ));

    let resp = send(&app, chat_request(hello(false))).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let json = body_json(resp).await;

    assert_eq!(json["choices"][0]["message"]["content"], "partial");
    assert_eq!(json["choices"][0]["finish_reason"], "error");
}

// -- Streaming mode --

#[tokio::test]
async fn stream_hello() {
    let app = create_router(state_with(ScriptedBackend::new(["Hi", " there"])));

    let resp = send(&app, chat_request(hello(true))).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let content_type = resp.headers()["content-type"].to_str().unwrap().to_string();
    assert!(content_type.starts_with("text/plain"), "got {content_type}");

    let body = resp.into_body().collect().await.unwrap().to_bytes();
    let frames = parse_frames(std::str::from_utf8(&body).unwrap());

    assert_eq!(frames.len(), 3);
    assert_eq!(frames[0]["choices"][0]["delta"]["content"], "Hi");
    assert!(frames[0]["choices"][0]["finish_reason"].is_null());
    assert_eq!(frames[1]["choices"][0]["delta"]["content"], " there");
    assert_eq!(frames[2]["choices"][0]["finish_reason"], "stop");
    assert_eq!(frames[2]["object"], "rkllm_chat");
    assert_eq!(frames[0]["id"], frames[2]["id"]);
}

#[tokio::test]
async fn stream_tags_frames_with_message_index() {
    let app = create_router(state_with(ScriptedBackend::new(["a"])));

    let resp = send(
        &app,
        chat_request(json!({
            "messages": [{"content": "one"}, {"content": "two"}],
            "stream": true
        })),
    )
    .await;
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    let frames = parse_frames(std::str::from_utf8(&body).unwrap());

    let indices: Vec<_> = frames
        .iter()
        .map(|f| f["choices"][0]["index"].as_u64().unwrap())
        .collect();
    assert_eq!(indices, vec![0, 0, 1, 1]);
}

#[tokio::test]
async fn stream_sends_first_frame_before_completion() {
    let (release_tx, release_rx) = crossbeam::channel::bounded(1);
    let state = state_with(ScriptedBackend::new(["Hi", " there"]).with_hold(release_rx));
    let app = create_router(state.clone());

    let resp = send(&app, chat_request(hello(true))).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let mut body = resp.into_body();

    let first = body.frame().await.unwrap().unwrap().into_data().unwrap();
    let first: Value = serde_json::from_str(std::str::from_utf8(&first).unwrap().trim_end()).unwrap();
    assert_eq!(first["choices"][0]["delta"]["content"], "Hi");
    assert!(state.gate.is_busy());

    drop(release_tx);
    let rest = body.collect().await.unwrap().to_bytes();
    let frames = parse_frames(std::str::from_utf8(&rest).unwrap());
    assert_eq!(frames.last().unwrap()["choices"][0]["finish_reason"], "stop");
    assert!(!state.gate.is_busy());
}

#[tokio::test]
async fn stream_engine_error_ends_with_error_frame() {
    let app = create_router(state_with(
        ScriptedBackend::new(["Hi"]).failing_with_error("run returned -1"),
    ));

    let resp = send(&app, chat_request(hello(true))).await;
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    let frames = parse_frames(std::str::from_utf8(&body).unwrap());

    assert_eq!(frames.len(), 2);
    assert_eq!(frames[1]["choices"][0]["finish_reason"], "error");
}

// -- Admission --

#[tokio::test]
async fn concurrent_request_is_rejected_busy() {
    let (release_tx, release_rx) = crossbeam::channel::bounded(1);
    let state = state_with(ScriptedBackend::new(["Hi"]).with_hold(release_rx));
    let app = create_router(state.clone());

    let first = tokio::spawn(app.clone().oneshot(chat_request(hello(false))));
    wait_until_busy(&state).await;

    let resp = send(&app, chat_request(hello(false))).await;
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    let json = body_json(resp).await;
    assert_eq!(json["status"], "error");
    assert_eq!(
        json["message"],
        "RKLLM_Server is busy! Maybe you can try again later."
    );

    // Busy wins over a malformed body.
    let resp = send(&app, raw_chat_request("not json")).await;
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

    drop(release_tx);
    let resp = first.await.unwrap().unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = send(&app, chat_request(hello(false))).await;
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn slot_is_free_after_each_outcome() {
    let state = state_with(ScriptedBackend::new(["x"]).failing_with_status("boom"));
    let app = create_router(state.clone());

    let resp = send(&app, chat_request(hello(false))).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(!state.gate.is_busy());

    let resp = send(&app, raw_chat_request("{")).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert!(!state.gate.is_busy());

    let resp = send(&app, chat_request(hello(true))).await;
    resp.into_body().collect().await.unwrap();
    assert!(!state.gate.is_busy());

    let resp = send(&app, chat_request(hello(false))).await;
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn stream_disconnect_keeps_slot_until_generation_ends() {
    let (release_tx, release_rx) = crossbeam::channel::bounded(1);
    let state = state_with(ScriptedBackend::new(["Hi", " there"]).with_hold(release_rx));
    let app = create_router(state.clone());

    let resp = send(&app, chat_request(hello(true))).await;
    let mut body = resp.into_body();
    body.frame().await.unwrap().unwrap();
    drop(body);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(state.gate.is_busy());
    let resp = send(&app, chat_request(hello(false))).await;
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

    drop(release_tx);
    wait_until_free(&state).await;

    let resp = send(&app, chat_request(hello(false))).await;
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn aggregate_disconnect_keeps_slot_until_generation_ends() {
    let (release_tx, release_rx) = crossbeam::channel::bounded(1);
    let state = state_with(ScriptedBackend::new(["Hi"]).with_hold(release_rx));
    let app = create_router(state.clone());

    let request = tokio::spawn(app.clone().oneshot(chat_request(hello(false))));
    wait_until_busy(&state).await;
    request.abort();
    assert!(request.await.unwrap_err().is_cancelled());

    assert!(state.gate.is_busy());

    drop(release_tx);
    wait_until_free(&state).await;

    let resp = send(&app, chat_request(hello(false))).await;
    assert_eq!(resp.status(), StatusCode::OK);
}

// -- Request validation --

#[tokio::test]
async fn malformed_requests_are_rejected() {
    let app = create_router(state_with(ScriptedBackend::new(["x"])));

    for body in [
        "not json".to_string(),
        json!({"stream": false}).to_string(),
        json!({"messages": [{"role": "user"}]}).to_string(),
        json!({"messages": "hello"}).to_string(),
    ] {
        let resp = send(&app, raw_chat_request(body.clone())).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "body: {body}");
        let json = body_json(resp).await;
        assert_eq!(json["status"], "error");
        assert!(json["message"]
            .as_str()
            .unwrap()
            .starts_with("Invalid JSON data!"));
    }
}

#[tokio::test]
async fn uninitialized_engine_returns_500() {
    let state = AppState::new(Arc::new(GenerationEngine::new()), GatewayConfig::default());
    let app = create_router(state.clone());

    let resp = send(&app, chat_request(hello(false))).await;
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let json = body_json(resp).await;
    assert_eq!(json["message"], "RKLLM model is not initialized!");
    assert!(!state.gate.is_busy());
}

// -- Operational routes --

#[tokio::test]
async fn health_reports_state() {
    let app = create_router(state_with(ScriptedBackend::new(["x"])));

    let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let resp = send(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let json = body_json(resp).await;

    assert_eq!(json["status"], "ok");
    assert_eq!(json["initialized"], true);
    assert_eq!(json["busy"], false);
}

#[tokio::test]
async fn metrics_are_exposed() {
    let app = create_router(state_with(ScriptedBackend::new(["x"])));
    send(&app, chat_request(hello(false))).await;

    let req = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
    let resp = send(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8(body.to_vec()).unwrap();

    assert!(text.contains("rkserve_requests_total"));
}

#[tokio::test]
async fn metrics_can_be_disabled() {
    let mut config = GatewayConfig::default();
    config.observability.enable_metrics = false;
    let engine = Arc::new(GenerationEngine::with_backend(Arc::new(ScriptedBackend::new(["x"]))));
    let app = create_router(AppState::new(engine, config));

    let req = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
    let resp = send(&app, req).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}
