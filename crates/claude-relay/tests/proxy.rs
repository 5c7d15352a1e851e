//! End-to-end scenarios through the full relay: listener, handler,
//! router, health tracker, per-provider proxy, and mock upstreams.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use claude_relay::{
    build_message, build_router, ClientAuthConfig, ClientAuthMode, Config, HealthConfig,
    KeyConfig, ProviderConfig, ProviderKind, Relay, ServerConfig,
};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const RELAY_SECRET: &str = "relay-shared-secret";

fn provider(name: &str, kind: ProviderKind, base_url: &str, key: &str) -> ProviderConfig {
    ProviderConfig {
        name: name.into(),
        kind,
        base_url: Some(base_url.into()),
        model_map: HashMap::new(),
        models: vec![],
        keys: vec![KeyConfig {
            secret: key.into(),
            rpm: 0,
            input_tpm: 0,
            output_tpm: 0,
            tpm: 0,
            priority: 0,
            weight: 1,
        }],
        pool: Default::default(),
        weight: 1,
        enabled: true,
        timeout_secs: None,
        region: None,
        project: None,
        resource: None,
        api_version: None,
        auth_method: Default::default(),
    }
}

fn relay_config(providers: Vec<ProviderConfig>, health: HealthConfig) -> Config {
    Config {
        server: ServerConfig {
            listen: "127.0.0.1:0".into(),
            max_body_bytes: 10 * 1024 * 1024,
        },
        auth: ClientAuthConfig {
            mode: ClientAuthMode::SharedSecret,
            secret: Some(RELAY_SECRET.into()),
        },
        providers,
        health,
        ..Default::default()
    }
}

async fn spawn_relay(config: Config) -> (String, Arc<Relay>) {
    let relay = Relay::new(config).expect("relay builds");
    let app = build_router(Arc::clone(&relay));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), relay)
}

async fn request_count(server: &MockServer) -> usize {
    server.received_requests().await.unwrap_or_default().len()
}

#[tokio::test]
async fn zai_happy_path_forwards_key_headers_and_body() {
    let upstream = MockServer::start().await;
    let request_body = json!({
        "model": "GLM-4.7",
        "messages": [{"role": "user", "content": "hi"}],
        "max_tokens": 100
    });
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header("x-api-key", "test-auth-key-for-testing-only"))
        .and(header("anthropic-version", "2023-06-01"))
        .and(body_json(&request_body))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "msg_zai_1",
            "type": "message",
            "usage": {"input_tokens": 9, "output_tokens": 21}
        })))
        .expect(1)
        .mount(&upstream)
        .await;

    let (base, _relay) = spawn_relay(relay_config(
        vec![provider(
            "test-zai",
            ProviderKind::Zai,
            &upstream.uri(),
            "test-auth-key-for-testing-only",
        )],
        HealthConfig::default(),
    ))
    .await;

    let response = reqwest::Client::new()
        .post(format!("{base}/v1/messages"))
        .header("x-api-key", RELAY_SECRET)
        .header("anthropic-version", "2023-06-01")
        .json(&request_body)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert!(response.headers().get("x-relay-request-id").is_some());
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["id"], "msg_zai_1");
}

#[tokio::test]
async fn failover_moves_to_the_next_provider_on_503() {
    let failing = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .expect(1)
        .mount(&failing)
        .await;

    let healthy = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"id": "msg_from_b", "type": "message"})),
        )
        .expect(1)
        .mount(&healthy)
        .await;

    let (base, relay) = spawn_relay(relay_config(
        vec![
            provider("provider-a", ProviderKind::Zai, &failing.uri(), "key-a"),
            provider("provider-b", ProviderKind::Zai, &healthy.uri(), "key-b"),
        ],
        HealthConfig::default(),
    ))
    .await;

    let response = reqwest::Client::new()
        .post(format!("{base}/v1/messages"))
        .header("x-api-key", RELAY_SECRET)
        .json(&json!({"model": "claude-sonnet-4-5", "messages": []}))
        .send()
        .await
        .unwrap();

    // The transient failure is invisible to the client.
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["id"], "msg_from_b");

    assert_eq!(request_count(&failing).await, 1);
    assert_eq!(request_count(&healthy).await, 1);
    assert_eq!(relay.health().failure_count("provider-a"), 1);
}

#[tokio::test]
async fn circuit_opens_after_threshold_and_reprobes_after_cooldown() {
    let failing = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(503).set_body_string("down"))
        .mount(&failing)
        .await;

    let healthy = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"id": "msg_ok", "type": "message"})),
        )
        .mount(&healthy)
        .await;

    let (base, relay) = spawn_relay(relay_config(
        vec![
            provider("provider-a", ProviderKind::Zai, &failing.uri(), "key-a"),
            provider("provider-b", ProviderKind::Zai, &healthy.uri(), "key-b"),
        ],
        HealthConfig {
            failure_threshold: 3,
            open_duration_ms: 300,
            half_open_probes: 1,
            per_key: false,
        },
    ))
    .await;

    let client = reqwest::Client::new();
    let send = |client: reqwest::Client, base: String| async move {
        client
            .post(format!("{base}/v1/messages"))
            .header("x-api-key", RELAY_SECRET)
            .json(&json!({"model": "claude-sonnet-4-5", "messages": []}))
            .send()
            .await
            .unwrap()
    };

    // Three failures open A's circuit; every request still succeeds via B.
    for _ in 0..3 {
        let response = send(client.clone(), base.clone()).await;
        assert_eq!(response.status(), 200);
    }
    assert_eq!(request_count(&failing).await, 3);
    assert_eq!(relay.health().state("provider-a").as_str(), "open");

    // While open, A is not attempted at all.
    let response = send(client.clone(), base.clone()).await;
    assert_eq!(response.status(), 200);
    assert_eq!(request_count(&failing).await, 3);

    // After the cool-down a single probe is admitted; it fails and the
    // breaker reopens.
    tokio::time::sleep(Duration::from_millis(400)).await;
    let response = send(client.clone(), base.clone()).await;
    assert_eq!(response.status(), 200);
    assert_eq!(request_count(&failing).await, 4);
    assert_eq!(relay.health().state("provider-a").as_str(), "open");
}

#[tokio::test]
async fn bedrock_event_stream_is_transcoded_to_sse() {
    let upstream = MockServer::start().await;

    let mut stream_body = Vec::new();
    stream_body.extend_from_slice(&build_message(
        &[
            (":event-type", "message_start"),
            (":content-type", "application/json"),
        ],
        br#"{"type":"message_start","message":{"id":"msg_123"}}"#,
    ));
    stream_body.extend_from_slice(&build_message(
        &[(":event-type", "message_stop")],
        br#"{"type":"message_stop"}"#,
    ));

    Mock::given(method("POST"))
        .and(path(
            "/model/anthropic.claude-sonnet-4-5-20250514-v1:0/invoke-with-response-stream",
        ))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(stream_body, "application/vnd.amazon.eventstream"),
        )
        .expect(1)
        .mount(&upstream)
        .await;

    let mut bedrock = provider(
        "aws",
        ProviderKind::Bedrock,
        &upstream.uri(),
        "AKIAEXAMPLE:secretexample",
    );
    bedrock.region = Some("us-east-1".into());

    let (base, _relay) = spawn_relay(relay_config(vec![bedrock], HealthConfig::default())).await;

    let response = reqwest::Client::new()
        .post(format!("{base}/v1/messages"))
        .header("x-api-key", RELAY_SECRET)
        .json(&json!({
            "model": "anthropic.claude-sonnet-4-5-20250514-v1:0",
            "messages": [],
            "stream": true
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/event-stream"
    );
    assert_eq!(
        response.headers().get("cache-control").unwrap(),
        "no-cache, no-transform"
    );

    let text = response.text().await.unwrap();
    assert_eq!(
        text,
        "event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_123\"}}\n\n\
         event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n"
    );
}

#[tokio::test]
async fn bedrock_request_is_rewritten_for_the_wire() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(
            "/model/anthropic.claude-sonnet-4-5-20250514-v1:0/invoke-with-response-stream",
        ))
        .and(body_json(json!({
            "anthropic_version": "bedrock-2023-05-31",
            "messages": []
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "msg_aws"})))
        .expect(1)
        .mount(&upstream)
        .await;

    let mut bedrock = provider(
        "aws",
        ProviderKind::Bedrock,
        &upstream.uri(),
        "AKIAEXAMPLE:secretexample",
    );
    bedrock.region = Some("us-east-1".into());

    let (base, _relay) = spawn_relay(relay_config(vec![bedrock], HealthConfig::default())).await;

    let response = reqwest::Client::new()
        .post(format!("{base}/v1/messages"))
        .header("x-api-key", RELAY_SECRET)
        .json(&json!({
            "model": "anthropic.claude-sonnet-4-5-20250514-v1:0",
            "messages": []
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn client_auth_failure_returns_the_error_envelope() {
    let upstream = MockServer::start().await;
    let (base, _relay) = spawn_relay(relay_config(
        vec![provider("zai", ProviderKind::Zai, &upstream.uri(), "key")],
        HealthConfig::default(),
    ))
    .await;

    let response = reqwest::Client::new()
        .post(format!("{base}/v1/messages"))
        .header("x-api-key", "wrong-secret")
        .json(&json!({"model": "claude-sonnet-4-5", "messages": []}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 401);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["type"], "error");
    assert_eq!(body["error"]["type"], "authentication_error");
    assert_eq!(request_count(&upstream).await, 0);
}

#[tokio::test]
async fn upstream_4xx_is_not_retried_and_keeps_its_status() {
    let first = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "type": "error",
            "error": {"type": "invalid_request_error", "message": "bad request"}
        })))
        .expect(1)
        .mount(&first)
        .await;

    let second = MockServer::start().await;
    let (base, _relay) = spawn_relay(relay_config(
        vec![
            provider("first", ProviderKind::Zai, &first.uri(), "key-1"),
            provider("second", ProviderKind::Zai, &second.uri(), "key-2"),
        ],
        HealthConfig::default(),
    ))
    .await;

    let response = reqwest::Client::new()
        .post(format!("{base}/v1/messages"))
        .header("x-api-key", RELAY_SECRET)
        .json(&json!({"model": "claude-sonnet-4-5", "messages": []}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["type"], "error");
    assert_eq!(body["error"]["type"], "invalid_request_error");
    // The second provider never saw the request.
    assert_eq!(request_count(&second).await, 0);
}

#[tokio::test]
async fn models_endpoint_aggregates_enabled_providers() {
    let upstream = MockServer::start().await;
    let mut zai = provider("zai", ProviderKind::Zai, &upstream.uri(), "key");
    zai.models = vec!["GLM-4.7".into()];
    let mut native = provider("native", ProviderKind::Anthropic, &upstream.uri(), "key");
    native.models = vec!["claude-sonnet-4-5".into(), "claude-opus-4-6".into()];

    let (base, _relay) =
        spawn_relay(relay_config(vec![zai, native], HealthConfig::default())).await;

    let response = reqwest::Client::new()
        .get(format!("{base}/v1/models"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["object"], "list");
    let data = body["data"].as_array().unwrap();
    assert_eq!(data.len(), 3);
    assert!(data.iter().all(|m| m["object"] == "model"));
    assert!(data
        .iter()
        .any(|m| m["id"] == "GLM-4.7" && m["provider"] == "zai"));
    assert!(data
        .iter()
        .any(|m| m["id"] == "claude-opus-4-6" && m["owned_by"] == "anthropic"));
}

#[tokio::test]
async fn no_providers_yields_an_overloaded_envelope() {
    let (base, _relay) = spawn_relay(relay_config(vec![], HealthConfig::default())).await;

    let response = reqwest::Client::new()
        .post(format!("{base}/v1/messages"))
        .header("x-api-key", RELAY_SECRET)
        .json(&json!({"model": "claude-sonnet-4-5", "messages": []}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 503);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["type"], "overloaded_error");
}

#[tokio::test]
async fn health_endpoint_reports_breaker_states() {
    let upstream = MockServer::start().await;
    let (base, relay) = spawn_relay(relay_config(
        vec![provider("zai", ProviderKind::Zai, &upstream.uri(), "key")],
        HealthConfig {
            failure_threshold: 1,
            open_duration_ms: 60_000,
            half_open_probes: 1,
            per_key: false,
        },
    ))
    .await;

    relay.health().record_failure("zai");

    let body: Value = reqwest::Client::new()
        .get(format!("{base}/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["providers"]["zai"], "open");
}
