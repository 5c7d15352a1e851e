//! Configuration loading: format dispatch, env expansion, and the
//! validation matrix.

use claude_relay::{load_config, ClientAuthMode, PoolStrategy, ProviderKind, RouteStrategy};

fn write_config(dir: &tempfile::TempDir, name: &str, contents: &str) -> std::path::PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, contents).unwrap();
    path
}

#[test]
fn yaml_config_loads_with_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        &dir,
        "relay.yaml",
        r#"
server:
  listen: 0.0.0.0:8082
auth:
  mode: shared_secret
  secret: hunter2
providers:
  - name: primary
    type: anthropic
    keys:
      - secret: sk-ant-primary
        rpm: 60
  - name: aws
    type: bedrock
    region: us-east-1
    keys:
      - secret: "AKIA:secret"
routing:
  strategy: failover
"#,
    );

    let config = load_config(&path).unwrap();
    assert_eq!(config.server.listen, "0.0.0.0:8082");
    assert_eq!(config.auth.mode, ClientAuthMode::SharedSecret);
    assert_eq!(config.providers.len(), 2);
    assert_eq!(config.providers[0].kind, ProviderKind::Anthropic);
    assert_eq!(config.providers[0].keys[0].rpm, 60);
    assert_eq!(config.providers[1].region.as_deref(), Some("us-east-1"));
    assert_eq!(config.routing.strategy, RouteStrategy::Failover);
    assert_eq!(config.routing.failover_timeout_ms, 5_000);
    assert_eq!(config.server.max_body_bytes, 10 * 1024 * 1024);
    assert_eq!(config.providers[0].pool.strategy, PoolStrategy::LeastLoaded);
}

#[test]
fn toml_config_loads_by_extension() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        &dir,
        "relay.toml",
        r#"
[server]
listen = "127.0.0.1:9000"

[[providers]]
name = "local"
type = "ollama"

[routing]
strategy = "round_robin"
"#,
    );

    let config = load_config(&path).unwrap();
    assert_eq!(config.server.listen, "127.0.0.1:9000");
    assert_eq!(config.providers[0].kind, ProviderKind::Ollama);
    assert_eq!(config.routing.strategy, RouteStrategy::RoundRobin);
}

#[test]
fn unknown_extension_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(&dir, "relay.conf", "server:\n  listen: 0.0.0.0:8082\n");
    assert!(load_config(&path).is_err());
}

#[test]
fn env_references_expand_before_parsing() {
    std::env::set_var("RELAY_CONFIG_TEST_KEY", "sk-from-environment");
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        &dir,
        "relay.yaml",
        r#"
server:
  listen: 0.0.0.0:8082
providers:
  - name: primary
    type: anthropic
    keys:
      - secret: ${RELAY_CONFIG_TEST_KEY}
"#,
    );

    let config = load_config(&path).unwrap();
    assert_eq!(config.providers[0].keys[0].secret, "sk-from-environment");
}

#[test]
fn unknown_provider_type_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        &dir,
        "relay.yaml",
        r#"
server:
  listen: 0.0.0.0:8082
providers:
  - name: mystery
    type: frontier
"#,
    );
    assert!(load_config(&path).is_err());
}

#[test]
fn duplicate_provider_names_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        &dir,
        "relay.yaml",
        r#"
server:
  listen: 0.0.0.0:8082
providers:
  - name: twin
    type: anthropic
  - name: twin
    type: zai
"#,
    );
    assert!(load_config(&path).is_err());
}

#[test]
fn missing_cloud_fields_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    for body in [
        "  - name: aws\n    type: bedrock\n",
        "  - name: gcp\n    type: vertex\n    region: us-central1\n",
        "  - name: az\n    type: azure\n",
    ] {
        let path = write_config(
            &dir,
            "relay.yaml",
            &format!("server:\n  listen: 0.0.0.0:8082\nproviders:\n{body}"),
        );
        assert!(load_config(&path).is_err(), "expected rejection for:\n{body}");
    }
}

#[test]
fn negative_numerics_are_rejected_at_parse() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        &dir,
        "relay.yaml",
        r#"
server:
  listen: 0.0.0.0:8082
providers:
  - name: primary
    type: anthropic
    keys:
      - secret: sk-x
        rpm: -5
"#,
    );
    assert!(load_config(&path).is_err());
}

#[test]
fn unknown_routing_strategy_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        &dir,
        "relay.yaml",
        r#"
server:
  listen: 0.0.0.0:8082
routing:
  strategy: coin_flip
"#,
    );
    assert!(load_config(&path).is_err());
}

#[test]
fn model_based_without_routes_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        &dir,
        "relay.yaml",
        r#"
server:
  listen: 0.0.0.0:8082
providers:
  - name: primary
    type: anthropic
routing:
  strategy: model_based
"#,
    );
    assert!(load_config(&path).is_err());

    let path = write_config(
        &dir,
        "relay2.yaml",
        r#"
server:
  listen: 0.0.0.0:8082
providers:
  - name: primary
    type: anthropic
routing:
  strategy: model_based
  model_routes:
    claude-sonnet-4-5: primary
"#,
    );
    assert!(load_config(&path).is_ok());
}

#[test]
fn out_of_range_key_priority_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        &dir,
        "relay.yaml",
        r#"
server:
  listen: 0.0.0.0:8082
providers:
  - name: primary
    type: anthropic
    keys:
      - secret: sk-x
        priority: 7
"#,
    );
    assert!(load_config(&path).is_err());
}

#[test]
fn invalid_health_bounds_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        &dir,
        "relay.yaml",
        r#"
server:
  listen: 0.0.0.0:8082
health:
  open_duration_ms: 0
"#,
    );
    assert!(load_config(&path).is_err());
}
