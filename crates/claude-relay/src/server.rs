//! Axum front door and the relay's derived runtime state.
//!
//! `Relay` pairs the config snapshot cell with the state rebuilt from each
//! snapshot: the per-provider proxy table and the router. In-flight
//! requests keep the state they started with; a reload swaps the whole
//! bundle atomically.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, HeaderValue, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;

use crate::auth::{authenticate_client, ClientCredential};
use crate::config::{Config, ConfigCell};
use crate::error::{Error, Result};
use crate::health::HealthTracker;
use crate::proxy::ProviderProxy;
use crate::router::{ProviderInfo, Router};

const REQUEST_ID_HEADER: &str = "x-relay-request-id";

/// Runtime derived from one config snapshot.
pub struct RelayState {
    pub config: Arc<Config>,
    pub proxies: HashMap<String, Arc<ProviderProxy>>,
    pub router: Router,
}

pub struct Relay {
    cell: Arc<ConfigCell>,
    state: ArcSwap<RelayState>,
    health: Arc<HealthTracker>,
}

impl Relay {
    pub fn new(config: Config) -> Result<Arc<Self>> {
        config.validate()?;
        let health = Arc::new(HealthTracker::new(&config.health));
        let cell = Arc::new(ConfigCell::new(config));
        let state = build_state(cell.load())?;
        Ok(Arc::new(Self {
            cell,
            state: ArcSwap::from_pointee(state),
            health,
        }))
    }

    pub fn config_cell(&self) -> Arc<ConfigCell> {
        Arc::clone(&self.cell)
    }

    pub fn health(&self) -> Arc<HealthTracker> {
        Arc::clone(&self.health)
    }

    pub fn snapshot(&self) -> Arc<RelayState> {
        self.state.load_full()
    }

    /// Rebuild derived state from a freshly published config snapshot.
    /// A snapshot that fails to build leaves the previous state serving.
    pub fn apply_snapshot(&self, config: Arc<Config>) {
        match build_state(config) {
            Ok(state) => {
                self.state.store(Arc::new(state));
                tracing::info!("relay state rebuilt from new configuration");
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to rebuild relay state, keeping previous");
            }
        }
    }

    /// Router input rows: enabled providers in config order with the
    /// breaker verdict applied. Streaming requests drop adapters that
    /// cannot stream.
    fn provider_infos(&self, state: &RelayState, streaming: bool) -> Vec<ProviderInfo> {
        state
            .config
            .providers
            .iter()
            .filter(|p| p.enabled)
            .filter(|p| {
                !streaming
                    || state
                        .proxies
                        .get(&p.name)
                        .is_some_and(|proxy| proxy.adapter().supports_streaming())
            })
            .map(|p| ProviderInfo {
                name: p.name.clone(),
                kind: p.kind,
                weight: p.weight,
                healthy: self.health.is_available(&p.name),
            })
            .collect()
    }
}

fn build_state(config: Arc<Config>) -> Result<RelayState> {
    let mut proxies = HashMap::new();
    for provider in config.providers.iter().filter(|p| p.enabled) {
        proxies.insert(
            provider.name.clone(),
            Arc::new(ProviderProxy::from_config(
                provider,
                &config.cache,
                &config.health,
            )?),
        );
    }
    let router = Router::from_config(&config.routing);
    Ok(RelayState {
        config,
        proxies,
        router,
    })
}

pub fn build_router(relay: Arc<Relay>) -> axum::Router {
    let max_body = relay.snapshot().config.server.max_body_bytes;
    axum::Router::new()
        .route("/v1/messages", post(handle_messages))
        .route("/v1/models", get(handle_models))
        .route("/health", get(handle_health))
        .layer(DefaultBodyLimit::max(max_body))
        .with_state(relay)
}

/// Bind the configured listener and serve until SIGINT/SIGTERM.
pub async fn serve(relay: Arc<Relay>) -> Result<()> {
    let listen = relay.snapshot().config.server.listen.clone();
    let listener = tokio::net::TcpListener::bind(&listen).await?;
    tracing::info!(address = %listen, "claude-relay listening");

    axum::serve(listener, build_router(relay))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("claude-relay shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install sigterm handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

async fn handle_messages(
    State(relay): State<Arc<Relay>>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request_id = uuid::Uuid::new_v4().to_string();
    let state = relay.snapshot();

    let credential = match authenticate_client(&state.config.auth, &headers) {
        Ok(credential) => credential,
        Err(err) => return error_response(&err, &request_id),
    };
    // Only a passthrough credential may reach a transparent-auth provider;
    // a shared secret authenticates the client against the relay alone.
    let credential = match state.config.auth.mode {
        crate::config::ClientAuthMode::Passthrough => credential,
        crate::config::ClientAuthMode::SharedSecret => ClientCredential::default(),
    };

    // One bounded read, shared by every attempt; the JSON scan pulls the
    // routing hints without re-encoding the body.
    let parsed: Option<serde_json::Value> = serde_json::from_slice(&body).ok();
    let model = parsed
        .as_ref()
        .and_then(|v| v.get("model"))
        .and_then(|m| m.as_str())
        .map(str::to_string);
    let streaming = parsed
        .as_ref()
        .and_then(|v| v.get("stream"))
        .and_then(|s| s.as_bool())
        .unwrap_or(false);

    let endpoint = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| uri.path().to_string());

    let infos = relay.provider_infos(&state, streaming);
    let outcome = state
        .router
        .select_with_retry(&infos, model.as_deref(), |provider| {
            let state = Arc::clone(&state);
            let relay = Arc::clone(&relay);
            let endpoint = endpoint.clone();
            let body = body.clone();
            let headers = headers.clone();
            let credential = credential.clone();
            async move {
                attempt_provider(
                    &relay, &state, &provider, &endpoint, body, &headers, &credential,
                )
                .await
            }
        })
        .await;

    match outcome {
        Ok((provider, reply)) => {
            let proxy = state
                .proxies
                .get(&provider.name)
                .expect("winning provider has a proxy");
            match proxy.into_client_response(reply).await {
                Ok(mut response) => {
                    if let Ok(value) = HeaderValue::from_str(&request_id) {
                        response.headers_mut().insert(REQUEST_ID_HEADER, value);
                    }
                    response
                }
                Err(err) => error_response(&err, &request_id),
            }
        }
        Err(err) => {
            tracing::warn!(request_id = %request_id, error = %err, "request failed");
            error_response(&err, &request_id)
        }
    }
}

async fn attempt_provider(
    relay: &Relay,
    state: &RelayState,
    provider: &ProviderInfo,
    endpoint: &str,
    body: Bytes,
    headers: &HeaderMap,
    credential: &ClientCredential,
) -> Result<crate::proxy::UpstreamReply> {
    let proxy = state
        .proxies
        .get(&provider.name)
        .ok_or_else(|| Error::UnknownProvider(provider.name.clone()))?;

    // Admission consumes a half-open probe, so it happens exactly once
    // per attempted provider, right before dispatch.
    if !relay.health.try_admit(&provider.name) {
        return Err(Error::CircuitOpen(provider.name.clone()));
    }

    match proxy
        .dispatch(endpoint, body, headers, credential, &relay.health)
        .await
    {
        Ok(reply) => {
            relay.health.record_success(&provider.name);
            Ok(reply)
        }
        Err(err) => {
            // Only upstream-attributable failures feed the breaker; pool
            // saturation and client mistakes do not.
            if !matches!(err, Error::CircuitOpen(_)) && err.is_failover_trigger() {
                relay.health.record_failure(&provider.name);
            }
            Err(err)
        }
    }
}

async fn handle_models(State(relay): State<Arc<Relay>>) -> Response {
    let state = relay.snapshot();
    let mut data = Vec::new();
    for provider in state.config.providers.iter().filter(|p| p.enabled) {
        if let Some(proxy) = state.proxies.get(&provider.name) {
            data.extend(proxy.adapter().list_models());
        }
    }
    Json(serde_json::json!({ "object": "list", "data": data })).into_response()
}

async fn handle_health(State(relay): State<Arc<Relay>>) -> Response {
    let state = relay.snapshot();
    let mut providers = serde_json::Map::new();
    for provider in state.config.providers.iter().filter(|p| p.enabled) {
        providers.insert(
            provider.name.clone(),
            serde_json::Value::String(relay.health.state(&provider.name).as_str().to_string()),
        );
    }
    Json(serde_json::json!({ "status": "ok", "providers": providers })).into_response()
}

fn error_response(err: &Error, request_id: &str) -> Response {
    let status = err.client_status();
    let mut response = (status, Json(err.to_envelope())).into_response();
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}
