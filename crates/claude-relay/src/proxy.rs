//! Per-provider upstream proxy.
//!
//! One instance per configured provider, owning the adapter, a dedicated
//! upstream client, the key pool, and the response post-processing step
//! (usage accounting for buffered JSON, event-stream transcoding for
//! Bedrock). The handler routes to a proxy after provider selection; the
//! proxy never picks providers itself.

use std::sync::Arc;

use axum::body::Body;
use axum::response::Response;
use bytes::Bytes;
use futures::TryStreamExt;
use http::header::{CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, RETRY_AFTER, TRANSFER_ENCODING};
use http::{HeaderMap, StatusCode};
use reqwest::Client;
use std::time::Duration;

use crate::auth::{ClientCredential, RequestCredential};
use crate::client::upstream_client;
use crate::config::{CacheConfig, HealthConfig, ProviderConfig};
use crate::error::{Error, Result, UpstreamHttpError};
use crate::eventstream::{sse_response_headers, EventStreamToSse};
use crate::health::HealthTracker;
use crate::pool::{KeyPool, PooledKey};
use crate::providers::{create_provider, ProviderAdapter};

pub struct ProviderProxy {
    adapter: Arc<dyn ProviderAdapter>,
    client: Client,
    pool: Option<KeyPool>,
    pool_enabled: bool,
    fallback_key: Option<String>,
    per_key_health: bool,
}

/// Successful upstream exchange, pending response post-processing.
pub struct UpstreamReply {
    response: reqwest::Response,
    key: Option<Arc<PooledKey>>,
}

impl UpstreamReply {
    pub fn status(&self) -> StatusCode {
        self.response.status()
    }
}

impl ProviderProxy {
    pub fn from_config(
        config: &ProviderConfig,
        cache: &CacheConfig,
        health: &HealthConfig,
    ) -> Result<Self> {
        Ok(Self {
            adapter: create_provider(config, cache)?,
            client: upstream_client(config.timeout())?,
            pool: KeyPool::from_config(config),
            pool_enabled: config.pool_enabled(),
            fallback_key: config.keys.first().map(|k| k.secret.clone()),
            per_key_health: health.per_key,
        })
    }

    pub fn adapter(&self) -> &Arc<dyn ProviderAdapter> {
        &self.adapter
    }

    pub fn name(&self) -> &str {
        self.adapter.name()
    }

    fn key_entity(&self, key: &PooledKey) -> String {
        format!("{}/key-{}", self.adapter.name(), key.index)
    }

    /// Resolve credential material for one attempt. Transparent-auth
    /// providers are handled by the caller; this path always consumes
    /// relay-owned keys.
    fn resolve_key(
        &self,
        tracker: &HealthTracker,
    ) -> Result<(RequestCredential, Option<Arc<PooledKey>>)> {
        if self.pool_enabled {
            if let Some(pool) = &self.pool {
                if self.per_key_health {
                    for _ in 0..pool.len() {
                        let key = pool.select()?;
                        if tracker.try_admit(&self.key_entity(&key)) {
                            return Ok((RequestCredential::PoolKey(key.secret.clone()), Some(key)));
                        }
                    }
                    return Err(Error::CircuitOpen(self.adapter.name().to_string()));
                }
                let key = pool.select()?;
                return Ok((RequestCredential::PoolKey(key.secret.clone()), Some(key)));
            }
        }
        match &self.fallback_key {
            Some(secret) => Ok((RequestCredential::PoolKey(secret.clone()), None)),
            None => Ok((RequestCredential::None, None)),
        }
    }

    /// One attempt against this provider: transform, authenticate, send,
    /// and classify the status. Non-2xx becomes a provider error carrying
    /// the upstream status so the router can consult its trigger set.
    pub async fn dispatch(
        &self,
        endpoint: &str,
        body: Bytes,
        client_headers: &HeaderMap,
        client_credential: &ClientCredential,
        tracker: &HealthTracker,
    ) -> Result<UpstreamReply> {
        let transformed = self.adapter.transform_request(body, endpoint)?;
        let mut headers = self.adapter.forward_headers(client_headers);

        let (credential, key) =
            if self.adapter.supports_transparent_auth() && !client_credential.is_empty() {
                (RequestCredential::Client(client_credential.clone()), None)
            } else {
                self.resolve_key(tracker)?
            };
        self.adapter
            .authenticate(&mut headers, &transformed.url, &transformed.body, &credential)
            .await?;

        tracing::debug!(
            provider = self.adapter.name(),
            url = %transformed.url,
            "dispatching upstream request"
        );

        let response = self
            .client
            .post(transformed.url)
            .headers(headers)
            .body(transformed.body)
            .send()
            .await
            .map_err(|err| {
                if let Some(key) = &key {
                    if self.per_key_health {
                        tracker.record_failure(&self.key_entity(key));
                    }
                }
                Error::Provider {
                    provider: self.adapter.name().to_string(),
                    source: err.into(),
                    retry_after: None,
                    http: None,
                }
            })?;

        tracing::debug!(
            provider = self.adapter.name(),
            status = response.status().as_u16(),
            "received upstream response"
        );

        if !response.status().is_success() {
            let status = response.status();
            let upstream_headers = response.headers().clone();
            let retry_after = parse_retry_after(&upstream_headers);
            let text = response.text().await.unwrap_or_default();
            if let Some(key) = &key {
                if self.per_key_health {
                    tracker.record_failure(&self.key_entity(key));
                }
            }
            return Err(Error::Provider {
                provider: self.adapter.name().to_string(),
                source: anyhow::anyhow!("HTTP {status}: {text}"),
                retry_after,
                http: Some(UpstreamHttpError::new(
                    status.as_u16(),
                    upstream_headers,
                    text,
                )),
            });
        }

        if let Some(key) = &key {
            if self.per_key_health {
                tracker.record_success(&self.key_entity(key));
            }
        }

        Ok(UpstreamReply { response, key })
    }

    /// Turn the upstream reply into the client response: Bedrock
    /// event-stream bodies are transcoded to SSE, buffered JSON bodies
    /// feed usage accounting, everything else streams through unchanged.
    pub async fn into_client_response(&self, reply: UpstreamReply) -> Result<Response> {
        let UpstreamReply { response, key } = reply;
        let status = response.status();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        if self.adapter.wants_sse_transcode(&content_type) {
            if let Some(key) = &key {
                key.record(0, 0);
            }
            let headers = sse_response_headers(response.headers());
            let upstream = Box::pin(response.bytes_stream().map_err(Error::from));
            let body = Body::from_stream(EventStreamToSse::new(upstream));
            return build_response(status, headers, body);
        }

        if content_type.starts_with("application/json") {
            let headers = passthrough_headers(response.headers());
            let bytes = response.bytes().await?;
            if let Some(key) = &key {
                let (input_tokens, output_tokens) = extract_usage(&bytes);
                key.record(input_tokens, output_tokens);
            }
            return build_response(status, headers, Body::from(bytes));
        }

        // SSE and anything else: stream through unmodified.
        if let Some(key) = &key {
            key.record(0, 0);
        }
        let headers = passthrough_headers(response.headers());
        let body = Body::from_stream(response.bytes_stream().map_err(Error::from));
        build_response(status, headers, body)
    }
}

fn build_response(status: StatusCode, headers: HeaderMap, body: Body) -> Result<Response> {
    let mut builder = Response::builder().status(status);
    if let Some(map) = builder.headers_mut() {
        *map = headers;
    }
    builder
        .body(body)
        .map_err(|e| Error::InvalidRequest(format!("failed to build response: {e}")))
}

/// Upstream headers minus the framing ones hyper manages itself.
fn passthrough_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in upstream {
        if name == CONTENT_LENGTH || name == TRANSFER_ENCODING || name == CONNECTION {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers
}

/// `Retry-After` in either form RFC 7231 allows: delta-seconds or an
/// HTTP-date. A date already in the past still counts as a present header
/// (zero wait), so the failover trigger fires either way.
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let date = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let wait = date.signed_duration_since(chrono::Utc::now());
    Some(wait.to_std().unwrap_or(Duration::ZERO))
}

/// Token counts from the upstream `usage` field, when present.
fn extract_usage(body: &[u8]) -> (u64, u64) {
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) else {
        return (0, 0);
    };
    let usage = &value["usage"];
    (
        usage["input_tokens"].as_u64().unwrap_or(0),
        usage["output_tokens"].as_u64().unwrap_or(0),
    )
}
