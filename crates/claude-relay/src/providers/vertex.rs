use async_trait::async_trait;
use bytes::Bytes;
use http::HeaderMap;
use reqwest::Client;
use url::Url;

use crate::auth::google::{ServiceAccountKey, VertexTokenSource};
use crate::auth::{RequestCredential, UpstreamAuth};
use crate::client::shared_client;
use crate::config::{CacheConfig, ProviderConfig, ProviderKind};
use crate::error::{Error, Result};
use crate::providers::{
    AdapterCore, Model, ProviderAdapter, TransformedRequest, VersionHandling,
    VERTEX_ANTHROPIC_VERSION,
};

const STREAM_ACTION: &str = "streamRawPredict";
const UNARY_ACTION: &str = "rawPredict";

/// Google Vertex AI. Like Bedrock the model moves into the URL path and
/// the version constant into the body; unlike Bedrock the URL action
/// depends on whether the body asked to stream, and credentials are OAuth
/// bearer tokens minted from a service-account key.
pub struct VertexAdapter {
    core: AdapterCore,
    project: String,
    region: String,
    token_source: VertexTokenSource,
    client: Client,
}

impl VertexAdapter {
    pub fn from_config(config: &ProviderConfig, cache: &CacheConfig) -> Result<Self> {
        let project = config
            .project
            .clone()
            .ok_or_else(|| Error::Config(format!("provider '{}' requires project", config.name)))?;
        let region = config
            .region
            .clone()
            .ok_or_else(|| Error::Config(format!("provider '{}' requires region", config.name)))?;
        Ok(Self {
            core: AdapterCore::from_config(config)?,
            project,
            region,
            token_source: VertexTokenSource::new(std::time::Duration::from_secs(
                cache.token_refresh_ahead_secs,
            )),
            client: shared_client()?,
        })
    }

    fn predict_url(&self, model: &str, stream: bool) -> Result<Url> {
        let action = if stream { STREAM_ACTION } else { UNARY_ACTION };
        let mut url = self.core.base_url().clone();
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                Error::InvalidRequest("vertex base_url must be an absolute url".into())
            })?;
            segments.pop_if_empty();
            segments.push("v1");
            segments.push("projects");
            segments.push(&self.project);
            segments.push("locations");
            segments.push(&self.region);
            segments.push("publishers");
            segments.push("anthropic");
            segments.push("models");
            // '@' is path-safe and stays literal; a '/' would be escaped.
            segments.push(&format!("{model}:{action}"));
        }
        Ok(url)
    }
}

#[async_trait]
impl ProviderAdapter for VertexAdapter {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Vertex
    }

    fn base_url(&self) -> &Url {
        self.core.base_url()
    }

    fn owner(&self) -> &'static str {
        "google"
    }

    fn map_model(&self, model: &str) -> String {
        self.core.map_model(model)
    }

    fn list_models(&self) -> Vec<Model> {
        self.core.list_models(self.owner())
    }

    fn requires_body_transform(&self) -> bool {
        true
    }

    fn forward_headers(&self, client_headers: &HeaderMap) -> HeaderMap {
        self.core
            .forward_headers(client_headers, VersionHandling::Strip)
    }

    fn transform_request(&self, body: Bytes, _endpoint: &str) -> Result<TransformedRequest> {
        let mut parsed: serde_json::Value = serde_json::from_slice(&body)?;
        let object = parsed
            .as_object_mut()
            .ok_or_else(|| Error::InvalidRequest("request body must be a JSON object".into()))?;
        let model = object
            .remove("model")
            .and_then(|v| v.as_str().map(str::to_string))
            .ok_or_else(|| Error::InvalidRequest("request body is missing 'model'".into()))?;
        // The URL action hinges on this one boolean; absent means unary.
        let stream = object
            .get("stream")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);
        object.insert(
            "anthropic_version".to_string(),
            serde_json::Value::String(VERTEX_ANTHROPIC_VERSION.to_string()),
        );

        let mapped = self.map_model(&model);
        Ok(TransformedRequest {
            body: Bytes::from(serde_json::to_vec(&parsed)?),
            url: self.predict_url(&mapped, stream)?,
        })
    }

    async fn authenticate(
        &self,
        headers: &mut HeaderMap,
        _url: &Url,
        _body: &[u8],
        credential: &RequestCredential,
    ) -> Result<()> {
        let secret = match credential {
            RequestCredential::PoolKey(secret) => secret,
            RequestCredential::Client(_) | RequestCredential::None => {
                return Err(Error::Auth(
                    "vertex provider requires a service-account key or access token".into(),
                ));
            }
        };
        // A JSON secret is a service-account key to exchange for a token;
        // anything else is treated as a pre-issued access token.
        let token = if secret.trim_start().starts_with('{') {
            let key = ServiceAccountKey::from_json(secret)?;
            self.token_source.token(&self.client, &key).await?
        } else {
            secret.clone()
        };
        UpstreamAuth::Bearer { token }.apply_headers(headers)
    }
}
