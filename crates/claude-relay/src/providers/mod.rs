mod anthropic;
mod azure;
mod base;
mod bedrock;
mod minimax;
mod ollama;
mod vertex;
mod zai;

pub use anthropic::AnthropicAdapter;
pub use azure::AzureAdapter;
pub use base::{join_endpoint, AdapterCore, VersionHandling};
pub use bedrock::BedrockAdapter;
pub use minimax::MinimaxAdapter;
pub use ollama::OllamaAdapter;
pub use vertex::VertexAdapter;
pub use zai::ZaiAdapter;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::HeaderMap;
use serde::Serialize;
use url::Url;

use crate::auth::RequestCredential;
use crate::config::{CacheConfig, ProviderConfig, ProviderKind};
use crate::error::Result;

pub const ANTHROPIC_VERSION_HEADER: &str = "anthropic-version";
pub const DEFAULT_ANTHROPIC_VERSION: &str = "2023-06-01";
pub const BEDROCK_ANTHROPIC_VERSION: &str = "bedrock-2023-05-31";
pub const VERTEX_ANTHROPIC_VERSION: &str = "vertex-2023-10-16";

/// Row returned by `GET /v1/models`.
#[derive(Debug, Clone, Serialize)]
pub struct Model {
    pub id: String,
    pub object: &'static str,
    pub owned_by: String,
    pub provider: String,
    pub created: i64,
}

/// Result of the request-side transform: the body to send and the fully
/// resolved upstream URL.
#[derive(Debug, Clone)]
pub struct TransformedRequest {
    pub body: Bytes,
    pub url: Url,
}

/// One adapter per backend family. Adapters are stateless across requests
/// (the Vertex token cache being the one sanctioned exception) and are
/// shared behind `Arc` by the per-provider proxy.
///
/// Per request the proxy drives: `map_model` (inside `transform_request`)
/// → `transform_request` → `authenticate` → `forward_headers` → upstream
/// I/O → optional response transcode.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> ProviderKind;

    fn base_url(&self) -> &Url;

    /// Organization shown as `owned_by` in model listings.
    fn owner(&self) -> &'static str;

    /// Configured mapping lookup; unmapped names pass through unchanged.
    fn map_model(&self, model: &str) -> String;

    fn list_models(&self) -> Vec<Model>;

    /// Only adapters returning true may serve streaming requests.
    fn supports_streaming(&self) -> bool {
        true
    }

    /// When true the handler forwards the client's own credential instead
    /// of substituting a pool key. Claimed only by the native Anthropic
    /// adapter.
    fn supports_transparent_auth(&self) -> bool {
        false
    }

    fn requires_body_transform(&self) -> bool {
        false
    }

    /// Subset of client headers to pass upstream.
    fn forward_headers(&self, client_headers: &HeaderMap) -> HeaderMap;

    /// Rewrite the body and resolve the upstream URL for `endpoint`
    /// (path plus optional query, e.g. `/v1/messages?beta=true`).
    fn transform_request(&self, body: Bytes, endpoint: &str) -> Result<TransformedRequest>;

    /// Attach provider-appropriate credentials to the outgoing request.
    /// Bedrock signs over the composed body; Vertex may fetch an OAuth
    /// token, hence async.
    async fn authenticate(
        &self,
        headers: &mut HeaderMap,
        url: &Url,
        body: &[u8],
        credential: &RequestCredential,
    ) -> Result<()>;

    /// Content type of a streaming response body as produced upstream.
    fn streaming_content_type(&self) -> &'static str {
        "text/event-stream"
    }

    /// Whether the response body with this upstream content type must be
    /// transcoded to SSE before reaching the client.
    fn wants_sse_transcode(&self, upstream_content_type: &str) -> bool {
        let _ = upstream_content_type;
        false
    }
}

/// Factory: build the adapter matching the provider's type tag.
pub fn create_provider(
    config: &ProviderConfig,
    cache: &CacheConfig,
) -> Result<Arc<dyn ProviderAdapter>> {
    Ok(match config.kind {
        ProviderKind::Anthropic => Arc::new(AnthropicAdapter::from_config(config)?),
        ProviderKind::Zai => Arc::new(ZaiAdapter::from_config(config)?),
        ProviderKind::Ollama => Arc::new(OllamaAdapter::from_config(config)?),
        ProviderKind::Minimax => Arc::new(MinimaxAdapter::from_config(config)?),
        ProviderKind::Bedrock => Arc::new(BedrockAdapter::from_config(config)?),
        ProviderKind::Vertex => Arc::new(VertexAdapter::from_config(config, cache)?),
        ProviderKind::Azure => Arc::new(AzureAdapter::from_config(config)?),
    })
}
