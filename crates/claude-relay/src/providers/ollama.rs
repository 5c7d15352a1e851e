use async_trait::async_trait;
use bytes::Bytes;
use http::HeaderMap;
use url::Url;

use crate::auth::{RequestCredential, UpstreamAuth};
use crate::config::{ProviderConfig, ProviderKind};
use crate::error::Result;
use crate::providers::{
    join_endpoint, AdapterCore, Model, ProviderAdapter, TransformedRequest, VersionHandling,
};

/// Local Ollama daemon speaking the Anthropic-compatible surface. It
/// accepts an `x-api-key` header but never validates it, so a missing
/// credential is not an error here.
#[derive(Debug, Clone)]
pub struct OllamaAdapter {
    core: AdapterCore,
}

impl OllamaAdapter {
    pub fn from_config(config: &ProviderConfig) -> Result<Self> {
        Ok(Self {
            core: AdapterCore::from_config(config)?,
        })
    }
}

#[async_trait]
impl ProviderAdapter for OllamaAdapter {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Ollama
    }

    fn base_url(&self) -> &Url {
        self.core.base_url()
    }

    fn owner(&self) -> &'static str {
        "ollama"
    }

    fn map_model(&self, model: &str) -> String {
        self.core.map_model(model)
    }

    fn list_models(&self) -> Vec<Model> {
        self.core.list_models(self.owner())
    }

    fn forward_headers(&self, client_headers: &HeaderMap) -> HeaderMap {
        self.core
            .forward_headers(client_headers, VersionHandling::Forward)
    }

    fn transform_request(&self, body: Bytes, endpoint: &str) -> Result<TransformedRequest> {
        Ok(TransformedRequest {
            body,
            url: join_endpoint(self.core.base_url(), endpoint)?,
        })
    }

    async fn authenticate(
        &self,
        headers: &mut HeaderMap,
        _url: &Url,
        _body: &[u8],
        credential: &RequestCredential,
    ) -> Result<()> {
        match credential {
            RequestCredential::PoolKey(key) => {
                UpstreamAuth::ApiKey { key: key.clone() }.apply_headers(headers)
            }
            RequestCredential::Client(client) => client.apply_headers(headers),
            RequestCredential::None => Ok(()),
        }
    }
}
