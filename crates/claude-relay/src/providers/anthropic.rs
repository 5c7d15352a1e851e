use async_trait::async_trait;
use bytes::Bytes;
use http::HeaderMap;
use url::Url;

use crate::auth::{RequestCredential, UpstreamAuth};
use crate::config::{ProviderConfig, ProviderKind};
use crate::error::{Error, Result};
use crate::providers::{
    join_endpoint, AdapterCore, Model, ProviderAdapter, TransformedRequest, VersionHandling,
};

/// Native Anthropic backend. The one adapter allowed to claim transparent
/// auth: when the client brought its own credential the relay forwards it
/// untouched instead of substituting a pool key.
#[derive(Debug, Clone)]
pub struct AnthropicAdapter {
    core: AdapterCore,
}

impl AnthropicAdapter {
    pub fn from_config(config: &ProviderConfig) -> Result<Self> {
        Ok(Self {
            core: AdapterCore::from_config(config)?,
        })
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    fn base_url(&self) -> &Url {
        self.core.base_url()
    }

    fn owner(&self) -> &'static str {
        "anthropic"
    }

    fn map_model(&self, model: &str) -> String {
        self.core.map_model(model)
    }

    fn list_models(&self) -> Vec<Model> {
        self.core.list_models(self.owner())
    }

    fn supports_transparent_auth(&self) -> bool {
        true
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
            RequestCredential::Client(client) => client.apply_headers(headers),
            RequestCredential::PoolKey(key) => {
                UpstreamAuth::ApiKey { key: key.clone() }.apply_headers(headers)
            }
            RequestCredential::None => {
                Err(Error::Auth("anthropic provider requires a credential".into()))
            }
        }
    }
}
