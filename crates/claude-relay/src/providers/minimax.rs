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

/// MiniMax's Anthropic-compatible endpoint. Identical wire shape to the
/// native backend except credentials travel as a bearer token.
#[derive(Debug, Clone)]
pub struct MinimaxAdapter {
    core: AdapterCore,
}

impl MinimaxAdapter {
    pub fn from_config(config: &ProviderConfig) -> Result<Self> {
        Ok(Self {
            core: AdapterCore::from_config(config)?,
        })
    }
}

#[async_trait]
impl ProviderAdapter for MinimaxAdapter {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Minimax
    }

    fn base_url(&self) -> &Url {
        self.core.base_url()
    }

    fn owner(&self) -> &'static str {
        "minimax"
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
            RequestCredential::PoolKey(key) => UpstreamAuth::Bearer {
                token: key.clone(),
            }
            .apply_headers(headers),
            RequestCredential::Client(client) => client.apply_headers(headers),
            RequestCredential::None => {
                Err(Error::Auth("minimax provider requires an api key".into()))
            }
        }
    }
}
