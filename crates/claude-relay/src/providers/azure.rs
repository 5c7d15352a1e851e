use async_trait::async_trait;
use bytes::Bytes;
use http::HeaderMap;
use url::Url;

use crate::auth::{RequestCredential, UpstreamAuth};
use crate::config::{
    AzureAuthMethod, ProviderConfig, ProviderKind, DEFAULT_AZURE_API_VERSION,
};
use crate::error::{Error, Result};
use crate::providers::{AdapterCore, Model, ProviderAdapter, TransformedRequest, VersionHandling};

/// Azure AI Foundry. The caller's endpoint string is irrelevant: every
/// request lands on `{base}/models/chat/completions?api-version={v}`.
/// The `anthropic-version` header must be present upstream, so a default
/// is supplied when the client sent none.
#[derive(Debug, Clone)]
pub struct AzureAdapter {
    core: AdapterCore,
    api_version: String,
    auth_method: AzureAuthMethod,
}

impl AzureAdapter {
    pub fn from_config(config: &ProviderConfig) -> Result<Self> {
        Ok(Self {
            core: AdapterCore::from_config(config)?,
            api_version: config
                .api_version
                .clone()
                .unwrap_or_else(|| DEFAULT_AZURE_API_VERSION.to_string()),
            auth_method: config.auth_method,
        })
    }

    fn completions_url(&self) -> Result<Url> {
        let mut url = self.core.base_url().clone();
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                Error::InvalidRequest("azure base_url must be an absolute url".into())
            })?;
            segments.pop_if_empty();
            segments.push("models");
            segments.push("chat");
            segments.push("completions");
        }
        if !url.query_pairs().any(|(key, _)| key == "api-version") {
            url.query_pairs_mut()
                .append_pair("api-version", &self.api_version);
        }
        Ok(url)
    }
}

#[async_trait]
impl ProviderAdapter for AzureAdapter {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Azure
    }

    fn base_url(&self) -> &Url {
        self.core.base_url()
    }

    fn owner(&self) -> &'static str {
        "azure"
    }

    fn map_model(&self, model: &str) -> String {
        self.core.map_model(model)
    }

    fn list_models(&self) -> Vec<Model> {
        self.core.list_models(self.owner())
    }

    fn forward_headers(&self, client_headers: &HeaderMap) -> HeaderMap {
        self.core
            .forward_headers(client_headers, VersionHandling::EnsureDefault)
    }

    fn transform_request(&self, body: Bytes, _endpoint: &str) -> Result<TransformedRequest> {
        Ok(TransformedRequest {
            body,
            url: self.completions_url()?,
        })
    }

    async fn authenticate(
        &self,
        headers: &mut HeaderMap,
        _url: &Url,
        _body: &[u8],
        credential: &RequestCredential,
    ) -> Result<()> {
        let key = match credential {
            RequestCredential::PoolKey(key) => key.clone(),
            RequestCredential::Client(client) => {
                return client.apply_headers(headers);
            }
            RequestCredential::None => {
                return Err(Error::Auth("azure provider requires a credential".into()));
            }
        };
        match self.auth_method {
            AzureAuthMethod::ApiKey => UpstreamAuth::ApiKey { key }.apply_headers(headers),
            AzureAuthMethod::EntraId => UpstreamAuth::Bearer { token: key }.apply_headers(headers),
        }
    }
}
