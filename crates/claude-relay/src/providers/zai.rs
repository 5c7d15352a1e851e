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

/// Z.AI's Anthropic-compatible endpoint. Same wire surface as the native
/// backend, keyed with `x-api-key`, no transparent auth.
#[derive(Debug, Clone)]
pub struct ZaiAdapter {
    core: AdapterCore,
}

impl ZaiAdapter {
    pub fn from_config(config: &ProviderConfig) -> Result<Self> {
        Ok(Self {
            core: AdapterCore::from_config(config)?,
        })
    }
}

#[async_trait]
impl ProviderAdapter for ZaiAdapter {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Zai
    }

    fn base_url(&self) -> &Url {
        self.core.base_url()
    }

    fn owner(&self) -> &'static str {
        "zai"
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
            RequestCredential::None => {
                Err(Error::Auth("zai provider requires an api key".into()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_to_the_anthropic_compat_origin() {
        let adapter = ZaiAdapter::from_config(&ProviderConfig {
            name: "zai".into(),
            kind: ProviderKind::Zai,
            base_url: None,
            model_map: HashMap::new(),
            models: vec![],
            keys: vec![],
            pool: Default::default(),
            weight: 1,
            enabled: true,
            timeout_secs: None,
            region: None,
            project: None,
            resource: None,
            api_version: None,
            auth_method: Default::default(),
        })
        .unwrap();

        let out = adapter
            .transform_request(Bytes::from_static(b"{\"model\":\"GLM-4.7\"}"), "/v1/messages")
            .unwrap();
        assert_eq!(
            out.url.as_str(),
            "https://api.z.ai/api/anthropic/v1/messages"
        );
        // Body is untouched for compatible backends.
        assert_eq!(out.body.as_ref(), b"{\"model\":\"GLM-4.7\"}");
        assert!(!adapter.supports_transparent_auth());
    }
}
