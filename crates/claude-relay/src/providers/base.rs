use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderValue};
use url::Url;

use crate::config::{ProviderConfig, ProviderKind};
use crate::error::{Error, Result};
use crate::providers::{
    Model, ANTHROPIC_VERSION_HEADER, DEFAULT_ANTHROPIC_VERSION,
};

/// How an adapter treats the client's `anthropic-version` header.
///
/// Cloud backends move the version into the body, so the header must not
/// travel; Azure instead requires the header and supplies a default when
/// the client sent none.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionHandling {
    Forward,
    Strip,
    EnsureDefault,
}

/// State every adapter shares: identity, origin, model mapping, and the
/// advertised model list. Cloud adapters wrap this and override the
/// body/URL transform.
#[derive(Debug, Clone)]
pub struct AdapterCore {
    name: String,
    kind: ProviderKind,
    base_url: Url,
    model_map: std::collections::HashMap<String, String>,
    models: Vec<String>,
    created: i64,
}

impl AdapterCore {
    pub fn from_config(config: &ProviderConfig) -> Result<Self> {
        Ok(Self {
            name: config.name.clone(),
            kind: config.kind,
            base_url: config.resolved_base_url()?,
            model_map: config.model_map.clone(),
            models: config.models.clone(),
            created: chrono::Utc::now().timestamp(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ProviderKind {
        self.kind
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn map_model(&self, model: &str) -> String {
        self.model_map
            .get(model)
            .cloned()
            .unwrap_or_else(|| model.to_string())
    }

    pub fn list_models(&self, owner: &str) -> Vec<Model> {
        self.models
            .iter()
            .map(|id| Model {
                id: id.clone(),
                object: "model",
                owned_by: owner.to_string(),
                provider: self.name.clone(),
                created: self.created,
            })
            .collect()
    }

    /// Forward every client header whose canonical name begins with
    /// `Anthropic-` and force `Content-Type: application/json`.
    pub fn forward_headers(&self, client_headers: &HeaderMap, version: VersionHandling) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in client_headers {
            if !name.as_str().starts_with("anthropic-") {
                continue;
            }
            if name.as_str() == ANTHROPIC_VERSION_HEADER && version == VersionHandling::Strip {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }
        if version == VersionHandling::EnsureDefault
            && !headers.contains_key(ANTHROPIC_VERSION_HEADER)
        {
            headers.insert(
                ANTHROPIC_VERSION_HEADER,
                HeaderValue::from_static(DEFAULT_ANTHROPIC_VERSION),
            );
        }
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers
    }
}

/// Resolve `endpoint` (path plus optional query) against a base origin,
/// keeping any path prefix the base URL carries.
pub fn join_endpoint(base: &Url, endpoint: &str) -> Result<Url> {
    let (path, query) = match endpoint.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (endpoint, None),
    };
    let mut url = base.clone();
    let prefix = base.path().trim_end_matches('/');
    if path.starts_with('/') {
        url.set_path(&format!("{prefix}{path}"));
    } else {
        url.set_path(&format!("{prefix}/{path}"));
    }
    url.set_query(query);
    if url.host_str().is_none() {
        return Err(Error::InvalidRequest(format!(
            "endpoint '{endpoint}' resolves to a host-less url"
        )));
    }
    Ok(url)
}
