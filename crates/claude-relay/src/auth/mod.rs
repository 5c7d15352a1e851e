pub mod google;

use http::header::AUTHORIZATION;
use http::{HeaderMap, HeaderValue};

use crate::config::{ClientAuthConfig, ClientAuthMode};
use crate::error::{Error, Result};

pub const X_API_KEY: &str = "x-api-key";

/// Credential attached to an outgoing upstream request.
///
/// SigV4 is carried as raw material only; the Bedrock adapter signs the
/// composed request itself.
#[derive(Debug, Clone)]
pub enum UpstreamAuth {
    ApiKey {
        key: String,
    },
    Bearer {
        token: String,
    },
    SigV4 {
        access_key: String,
        secret_key: String,
        session_token: Option<String>,
        region: String,
    },
    None,
}

impl UpstreamAuth {
    /// Build a credential from an opaque pool secret for the given scheme
    /// family. Bedrock secrets carry `access_key:secret_key[:session_token]`.
    pub fn sigv4_from_secret(secret: &str, region: &str) -> Result<Self> {
        let mut parts = secret.splitn(3, ':');
        let access_key = parts
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::Auth("bedrock key secret is missing an access key".into()))?;
        let secret_key = parts
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::Auth("bedrock key secret is missing a secret key".into()))?;
        let session_token = parts.next().map(str::to_string);
        Ok(UpstreamAuth::SigV4 {
            access_key: access_key.to_string(),
            secret_key: secret_key.to_string(),
            session_token,
            region: region.to_string(),
        })
    }

    pub fn apply_headers(&self, headers: &mut HeaderMap) -> Result<()> {
        match self {
            UpstreamAuth::ApiKey { key } => {
                headers.insert(
                    X_API_KEY,
                    HeaderValue::from_str(key)
                        .map_err(|e| Error::Auth(format!("invalid api key value: {e}")))?,
                );
                Ok(())
            }
            UpstreamAuth::Bearer { token } => {
                let value = format!("Bearer {token}");
                headers.insert(
                    AUTHORIZATION,
                    HeaderValue::from_str(&value)
                        .map_err(|e| Error::Auth(format!("invalid bearer value: {e}")))?,
                );
                Ok(())
            }
            // Applied during request signing by the Bedrock adapter.
            UpstreamAuth::SigV4 { .. } => Ok(()),
            UpstreamAuth::None => Ok(()),
        }
    }
}

/// Credential material resolved by the handler for one attempt: a pool
/// (or fallback) secret, the client's own credential for transparent-auth
/// providers, or nothing. The adapter turns this into its wire scheme.
#[derive(Debug, Clone)]
pub enum RequestCredential {
    PoolKey(String),
    Client(ClientCredential),
    None,
}

/// The client credential as presented to the relay, kept verbatim so
/// transparent-auth providers can forward it untouched.
#[derive(Debug, Clone, Default)]
pub struct ClientCredential {
    /// Value of `x-api-key`, when present.
    pub api_key: Option<String>,
    /// Value of `authorization`, when present.
    pub authorization: Option<String>,
}

impl ClientCredential {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let get = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        Self {
            api_key: get(X_API_KEY),
            authorization: get("authorization"),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.api_key.is_none() && self.authorization.is_none()
    }

    /// Copy the credential headers onto an upstream request unchanged.
    pub fn apply_headers(&self, headers: &mut HeaderMap) -> Result<()> {
        if let Some(key) = &self.api_key {
            headers.insert(
                X_API_KEY,
                HeaderValue::from_str(key)
                    .map_err(|e| Error::Auth(format!("invalid api key value: {e}")))?,
            );
        }
        if let Some(auth) = &self.authorization {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(auth)
                    .map_err(|e| Error::Auth(format!("invalid authorization value: {e}")))?,
            );
        }
        Ok(())
    }
}

/// Authenticate the inbound client request per the `auth` config section.
///
/// `shared_secret` accepts the secret in `x-api-key` or as a bearer token;
/// `passthrough` only requires that some credential is present.
pub fn authenticate_client(
    config: &ClientAuthConfig,
    headers: &HeaderMap,
) -> Result<ClientCredential> {
    let credential = ClientCredential::from_headers(headers);
    match config.mode {
        ClientAuthMode::SharedSecret => {
            let expected = config
                .secret
                .as_deref()
                .ok_or_else(|| Error::Auth("shared secret not configured".into()))?;
            let presented = credential
                .api_key
                .as_deref()
                .or_else(|| {
                    credential
                        .authorization
                        .as_deref()
                        .and_then(|v| v.strip_prefix("Bearer "))
                })
                .unwrap_or("");
            if presented == expected {
                Ok(credential)
            } else {
                Err(Error::Auth("invalid client credentials".into()))
            }
        }
        ClientAuthMode::Passthrough => {
            if credential.is_empty() {
                Err(Error::Auth("missing client credentials".into()))
            } else {
                Ok(credential)
            }
        }
    }
}
