//! OAuth token source for the Vertex adapter.
//!
//! Vertex wants a bearer token minted from a Google service-account key:
//! the relay signs a JWT-bearer assertion with the account's RSA key and
//! trades it at the account's token endpoint for a short-lived access
//! token. Tokens are cached per service account and refreshed ahead of
//! expiry so one handed to a long streaming request outlives it.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::Client;
use serde::Deserialize;

use crate::error::{Error, Result};

const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
// Lifetime of the signed assertion, not of the issued token.
const ASSERTION_LIFETIME: Duration = Duration::from_secs(3600);

/// The fields of a Google service-account key file the relay uses.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

impl ServiceAccountKey {
    pub fn from_json(payload: &str) -> Result<Self> {
        let mut key: ServiceAccountKey = serde_json::from_str(payload)
            .map_err(|e| Error::Auth(format!("service account key is not valid JSON: {e}")))?;
        if key.client_email.is_empty() || key.private_key.is_empty() {
            return Err(Error::Auth(
                "service account key is missing client_email or private_key".into(),
            ));
        }
        if key.token_uri.is_empty() {
            key.token_uri = DEFAULT_TOKEN_URI.to_string();
        }
        Ok(key)
    }

    /// Sign a JWT-bearer assertion for the cloud-platform scope.
    fn assertion(&self) -> Result<String> {
        let issued_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|_| Error::Auth("system clock is before the unix epoch".into()))?
            .as_secs();
        let claims = serde_json::json!({
            "iss": self.client_email,
            "scope": CLOUD_PLATFORM_SCOPE,
            "aud": self.token_uri,
            "iat": issued_at,
            "exp": issued_at + ASSERTION_LIFETIME.as_secs(),
        });
        let signer = EncodingKey::from_rsa_pem(self.private_key.as_bytes())
            .map_err(|e| Error::Auth(format!("service account private_key is not an RSA PEM: {e}")))?;
        encode(&Header::new(Algorithm::RS256), &claims, &signer)
            .map_err(|e| Error::Auth(format!("failed to sign token assertion: {e}")))
    }
}

#[derive(Debug)]
struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// A successful grant. Both fields are required; anything else from the
/// token endpoint is a hard auth error.
#[derive(Debug, Deserialize)]
struct TokenGrant {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug)]
pub struct VertexTokenSource {
    /// One live token per service account, keyed by `client_email`.
    tokens: DashMap<String, CachedToken>,
    refresh_ahead: Duration,
}

impl VertexTokenSource {
    pub fn new(refresh_ahead: Duration) -> Self {
        Self {
            tokens: DashMap::new(),
            refresh_ahead,
        }
    }

    /// The cached token for this account, exchanging a fresh one when the
    /// cached value is within `refresh_ahead` of expiry. Concurrent
    /// readers keep the old token until the replacement is inserted.
    pub async fn token(&self, client: &Client, key: &ServiceAccountKey) -> Result<String> {
        if let Some(cached) = self.tokens.get(&key.client_email) {
            if cached.expires_at > Instant::now() + self.refresh_ahead {
                return Ok(cached.value.clone());
            }
        }

        let (value, expires_at) = exchange(client, key).await?;
        self.tokens.insert(
            key.client_email.clone(),
            CachedToken {
                value: value.clone(),
                expires_at,
            },
        );
        Ok(value)
    }
}

async fn exchange(client: &Client, key: &ServiceAccountKey) -> Result<(String, Instant)> {
    let assertion = key.assertion()?;
    let response = client
        .post(&key.token_uri)
        .form(&[
            ("grant_type", JWT_BEARER_GRANT),
            ("assertion", assertion.as_str()),
        ])
        .send()
        .await
        .map_err(|e| Error::Auth(format!("token endpoint unreachable: {e}")))?;

    let status = response.status();
    let body = response
        .bytes()
        .await
        .map_err(|e| Error::Auth(format!("token endpoint response unreadable: {e}")))?;
    if !status.is_success() {
        return Err(Error::Auth(format!(
            "token endpoint returned {status}: {}",
            String::from_utf8_lossy(&body)
        )));
    }

    let grant: TokenGrant = serde_json::from_slice(&body)
        .map_err(|e| Error::Auth(format!("malformed token grant: {e}")))?;
    Ok((
        grant.access_token,
        Instant::now() + Duration::from_secs(grant.expires_in),
    ))
}
