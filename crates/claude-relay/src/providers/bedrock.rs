use std::time::SystemTime;

use async_trait::async_trait;
use aws_credential_types::Credentials;
use aws_sigv4::http_request::{
    sign, SignableBody, SignableRequest, SigningParams, SigningSettings,
};
use aws_sigv4::sign::v4;
use aws_smithy_runtime_api::client::identity::Identity;
use bytes::Bytes;
use http::Request as HttpRequest;
use http::{HeaderMap, HeaderValue};
use url::Url;

use crate::auth::{RequestCredential, UpstreamAuth};
use crate::config::{ProviderConfig, ProviderKind};
use crate::error::{Error, Result};
use crate::eventstream::EVENT_STREAM_CONTENT_TYPE;
use crate::providers::{
    AdapterCore, Model, ProviderAdapter, TransformedRequest, VersionHandling,
    BEDROCK_ANTHROPIC_VERSION,
};

const SIGNING_SERVICE: &str = "bedrock";

/// AWS Bedrock. The model moves from the body into the URL path, the
/// `anthropic_version` constant moves into the body, requests are signed
/// with SigV4 over the composed payload, and streaming responses arrive
/// as binary event-stream frames that the proxy transcodes to SSE.
#[derive(Debug, Clone)]
pub struct BedrockAdapter {
    core: AdapterCore,
    region: String,
}

impl BedrockAdapter {
    pub fn from_config(config: &ProviderConfig) -> Result<Self> {
        let region = config
            .region
            .clone()
            .ok_or_else(|| Error::Config(format!("provider '{}' requires region", config.name)))?;
        Ok(Self {
            core: AdapterCore::from_config(config)?,
            region,
        })
    }

    fn invoke_url(&self, model: &str) -> Result<Url> {
        let mut url = self.core.base_url().clone();
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                Error::InvalidRequest("bedrock base_url must be an absolute url".into())
            })?;
            segments.pop_if_empty();
            segments.push("model");
            // push() percent-escapes the segment, so a '/' inside a model
            // id becomes %2F while ':' stays literal.
            segments.push(model);
            segments.push("invoke-with-response-stream");
        }
        Ok(url)
    }

    fn sign_request(
        &self,
        headers: &mut HeaderMap,
        url: &Url,
        body: &[u8],
        auth: &UpstreamAuth,
    ) -> Result<()> {
        let UpstreamAuth::SigV4 {
            access_key,
            secret_key,
            session_token,
            region,
        } = auth
        else {
            return Err(Error::Auth("SigV4 credentials required for bedrock".into()));
        };

        let host_header_value = url
            .host_str()
            .map(|host| match url.port() {
                Some(port) => format!("{host}:{port}"),
                None => host.to_string(),
            })
            .ok_or_else(|| Error::InvalidRequest("bedrock endpoint missing host".into()))?;

        let mut header_pairs: Vec<(String, String)> = vec![
            ("content-type".to_string(), "application/json".to_string()),
            ("host".to_string(), host_header_value.clone()),
        ];
        let mut builder = HttpRequest::builder()
            .method("POST")
            .uri(url.as_str())
            .header("content-type", "application/json")
            .header("host", host_header_value.as_str());
        if let Some(token) = session_token {
            builder = builder.header("x-amz-security-token", token.as_str());
            header_pairs.push(("x-amz-security-token".to_string(), token.clone()));
        }
        let request = builder
            .body(body.to_vec())
            .map_err(|e| Error::InvalidRequest(format!("failed to build http request: {e}")))?;

        let signing_settings = SigningSettings::default();
        let credentials = Credentials::new(
            access_key.as_str(),
            secret_key.as_str(),
            session_token.clone(),
            None,
            "claude-relay",
        );
        let identity: Identity = credentials.into();
        let signing_params: SigningParams = v4::SigningParams::builder()
            .identity(&identity)
            .region(region)
            .name(SIGNING_SERVICE)
            .time(SystemTime::now())
            .settings(signing_settings)
            .build()
            .map_err(|e| Error::Auth(format!("failed to build signing params: {e}")))?
            .into();

        let signable = SignableRequest::new(
            request.method().as_str(),
            request.uri().to_string(),
            header_pairs
                .iter()
                .map(|(name, value)| (name.as_str(), value.as_str())),
            SignableBody::Bytes(body),
        )
        .map_err(|e| Error::Auth(format!("failed to construct signable request: {e}")))?;
        let (instructions, _) = sign(signable, &signing_params)
            .map_err(|e| Error::Auth(format!("failed to sign request: {e}")))?
            .into_parts();

        let mut signed_request = request;
        instructions.apply_to_request_http1x(&mut signed_request);

        for (name, value) in signed_request.headers() {
            headers.insert(
                name.clone(),
                HeaderValue::from_bytes(value.as_bytes())
                    .map_err(|e| Error::Auth(format!("invalid signed header value: {e}")))?,
            );
        }
        Ok(())
    }
}

#[async_trait]
impl ProviderAdapter for BedrockAdapter {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Bedrock
    }

    fn base_url(&self) -> &Url {
        self.core.base_url()
    }

    fn owner(&self) -> &'static str {
        "amazon"
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

    // The version value travels in the body for Bedrock, never as a header.
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
        object.insert(
            "anthropic_version".to_string(),
            serde_json::Value::String(BEDROCK_ANTHROPIC_VERSION.to_string()),
        );

        let mapped = self.map_model(&model);
        Ok(TransformedRequest {
            body: Bytes::from(serde_json::to_vec(&parsed)?),
            url: self.invoke_url(&mapped)?,
        })
    }

    async fn authenticate(
        &self,
        headers: &mut HeaderMap,
        url: &Url,
        body: &[u8],
        credential: &RequestCredential,
    ) -> Result<()> {
        match credential {
            RequestCredential::PoolKey(secret) => {
                let auth = UpstreamAuth::sigv4_from_secret(secret, &self.region)?;
                self.sign_request(headers, url, body, &auth)
            }
            RequestCredential::Client(_) | RequestCredential::None => Err(Error::Auth(
                "bedrock provider requires an aws credential pair".into(),
            )),
        }
    }

    fn streaming_content_type(&self) -> &'static str {
        EVENT_STREAM_CONTENT_TYPE
    }

    fn wants_sse_transcode(&self, upstream_content_type: &str) -> bool {
        upstream_content_type.starts_with(EVENT_STREAM_CONTENT_TYPE)
    }
}
