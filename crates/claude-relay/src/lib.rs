mod auth;
mod client;
mod config;
mod error;
mod eventstream;
mod health;
mod pool;
mod providers;
mod proxy;
mod router;
mod server;

pub use auth::google::{ServiceAccountKey, VertexTokenSource};
pub use auth::{authenticate_client, ClientCredential, RequestCredential, UpstreamAuth};
pub use client::{shared_client, upstream_client};
pub use config::{
    load_config, watch_config, AzureAuthMethod, CacheConfig, ClientAuthConfig, ClientAuthMode,
    Config, ConfigCell, HealthConfig, KeyConfig, LogFormat, LoggingConfig, PoolConfig,
    PoolStrategy, ProviderConfig, ProviderKind, RouteStrategy, RoutingConfig, ServerConfig,
    WatcherHandle,
};
pub use error::{Error, ErrorKind, Result, UpstreamHttpError};
pub use eventstream::{
    build_message, parse_frame, sse_response_headers, EventStreamToSse, FrameError, Message,
    ParseOutcome, SkipReason, EVENT_STREAM_CONTENT_TYPE,
};
pub use health::{CircuitState, HealthTracker};
pub use pool::{KeyPool, PooledKey, WindowUsage};
pub use providers::{
    create_provider, AnthropicAdapter, AzureAdapter, BedrockAdapter, MinimaxAdapter, Model,
    OllamaAdapter, ProviderAdapter, TransformedRequest, VertexAdapter, ZaiAdapter,
    BEDROCK_ANTHROPIC_VERSION, DEFAULT_ANTHROPIC_VERSION, VERTEX_ANTHROPIC_VERSION,
};
pub use proxy::{ProviderProxy, UpstreamReply};
pub use router::{ProviderInfo, Router};
pub use server::{build_router, serve, Relay, RelayState};
