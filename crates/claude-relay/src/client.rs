use std::time::Duration;

use once_cell::sync::OnceCell;
use reqwest::{Client, ClientBuilder};

use crate::error::{Error, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
// Streaming completions routinely run for minutes; this caps a stalled
// upstream, not a healthy stream.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

static SHARED: OnceCell<Client> = OnceCell::new();

/// Client for a provider's upstream origin.
///
/// Providers without a `timeout_secs` override all share one pooled
/// client; an override gets a dedicated client, since reqwest fixes the
/// request timeout at build time.
pub fn upstream_client(timeout: Option<Duration>) -> Result<Client> {
    match timeout {
        Some(timeout) => build(timeout),
        None => shared_client(),
    }
}

/// The relay-wide client used when no provider override applies (and for
/// side traffic like Vertex token exchange).
pub fn shared_client() -> Result<Client> {
    SHARED
        .get_or_try_init(|| build(DEFAULT_REQUEST_TIMEOUT))
        .cloned()
}

fn build(timeout: Duration) -> Result<Client> {
    ClientBuilder::new()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(timeout)
        .user_agent(concat!("claude-relay/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(Error::from)
}
