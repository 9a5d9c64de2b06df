use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::{debug, warn};

use tramit_shared::{Result, TramitError};

/// Maximum redirects followed by a liveness check.
const MAX_REDIRECTS: usize = 10;

/// Decides whether a selected URL is still reachable.
#[async_trait]
pub trait UrlVerifier: Send + Sync {
    async fn is_live(&self, url: &str) -> bool;
}

/// HEAD request with redirect following; only a final HTTP 200 counts as live.
#[derive(Debug, Clone)]
pub struct HttpVerifier {
    client: Client,
}

impl HttpVerifier {
    pub fn new(timeout_secs: u64, user_agent: &str) -> Result<Self> {
        let client = Client::builder()
            .user_agent(user_agent)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| TramitError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl UrlVerifier for HttpVerifier {
    async fn is_live(&self, url: &str) -> bool {
        match self.client.head(url).send().await {
            Ok(response) if response.status() == StatusCode::OK => true,
            Ok(response) => {
                debug!(url, status = %response.status(), "source not live");
                false
            }
            Err(e) => {
                warn!(url, error = %e, "failed to reach source");
                false
            }
        }
    }
}
