//! Discovery of project and instance identity from the environment
//! metadata service. Lookups run with a short timeout so that running
//! outside the cloud degrades quickly instead of hanging startup.
//! (C) 2025 Enzo Lombardi

use std::time::Duration;

use async_trait::async_trait;

use crate::error::MetadataError;

/// Base URL of the Google Compute Engine metadata service.
const METADATA_BASE_URL: &str = "http://metadata.google.internal";

/// How long a single metadata lookup may take before it is treated as
/// "field unknown" rather than a hard failure.
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(2);

const USER_AGENT: &str = concat!("nano-gcp-reporting/", env!("CARGO_PKG_VERSION"));

/// Source of environment-provided identity.
///
/// The reporter queries this during construction to fill in the project id
/// and instance name when the caller does not supply them. Implementations
/// must distinguish a timeout from other failures: timeouts are swallowed,
/// everything else aborts construction.
#[async_trait]
pub trait MetadataResolver: Send + Sync {
    /// Looks up the project the process is running under.
    async fn project_id(&self) -> Result<String, MetadataError>;

    /// Looks up the name of the instance the process is running on.
    async fn instance_name(&self) -> Result<String, MetadataError>;
}

/// Metadata resolver backed by the GCE metadata service.
pub struct GceMetadata {
    client: reqwest::Client,
    base_url: String,
}

impl GceMetadata {
    /// Creates a resolver pointed at the real metadata service.
    pub fn new() -> Self {
        Self::with_base_url(METADATA_BASE_URL)
    }

    /// Creates a resolver with a custom base URL (useful for testing).
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self::with_base_url_and_timeout(base_url, DISCOVERY_TIMEOUT)
    }

    /// Creates a resolver with a custom base URL and lookup timeout.
    pub fn with_base_url_and_timeout(base_url: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .expect("failed to build metadata HTTP client");
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn fetch(&self, path: &str) -> Result<String, MetadataError> {
        let url = format!("{}/computeMetadata/v1/{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(classify)?;

        let status = response.status();
        if !status.is_success() {
            tracing::debug!(%url, %status, "metadata lookup rejected");
            return Err(MetadataError::Status(status));
        }

        response.text().await.map_err(classify)
    }
}

impl Default for GceMetadata {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetadataResolver for GceMetadata {
    async fn project_id(&self) -> Result<String, MetadataError> {
        self.fetch("project/project-id").await
    }

    async fn instance_name(&self) -> Result<String, MetadataError> {
        self.fetch("instance/name").await
    }
}

fn classify(error: reqwest::Error) -> MetadataError {
    if error.is_timeout() {
        MetadataError::Timeout
    } else {
        MetadataError::Request(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_is_normalized() {
        let resolver = GceMetadata::with_base_url("http://localhost:9000/");
        assert_eq!(resolver.base_url, "http://localhost:9000");
    }
}
