//! Backend port: the interface the reporter uses to talk to the
//! publishing service. The production adapter targets Google Cloud
//! Pub/Sub (see [`crate::pubsub`]); tests substitute in-memory fakes.
//! (C) 2025 Enzo Lombardi

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::reporter::ReportedError;

/// Connection options passed through to the backend adapter.
///
/// Both fields default to "use the real service": the public endpoint and a
/// token acquired from application-default credentials. Overriding them points
/// the adapter at an emulator or a test server without touching credentials.
#[derive(Debug, Clone, Default)]
pub struct BackendOptions {
    /// Base URL of the publishing service, without a trailing slash.
    pub endpoint: Option<String>,

    /// Bearer token to use instead of acquiring one from the environment.
    pub access_token: Option<String>,
}

/// Entry point into a publishing service.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Establishes a session scoped to `project_id`.
    ///
    /// The project id may be unknown when metadata discovery timed out;
    /// adapters must still connect and let individual publishes fail instead.
    /// The cancellation token covers all background work spawned for this
    /// connection and is cancelled when the reporter shuts down.
    async fn connect(
        &self,
        project_id: Option<&str>,
        options: &BackendOptions,
        cancel: CancellationToken,
    ) -> Result<Box<dyn Connection>>;
}

/// An established backend session.
pub trait Connection: Send + Sync {
    /// Binds a publish handle for one topic on this session.
    ///
    /// Binding again for another (or the same) topic yields an independent
    /// handle; dropping the previous handle releases its resources.
    fn bind(&self, topic: &str) -> Arc<dyn PublishHandle>;
}

/// A bound channel to a specific topic.
#[async_trait]
pub trait PublishHandle: Send + Sync {
    /// Publishes one payload and waits for the backend acknowledgment.
    ///
    /// Returns the delivery identifier assigned by the backend.
    async fn publish(&self, payload: &ReportedError) -> Result<String>;

    /// Releases the handle. Publishes already handed over still complete;
    /// later publish attempts fail with [`crate::Error::Stopped`].
    async fn stop(&self);
}
