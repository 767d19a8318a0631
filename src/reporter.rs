//! The error reporter itself: construction with metadata discovery,
//! topic binding, best-effort publishing with stderr fallback, and
//! teardown. Reporting never becomes a second source of failure for
//! the application it instruments.
//! (C) 2025 Enzo Lombardi

use std::backtrace::Backtrace;
use std::sync::{Arc, Mutex, OnceLock, RwLock};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::backend::{Backend, BackendOptions, Connection, PublishHandle};
use crate::error::Result;
use crate::metadata::{GceMetadata, MetadataResolver};
use crate::pubsub::PubSubBackend;

/// Payload published to the error topic, for use in json unmarshalling
/// on the consumer side. `instance_name` serializes as `null` when the
/// instance identity was never resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportedError {
    pub error: String,
    pub trace: String,
    pub instance_name: Option<String>,
}

/// Reports application errors to a cloud topic, falling back to stderr.
///
/// Build one with [`ErrorReporter::builder`], call [`init`](Self::init) to
/// bind a topic, then [`report`](Self::report) as errors occur. Call
/// [`shutdown`](Self::shutdown) when done. Errors reported before `init`
/// (or after `shutdown`) go to stderr only.
pub struct ErrorReporter {
    project_id: Option<String>,
    instance_name: RwLock<Option<String>>,
    topic: RwLock<Option<String>>,
    connection: Box<dyn Connection>,
    handle: RwLock<Option<Arc<dyn PublishHandle>>>,
    cancel: Mutex<Option<CancellationToken>>,
    tracker: Option<TaskTracker>,
    terminate: Box<dyn Fn(i32) + Send + Sync>,
}

impl ErrorReporter {
    /// Starts building a reporter. Every input is optional; `connect` on the
    /// builder performs discovery and establishes the backend session.
    pub fn builder() -> ReporterBuilder {
        ReporterBuilder::default()
    }

    /// Binds a publish handle for `topic` on the established connection and
    /// starts publishing there. Until this is called, reported errors go to
    /// stderr only.
    ///
    /// `instance_name` overrides whatever discovery found. Calling `init`
    /// again rebinds: the previous handle is dropped and its delivery worker
    /// exits once drained.
    pub fn init(&self, topic: &str, instance_name: Option<&str>) {
        if let Some(name) = instance_name {
            *self
                .instance_name
                .write()
                .unwrap_or_else(|e| e.into_inner()) = Some(name.to_string());
        }
        *self.topic.write().unwrap_or_else(|e| e.into_inner()) = Some(topic.to_string());

        let handle = self.connection.bind(topic);
        *self.handle.write().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    /// Tries to report `error` to the bound topic, otherwise prints it to
    /// stderr. Blocks until the backend acknowledges the publish or it fails;
    /// either way the outcome is logged locally and never surfaced.
    pub async fn report(&self, error: &dyn std::error::Error) {
        let _in_flight = self.tracker.as_ref().map(TaskTracker::token);

        let handle = {
            self.handle
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .clone()
        };
        let Some(handle) = handle else {
            eprintln!(
                "[report:not-initialized] {error}\n{}",
                Backtrace::force_capture()
            );
            return;
        };

        let payload = ReportedError {
            error: error.to_string(),
            trace: Backtrace::force_capture().to_string(),
            instance_name: self
                .instance_name
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
        };

        match handle.publish(&payload).await {
            Ok(id) => eprintln!("[report:delivered] {} (delivery id {id})", payload.error),
            Err(publish_error) => {
                eprintln!("[report:publish-failed] {}: {publish_error}", payload.error)
            }
        }
    }

    /// Reports `error`, shuts the reporter down, and terminates the process
    /// with a non-zero status.
    ///
    /// Only the report made here is flushed before exiting; reports still in
    /// flight on other tasks are not awaited.
    pub async fn fatal(&self, error: &dyn std::error::Error) {
        self.report(error).await;
        self.shutdown().await;
        (self.terminate)(1);
    }

    /// Releases the publish handle and cancels the background connection
    /// context. Publishes already handed to the backend still complete.
    /// Safe to call multiple times; later calls are no-ops.
    pub async fn shutdown(&self) {
        let handle = {
            self.handle
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .take()
        };
        if let Some(handle) = handle {
            handle.stop().await;
        }

        let cancel = {
            self.cancel
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take()
        };
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
    }

    /// The project id this reporter publishes under, if it was resolved.
    pub fn project_id(&self) -> Option<&str> {
        self.project_id.as_deref()
    }

    /// The instance name tagged onto outgoing reports, if it was resolved.
    pub fn instance_name(&self) -> Option<String> {
        self.instance_name
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// The topic bound by `init`, if any.
    pub fn topic(&self) -> Option<String> {
        self.topic.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Builder for [`ErrorReporter`]. Defaults target the real Pub/Sub service
/// and the GCE metadata service.
#[derive(Default)]
pub struct ReporterBuilder {
    backend: Option<Arc<dyn Backend>>,
    metadata: Option<Arc<dyn MetadataResolver>>,
    options: BackendOptions,
    project_id: Option<String>,
    tracker: Option<TaskTracker>,
    terminate: Option<Box<dyn Fn(i32) + Send + Sync>>,
}

impl ReporterBuilder {
    /// Substitutes the publishing backend (defaults to Pub/Sub).
    pub fn backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Substitutes the metadata resolver (defaults to the GCE service).
    pub fn metadata(mut self, metadata: Arc<dyn MetadataResolver>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Sets the backend connection options.
    pub fn options(mut self, options: BackendOptions) -> Self {
        self.options = options;
        self
    }

    /// Sets the project id explicitly, skipping discovery for it.
    pub fn project_id(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    /// Attaches a caller-supplied completion tracker. A token is taken before
    /// every reporting attempt and dropped when it returns, so the owner can
    /// `close()` and `wait()` the tracker to drain in-flight reports.
    pub fn completion_tracker(mut self, tracker: TaskTracker) -> Self {
        self.tracker = Some(tracker);
        self
    }

    /// Replaces the termination strategy used by [`ErrorReporter::fatal`]
    /// (defaults to `std::process::exit`). Lets tests observe `fatal`
    /// without ending the test process.
    pub fn terminate_with(mut self, terminate: impl Fn(i32) + Send + Sync + 'static) -> Self {
        self.terminate = Some(Box::new(terminate));
        self
    }

    /// Resolves identity metadata and connects to the backend.
    ///
    /// Discovery timeouts leave the corresponding field unset; any other
    /// discovery failure, and any connection failure, aborts construction.
    /// A failed project-id lookup is returned before the backend is touched.
    pub async fn connect(self) -> Result<ErrorReporter> {
        let backend = self
            .backend
            .unwrap_or_else(|| Arc::new(PubSubBackend::new()));
        let metadata = self
            .metadata
            .unwrap_or_else(|| Arc::new(GceMetadata::new()));

        let project_id = match self.project_id {
            Some(id) => Some(id),
            None => match metadata.project_id().await {
                Ok(id) => Some(id),
                Err(e) if e.is_timeout() => {
                    tracing::debug!("project id discovery timed out, leaving unset");
                    None
                }
                Err(e) => return Err(e.into()),
            },
        };

        let cancel = CancellationToken::new();
        let connection = backend
            .connect(project_id.as_deref(), &self.options, cancel.child_token())
            .await?;

        let instance_name = match metadata.instance_name().await {
            Ok(name) => Some(name),
            Err(e) if e.is_timeout() => {
                tracing::debug!("instance name discovery timed out, leaving unset");
                None
            }
            Err(e) => return Err(e.into()),
        };

        Ok(ErrorReporter {
            project_id,
            instance_name: RwLock::new(instance_name),
            topic: RwLock::new(None),
            connection,
            handle: RwLock::new(None),
            cancel: Mutex::new(Some(cancel)),
            tracker: self.tracker,
            terminate: self
                .terminate
                .unwrap_or_else(|| Box::new(|code| std::process::exit(code))),
        })
    }
}

static GLOBAL: OnceLock<ErrorReporter> = OnceLock::new();

/// Installs `reporter` as the shared process-wide instance. Convenient when
/// the whole application wants one reporter; explicit construction and
/// injection remain the primary pattern.
///
/// Returns the reporter back if another one was already installed.
pub fn install_global(
    reporter: ErrorReporter,
) -> std::result::Result<&'static ErrorReporter, ErrorReporter> {
    GLOBAL.set(reporter)?;
    Ok(GLOBAL.get().expect("installed above"))
}

/// The shared process-wide reporter, if [`install_global`] has been called.
pub fn global() -> Option<&'static ErrorReporter> {
    GLOBAL.get()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_serializes_null_when_instance_unknown() {
        let payload = ReportedError {
            error: "disk full".to_string(),
            trace: "at main".to_string(),
            instance_name: None,
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"error": "disk full", "trace": "at main", "instanceName": null})
        );
    }

    #[test]
    fn payload_uses_camel_case_instance_name() {
        let payload = ReportedError {
            error: "disk full".to_string(),
            trace: "at main".to_string(),
            instance_name: Some("host-42".to_string()),
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains(r#""instanceName":"host-42""#));

        let back: ReportedError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, payload);
    }
}
