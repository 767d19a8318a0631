//! A tiny error reporter for applications running on Google Cloud.
//! Errors are published as JSON messages to a Pub/Sub topic, enriched
//! with the project id and instance name discovered from the environment
//! metadata service. When the backend is unreachable or the reporter was
//! never initialized, every error still lands on stderr, so reporting
//! can never crash the application it instruments.
//! (C) 2025 Enzo Lombardi

mod backend;
mod error;
mod metadata;
mod pubsub;
mod reporter;

pub use backend::{Backend, BackendOptions, Connection, PublishHandle};
pub use error::{Error, MetadataError, Result};
pub use metadata::{GceMetadata, MetadataResolver};
pub use pubsub::PubSubBackend;
pub use reporter::{global, install_global, ErrorReporter, ReportedError, ReporterBuilder};
