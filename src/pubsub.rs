//! Google Cloud Pub/Sub adapter. Each bound topic owns a background
//! delivery worker; publishes are handed to the worker over a channel
//! and the caller awaits the acknowledgment it sends back.
//! (C) 2025 Enzo Lombardi

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::Engine;
use gcp_auth::AuthenticationManager;
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::backend::{Backend, BackendOptions, Connection, PublishHandle};
use crate::error::{Error, Result};
use crate::reporter::ReportedError;

/// Public endpoint of the Pub/Sub REST API.
const PUBSUB_ENDPOINT: &str = "https://pubsub.googleapis.com";

/// OAuth scope requested when acquiring a token from the environment.
const PUBSUB_SCOPE: &str = "https://www.googleapis.com/auth/pubsub";

/// Commands queued per worker before publish calls start waiting on `send`.
const COMMAND_QUEUE_DEPTH: usize = 64;

/// Backend adapter for Google Cloud Pub/Sub.
pub struct PubSubBackend {
    http: reqwest::Client,
}

impl PubSubBackend {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }
}

impl Default for PubSubBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for PubSubBackend {
    async fn connect(
        &self,
        project_id: Option<&str>,
        options: &BackendOptions,
        cancel: CancellationToken,
    ) -> Result<Box<dyn Connection>> {
        let token = match &options.access_token {
            Some(token) => token.clone(),
            None => {
                let auth = AuthenticationManager::new().await.map_err(|e| {
                    Error::Connection(format!("failed to initialize authentication: {e}"))
                })?;
                auth.get_token(&[PUBSUB_SCOPE])
                    .await
                    .map_err(|e| Error::Connection(format!("failed to acquire token: {e}")))?
                    .as_str()
                    .to_string()
            }
        };

        let endpoint = options
            .endpoint
            .clone()
            .unwrap_or_else(|| PUBSUB_ENDPOINT.to_string())
            .trim_end_matches('/')
            .to_string();

        Ok(Box::new(PubSubConnection {
            http: self.http.clone(),
            token,
            endpoint,
            project_id: project_id.map(str::to_string),
            cancel,
        }))
    }
}

/// An authenticated Pub/Sub session scoped to one project.
pub struct PubSubConnection {
    http: reqwest::Client,
    token: String,
    endpoint: String,
    project_id: Option<String>,
    cancel: CancellationToken,
}

impl Connection for PubSubConnection {
    fn bind(&self, topic: &str) -> Arc<dyn PublishHandle> {
        let (tx, mut rx) = mpsc::channel::<PublishCommand>(COMMAND_QUEUE_DEPTH);

        // Addressing a topic needs a project; without one the worker still
        // runs and rejects each command individually.
        let url = self.project_id.as_deref().map(|project| {
            format!(
                "{}/v1/projects/{}/topics/{}:publish",
                self.endpoint, project, topic
            )
        });

        let http = self.http.clone();
        let token = self.token.clone();
        let cancel = self.cancel.child_token();
        let topic_name = topic.to_string();

        tokio::spawn(async move {
            tracing::debug!(topic = %topic_name, "publish worker started");
            loop {
                // Commands already handed over are drained before the
                // cancellation branch is taken.
                tokio::select! {
                    biased;
                    command = rx.recv() => {
                        // A closed channel means the handle was stopped;
                        // everything already queued has been drained.
                        let Some(PublishCommand { payload, reply }) = command else {
                            break;
                        };
                        let result = publish_once(&http, url.as_deref(), &token, &payload).await;
                        if let Err(error) = &result {
                            tracing::warn!(topic = %topic_name, %error, "publish attempt failed");
                        }
                        let _ = reply.send(result);
                    }
                    _ = cancel.cancelled() => break,
                }
            }
            tracing::debug!(topic = %topic_name, "publish worker stopped");
        });

        Arc::new(PubSubPublisher {
            commands: Mutex::new(Some(tx)),
        })
    }
}

/// A bound Pub/Sub topic. Cheap to clone through its `Arc`; safe to use
/// from any number of tasks concurrently.
pub struct PubSubPublisher {
    commands: Mutex<Option<mpsc::Sender<PublishCommand>>>,
}

struct PublishCommand {
    payload: ReportedError,
    reply: oneshot::Sender<Result<String>>,
}

#[async_trait]
impl PublishHandle for PubSubPublisher {
    async fn publish(&self, payload: &ReportedError) -> Result<String> {
        let sender = self
            .commands
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let Some(sender) = sender else {
            return Err(Error::Stopped);
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        sender
            .send(PublishCommand {
                payload: payload.clone(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| Error::Stopped)?;

        reply_rx.await.map_err(|_| Error::Stopped)?
    }

    async fn stop(&self) {
        // Dropping the sender closes the channel; the worker drains what it
        // was already handed and exits on its own.
        self.commands
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }
}

/// Response from POST .../topics/{topic}:publish
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishResponse {
    #[serde(default)]
    message_ids: Vec<String>,
}

async fn publish_once(
    http: &reqwest::Client,
    url: Option<&str>,
    token: &str,
    payload: &ReportedError,
) -> Result<String> {
    let Some(url) = url else {
        return Err(Error::Publish(
            "project id unknown, cannot address topic".to_string(),
        ));
    };

    let data = serde_json::to_vec(payload)
        .map_err(|e| Error::Publish(format!("failed to encode payload: {e}")))?;
    let body = serde_json::json!({
        "messages": [
            { "data": base64::engine::general_purpose::STANDARD.encode(data) }
        ]
    });

    let response = http
        .post(url)
        .bearer_auth(token)
        .json(&body)
        .send()
        .await
        .map_err(|e| Error::Publish(format!("HTTP request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let detail = response
            .text()
            .await
            .unwrap_or_else(|_| "unknown".to_string());
        return Err(Error::Publish(format!("backend returned {status}: {detail}")));
    }

    let parsed: PublishResponse = response
        .json()
        .await
        .map_err(|e| Error::Publish(format!("failed to parse response: {e}")))?;

    parsed
        .message_ids
        .into_iter()
        .next()
        .ok_or_else(|| Error::Publish("backend acknowledged without a message id".to_string()))
}
