// HTTP-level tests for the GCE metadata and Pub/Sub adapters,
// exercised against wiremock servers.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use nano_gcp_reporting::{
    Backend, BackendOptions, Error, ErrorReporter, GceMetadata, MetadataResolver, PubSubBackend,
    ReportedError,
};

fn options_for(server: &MockServer) -> BackendOptions {
    BackendOptions {
        endpoint: Some(server.uri()),
        access_token: Some("test-token".to_string()),
    }
}

fn payload() -> ReportedError {
    ReportedError {
        error: "disk full".to_string(),
        trace: "at main".to_string(),
        instance_name: Some("host-42".to_string()),
    }
}

#[tokio::test]
async fn publish_sends_base64_payload_and_returns_message_id() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/projects/proj-1/topics/errors-topic:publish"))
        .and(header("authorization", "Bearer test-token"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({ "messageIds": ["42"] })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let backend = PubSubBackend::new();
    let connection = backend
        .connect(Some("proj-1"), &options_for(&server), CancellationToken::new())
        .await
        .unwrap();
    let handle = connection.bind("errors-topic");

    let delivery_id = handle.publish(&payload()).await.unwrap();
    assert_eq!(delivery_id, "42");

    // The message data is the base64-wrapped JSON payload.
    let requests = server.received_requests().await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    let data = body["messages"][0]["data"].as_str().unwrap();
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(data)
        .unwrap();
    let sent: ReportedError = serde_json::from_slice(&decoded).unwrap();
    assert_eq!(sent, payload());
}

#[tokio::test]
async fn publish_rejection_becomes_a_publish_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(403).set_body_string("permission denied"))
        .mount(&server)
        .await;

    let backend = PubSubBackend::new();
    let connection = backend
        .connect(Some("proj-1"), &options_for(&server), CancellationToken::new())
        .await
        .unwrap();
    let handle = connection.bind("errors-topic");

    match handle.publish(&payload()).await {
        Err(Error::Publish(message)) => {
            assert!(message.contains("403"), "unexpected message: {message}")
        }
        other => panic!("expected publish error, got {other:?}"),
    }
}

#[tokio::test]
async fn publish_without_a_project_fails_locally() {
    let server = MockServer::start().await;

    let backend = PubSubBackend::new();
    let connection = backend
        .connect(None, &options_for(&server), CancellationToken::new())
        .await
        .unwrap();
    let handle = connection.bind("errors-topic");

    match handle.publish(&payload()).await {
        Err(Error::Publish(message)) => {
            assert!(message.contains("project id unknown"))
        }
        other => panic!("expected publish error, got {other:?}"),
    }
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn stopped_handle_refuses_new_publishes() {
    let server = MockServer::start().await;

    let backend = PubSubBackend::new();
    let connection = backend
        .connect(Some("proj-1"), &options_for(&server), CancellationToken::new())
        .await
        .unwrap();
    let handle = connection.bind("errors-topic");

    handle.stop().await;
    handle.stop().await;

    assert!(matches!(
        handle.publish(&payload()).await,
        Err(Error::Stopped)
    ));
}

#[tokio::test]
async fn metadata_lookups_hit_the_flavored_endpoints() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/computeMetadata/v1/project/project-id"))
        .and(header("Metadata-Flavor", "Google"))
        .respond_with(ResponseTemplate::new(200).set_body_string("proj-1"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/computeMetadata/v1/instance/name"))
        .and(header("Metadata-Flavor", "Google"))
        .respond_with(ResponseTemplate::new(200).set_body_string("host-42"))
        .mount(&server)
        .await;

    let resolver = GceMetadata::with_base_url(server.uri());
    assert_eq!(resolver.project_id().await.unwrap(), "proj-1");
    assert_eq!(resolver.instance_name().await.unwrap(), "host-42");
}

#[tokio::test]
async fn metadata_rejection_is_not_a_timeout() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let resolver = GceMetadata::with_base_url(server.uri());
    let error = resolver.project_id().await.unwrap_err();
    assert!(!error.is_timeout());
}

#[tokio::test]
async fn slow_metadata_service_classifies_as_timeout() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("proj-1")
                .set_delay(Duration::from_millis(500)),
        )
        .mount(&server)
        .await;

    let resolver =
        GceMetadata::with_base_url_and_timeout(server.uri(), Duration::from_millis(100));
    let error = resolver.project_id().await.unwrap_err();
    assert!(error.is_timeout());
}

#[tokio::test]
async fn reporter_end_to_end_over_http() {
    let metadata_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/computeMetadata/v1/project/project-id"))
        .respond_with(ResponseTemplate::new(200).set_body_string("proj-1"))
        .mount(&metadata_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/computeMetadata/v1/instance/name"))
        .respond_with(ResponseTemplate::new(200).set_body_string("host-42"))
        .mount(&metadata_server)
        .await;

    let pubsub_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/projects/proj-1/topics/errors-topic:publish"))
        .and(header("authorization", "Bearer test-token"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({ "messageIds": ["m-7"] })),
        )
        .expect(1)
        .mount(&pubsub_server)
        .await;

    let reporter = ErrorReporter::builder()
        .backend(Arc::new(PubSubBackend::new()))
        .metadata(Arc::new(GceMetadata::with_base_url(metadata_server.uri())))
        .options(options_for(&pubsub_server))
        .connect()
        .await
        .unwrap();

    assert_eq!(reporter.project_id(), Some("proj-1"));
    assert_eq!(reporter.instance_name().as_deref(), Some("host-42"));

    reporter.init("errors-topic", None);
    reporter
        .report(&std::io::Error::other("disk full"))
        .await;

    reporter.shutdown().await;
}
