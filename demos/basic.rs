// A basic example demonstrating how to use the nano-gcp-reporting crate
// to publish application errors to a Pub/Sub topic.
use nano_gcp_reporting::ErrorReporter;
use tokio_util::task::TaskTracker;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let tracker = TaskTracker::new();

    // On GCE the project id and instance name are discovered from the
    // metadata service; elsewhere, set the project explicitly.
    let reporter = ErrorReporter::builder()
        .project_id("your-gcp-project-id")
        .completion_tracker(tracker.clone())
        .connect()
        .await?;

    // Until init is called, reported errors only go to stderr.
    reporter.init("errors-topic", None);

    reporter.report(&std::io::Error::other("disk full")).await;

    // Wait for in-flight reports, then tear down.
    tracker.close();
    tracker.wait().await;
    reporter.shutdown().await;

    Ok(())
}
