//! Logging initialization

use cloud_iot_agent::observability::{init_logging, LogFormat};
use tracing::Level;

#[test]
fn test_repeated_initialization_does_not_panic() {
    init_logging(Level::DEBUG, LogFormat::Json, false);
    init_logging(Level::INFO, LogFormat::Compact, true);
    init_logging(Level::WARN, LogFormat::Pretty, false);

    let span = cloud_iot_agent::lifecycle_span!(device_id = "dev-1", phase = "test");
    let _guard = span.enter();
    tracing::info!(topic = "/devices/dev-1/state", "logging initialized");
}
