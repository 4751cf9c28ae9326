// ===============================
// src/alert.rs
// ===============================
use tracing::error;

/// Out-of-band operator notification (reconnect exhaustion, fatal faults).
/// Live deployments plug an email or chat sink in here.
pub trait AlertSink: Send {
    fn send_alert(&mut self, message: &str);
}

/// Default sink: alerts land in the structured log at ERROR.
pub struct LogAlert;

impl AlertSink for LogAlert {
    fn send_alert(&mut self, message: &str) {
        error!(alert = %message, "operator alert");
    }
}
