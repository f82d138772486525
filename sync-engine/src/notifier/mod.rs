//! Severity-filtered, pluggable out-of-band status channel (spec.md §4.9).
//!
//! Grounded on the original's `INotificationService` / `SlackNotificationService`:
//! a single-method transport interface, each variant declaring its own
//! `min_severity` floor, transport failures swallowed and logged rather than
//! propagated (spec.md §8 invariant 7 "Notifier never raises into its caller").

use async_trait::async_trait;

/// Clamped 0..100. `< 50` info, `50..79` warn, `>= 80` critical (spec.md §4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Severity(u8);

impl Severity {
    pub const INFO: Severity = Severity(25);
    pub const WARN: Severity = Severity(60);
    pub const CRITICAL: Severity = Severity(90);

    pub fn new(value: u8) -> Self {
        Self(value.min(100))
    }

    pub fn value(self) -> u8 {
        self.0
    }

    pub fn is_critical(self) -> bool {
        self.0 >= 80
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Floor below which `notify` is a silent no-op for this variant.
    fn min_severity(&self) -> Severity;

    /// Send `message`. Must never propagate a transport error to the
    /// caller — log and return instead.
    async fn notify(&self, message: &str, severity: Severity);

    async fn notify_success(&self, order_id: &str, invoice_id: Option<i64>) {
        let message = match invoice_id {
            Some(id) => format!("order {order_id} synced, invoice {id}"),
            None => format!("order {order_id} synced (dry run)"),
        };
        self.notify(&message, Severity::INFO).await;
    }

    async fn notify_error(&self, order_id: &str, error: &str) {
        self.notify(&format!("order {order_id} failed: {error}"), Severity::CRITICAL).await;
    }
}

/// Posts a JSON payload to a webhook URL (teacher's HTTP-client style,
/// `crab-client`). Below `min_severity`, or with no URL configured, drops
/// silently.
pub struct WebhookNotifier {
    client: reqwest::Client,
    webhook_url: String,
    min_severity: Severity,
}

impl WebhookNotifier {
    pub fn new(webhook_url: String, min_severity: Severity) -> Self {
        Self { client: reqwest::Client::new(), webhook_url, min_severity }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn min_severity(&self) -> Severity {
        self.min_severity
    }

    async fn notify(&self, message: &str, severity: Severity) {
        if severity < self.min_severity {
            return;
        }
        let payload = serde_json::json!({ "message": message, "severity": severity.value() });
        if let Err(e) = self.client.post(&self.webhook_url).json(&payload).send().await {
            tracing::warn!(error = %e, "webhook notification delivery failed");
        }
    }
}

/// Logs via `tracing` at a level derived from severity. Always available —
/// the default in tests and when no webhook is configured.
pub struct LogNotifier {
    min_severity: Severity,
}

impl LogNotifier {
    pub fn new(min_severity: Severity) -> Self {
        Self { min_severity }
    }
}

impl Default for LogNotifier {
    fn default() -> Self {
        Self::new(Severity::new(0))
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    fn min_severity(&self) -> Severity {
        self.min_severity
    }

    async fn notify(&self, message: &str, severity: Severity) {
        if severity < self.min_severity {
            return;
        }
        if severity.is_critical() {
            tracing::error!(severity = severity.value(), "{message}");
        } else if severity >= Severity::WARN {
            tracing::warn!(severity = severity.value(), "{message}");
        } else {
            tracing::info!(severity = severity.value(), "{message}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RecordingNotifier {
        sent: tokio::sync::Mutex<Vec<(String, Severity)>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        fn min_severity(&self) -> Severity {
            Severity::WARN
        }

        async fn notify(&self, message: &str, severity: Severity) {
            if severity < self.min_severity() {
                return;
            }
            self.sent.lock().await.push((message.to_string(), severity));
        }
    }

    #[tokio::test]
    async fn below_floor_messages_are_dropped() {
        let notifier = RecordingNotifier { sent: tokio::sync::Mutex::new(Vec::new()) };
        notifier.notify("quiet", Severity::INFO).await;
        notifier.notify("loud", Severity::CRITICAL).await;
        let sent = notifier.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "loud");
    }

    #[test]
    fn severity_clamps_to_100() {
        assert_eq!(Severity::new(250).value(), 100);
    }

    #[tokio::test]
    async fn log_notifier_never_panics_without_a_subscriber() {
        let notifier = LogNotifier::default();
        notifier.notify_success("123-4567890-1234567", Some(42)).await;
        notifier.notify_error("123-4567890-1234567", "boom").await;
    }
}
