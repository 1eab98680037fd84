//! User-facing notifications.
//!
//! Components that swallow a failure (catalog fetch, model load, download
//! bookkeeping) report it here so the host can show it.

use serde::Serialize;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "lowercase")]
pub enum NotificationSeverity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserNotification {
    pub severity: NotificationSeverity,
    pub title: String,
    pub message: String,
}

/// Fan-out of [`UserNotification`]s to whoever is listening.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: broadcast::Sender<UserNotification>,
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UserNotification> {
        self.tx.subscribe()
    }

    pub fn notify(&self, severity: NotificationSeverity, title: &str, message: &str) {
        log::debug!("Notification [{}] {}: {}", severity, title, message);
        // No subscribers is fine
        let _ = self.tx.send(UserNotification {
            severity,
            title: title.to_string(),
            message: message.to_string(),
        });
    }

    pub fn info(&self, title: &str, message: &str) {
        self.notify(NotificationSeverity::Info, title, message)
    }

    pub fn warning(&self, title: &str, message: &str) {
        self.notify(NotificationSeverity::Warning, title, message)
    }

    pub fn error(&self, title: &str, message: &str) {
        self.notify(NotificationSeverity::Error, title, message)
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notifications_reach_every_subscriber() {
        let notifier = Notifier::new();
        let mut first = notifier.subscribe();
        let mut second = notifier.clone().subscribe();

        notifier.warning("Model catalog unavailable", "Check your connection.");

        for rx in [&mut first, &mut second] {
            let notification = rx.try_recv().unwrap();
            assert_eq!(notification.severity, NotificationSeverity::Warning);
            assert_eq!(notification.title, "Model catalog unavailable");
        }
    }

    #[test]
    fn test_notify_without_subscribers_is_fine() {
        Notifier::default().error("Model failed to load", "No model file is configured.");
    }

    #[test]
    fn test_serializes_lowercase_severity() {
        let json = serde_json::to_value(UserNotification {
            severity: NotificationSeverity::Error,
            title: "t".into(),
            message: "m".into(),
        })
        .unwrap();
        assert_eq!(json["severity"], "error");
    }
}
