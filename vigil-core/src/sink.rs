//! Outward notification channel
//!
//! Delivery is advisory. The persisted notification record is the source of
//! truth; a failed or timed-out delivery is logged and counted, never rolled back.

use serde::Serialize;

use crate::config::{SinkConfig, SinkKind};
use crate::error::Result;
use crate::http::JsonPoster;

/// Delivers a message to a recipient.
pub trait NotificationSink: Send + Sync {
    fn deliver(&self, recipient_id: &str, title: &str, body: &str) -> Result<()>;
}

/// Sink that only writes deliveries to the log.
#[derive(Debug, Default)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn deliver(&self, recipient_id: &str, title: &str, body: &str) -> Result<()> {
        tracing::info!(
            recipient = recipient_id,
            title,
            body_len = body.len(),
            "Notification delivered"
        );
        Ok(())
    }
}

#[derive(Serialize)]
struct DeliveryRequest<'a> {
    recipient_id: &'a str,
    title: &'a str,
    body: &'a str,
}

/// Sink that POSTs each delivery to an HTTP endpoint.
pub struct WebhookSink {
    poster: JsonPoster,
}

impl WebhookSink {
    pub fn new(url: &str, api_key: Option<&str>, timeout_secs: u64) -> Result<Self> {
        Ok(Self {
            poster: JsonPoster::new(url, api_key, timeout_secs)?,
        })
    }
}

impl NotificationSink for WebhookSink {
    fn deliver(&self, recipient_id: &str, title: &str, body: &str) -> Result<()> {
        self.poster.post(&DeliveryRequest {
            recipient_id,
            title,
            body,
        })?;
        tracing::debug!(recipient = recipient_id, url = self.poster.url(), "Webhook delivery sent");
        Ok(())
    }
}

/// Build the sink described by the configuration.
pub fn from_config(config: &SinkConfig) -> Result<Box<dyn NotificationSink>> {
    config.validate()?;
    match config.kind {
        SinkKind::Log => Ok(Box::new(LogSink)),
        SinkKind::Webhook => {
            let url = config.url.as_deref().unwrap_or_default();
            Ok(Box::new(WebhookSink::new(
                url,
                config.api_key.as_deref(),
                config.timeout_secs,
            )?))
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::error::Error;
    use std::sync::Mutex;

    /// Records deliveries; optionally fails every call.
    #[derive(Default)]
    pub struct RecordingSink {
        pub delivered: Mutex<Vec<(String, String, String)>>,
        pub fail: bool,
    }

    impl RecordingSink {
        pub fn failing() -> Self {
            Self {
                delivered: Mutex::new(Vec::new()),
                fail: true,
            }
        }

        pub fn recipients(&self) -> Vec<String> {
            self.delivered
                .lock()
                .unwrap()
                .iter()
                .map(|(r, _, _)| r.clone())
                .collect()
        }
    }

    impl NotificationSink for RecordingSink {
        fn deliver(&self, recipient_id: &str, title: &str, body: &str) -> Result<()> {
            if self.fail {
                return Err(Error::Delivery("sink unreachable".to_string()));
            }
            self.delivered.lock().unwrap().push((
                recipient_id.to_string(),
                title.to_string(),
                body.to_string(),
            ));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_sink_always_succeeds() {
        assert!(LogSink.deliver("u-1", "Title", "Body").is_ok());
    }

    #[test]
    fn test_from_config_log() {
        assert!(from_config(&SinkConfig::default()).is_ok());
    }

    #[test]
    fn test_from_config_webhook_requires_url() {
        let config = SinkConfig {
            kind: SinkKind::Webhook,
            ..Default::default()
        };
        assert!(from_config(&config).is_err());
    }
}
