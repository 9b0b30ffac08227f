//! Alert dispatch with per-transport retry.
//!
//! A send succeeds when at least one configured transport confirmed delivery.
//! Each transport gets up to `max_attempts` tries with exponential backoff
//! starting at `backoff_ms`.

#![allow(missing_docs)]

use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::alert::event::AlertEvent;
use crate::alert::transport::{
    FileTransport, JournalTransport, SendmailTransport, Transport, WebhookTransport,
};
use crate::core::config::data_dir;
use crate::core::errors::{GuardError, Result};
use crate::core::redact::Redactor;

/// Transport names accepted in `alerts.channels`.
pub const KNOWN_CHANNELS: [&str; 4] = ["journal", "file", "sendmail", "webhook"];

// ──────────────────── configuration ────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AlertConfig {
    /// Which transports to use, by name.
    pub channels: Vec<String>,
    pub max_attempts: u32,
    /// First retry delay; doubles on every further attempt.
    pub backoff_ms: u64,
    pub file: FileAlertConfig,
    pub sendmail: SendmailConfig,
    pub webhook: WebhookConfig,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            channels: vec!["journal".to_string(), "file".to_string()],
            max_attempts: 3,
            backoff_ms: 500,
            file: FileAlertConfig::default(),
            sendmail: SendmailConfig::default(),
            webhook: WebhookConfig::default(),
        }
    }
}

impl AlertConfig {
    fn uses(&self, channel: &str) -> bool {
        self.channels.iter().any(|c| c == channel)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(GuardError::InvalidConfig {
                details: "alerts.max_attempts must be >= 1".to_string(),
            });
        }
        if let Some(unknown) = self
            .channels
            .iter()
            .find(|c| !KNOWN_CHANNELS.contains(&c.as_str()))
        {
            return Err(GuardError::InvalidConfig {
                details: format!(
                    "alerts.channels contains unknown transport {unknown:?} (known: {})",
                    KNOWN_CHANNELS.join(", ")
                ),
            });
        }
        if self.uses("sendmail") && self.sendmail.recipient.trim().is_empty() {
            return Err(GuardError::InvalidConfig {
                details: "alerts.sendmail.recipient is required when sendmail is enabled"
                    .to_string(),
            });
        }
        if self.uses("sendmail") {
            for (key, address) in [
                ("recipient", &self.sendmail.recipient),
                ("sender", &self.sendmail.sender),
            ] {
                if let Err(e) = address.parse::<lettre::message::Mailbox>() {
                    return Err(GuardError::InvalidConfig {
                        details: format!("alerts.sendmail.{key} {address:?} is not a mail address: {e}"),
                    });
                }
            }
        }
        if self.uses("webhook") && self.webhook.url.trim().is_empty() {
            return Err(GuardError::InvalidConfig {
                details: "alerts.webhook.url is required when webhook is enabled".to_string(),
            });
        }
        Ok(())
    }
}

/// File alert settings (append-only JSONL).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FileAlertConfig {
    pub path: PathBuf,
}

impl Default for FileAlertConfig {
    fn default() -> Self {
        Self {
            path: data_dir().join("alerts.jsonl"),
        }
    }
}

/// Email settings for a sendmail-compatible binary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SendmailConfig {
    pub binary: PathBuf,
    pub recipient: String,
    pub sender: String,
}

impl Default for SendmailConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("/usr/sbin/sendmail"),
            recipient: String::new(),
            sender: "bsg@localhost".to_string(),
        }
    }
}

/// Webhook settings (HTTP POST via curl).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WebhookConfig {
    pub url: String,
    /// Template with `${SUBJECT}`, `${SEVERITY}`, `${BODY}`, `${TIMESTAMP}` placeholders.
    pub template: String,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            template: r#"{"text": "bsg: ${SUBJECT}"}"#.to_string(),
        }
    }
}

// ──────────────────── notifier ────────────────────

/// Proof of delivery for one alert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotifyReceipt {
    /// Transports that confirmed delivery.
    pub delivered: Vec<String>,
    /// Transports that gave up, with their last error.
    pub failed: Vec<(String, String)>,
    /// Delivery attempts across all transports.
    pub attempts: u32,
}

/// Anything that can get an [`AlertEvent`] to an operator.
pub trait AlertNotifier {
    fn send(&mut self, event: &AlertEvent) -> Result<NotifyReceipt>;
}

/// Default notifier: fans out to the configured transports.
pub struct TransportNotifier {
    transports: Vec<Box<dyn Transport>>,
    max_attempts: u32,
    backoff: Duration,
    /// Scrubs transport errors before they reach stderr, logs or receipts.
    redactor: Redactor,
}

impl TransportNotifier {
    /// Build from configuration. Unknown names are rejected by
    /// [`AlertConfig::validate`] and skipped here.
    #[must_use]
    pub fn from_config(config: &AlertConfig) -> Self {
        let mut transports: Vec<Box<dyn Transport>> = Vec::new();
        for name in &config.channels {
            match name.as_str() {
                "journal" => transports.push(Box::new(JournalTransport)),
                "file" => transports.push(Box::new(FileTransport::new(&config.file))),
                "sendmail" => transports.push(Box::new(SendmailTransport::new(&config.sendmail))),
                "webhook" => transports.push(Box::new(WebhookTransport::new(&config.webhook))),
                _ => {}
            }
        }
        // Webhook URLs usually embed their access token.
        let mut redactor = Redactor::default();
        redactor.add_literal(config.webhook.url.trim());
        Self::with_transports(
            transports,
            config.max_attempts,
            Duration::from_millis(config.backoff_ms),
        )
        .with_redactor(redactor)
    }

    #[must_use]
    pub fn with_transports(
        transports: Vec<Box<dyn Transport>>,
        max_attempts: u32,
        backoff: Duration,
    ) -> Self {
        Self {
            transports,
            max_attempts: max_attempts.max(1),
            backoff,
            redactor: Redactor::default(),
        }
    }

    #[must_use]
    pub fn with_redactor(mut self, redactor: Redactor) -> Self {
        self.redactor = redactor;
        self
    }

    #[must_use]
    pub fn transport_names(&self) -> Vec<&str> {
        self.transports.iter().map(|t| t.name()).collect()
    }

    /// Try one transport until it succeeds or runs out of attempts.
    fn deliver_with_retry(&self, transport: &dyn Transport, event: &AlertEvent) -> (u32, Option<String>) {
        let mut delay = self.backoff;
        let mut last_error = String::new();
        for attempt in 1..=self.max_attempts {
            match transport.deliver(event) {
                Ok(()) => return (attempt, None),
                Err(e) => {
                    last_error = self.redactor.redact(&e.to_string()).into_owned();
                    eprintln!(
                        "[BSG-NOTIFY] {} attempt {attempt}/{} failed: {last_error}",
                        transport.name(),
                        self.max_attempts
                    );
                }
            }
            if attempt < self.max_attempts && !delay.is_zero() {
                thread::sleep(delay);
                delay = delay.saturating_mul(2);
            }
        }
        (self.max_attempts, Some(last_error))
    }
}

impl AlertNotifier for TransportNotifier {
    fn send(&mut self, event: &AlertEvent) -> Result<NotifyReceipt> {
        if self.transports.is_empty() {
            return Err(GuardError::Notify {
                attempts: 0,
                details: "no alert transport configured".to_string(),
            });
        }

        let mut receipt = NotifyReceipt {
            delivered: Vec::new(),
            failed: Vec::new(),
            attempts: 0,
        };
        for transport in &self.transports {
            let (attempts, error) = self.deliver_with_retry(transport.as_ref(), event);
            receipt.attempts += attempts;
            match error {
                None => receipt.delivered.push(transport.name().to_string()),
                Some(e) => receipt.failed.push((transport.name().to_string(), e)),
            }
        }

        if receipt.delivered.is_empty() {
            let details = receipt
                .failed
                .iter()
                .map(|(name, e)| format!("{name}: {e}"))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(GuardError::Notify {
                attempts: receipt.attempts,
                details,
            });
        }
        Ok(receipt)
    }
}
