//! Alert transports: journal, file, sendmail and webhook.
//!
//! Unlike status notifications, alerts must be confirmed: every transport
//! reports whether delivery succeeded so the notifier can retry and, in the
//! end, fail the run loudly.

#![allow(missing_docs)]

use std::fs::{self, OpenOptions};
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

use chrono::SecondsFormat;
use lettre::Message;
use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use serde::Serialize;
use thiserror::Error;

use crate::alert::event::{AlertEvent, AlertSeverity};
use crate::alert::notifier::{FileAlertConfig, SendmailConfig, WebhookConfig};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
const WEBHOOK_MAX_TIME_SECS: u32 = 10;

/// Why a single delivery attempt failed.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("{program} exited with {status}: {stderr}")]
    Rejected {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("{program} did not finish within {secs}s")]
    TimedOut { program: String, secs: u64 },

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid mail address {address:?}: {details}")]
    Address { address: String, details: String },

    #[error("cannot build mail message: {0}")]
    Message(#[from] lettre::error::Error),
}

/// A delivery mechanism for [`AlertEvent`]s.
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;
    fn deliver(&self, event: &AlertEvent) -> Result<(), TransportError>;
}

// ──── Journal (systemd structured stderr) ────

/// Writes the alert to stderr with a syslog priority prefix.
#[derive(Debug, Default)]
pub struct JournalTransport;

impl JournalTransport {
    fn write_to(event: &AlertEvent, out: &mut impl Write) -> io::Result<()> {
        let priority = event.severity.journal_priority();
        writeln!(out, "[BSG-ALERT] [{priority}] {}", event.subject)?;
        for line in event.body.lines().filter(|l| !l.trim().is_empty()) {
            writeln!(out, "[BSG-ALERT] [{priority}]   {line}")?;
        }
        out.flush()
    }
}

impl Transport for JournalTransport {
    fn name(&self) -> &'static str {
        "journal"
    }

    fn deliver(&self, event: &AlertEvent) -> Result<(), TransportError> {
        let stderr = io::stderr();
        let mut lock = stderr.lock();
        Self::write_to(event, &mut lock)?;
        Ok(())
    }
}

// ──── File (append-only JSONL) ────

#[derive(Debug, Serialize)]
struct AlertRecord<'a> {
    ts: String,
    severity: AlertSeverity,
    subject: &'a str,
    body: &'a str,
}

/// Appends one JSON object per alert to a 0600 file.
#[derive(Debug)]
pub struct FileTransport {
    path: PathBuf,
}

impl FileTransport {
    #[must_use]
    pub fn new(config: &FileAlertConfig) -> Self {
        Self {
            path: config.path.clone(),
        }
    }
}

impl Transport for FileTransport {
    fn name(&self) -> &'static str {
        "file"
    }

    fn deliver(&self, event: &AlertEvent) -> Result<(), TransportError> {
        let record = AlertRecord {
            ts: event
                .timestamp_utc
                .to_rfc3339_opts(SecondsFormat::Millis, true),
            severity: event.severity,
            subject: &event.subject,
            body: &event.body,
        };
        let json = serde_json::to_string(&record)?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut opts = OpenOptions::new();
        opts.create(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt as _;
            opts.mode(0o600);
        }
        let mut file = opts.open(&self.path)?;
        writeln!(file, "{json}")?;
        file.sync_data()?;
        Ok(())
    }
}

// ──── Sendmail (RFC 5322 message on stdin) ────

/// Email delivery through a sendmail-compatible binary.
#[derive(Debug)]
pub struct SendmailTransport {
    binary: PathBuf,
    recipient: String,
    sender: String,
}

impl SendmailTransport {
    #[must_use]
    pub fn new(config: &SendmailConfig) -> Self {
        Self {
            binary: config.binary.clone(),
            recipient: config.recipient.clone(),
            sender: config.sender.clone(),
        }
    }

    /// Build the RFC 5322 message. Addresses are parsed, so header injection
    /// through the configured sender or recipient is rejected.
    fn message(&self, event: &AlertEvent) -> Result<Message, TransportError> {
        let message = Message::builder()
            .from(mailbox(&self.sender)?)
            .to(mailbox(&self.recipient)?)
            .subject(format!("[bsg] {}", event.subject))
            .date(SystemTime::from(event.timestamp_utc))
            .header(ContentType::TEXT_PLAIN)
            .body(event.render())?;
        Ok(message)
    }
}

fn mailbox(address: &str) -> Result<Mailbox, TransportError> {
    address.parse().map_err(|e: lettre::address::AddressError| TransportError::Address {
        address: address.to_string(),
        details: e.to_string(),
    })
}

impl Transport for SendmailTransport {
    fn name(&self) -> &'static str {
        "sendmail"
    }

    fn deliver(&self, event: &AlertEvent) -> Result<(), TransportError> {
        let message = self.message(event)?.formatted();
        let mut child = Command::new(&self.binary)
            .arg("-i")
            .arg("--")
            .arg(&self.recipient)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;
        let stderr = drain_stderr(&mut child);

        if let Some(mut stdin) = child.stdin.take()
            && let Err(e) = stdin.write_all(&message)
        {
            let _ = child.kill();
            let _ = child.wait();
            return Err(e.into());
        }
        let program = self.binary.display().to_string();
        finish(&mut child, stderr, &program, COMMAND_TIMEOUT)
    }
}

// ──── Webhook (HTTP POST via curl) ────

/// JSON POST through `curl --fail`.
#[derive(Debug)]
pub struct WebhookTransport {
    program: PathBuf,
    url: String,
    template: String,
}

impl WebhookTransport {
    #[must_use]
    pub fn new(config: &WebhookConfig) -> Self {
        Self {
            program: PathBuf::from("curl"),
            url: config.url.clone(),
            template: config.template.clone(),
        }
    }

    /// Fill `${SUBJECT}`, `${SEVERITY}`, `${BODY}` and `${TIMESTAMP}` with
    /// JSON-escaped values.
    #[must_use]
    pub fn render_body(&self, event: &AlertEvent) -> String {
        self.template
            .replace("${SUBJECT}", &json_escape(&event.subject))
            .replace("${SEVERITY}", &json_escape(&event.severity.to_string()))
            .replace("${BODY}", &json_escape(&event.body))
            .replace("${TIMESTAMP}", &json_escape(&event.timestamp_rfc3339()))
    }
}

impl Transport for WebhookTransport {
    fn name(&self) -> &'static str {
        "webhook"
    }

    fn deliver(&self, event: &AlertEvent) -> Result<(), TransportError> {
        let body = self.render_body(event);
        let mut child = Command::new(&self.program)
            .arg("--silent")
            .arg("--show-error")
            .arg("--fail")
            .arg("--max-time")
            .arg(WEBHOOK_MAX_TIME_SECS.to_string())
            .arg("--header")
            .arg("Content-Type: application/json")
            .arg("--data-binary")
            .arg(&body)
            .arg(&self.url)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;
        let stderr = drain_stderr(&mut child);
        let program = self.program.display().to_string();
        finish(&mut child, stderr, &program, COMMAND_TIMEOUT)
    }
}

/// Escape a value for interpolation inside a JSON string literal.
fn json_escape(value: &str) -> String {
    let quoted = serde_json::Value::String(value.to_string()).to_string();
    quoted[1..quoted.len() - 1].to_string()
}

/// Read a helper's stderr on its own thread so a chatty helper cannot block
/// on a full pipe while we wait for it.
fn drain_stderr(child: &mut Child) -> Option<JoinHandle<Vec<u8>>> {
    child.stderr.take().map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            buf
        })
    })
}

/// Wait for a helper process with a deadline, turning non-zero exits into
/// [`TransportError::Rejected`].
fn finish(
    child: &mut Child,
    stderr: Option<JoinHandle<Vec<u8>>>,
    program: &str,
    timeout: Duration,
) -> Result<(), TransportError> {
    let deadline = Instant::now() + timeout;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Err(TransportError::TimedOut {
                program: program.to_string(),
                secs: timeout.as_secs(),
            });
        }
        thread::sleep(Duration::from_millis(20));
    };

    if status.success() {
        return Ok(());
    }
    let stderr = stderr
        .and_then(|handle| handle.join().ok())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default();
    Err(TransportError::Rejected {
        program: program.to_string(),
        status: describe_status(status),
        stderr: stderr.trim().chars().take(512).collect(),
    })
}

fn describe_status(status: ExitStatus) -> String {
    status
        .code()
        .map_or_else(|| "signal".to_string(), |code| format!("status {code}"))
}
