//! Request router: the `send_email` entry point shared by every intake.
//!
//! Looks the key up, renders the message with the key's sender identity and
//! appends it to the key's spool. Every failure becomes a [`SendOutcome`];
//! nothing here panics on caller input.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::message::{render, OutboundMessage};
use crate::registry::Registry;

pub const MSG_ENQUEUED: &str = "Email enqueued.";
pub const ERR_UNKNOWN_MAILER: &str = "unknown mailer";
pub const ERR_CORRUPTED: &str = "Email corrupted";
pub const ERR_UNAVAILABLE: &str = "mailer unavailable";
pub const ERR_NOT_QUEUED: &str = "Email could not be queued";

/// Arguments of `send_email`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendEmailRequest {
    pub key: String,
    pub recipients: Vec<String>,
    pub subject: String,
    pub text: String,
    #[serde(default)]
    pub html: Option<String>,
}

impl SendEmailRequest {
    fn message(&self) -> OutboundMessage {
        OutboundMessage {
            recipients: self.recipients.clone(),
            subject: self.subject.clone(),
            text: self.text.clone(),
            html: self.html.clone(),
        }
    }
}

/// What happened to a `send_email` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Durably queued; delivery happens later.
    Enqueued,
    /// No mailbox is registered under the key.
    UnknownMailbox,
    /// The request could not be rendered into a message.
    MalformedMessage,
    /// The mailbox worker is not running (not started yet, or stopping).
    Unavailable,
    /// The spool refused the write.
    QueueFailure,
}

impl SendOutcome {
    pub fn is_enqueued(self) -> bool {
        self == Self::Enqueued
    }

    /// Whether the same request may succeed if submitted again later.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Unavailable | Self::QueueFailure)
    }
}

/// Wire form of a [`SendOutcome`]: `{"msg": ..}` or `{"err": ..}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SendEmailResponse {
    Ok { msg: String },
    Err { err: String },
}

impl From<SendOutcome> for SendEmailResponse {
    fn from(outcome: SendOutcome) -> Self {
        let err = match outcome {
            SendOutcome::Enqueued => {
                return Self::Ok {
                    msg: MSG_ENQUEUED.to_string(),
                }
            }
            SendOutcome::UnknownMailbox => ERR_UNKNOWN_MAILER,
            SendOutcome::MalformedMessage => ERR_CORRUPTED,
            SendOutcome::Unavailable => ERR_UNAVAILABLE,
            SendOutcome::QueueFailure => ERR_NOT_QUEUED,
        };
        Self::Err {
            err: err.to_string(),
        }
    }
}

/// Routes submissions to mailbox spools.
#[derive(Clone)]
pub struct MailRouter {
    registry: Arc<Registry>,
}

impl MailRouter {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub async fn send_email(&self, request: &SendEmailRequest) -> SendOutcome {
        let Some(entry) = self.registry.lookup(&request.key) else {
            warn!(mailbox = %request.key, "send_email_unknown_mailbox");
            return SendOutcome::UnknownMailbox;
        };

        if !entry.worker.is_running() {
            warn!(mailbox = %request.key, state = ?entry.worker.state(), "send_email_worker_unavailable");
            return SendOutcome::Unavailable;
        }

        let rendered = match render(&entry.sender, &request.message()) {
            Ok(rendered) => rendered,
            Err(e) if e.is_caller_error() => {
                warn!(mailbox = %request.key, error = %e, "send_email_malformed");
                return SendOutcome::MalformedMessage;
            }
            Err(e) => {
                error!(mailbox = %request.key, error = %e, "send_email_render_failed");
                return SendOutcome::MalformedMessage;
            }
        };

        match entry.worker.queue().append(&rendered).await {
            Ok(queued) => {
                info!(
                    mailbox = %request.key,
                    entry = %queued,
                    recipients = request.recipients.len(),
                    bytes = rendered.len(),
                    "send_email_enqueued"
                );
                SendOutcome::Enqueued
            }
            Err(e) => {
                error!(mailbox = %request.key, error = %e, "send_email_enqueue_failed");
                SendOutcome::QueueFailure
            }
        }
    }
}
