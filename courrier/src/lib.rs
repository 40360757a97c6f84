//! Courrier - mail submission front-end.
//!
//! Callers submit emails under a mailbox key; each key has its own durable
//! spool and a background worker that flushes it to an SMTP relay.
//!
//! ## Architecture
//!
//! ```text
//! RPC / AMQP → MailRouter → Registry lookup → render → Maildir spool
//!                                                          ↓
//!                                     Worker salvo (every N seconds) → Relay
//! ```

pub mod amqp;
pub mod config;
pub mod message;
pub mod queue;
pub mod registry;
pub mod relay;
pub mod router;
pub mod service;
pub mod web;
pub mod worker;

// Re-export commonly used types
pub use config::Config;
pub use message::{render, OutboundMessage, SenderIdentity};
pub use queue::{Maildir, QueueError, QueuedMessage};
pub use registry::{Registry, RegistryEntry, RegistryError};
pub use relay::{DeliveryError, Relay, SmtpRelay};
pub use router::{MailRouter, SendEmailRequest, SendEmailResponse, SendOutcome};
pub use service::{startup, RunningService, StartupError};
pub use web::AppState;
pub use worker::{SalvoReport, Worker, WorkerState};
