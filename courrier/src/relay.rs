//! Relay client: hands rendered messages to the upstream SMTP server.

use std::time::Duration;

use async_trait::async_trait;
use lettre::address::Envelope;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use thiserror::Error;
use tracing::info;

use crate::config::{SmtpConfig, TlsMode};

/// Outcome of a failed delivery attempt.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Worth retrying on the next salvo (connection refused, timeout, 4xx).
    #[error("transient delivery failure: {0}")]
    Transient(String),

    /// The relay rejected the message for good (5xx).
    #[error("permanent delivery failure: {0}")]
    Permanent(String),
}

impl DeliveryError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }
}

/// Async delivery of one rendered message.
///
/// Implement this trait to deliver through something other than SMTP.
#[async_trait]
pub trait Relay: Send + Sync + 'static {
    async fn deliver(&self, envelope: &Envelope, message: &[u8]) -> Result<(), DeliveryError>;
}

#[derive(Debug, Error)]
#[error("invalid relay configuration: {0}")]
pub struct RelayConfigError(#[from] lettre::transport::smtp::Error);

/// SMTP relay using a pooled lettre transport.
#[derive(Clone)]
pub struct SmtpRelay {
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpRelay {
    pub fn from_config(config: &SmtpConfig) -> Result<Self, RelayConfigError> {
        let mut builder = match config.tls {
            TlsMode::None => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host),
            TlsMode::Tls => AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)?,
            TlsMode::Starttls => AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)?,
        };

        builder = builder
            .port(config.port)
            .timeout(Some(Duration::from_secs(config.timeout_secs)));

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        info!(
            host = %config.host,
            port = config.port,
            tls = ?config.tls,
            authenticated = config.username.is_some(),
            "smtp_relay_configured"
        );

        Ok(Self {
            transport: builder.build(),
        })
    }
}

#[async_trait]
impl Relay for SmtpRelay {
    async fn deliver(&self, envelope: &Envelope, message: &[u8]) -> Result<(), DeliveryError> {
        self.transport
            .send_raw(envelope, message)
            .await
            .map(|_| ())
            .map_err(classify)
    }
}

/// Only explicit 5xx replies are permanent; anything that never reached a
/// verdict (network, TLS, timeout) is retried.
fn classify(err: lettre::transport::smtp::Error) -> DeliveryError {
    if err.is_permanent() {
        DeliveryError::Permanent(err.to_string())
    } else {
        DeliveryError::Transient(err.to_string())
    }
}
