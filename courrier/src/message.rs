//! Message rendering and envelope recovery.
//!
//! Requests are rendered into RFC 5322 bytes before they touch a spool, so
//! the spool only ever holds plain messages. When a worker picks an entry
//! up again it recovers the SMTP envelope from the headers it wrote.

use lettre::address::{Address, AddressError, Envelope};
use lettre::message::{header::ContentType, Mailbox, MultiPart};
use lettre::Message;
use mailparse::{addrparse_header, MailAddr, MailHeaderMap};
use thiserror::Error;

use crate::config::SenderConfig;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("at least one recipient required")]
    NoRecipients,

    #[error("invalid email address {address:?}: {source}")]
    InvalidAddress {
        address: String,
        #[source]
        source: AddressError,
    },

    #[error("failed to build message: {0}")]
    Build(#[from] lettre::error::Error),
}

impl RenderError {
    /// Whether the failure comes from the request rather than from the
    /// message builder itself.
    pub fn is_caller_error(&self) -> bool {
        matches!(self, Self::NoRecipients | Self::InvalidAddress { .. })
    }
}

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("unreadable headers: {0}")]
    Headers(#[from] mailparse::MailParseError),

    #[error("missing {0} header")]
    MissingHeader(&'static str),

    #[error("invalid address {0:?}")]
    InvalidAddress(String),

    #[error("invalid envelope: {0}")]
    Envelope(#[from] lettre::error::Error),
}

/// The "From" identity bound to a mailbox key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderIdentity {
    pub address: Address,
    pub name: Option<String>,
}

impl SenderIdentity {
    pub fn new(address: Address, name: Option<String>) -> Self {
        Self { address, name }
    }

    pub fn mailbox(&self) -> Mailbox {
        Mailbox::new(self.name.clone(), self.address.clone())
    }
}

impl TryFrom<&SenderConfig> for SenderIdentity {
    type Error = RenderError;

    fn try_from(config: &SenderConfig) -> Result<Self, Self::Error> {
        let address = parse_address(&config.address)?;
        let name = config
            .name
            .as_ref()
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty());
        Ok(Self::new(address, name))
    }
}

/// An email as submitted by a caller.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub recipients: Vec<String>,
    pub subject: String,
    pub text: String,
    pub html: Option<String>,
}

fn parse_address(raw: &str) -> Result<Address, RenderError> {
    raw.trim()
        .parse()
        .map_err(|source| RenderError::InvalidAddress {
            address: raw.to_string(),
            source,
        })
}

/// Render a message into wire format, sent as `sender`.
///
/// A message with an HTML body becomes a `multipart/alternative` with the
/// plain text first; otherwise it is a single `text/plain` part.
pub fn render(sender: &SenderIdentity, message: &OutboundMessage) -> Result<Vec<u8>, RenderError> {
    if message.recipients.is_empty() {
        return Err(RenderError::NoRecipients);
    }

    let mut builder = Message::builder()
        .from(sender.mailbox())
        .subject(message.subject.as_str());

    for recipient in &message.recipients {
        builder = builder.to(Mailbox::new(None, parse_address(recipient)?));
    }

    let email = match &message.html {
        Some(html) => builder.multipart(MultiPart::alternative_plain_html(
            message.text.clone(),
            html.clone(),
        ))?,
        None => builder
            .header(ContentType::TEXT_PLAIN)
            .body(message.text.clone())?,
    };

    Ok(email.formatted())
}

/// Recover the SMTP envelope of a rendered message.
///
/// The reverse path is the first `From` mailbox; forward paths are every
/// mailbox in `To` and `Cc`, groups included.
pub fn envelope_of(raw: &[u8]) -> Result<Envelope, EnvelopeError> {
    let (headers, _) = mailparse::parse_headers(raw)?;

    let from = headers
        .get_first_header("From")
        .ok_or(EnvelopeError::MissingHeader("From"))?;
    let from = addrparse_header(from)?;
    let sender = addresses_in(&from)
        .next()
        .ok_or(EnvelopeError::MissingHeader("From"))?;
    let sender = to_address(sender)?;

    let mut recipients = Vec::new();
    for header in headers
        .get_all_headers("To")
        .into_iter()
        .chain(headers.get_all_headers("Cc"))
    {
        let list = addrparse_header(header)?;
        for addr in addresses_in(&list) {
            recipients.push(to_address(addr)?);
        }
    }

    if recipients.is_empty() {
        return Err(EnvelopeError::MissingHeader("To"));
    }

    Ok(Envelope::new(Some(sender), recipients)?)
}

fn addresses_in(list: &[MailAddr]) -> impl Iterator<Item = &str> + '_ {
    list.iter().flat_map(|addr| match addr {
        MailAddr::Single(info) => vec![info.addr.as_str()],
        MailAddr::Group(group) => group.addrs.iter().map(|i| i.addr.as_str()).collect(),
    })
}

fn to_address(raw: &str) -> Result<Address, EnvelopeError> {
    raw.parse()
        .map_err(|_| EnvelopeError::InvalidAddress(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sender() -> SenderIdentity {
        SenderIdentity::new("noreply@example.com".parse().unwrap(), Some("Courrier".into()))
    }

    fn message(recipients: &[&str]) -> OutboundMessage {
        OutboundMessage {
            recipients: recipients.iter().map(|r| r.to_string()).collect(),
            subject: "Hello".into(),
            text: "Plain body".into(),
            html: None,
        }
    }

    #[test]
    fn render_plain_text() {
        let raw = render(&sender(), &message(&["a@x.com"])).unwrap();
        let parsed = mailparse::parse_mail(&raw).unwrap();

        assert_eq!(
            parsed.headers.get_first_value("Subject").as_deref(),
            Some("Hello")
        );
        assert!(parsed
            .headers
            .get_first_value("From")
            .unwrap()
            .contains("noreply@example.com"));
        assert_eq!(parsed.ctype.mimetype, "text/plain");
        assert_eq!(parsed.get_body().unwrap().trim_end(), "Plain body");
    }

    #[test]
    fn render_with_html_is_multipart() {
        let mut msg = message(&["a@x.com"]);
        msg.html = Some("<p>Rich</p>".into());

        let raw = render(&sender(), &msg).unwrap();
        let parsed = mailparse::parse_mail(&raw).unwrap();

        assert_eq!(parsed.ctype.mimetype, "multipart/alternative");
        assert_eq!(parsed.subparts.len(), 2);
        assert_eq!(parsed.subparts[0].ctype.mimetype, "text/plain");
        assert_eq!(parsed.subparts[1].ctype.mimetype, "text/html");
    }

    #[test]
    fn render_rejects_empty_recipients() {
        let err = render(&sender(), &message(&[])).unwrap_err();
        assert!(matches!(err, RenderError::NoRecipients));
        assert!(err.is_caller_error());
    }

    #[test]
    fn render_rejects_invalid_address() {
        let err = render(&sender(), &message(&["a@x.com", "not an address"])).unwrap_err();
        assert!(matches!(err, RenderError::InvalidAddress { ref address, .. } if address == "not an address"));
        assert!(err.is_caller_error());
    }

    #[test]
    fn envelope_round_trips_through_rendering() {
        let raw = render(&sender(), &message(&["a@x.com", "b@y.org"])).unwrap();
        let envelope = envelope_of(&raw).unwrap();

        assert_eq!(
            envelope.from().map(ToString::to_string).as_deref(),
            Some("noreply@example.com")
        );
        let to: Vec<_> = envelope.to().iter().map(ToString::to_string).collect();
        assert_eq!(to, vec!["a@x.com", "b@y.org"]);
    }

    #[test]
    fn envelope_includes_cc() {
        let raw = b"From: a@x.com\r\nTo: b@x.com\r\nCc: Team: c@x.com, d@x.com;\r\n\r\nbody";
        let envelope = envelope_of(raw).unwrap();
        assert_eq!(envelope.to().len(), 3);
    }

    #[test]
    fn envelope_requires_sender_and_recipient() {
        assert!(matches!(
            envelope_of(b"To: b@x.com\r\n\r\nbody"),
            Err(EnvelopeError::MissingHeader("From"))
        ));
        assert!(matches!(
            envelope_of(b"From: a@x.com\r\n\r\nbody"),
            Err(EnvelopeError::MissingHeader("To"))
        ));
    }

    #[test]
    fn sender_identity_from_config() {
        let identity = SenderIdentity::try_from(&SenderConfig {
            address: " test@example.com ".into(),
            name: Some("  ".into()),
        })
        .unwrap();
        assert_eq!(identity.address.to_string(), "test@example.com");
        assert_eq!(identity.name, None);

        assert!(SenderIdentity::try_from(&SenderConfig {
            address: "broken".into(),
            name: None,
        })
        .is_err());
    }
}
