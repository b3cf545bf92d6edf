use mail_parser::{HeaderValue, PartType};
use thiserror::Error;

use crate::config::ForwardConfig;

#[derive(Error, Debug)]
pub enum EmailError {
    #[error("IMAP error: {0}")]
    ImapError(String),

    #[error("SMTP error: {0}")]
    SmtpError(String),

    #[error("TLS error: {0}")]
    TlsError(#[from] native_tls::Error),

    #[error("Parsing error: {0}")]
    ParsingError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Dispatch error: {0}")]
    DispatchError(String),
}

impl From<imap::Error> for EmailError {
    fn from(e: imap::Error) -> Self {
        EmailError::ImapError(e.to_string())
    }
}

/// Strips whitespace and the angle brackets IMAP envelopes keep around a
/// Message-ID, so ids from envelopes and parsed headers compare equal.
pub fn normalize_message_id(id: &str) -> String {
    id.trim()
        .trim_start_matches('<')
        .trim_end_matches('>')
        .trim()
        .to_string()
}

/// A message as listed in a folder: enough to find it again, not its content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRef {
    pub folder: String,
    pub uid: u32,
    pub message_id: Option<String>,
    pub flags: Vec<String>,
    pub size: Option<u32>,
}

impl MessageRef {
    /// Case-insensitive Message-ID comparison. A reference without an id
    /// matches nothing.
    pub fn matches(&self, message_id: &str) -> bool {
        match &self.message_id {
            Some(own) => own.eq_ignore_ascii_case(&normalize_message_id(message_id)),
            None => false,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.flags.iter().any(|f| f == "\\Deleted")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailAddress {
    pub name: Option<String>,
    pub address: String,
}

impl std::fmt::Display for EmailAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} <{}>", name, self.address),
            None => write!(f, "{}", self.address),
        }
    }
}

fn collect_addresses(value: &HeaderValue) -> Vec<EmailAddress> {
    fn push(out: &mut Vec<EmailAddress>, addr: &mail_parser::Addr) {
        let address = addr.address.as_ref().map(|s| s.to_string()).unwrap_or_default();
        if !address.is_empty() {
            out.push(EmailAddress {
                name: addr.name.as_ref().map(|s| s.to_string()),
                address,
            });
        }
    }

    let mut addresses = Vec::new();
    match value {
        HeaderValue::Address(addr) => push(&mut addresses, addr),
        HeaderValue::AddressList(list) => {
            for addr in list {
                push(&mut addresses, addr);
            }
        }
        HeaderValue::Group(group) => {
            for addr in &group.addresses {
                push(&mut addresses, addr);
            }
        }
        HeaderValue::GroupList(groups) => {
            for group in groups {
                for addr in &group.addresses {
                    push(&mut addresses, addr);
                }
            }
        }
        _ => {}
    }
    addresses
}

/// The MIME parts of a source message the relay cares about.
#[derive(Debug, Clone)]
pub struct ParsedEmail {
    pub message_id: Option<String>,
    pub subject: String,
    pub from: Vec<EmailAddress>,
    pub to: Vec<EmailAddress>,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    pub attachment_count: usize,
}

impl ParsedEmail {
    pub fn parse(raw: &[u8]) -> Result<Self, EmailError> {
        let parsed = mail_parser::Message::parse(raw)
            .ok_or_else(|| EmailError::ParsingError("malformed MIME message".to_string()))?;

        // Only genuine text/plain and text/html parts; mail-parser would
        // otherwise convert one into the other.
        let body_text = parsed.text_body.iter().find_map(|&id| match parsed.parts.get(id) {
            Some(part) => match &part.body {
                PartType::Text(text) => Some(text.to_string()),
                _ => None,
            },
            None => None,
        });
        let body_html = parsed.html_body.iter().find_map(|&id| match parsed.parts.get(id) {
            Some(part) => match &part.body {
                PartType::Html(html) => Some(html.to_string()),
                _ => None,
            },
            None => None,
        });

        Ok(Self {
            message_id: parsed.message_id().map(normalize_message_id),
            subject: parsed.subject().unwrap_or_default().to_string(),
            from: collect_addresses(parsed.from()),
            to: collect_addresses(parsed.to()),
            body_text,
            body_html,
            attachment_count: parsed.attachments.len(),
        })
    }

    pub fn from_display(&self) -> String {
        join_addresses(&self.from)
    }

    pub fn to_display(&self) -> String {
        join_addresses(&self.to)
    }
}

fn join_addresses(addresses: &[EmailAddress]) -> String {
    addresses
        .iter()
        .map(|a| a.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// The simplified copy sent on: fixed envelope, source subject, plain body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingEmail {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
}

impl OutgoingEmail {
    pub fn forward_of(parsed: &ParsedEmail, forward: &ForwardConfig) -> Self {
        Self {
            from: forward.from.clone(),
            to: forward.to.clone(),
            subject: parsed.subject.clone(),
            body: parsed.body_text.clone().unwrap_or_default(),
        }
    }
}
