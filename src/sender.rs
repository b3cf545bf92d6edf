use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{Message, SmtpTransport, Transport};
use log::debug;

use crate::config::{SmtpAccount, SmtpSecurity};
use crate::email::{EmailError, OutgoingEmail};

pub trait MailSender: Send + Sync {
    fn send(&self, email: &OutgoingEmail) -> Result<(), EmailError>;
}

fn parse_mailbox(address: &str) -> Result<Mailbox, EmailError> {
    address
        .parse::<Mailbox>()
        .map_err(|e| EmailError::ParsingError(format!("invalid address '{}': {}", address, e)))
}

/// Builds the plain-text message: no HTML alternative, no attachments.
pub fn build_message(email: &OutgoingEmail) -> Result<Message, EmailError> {
    Message::builder()
        .from(parse_mailbox(&email.from)?)
        .to(parse_mailbox(&email.to)?)
        .subject(email.subject.as_str())
        .header(ContentType::TEXT_PLAIN)
        .body(email.body.clone())
        .map_err(|e| EmailError::SmtpError(e.to_string()))
}

#[derive(Clone)]
pub struct SmtpSender {
    mailer: SmtpTransport,
}

impl SmtpSender {
    pub fn new(account: &SmtpAccount, password: String) -> Result<Self, EmailError> {
        let creds = Credentials::new(account.username.clone(), password);

        let builder = SmtpTransport::relay(&account.server)
            .map_err(|e| EmailError::SmtpError(e.to_string()))?
            .credentials(creds)
            .port(account.port);

        let mailer = match account.security {
            SmtpSecurity::SSL => {
                let tls_params = TlsParameters::new(account.server.clone())
                    .map_err(|e| EmailError::SmtpError(e.to_string()))?;
                builder.tls(Tls::Wrapper(tls_params)).build()
            }
            SmtpSecurity::StartTLS => {
                let tls_params = TlsParameters::new(account.server.clone())
                    .map_err(|e| EmailError::SmtpError(e.to_string()))?;
                builder.tls(Tls::Required(tls_params)).build()
            }
            SmtpSecurity::None => builder.tls(Tls::None).build(),
        };

        Ok(Self { mailer })
    }
}

impl MailSender for SmtpSender {
    fn send(&self, email: &OutgoingEmail) -> Result<(), EmailError> {
        let message = build_message(email)?;

        debug!("Sending '{}' from {} to {}", email.subject, email.from, email.to);
        self.mailer
            .send(&message)
            .map_err(|e| EmailError::SmtpError(e.to_string()))?;

        Ok(())
    }
}
