pub mod config;
pub mod credentials;
pub mod dispatch;
pub mod email;
pub mod forwarder;
pub mod imap_store;
pub mod poller;
pub mod sender;
pub mod store;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use config::{Config, ConfigError};
pub use dispatch::WorkerPool;
pub use email::{EmailError, MessageRef, OutgoingEmail, ParsedEmail};
pub use forwarder::{Forwarder, Outcome};
pub use imap_store::ImapStore;
pub use poller::{CycleReport, Poller};
pub use sender::{MailSender, SmtpSender};
pub use store::{AccessMode, FolderSession, MailStore};
