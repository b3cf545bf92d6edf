//! Folder-level access to a mail store.
//!
//! A [`FolderSession`] is one open folder on one connection. It is opened
//! for a single unit of work (a poll listing or a forward) and closed at
//! the end of it, never shared between threads.

use crate::email::{EmailError, MessageRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

pub trait MailStore: Send + Sync {
    fn open(&self, folder: &str, mode: AccessMode) -> Result<Box<dyn FolderSession>, EmailError>;
}

pub trait FolderSession {
    /// UIDs matching an IMAP search query, lowest first.
    fn search(&mut self, query: &str) -> Result<Vec<u32>, EmailError>;

    /// Envelope, flags and size for the given UIDs, or for the whole folder
    /// when `uids` is `None`.
    fn fetch_refs(&mut self, uids: Option<&[u32]>) -> Result<Vec<MessageRef>, EmailError>;

    /// Full RFC 822 bytes of one message, without setting `\Seen`.
    fn fetch_raw(&mut self, uid: u32) -> Result<Vec<u8>, EmailError>;

    fn folder_exists(&mut self, folder: &str) -> Result<bool, EmailError>;

    fn append(&mut self, folder: &str, raw: &[u8]) -> Result<(), EmailError>;

    fn flag_deleted(&mut self, uid: u32) -> Result<(), EmailError>;

    /// Sets `\Seen` so the message drops out of an `UNSEEN` search.
    fn mark_seen(&mut self, uid: u32) -> Result<(), EmailError>;

    /// Closes the folder, expunging deleted messages when `expunge` is set.
    fn close(self: Box<Self>, expunge: bool) -> Result<(), EmailError>;
}
