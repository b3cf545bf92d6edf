use std::sync::Arc;

use log::{debug, info, warn};

use crate::config::ForwardConfig;
use crate::email::{EmailError, MessageRef, OutgoingEmail, ParsedEmail};
use crate::sender::MailSender;
use crate::store::{AccessMode, FolderSession, MailStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotFound,
    AlreadyDeleted,
    IdMismatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Forwarded { archived: bool },
    Skipped(SkipReason),
}

/// Forwards one message: send the simplified copy, archive, flag deleted.
pub struct Forwarder {
    store: Arc<dyn MailStore>,
    sender: Arc<dyn MailSender>,
    config: ForwardConfig,
}

impl Forwarder {
    pub fn new(store: Arc<dyn MailStore>, sender: Arc<dyn MailSender>, config: ForwardConfig) -> Self {
        Self {
            store,
            sender,
            config,
        }
    }

    pub fn handle(&self, message: &MessageRef) -> Result<Outcome, EmailError> {
        let mut folder = self.store.open(&message.folder, AccessMode::ReadWrite)?;

        let result = self.process(folder.as_mut(), message);

        // The folder is closed with expunge on every path; only messages
        // flagged by a completed forward are removed.
        match (result, folder.close(true)) {
            (Ok(outcome), Ok(())) => Ok(outcome),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(close_err)) => {
                warn!("Closing {} after failure also failed: {}", message.folder, close_err);
                Err(e)
            }
        }
    }

    /// Works on the listed UID only. Other messages sharing its Message-ID
    /// belong to their own jobs.
    fn process(&self, folder: &mut dyn FolderSession, message: &MessageRef) -> Result<Outcome, EmailError> {
        let listing = folder.fetch_refs(None)?;

        let Some(target) = listing.into_iter().find(|m| m.uid == message.uid) else {
            debug!("Message uid={} is no longer in {}, skipping", message.uid, message.folder);
            return Ok(Outcome::Skipped(SkipReason::NotFound));
        };

        if let Some(message_id) = message.message_id.as_deref() {
            if !target.matches(message_id) {
                debug!(
                    "Message uid={} now carries {:?}, expected {}, skipping",
                    target.uid, target.message_id, message_id
                );
                return Ok(Outcome::Skipped(SkipReason::IdMismatch));
            }
        }

        if target.is_deleted() {
            debug!("Message uid={} is already flagged deleted, skipping", target.uid);
            return Ok(Outcome::Skipped(SkipReason::AlreadyDeleted));
        }

        let archived = self.forward_one(folder, &target)?;
        Ok(Outcome::Forwarded { archived })
    }

    /// Returns whether an archive copy was made.
    fn forward_one(&self, folder: &mut dyn FolderSession, target: &MessageRef) -> Result<bool, EmailError> {
        let raw = folder.fetch_raw(target.uid)?;
        let parsed = match ParsedEmail::parse(&raw) {
            Ok(parsed) => parsed,
            Err(e) => {
                // A malformed message never parses; take it out of the
                // unseen window instead of retrying it every cycle.
                warn!("Message uid={} cannot be parsed, marking seen: {}", target.uid, e);
                folder.mark_seen(target.uid)?;
                return Err(e);
            }
        };

        debug!(
            "From: {} to: {} | Subject: {}",
            parsed.from_display(),
            parsed.to_display(),
            parsed.subject
        );
        debug!("Mail content: {}", parsed.body_text.as_deref().unwrap_or_default());
        debug!("Mail html: {}", parsed.body_html.as_deref().unwrap_or_default());
        if parsed.attachment_count > 0 {
            debug!("Dropping {} attachment(s)", parsed.attachment_count);
        }

        let outgoing = OutgoingEmail::forward_of(&parsed, &self.config);
        self.sender.send(&outgoing)?;

        let archived = self.archive(folder, &raw)?;
        folder.flag_deleted(target.uid)?;

        info!(
            "Forwarded '{}' (uid={}) to {}{}",
            parsed.subject,
            target.uid,
            outgoing.to,
            if archived { ", archived" } else { "" }
        );
        Ok(archived)
    }

    fn archive(&self, folder: &mut dyn FolderSession, raw: &[u8]) -> Result<bool, EmailError> {
        let archive_folder = &self.config.archive_folder;
        if !folder.folder_exists(archive_folder)? {
            debug!("Archive folder '{}' does not exist, not archiving", archive_folder);
            return Ok(false);
        }

        folder.append(archive_folder, raw)?;
        Ok(true)
    }
}
