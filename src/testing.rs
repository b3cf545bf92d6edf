//! In-memory mail store and recording sender used by the unit tests.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::email::{EmailError, MessageRef, OutgoingEmail, ParsedEmail};
use crate::sender::MailSender;
use crate::store::{AccessMode, FolderSession, MailStore};

pub fn raw_message(message_id: &str, subject: &str, body: &str) -> Vec<u8> {
    format!(
        "From: Sender <sender@example.com>\r\n\
To: relay@example.com\r\n\
Subject: {}\r\n\
Message-ID: <{}>\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
{}\r\n",
        subject, message_id, body
    )
    .into_bytes()
}

#[derive(Clone)]
struct StoredMessage {
    uid: u32,
    raw: Vec<u8>,
    message_id: Option<String>,
    flags: Vec<String>,
}

#[derive(Default)]
struct Inner {
    folders: BTreeMap<String, Vec<StoredMessage>>,
    next_uid: u32,
    offline: bool,
    fail_append: bool,
    fail_close: bool,
    open_sessions: usize,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let store = Self::default();
        store.create_folder("INBOX");
        store
    }

    pub fn create_folder(&self, name: &str) {
        self.inner.lock().unwrap().folders.entry(name.to_string()).or_default();
    }

    pub fn has_folder(&self, name: &str) -> bool {
        self.inner.lock().unwrap().folders.contains_key(name)
    }

    pub fn deliver(&self, folder: &str, raw: &[u8]) -> u32 {
        let mut inner = self.inner.lock().unwrap();
        inner.next_uid += 1;
        let uid = inner.next_uid;
        let message_id = ParsedEmail::parse(raw).ok().and_then(|p| p.message_id);
        inner.folders.entry(folder.to_string()).or_default().push(StoredMessage {
            uid,
            raw: raw.to_vec(),
            message_id,
            flags: Vec::new(),
        });
        uid
    }

    pub fn message_ref(&self, folder: &str, uid: u32) -> MessageRef {
        let inner = self.inner.lock().unwrap();
        let message = inner.folders[folder]
            .iter()
            .find(|m| m.uid == uid)
            .expect("no such message");
        to_ref(folder, message)
    }

    pub fn uids(&self, folder: &str) -> Vec<u32> {
        let inner = self.inner.lock().unwrap();
        inner
            .folders
            .get(folder)
            .map(|messages| messages.iter().map(|m| m.uid).collect())
            .unwrap_or_default()
    }

    pub fn is_deleted(&self, folder: &str, uid: u32) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.folders[folder]
            .iter()
            .any(|m| m.uid == uid && m.flags.iter().any(|f| f == "\\Deleted"))
    }

    pub fn set_flag(&self, folder: &str, uid: u32, flag: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(message) = inner
            .folders
            .get_mut(folder)
            .and_then(|messages| messages.iter_mut().find(|m| m.uid == uid))
        {
            message.flags.push(flag.to_string());
        }
    }

    pub fn remove(&self, folder: &str, uid: u32) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(messages) = inner.folders.get_mut(folder) {
            messages.retain(|m| m.uid != uid);
        }
    }

    pub fn set_offline(&self, offline: bool) {
        self.inner.lock().unwrap().offline = offline;
    }

    pub fn set_fail_append(&self, fail: bool) {
        self.inner.lock().unwrap().fail_append = fail;
    }

    pub fn set_fail_close(&self, fail: bool) {
        self.inner.lock().unwrap().fail_close = fail;
    }

    pub fn is_seen(&self, folder: &str, uid: u32) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.folders[folder]
            .iter()
            .any(|m| m.uid == uid && m.flags.iter().any(|f| f == "\\Seen"))
    }

    pub fn open_sessions(&self) -> usize {
        self.inner.lock().unwrap().open_sessions
    }
}

fn to_ref(folder: &str, message: &StoredMessage) -> MessageRef {
    MessageRef {
        folder: folder.to_string(),
        uid: message.uid,
        message_id: message.message_id.clone(),
        flags: message.flags.clone(),
        size: Some(message.raw.len() as u32),
    }
}

impl MailStore for MemoryStore {
    fn open(&self, folder: &str, mode: AccessMode) -> Result<Box<dyn FolderSession>, EmailError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.offline {
            return Err(EmailError::ImapError("connection refused".to_string()));
        }
        if !inner.folders.contains_key(folder) {
            return Err(EmailError::ImapError(format!("no such folder {}", folder)));
        }
        inner.open_sessions += 1;

        Ok(Box::new(MemorySession {
            inner: Arc::clone(&self.inner),
            folder: folder.to_string(),
            mode,
        }))
    }
}

struct MemorySession {
    inner: Arc<Mutex<Inner>>,
    folder: String,
    mode: AccessMode,
}

impl MemorySession {
    fn check_online(&self) -> Result<(), EmailError> {
        if self.inner.lock().unwrap().offline {
            return Err(EmailError::ImapError("connection reset".to_string()));
        }
        Ok(())
    }
}

impl FolderSession for MemorySession {
    fn search(&mut self, query: &str) -> Result<Vec<u32>, EmailError> {
        self.check_online()?;
        let inner = self.inner.lock().unwrap();
        let mut uids = Vec::new();
        for message in &inner.folders[&self.folder] {
            let has = |flag: &str| message.flags.iter().any(|f| f == flag);
            let mut keep = true;
            for token in query.split_whitespace() {
                keep &= match token.to_uppercase().as_str() {
                    "ALL" => true,
                    "UNSEEN" => !has("\\Seen"),
                    "SEEN" => has("\\Seen"),
                    "UNDELETED" => !has("\\Deleted"),
                    "DELETED" => has("\\Deleted"),
                    other => {
                        return Err(EmailError::ImapError(format!("BAD search key {}", other)))
                    }
                };
            }
            if keep {
                uids.push(message.uid);
            }
        }
        Ok(uids)
    }

    fn fetch_refs(&mut self, uids: Option<&[u32]>) -> Result<Vec<MessageRef>, EmailError> {
        self.check_online()?;
        let inner = self.inner.lock().unwrap();
        Ok(inner.folders[&self.folder]
            .iter()
            .filter(|m| uids.map_or(true, |uids| uids.contains(&m.uid)))
            .map(|m| to_ref(&self.folder, m))
            .collect())
    }

    fn fetch_raw(&mut self, uid: u32) -> Result<Vec<u8>, EmailError> {
        self.check_online()?;
        let inner = self.inner.lock().unwrap();
        inner.folders[&self.folder]
            .iter()
            .find(|m| m.uid == uid)
            .map(|m| m.raw.clone())
            .ok_or_else(|| EmailError::ImapError(format!("no message {}", uid)))
    }

    fn folder_exists(&mut self, folder: &str) -> Result<bool, EmailError> {
        self.check_online()?;
        Ok(self.inner.lock().unwrap().folders.contains_key(folder))
    }

    fn append(&mut self, folder: &str, raw: &[u8]) -> Result<(), EmailError> {
        self.check_online()?;
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_append {
            return Err(EmailError::ImapError("APPEND failed: quota exceeded".to_string()));
        }
        if !inner.folders.contains_key(folder) {
            return Err(EmailError::ImapError(format!("[TRYCREATE] no folder {}", folder)));
        }
        inner.next_uid += 1;
        let uid = inner.next_uid;
        let message_id = ParsedEmail::parse(raw).ok().and_then(|p| p.message_id);
        if let Some(messages) = inner.folders.get_mut(folder) {
            messages.push(StoredMessage {
                uid,
                raw: raw.to_vec(),
                message_id,
                flags: Vec::new(),
            });
        }
        Ok(())
    }

    fn flag_deleted(&mut self, uid: u32) -> Result<(), EmailError> {
        self.check_online()?;
        if self.mode == AccessMode::ReadOnly {
            return Err(EmailError::ImapError("folder is read-only".to_string()));
        }
        let mut inner = self.inner.lock().unwrap();
        let folder = inner.folders.get_mut(&self.folder);
        match folder.and_then(|messages| messages.iter_mut().find(|m| m.uid == uid)) {
            Some(message) => {
                message.flags.push("\\Deleted".to_string());
                Ok(())
            }
            None => Err(EmailError::ImapError(format!("no message {}", uid))),
        }
    }

    fn mark_seen(&mut self, uid: u32) -> Result<(), EmailError> {
        self.check_online()?;
        if self.mode == AccessMode::ReadOnly {
            return Err(EmailError::ImapError("folder is read-only".to_string()));
        }
        let mut inner = self.inner.lock().unwrap();
        let folder = inner.folders.get_mut(&self.folder);
        match folder.and_then(|messages| messages.iter_mut().find(|m| m.uid == uid)) {
            Some(message) => {
                if !message.flags.iter().any(|f| f == "\\Seen") {
                    message.flags.push("\\Seen".to_string());
                }
                Ok(())
            }
            None => Err(EmailError::ImapError(format!("no message {}", uid))),
        }
    }

    fn close(self: Box<Self>, expunge: bool) -> Result<(), EmailError> {
        let mut inner = self.inner.lock().unwrap();
        inner.open_sessions -= 1;
        if inner.fail_close {
            return Err(EmailError::ImapError("connection dropped during CLOSE".to_string()));
        }
        if expunge && self.mode == AccessMode::ReadWrite {
            if let Some(messages) = inner.folders.get_mut(&self.folder) {
                messages.retain(|m| !m.flags.iter().any(|f| f == "\\Deleted"));
            }
        }
        Ok(())
    }
}

enum SendMode {
    Accept,
    Reject,
    RejectSubject(String),
    Panic,
}

pub struct RecordingSender {
    mode: SendMode,
    delay: Option<Duration>,
    sent: Mutex<Vec<OutgoingEmail>>,
}

impl RecordingSender {
    fn with_mode(mode: SendMode) -> Self {
        Self {
            mode,
            delay: None,
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn new() -> Self {
        Self::with_mode(SendMode::Accept)
    }

    pub fn failing() -> Self {
        Self::with_mode(SendMode::Reject)
    }

    pub fn failing_for(subject: &str) -> Self {
        Self::with_mode(SendMode::RejectSubject(subject.to_string()))
    }

    pub fn panicking() -> Self {
        Self::with_mode(SendMode::Panic)
    }

    /// Accepts every message after holding the send for `delay`.
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::new()
        }
    }

    pub fn sent(&self) -> Vec<OutgoingEmail> {
        self.sent.lock().unwrap().clone()
    }
}

impl MailSender for RecordingSender {
    fn send(&self, email: &OutgoingEmail) -> Result<(), EmailError> {
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }
        match &self.mode {
            SendMode::Accept => {}
            SendMode::Reject => {
                return Err(EmailError::SmtpError("554 transaction failed".to_string()))
            }
            SendMode::RejectSubject(subject) if *subject == email.subject => {
                return Err(EmailError::SmtpError("554 transaction failed".to_string()))
            }
            SendMode::RejectSubject(_) => {}
            SendMode::Panic => panic!("sender exploded"),
        }
        self.sent.lock().unwrap().push(email.clone());
        Ok(())
    }
}
