use std::io::{Read, Write};
use std::net::TcpStream;

use imap::{Client, Session};
use log::{debug, info, warn};
use native_tls::TlsConnector;
use utf7_imap::encode_utf7_imap as encode_utf7;

use crate::config::{ImapAccount, ImapSecurity};
use crate::email::{normalize_message_id, EmailError, MessageRef};
use crate::store::{AccessMode, FolderSession, MailStore};

const REF_QUERY: &str = "(UID FLAGS RFC822.SIZE ENVELOPE)";
const RAW_QUERY: &str = "(UID BODY.PEEK[])";

/// IMAP-backed store. Every `open` is a fresh connection and login.
#[derive(Clone)]
pub struct ImapStore {
    account: ImapAccount,
    password: String,
}

impl ImapStore {
    pub fn new(account: ImapAccount, password: String) -> Self {
        info!("IMAP connection url: {}", account.store_url("INBOX"));
        Self { account, password }
    }

    fn login<T: Read + Write + 'static>(
        &self,
        client: Client<T>,
        folder: &str,
        mode: AccessMode,
    ) -> Result<Box<dyn FolderSession>, EmailError> {
        let mut session = client
            .login(&self.account.username, &self.password)
            .map_err(|e| EmailError::ImapError(e.0.to_string()))?;

        let encoded = encode_utf7(folder.to_string());
        let opened = match mode {
            AccessMode::ReadOnly => session.examine(&encoded),
            AccessMode::ReadWrite => session.select(&encoded),
        };

        let mailbox = match opened {
            Ok(mailbox) => mailbox,
            Err(e) => {
                let _ = session.logout();
                return Err(EmailError::ImapError(format!(
                    "cannot open folder {}: {}",
                    folder, e
                )));
            }
        };

        debug!(
            "Opened folder '{}' ({:?}): {} messages",
            folder, mode, mailbox.exists
        );

        Ok(Box::new(ImapFolder {
            session,
            folder: folder.to_string(),
            mode,
            exists: mailbox.exists,
        }))
    }
}

impl MailStore for ImapStore {
    fn open(&self, folder: &str, mode: AccessMode) -> Result<Box<dyn FolderSession>, EmailError> {
        let domain = self.account.server.as_str();
        let port = self.account.port;

        match self.account.security {
            ImapSecurity::SSL => {
                let tls = TlsConnector::builder().build()?;
                let client = imap::connect((domain, port), domain, &tls)?;
                self.login(client, folder, mode)
            }
            ImapSecurity::StartTLS => {
                let tls = TlsConnector::builder().build()?;
                let client = imap::connect_starttls((domain, port), domain, &tls)?;
                self.login(client, folder, mode)
            }
            ImapSecurity::None => {
                let tcp_stream = TcpStream::connect((domain, port))?;
                let mut client = Client::new(tcp_stream);
                client.read_greeting()?;
                self.login(client, folder, mode)
            }
        }
    }
}

struct ImapFolder<T: Read + Write> {
    session: Session<T>,
    folder: String,
    mode: AccessMode,
    exists: u32,
}

impl<T: Read + Write> ImapFolder<T> {
    fn to_ref(&self, fetch: &imap::types::Fetch) -> Option<MessageRef> {
        let uid = fetch.uid?;
        let message_id = fetch
            .envelope()
            .and_then(|envelope| envelope.message_id)
            .map(|id| normalize_message_id(&String::from_utf8_lossy(id)))
            .filter(|id| !id.is_empty());

        Some(MessageRef {
            folder: self.folder.clone(),
            uid,
            message_id,
            flags: fetch.flags().iter().map(|f| f.to_string()).collect(),
            size: fetch.size,
        })
    }
}

impl<T: Read + Write> FolderSession for ImapFolder<T> {
    fn search(&mut self, query: &str) -> Result<Vec<u32>, EmailError> {
        let mut uids: Vec<u32> = self.session.uid_search(query)?.into_iter().collect();
        uids.sort_unstable();
        Ok(uids)
    }

    fn fetch_refs(&mut self, uids: Option<&[u32]>) -> Result<Vec<MessageRef>, EmailError> {
        let sequence = match uids {
            Some([]) => return Ok(Vec::new()),
            Some(uids) => uids
                .iter()
                .map(|uid| uid.to_string())
                .collect::<Vec<_>>()
                .join(","),
            None if self.exists == 0 => return Ok(Vec::new()),
            None => "1:*".to_string(),
        };

        let fetches = self.session.uid_fetch(&sequence, REF_QUERY)?;
        let refs = fetches.iter().filter_map(|f| self.to_ref(f)).collect();
        Ok(refs)
    }

    fn fetch_raw(&mut self, uid: u32) -> Result<Vec<u8>, EmailError> {
        let fetches = self.session.uid_fetch(uid.to_string(), RAW_QUERY)?;
        fetches
            .iter()
            .find_map(|f| f.body().map(|body| body.to_vec()))
            .ok_or_else(|| {
                EmailError::ImapError(format!("message {} in {} has no body", uid, self.folder))
            })
    }

    fn folder_exists(&mut self, folder: &str) -> Result<bool, EmailError> {
        let encoded = encode_utf7(folder.to_string());
        let names = self.session.list(None, Some(encoded.as_str()))?;
        Ok(!names.is_empty())
    }

    fn append(&mut self, folder: &str, raw: &[u8]) -> Result<(), EmailError> {
        let encoded = encode_utf7(folder.to_string());
        self.session.append(&encoded, raw)?;
        Ok(())
    }

    fn flag_deleted(&mut self, uid: u32) -> Result<(), EmailError> {
        if self.mode == AccessMode::ReadOnly {
            return Err(EmailError::ImapError(format!(
                "folder {} is open read-only",
                self.folder
            )));
        }
        self.session
            .uid_store(uid.to_string(), "+FLAGS.SILENT (\\Deleted)")?;
        Ok(())
    }

    fn mark_seen(&mut self, uid: u32) -> Result<(), EmailError> {
        if self.mode == AccessMode::ReadOnly {
            return Err(EmailError::ImapError(format!(
                "folder {} is open read-only",
                self.folder
            )));
        }
        self.session.uid_store(uid.to_string(), "+FLAGS.SILENT (\\Seen)")?;
        Ok(())
    }

    fn close(mut self: Box<Self>, expunge: bool) -> Result<(), EmailError> {
        // CLOSE expunges a read-write folder; LOGOUT alone never does.
        if expunge && self.mode == AccessMode::ReadWrite {
            self.session.close()?;
        }
        if let Err(e) = self.session.logout() {
            warn!("IMAP logout from {} failed: {}", self.folder, e);
        }
        Ok(())
    }
}
