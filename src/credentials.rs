use anyhow::{Context, Result};
use keyring::{Entry, Error as KeyringError};

/// Password lookup in the system keyring, used when the config file
/// leaves a password empty.
#[derive(Clone, Debug)]
pub struct CredentialManager {
    app_name: String,
}

impl Default for CredentialManager {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialManager {
    pub fn new() -> Self {
        Self {
            app_name: "mail-relay".to_string(),
        }
    }

    fn service(&self, password_type: &str) -> String {
        format!("{}-{}", self.app_name, password_type)
    }

    /// Store a password securely in the system keyring
    pub fn store_password(&self, account_id: &str, password_type: &str, password: &str) -> Result<()> {
        let entry = Entry::new(&self.service(password_type), account_id)
            .context("Failed to create keyring entry")?;

        entry
            .set_password(password)
            .context("Failed to store password in keyring")?;

        log::debug!("Password stored for {} ({})", account_id, password_type);
        Ok(())
    }

    /// Retrieve a password from the system keyring
    pub fn get_password(&self, account_id: &str, password_type: &str) -> Result<Option<String>> {
        let entry = Entry::new(&self.service(password_type), account_id)
            .context("Failed to create keyring entry")?;

        match entry.get_password() {
            Ok(password) => Ok(Some(password)),
            Err(KeyringError::NoEntry) => Ok(None),
            Err(e) => Err(anyhow::anyhow!("Failed to retrieve password: {}", e)),
        }
    }

    /// Delete a password from the system keyring
    pub fn delete_password(&self, account_id: &str, password_type: &str) -> Result<()> {
        let entry = Entry::new(&self.service(password_type), account_id)
            .context("Failed to create keyring entry")?;

        match entry.delete_password() {
            Ok(()) => {
                log::debug!("Password deleted for {} ({})", account_id, password_type);
                Ok(())
            }
            Err(KeyringError::NoEntry) => Ok(()),
            Err(e) => Err(anyhow::anyhow!("Failed to delete password: {}", e)),
        }
    }
}
