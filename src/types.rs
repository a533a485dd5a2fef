use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Configuration stored in ~/.donorsync/config.json
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Overrides the default `~/.donorsync/donorsync.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_path: Option<PathBuf>,
    /// Importer sleep between polls of an empty queue.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Surface records that already existed even when the message is not
    /// marked to be treated as history.
    #[serde(default)]
    pub keep_existing_records: bool,
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
}

fn default_poll_interval_ms() -> u64 {
    250
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AccountKind {
    /// IMAP mailbox.
    Generic,
    /// Gmail API mailbox.
    Vendor,
}

/// One configured mail account.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountConfig {
    pub id: String,
    pub kind: AccountKind,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub nickname: String,
    /// Key into the credential store (IMAP) or unused (Gmail).
    #[serde(default)]
    pub credentials_ref: String,
    /// Addresses whose messages are never imported.
    #[serde(default)]
    pub ignore_list: Vec<String>,
    /// The account owner's own addresses. Mail sent from these is recorded
    /// against the recipients.
    #[serde(default)]
    pub my_addresses: Vec<String>,
    #[serde(default)]
    pub treat_existing_as_history: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imap: Option<ImapSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gmail: Option<GmailSettings>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImapSettings {
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_imap_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default = "default_folder")]
    pub folder: String,
}

fn default_imap_port() -> u16 {
    993
}

fn default_folder() -> String {
    "INBOX".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GmailSettings {
    /// Label whose threads are imported.
    #[serde(default)]
    pub label: String,
    /// Mailbox view rescanned for later replies in labeled threads.
    #[serde(default = "default_broader_query")]
    pub broader_query: String,
    /// Token file written by the OAuth flow. Defaults to ~/.donorsync/google/token.json
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_path: Option<PathBuf>,
}

fn default_broader_query() -> String {
    "in:anywhere".to_string()
}

impl AccountConfig {
    /// IMAP settings with every required field present.
    pub fn imap_settings(&self) -> Result<&ImapSettings, ConfigError> {
        let settings = self.imap.as_ref().ok_or_else(|| self.missing("imap"))?;
        if settings.host.trim().is_empty() {
            return Err(self.missing("imap.host"));
        }
        if settings.username.trim().is_empty() {
            return Err(self.missing("imap.username"));
        }
        if self.credentials_ref.trim().is_empty() {
            return Err(self.missing("credentialsRef"));
        }
        Ok(settings)
    }

    /// Gmail settings with every required field present.
    pub fn gmail_settings(&self) -> Result<&GmailSettings, ConfigError> {
        let settings = self.gmail.as_ref().ok_or_else(|| self.missing("gmail"))?;
        if settings.label.trim().is_empty() {
            return Err(self.missing("gmail.label"));
        }
        Ok(settings)
    }

    fn missing(&self, setting: &'static str) -> ConfigError {
        ConfigError::MissingSetting {
            account: self.id.clone(),
            setting,
        }
    }
}

/// State directory (~/.donorsync)
pub fn state_dir() -> Result<PathBuf, ConfigError> {
    let home = dirs::home_dir().ok_or(ConfigError::HomeDirNotFound)?;
    Ok(home.join(".donorsync"))
}

/// Load configuration from ~/.donorsync/config.json
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&state_dir()?.join("config.json"))
}

pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }
    let content = fs::read_to_string(path)?;
    let config: Config = serde_json::from_str(&content)?;
    Ok(config)
}
