//! Error types for the import pipeline.
//!
//! Errors are classified by how far they are allowed to reach:
//! - Connect errors end one account's run and nothing else
//! - Fetch errors skip one message
//! - Import errors skip one message or mark one record as errored
//! - Config errors keep an account from starting at all

use std::path::PathBuf;
use thiserror::Error;

use crate::db::DbError;

/// Failure to open a mail account. The account stays disconnected.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Mailbox is in use by another session: {0}")]
    ResourceBusy(String),

    #[error("Password entry cancelled")]
    Cancelled,

    #[error("Account misconfigured: {0}")]
    Config(String),
}

impl ConnectError {
    /// Returns true if the user has to act before a retry can succeed.
    pub fn requires_user_action(&self) -> bool {
        matches!(
            self,
            ConnectError::AuthFailed(_) | ConnectError::Cancelled | ConnectError::Config(_)
        )
    }

    pub fn recovery_suggestion(&self) -> &'static str {
        match self {
            ConnectError::AuthFailed(_) => "Check the account password or re-authorize access.",
            ConnectError::Network(_) => "Check your internet connection and try again.",
            ConnectError::ResourceBusy(_) => "Close other sessions on this mailbox and try again.",
            ConnectError::Cancelled => "Start the import again and enter the password.",
            ConnectError::Config(_) => "Review the account settings.",
        }
    }
}

/// Failure while listing or fetching messages. Non-fatal per message.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Message index {position} out of range (total {total})")]
    IndexOutOfRange { position: usize, total: usize },

    #[error("Account is not connected")]
    NotConnected,

    #[error("Network error: {0}")]
    Network(String),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Access token expired or revoked")]
    AuthExpired,

    #[error("Could not parse message {id}: {reason}")]
    Parse { id: String, reason: String },
}

impl FetchError {
    /// Returns true if the same request may succeed when repeated.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Network(_) => true,
            FetchError::Api { status, .. } => *status == 429 || *status == 408 || *status >= 500,
            _ => false,
        }
    }
}

/// Failure while turning one message into records.
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("Record is missing {0}; identity key incomplete")]
    InvalidIdentityKey(&'static str),

    #[error("Database error: {0}")]
    Db(#[from] DbError),

    #[error("Conversion failed: {0}")]
    Conversion(String),
}

/// Failure loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Home directory not found")]
    HomeDirNotFound,

    #[error("Config file not found at {0}")]
    NotFound(PathBuf),

    #[error("Failed to read config: {0}")]
    Read(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Account '{account}' is missing required setting '{setting}'")]
    MissingSetting { account: String, setting: &'static str },
}

/// Failure editing a stored history record.
#[derive(Debug, Error)]
pub enum EditError {
    #[error("History record {0} not found")]
    NotFound(i64),

    #[error("Database error: {0}")]
    Db(#[from] DbError),
}

/// Failure to start a pipeline worker.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Account '{0}' is already importing")]
    AlreadyRunning(String),

    #[error("Failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_error_classification() {
        assert!(ConnectError::AuthFailed("bad password".into()).requires_user_action());
        assert!(ConnectError::Cancelled.requires_user_action());
        assert!(!ConnectError::Network("timeout".into()).requires_user_action());
        assert!(!ConnectError::ResourceBusy("INUSE".into()).requires_user_action());
    }

    #[test]
    fn test_fetch_error_retryable() {
        assert!(FetchError::Network("reset".into()).is_retryable());
        assert!(FetchError::Api { status: 503, message: String::new() }.is_retryable());
        assert!(FetchError::Api { status: 429, message: String::new() }.is_retryable());
        assert!(!FetchError::Api { status: 404, message: String::new() }.is_retryable());
        assert!(!FetchError::IndexOutOfRange { position: 3, total: 3 }.is_retryable());
    }

    #[test]
    fn test_missing_setting_message_names_account() {
        let err = ConfigError::MissingSetting {
            account: "work-imap".into(),
            setting: "imap.host",
        };
        assert_eq!(
            err.to_string(),
            "Account 'work-imap' is missing required setting 'imap.host'"
        );
    }
}
