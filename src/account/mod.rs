//! Mail accounts and their fetch loops.
//!
//! An [`Account`] is one of two variants sharing the same bookkeeping
//! ([`AccountCore`]: profile, connection state, cursor, stop flag). The
//! variant decides where messages come from; everything else is shared.
//!
//! State machine: `Disconnected -> Connecting -> Connected -> Fetching`.
//! A failed connect always lands back in `Disconnected`.

pub mod gmail;
pub mod imap;

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;

use crate::error::{ConfigError, ConnectError, FetchError};
use crate::message::{normalize_email, NormalizedMessage};
use crate::notify::{Observers, PipelineEvent};
use crate::queue::MessageQueue;
use crate::types::{AccountConfig, AccountKind};
use crate::worker::StopToken;

use self::gmail::{GmailSource, HttpGmailApi};
use self::imap::{CredentialPrompt, CredentialStore, ImapSource};

/// Per-message facts the source needs from its account.
#[derive(Debug, Clone)]
pub struct MessageContext {
    pub source_id: String,
    pub treat_existing_as_history: bool,
}

/// Capability interface of a remote mailbox.
pub trait MailSource: Send {
    /// Open the mailbox. Must leave nothing half-open on failure.
    fn connect(&mut self) -> Result<(), ConnectError>;

    /// Snapshot the mailbox listing. Returns the number of messages.
    fn load_message_list(&mut self) -> Result<usize, FetchError>;

    /// Fetch the message at `position` of the current listing.
    fn fetch(&mut self, position: usize, ctx: &MessageContext) -> Result<NormalizedMessage, FetchError>;

    fn disconnect(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Fetching,
}

/// The configured identity of an account, shared with the importer.
#[derive(Debug, Clone, Default)]
pub struct AccountProfile {
    pub id: String,
    pub nickname: String,
    pub enabled: bool,
    pub credentials_ref: String,
    pub ignore_list: HashSet<String>,
    pub my_addresses: HashSet<String>,
    pub treat_existing_as_history: bool,
}

impl AccountProfile {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            enabled: true,
            ..Default::default()
        }
    }

    pub fn from_config(config: &AccountConfig) -> Self {
        Self {
            id: config.id.clone(),
            nickname: config.nickname.clone(),
            enabled: config.enabled,
            credentials_ref: config.credentials_ref.clone(),
            ignore_list: config.ignore_list.iter().map(|a| normalize_email(a)).collect(),
            my_addresses: config.my_addresses.iter().map(|a| normalize_email(a)).collect(),
            treat_existing_as_history: config.treat_existing_as_history,
        }
    }

    pub fn with_my_addresses(mut self, addresses: &[&str]) -> Self {
        self.my_addresses = addresses.iter().map(|a| normalize_email(a)).collect();
        self
    }

    pub fn with_ignore_list(mut self, addresses: &[&str]) -> Self {
        self.ignore_list = addresses.iter().map(|a| normalize_email(a)).collect();
        self
    }

    pub fn is_ignored(&self, address: &str) -> bool {
        self.ignore_list.contains(&normalize_email(address))
    }

    pub fn is_mine(&self, address: &str) -> bool {
        self.my_addresses.contains(&normalize_email(address))
    }

    /// Name for log lines and UI.
    pub fn display_name(&self) -> &str {
        if self.nickname.is_empty() {
            &self.id
        } else {
            &self.nickname
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageCursor {
    pub position: usize,
    pub total: usize,
}

/// Bookkeeping shared by both account variants.
pub struct AccountCore {
    profile: AccountProfile,
    state: ConnectionState,
    cursor: MessageCursor,
    stop: StopToken,
}

impl AccountCore {
    fn new(profile: AccountProfile) -> Self {
        Self {
            profile,
            state: ConnectionState::Disconnected,
            cursor: MessageCursor::default(),
            stop: StopToken::new(),
        }
    }

    fn is_open(&self) -> bool {
        matches!(self.state, ConnectionState::Connected | ConnectionState::Fetching)
    }

    fn context(&self) -> MessageContext {
        MessageContext {
            source_id: self.profile.id.clone(),
            treat_existing_as_history: self.profile.treat_existing_as_history,
        }
    }
}

/// IMAP-backed account.
pub struct GenericMailAccount {
    core: AccountCore,
    source: Box<dyn MailSource>,
}

/// Gmail-backed account.
pub struct VendorMailAccount {
    core: AccountCore,
    source: GmailSource,
}

pub enum Account {
    Generic(GenericMailAccount),
    Vendor(VendorMailAccount),
}

/// Counts from one fetch loop run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchReport {
    pub fetched: u64,
    pub failed: u64,
}

impl Account {
    pub fn generic(profile: AccountProfile, source: Box<dyn MailSource>) -> Self {
        Account::Generic(GenericMailAccount {
            core: AccountCore::new(profile),
            source,
        })
    }

    pub fn vendor(profile: AccountProfile, source: GmailSource) -> Self {
        Account::Vendor(VendorMailAccount {
            core: AccountCore::new(profile),
            source,
        })
    }

    /// Build an account from configuration. Missing required settings are
    /// the only failure here.
    pub fn from_config(
        config: &AccountConfig,
        credentials: Arc<dyn CredentialStore>,
        prompt: Arc<dyn CredentialPrompt>,
    ) -> Result<Self, ConfigError> {
        let profile = AccountProfile::from_config(config);
        match config.kind {
            AccountKind::Generic => {
                let settings = config.imap_settings()?.clone();
                let source = ImapSource::new(
                    config.id.clone(),
                    settings,
                    config.credentials_ref.clone(),
                    credentials,
                    prompt,
                );
                Ok(Account::generic(profile, Box::new(source)))
            }
            AccountKind::Vendor => {
                let settings = config.gmail_settings()?.clone();
                let token_path = match settings.token_path.clone() {
                    Some(path) => path,
                    None => gmail::default_token_path()?,
                };
                let api = HttpGmailApi::new(token_path);
                Ok(Account::vendor(profile, GmailSource::new(Box::new(api), settings)))
            }
        }
    }

    fn core(&self) -> &AccountCore {
        match self {
            Account::Generic(a) => &a.core,
            Account::Vendor(a) => &a.core,
        }
    }

    fn parts(&mut self) -> (&mut AccountCore, &mut dyn MailSource) {
        match self {
            Account::Generic(a) => (&mut a.core, a.source.as_mut()),
            Account::Vendor(a) => (&mut a.core, &mut a.source),
        }
    }

    pub fn id(&self) -> &str {
        &self.core().profile.id
    }

    pub fn profile(&self) -> &AccountProfile {
        &self.core().profile
    }

    pub fn kind(&self) -> AccountKind {
        match self {
            Account::Generic(_) => AccountKind::Generic,
            Account::Vendor(_) => AccountKind::Vendor,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.core().state
    }

    pub fn total_count(&self) -> usize {
        self.core().cursor.total
    }

    pub fn cursor_position(&self) -> usize {
        self.core().cursor.position
    }

    /// Handle for stopping this account's fetch loop from another thread.
    pub fn stop_token(&self) -> StopToken {
        self.core().stop.clone()
    }

    /// Ask the fetch loop to stop at the next message boundary.
    pub fn stop_import_service(&self) {
        self.core().stop.stop();
    }

    pub fn connect(&mut self) -> Result<(), ConnectError> {
        let (core, source) = self.parts();
        if core.is_open() {
            return Ok(());
        }
        core.state = ConnectionState::Connecting;
        match source.connect() {
            Ok(()) => {
                core.state = ConnectionState::Connected;
                log::info!("Account[{}]: connected", core.profile.id);
                Ok(())
            }
            Err(e) => {
                core.state = ConnectionState::Disconnected;
                core.cursor = MessageCursor::default();
                Err(e)
            }
        }
    }

    pub fn disconnect(&mut self) {
        let (core, source) = self.parts();
        if core.state != ConnectionState::Disconnected {
            source.disconnect();
            log::info!("Account[{}]: disconnected", core.profile.id);
        }
        core.state = ConnectionState::Disconnected;
        core.cursor = MessageCursor::default();
    }

    /// Snapshot the remote listing and rewind the cursor.
    pub fn load_message_list(&mut self) -> Result<usize, FetchError> {
        let (core, source) = self.parts();
        if !core.is_open() {
            return Err(FetchError::NotConnected);
        }
        let total = source.load_message_list()?;
        core.cursor = MessageCursor { position: 0, total };
        Ok(total)
    }

    pub fn has_next_message(&self) -> bool {
        let core = self.core();
        core.is_open() && core.cursor.position < core.cursor.total
    }

    /// Fetch the message under the cursor. The cursor advances even when the
    /// fetch fails, so one bad message is skipped rather than retried.
    pub fn next_message(&mut self) -> Result<NormalizedMessage, FetchError> {
        let (core, source) = self.parts();
        if !core.is_open() {
            return Err(FetchError::NotConnected);
        }
        let MessageCursor { position, total } = core.cursor;
        if position >= total {
            return Err(FetchError::IndexOutOfRange { position, total });
        }
        let ctx = core.context();
        core.cursor.position += 1;
        source.fetch(position, &ctx)
    }

    /// Connect, list, and push every message onto the queue until the list
    /// is exhausted or the stop flag is seen. The account stays connected
    /// afterwards.
    pub fn run_fetch_loop(&mut self, queue: &MessageQueue, observers: &Observers) -> FetchReport {
        let id = self.id().to_string();
        let mut report = FetchReport::default();

        queue.begin_account(&id);
        observers.emit(PipelineEvent::ImportStarted {
            account_id: id.clone(),
        });

        if let Err(e) = self.connect() {
            log::warn!(
                "Account[{}]: connect failed: {} ({})",
                id,
                e,
                e.recovery_suggestion()
            );
            observers.emit(PipelineEvent::ImportError {
                account_id: Some(id.clone()),
                message: e.to_string(),
            });
            return self.finish(&id, report, observers);
        }

        self.set_state(ConnectionState::Fetching);
        match self.load_message_list() {
            Ok(total) => {
                log::info!("Account[{}]: {} messages to fetch", id, total);
                queue.set_total(&id, total as u64);
            }
            Err(e) => {
                log::warn!("Account[{}]: listing failed: {}", id, e);
                observers.emit(PipelineEvent::ImportError {
                    account_id: Some(id.clone()),
                    message: e.to_string(),
                });
                self.set_state(ConnectionState::Connected);
                return self.finish(&id, report, observers);
            }
        }

        let stop = self.stop_token();
        while !stop.is_stopped() && self.has_next_message() {
            match self.next_message() {
                Ok(message) => {
                    queue.enqueue(message);
                    report.fetched += 1;
                }
                Err(e) => {
                    report.failed += 1;
                    log::warn!("Account[{}]: message skipped: {}", id, e);
                    observers.emit(PipelineEvent::ImportError {
                        account_id: Some(id.clone()),
                        message: e.to_string(),
                    });
                }
            }
            let progress = queue.advance(&id);
            observers.emit(PipelineEvent::Progress {
                account_id: id.clone(),
                current: progress.current,
                total: progress.total,
            });
        }

        if stop.is_stopped() {
            log::info!("Account[{}]: stopped at message {}", id, self.cursor_position());
        }
        self.set_state(ConnectionState::Connected);
        self.finish(&id, report, observers)
    }

    fn set_state(&mut self, state: ConnectionState) {
        let (core, _) = self.parts();
        core.state = state;
    }

    fn finish(&self, id: &str, report: FetchReport, observers: &Observers) -> FetchReport {
        log::info!(
            "Account[{}]: import complete ({} fetched, {} failed)",
            id,
            report.fetched,
            report.failed
        );
        observers.emit(PipelineEvent::AccountImportComplete {
            account_id: id.to_string(),
            fetched: report.fetched,
            failed: report.failed,
        });
        report
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::message::MessageParts;
    use chrono::NaiveDate;

    /// In-memory source. Positions listed in `broken` fail to fetch.
    pub struct FakeSource {
        pub senders: Vec<String>,
        pub broken: Vec<usize>,
        pub connect_error: Option<ConnectError>,
        pub connected: bool,
    }

    impl FakeSource {
        pub fn new(senders: &[&str]) -> Self {
            Self {
                senders: senders.iter().map(|s| s.to_string()).collect(),
                broken: Vec::new(),
                connect_error: None,
                connected: false,
            }
        }
    }

    impl MailSource for FakeSource {
        fn connect(&mut self) -> Result<(), ConnectError> {
            if let Some(e) = self.connect_error.take() {
                return Err(e);
            }
            self.connected = true;
            Ok(())
        }

        fn load_message_list(&mut self) -> Result<usize, FetchError> {
            Ok(self.senders.len())
        }

        fn fetch(&mut self, position: usize, ctx: &MessageContext) -> Result<NormalizedMessage, FetchError> {
            if self.broken.contains(&position) {
                return Err(FetchError::Parse {
                    id: position.to_string(),
                    reason: "truncated".into(),
                });
            }
            let date = NaiveDate::from_ymd_opt(2021, 3, 1)
                .and_then(|d| d.and_hms_opt(9, position as u32 % 60, 0));
            Ok(NormalizedMessage::new(MessageParts {
                source_id: ctx.source_id.clone(),
                source_name: position.to_string(),
                date,
                from_id: self.senders[position].clone(),
                subject: format!("Message {position}"),
                treat_existing_as_history: ctx.treat_existing_as_history,
                ..Default::default()
            }))
        }

        fn disconnect(&mut self) {
            self.connected = false;
        }
    }
}
