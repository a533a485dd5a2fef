//! IMAP mail source (sync, TLS).
//!
//! The folder is opened with EXAMINE so nothing is marked as seen. The
//! listing is a UID snapshot taken at `load_message_list`; messages are then
//! fetched one UID at a time as RFC822 and parsed with `mail-parser`.

use std::net::TcpStream;
use std::sync::Arc;

use chrono::{FixedOffset, Local, NaiveDateTime, TimeZone};
use mail_parser::{Address as MailAddress, MessageParser};
use native_tls::TlsStream;

use super::{MailSource, MessageContext};
use crate::error::{ConnectError, FetchError};
use crate::message::{Address, MessageParts, NormalizedMessage};
use crate::types::ImapSettings;

type ImapSession = imap::Session<TlsStream<TcpStream>>;

/// Stored passwords, keyed by the account's credentials reference.
pub trait CredentialStore: Send + Sync {
    fn password(&self, credentials_ref: &str) -> Option<String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptResponse {
    Entered(String),
    Cancelled,
}

/// Asks the user for a password. Blocks the calling fetch thread.
pub trait CredentialPrompt: Send + Sync {
    fn prompt_password(&self, account_id: &str, username: &str) -> PromptResponse;
}

/// Reads `DONORSYNC_PASSWORD_<REF>` (upper-cased, `-` and `.` as `_`).
#[derive(Debug, Default)]
pub struct EnvCredentialStore;

impl EnvCredentialStore {
    pub fn variable_name(credentials_ref: &str) -> String {
        let key: String = credentials_ref
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
            .collect();
        format!("DONORSYNC_PASSWORD_{key}")
    }
}

impl CredentialStore for EnvCredentialStore {
    fn password(&self, credentials_ref: &str) -> Option<String> {
        std::env::var(Self::variable_name(credentials_ref))
            .ok()
            .filter(|p| !p.is_empty())
    }
}

/// Prompt for unattended runs: always cancels.
#[derive(Debug, Default)]
pub struct NonInteractivePrompt;

impl CredentialPrompt for NonInteractivePrompt {
    fn prompt_password(&self, account_id: &str, _username: &str) -> PromptResponse {
        log::warn!("Account[{}]: no stored password and no prompt available", account_id);
        PromptResponse::Cancelled
    }
}

pub struct ImapSource {
    account_id: String,
    settings: ImapSettings,
    credentials_ref: String,
    store: Arc<dyn CredentialStore>,
    prompt: Arc<dyn CredentialPrompt>,
    cached_password: Option<String>,
    session: Option<ImapSession>,
    uids: Vec<u32>,
}

impl ImapSource {
    pub fn new(
        account_id: String,
        settings: ImapSettings,
        credentials_ref: String,
        store: Arc<dyn CredentialStore>,
        prompt: Arc<dyn CredentialPrompt>,
    ) -> Self {
        Self {
            account_id,
            settings,
            credentials_ref,
            store,
            prompt,
            cached_password: None,
            session: None,
            uids: Vec::new(),
        }
    }

    /// Cached, then stored, then prompted.
    fn resolve_password(&mut self) -> Result<String, ConnectError> {
        if let Some(password) = &self.cached_password {
            return Ok(password.clone());
        }
        if let Some(password) = self.store.password(&self.credentials_ref) {
            return Ok(password);
        }
        match self
            .prompt
            .prompt_password(&self.account_id, &self.settings.username)
        {
            PromptResponse::Entered(password) => Ok(password),
            PromptResponse::Cancelled => Err(ConnectError::Cancelled),
        }
    }

    fn session(&mut self) -> Result<&mut ImapSession, FetchError> {
        self.session.as_mut().ok_or(FetchError::NotConnected)
    }
}

fn is_in_use(message: &str) -> bool {
    message.contains("INUSE") || message.to_ascii_lowercase().contains("in use")
}

impl MailSource for ImapSource {
    fn connect(&mut self) -> Result<(), ConnectError> {
        let password = self.resolve_password()?;

        let tls = native_tls::TlsConnector::builder()
            .build()
            .map_err(|e| ConnectError::Network(format!("TLS connector build failed: {e}")))?;
        let host = self.settings.host.as_str();
        let client = imap::connect((host, self.settings.port), host, &tls)
            .map_err(|e| ConnectError::Network(format!("IMAP connection to {host} failed: {e}")))?;

        let mut session = match client.login(&self.settings.username, &password) {
            Ok(session) => session,
            Err((e, _client)) => {
                self.cached_password = None;
                let message = e.to_string();
                return Err(if is_in_use(&message) {
                    ConnectError::ResourceBusy(message)
                } else {
                    ConnectError::AuthFailed(message)
                });
            }
        };

        if let Err(e) = session.examine(&self.settings.folder) {
            session.logout().ok();
            let message = format!("EXAMINE {} failed: {e}", self.settings.folder);
            return Err(if is_in_use(&message) {
                ConnectError::ResourceBusy(message)
            } else {
                ConnectError::Network(message)
            });
        }

        self.cached_password = Some(password);
        self.session = Some(session);
        Ok(())
    }

    fn load_message_list(&mut self) -> Result<usize, FetchError> {
        let uids = self
            .session()?
            .uid_search("ALL")
            .map_err(|e| FetchError::Network(format!("IMAP UID SEARCH failed: {e}")))?;
        let mut uids: Vec<u32> = uids.into_iter().collect();
        uids.sort_unstable();
        self.uids = uids;
        Ok(self.uids.len())
    }

    fn fetch(&mut self, position: usize, ctx: &MessageContext) -> Result<NormalizedMessage, FetchError> {
        let uid = *self.uids.get(position).ok_or(FetchError::IndexOutOfRange {
            position,
            total: self.uids.len(),
        })?;
        let fetches = self
            .session()?
            .uid_fetch(uid.to_string(), "RFC822")
            .map_err(|e| FetchError::Network(format!("IMAP UID FETCH {uid} failed: {e}")))?;
        let body = fetches
            .iter()
            .next()
            .and_then(|f| f.body())
            .ok_or_else(|| FetchError::Parse {
                id: uid.to_string(),
                reason: "server returned no body".to_string(),
            })?;
        parse_rfc822(&uid.to_string(), body, ctx)
    }

    fn disconnect(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.logout().ok();
        }
        self.uids.clear();
    }
}

fn collect_addresses(address: Option<&MailAddress<'_>>, into: &mut Vec<Address>) {
    let push = |into: &mut Vec<Address>, addr: &mail_parser::Addr<'_>| {
        if let Some(email) = addr.address.as_deref() {
            into.push(Address::new(addr.name.as_deref().unwrap_or(""), email));
        }
    };
    match address {
        Some(MailAddress::List(addrs)) => {
            for addr in addrs {
                push(into, addr);
            }
        }
        Some(MailAddress::Group(groups)) => {
            for group in groups {
                for addr in &group.addresses {
                    push(into, addr);
                }
            }
        }
        None => {}
    }
}

fn to_local(dt: &mail_parser::DateTime) -> Option<NaiveDateTime> {
    let tz_secs = (dt.tz_hour as i32) * 3600 + (dt.tz_minute as i32) * 60;
    let tz_sign = if dt.tz_before_gmt { -1 } else { 1 };
    FixedOffset::east_opt(tz_sign * tz_secs)?
        .with_ymd_and_hms(
            dt.year as i32,
            dt.month as u32,
            dt.day as u32,
            dt.hour as u32,
            dt.minute as u32,
            dt.second as u32,
        )
        .earliest()
        .map(|d| d.with_timezone(&Local).naive_local())
}

/// Parse a raw RFC822 message into its normalized form.
pub fn parse_rfc822(id: &str, raw: &[u8], ctx: &MessageContext) -> Result<NormalizedMessage, FetchError> {
    let parse_error = |reason: &str| FetchError::Parse {
        id: id.to_string(),
        reason: reason.to_string(),
    };
    let message = MessageParser::default()
        .parse(raw)
        .ok_or_else(|| parse_error("not an RFC822 message"))?;

    let mut from = Vec::new();
    collect_addresses(message.from(), &mut from);
    let sender = from
        .into_iter()
        .next()
        .ok_or_else(|| parse_error("missing or unreadable From header"))?;

    let mut recipients = Vec::new();
    collect_addresses(message.to(), &mut recipients);
    collect_addresses(message.cc(), &mut recipients);

    Ok(NormalizedMessage::new(MessageParts {
        source_id: ctx.source_id.clone(),
        source_name: id.to_string(),
        date: message.date().and_then(to_local),
        from_id: sender.email,
        from_name: sender.name,
        recipients,
        subject: message.subject().unwrap_or("").to_string(),
        body: message
            .body_text(0)
            .map(|b| b.into_owned())
            .unwrap_or_default(),
        treat_existing_as_history: ctx.treat_existing_as_history,
    }))
}
