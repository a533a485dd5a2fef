//! Gmail API v1 mail source.
//!
//! Messages are collected in two passes when the list is loaded:
//! 1. every message under the configured label, noting its thread
//! 2. a rescan of a broader view (`in:anywhere` by default) adding every
//!    message whose thread was seen in pass 1
//!
//! A label only tags messages that existed when it was applied, so pass 2
//! picks up later replies in the same threads.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Local, NaiveDateTime};
use serde::Deserialize;

use super::{MailSource, MessageContext};
use crate::error::{ConfigError, ConnectError, FetchError};
use crate::message::{parse_address, parse_address_list, MessageParts, NormalizedMessage};
use crate::types::GmailSettings;

const API_BASE: &str = "https://gmail.googleapis.com/gmail/v1/users/me";
const PAGE_SIZE: &str = "500";

// ============================================================================
// API response types
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageListPage {
    #[serde(default)]
    pub messages: Vec<MessageStub>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageStub {
    pub id: String,
    #[serde(default)]
    pub thread_id: String,
}

/// A message fetched with `format=full`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GmailMessage {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub thread_id: String,
    /// Milliseconds since the epoch, as a string.
    #[serde(default)]
    pub internal_date: Option<String>,
    #[serde(default)]
    pub payload: Option<Payload>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payload {
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub headers: Vec<Header>,
    #[serde(default)]
    pub body: Option<PayloadBody>,
    #[serde(default)]
    pub parts: Vec<Payload>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Header {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PayloadBody {
    #[serde(default)]
    pub data: Option<String>,
}

/// Subset of the token file written by the OAuth flow.
#[derive(Debug, Clone, Deserialize)]
struct StoredToken {
    #[serde(alias = "access_token")]
    token: String,
}

// ============================================================================
// API seam
// ============================================================================

/// The Gmail calls the source needs.
pub trait GmailApi: Send {
    /// Obtain credentials and verify them against the mailbox.
    fn authorize(&mut self) -> Result<(), ConnectError>;

    fn list_messages(&self, query: &str, page_token: Option<&str>) -> Result<MessageListPage, FetchError>;

    fn get_message(&self, id: &str) -> Result<GmailMessage, FetchError>;

    /// Drop any credentials held.
    fn release(&mut self) {}
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 250,
            max_backoff_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retryable,
    NonRetryable,
}

fn retry_decision_for_status(status: reqwest::StatusCode) -> RetryDecision {
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        RetryDecision::Retryable
    } else {
        RetryDecision::NonRetryable
    }
}

fn retry_delay(
    attempt: u32,
    policy: &RetryPolicy,
    retry_after: Option<&reqwest::header::HeaderValue>,
) -> Duration {
    if let Some(secs) = retry_after
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
    {
        return Duration::from_secs(secs.min(30));
    }

    let exponent = 2u64.saturating_pow(attempt.saturating_sub(1));
    let base = policy
        .initial_backoff_ms
        .saturating_mul(exponent)
        .min(policy.max_backoff_ms);
    let jitter = (std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64)
        .unwrap_or(0))
        % 150;
    Duration::from_millis(base.saturating_add(jitter))
}

/// Send a request, retrying throttling, timeouts, and server errors.
pub fn send_with_retry(
    request: reqwest::blocking::RequestBuilder,
    policy: &RetryPolicy,
) -> Result<reqwest::blocking::Response, reqwest::Error> {
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        let Some(cloned) = request.try_clone() else {
            return request.send();
        };

        match cloned.send() {
            Ok(response) => {
                let status = response.status();
                if retry_decision_for_status(status) == RetryDecision::Retryable && attempt < attempts {
                    let delay =
                        retry_delay(attempt, policy, response.headers().get(reqwest::header::RETRY_AFTER));
                    log::warn!(
                        "Gmail: retry {}/{} after status {} (sleep {:?})",
                        attempt,
                        attempts,
                        status,
                        delay
                    );
                    thread::sleep(delay);
                    attempt += 1;
                    continue;
                }
                return Ok(response);
            }
            Err(err) => {
                if (err.is_timeout() || err.is_connect()) && attempt < attempts {
                    let delay = retry_delay(attempt, policy, None);
                    log::warn!(
                        "Gmail: retry {}/{} after transport error: {} (sleep {:?})",
                        attempt,
                        attempts,
                        err,
                        delay
                    );
                    thread::sleep(delay);
                    attempt += 1;
                    continue;
                }
                return Err(err);
            }
        }
    }
}

/// Default token location: ~/.donorsync/google/token.json
pub fn default_token_path() -> Result<PathBuf, ConfigError> {
    Ok(crate::types::state_dir()?.join("google").join("token.json"))
}

/// Gmail REST client over blocking reqwest.
pub struct HttpGmailApi {
    client: reqwest::blocking::Client,
    token_path: PathBuf,
    access_token: Option<String>,
    policy: RetryPolicy,
}

impl HttpGmailApi {
    pub fn new(token_path: PathBuf) -> Self {
        Self {
            client: reqwest::blocking::Client::new(),
            token_path,
            access_token: None,
            policy: RetryPolicy::default(),
        }
    }

    fn read_token(path: &Path) -> Result<String, ConnectError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ConnectError::AuthFailed(format!("no Google token at {}: {}", path.display(), e))
        })?;
        let token: StoredToken = serde_json::from_str(&content)
            .map_err(|e| ConnectError::AuthFailed(format!("unreadable Google token: {}", e)))?;
        Ok(token.token)
    }

    fn token(&self) -> Result<&str, FetchError> {
        self.access_token.as_deref().ok_or(FetchError::NotConnected)
    }

    fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<T, FetchError> {
        let request = self.client.get(url).bearer_auth(self.token()?).query(query);
        let resp = send_with_retry(request, &self.policy).map_err(|e| FetchError::Network(e.to_string()))?;

        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(FetchError::AuthExpired);
        }
        if !status.is_success() {
            let body = resp.text().unwrap_or_default();
            return Err(FetchError::Api {
                status: status.as_u16(),
                message: body,
            });
        }
        resp.json::<T>().map_err(|e| FetchError::Network(e.to_string()))
    }
}

impl GmailApi for HttpGmailApi {
    fn authorize(&mut self) -> Result<(), ConnectError> {
        self.access_token = Some(Self::read_token(&self.token_path)?);
        match self.get_json::<serde_json::Value>(&format!("{API_BASE}/profile"), &[]) {
            Ok(_) => Ok(()),
            Err(e) => {
                self.access_token = None;
                Err(match e {
                    FetchError::AuthExpired => {
                        ConnectError::AuthFailed("Google token expired or revoked".to_string())
                    }
                    FetchError::Api { status: 403, message } => ConnectError::AuthFailed(message),
                    other => ConnectError::Network(other.to_string()),
                })
            }
        }
    }

    fn list_messages(&self, query: &str, page_token: Option<&str>) -> Result<MessageListPage, FetchError> {
        let mut params = vec![("q", query), ("maxResults", PAGE_SIZE)];
        if let Some(token) = page_token {
            params.push(("pageToken", token));
        }
        self.get_json(&format!("{API_BASE}/messages"), &params)
    }

    fn get_message(&self, id: &str) -> Result<GmailMessage, FetchError> {
        self.get_json(&format!("{API_BASE}/messages/{id}"), &[("format", "full")])
    }

    fn release(&mut self) {
        self.access_token = None;
    }
}

// ============================================================================
// Source
// ============================================================================

pub struct GmailSource {
    api: Box<dyn GmailApi>,
    settings: GmailSettings,
    ids: Vec<String>,
}

impl GmailSource {
    pub fn new(api: Box<dyn GmailApi>, settings: GmailSettings) -> Self {
        Self {
            api,
            settings,
            ids: Vec::new(),
        }
    }

    fn label_query(&self) -> String {
        format!("label:{}", self.settings.label.trim().replace(' ', "-"))
    }

    fn for_each_stub(&self, query: &str, mut f: impl FnMut(MessageStub)) -> Result<(), FetchError> {
        let mut page_token: Option<String> = None;
        loop {
            let page = self.api.list_messages(query, page_token.as_deref())?;
            for stub in page.messages {
                f(stub);
            }
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => return Ok(()),
            }
        }
    }

    /// Ids of every message in a labeled thread.
    pub fn collect_message_ids(&self) -> Result<HashSet<String>, FetchError> {
        let mut ids = HashSet::new();
        let mut threads = HashSet::new();

        self.for_each_stub(&self.label_query(), |stub| {
            if !stub.thread_id.is_empty() {
                threads.insert(stub.thread_id);
            }
            ids.insert(stub.id);
        })?;
        let labeled = ids.len();

        if !threads.is_empty() {
            self.for_each_stub(&self.settings.broader_query, |stub| {
                if threads.contains(&stub.thread_id) {
                    ids.insert(stub.id);
                }
            })?;
        }

        log::info!(
            "Gmail: {} labeled messages in {} threads, {} after thread rescan",
            labeled,
            threads.len(),
            ids.len()
        );
        Ok(ids)
    }
}

impl MailSource for GmailSource {
    fn connect(&mut self) -> Result<(), ConnectError> {
        self.api.authorize()
    }

    fn load_message_list(&mut self) -> Result<usize, FetchError> {
        let mut ids: Vec<String> = self.collect_message_ids()?.into_iter().collect();
        ids.sort();
        self.ids = ids;
        Ok(self.ids.len())
    }

    fn fetch(&mut self, position: usize, ctx: &MessageContext) -> Result<NormalizedMessage, FetchError> {
        let id = self.ids.get(position).ok_or(FetchError::IndexOutOfRange {
            position,
            total: self.ids.len(),
        })?;
        let message = self.api.get_message(id)?;
        convert_message(&message, ctx)
    }

    fn disconnect(&mut self) {
        self.api.release();
        self.ids.clear();
    }
}

// ============================================================================
// Conversion
// ============================================================================

fn header<'a>(payload: &'a Payload, name: &str) -> &'a str {
    payload
        .headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.as_str())
        .unwrap_or("")
}

fn message_date(message: &GmailMessage, payload: &Payload) -> Option<NaiveDateTime> {
    let internal = message
        .internal_date
        .as_deref()
        .and_then(|ms| ms.parse::<i64>().ok())
        .and_then(DateTime::from_timestamp_millis)
        .map(|d| d.with_timezone(&Local).naive_local());
    internal.or_else(|| {
        DateTime::parse_from_rfc2822(header(payload, "Date"))
            .ok()
            .map(|d| d.with_timezone(&Local).naive_local())
    })
}

pub fn convert_message(message: &GmailMessage, ctx: &MessageContext) -> Result<NormalizedMessage, FetchError> {
    let payload = message.payload.as_ref().ok_or_else(|| FetchError::Parse {
        id: message.id.clone(),
        reason: "message has no payload".to_string(),
    })?;

    let from = parse_address(header(payload, "From")).ok_or_else(|| FetchError::Parse {
        id: message.id.clone(),
        reason: "missing or unreadable From header".to_string(),
    })?;

    let mut recipients = parse_address_list(header(payload, "To"));
    recipients.extend(parse_address_list(header(payload, "Cc")));

    // Prefer plain text, fall back to HTML.
    let body = extract_body_text(payload, "text/plain")
        .or_else(|| extract_body_text(payload, "text/html"))
        .unwrap_or_default();

    Ok(NormalizedMessage::new(MessageParts {
        source_id: ctx.source_id.clone(),
        source_name: message.id.clone(),
        date: message_date(message, payload),
        from_id: from.email,
        from_name: from.name,
        recipients,
        subject: header(payload, "Subject").to_string(),
        body,
        treat_existing_as_history: ctx.treat_existing_as_history,
    }))
}

/// Recursively walk MIME parts to find body data matching the target MIME type.
fn extract_body_text(payload: &Payload, target_mime: &str) -> Option<String> {
    if payload.mime_type == target_mime {
        if let Some(data) = payload.body.as_ref().and_then(|b| b.data.as_deref()) {
            return decode_url_safe_base64(data);
        }
    }
    payload
        .parts
        .iter()
        .find_map(|part| extract_body_text(part, target_mime))
}

/// Decode URL-safe base64 as used by the Gmail API. Padding is optional.
fn decode_url_safe_base64(data: &str) -> Option<String> {
    use base64::Engine;
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(data.trim_end_matches('='))
        .ok()?;
    String::from_utf8(bytes).ok()
}
