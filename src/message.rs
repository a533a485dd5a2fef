//! The normalized form of one remote message, as handed from an account's
//! fetch loop to the importer.

use chrono::NaiveDateTime;
use serde::Serialize;

use crate::db::truncate_date;

/// A mailbox address split into display name and address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Address {
    pub name: String,
    pub email: String,
}

impl Address {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: normalize_email(&email.into()),
        }
    }
}

/// Lower-case and trim an address for comparison.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Parse a single header address such as `"Parr, Bob" <parrb@metro.com>`.
pub fn parse_address(header: &str) -> Option<Address> {
    parse_address_list(header).into_iter().next()
}

/// Parse an address list header. Commas inside quoted display names do not
/// split entries.
pub fn parse_address_list(header: &str) -> Vec<Address> {
    let mut entries = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut in_angle = false;

    for ch in header.chars() {
        match ch {
            '"' if !in_angle => {
                in_quotes = !in_quotes;
                current.push(ch);
            }
            '<' if !in_quotes => {
                in_angle = true;
                current.push(ch);
            }
            '>' if !in_quotes => {
                in_angle = false;
                current.push(ch);
            }
            ',' if !in_quotes && !in_angle => {
                entries.push(std::mem::take(&mut current));
            }
            _ => current.push(ch),
        }
    }
    entries.push(current);

    entries
        .iter()
        .filter_map(|entry| parse_entry(entry.trim()))
        .collect()
}

fn parse_entry(entry: &str) -> Option<Address> {
    if entry.is_empty() {
        return None;
    }
    if let (Some(lt), Some(gt)) = (entry.rfind('<'), entry.rfind('>')) {
        if lt < gt {
            let email = entry[lt + 1..gt].trim();
            if email.is_empty() {
                return None;
            }
            let name = entry[..lt].trim().trim_matches('"').trim();
            return Some(Address::new(name, email));
        }
    }
    if entry.contains('@') {
        return Some(Address::new("", entry.trim_matches('"')));
    }
    None
}

/// Everything needed to build a [`NormalizedMessage`].
#[derive(Debug, Clone, Default)]
pub struct MessageParts {
    pub source_id: String,
    pub source_name: String,
    pub date: Option<NaiveDateTime>,
    pub from_id: String,
    pub from_name: String,
    pub recipients: Vec<Address>,
    pub subject: String,
    pub body: String,
    pub treat_existing_as_history: bool,
}

/// A fetched message with the fields the importer needs. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedMessage {
    source_id: String,
    source_name: String,
    date: Option<NaiveDateTime>,
    from_id: String,
    from_name: String,
    recipients: Vec<Address>,
    subject: String,
    body: String,
    treat_existing_as_history: bool,
}

impl NormalizedMessage {
    pub fn new(parts: MessageParts) -> Self {
        Self {
            source_id: parts.source_id,
            source_name: parts.source_name,
            date: parts.date.map(truncate_date),
            from_id: normalize_email(&parts.from_id),
            from_name: parts.from_name.trim().to_string(),
            recipients: parts.recipients,
            subject: parts.subject.trim().to_string(),
            body: parts.body,
            treat_existing_as_history: parts.treat_existing_as_history,
        }
    }

    /// Account the message came from.
    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    /// Remote identifier of the message within its account.
    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    pub fn date(&self) -> Option<NaiveDateTime> {
        self.date
    }

    /// Sender address, lower-cased.
    pub fn from_id(&self) -> &str {
        &self.from_id
    }

    pub fn from_name(&self) -> &str {
        &self.from_name
    }

    pub fn recipients(&self) -> &[Address] {
        &self.recipients
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn treat_existing_as_history(&self) -> bool {
        self.treat_existing_as_history
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Timelike};

    #[test]
    fn test_parse_quoted_name_with_comma() {
        let addr = parse_address("\"Parr, Bob\" <parrb@metro.com>").expect("address");
        assert_eq!(addr.name, "Parr, Bob");
        assert_eq!(addr.email, "parrb@metro.com");
    }

    #[test]
    fn test_parse_list_mixed_forms() {
        let list = parse_address_list(
            "\"Parr, Bob\" <ParrB@Metro.com>, helen@parr.org, Dash <dash@parr.org>",
        );
        assert_eq!(list.len(), 3);
        assert_eq!(list[0].email, "parrb@metro.com");
        assert_eq!(list[1], Address::new("", "helen@parr.org"));
        assert_eq!(list[2].name, "Dash");
    }

    #[test]
    fn test_parse_rejects_entries_without_address() {
        assert!(parse_address("Undisclosed recipients:;").is_none());
        assert!(parse_address_list("").is_empty());
        assert!(parse_address("Nobody <>").is_none());
    }

    #[test]
    fn test_message_normalizes_sender_and_date() {
        let date = NaiveDate::from_ymd_opt(2021, 3, 1)
            .and_then(|d| d.and_hms_nano_opt(8, 15, 30, 123_000_000))
            .expect("date");
        let msg = NormalizedMessage::new(MessageParts {
            source_id: "work".into(),
            source_name: "42".into(),
            date: Some(date),
            from_id: " ParrB@Metro.com ".into(),
            from_name: "Parr, Bob".into(),
            subject: "  Thanks!  ".into(),
            ..Default::default()
        });
        assert_eq!(msg.from_id(), "parrb@metro.com");
        assert_eq!(msg.subject(), "Thanks!");
        assert_eq!(msg.date().map(|d| d.nanosecond()), Some(0));
        assert!(!msg.treat_existing_as_history());
    }
}
