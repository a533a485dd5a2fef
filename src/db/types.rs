//! Shared type definitions for the database layer.

use chrono::{NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Storage format for every date column. No sub-second precision.
pub const DB_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Errors specific to database operations.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Home directory not found")]
    HomeDirNotFound,

    #[error("Failed to create database directory: {0}")]
    CreateDir(std::io::Error),

    #[error("Schema migration failed: {0}")]
    Migration(String),

    #[error("Invalid stored date '{0}'")]
    InvalidDate(String),

    #[error("Missing required value: {0}")]
    MissingValue(&'static str),
}

/// Drop sub-second precision so a date compares equal to its stored form.
pub fn truncate_date(date: NaiveDateTime) -> NaiveDateTime {
    date.with_nanosecond(0).unwrap_or(date)
}

pub fn format_db_date(date: &NaiveDateTime) -> String {
    date.format(DB_DATE_FORMAT).to_string()
}

pub fn parse_db_date(value: &str) -> Result<NaiveDateTime, DbError> {
    NaiveDateTime::parse_from_str(value, DB_DATE_FORMAT)
        .map_err(|_| DbError::InvalidDate(value.to_string()))
}

pub fn parse_optional_db_date(value: Option<String>) -> Result<Option<NaiveDateTime>, DbError> {
    value.as_deref().map(parse_db_date).transpose()
}

/// Outcome code of a history item. Part of the identity key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResultCode {
    #[default]
    None,
    Done,
    Received,
    Attempted,
}

impl ResultCode {
    pub fn as_i64(self) -> i64 {
        match self {
            ResultCode::None => 0,
            ResultCode::Done => 1,
            ResultCode::Received => 2,
            ResultCode::Attempted => 3,
        }
    }

    /// Unknown codes read as `None` rather than failing the whole row.
    pub fn from_i64(value: i64) -> Self {
        match value {
            1 => ResultCode::Done,
            2 => ResultCode::Received,
            3 => ResultCode::Attempted,
            _ => ResultCode::None,
        }
    }
}

/// Where a history record stands after the importer has looked at it.
/// Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RecordStatus {
    #[default]
    None,
    Added,
    Exists,
    ContactNotFound,
    MultipleContactsFound,
    Error,
}

/// Well-known rows of the `task_types` table (seeded by the baseline migration).
pub mod task_types {
    pub const APPOINTMENT: i64 = 1;
    pub const CALL: i64 = 2;
    pub const EMAIL: i64 = 3;
    pub const LETTER: i64 = 4;
    pub const PRE_CALL: i64 = 5;
    pub const THANK: i64 = 6;
    pub const VISIT: i64 = 7;
    pub const TEXT: i64 = 8;
    pub const SOCIAL: i64 = 9;
}

/// A donor-history item: one row of the `history` table plus the transient
/// import status.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    pub id: Option<i64>,
    pub contact_id: Option<i64>,
    pub task_type_id: i64,
    pub date: Option<NaiveDateTime>,
    pub description: String,
    pub notes: String,
    pub result_code: ResultCode,
    pub challenge: bool,
    pub thank: bool,
    pub mass_mailing: bool,
    pub status: RecordStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_error: Option<String>,
}

impl HistoryRecord {
    /// Overwrite every persisted field with the stored row's values, leaving
    /// the transient status alone.
    pub fn copy_stored_values(&mut self, stored: &HistoryRecord) {
        self.id = stored.id;
        self.contact_id = stored.contact_id;
        self.task_type_id = stored.task_type_id;
        self.date = stored.date;
        self.description = stored.description.clone();
        self.notes = stored.notes.clone();
        self.result_code = stored.result_code;
        self.challenge = stored.challenge;
        self.thank = stored.thank;
        self.mass_mailing = stored.mass_mailing;
    }

    pub fn mark(&mut self, status: RecordStatus) {
        self.status = status;
        self.status_error = None;
    }

    pub fn mark_error(&mut self, error: impl ToString) {
        self.status = RecordStatus::Error;
        self.status_error = Some(error.to_string());
    }
}

/// The editable boolean columns of a history row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryFlag {
    Challenge,
    Thank,
    MassMailing,
}

impl HistoryFlag {
    pub fn column(self) -> &'static str {
        match self {
            HistoryFlag::Challenge => "challenge",
            HistoryFlag::Thank => "thank",
            HistoryFlag::MassMailing => "mass_mailing",
        }
    }
}

/// Derived per-contact "last" date fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LastField {
    Activity,
    Appointment,
    Call,
    Challenge,
    Letter,
    PreCall,
    Thank,
    Visit,
}

impl LastField {
    /// Fields whose maximum is `lastActivity`. `Appointment` comes first: it
    /// seeds the maximum.
    pub const CONTRIBUTING: [LastField; 7] = [
        LastField::Appointment,
        LastField::Call,
        LastField::Challenge,
        LastField::Letter,
        LastField::PreCall,
        LastField::Thank,
        LastField::Visit,
    ];

    pub fn column(self) -> &'static str {
        match self {
            LastField::Activity => "last_activity",
            LastField::Appointment => "last_appointment",
            LastField::Call => "last_call",
            LastField::Challenge => "last_challenge",
            LastField::Letter => "last_letter",
            LastField::PreCall => "last_pre_call",
            LastField::Thank => "last_thank",
            LastField::Visit => "last_visit",
        }
    }

    /// Key used in the `task_type_last_fields` registry.
    pub fn registry_key(self) -> &'static str {
        match self {
            LastField::Activity => "activity",
            LastField::Appointment => "appointment",
            LastField::Call => "call",
            LastField::Challenge => "challenge",
            LastField::Letter => "letter",
            LastField::PreCall => "pre_call",
            LastField::Thank => "thank",
            LastField::Visit => "visit",
        }
    }

    pub fn from_registry_key(key: &str) -> Option<Self> {
        match key {
            "activity" => Some(LastField::Activity),
            "appointment" => Some(LastField::Appointment),
            "call" => Some(LastField::Call),
            "challenge" => Some(LastField::Challenge),
            "letter" => Some(LastField::Letter),
            "pre_call" => Some(LastField::PreCall),
            "thank" => Some(LastField::Thank),
            "visit" => Some(LastField::Visit),
            _ => None,
        }
    }
}

/// The aggregate columns of a `contacts` row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactAggregates {
    pub contact_id: i64,
    pub last_activity: Option<NaiveDateTime>,
    pub last_appointment: Option<NaiveDateTime>,
    pub last_call: Option<NaiveDateTime>,
    pub last_challenge: Option<NaiveDateTime>,
    pub last_letter: Option<NaiveDateTime>,
    pub last_pre_call: Option<NaiveDateTime>,
    pub last_thank: Option<NaiveDateTime>,
    pub last_visit: Option<NaiveDateTime>,
    pub challenges_since_last_gift: i64,
}

impl ContactAggregates {
    pub fn get(&self, field: LastField) -> Option<NaiveDateTime> {
        match field {
            LastField::Activity => self.last_activity,
            LastField::Appointment => self.last_appointment,
            LastField::Call => self.last_call,
            LastField::Challenge => self.last_challenge,
            LastField::Letter => self.last_letter,
            LastField::PreCall => self.last_pre_call,
            LastField::Thank => self.last_thank,
            LastField::Visit => self.last_visit,
        }
    }
}
