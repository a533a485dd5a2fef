use chrono::NaiveDateTime;
use rusqlite::{params, OptionalExtension, Row};

use super::*;

/// The columns that decide whether two history items describe the same event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IdentityKey {
    pub contact_id: i64,
    pub task_type_id: i64,
    pub date: NaiveDateTime,
    pub result_code: ResultCode,
}

const HISTORY_COLUMNS: &str = "id, contact_id, task_type_id, history_date, description, notes,
     result_code, challenge, thank, mass_mailing";

/// SQL fragment excluding attempted results.
const NOT_ATTEMPTED: &str = "h.result_code <> 3";

/// SQL fragment excluding mass mailings. NULL counts as not a mass mailing.
const NOT_MASS_MAILING: &str = "COALESCE(h.mass_mailing, 0) = 0";

fn flag_from_sql(value: Option<i64>) -> bool {
    value.unwrap_or(0) != 0
}

impl HistoryDb {
    // =========================================================================
    // History rows
    // =========================================================================

    fn map_history_row(row: &Row<'_>) -> rusqlite::Result<(HistoryRecord, String)> {
        let record = HistoryRecord {
            id: Some(row.get(0)?),
            contact_id: Some(row.get(1)?),
            task_type_id: row.get(2)?,
            date: None,
            description: row.get(4)?,
            notes: row.get(5)?,
            result_code: ResultCode::from_i64(row.get(6)?),
            challenge: flag_from_sql(row.get(7)?),
            thank: flag_from_sql(row.get(8)?),
            mass_mailing: flag_from_sql(row.get(9)?),
            status: RecordStatus::None,
            status_error: None,
        };
        Ok((record, row.get(3)?))
    }

    fn finish_history_row(
        mapped: Option<(HistoryRecord, String)>,
    ) -> Result<Option<HistoryRecord>, DbError> {
        match mapped {
            Some((mut record, date)) => {
                record.date = Some(parse_db_date(&date)?);
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Find the stored record sharing `key`, if any.
    pub fn find_history_by_key(&self, key: &IdentityKey) -> Result<Option<HistoryRecord>, DbError> {
        let mapped = self
            .conn
            .query_row(
                &format!(
                    "SELECT {HISTORY_COLUMNS} FROM history
                     WHERE contact_id = ?1 AND task_type_id = ?2
                       AND history_date = ?3 AND result_code = ?4
                     ORDER BY id LIMIT 1"
                ),
                params![
                    key.contact_id,
                    key.task_type_id,
                    format_db_date(&key.date),
                    key.result_code.as_i64(),
                ],
                Self::map_history_row,
            )
            .optional()?;
        Self::finish_history_row(mapped)
    }

    pub fn get_history(&self, id: i64) -> Result<Option<HistoryRecord>, DbError> {
        let mapped = self
            .conn
            .query_row(
                &format!("SELECT {HISTORY_COLUMNS} FROM history WHERE id = ?1"),
                params![id],
                Self::map_history_row,
            )
            .optional()?;
        Self::finish_history_row(mapped)
    }

    /// All history for a contact, newest first.
    pub fn get_history_for_contact(&self, contact_id: i64) -> Result<Vec<HistoryRecord>, DbError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {HISTORY_COLUMNS} FROM history WHERE contact_id = ?1
             ORDER BY history_date DESC, id DESC"
        ))?;
        let rows = stmt.query_map(params![contact_id], Self::map_history_row)?;
        let mut records = Vec::new();
        for row in rows {
            if let Some(record) = Self::finish_history_row(Some(row?))? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Insert a history row and return its id. The caller has validated the
    /// identity key; `contact_id` and `date` are required.
    pub fn insert_history(&self, record: &HistoryRecord) -> Result<i64, DbError> {
        let contact_id = record.contact_id.ok_or(DbError::MissingValue("contact_id"))?;
        let date = record
            .date
            .map(|d| format_db_date(&truncate_date(d)))
            .ok_or(DbError::MissingValue("history_date"))?;
        self.conn.execute(
            "INSERT INTO history (
                contact_id, task_type_id, history_date, description, notes,
                result_code, challenge, thank, mass_mailing
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                contact_id,
                record.task_type_id,
                date,
                record.description,
                record.notes,
                record.result_code.as_i64(),
                record.challenge as i32,
                record.thank as i32,
                record.mass_mailing as i32,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn set_history_flag(&self, id: i64, flag: HistoryFlag, value: bool) -> Result<(), DbError> {
        self.conn.execute(
            &format!("UPDATE history SET {} = ?1 WHERE id = ?2", flag.column()),
            params![value as i32, id],
        )?;
        Ok(())
    }

    pub fn set_history_description(&self, id: i64, description: &str) -> Result<(), DbError> {
        self.conn.execute(
            "UPDATE history SET description = ?1 WHERE id = ?2",
            params![description, id],
        )?;
        Ok(())
    }

    pub fn set_history_notes(&self, id: i64, notes: &str) -> Result<(), DbError> {
        self.conn.execute(
            "UPDATE history SET notes = ?1 WHERE id = ?2",
            params![notes, id],
        )?;
        Ok(())
    }

    /// Delete a history row. Returns true when a row was removed.
    pub fn delete_history(&self, id: i64) -> Result<bool, DbError> {
        let removed = self
            .conn
            .execute("DELETE FROM history WHERE id = ?1", params![id])?;
        Ok(removed > 0)
    }

    pub fn history_count(&self) -> Result<i64, DbError> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM history", [], |row| row.get(0))?)
    }

    // =========================================================================
    // Task type registry
    // =========================================================================

    /// The "last" fields a task type is registered to affect.
    pub fn last_fields_for_task_type(&self, task_type_id: i64) -> Result<Vec<LastField>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT last_field FROM task_type_last_fields WHERE task_type_id = ?1
             ORDER BY last_field",
        )?;
        let rows = stmt.query_map(params![task_type_id], |row| row.get::<_, String>(0))?;
        let mut fields = Vec::new();
        for row in rows {
            let key = row?;
            match LastField::from_registry_key(&key) {
                Some(field) => fields.push(field),
                None => log::warn!("HistoryDb: unknown last field '{}' in registry", key),
            }
        }
        Ok(fields)
    }

    pub fn register_task_type_field(&self, task_type_id: i64, field: LastField) -> Result<(), DbError> {
        self.conn.execute(
            "INSERT OR IGNORE INTO task_type_last_fields (task_type_id, last_field) VALUES (?1, ?2)",
            params![task_type_id, field.registry_key()],
        )?;
        Ok(())
    }

    // =========================================================================
    // Aggregate sources
    // =========================================================================

    fn max_date_query(
        &self,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Option<NaiveDateTime>, DbError> {
        let value: Option<String> = self.conn.query_row(sql, params, |row| row.get(0))?;
        parse_optional_db_date(value)
    }

    /// Latest date among records whose task type is registered for `field`,
    /// excluding mass mailings and attempted results.
    pub fn max_registered_history_date(
        &self,
        contact_id: i64,
        field: LastField,
    ) -> Result<Option<NaiveDateTime>, DbError> {
        self.max_date_query(
            &format!(
                "SELECT MAX(h.history_date) FROM history h
                 JOIN task_type_last_fields f ON f.task_type_id = h.task_type_id
                 WHERE h.contact_id = ?1 AND f.last_field = ?2
                   AND {NOT_MASS_MAILING} AND {NOT_ATTEMPTED}"
            ),
            &[&contact_id, &field.registry_key()],
        )
    }

    /// Latest challenge-flagged, non-attempted record. Mass mailings count.
    pub fn max_challenge_date(&self, contact_id: i64) -> Result<Option<NaiveDateTime>, DbError> {
        self.max_date_query(
            &format!(
                "SELECT MAX(h.history_date) FROM history h
                 WHERE h.contact_id = ?1 AND COALESCE(h.challenge, 0) = 1 AND {NOT_ATTEMPTED}"
            ),
            &[&contact_id],
        )
    }

    /// Latest thank: thank-flagged records or records of a task type
    /// registered for `thank`, excluding mass mailings and attempted results.
    pub fn max_thank_date(&self, contact_id: i64) -> Result<Option<NaiveDateTime>, DbError> {
        self.max_date_query(
            &format!(
                "SELECT MAX(h.history_date) FROM history h
                 WHERE h.contact_id = ?1 AND {NOT_MASS_MAILING} AND {NOT_ATTEMPTED}
                   AND (COALESCE(h.thank, 0) = 1 OR h.task_type_id IN (
                        SELECT task_type_id FROM task_type_last_fields WHERE last_field = 'thank'))"
            ),
            &[&contact_id],
        )
    }

    /// Challenge-flagged, non-attempted records dated on or after `since`
    /// (all of them when `since` is absent).
    pub fn count_challenges_since(
        &self,
        contact_id: i64,
        since: Option<NaiveDateTime>,
    ) -> Result<i64, DbError> {
        let since = since.map(|d| format_db_date(&d)).unwrap_or_default();
        Ok(self.conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM history h
                 WHERE h.contact_id = ?1 AND COALESCE(h.challenge, 0) = 1 AND {NOT_ATTEMPTED}
                   AND h.history_date >= ?2"
            ),
            params![contact_id, since],
            |row| row.get(0),
        )?)
    }
}
