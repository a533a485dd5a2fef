use chrono::NaiveDateTime;
use rusqlite::{params, OptionalExtension};

use super::*;

impl HistoryDb {
    // =========================================================================
    // Contacts
    // =========================================================================

    /// Insert a contact with its known addresses. Returns the new id.
    pub fn insert_contact(&self, name: &str, emails: &[&str]) -> Result<i64, DbError> {
        self.conn
            .execute("INSERT INTO contacts (name) VALUES (?1)", params![name])?;
        let id = self.conn.last_insert_rowid();
        for email in emails {
            self.add_contact_email(id, email)?;
        }
        Ok(id)
    }

    /// Attach an address to a contact. Addresses are stored lower-cased.
    pub fn add_contact_email(&self, contact_id: i64, email: &str) -> Result<(), DbError> {
        self.conn.execute(
            "INSERT OR IGNORE INTO contact_emails (contact_id, email) VALUES (?1, LOWER(TRIM(?2)))",
            params![contact_id, email],
        )?;
        Ok(())
    }

    /// Every contact carrying `email` (case-insensitive).
    pub fn contact_ids_for_email(&self, email: &str) -> Result<Vec<i64>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT contact_id FROM contact_emails
             WHERE email = LOWER(TRIM(?1)) ORDER BY contact_id",
        )?;
        let rows = stmt.query_map(params![email], |row| row.get::<_, i64>(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    pub fn get_contact_aggregates(&self, contact_id: i64) -> Result<Option<ContactAggregates>, DbError> {
        let row = self
            .conn
            .query_row(
                "SELECT last_activity, last_appointment, last_call, last_challenge, last_letter,
                        last_pre_call, last_thank, last_visit, challenges_since_last_gift
                 FROM contacts WHERE id = ?1",
                params![contact_id],
                |row| {
                    let mut dates: Vec<Option<String>> = Vec::with_capacity(8);
                    for idx in 0..8 {
                        dates.push(row.get(idx)?);
                    }
                    Ok((dates, row.get::<_, i64>(8)?))
                },
            )
            .optional()?;

        let Some((dates, challenges)) = row else {
            return Ok(None);
        };
        let mut parsed = Vec::with_capacity(dates.len());
        for value in dates {
            parsed.push(parse_optional_db_date(value)?);
        }
        Ok(Some(ContactAggregates {
            contact_id,
            last_activity: parsed[0],
            last_appointment: parsed[1],
            last_call: parsed[2],
            last_challenge: parsed[3],
            last_letter: parsed[4],
            last_pre_call: parsed[5],
            last_thank: parsed[6],
            last_visit: parsed[7],
            challenges_since_last_gift: challenges,
        }))
    }

    pub fn get_last_field(
        &self,
        contact_id: i64,
        field: LastField,
    ) -> Result<Option<NaiveDateTime>, DbError> {
        let value: Option<Option<String>> = self
            .conn
            .query_row(
                &format!("SELECT {} FROM contacts WHERE id = ?1", field.column()),
                params![contact_id],
                |row| row.get(0),
            )
            .optional()?;
        parse_optional_db_date(value.flatten())
    }

    /// Store a derived date. Only the recalculation engine calls this.
    pub(crate) fn set_last_field(
        &self,
        contact_id: i64,
        field: LastField,
        date: Option<NaiveDateTime>,
    ) -> Result<(), DbError> {
        self.conn.execute(
            &format!("UPDATE contacts SET {} = ?1 WHERE id = ?2", field.column()),
            params![date.map(|d| format_db_date(&d)), contact_id],
        )?;
        Ok(())
    }

    pub(crate) fn set_challenges_since_last_gift(&self, contact_id: i64, count: i64) -> Result<(), DbError> {
        self.conn.execute(
            "UPDATE contacts SET challenges_since_last_gift = ?1 WHERE id = ?2",
            params![count, contact_id],
        )?;
        Ok(())
    }

    pub fn get_last_gift_date(&self, contact_id: i64) -> Result<Option<NaiveDateTime>, DbError> {
        let value: Option<Option<String>> = self
            .conn
            .query_row(
                "SELECT last_gift_date FROM contacts WHERE id = ?1",
                params![contact_id],
                |row| row.get(0),
            )
            .optional()?;
        parse_optional_db_date(value.flatten())
    }

    /// Gifts are recorded elsewhere; this mirrors the date the gift ledger reports.
    pub fn set_last_gift_date(&self, contact_id: i64, date: Option<NaiveDateTime>) -> Result<(), DbError> {
        self.conn.execute(
            "UPDATE contacts SET last_gift_date = ?1 WHERE id = ?2",
            params![date.map(|d| format_db_date(&truncate_date(d))), contact_id],
        )?;
        Ok(())
    }
}
