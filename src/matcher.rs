//! Create-or-match: at most one stored history row per identity key.

use crate::db::{truncate_date, HistoryDb, HistoryRecord, IdentityKey, RecordStatus};
use crate::error::ImportError;
use crate::recalc;

/// Build the identity key, rejecting records that lack a contact or a date.
pub fn validate_identity_key(record: &HistoryRecord) -> Result<IdentityKey, ImportError> {
    let contact_id = record
        .contact_id
        .ok_or(ImportError::InvalidIdentityKey("contact id"))?;
    let date = record.date.ok_or(ImportError::InvalidIdentityKey("date"))?;
    Ok(IdentityKey {
        contact_id,
        task_type_id: record.task_type_id,
        date: truncate_date(date),
        result_code: record.result_code,
    })
}

enum Matched {
    Existing(HistoryRecord),
    Inserted(i64),
}

/// Persist `record` unless an equivalent row exists.
///
/// - New rows are inserted and propagated into the contact's aggregates in
///   one commit unit; the record is marked `Added` and gets its id.
/// - An existing row is left untouched; its values are copied into `record`
///   and it is marked `Exists`.
/// - A failed commit unit is rolled back and the record marked `Error` with
///   the cause attached. This is not returned as an `Err`.
///
/// Only a malformed identity key is an `Err`, raised before any lookup.
pub fn create_or_match(db: &HistoryDb, record: &mut HistoryRecord) -> Result<RecordStatus, ImportError> {
    let key = validate_identity_key(record)?;
    record.date = Some(key.date);

    let outcome = db.with_transaction(|tx| -> Result<Matched, ImportError> {
        if let Some(stored) = tx.find_history_by_key(&key)? {
            return Ok(Matched::Existing(stored));
        }
        let id = tx.insert_history(record)?;
        recalc::apply_new_record(tx, record)?;
        Ok(Matched::Inserted(id))
    });

    match outcome {
        Ok(Matched::Existing(stored)) => {
            record.copy_stored_values(&stored);
            record.mark(RecordStatus::Exists);
        }
        Ok(Matched::Inserted(id)) => {
            record.id = Some(id);
            record.mark(RecordStatus::Added);
        }
        Err(e) => {
            log::warn!(
                "Matcher: write for contact {} on {} rolled back: {}",
                key.contact_id,
                key.date,
                e
            );
            record.mark_error(e);
        }
    }
    Ok(record.status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_utils::test_db;
    use crate::db::{task_types, LastField, ResultCode};
    use chrono::{NaiveDate, NaiveDateTime};

    fn day(y: i32, m: u32, d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .and_then(|d| d.and_hms_opt(10, 0, 0))
            .expect("valid date")
    }

    fn email(contact: i64, date: NaiveDateTime, description: &str) -> HistoryRecord {
        HistoryRecord {
            contact_id: Some(contact),
            task_type_id: task_types::EMAIL,
            date: Some(date),
            description: description.to_string(),
            result_code: ResultCode::Done,
            ..Default::default()
        }
    }

    #[test]
    fn test_missing_contact_or_date_rejected() {
        let db = test_db();
        let mut no_contact = HistoryRecord {
            date: Some(day(2021, 3, 1)),
            ..Default::default()
        };
        assert!(matches!(
            create_or_match(&db, &mut no_contact),
            Err(ImportError::InvalidIdentityKey("contact id"))
        ));

        let mut no_date = HistoryRecord {
            contact_id: Some(1),
            ..Default::default()
        };
        assert!(matches!(
            create_or_match(&db, &mut no_date),
            Err(ImportError::InvalidIdentityKey("date"))
        ));
        assert_eq!(db.history_count().expect("count"), 0);
    }

    #[test]
    fn test_second_create_reports_exists_and_copies_stored_values() {
        let db = test_db();
        let contact = db.insert_contact("Bob Parr", &["parrb@metro.com"]).expect("contact");

        let mut first = email(contact, day(2021, 3, 1), "Gala follow-up");
        assert_eq!(create_or_match(&db, &mut first).expect("first"), RecordStatus::Added);
        assert!(first.id.is_some());

        let mut second = email(contact, day(2021, 3, 1), "Different subject");
        second.notes = "new notes".into();
        assert_eq!(create_or_match(&db, &mut second).expect("second"), RecordStatus::Exists);
        assert_eq!(second.id, first.id);
        assert_eq!(second.description, "Gala follow-up");
        assert_eq!(second.notes, "");
        assert_eq!(db.history_count().expect("count"), 1);
    }

    #[test]
    fn test_sub_second_dates_share_a_key() {
        let db = test_db();
        let contact = db.insert_contact("Bob Parr", &[]).expect("contact");
        let base = day(2021, 3, 1);
        let mut a = email(contact, base, "a");
        let mut b = email(
            contact,
            base + chrono::Duration::milliseconds(450),
            "b",
        );
        create_or_match(&db, &mut a).expect("a");
        assert_eq!(create_or_match(&db, &mut b).expect("b"), RecordStatus::Exists);
    }

    #[test]
    fn test_result_code_is_part_of_key() {
        let db = test_db();
        let contact = db.insert_contact("Bob Parr", &[]).expect("contact");
        let mut done = email(contact, day(2021, 3, 1), "x");
        let mut received = email(contact, day(2021, 3, 1), "x");
        received.result_code = ResultCode::Received;
        create_or_match(&db, &mut done).expect("done");
        assert_eq!(
            create_or_match(&db, &mut received).expect("received"),
            RecordStatus::Added
        );
    }

    #[test]
    fn test_added_record_updates_aggregates() {
        let db = test_db();
        let contact = db.insert_contact("Bob Parr", &[]).expect("contact");
        let mut record = email(contact, day(2021, 3, 1), "hello");
        create_or_match(&db, &mut record).expect("create");
        assert_eq!(
            db.get_last_field(contact, LastField::Letter).expect("read"),
            Some(day(2021, 3, 1))
        );
    }

    #[test]
    fn test_failed_write_rolls_back_and_marks_error() {
        let db = test_db();
        // Contact 999 does not exist, so the foreign key rejects the insert.
        let mut record = email(999, day(2021, 3, 1), "orphan");
        let status = create_or_match(&db, &mut record).expect("not an Err");
        assert_eq!(status, RecordStatus::Error);
        assert!(record.status_error.is_some());
        assert!(record.id.is_none());
        assert_eq!(db.history_count().expect("count"), 0);
    }
}
