//! Derived per-contact aggregate fields.
//!
//! Two modes per field:
//! - `update` writes a candidate date when forced, when nothing is stored, or
//!   when it is newer than what is stored. A missing date means "recompute".
//! - `recalculate` re-derives a field from the contact's history rows.
//!
//! Every change to a contributing field re-derives `last_activity`. None of
//! these functions open a transaction: callers run them inside the commit
//! unit of the write that triggered them, so a recalculation failure rolls
//! that write back too.

use chrono::NaiveDateTime;

use crate::db::{DbError, HistoryDb, HistoryRecord, LastField, ResultCode};

/// Direct update of one derived field.
pub fn update(
    db: &HistoryDb,
    contact_id: i64,
    field: LastField,
    date: Option<NaiveDateTime>,
    force: bool,
) -> Result<(), DbError> {
    let Some(date) = date else {
        return recalculate(db, contact_id, field);
    };

    let stored = db.get_last_field(contact_id, field)?;
    let newer = stored.map_or(true, |current| date > current);
    if force || newer {
        db.set_last_field(contact_id, field, Some(date))?;
        log::debug!(
            "Recalc: contact {} {} -> {}",
            contact_id,
            field.column(),
            date
        );
    }

    if field != LastField::Activity {
        recalculate_activity(db, contact_id)?;
    }
    Ok(())
}

/// Re-derive one field from history and store the result, which may be empty.
pub fn recalculate(db: &HistoryDb, contact_id: i64, field: LastField) -> Result<(), DbError> {
    if field == LastField::Activity {
        return recalculate_activity(db, contact_id);
    }

    let derived = derive(db, contact_id, field)?;
    db.set_last_field(contact_id, field, derived)?;
    recalculate_activity(db, contact_id)
}

/// Re-derive every field plus the challenge counter.
pub fn recalculate_all(db: &HistoryDb, contact_id: i64) -> Result<(), DbError> {
    for field in LastField::CONTRIBUTING {
        let derived = derive(db, contact_id, field)?;
        db.set_last_field(contact_id, field, derived)?;
    }
    recalculate_activity(db, contact_id)?;
    recalculate_challenges_since_last_gift(db, contact_id)?;
    log::debug!("Recalc: contact {} fully recomputed", contact_id);
    Ok(())
}

/// Count of non-attempted challenge records dated on or after the last gift.
pub fn recalculate_challenges_since_last_gift(db: &HistoryDb, contact_id: i64) -> Result<(), DbError> {
    let last_gift = db.get_last_gift_date(contact_id)?;
    let count = db.count_challenges_since(contact_id, last_gift)?;
    db.set_challenges_since_last_gift(contact_id, count)
}

/// Propagate a freshly inserted record into its contact's aggregates.
pub fn apply_new_record(db: &HistoryDb, record: &HistoryRecord) -> Result<(), DbError> {
    let contact_id = record.contact_id.ok_or(DbError::MissingValue("contact_id"))?;
    if record.result_code == ResultCode::Attempted {
        return Ok(());
    }

    if !record.mass_mailing {
        for field in db.last_fields_for_task_type(record.task_type_id)? {
            update(db, contact_id, field, record.date, false)?;
        }
    }

    if record.challenge {
        update(db, contact_id, LastField::Challenge, record.date, false)?;
        recalculate_challenges_since_last_gift(db, contact_id)?;
    }

    if record.thank && !record.mass_mailing {
        update(db, contact_id, LastField::Thank, record.date, false)?;
    }
    Ok(())
}

fn derive(db: &HistoryDb, contact_id: i64, field: LastField) -> Result<Option<NaiveDateTime>, DbError> {
    match field {
        LastField::Activity => activity_from_fields(db, contact_id),
        LastField::Challenge => db.max_challenge_date(contact_id),
        LastField::Thank => db.max_thank_date(contact_id),
        other => db.max_registered_history_date(contact_id, other),
    }
}

fn activity_from_fields(db: &HistoryDb, contact_id: i64) -> Result<Option<NaiveDateTime>, DbError> {
    let Some(aggregates) = db.get_contact_aggregates(contact_id)? else {
        return Ok(None);
    };
    // Appointment seeds the maximum; CONTRIBUTING lists it first.
    let mut latest = aggregates.get(LastField::Appointment);
    for field in &LastField::CONTRIBUTING[1..] {
        latest = match (latest, aggregates.get(*field)) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }
    Ok(latest)
}

fn recalculate_activity(db: &HistoryDb, contact_id: i64) -> Result<(), DbError> {
    let latest = activity_from_fields(db, contact_id)?;
    db.set_last_field(contact_id, LastField::Activity, latest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::task_types;
    use crate::db::test_utils::test_db;
    use chrono::NaiveDate;

    fn day(y: i32, m: u32, d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .and_then(|d| d.and_hms_opt(12, 0, 0))
            .expect("valid date")
    }

    fn insert(db: &HistoryDb, contact: i64, task_type_id: i64, date: NaiveDateTime) -> HistoryRecord {
        let mut record = HistoryRecord {
            contact_id: Some(contact),
            task_type_id,
            date: Some(date),
            result_code: ResultCode::Done,
            ..Default::default()
        };
        record.id = Some(db.insert_history(&record).expect("insert"));
        record
    }

    #[test]
    fn test_update_non_force_keeps_newer_stored_value() {
        let db = test_db();
        let contact = db.insert_contact("Bob Parr", &[]).expect("contact");
        update(&db, contact, LastField::Letter, Some(day(2021, 3, 1)), false).expect("update");
        update(&db, contact, LastField::Letter, Some(day(2020, 1, 1)), false).expect("update");
        assert_eq!(
            db.get_last_field(contact, LastField::Letter).expect("read"),
            Some(day(2021, 3, 1))
        );

        update(&db, contact, LastField::Letter, Some(day(2022, 6, 1)), false).expect("update");
        assert_eq!(
            db.get_last_field(contact, LastField::Letter).expect("read"),
            Some(day(2022, 6, 1))
        );
    }

    #[test]
    fn test_update_force_overwrites_with_older_date() {
        let db = test_db();
        let contact = db.insert_contact("Bob Parr", &[]).expect("contact");
        update(&db, contact, LastField::Visit, Some(day(2021, 3, 1)), false).expect("update");
        update(&db, contact, LastField::Visit, Some(day(2019, 5, 5)), true).expect("update");
        let aggregates = db.get_contact_aggregates(contact).expect("read").expect("row");
        assert_eq!(aggregates.last_visit, Some(day(2019, 5, 5)));
        assert_eq!(aggregates.last_activity, Some(day(2019, 5, 5)));
    }

    #[test]
    fn test_update_without_date_recomputes_instead_of_clearing() {
        let db = test_db();
        let contact = db.insert_contact("Bob Parr", &[]).expect("contact");
        insert(&db, contact, task_types::LETTER, day(2020, 1, 1));
        insert(&db, contact, task_types::EMAIL, day(2020, 7, 4));
        db.set_last_field(contact, LastField::Letter, Some(day(2030, 1, 1)))
            .expect("seed");

        update(&db, contact, LastField::Letter, None, false).expect("update");
        let stored = db.get_last_field(contact, LastField::Letter).expect("read");
        assert_eq!(stored, Some(day(2020, 7, 4)));
        assert_eq!(stored, derive(&db, contact, LastField::Letter).expect("derive"));
    }

    #[test]
    fn test_activity_is_max_of_contributing_fields() {
        let db = test_db();
        let contact = db.insert_contact("Helen Parr", &[]).expect("contact");
        update(&db, contact, LastField::Call, Some(day(2021, 1, 1)), false).expect("call");
        update(&db, contact, LastField::Thank, Some(day(2021, 9, 9)), false).expect("thank");
        update(&db, contact, LastField::Appointment, Some(day(2020, 2, 2)), false).expect("appt");
        update(&db, contact, LastField::Thank, Some(day(2018, 1, 1)), true).expect("thank");

        let aggregates = db.get_contact_aggregates(contact).expect("read").expect("row");
        let expected = LastField::CONTRIBUTING
            .iter()
            .filter_map(|f| aggregates.get(*f))
            .max();
        assert_eq!(aggregates.last_activity, expected);
        assert_eq!(aggregates.last_activity, Some(day(2021, 1, 1)));
    }

    #[test]
    fn test_activity_seeded_without_appointment() {
        let db = test_db();
        let contact = db.insert_contact("Dash Parr", &[]).expect("contact");
        update(&db, contact, LastField::PreCall, Some(day(2022, 4, 4)), false).expect("update");
        assert_eq!(
            db.get_last_field(contact, LastField::Activity).expect("read"),
            Some(day(2022, 4, 4))
        );
    }

    #[test]
    fn test_apply_new_record_updates_registered_fields() {
        let db = test_db();
        let contact = db.insert_contact("Bob Parr", &[]).expect("contact");
        db.set_last_field(contact, LastField::Letter, Some(day(2020, 1, 1)))
            .expect("seed");
        let record = insert(&db, contact, task_types::EMAIL, day(2021, 3, 1));

        apply_new_record(&db, &record).expect("apply");
        let aggregates = db.get_contact_aggregates(contact).expect("read").expect("row");
        assert_eq!(aggregates.last_letter, Some(day(2021, 3, 1)));
        assert_eq!(aggregates.last_activity, Some(day(2021, 3, 1)));
    }

    #[test]
    fn test_apply_attempted_challenge_changes_nothing() {
        let db = test_db();
        let contact = db.insert_contact("Bob Parr", &[]).expect("contact");
        let mut record = HistoryRecord {
            contact_id: Some(contact),
            task_type_id: task_types::CALL,
            date: Some(day(2021, 5, 5)),
            result_code: ResultCode::Attempted,
            challenge: true,
            ..Default::default()
        };
        record.id = Some(db.insert_history(&record).expect("insert"));

        apply_new_record(&db, &record).expect("apply");
        let aggregates = db.get_contact_aggregates(contact).expect("read").expect("row");
        assert_eq!(aggregates.last_challenge, None);
        assert_eq!(aggregates.last_call, None);
        assert_eq!(aggregates.challenges_since_last_gift, 0);
    }

    #[test]
    fn test_mass_mailing_skips_registered_fields_but_counts_challenge() {
        let db = test_db();
        let contact = db.insert_contact("Bob Parr", &[]).expect("contact");
        let mut record = HistoryRecord {
            contact_id: Some(contact),
            task_type_id: task_types::LETTER,
            date: Some(day(2021, 5, 5)),
            result_code: ResultCode::Done,
            challenge: true,
            thank: true,
            mass_mailing: true,
            ..Default::default()
        };
        record.id = Some(db.insert_history(&record).expect("insert"));

        apply_new_record(&db, &record).expect("apply");
        let aggregates = db.get_contact_aggregates(contact).expect("read").expect("row");
        assert_eq!(aggregates.last_letter, None);
        assert_eq!(aggregates.last_thank, None);
        assert_eq!(aggregates.last_challenge, Some(day(2021, 5, 5)));
        assert_eq!(aggregates.challenges_since_last_gift, 1);
    }

    #[test]
    fn test_challenges_since_last_gift_counts_from_gift_date() {
        let db = test_db();
        let contact = db.insert_contact("Bob Parr", &[]).expect("contact");
        for date in [day(2020, 1, 1), day(2021, 1, 1), day(2021, 6, 1)] {
            let mut record = HistoryRecord {
                contact_id: Some(contact),
                task_type_id: task_types::CALL,
                date: Some(date),
                result_code: ResultCode::Done,
                challenge: true,
                ..Default::default()
            };
            record.id = Some(db.insert_history(&record).expect("insert"));
        }
        db.set_last_gift_date(contact, Some(day(2021, 1, 1))).expect("gift");

        recalculate_challenges_since_last_gift(&db, contact).expect("count");
        let aggregates = db.get_contact_aggregates(contact).expect("read").expect("row");
        assert_eq!(aggregates.challenges_since_last_gift, 2);
    }

    #[test]
    fn test_recalculate_all_clears_fields_without_sources() {
        let db = test_db();
        let contact = db.insert_contact("Bob Parr", &[]).expect("contact");
        db.set_last_field(contact, LastField::Visit, Some(day(2021, 1, 1)))
            .expect("seed");
        insert(&db, contact, task_types::CALL, day(2020, 3, 3));

        recalculate_all(&db, contact).expect("recalc");
        let aggregates = db.get_contact_aggregates(contact).expect("read").expect("row");
        assert_eq!(aggregates.last_visit, None);
        assert_eq!(aggregates.last_call, Some(day(2020, 3, 3)));
        assert_eq!(aggregates.last_activity, Some(day(2020, 3, 3)));
    }
}
