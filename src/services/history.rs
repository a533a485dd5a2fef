// History edit service
// Edits to stored history records, each with its aggregate recalculation in
// the same commit unit.

use crate::db::{HistoryDb, HistoryFlag, HistoryRecord, LastField, ResultCode};
use crate::error::EditError;
use crate::recalc;

fn load(db: &HistoryDb, id: i64) -> Result<(HistoryRecord, i64), EditError> {
    let record = db.get_history(id)?.ok_or(EditError::NotFound(id))?;
    let contact_id = record
        .contact_id
        .ok_or(EditError::Db(crate::db::DbError::MissingValue("contact_id")))?;
    Ok((record, contact_id))
}

fn reload(db: &HistoryDb, id: i64) -> Result<HistoryRecord, EditError> {
    db.get_history(id)?.ok_or(EditError::NotFound(id))
}

/// Flip the challenge flag and refresh `last_challenge` and the challenge counter.
pub fn set_challenge(db: &HistoryDb, id: i64, value: bool) -> Result<HistoryRecord, EditError> {
    db.with_transaction(|tx| {
        let (record, contact_id) = load(tx, id)?;
        tx.set_history_flag(id, HistoryFlag::Challenge, value)?;

        if value && record.result_code != ResultCode::Attempted {
            recalc::update(tx, contact_id, LastField::Challenge, record.date, false)?;
        } else {
            recalc::recalculate(tx, contact_id, LastField::Challenge)?;
        }
        recalc::recalculate_challenges_since_last_gift(tx, contact_id)?;
        reload(tx, id)
    })
}

/// Flip the thank flag and refresh `last_thank`.
pub fn set_thank(db: &HistoryDb, id: i64, value: bool) -> Result<HistoryRecord, EditError> {
    db.with_transaction(|tx| {
        let (record, contact_id) = load(tx, id)?;
        tx.set_history_flag(id, HistoryFlag::Thank, value)?;

        if value && !record.mass_mailing && record.result_code != ResultCode::Attempted {
            recalc::update(tx, contact_id, LastField::Thank, record.date, false)?;
        } else {
            recalc::recalculate(tx, contact_id, LastField::Thank)?;
        }
        reload(tx, id)
    })
}

/// Flip the mass-mailing flag. Mass mailings are excluded from nearly every
/// aggregate, so the whole contact is recomputed.
pub fn set_mass_mailing(db: &HistoryDb, id: i64, value: bool) -> Result<HistoryRecord, EditError> {
    db.with_transaction(|tx| {
        let (_, contact_id) = load(tx, id)?;
        tx.set_history_flag(id, HistoryFlag::MassMailing, value)?;
        recalc::recalculate_all(tx, contact_id)?;
        log::info!(
            "HistoryService: record {} mass mailing = {}, contact {} recomputed",
            id,
            value,
            contact_id
        );
        reload(tx, id)
    })
}

pub fn set_description(db: &HistoryDb, id: i64, description: &str) -> Result<HistoryRecord, EditError> {
    db.with_transaction(|tx| {
        load(tx, id)?;
        tx.set_history_description(id, description)?;
        reload(tx, id)
    })
}

pub fn set_notes(db: &HistoryDb, id: i64, notes: &str) -> Result<HistoryRecord, EditError> {
    db.with_transaction(|tx| {
        load(tx, id)?;
        tx.set_history_notes(id, notes)?;
        reload(tx, id)
    })
}

/// Delete a record and recompute every aggregate of its contact.
pub fn delete_record(db: &HistoryDb, id: i64) -> Result<(), EditError> {
    db.with_transaction(|tx| {
        let (_, contact_id) = load(tx, id)?;
        tx.delete_history(id)?;
        recalc::recalculate_all(tx, contact_id)?;
        log::info!("HistoryService: deleted record {} of contact {}", id, contact_id);
        Ok(())
    })
}
