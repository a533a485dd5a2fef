//! The single writer loop: drains the message queue and turns each message
//! into history records.
//!
//! Per message:
//! 1. convert it into candidate records
//! 2. resolve each candidate's contact from its address
//! 3. create-or-match resolved candidates
//! 4. notify observers, unless the record already existed and nobody asked
//!    to see existing records
//!
//! A failure anywhere in one message is logged, reported, and counted; the
//! loop moves on to the next message.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

use crate::account::AccountProfile;
use crate::db::{task_types, HistoryRecord, RecordStatus, ResultCode, SharedDb};
use crate::error::ImportError;
use crate::matcher::create_or_match;
use crate::message::NormalizedMessage;
use crate::notify::{ImportSummary, PipelineEvent};
use crate::pipeline::PipelineContext;
use crate::worker::StopToken;

/// Longest description stored for an imported message.
pub const MAX_DESCRIPTION_CHARS: usize = 150;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContactMatch {
    Found(i64),
    NotFound,
    Ambiguous(Vec<i64>),
}

/// Maps a mail address to a contact.
pub trait ContactResolver: Send + Sync {
    fn resolve_contact_id(&self, address: &str) -> Result<ContactMatch, ImportError>;
}

/// Looks addresses up in `contact_emails`.
pub struct DbContactResolver {
    db: SharedDb,
}

impl DbContactResolver {
    pub fn new(db: SharedDb) -> Self {
        Self { db }
    }
}

impl ContactResolver for DbContactResolver {
    fn resolve_contact_id(&self, address: &str) -> Result<ContactMatch, ImportError> {
        let ids = self.db.lock().contact_ids_for_email(address)?;
        Ok(match ids.as_slice() {
            [] => ContactMatch::NotFound,
            [id] => ContactMatch::Found(*id),
            _ => ContactMatch::Ambiguous(ids),
        })
    }
}

/// A record to be written for `address`, once its contact is known.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub address: String,
    pub record: HistoryRecord,
}

/// Turns one message into the records it implies.
pub trait RecordConverter: Send + Sync {
    fn convert(&self, message: &NormalizedMessage, profile: &AccountProfile) -> Result<Vec<Candidate>, ImportError>;
}

/// One email record per correspondent.
///
/// Mail from the account owner is recorded against each recipient; any other
/// mail against its sender. Ignore-listed addresses produce nothing.
#[derive(Debug, Clone)]
pub struct MailConverter {
    pub task_type_id: i64,
    pub result_code: ResultCode,
}

impl Default for MailConverter {
    fn default() -> Self {
        Self {
            task_type_id: task_types::EMAIL,
            result_code: ResultCode::Done,
        }
    }
}

impl MailConverter {
    fn record_for(&self, message: &NormalizedMessage) -> HistoryRecord {
        HistoryRecord {
            task_type_id: self.task_type_id,
            date: message.date(),
            description: truncate_chars(message.subject(), MAX_DESCRIPTION_CHARS),
            notes: message.body().to_string(),
            result_code: self.result_code,
            ..Default::default()
        }
    }
}

impl RecordConverter for MailConverter {
    fn convert(&self, message: &NormalizedMessage, profile: &AccountProfile) -> Result<Vec<Candidate>, ImportError> {
        let sender = message.from_id();
        if sender.is_empty() {
            return Err(ImportError::Conversion(format!(
                "message {} has no sender",
                message.source_name()
            )));
        }
        if profile.is_ignored(sender) {
            log::debug!("Importer: ignoring message from {}", sender);
            return Ok(Vec::new());
        }

        if !profile.is_mine(sender) {
            return Ok(vec![Candidate {
                address: sender.to_string(),
                record: self.record_for(message),
            }]);
        }

        let mut seen = std::collections::HashSet::new();
        Ok(message
            .recipients()
            .iter()
            .filter(|r| !profile.is_mine(&r.email) && !profile.is_ignored(&r.email))
            .filter(|r| seen.insert(r.email.clone()))
            .map(|r| Candidate {
                address: r.email.clone(),
                record: self.record_for(message),
            })
            .collect())
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].trim_end().to_string(),
        None => text.to_string(),
    }
}

pub struct Importer {
    ctx: Arc<PipelineContext>,
    resolver: Arc<dyn ContactResolver>,
    converter: Arc<dyn RecordConverter>,
}

impl Importer {
    pub fn new(
        ctx: Arc<PipelineContext>,
        resolver: Arc<dyn ContactResolver>,
        converter: Arc<dyn RecordConverter>,
    ) -> Self {
        Self {
            ctx,
            resolver,
            converter,
        }
    }

    /// Drain the queue until `stop` is set. Idles with a short sleep when the
    /// queue is empty.
    pub fn run(&self, stop: &StopToken) -> ImportSummary {
        log::info!("Importer: started");
        self.ctx.observers.emit(PipelineEvent::ImporterStarted);
        let mut summary = ImportSummary::default();

        while !stop.is_stopped() {
            // Busy is raised before dequeue so "queue empty and not busy"
            // never misses a message in flight.
            self.ctx.busy.store(true, Ordering::SeqCst);
            match self.ctx.queue.dequeue() {
                Some(message) => {
                    if let Err(e) = self.import_message(&message, &mut summary) {
                        summary.failed_messages += 1;
                        log::warn!(
                            "Importer: message {} from {} failed: {}",
                            message.source_name(),
                            message.source_id(),
                            e
                        );
                        self.ctx.observers.emit(PipelineEvent::ImportError {
                            account_id: Some(message.source_id().to_string()),
                            message: e.to_string(),
                        });
                    }
                    self.ctx.busy.store(false, Ordering::SeqCst);
                }
                None => {
                    self.ctx.busy.store(false, Ordering::SeqCst);
                    thread::sleep(self.ctx.options.poll_interval);
                }
            }
        }

        log::info!(
            "Importer: stopped ({} added, {} existing, {} unresolved, {} errors, {} failed messages)",
            summary.added,
            summary.existing,
            summary.unresolved,
            summary.errors,
            summary.failed_messages
        );
        self.ctx
            .observers
            .emit(PipelineEvent::ImporterStopped { summary });
        summary
    }

    /// Convert, resolve, and write every record one message implies.
    ///
    /// A failure on one candidate marks that record `Error` and moves on to
    /// the next; only a message that cannot be converted at all is an `Err`.
    pub fn import_message(
        &self,
        message: &NormalizedMessage,
        summary: &mut ImportSummary,
    ) -> Result<(), ImportError> {
        let profile = self.ctx.profile_for(message.source_id());
        let candidates = self.converter.convert(message, &profile)?;

        for Candidate { address, mut record } in candidates {
            if record.status == RecordStatus::None {
                if let Err(e) = self.write_candidate(&address, &mut record) {
                    log::warn!(
                        "Importer: record for {} in message {} failed: {}",
                        address,
                        message.source_name(),
                        e
                    );
                    self.ctx.observers.emit(PipelineEvent::ImportError {
                        account_id: Some(message.source_id().to_string()),
                        message: e.to_string(),
                    });
                    record.mark_error(e);
                }
            }

            match record.status {
                RecordStatus::Added => {
                    summary.added += 1;
                    self.ctx.record_added(message.source_id());
                }
                RecordStatus::Exists => summary.existing += 1,
                RecordStatus::ContactNotFound | RecordStatus::MultipleContactsFound => {
                    summary.unresolved += 1
                }
                RecordStatus::Error => summary.errors += 1,
                RecordStatus::None => {}
            }

            if record.status == RecordStatus::Exists
                && !message.treat_existing_as_history()
                && !self.ctx.options.keep_existing_records
            {
                summary.skipped += 1;
                continue;
            }
            self.ctx
                .observers
                .emit(PipelineEvent::RecordProcessed { record });
        }
        Ok(())
    }

    fn write_candidate(&self, address: &str, record: &mut HistoryRecord) -> Result<(), ImportError> {
        match self.resolver.resolve_contact_id(address)? {
            ContactMatch::Found(contact_id) => {
                record.contact_id = Some(contact_id);
                let db = self.ctx.db.lock();
                create_or_match(&db, record)?;
                if record.status == RecordStatus::Error {
                    log::warn!(
                        "Importer: record for {} not written: {}",
                        address,
                        record.status_error.as_deref().unwrap_or("unknown error")
                    );
                }
            }
            ContactMatch::NotFound => {
                log::debug!("Importer: no contact for {}", address);
                record.mark(RecordStatus::ContactNotFound);
            }
            ContactMatch::Ambiguous(ids) => {
                log::debug!("Importer: {} matches contacts {:?}", address, ids);
                record.mark(RecordStatus::MultipleContactsFound);
            }
        }
        Ok(())
    }
}
