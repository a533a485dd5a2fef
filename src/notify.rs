//! Pipeline notifications.
//!
//! Observers are registered once on the pipeline context and receive every
//! event synchronously on the thread that produced it. Delivery is
//! fire-and-forget: there is no back-pressure and an observer cannot stop
//! the pipeline.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::db::HistoryRecord;

/// Totals for one importer lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummary {
    pub added: u64,
    pub existing: u64,
    pub errors: u64,
    pub unresolved: u64,
    /// Existing records not surfaced to observers.
    pub skipped: u64,
    pub failed_messages: u64,
}

impl ImportSummary {
    /// No record errored and no message failed.
    pub fn is_clean(&self) -> bool {
        self.errors == 0 && self.failed_messages == 0
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PipelineEvent {
    #[serde(rename_all = "camelCase")]
    ImportStarted { account_id: String },
    #[serde(rename_all = "camelCase")]
    Progress {
        account_id: String,
        current: u64,
        total: u64,
    },
    #[serde(rename_all = "camelCase")]
    AccountImportComplete {
        account_id: String,
        fetched: u64,
        failed: u64,
    },
    /// Every message this account fetched has been imported.
    #[serde(rename_all = "camelCase")]
    AccountImportStopped { account_id: String, added: u64 },
    #[serde(rename_all = "camelCase")]
    RecordProcessed { record: HistoryRecord },
    /// A non-fatal failure. `account_id` names the account whose connection
    /// or message failed; it is absent only when no account is involved.
    #[serde(rename_all = "camelCase")]
    ImportError {
        account_id: Option<String>,
        message: String,
    },
    ImporterStarted,
    #[serde(rename_all = "camelCase")]
    ImporterStopped { summary: ImportSummary },
}

pub trait PipelineObserver: Send + Sync {
    fn on_event(&self, event: &PipelineEvent);
}

impl<F> PipelineObserver for F
where
    F: Fn(&PipelineEvent) + Send + Sync,
{
    fn on_event(&self, event: &PipelineEvent) {
        self(event)
    }
}

/// Forwards events into an mpsc channel. A dropped receiver is ignored.
struct ChannelObserver {
    sender: Mutex<Sender<PipelineEvent>>,
}

impl PipelineObserver for ChannelObserver {
    fn on_event(&self, event: &PipelineEvent) {
        let _ = self.sender.lock().send(event.clone());
    }
}

#[derive(Default)]
pub struct Observers {
    subscribers: RwLock<Vec<Arc<dyn PipelineObserver>>>,
}

impl Observers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, observer: Arc<dyn PipelineObserver>) {
        self.subscribers.write().push(observer);
    }

    /// Subscribe a channel and hand back its receiving end.
    pub fn channel(&self) -> Receiver<PipelineEvent> {
        let (sender, receiver) = mpsc::channel();
        self.subscribe(Arc::new(ChannelObserver {
            sender: Mutex::new(sender),
        }));
        receiver
    }

    pub fn emit(&self, event: PipelineEvent) {
        let subscribers = self.subscribers.read().clone();
        for subscriber in subscribers {
            subscriber.on_event(&event);
        }
    }
}
