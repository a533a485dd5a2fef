//! Message queue between account fetch loops and the importer.
//!
//! Every active account pushes onto one unbounded FIFO; a single importer
//! drains it. `dequeue` never blocks, the importer polls. The queue also
//! carries per-account progress counters that the UI reads as sums.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use serde::Serialize;

use crate::message::NormalizedMessage;

/// Fetch progress of one account within the current run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountProgress {
    pub current: u64,
    pub total: u64,
}

#[derive(Default)]
pub struct MessageQueue {
    messages: Mutex<VecDeque<NormalizedMessage>>,
    progress: Mutex<HashMap<String, AccountProgress>>,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, message: NormalizedMessage) {
        let mut messages = self.messages.lock();
        messages.push_back(message);
        log::debug!("MessageQueue: enqueued (depth {})", messages.len());
    }

    pub fn has_messages(&self) -> bool {
        !self.messages.lock().is_empty()
    }

    /// Oldest message, or `None` when empty.
    pub fn dequeue(&self) -> Option<NormalizedMessage> {
        self.messages.lock().pop_front()
    }

    /// Current queue depth (for diagnostics).
    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // -------------------------------------------------------------------------
    // Progress
    // -------------------------------------------------------------------------

    /// Zero an account's counters at the start of its run.
    pub fn begin_account(&self, account_id: &str) {
        self.progress
            .lock()
            .insert(account_id.to_string(), AccountProgress::default());
    }

    pub fn set_total(&self, account_id: &str, total: u64) {
        let mut progress = self.progress.lock();
        let entry = progress.entry(account_id.to_string()).or_default();
        entry.total = total;
    }

    /// Count one more message for the account. Returns its updated progress.
    pub fn advance(&self, account_id: &str) -> AccountProgress {
        let mut progress = self.progress.lock();
        let entry = progress.entry(account_id.to_string()).or_default();
        entry.current += 1;
        *entry
    }

    pub fn progress_for(&self, account_id: &str) -> AccountProgress {
        self.progress
            .lock()
            .get(account_id)
            .copied()
            .unwrap_or_default()
    }

    /// Messages fetched so far across all accounts.
    pub fn current_message_number(&self) -> u64 {
        self.progress.lock().values().map(|p| p.current).sum()
    }

    /// Messages to fetch across all accounts.
    pub fn total_messages(&self) -> u64 {
        self.progress.lock().values().map(|p| p.total).sum()
    }

    /// Forget all progress before a new run.
    pub fn reset_progress(&self) {
        self.progress.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageParts;
    use std::sync::Arc;
    use std::thread;

    fn msg(source: &str, name: &str) -> NormalizedMessage {
        NormalizedMessage::new(MessageParts {
            source_id: source.to_string(),
            source_name: name.to_string(),
            from_id: "parrb@metro.com".to_string(),
            ..Default::default()
        })
    }

    #[test]
    fn test_fifo_order() {
        let queue = MessageQueue::new();
        queue.enqueue(msg("a", "1"));
        queue.enqueue(msg("a", "2"));
        assert!(queue.has_messages());
        assert_eq!(queue.dequeue().map(|m| m.source_name().to_string()), Some("1".into()));
        assert_eq!(queue.dequeue().map(|m| m.source_name().to_string()), Some("2".into()));
        assert!(!queue.has_messages());
    }

    #[test]
    fn test_dequeue_empty_returns_none() {
        let queue = MessageQueue::new();
        assert!(queue.dequeue().is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_progress_sums_across_accounts() {
        let queue = MessageQueue::new();
        queue.begin_account("imap");
        queue.begin_account("gmail");
        queue.set_total("imap", 3);
        queue.set_total("gmail", 5);
        queue.advance("imap");
        queue.advance("gmail");
        let gmail = queue.advance("gmail");
        assert_eq!(gmail, AccountProgress { current: 2, total: 5 });
        assert_eq!(queue.current_message_number(), 3);
        assert_eq!(queue.total_messages(), 8);
    }

    #[test]
    fn test_begin_account_resets_previous_run() {
        let queue = MessageQueue::new();
        queue.begin_account("imap");
        queue.set_total("imap", 2);
        queue.advance("imap");
        queue.begin_account("imap");
        assert_eq!(queue.progress_for("imap"), AccountProgress::default());
        queue.reset_progress();
        assert_eq!(queue.total_messages(), 0);
    }

    #[test]
    fn test_concurrent_producers_keep_per_producer_order() {
        let queue = Arc::new(MessageQueue::new());
        let handles: Vec<_> = ["a", "b", "c"]
            .into_iter()
            .map(|source| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    for i in 0..50 {
                        queue.enqueue(msg(source, &i.to_string()));
                        queue.advance(source);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("producer");
        }

        assert_eq!(queue.len(), 150);
        assert_eq!(queue.current_message_number(), 150);
        let mut last_seen: HashMap<String, i32> = HashMap::new();
        while let Some(m) = queue.dequeue() {
            let n: i32 = m.source_name().parse().expect("number");
            let prev = last_seen.insert(m.source_id().to_string(), n);
            if let Some(prev) = prev {
                assert!(n > prev, "order within a producer must hold");
            }
        }
    }
}
