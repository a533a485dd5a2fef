//! Wiring for one import pipeline: N account fetch threads feeding one
//! importer thread through the shared queue.
//!
//! [`PipelineContext`] holds everything the threads share and is created
//! once per pipeline. [`Pipeline`] owns the worker handles.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::account::{Account, AccountProfile, FetchReport};
use crate::db::SharedDb;
use crate::error::PipelineError;
use crate::importer::{ContactResolver, DbContactResolver, Importer, MailConverter, RecordConverter};
use crate::notify::{ImportSummary, Observers, PipelineEvent, PipelineObserver};
use crate::queue::MessageQueue;
use crate::types::Config;
use crate::worker::{spawn_worker, StopToken, WorkerHandle};

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Importer sleep when the queue is empty.
    pub poll_interval: Duration,
    /// Surface records that already existed for every message.
    pub keep_existing_records: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            keep_existing_records: false,
        }
    }
}

impl PipelineOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
            keep_existing_records: config.keep_existing_records,
        }
    }
}

/// State shared by the account threads, the importer, and the owner.
pub struct PipelineContext {
    pub db: SharedDb,
    pub queue: MessageQueue,
    pub observers: Observers,
    pub options: PipelineOptions,
    profiles: RwLock<HashMap<String, AccountProfile>>,
    added_by_account: Mutex<HashMap<String, u64>>,
    pub(crate) busy: AtomicBool,
    pub(crate) added: AtomicU64,
}

impl PipelineContext {
    pub fn new(db: SharedDb, options: PipelineOptions) -> Self {
        Self {
            db,
            queue: MessageQueue::new(),
            observers: Observers::new(),
            options,
            profiles: RwLock::new(HashMap::new()),
            added_by_account: Mutex::new(HashMap::new()),
            busy: AtomicBool::new(false),
            added: AtomicU64::new(0),
        }
    }

    pub fn register_profile(&self, profile: AccountProfile) {
        self.profiles.write().insert(profile.id.clone(), profile);
    }

    /// The profile of a known account, or a bare one for an unknown id.
    pub fn profile_for(&self, account_id: &str) -> AccountProfile {
        self.profiles
            .read()
            .get(account_id)
            .cloned()
            .unwrap_or_else(|| AccountProfile::new(account_id))
    }

    /// Records added since the pipeline was created.
    pub fn added_count(&self) -> u64 {
        self.added.load(Ordering::SeqCst)
    }

    /// Records added from one account's messages in its current run.
    pub fn added_for(&self, account_id: &str) -> u64 {
        self.added_by_account
            .lock()
            .get(account_id)
            .copied()
            .unwrap_or(0)
    }

    pub(crate) fn record_added(&self, account_id: &str) {
        self.added.fetch_add(1, Ordering::SeqCst);
        *self
            .added_by_account
            .lock()
            .entry(account_id.to_string())
            .or_insert(0) += 1;
    }

    fn reset_added_for(&self, account_id: &str) {
        self.added_by_account.lock().remove(account_id);
    }

    /// True when nothing is queued and the importer holds no message.
    pub fn is_idle(&self) -> bool {
        // Queue first: a message leaves the queue only while busy is set.
        self.queue.is_empty() && !self.busy.load(Ordering::SeqCst)
    }
}

struct RunningAccount {
    stop: StopToken,
    handle: WorkerHandle<(Account, FetchReport)>,
}

pub struct Pipeline {
    ctx: Arc<PipelineContext>,
    resolver: Arc<dyn ContactResolver>,
    converter: Arc<dyn RecordConverter>,
    importer_stop: StopToken,
    importer: Option<WorkerHandle<ImportSummary>>,
    running: HashMap<String, RunningAccount>,
    /// Accounts whose fetch loop finished. They stay connected until shutdown.
    finished: HashMap<String, Account>,
}

impl Pipeline {
    pub fn new(db: SharedDb, options: PipelineOptions) -> Self {
        let resolver = Arc::new(DbContactResolver::new(db.clone()));
        Self {
            ctx: Arc::new(PipelineContext::new(db, options)),
            resolver,
            converter: Arc::new(MailConverter::default()),
            importer_stop: StopToken::new(),
            importer: None,
            running: HashMap::new(),
            finished: HashMap::new(),
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn ContactResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_converter(mut self, converter: Arc<dyn RecordConverter>) -> Self {
        self.converter = converter;
        self
    }

    pub fn context(&self) -> &Arc<PipelineContext> {
        &self.ctx
    }

    pub fn subscribe(&self, observer: Arc<dyn PipelineObserver>) {
        self.ctx.observers.subscribe(observer);
    }

    pub fn is_importer_running(&self) -> bool {
        self.importer.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Start the importer thread. A no-op while it is running.
    pub fn start_importer(&mut self) -> Result<(), PipelineError> {
        if self.is_importer_running() {
            return Ok(());
        }
        if let Some(previous) = self.importer.take() {
            previous.join();
        }
        self.importer_stop.reset();

        let importer = Importer::new(
            Arc::clone(&self.ctx),
            Arc::clone(&self.resolver),
            Arc::clone(&self.converter),
        );
        let stop = self.importer_stop.clone();
        self.importer = Some(spawn_worker("importer", move || importer.run(&stop))?);
        Ok(())
    }

    /// Start an account's fetch loop on its own thread. Disabled accounts are
    /// kept but not started.
    pub fn start_account(&mut self, account: Account) -> Result<(), PipelineError> {
        let id = account.id().to_string();
        if self.running.contains_key(&id) {
            return Err(PipelineError::AlreadyRunning(id));
        }
        self.ctx.register_profile(account.profile().clone());
        if !account.profile().enabled {
            log::info!("Pipeline: account {} is disabled, not importing", id);
            self.finished.insert(id, account);
            return Ok(());
        }
        if self.running.is_empty() {
            self.ctx.queue.reset_progress();
        }
        self.finished.remove(&id);
        self.ctx.reset_added_for(&id);

        let stop = account.stop_token();
        stop.reset();
        let ctx = Arc::clone(&self.ctx);
        let mut account = account;
        let handle = spawn_worker(format!("fetch-{id}"), move || {
            let report = account.run_fetch_loop(&ctx.queue, &ctx.observers);
            (account, report)
        })?;
        self.running.insert(id, RunningAccount { stop, handle });
        Ok(())
    }

    /// Ask one account to stop at its next message boundary.
    pub fn stop_account(&self, account_id: &str) -> bool {
        match self.running.get(account_id) {
            Some(running) => {
                running.stop.stop();
                true
            }
            None => false,
        }
    }

    /// Ask the importer to stop after the message it is working on.
    pub fn stop_importer(&self) {
        self.importer_stop.stop();
    }

    /// Wait for every running fetch loop. Finished accounts are kept.
    pub fn wait_for_accounts(&mut self) -> HashMap<String, FetchReport> {
        let mut reports = HashMap::new();
        for (id, running) in self.running.drain() {
            match running.handle.join() {
                Some((account, report)) => {
                    reports.insert(id.clone(), report);
                    self.finished.insert(id, account);
                }
                None => log::error!("Pipeline: fetch thread for {} died", id),
            }
        }
        reports
    }

    /// Block until the importer has drained the queue. Returns immediately
    /// if the importer is not running.
    pub fn wait_until_drained(&self) {
        while self.is_importer_running() && !self.ctx.is_idle() {
            thread::sleep(self.ctx.options.poll_interval.min(Duration::from_millis(50)));
        }
    }

    /// Finish the run: wait for the accounts, let the importer drain the
    /// queue, then stop it and collect its summary. Each account that ran
    /// gets an `AccountImportStopped` event with its final added-count.
    pub fn join(&mut self) -> ImportSummary {
        let reports = self.wait_for_accounts();
        self.wait_until_drained();

        let mut ids: Vec<String> = reports.into_keys().collect();
        ids.sort();
        for account_id in ids {
            let added = self.ctx.added_for(&account_id);
            log::info!("Pipeline: account {} finished with {} added", account_id, added);
            self.ctx
                .observers
                .emit(PipelineEvent::AccountImportStopped { account_id, added });
        }

        self.stop_importer();
        let summary = self
            .importer
            .take()
            .and_then(|handle| handle.join())
            .unwrap_or_default();
        log::info!(
            "Pipeline: run complete ({} added, {} existing)",
            summary.added,
            summary.existing
        );
        summary
    }

    /// An account whose fetch loop has finished.
    pub fn account(&self, account_id: &str) -> Option<&Account> {
        self.finished.get(account_id)
    }

    /// Take back a finished account.
    pub fn take_account(&mut self, account_id: &str) -> Option<Account> {
        self.finished.remove(account_id)
    }

    /// Let every running fetch loop finish, drain the queue, then
    /// disconnect every account.
    pub fn shutdown(mut self) -> ImportSummary {
        let summary = self.join();
        for (_, mut account) in self.finished.drain() {
            account.disconnect();
        }
        summary
    }

    /// Like [`Pipeline::shutdown`], but first asks every fetch loop to stop
    /// at its next message boundary. Messages already queued are imported.
    pub fn abort(self) -> ImportSummary {
        for running in self.running.values() {
            running.stop.stop();
        }
        self.shutdown()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::testing::FakeSource;
    use crate::account::{ConnectionState, MailSource, MessageContext};
    use crate::db::test_utils::test_db;
    use crate::db::{task_types, HistoryRecord, ResultCode};
    use crate::error::{ConnectError, FetchError};
    use crate::matcher::create_or_match;
    use crate::message::{MessageParts, NormalizedMessage};
    use chrono::{NaiveDate, NaiveDateTime};

    fn options() -> PipelineOptions {
        PipelineOptions {
            poll_interval: Duration::from_millis(5),
            keep_existing_records: false,
        }
    }

    fn account(id: &str, senders: &[&str]) -> Account {
        Account::generic(AccountProfile::new(id), Box::new(FakeSource::new(senders)))
    }

    #[test]
    fn test_two_accounts_one_importer() {
        let db = test_db().into_shared();
        {
            let db = db.lock();
            db.insert_contact("Bob Parr", &["parrb@metro.com"]).expect("bob");
            db.insert_contact("Helen Parr", &["helen@parr.org"]).expect("helen");
        }
        let mut pipeline = Pipeline::new(db.clone(), options());
        let events = pipeline.context().observers.channel();

        pipeline.start_importer().expect("importer");
        pipeline
            .start_account(account("work", &["parrb@metro.com", "helen@parr.org"]))
            .expect("work");
        pipeline
            .start_account(account("home", &["helen@parr.org", "nobody@x.org"]))
            .expect("home");

        let summary = pipeline.join();
        assert_eq!(summary.added + summary.existing, 3);
        assert_eq!(summary.unresolved, 1);
        assert_eq!(pipeline.context().queue.total_messages(), 4);
        assert_eq!(pipeline.context().queue.current_message_number(), 4);
        assert_eq!(
            pipeline.account("work").map(|a| a.state()),
            Some(ConnectionState::Connected)
        );

        let completes = events
            .try_iter()
            .filter(|e| matches!(e, PipelineEvent::AccountImportComplete { .. }))
            .count();
        assert_eq!(completes, 2);
        pipeline.shutdown();
    }

    #[test]
    fn test_same_account_twice_is_rejected() {
        let db = test_db().into_shared();
        let mut pipeline = Pipeline::new(db, options());
        pipeline.start_account(slow_account("work", 3)).expect("first");
        let second = pipeline.start_account(account("work", &[]));
        assert!(matches!(second, Err(PipelineError::AlreadyRunning(_))));
        pipeline.abort();
    }

    #[test]
    fn test_disabled_account_not_started() {
        let db = test_db().into_shared();
        let mut pipeline = Pipeline::new(db, options());
        let mut profile = AccountProfile::new("off");
        profile.enabled = false;
        pipeline
            .start_account(Account::generic(profile, Box::new(FakeSource::new(&["a@x.org"]))))
            .expect("start");
        assert_eq!(
            pipeline.account("off").map(|a| a.state()),
            Some(ConnectionState::Disconnected)
        );
        assert!(!pipeline.stop_account("off"));
    }

    #[test]
    fn test_join_without_importer_returns_empty_summary() {
        let db = test_db().into_shared();
        let mut pipeline = Pipeline::new(db, options());
        assert_eq!(pipeline.join(), ImportSummary::default());
    }

    /// Replays prepared messages in order.
    struct ScriptedSource {
        messages: Vec<MessageParts>,
        connect_delay: Duration,
    }

    impl ScriptedSource {
        fn new(messages: Vec<MessageParts>) -> Self {
            Self {
                messages,
                connect_delay: Duration::ZERO,
            }
        }
    }

    impl MailSource for ScriptedSource {
        fn connect(&mut self) -> Result<(), ConnectError> {
            thread::sleep(self.connect_delay);
            Ok(())
        }

        fn load_message_list(&mut self) -> Result<usize, FetchError> {
            Ok(self.messages.len())
        }

        fn fetch(&mut self, position: usize, ctx: &MessageContext) -> Result<NormalizedMessage, FetchError> {
            let mut parts = self.messages[position].clone();
            parts.source_id = ctx.source_id.clone();
            parts.source_name = position.to_string();
            parts.treat_existing_as_history = ctx.treat_existing_as_history;
            Ok(NormalizedMessage::new(parts))
        }

        fn disconnect(&mut self) {}
    }

    fn mail(from: &str, date: NaiveDateTime) -> MessageParts {
        MessageParts {
            from_id: from.into(),
            date: Some(date),
            subject: "Re: spring appeal".into(),
            ..Default::default()
        }
    }

    fn day(y: i32, m: u32, d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .and_then(|d| d.and_hms_opt(10, 30, 0))
            .expect("valid date")
    }

    fn run(db: &SharedDb, accounts: Vec<(&str, Vec<MessageParts>)>) -> ImportSummary {
        let mut pipeline = Pipeline::new(db.clone(), options());
        pipeline.start_importer().expect("importer");
        for (id, messages) in accounts {
            let source = ScriptedSource::new(messages);
            pipeline
                .start_account(Account::generic(AccountProfile::new(id), Box::new(source)))
                .expect("account");
        }
        pipeline.shutdown()
    }

    fn slow_account(id: &str, count: u32) -> Account {
        let messages = (1..=count)
            .map(|d| mail("parrb@metro.com", day(2021, 3, d)))
            .collect();
        let source = ScriptedSource {
            messages,
            connect_delay: Duration::from_millis(30),
        };
        Account::generic(AccountProfile::new(id), Box::new(source))
    }

    #[test]
    fn test_shutdown_right_after_start_imports_everything() {
        let db = test_db().into_shared();
        db.lock()
            .insert_contact("Bob Parr", &["parrb@metro.com"])
            .expect("bob");
        let mut pipeline = Pipeline::new(db.clone(), options());
        let events = pipeline.context().observers.channel();
        pipeline.start_importer().expect("importer");
        pipeline.start_account(slow_account("work", 5)).expect("account");

        let summary = pipeline.shutdown();
        assert_eq!(summary.added, 5);
        assert_eq!(db.lock().history_count().expect("count"), 5);

        let stopped: Vec<_> = events
            .try_iter()
            .filter_map(|e| match e {
                PipelineEvent::AccountImportStopped { account_id, added } => Some((account_id, added)),
                _ => None,
            })
            .collect();
        assert_eq!(stopped, vec![("work".to_string(), 5)]);
    }

    #[test]
    fn test_abort_stops_fetch_loops_at_next_boundary() {
        let db = test_db().into_shared();
        db.lock()
            .insert_contact("Bob Parr", &["parrb@metro.com"])
            .expect("bob");
        let mut pipeline = Pipeline::new(db.clone(), options());
        pipeline.start_importer().expect("importer");
        pipeline.start_account(slow_account("work", 5)).expect("account");

        let summary = pipeline.abort();
        assert_eq!(summary.added, 0);
        assert_eq!(db.lock().history_count().expect("count"), 0);
    }

    #[test]
    fn test_rerun_is_idempotent_and_moves_aggregates_once() {
        let db = test_db().into_shared();
        let bob = {
            let db = db.lock();
            let bob = db.insert_contact("Bob Parr", &["parrb@metro.com"]).expect("bob");
            let mut letter = HistoryRecord {
                contact_id: Some(bob),
                task_type_id: task_types::LETTER,
                date: Some(day(2020, 1, 1)),
                result_code: ResultCode::Done,
                ..Default::default()
            };
            create_or_match(&db, &mut letter).expect("seed");
            bob
        };

        let first = run(&db, vec![("work", vec![mail("parrb@metro.com", day(2021, 3, 1))])]);
        assert_eq!(first.added, 1);
        let aggregates = db.lock().get_contact_aggregates(bob).expect("read").expect("row");
        assert_eq!(aggregates.last_letter, Some(day(2021, 3, 1)));
        assert_eq!(aggregates.last_activity, Some(day(2021, 3, 1)));

        let second = run(&db, vec![("work", vec![mail("parrb@metro.com", day(2021, 3, 1))])]);
        assert_eq!(second.added, 0);
        assert_eq!(second.existing, 1);
        assert_eq!(db.lock().history_count().expect("count"), 2);
    }

    #[test]
    fn test_same_message_from_two_accounts_written_once() {
        let db = test_db().into_shared();
        db.lock()
            .insert_contact("Helen Parr", &["helen@parr.org"])
            .expect("helen");

        let summary = run(
            &db,
            vec![
                ("work", vec![mail("helen@parr.org", day(2021, 5, 5))]),
                ("home", vec![mail("Helen@Parr.org", day(2021, 5, 5))]),
            ],
        );
        assert_eq!(summary.added, 1);
        assert_eq!(summary.existing, 1);
        assert_eq!(db.lock().history_count().expect("count"), 1);
    }

    #[test]
    fn test_message_without_date_counts_as_error() {
        let db = test_db().into_shared();
        db.lock()
            .insert_contact("Bob Parr", &["parrb@metro.com"])
            .expect("bob");
        let undated = MessageParts {
            from_id: "parrb@metro.com".into(),
            ..Default::default()
        };

        let summary = run(&db, vec![("work", vec![undated])]);
        assert_eq!(summary.added, 0);
        assert_eq!(summary.errors, 1);
        assert_eq!(summary.failed_messages, 0);
        assert_eq!(db.lock().history_count().expect("count"), 0);
    }

    #[test]
    fn test_profile_for_unknown_account_is_bare() {
        let ctx = PipelineContext::new(test_db().into_shared(), options());
        let profile = ctx.profile_for("ghost");
        assert_eq!(profile.id, "ghost");
        assert!(profile.my_addresses.is_empty());
        assert!(ctx.is_idle());
    }
}
