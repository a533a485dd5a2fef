//! DonorSync importer.
//!
//! Reads `~/.donorsync/config.json`, opens the history database, runs one
//! fetch thread per enabled account plus the importer, and prints the run
//! summary as JSON.

use std::process::ExitCode;
use std::sync::Arc;

use donorsync_lib::account::imap::{EnvCredentialStore, NonInteractivePrompt};
use donorsync_lib::account::Account;
use donorsync_lib::db::HistoryDb;
use donorsync_lib::notify::PipelineEvent;
use donorsync_lib::pipeline::{Pipeline, PipelineOptions};
use donorsync_lib::types::load_config;

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            log::error!("Failed to load config: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let db = match HistoryDb::resolve_path(config.database_path.as_deref())
        .and_then(HistoryDb::open_at)
    {
        Ok(db) => db.into_shared(),
        Err(e) => {
            log::error!("Failed to open database: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let mut pipeline = Pipeline::new(db, PipelineOptions::from_config(&config));
    pipeline.subscribe(Arc::new(|event: &PipelineEvent| match event {
        PipelineEvent::ImportError { account_id, message } => {
            eprintln!(
                "[{}] {}",
                account_id.as_deref().unwrap_or("importer"),
                message
            );
        }
        PipelineEvent::AccountImportStopped { account_id, added } => {
            eprintln!("[{}] done, {} added", account_id, added);
        }
        _ => {}
    }));

    if let Err(e) = pipeline.start_importer() {
        log::error!("Failed to start importer: {}", e);
        return ExitCode::FAILURE;
    }

    let credentials = Arc::new(EnvCredentialStore);
    let prompt = Arc::new(NonInteractivePrompt);
    for account_config in &config.accounts {
        let account = match Account::from_config(account_config, credentials.clone(), prompt.clone()) {
            Ok(account) => account,
            Err(e) => {
                log::warn!("Skipping account {}: {}", account_config.id, e);
                continue;
            }
        };
        if let Err(e) = pipeline.start_account(account) {
            log::warn!("Account {} not started: {}", account_config.id, e);
        }
    }

    // Waits for every account to be read to the end before disconnecting.
    let summary = pipeline.shutdown();
    match serde_json::to_string_pretty(&summary) {
        Ok(json) => println!("{json}"),
        Err(e) => log::error!("Failed to serialize summary: {}", e),
    }

    if summary.is_clean() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
