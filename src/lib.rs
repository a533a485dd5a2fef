pub mod account;
pub mod db;
pub mod error;
pub mod importer;
pub mod matcher;
pub mod message;
mod migrations;
pub mod notify;
pub mod pipeline;
pub mod queue;
pub mod recalc;
pub mod services;
pub mod types;
pub mod worker;
