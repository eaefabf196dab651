//! Durable ledger: wallets, orders, trades, positions, quote history,
//! daily metrics and the trade journal, all in one SQLite database.

pub mod db;
pub mod journal;

pub use db::LedgerDb;
pub use journal::{JournalEntry, JournalMode};
