//! papertrader — equity paper-trading engine
//!
//! Simulates trading against live quotes without routing real orders:
//! signal intake, risk-gated sizing, fill simulation with slippage and
//! commission, and an auditable ledger of wallets, orders, trades,
//! positions and daily metrics across independent strategy wallets.

pub mod config;
pub mod driver;
pub mod engine;
pub mod ledger;
pub mod market;
pub mod models;
pub mod risk;
pub mod strategy;

pub use config::Config;
pub use driver::{CycleDriver, TEST_WALLET_PREFIX};
pub use engine::{ExecutionEngine, Submission};
pub use ledger::{JournalEntry, JournalMode, LedgerDb};
pub use market::{
    AlphaVantageProvider, MarketDataProvider, MockMarketDataProvider, SessionCalendar,
};
pub use risk::{RiskLimits, RiskVerdict};
pub use strategy::{FallbackPolicy, PositionSizing, SignalSource, StrategyRunner};
