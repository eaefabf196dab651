//! Strategy layer: signal intake, fallback policies, and the per-wallet
//! execution loop.

pub mod fallback;
pub mod runner;
pub mod signals;

pub use fallback::{AsxProofOfLife, FallbackIntent, FallbackPolicy, UsDailyFallback};
pub use runner::{PositionSizing, StrategyRunner, WalletOutcome};
pub use signals::{OracleSignal, SignalSource};
