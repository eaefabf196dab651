//! Fallback policies — safe synthetic intents for signal starvation.
//!
//! When the oracle goes quiet the runner consults one of these instead of
//! sitting idle. Two shipped variants:
//!
//! - US daily: one small MARKET buy per wallet per day, ticker chosen from a
//!   per-strategy pool
//! - ASX proof-of-life: one LIMIT buy per runner lifetime, blue-chip ticker
//!   picked deterministically from the wallet name

use crate::models::{OrderType, Venue, Wallet};
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::str::FromStr;
use tracing::info;

/// Synthetic intent produced by a fallback policy.
#[derive(Debug, Clone)]
pub struct FallbackIntent {
    pub ticker: String,
    pub venue: Venue,
    pub quantity: i64,
    pub order_type: OrderType,
    pub limit_price: Option<Decimal>,
    pub reason: String,
}

/// Preferred ticker pool per strategy wallet. Wallets outside the table get
/// the broad-market default.
const STRATEGY_POOLS: &[(&str, &[&str])] = &[
    ("Momentum-Long", &["NVDA", "META", "AMD"]),
    ("Value-Deep", &["BRK.B", "JPM", "KO"]),
    ("Breakout-Tech", &["AAPL", "MSFT", "GOOGL"]),
    ("Mean-Reversion", &["TSLA", "AMZN"]),
    ("Growth-Quality", &["MSFT", "V", "PG"]),
    ("Dividend-Yield", &["JNJ", "KO", "PG"]),
    ("Small-Cap-Growth", &["IWM", "AMD"]),
    ("Sector-Rotation", &["XLK", "XLF", "XLE"]),
    ("Volatility-Long", &["VXX", "VIXY"]),
    ("Options-Hedged", &["SPY", "QQQ"]),
];

const DEFAULT_POOL: &[&str] = &["SPY", "AAPL"];

/// ASX blue chips, highly liquid.
const ASX_TICKERS: &[&str] = &[
    "BHP.AX", "CBA.AX", "NAB.AX", "WBC.AX", "ANZ.AX", "WES.AX", "WOW.AX", "RIO.AX", "CSL.AX",
    "FMG.AX",
];

/// Conservative reference prices for LIMIT pricing and quantity estimates.
const ASX_ESTIMATED_PRICES: &[(&str, &str)] = &[
    ("BHP.AX", "42.00"),
    ("CBA.AX", "130.00"),
    ("NAB.AX", "35.00"),
    ("WBC.AX", "28.00"),
    ("ANZ.AX", "29.00"),
    ("WES.AX", "65.00"),
    ("WOW.AX", "35.00"),
    ("RIO.AX", "120.00"),
    ("CSL.AX", "280.00"),
    ("FMG.AX", "18.00"),
];

const ASX_DEFAULT_PRICE: &str = "50.00";

/// Stable fold over the wallet name. Python's salted `hash()` is
/// process-random; ticker selection must survive restarts.
fn stable_hash(name: &str) -> u64 {
    name.bytes()
        .fold(0u64, |h, b| h.wrapping_mul(31).wrapping_add(b as u64))
}

#[derive(Debug, Clone)]
pub struct UsDailyFallback {
    pub threshold: u32,
}

impl UsDailyFallback {
    /// Small quantity by capital tier.
    fn quantity_for_tier(tier: &str) -> i64 {
        match tier {
            "100k" => 5,
            "10k" => 2,
            _ => 1,
        }
    }

    fn build_intent(&self, wallet: &Wallet, held: &HashSet<String>) -> Option<FallbackIntent> {
        let pool = STRATEGY_POOLS
            .iter()
            .find(|(name, _)| *name == wallet.name)
            .map(|(_, pool)| *pool)
            .unwrap_or(DEFAULT_POOL);

        let ticker = pool.iter().find(|t| !held.contains(**t))?;
        let quantity = Self::quantity_for_tier(&wallet.capital_tier);

        Some(FallbackIntent {
            ticker: ticker.to_string(),
            venue: Venue::Nasdaq,
            quantity,
            order_type: OrderType::Market,
            limit_price: None,
            reason: format!(
                "FALLBACK_DAILY_TRADE (oracle signals unavailable for {}+ cycles)",
                self.threshold
            ),
        })
    }
}

#[derive(Debug, Clone)]
pub struct AsxProofOfLife {
    pub threshold: u32,
}

impl AsxProofOfLife {
    fn estimated_price(ticker: &str) -> Decimal {
        let raw = ASX_ESTIMATED_PRICES
            .iter()
            .find(|(t, _)| *t == ticker)
            .map(|(_, p)| *p)
            .unwrap_or(ASX_DEFAULT_PRICE);
        Decimal::from_str(raw).expect("valid estimated price")
    }

    fn build_intent(&self, wallet: &Wallet, held: &HashSet<String>) -> Option<FallbackIntent> {
        let index = (stable_hash(&wallet.name) % ASX_TICKERS.len() as u64) as usize;
        let ticker = ASX_TICKERS[index];
        if held.contains(ticker) {
            return None;
        }

        let limit_price = Self::estimated_price(ticker);
        info!(
            wallet = %wallet.name,
            ticker,
            price = %limit_price,
            "🇦🇺 ASX proof-of-life signal"
        );

        // Safety mode: one share, LIMIT order at the reference price.
        Some(FallbackIntent {
            ticker: ticker.to_string(),
            venue: Venue::Asx,
            quantity: 1,
            order_type: OrderType::Limit,
            limit_price: Some(limit_price),
            reason: "ASX_FALLBACK_PROOF_OF_LIFE (safety mode, qty=1)".to_string(),
        })
    }
}

/// Fallback behaviour for a venue runner.
#[derive(Debug, Clone)]
pub enum FallbackPolicy {
    UsDaily(UsDailyFallback),
    AsxProofOfLife(AsxProofOfLife),
    Disabled,
}

impl FallbackPolicy {
    pub fn us_daily(threshold: u32) -> Self {
        FallbackPolicy::UsDaily(UsDailyFallback { threshold })
    }

    pub fn asx_proof_of_life(threshold: u32) -> Self {
        FallbackPolicy::AsxProofOfLife(AsxProofOfLife { threshold })
    }

    pub fn should_activate(&self, no_signal_cycles: u32) -> bool {
        match self {
            FallbackPolicy::UsDaily(p) => no_signal_cycles >= p.threshold,
            FallbackPolicy::AsxProofOfLife(p) => no_signal_cycles >= p.threshold,
            FallbackPolicy::Disabled => false,
        }
    }

    /// US daily trades once per wallet per day.
    pub fn guards_daily(&self) -> bool {
        matches!(self, FallbackPolicy::UsDaily(_))
    }

    /// ASX proof-of-life trades once per runner lifetime.
    pub fn once_per_lifetime(&self) -> bool {
        matches!(self, FallbackPolicy::AsxProofOfLife(_))
    }

    pub fn build_intent(&self, wallet: &Wallet, held: &HashSet<String>) -> Option<FallbackIntent> {
        match self {
            FallbackPolicy::UsDaily(p) => p.build_intent(wallet, held),
            FallbackPolicy::AsxProofOfLife(p) => p.build_intent(wallet, held),
            FallbackPolicy::Disabled => None,
        }
    }
}
