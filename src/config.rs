//! Runtime configuration, sourced from the environment.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use std::env;
use std::str::FromStr;

/// Application configuration. One instance is built at startup and handed to
/// the components that need it; nothing reads the environment afterwards.
#[derive(Debug, Clone)]
pub struct Config {
    /// Ledger database path.
    pub database_url: String,
    /// Signal source database path (defaults to the ledger).
    pub oracle_database_url: String,
    /// Alpha Vantage API key; required for the live provider.
    pub alphavantage_api_key: Option<String>,

    pub cycle_interval_s: u64,
    pub cache_ttl_s: u64,
    pub spread_bps: Decimal,
    pub min_signal_score: i64,
    pub max_signals: usize,

    pub max_positions: usize,
    pub max_position_pct: Decimal,
    pub min_reserve_pct: Decimal,

    pub commission_us: Decimal,
    pub commission_asx: Decimal,
    pub require_realtime: bool,
    pub enable_slippage: bool,

    /// Consecutive no-signal cycles before the US daily fallback activates.
    pub us_fallback_cycles: u32,
    /// Consecutive no-signal cycles before the ASX proof-of-life fallback.
    pub asx_fallback_cycles: u32,
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
        .unwrap_or(default)
}

fn env_decimal(key: &str, default: &str) -> Decimal {
    env::var(key)
        .ok()
        .and_then(|v| Decimal::from_str(&v).ok())
        .unwrap_or_else(|| Decimal::from_str(default).expect("valid default decimal"))
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let database_url = env::var("DATABASE_URL").context("DATABASE_URL not set")?;
        let oracle_database_url =
            env::var("ORACLE_DATABASE_URL").unwrap_or_else(|_| database_url.clone());
        let alphavantage_api_key = env::var("ALPHAVANTAGE_API_KEY").ok().filter(|k| !k.is_empty());

        Ok(Self {
            database_url,
            oracle_database_url,
            alphavantage_api_key,
            cycle_interval_s: env_parse("CYCLE_INTERVAL_S", 60),
            cache_ttl_s: env_parse("CACHE_TTL_S", 60),
            spread_bps: env_decimal("SPREAD_BPS", "10"),
            min_signal_score: env_parse("MIN_SIGNAL_SCORE", 70),
            max_signals: env_parse("MAX_SIGNALS", 5),
            max_positions: env_parse("MAX_POSITIONS", 5),
            max_position_pct: env_decimal("MAX_POSITION_PCT", "0.20"),
            min_reserve_pct: env_decimal("MIN_RESERVE_PCT", "0.10"),
            commission_us: env_decimal("COMMISSION_US", "1.00"),
            commission_asx: env_decimal("COMMISSION_ASX", "10.00"),
            require_realtime: env_bool("REQUIRE_REALTIME", false),
            enable_slippage: env_bool("ENABLE_SLIPPAGE", true),
            us_fallback_cycles: env_parse("US_FALLBACK_CYCLES", 1),
            asx_fallback_cycles: env_parse("ASX_FALLBACK_CYCLES", 3),
        })
    }
}
