//! Oracle signal source
//!
//! One read against the signal database: top candidates for a venue class
//! from the last 24 hours, best score first. The producer side is someone
//! else's problem; this module only consumes the contract.

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use rusqlite::{params, Connection};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::models::VenueClass;

#[derive(Debug, Clone)]
pub struct OracleSignal {
    pub ticker: String,
    pub score: Decimal,
    pub price: Decimal,
    pub regime: Option<String>,
    pub confidence: Option<Decimal>,
    pub market: String,
}

pub struct SignalSource {
    conn: Arc<Mutex<Connection>>,
    min_score: i64,
    max_signals: usize,
}

impl SignalSource {
    pub fn open(path: &str, min_score: i64, max_signals: usize) -> Result<Self> {
        let conn = Connection::open(path).context("open signal db")?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();

        // Consumer-side mirror of the producer's table, so a fresh install
        // reads an empty set instead of erroring.
        conn.execute(
            "CREATE TABLE IF NOT EXISTS signals (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ticker TEXT NOT NULL,
                score REAL NOT NULL,
                price TEXT NOT NULL,
                regime TEXT,
                confidence REAL,
                market TEXT NOT NULL,
                timestamp TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_signals_market_score \
             ON signals(market, score DESC, timestamp DESC)",
            [],
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            min_score,
            max_signals,
        })
    }

    pub fn min_score(&self) -> i64 {
        self.min_score
    }

    /// Top signals for the venue class: last 24 h, `score >= min_score`,
    /// best first, capped at `max_signals`.
    pub async fn top_signals(&self, market: VenueClass) -> Result<Vec<OracleSignal>> {
        let cutoff = (Utc::now() - Duration::hours(24)).to_rfc3339();
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT ticker, score, price, regime, confidence, market FROM signals \
             WHERE market = ?1 AND score >= ?2 AND timestamp > ?3 \
             ORDER BY score DESC LIMIT ?4",
        )?;
        let rows = stmt.query_map(
            params![
                market.as_str(),
                self.min_score,
                cutoff,
                self.max_signals as i64
            ],
            |row| {
                let ticker: String = row.get(0)?;
                let score: f64 = row.get(1)?;
                let price: String = row.get(2)?;
                let regime: Option<String> = row.get(3)?;
                let confidence: Option<f64> = row.get(4)?;
                let market: String = row.get(5)?;
                Ok((ticker, score, price, regime, confidence, market))
            },
        )?;

        let mut out = Vec::new();
        for r in rows {
            let (ticker, score, price, regime, confidence, market) = r?;
            out.push(OracleSignal {
                ticker,
                score: Decimal::from_f64(score).unwrap_or_default(),
                price: Decimal::from_str(&price).context("signal price")?,
                regime,
                confidence: confidence.and_then(Decimal::from_f64),
                market,
            });
        }

        info!(
            count = out.len(),
            market = market.as_str(),
            min_score = self.min_score,
            "📊 Oracle signals"
        );
        Ok(out)
    }

    /// Insert a signal row. Used by tests and local tooling; the production
    /// producer writes the table directly.
    pub async fn insert_signal(
        &self,
        ticker: &str,
        score: f64,
        price: Decimal,
        market: VenueClass,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO signals (ticker, score, price, regime, confidence, market, timestamp) \
             VALUES (?1, ?2, ?3, 'BULL', 0.8, ?4, ?5)",
            params![
                ticker,
                score,
                price.to_string(),
                market.as_str(),
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    async fn source() -> (SignalSource, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signals.db");
        let src = SignalSource::open(path.to_str().unwrap(), 70, 5).unwrap();
        (src, dir)
    }

    #[tokio::test]
    async fn filters_and_orders_by_score() {
        let (src, _dir) = source().await;
        src.insert_signal("AAPL", 75.0, dec("180"), VenueClass::Us).await.unwrap();
        src.insert_signal("MSFT", 90.0, dec("370"), VenueClass::Us).await.unwrap();
        src.insert_signal("TSLA", 60.0, dec("245"), VenueClass::Us).await.unwrap();
        src.insert_signal("BHP.AX", 95.0, dec("53"), VenueClass::Asx).await.unwrap();

        let signals = src.top_signals(VenueClass::Us).await.unwrap();
        assert_eq!(signals.len(), 2);
        assert_eq!(signals[0].ticker, "MSFT");
        assert_eq!(signals[1].ticker, "AAPL");
        assert_eq!(signals[0].price, dec("370"));
    }

    #[tokio::test]
    async fn empty_set_for_quiet_market() {
        let (src, _dir) = source().await;
        assert!(src.top_signals(VenueClass::Tsx).await.unwrap().is_empty());
    }
}
