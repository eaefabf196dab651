//! Trade journal — append-only record of policy decisions.
//!
//! Every fallback attempt lands here with structured reason codes and the
//! raw request/response payloads, whether or not the order was accepted.

use super::db::LedgerDb;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::params;
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalMode {
    Signal,
    Fallback,
}

impl JournalMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            JournalMode::Signal => "SIGNAL",
            JournalMode::Fallback => "FALLBACK",
        }
    }
}

/// One journal row. `reason_codes` is stored as a JSON array; the payload
/// columns are always valid JSON (empty object when there is nothing to say).
#[derive(Debug, Clone)]
pub struct JournalEntry {
    pub id: Uuid,
    pub wallet_id: Uuid,
    pub ts_utc: DateTime<Utc>,
    pub venue: String,
    pub ticker: String,
    pub action: String,
    pub mode: JournalMode,
    pub signal_snapshot: Value,
    pub reason_codes: Vec<String>,
    pub order_request: Value,
    pub order_response: Value,
    pub fill: Value,
    pub error: Option<String>,
}

impl JournalEntry {
    pub fn fallback(wallet_id: Uuid, venue: &str, ticker: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            wallet_id,
            ts_utc: Utc::now(),
            venue: venue.to_string(),
            ticker: ticker.to_string(),
            action: "BUY".to_string(),
            mode: JournalMode::Fallback,
            signal_snapshot: Value::Object(Default::default()),
            reason_codes: Vec::new(),
            order_request: Value::Object(Default::default()),
            order_response: Value::Object(Default::default()),
            fill: Value::Object(Default::default()),
            error: None,
        }
    }
}

impl LedgerDb {
    pub async fn insert_journal(&self, entry: &JournalEntry) -> Result<()> {
        let reason_codes =
            serde_json::to_string(&entry.reason_codes).context("encode reason codes")?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO trade_journal \
                 (id, wallet_id, ts_utc, venue, ticker, action, mode, signal_snapshot, \
                  reason_codes, order_request, order_response, fill, error) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    entry.id.to_string(),
                    entry.wallet_id.to_string(),
                    entry.ts_utc.to_rfc3339(),
                    entry.venue,
                    entry.ticker,
                    entry.action,
                    entry.mode.as_str(),
                    entry.signal_snapshot.to_string(),
                    reason_codes,
                    entry.order_request.to_string(),
                    entry.order_response.to_string(),
                    entry.fill.to_string(),
                    entry.error,
                ],
            )
            .context("insert journal entry")?;
            Ok(())
        })
        .await
    }

    /// Journal rows for a wallet, newest first. (mode, reason_codes, error).
    pub async fn list_journal(
        &self,
        wallet_id: Uuid,
        limit: usize,
    ) -> Result<Vec<(String, Vec<String>, Option<String>)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT mode, reason_codes, error FROM trade_journal \
                 WHERE wallet_id = ?1 ORDER BY ts_utc DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![wallet_id.to_string(), limit as i64], |row| {
                let mode: String = row.get(0)?;
                let codes: String = row.get(1)?;
                let error: Option<String> = row.get(2)?;
                Ok((mode, codes, error))
            })?;
            let mut out = Vec::new();
            for r in rows {
                let (mode, codes, error) = r?;
                let codes: Vec<String> =
                    serde_json::from_str(&codes).context("decode reason codes")?;
                out.push((mode, codes, error));
            }
            Ok(out)
        })
        .await
    }
}
