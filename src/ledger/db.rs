//! Ledger database access
//!
//! Single SQLite connection behind an async mutex. All multi-row mutations
//! run through [`LedgerDb::with_tx`], so the engine's wallet + position +
//! trade + order writes commit or roll back as one unit.
//!
//! Monetary columns are TEXT-encoded decimals; enumerated columns are the
//! stable strings from `models`; timestamps are RFC 3339 UTC.

use crate::models::{
    MetricsSnapshot, Order, OrderSide, OrderStatus, OrderType, Position, Quote, SignalSnapshot,
    Venue, VenueClass, Wallet,
};
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, Row, Transaction};
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS wallets (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    capital_tier TEXT NOT NULL,
    initial_balance TEXT NOT NULL,
    current_balance TEXT NOT NULL,
    reserved_balance TEXT NOT NULL DEFAULT '0',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS orders (
    id TEXT PRIMARY KEY,
    wallet_id TEXT NOT NULL REFERENCES wallets(id),
    ticker TEXT NOT NULL,
    venue TEXT NOT NULL,
    side TEXT NOT NULL CHECK (side IN ('BUY', 'SELL')),
    order_type TEXT NOT NULL CHECK (order_type IN ('MARKET', 'LIMIT', 'STOP', 'STOP_LIMIT')),
    quantity INTEGER NOT NULL,
    filled_quantity INTEGER NOT NULL DEFAULT 0,
    limit_price TEXT,
    stop_price TEXT,
    avg_fill_price TEXT,
    status TEXT NOT NULL,
    rejection_reason TEXT,
    signal_snapshot TEXT,
    submitted_at TEXT,
    filled_at TEXT,
    cancelled_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_orders_wallet ON orders(wallet_id, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_orders_status ON orders(status, order_type);

CREATE TABLE IF NOT EXISTS trades (
    id TEXT PRIMARY KEY,
    order_id TEXT NOT NULL REFERENCES orders(id),
    wallet_id TEXT NOT NULL REFERENCES wallets(id),
    ticker TEXT NOT NULL,
    venue TEXT NOT NULL,
    side TEXT NOT NULL,
    quantity INTEGER NOT NULL,
    fill_price TEXT NOT NULL,
    slippage_bps TEXT,
    commission TEXT NOT NULL,
    gross_amount TEXT NOT NULL,
    net_amount TEXT NOT NULL,
    quote_bid TEXT,
    quote_ask TEXT,
    quote_mid TEXT,
    filled_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_trades_wallet_filled ON trades(wallet_id, filled_at DESC);

CREATE TABLE IF NOT EXISTS positions (
    id TEXT PRIMARY KEY,
    wallet_id TEXT NOT NULL REFERENCES wallets(id),
    ticker TEXT NOT NULL,
    venue TEXT NOT NULL,
    quantity INTEGER NOT NULL,
    avg_entry_price TEXT NOT NULL,
    total_cost TEXT NOT NULL,
    realised_pnl TEXT NOT NULL DEFAULT '0',
    opened_at TEXT NOT NULL,
    closed_at TEXT,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_positions_wallet_open ON positions(wallet_id, closed_at);

CREATE TABLE IF NOT EXISTS market_data (
    ticker TEXT NOT NULL,
    venue TEXT NOT NULL,
    price TEXT NOT NULL,
    bid TEXT,
    ask TEXT,
    volume INTEGER,
    timestamp TEXT NOT NULL,
    provider TEXT NOT NULL,
    fetched_at TEXT NOT NULL,
    PRIMARY KEY (ticker, venue, timestamp)
);

CREATE TABLE IF NOT EXISTS strategy_metrics (
    wallet_id TEXT NOT NULL REFERENCES wallets(id),
    date TEXT NOT NULL,
    equity TEXT NOT NULL,
    pnl TEXT NOT NULL,
    pnl_pct TEXT NOT NULL,
    win_rate TEXT,
    trade_count INTEGER NOT NULL,
    winning_trades INTEGER NOT NULL,
    losing_trades INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (wallet_id, date)
);

CREATE TABLE IF NOT EXISTS trade_journal (
    id TEXT PRIMARY KEY,
    wallet_id TEXT NOT NULL,
    ts_utc TEXT NOT NULL,
    venue TEXT NOT NULL,
    ticker TEXT NOT NULL,
    action TEXT NOT NULL,
    mode TEXT NOT NULL,
    signal_snapshot TEXT NOT NULL,
    reason_codes TEXT NOT NULL,
    order_request TEXT NOT NULL,
    order_response TEXT NOT NULL,
    fill TEXT NOT NULL,
    error TEXT
);
CREATE INDEX IF NOT EXISTS idx_trade_journal_wallet ON trade_journal(wallet_id, ts_utc DESC);
"#;

/// Handle to the ledger database. Cheap to clone.
#[derive(Clone)]
pub struct LedgerDb {
    conn: Arc<Mutex<Connection>>,
}

impl LedgerDb {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path).context("open ledger db")?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON").ok();
        conn.execute_batch(SCHEMA_SQL).context("create ledger schema")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` inside one transaction. The transaction commits when `f`
    /// returns `Ok` and rolls back when it returns `Err`.
    pub async fn with_tx<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit().context("commit ledger transaction")?;
        Ok(out)
    }

    /// Run `f` against the connection without an explicit transaction.
    /// Single-statement reads and writes only.
    pub async fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock().await;
        f(&conn)
    }

    // =========================================================================
    // WALLETS
    // =========================================================================

    pub async fn insert_wallet(&self, wallet: &Wallet) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO wallets \
             (id, name, capital_tier, initial_balance, current_balance, reserved_balance, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                wallet.id.to_string(),
                wallet.name,
                wallet.capital_tier,
                wallet.initial_balance.to_string(),
                wallet.current_balance.to_string(),
                wallet.reserved_balance.to_string(),
                rfc3339(wallet.created_at),
                rfc3339(wallet.updated_at),
            ],
        )
        .context("insert wallet")?;
        Ok(())
    }

    pub async fn get_wallet(&self, wallet_id: Uuid) -> Result<Option<Wallet>> {
        self.with_conn(|conn| get_wallet(conn, wallet_id)).await
    }

    pub async fn get_wallet_by_name(&self, name: &str) -> Result<Option<Wallet>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached("SELECT * FROM wallets WHERE name = ?1")?;
        let mut rows = stmt.query(params![name])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_wallet(row)?)),
            None => Ok(None),
        }
    }

    /// Active strategy wallets, excluding the reserved test prefix, ordered
    /// by name.
    pub async fn list_active_wallets(&self, exclude_prefix: &str) -> Result<Vec<Wallet>> {
        let conn = self.conn.lock().await;
        let pattern = format!("{exclude_prefix}%");
        let mut stmt = conn.prepare_cached(
            "SELECT * FROM wallets WHERE name NOT LIKE ?1 ORDER BY name ASC",
        )?;
        let rows = stmt.query_map(params![pattern], |row| {
            row_to_wallet(row)
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    // =========================================================================
    // ORDERS & POSITIONS
    // =========================================================================

    pub async fn get_order(&self, order_id: Uuid) -> Result<Option<Order>> {
        self.with_conn(|conn| get_order(conn, order_id)).await
    }

    pub async fn get_open_positions(&self, wallet_id: Uuid) -> Result<Vec<Position>> {
        self.with_conn(|conn| get_open_positions(conn, wallet_id)).await
    }

    /// Active non-MARKET orders on the given venue class; the driver
    /// re-attempts these every cycle.
    pub async fn list_active_resting_orders(&self, class: VenueClass) -> Result<Vec<Uuid>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, venue FROM orders \
             WHERE status IN ('PENDING', 'SUBMITTED', 'PARTIAL') AND order_type != 'MARKET' \
             ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            let id: String = row.get(0)?;
            let venue: String = row.get(1)?;
            Ok((id, venue))
        })?;
        let mut out = Vec::new();
        for r in rows {
            let (id, venue) = r?;
            if Venue::parse(&venue)?.class() == class {
                out.push(Uuid::parse_str(&id).context("order id")?);
            }
        }
        Ok(out)
    }

    /// Recent trades for a wallet, newest first.
    pub async fn list_trades(&self, wallet_id: Uuid, limit: usize) -> Result<Vec<crate::models::Trade>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT * FROM trades WHERE wallet_id = ?1 ORDER BY filled_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![wallet_id.to_string(), limit as i64], row_to_trade)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Trades filled at or after `since` for the wallet. Feeds the
    /// already-traded-today fallback guard.
    pub async fn count_trades_since(&self, wallet_id: Uuid, since: DateTime<Utc>) -> Result<i64> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT COUNT(*) FROM trades WHERE wallet_id = ?1 AND filled_at >= ?2",
        )?;
        let count: i64 =
            stmt.query_row(params![wallet_id.to_string(), rfc3339(since)], |row| row.get(0))?;
        Ok(count)
    }

    /// (total, winning) closed-position counts for the wallet.
    pub async fn closed_position_stats(&self, wallet_id: Uuid) -> Result<(i64, i64)> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT COUNT(*), \
                    COUNT(CASE WHEN CAST(realised_pnl AS REAL) > 0 THEN 1 END) \
             FROM positions WHERE wallet_id = ?1 AND closed_at IS NOT NULL",
        )?;
        let row = stmt.query_row(params![wallet_id.to_string()], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
        })?;
        Ok(row)
    }

    // =========================================================================
    // QUOTE HISTORY & METRICS
    // =========================================================================

    /// Upsert a quote into the history table, keyed (ticker, venue, timestamp).
    pub async fn upsert_market_quote(&self, quote: &Quote) -> Result<()> {
        let conn = self.conn.lock().await;
        upsert_market_quote(&conn, quote)
    }

    /// Latest stored quote price for mark-to-market.
    pub async fn latest_quote_price(&self, ticker: &str, venue: Venue) -> Result<Option<Decimal>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT price FROM market_data WHERE ticker = ?1 AND venue = ?2 \
             ORDER BY timestamp DESC LIMIT 1",
        )?;
        let mut rows = stmt.query(params![ticker, venue.as_str()])?;
        match rows.next()? {
            Some(row) => {
                let raw: String = row.get(0)?;
                Ok(Some(Decimal::from_str(&raw).context("stored quote price")?))
            }
            None => Ok(None),
        }
    }

    pub async fn upsert_metrics(&self, snap: &MetricsSnapshot) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO strategy_metrics \
             (wallet_id, date, equity, pnl, pnl_pct, win_rate, trade_count, winning_trades, losing_trades, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10) \
             ON CONFLICT(wallet_id, date) DO UPDATE SET \
                equity = excluded.equity, \
                pnl = excluded.pnl, \
                pnl_pct = excluded.pnl_pct, \
                win_rate = excluded.win_rate, \
                trade_count = excluded.trade_count, \
                winning_trades = excluded.winning_trades, \
                losing_trades = excluded.losing_trades, \
                created_at = excluded.created_at",
            params![
                snap.wallet_id.to_string(),
                snap.date.format("%Y-%m-%d").to_string(),
                snap.equity.to_string(),
                snap.pnl.to_string(),
                snap.pnl_pct.to_string(),
                snap.win_rate.map(|w| w.to_string()),
                snap.trade_count,
                snap.winning_trades,
                snap.losing_trades,
                rfc3339(Utc::now()),
            ],
        )
        .context("upsert strategy metrics")?;
        Ok(())
    }

    /// Metrics rows for the CLI viewer, newest first, optionally filtered.
    pub async fn list_metrics(
        &self,
        wallet_id: Option<Uuid>,
        date: Option<NaiveDate>,
        limit: usize,
    ) -> Result<Vec<MetricsSnapshot>> {
        let conn = self.conn.lock().await;
        let mut sql = String::from(
            "SELECT wallet_id, date, equity, pnl, pnl_pct, win_rate, trade_count, winning_trades, losing_trades \
             FROM strategy_metrics WHERE 1=1",
        );
        let mut args: Vec<String> = Vec::new();
        if let Some(id) = wallet_id {
            sql.push_str(" AND wallet_id = ?");
            args.push(id.to_string());
        }
        if let Some(d) = date {
            sql.push_str(" AND date = ?");
            args.push(d.format("%Y-%m-%d").to_string());
        }
        sql.push_str(" ORDER BY date DESC, wallet_id ASC LIMIT ?");
        args.push(limit.to_string());

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), row_to_metrics)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }
}

// =============================================================================
// TRANSACTION-SCOPED PRIMITIVES
//
// Free functions over &Connection so the engine can compose them inside a
// single `with_tx` closure (Transaction derefs to Connection).
// =============================================================================

pub fn get_wallet(conn: &Connection, wallet_id: Uuid) -> Result<Option<Wallet>> {
    let mut stmt = conn.prepare_cached("SELECT * FROM wallets WHERE id = ?1")?;
    let mut rows = stmt.query(params![wallet_id.to_string()])?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_wallet(row)?)),
        None => Ok(None),
    }
}

pub fn get_order(conn: &Connection, order_id: Uuid) -> Result<Option<Order>> {
    let mut stmt = conn.prepare_cached("SELECT * FROM orders WHERE id = ?1")?;
    let mut rows = stmt.query(params![order_id.to_string()])?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_order(row)?)),
        None => Ok(None),
    }
}

pub fn get_open_positions(conn: &Connection, wallet_id: Uuid) -> Result<Vec<Position>> {
    let mut stmt = conn.prepare_cached(
        "SELECT * FROM positions WHERE wallet_id = ?1 AND closed_at IS NULL \
         ORDER BY opened_at DESC",
    )?;
    let rows = stmt.query_map(params![wallet_id.to_string()], row_to_position)?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

pub fn insert_order(conn: &Connection, order: &Order) -> Result<()> {
    let snapshot = order
        .signal_snapshot
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .context("encode signal snapshot")?;
    conn.execute(
        "INSERT INTO orders \
         (id, wallet_id, ticker, venue, side, order_type, quantity, filled_quantity, \
          limit_price, stop_price, avg_fill_price, status, rejection_reason, signal_snapshot, \
          submitted_at, filled_at, cancelled_at, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
        params![
            order.id.to_string(),
            order.wallet_id.to_string(),
            order.ticker,
            order.venue.as_str(),
            order.side.as_str(),
            order.order_type.as_str(),
            order.quantity,
            order.filled_quantity,
            order.limit_price.map(|d| d.to_string()),
            order.stop_price.map(|d| d.to_string()),
            order.avg_fill_price.map(|d| d.to_string()),
            order.status.as_str(),
            order.rejection_reason,
            snapshot,
            order.submitted_at.map(rfc3339),
            order.filled_at.map(rfc3339),
            order.cancelled_at.map(rfc3339),
            rfc3339(order.created_at),
            rfc3339(order.updated_at),
        ],
    )
    .context("insert order")?;
    Ok(())
}

/// Increment the wallet's reserved balance by `amount`.
pub fn reserve_funds(
    conn: &Connection,
    wallet_id: Uuid,
    amount: Decimal,
    now: DateTime<Utc>,
) -> Result<()> {
    let wallet = get_wallet(conn, wallet_id)?.context("wallet vanished during reserve")?;
    conn.execute(
        "UPDATE wallets SET reserved_balance = ?1, updated_at = ?2 WHERE id = ?3",
        params![
            (wallet.reserved_balance + amount).to_string(),
            rfc3339(now),
            wallet_id.to_string()
        ],
    )
    .context("reserve funds")?;
    Ok(())
}

/// BUY settlement: debit the net amount and release the matching
/// reservation. The release is capped at the outstanding reservation and the
/// result clamped at zero, which guards cumulative rounding drift.
pub fn settle_buy(
    conn: &Connection,
    wallet_id: Uuid,
    net_amount: Decimal,
    now: DateTime<Utc>,
) -> Result<()> {
    let wallet = get_wallet(conn, wallet_id)?.context("wallet vanished during settle")?;
    let release = net_amount.min(wallet.reserved_balance);
    let new_balance = wallet.current_balance - net_amount;
    let new_reserved = (wallet.reserved_balance - release).max(Decimal::ZERO);
    conn.execute(
        "UPDATE wallets SET current_balance = ?1, reserved_balance = ?2, updated_at = ?3 WHERE id = ?4",
        params![
            new_balance.to_string(),
            new_reserved.to_string(),
            rfc3339(now),
            wallet_id.to_string()
        ],
    )
    .context("settle buy")?;
    Ok(())
}

/// SELL settlement: credit the net proceeds.
pub fn settle_sell(
    conn: &Connection,
    wallet_id: Uuid,
    net_amount: Decimal,
    now: DateTime<Utc>,
) -> Result<()> {
    let wallet = get_wallet(conn, wallet_id)?.context("wallet vanished during settle")?;
    conn.execute(
        "UPDATE wallets SET current_balance = ?1, updated_at = ?2 WHERE id = ?3",
        params![
            (wallet.current_balance + net_amount).to_string(),
            rfc3339(now),
            wallet_id.to_string()
        ],
    )
    .context("settle sell")?;
    Ok(())
}

pub fn find_open_position(
    conn: &Connection,
    wallet_id: Uuid,
    ticker: &str,
    venue: Venue,
) -> Result<Option<Position>> {
    let mut stmt = conn.prepare_cached(
        "SELECT * FROM positions \
         WHERE wallet_id = ?1 AND ticker = ?2 AND venue = ?3 AND closed_at IS NULL",
    )?;
    let mut rows = stmt.query(params![wallet_id.to_string(), ticker, venue.as_str()])?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_position(row)?)),
        None => Ok(None),
    }
}

pub fn insert_position(conn: &Connection, position: &Position) -> Result<()> {
    conn.execute(
        "INSERT INTO positions \
         (id, wallet_id, ticker, venue, quantity, avg_entry_price, total_cost, realised_pnl, \
          opened_at, closed_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            position.id.to_string(),
            position.wallet_id.to_string(),
            position.ticker,
            position.venue.as_str(),
            position.quantity,
            position.avg_entry_price.to_string(),
            position.total_cost.to_string(),
            position.realised_pnl.to_string(),
            rfc3339(position.opened_at),
            position.closed_at.map(rfc3339),
            rfc3339(position.updated_at),
        ],
    )
    .context("insert position")?;
    Ok(())
}

pub fn update_position(
    conn: &Connection,
    position_id: Uuid,
    quantity: i64,
    avg_entry_price: Decimal,
    total_cost: Decimal,
    realised_pnl: Decimal,
    closed_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "UPDATE positions SET quantity = ?1, avg_entry_price = ?2, total_cost = ?3, \
         realised_pnl = ?4, closed_at = ?5, updated_at = ?6 WHERE id = ?7",
        params![
            quantity,
            avg_entry_price.to_string(),
            total_cost.to_string(),
            realised_pnl.to_string(),
            closed_at.map(rfc3339),
            rfc3339(now),
            position_id.to_string()
        ],
    )
    .context("update position")?;
    Ok(())
}

pub fn insert_trade(conn: &Connection, trade: &crate::models::Trade) -> Result<()> {
    conn.execute(
        "INSERT INTO trades \
         (id, order_id, wallet_id, ticker, venue, side, quantity, fill_price, slippage_bps, \
          commission, gross_amount, net_amount, quote_bid, quote_ask, quote_mid, filled_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        params![
            trade.id.to_string(),
            trade.order_id.to_string(),
            trade.wallet_id.to_string(),
            trade.ticker,
            trade.venue.as_str(),
            trade.side.as_str(),
            trade.quantity,
            trade.fill_price.to_string(),
            trade.slippage_bps.map(|d| d.to_string()),
            trade.commission.to_string(),
            trade.gross_amount.to_string(),
            trade.net_amount.to_string(),
            trade.quote_bid.map(|d| d.to_string()),
            trade.quote_ask.map(|d| d.to_string()),
            trade.quote_mid.map(|d| d.to_string()),
            rfc3339(trade.filled_at),
        ],
    )
    .context("insert trade")?;
    Ok(())
}

pub fn update_order_fill(
    conn: &Connection,
    order_id: Uuid,
    filled_quantity: i64,
    avg_fill_price: Decimal,
    status: OrderStatus,
    filled_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "UPDATE orders SET filled_quantity = ?1, avg_fill_price = ?2, status = ?3, \
         filled_at = ?4, updated_at = ?5 WHERE id = ?6",
        params![
            filled_quantity,
            avg_fill_price.to_string(),
            status.as_str(),
            filled_at.map(rfc3339),
            rfc3339(now),
            order_id.to_string()
        ],
    )
    .context("update order fill")?;
    Ok(())
}

pub fn upsert_market_quote(conn: &Connection, quote: &Quote) -> Result<()> {
    conn.execute(
        "INSERT INTO market_data (ticker, venue, price, bid, ask, volume, timestamp, provider, fetched_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
         ON CONFLICT(ticker, venue, timestamp) DO UPDATE SET \
            price = excluded.price, \
            bid = excluded.bid, \
            ask = excluded.ask, \
            volume = excluded.volume, \
            provider = excluded.provider, \
            fetched_at = excluded.fetched_at",
        params![
            quote.ticker,
            quote.venue.as_str(),
            quote.price.to_string(),
            quote.bid.map(|d| d.to_string()),
            quote.ask.map(|d| d.to_string()),
            quote.volume,
            rfc3339(quote.timestamp),
            quote.provider,
            rfc3339(Utc::now()),
        ],
    )
    .context("upsert market quote")?;
    Ok(())
}

// =============================================================================
// ROW MAPPING
// =============================================================================

fn rfc3339(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn conversion_err(idx: usize, err: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn col_decimal(row: &Row<'_>, idx: usize) -> rusqlite::Result<Decimal> {
    let raw: String = row.get(idx)?;
    Decimal::from_str(&raw).map_err(|e| conversion_err(idx, e))
}

fn col_decimal_opt(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Decimal>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| Decimal::from_str(&s).map_err(|e| conversion_err(idx, e)))
        .transpose()
}

fn col_uuid(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw).map_err(|e| conversion_err(idx, e))
}

fn col_datetime(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_err(idx, e))
}

fn col_datetime_opt(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| conversion_err(idx, e))
    })
    .transpose()
}

fn row_to_wallet(row: &Row<'_>) -> rusqlite::Result<Wallet> {
    Ok(Wallet {
        id: col_uuid(row, 0)?,
        name: row.get(1)?,
        capital_tier: row.get(2)?,
        initial_balance: col_decimal(row, 3)?,
        current_balance: col_decimal(row, 4)?,
        reserved_balance: col_decimal(row, 5)?,
        created_at: col_datetime(row, 6)?,
        updated_at: col_datetime(row, 7)?,
    })
}

fn row_to_order(row: &Row<'_>) -> rusqlite::Result<Order> {
    let venue: String = row.get(3)?;
    let side: String = row.get(4)?;
    let order_type: String = row.get(5)?;
    let status: String = row.get(11)?;
    let snapshot_raw: Option<String> = row.get(13)?;
    let signal_snapshot: Option<SignalSnapshot> = snapshot_raw
        .map(|s| serde_json::from_str(&s).map_err(|e| conversion_err(13, e)))
        .transpose()?;

    Ok(Order {
        id: col_uuid(row, 0)?,
        wallet_id: col_uuid(row, 1)?,
        ticker: row.get(2)?,
        venue: Venue::parse(&venue).map_err(|e| conversion_err(3, std::io::Error::other(e.to_string())))?,
        side: OrderSide::parse(&side).map_err(|e| conversion_err(4, std::io::Error::other(e.to_string())))?,
        order_type: OrderType::parse(&order_type)
            .map_err(|e| conversion_err(5, std::io::Error::other(e.to_string())))?,
        quantity: row.get(6)?,
        filled_quantity: row.get(7)?,
        limit_price: col_decimal_opt(row, 8)?,
        stop_price: col_decimal_opt(row, 9)?,
        avg_fill_price: col_decimal_opt(row, 10)?,
        status: OrderStatus::parse(&status)
            .map_err(|e| conversion_err(11, std::io::Error::other(e.to_string())))?,
        rejection_reason: row.get(12)?,
        signal_snapshot,
        submitted_at: col_datetime_opt(row, 14)?,
        filled_at: col_datetime_opt(row, 15)?,
        cancelled_at: col_datetime_opt(row, 16)?,
        created_at: col_datetime(row, 17)?,
        updated_at: col_datetime(row, 18)?,
    })
}

fn row_to_position(row: &Row<'_>) -> rusqlite::Result<Position> {
    let venue: String = row.get(3)?;
    Ok(Position {
        id: col_uuid(row, 0)?,
        wallet_id: col_uuid(row, 1)?,
        ticker: row.get(2)?,
        venue: Venue::parse(&venue).map_err(|e| conversion_err(3, std::io::Error::other(e.to_string())))?,
        quantity: row.get(4)?,
        avg_entry_price: col_decimal(row, 5)?,
        total_cost: col_decimal(row, 6)?,
        realised_pnl: col_decimal(row, 7)?,
        opened_at: col_datetime(row, 8)?,
        closed_at: col_datetime_opt(row, 9)?,
        updated_at: col_datetime(row, 10)?,
    })
}

fn row_to_trade(row: &Row<'_>) -> rusqlite::Result<crate::models::Trade> {
    let venue: String = row.get(4)?;
    let side: String = row.get(5)?;
    Ok(crate::models::Trade {
        id: col_uuid(row, 0)?,
        order_id: col_uuid(row, 1)?,
        wallet_id: col_uuid(row, 2)?,
        ticker: row.get(3)?,
        venue: Venue::parse(&venue).map_err(|e| conversion_err(4, std::io::Error::other(e.to_string())))?,
        side: OrderSide::parse(&side)
            .map_err(|e| conversion_err(5, std::io::Error::other(e.to_string())))?,
        quantity: row.get(6)?,
        fill_price: col_decimal(row, 7)?,
        slippage_bps: col_decimal_opt(row, 8)?,
        commission: col_decimal(row, 9)?,
        gross_amount: col_decimal(row, 10)?,
        net_amount: col_decimal(row, 11)?,
        quote_bid: col_decimal_opt(row, 12)?,
        quote_ask: col_decimal_opt(row, 13)?,
        quote_mid: col_decimal_opt(row, 14)?,
        filled_at: col_datetime(row, 15)?,
    })
}

fn row_to_metrics(row: &Row<'_>) -> rusqlite::Result<MetricsSnapshot> {
    let date_raw: String = row.get(1)?;
    let date = NaiveDate::parse_from_str(&date_raw, "%Y-%m-%d")
        .map_err(|e| conversion_err(1, e))?;
    Ok(MetricsSnapshot {
        wallet_id: col_uuid(row, 0)?,
        date,
        equity: col_decimal(row, 2)?,
        pnl: col_decimal(row, 3)?,
        pnl_pct: col_decimal(row, 4)?,
        win_rate: col_decimal_opt(row, 5)?,
        trade_count: row.get(6)?,
        winning_trades: row.get(7)?,
        losing_trades: row.get(8)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn test_wallet(name: &str) -> Wallet {
        let now = Utc::now();
        Wallet {
            id: Uuid::new_v4(),
            name: name.to_string(),
            capital_tier: "10k".to_string(),
            initial_balance: dec("10000"),
            current_balance: dec("10000"),
            reserved_balance: Decimal::ZERO,
            created_at: now,
            updated_at: now,
        }
    }

    async fn open_temp() -> (LedgerDb, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.db");
        let db = LedgerDb::open(path.to_str().unwrap()).unwrap();
        (db, dir)
    }

    #[tokio::test]
    async fn wallet_round_trip() {
        let (db, _dir) = open_temp().await;
        let wallet = test_wallet("Momentum-Long");
        db.insert_wallet(&wallet).await.unwrap();

        let loaded = db.get_wallet(wallet.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "Momentum-Long");
        assert_eq!(loaded.initial_balance, dec("10000"));
        assert_eq!(loaded.buying_power(), dec("10000"));

        let by_name = db.get_wallet_by_name("Momentum-Long").await.unwrap().unwrap();
        assert_eq!(by_name.id, wallet.id);
    }

    #[tokio::test]
    async fn active_wallet_listing_excludes_test_prefix() {
        let (db, _dir) = open_temp().await;
        db.insert_wallet(&test_wallet("Momentum-Long")).await.unwrap();
        db.insert_wallet(&test_wallet("Test-Wallet-10K")).await.unwrap();

        let wallets = db.list_active_wallets("Test-Wallet-").await.unwrap();
        assert_eq!(wallets.len(), 1);
        assert_eq!(wallets[0].name, "Momentum-Long");
    }

    #[tokio::test]
    async fn transaction_rolls_back_on_error() {
        let (db, _dir) = open_temp().await;
        let wallet = test_wallet("Roll-Back");
        db.insert_wallet(&wallet).await.unwrap();

        let result: Result<()> = db
            .with_tx(|tx| {
                reserve_funds(tx, wallet.id, dec("500"), Utc::now())?;
                anyhow::bail!("forced failure");
            })
            .await;
        assert!(result.is_err());

        let loaded = db.get_wallet(wallet.id).await.unwrap().unwrap();
        assert_eq!(loaded.reserved_balance, Decimal::ZERO);
    }

    #[tokio::test]
    async fn metrics_upsert_is_idempotent() {
        let (db, _dir) = open_temp().await;
        let wallet = test_wallet("Metrics");
        db.insert_wallet(&wallet).await.unwrap();

        let snap = MetricsSnapshot {
            wallet_id: wallet.id,
            date: Utc::now().date_naive(),
            equity: dec("10100"),
            pnl: dec("100"),
            pnl_pct: dec("1"),
            win_rate: None,
            trade_count: 0,
            winning_trades: 0,
            losing_trades: 0,
        };
        db.upsert_metrics(&snap).await.unwrap();
        db.upsert_metrics(&snap).await.unwrap();

        let rows = db.list_metrics(Some(wallet.id), None, 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].equity, dec("10100"));
        assert!(rows[0].win_rate.is_none());
    }

    #[tokio::test]
    async fn quote_history_upsert_and_latest() {
        let (db, _dir) = open_temp().await;
        let ts = Utc::now();
        let mut quote = Quote {
            ticker: "AAPL".into(),
            venue: Venue::Nasdaq,
            price: dec("180"),
            bid: Some(dec("179.82")),
            ask: Some(dec("180.18")),
            volume: Some(1000),
            timestamp: ts - Duration::seconds(60),
            provider: "mock".into(),
        };
        db.upsert_market_quote(&quote).await.unwrap();
        quote.timestamp = ts;
        quote.price = dec("181");
        db.upsert_market_quote(&quote).await.unwrap();

        let latest = db.latest_quote_price("AAPL", Venue::Nasdaq).await.unwrap();
        assert_eq!(latest, Some(dec("181")));
    }
}
