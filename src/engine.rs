//! Paper trading execution engine
//!
//! Order flow:
//! 1. `submit_order(intent)` — admit or reject, reserving buying power for BUYs
//! 2. `match_and_fill(order_id)` — advance an active order against the market
//! 3. fill application — wallet + position + trade + order mutate in ONE
//!    ledger transaction; any failure rolls back all four writes
//!
//! Rejections are values with stable reason codes; only genuine internal
//! failures surface as `SYSTEM_ERROR:<detail>`.

use crate::ledger::{db, LedgerDb};
use crate::market::MarketDataProvider;
use crate::models::{
    Order, OrderIntent, OrderSide, OrderStatus, OrderType, Position, Quote, Trade, Wallet,
};
use anyhow::{bail, Context, Result};
use chrono::Utc;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Outcome of order admission.
#[derive(Debug)]
pub enum Submission {
    Accepted(Order),
    Rejected(String),
}

impl Submission {
    pub fn rejection(&self) -> Option<&str> {
        match self {
            Submission::Rejected(reason) => Some(reason),
            Submission::Accepted(_) => None,
        }
    }
}

pub struct ExecutionEngine {
    ledger: LedgerDb,
    market_data: Arc<dyn MarketDataProvider>,
    commission_per_trade: Decimal,
    enable_slippage: bool,
}

impl ExecutionEngine {
    pub fn new(
        ledger: LedgerDb,
        market_data: Arc<dyn MarketDataProvider>,
        commission_per_trade: Decimal,
        enable_slippage: bool,
    ) -> Self {
        Self {
            ledger,
            market_data,
            commission_per_trade,
            enable_slippage,
        }
    }

    pub fn ledger(&self) -> &LedgerDb {
        &self.ledger
    }

    pub fn market_data(&self) -> &Arc<dyn MarketDataProvider> {
        &self.market_data
    }

    // =========================================================================
    // ORDER SUBMISSION
    // =========================================================================

    /// Submit an order intent. MARKET orders are matched immediately after
    /// the admission transaction commits.
    pub async fn submit_order(&self, intent: &OrderIntent) -> Submission {
        info!(
            side = intent.side.as_str(),
            quantity = intent.quantity,
            ticker = %intent.ticker,
            "📥 Submitting order"
        );

        if let Err(e) = intent.validate() {
            return Submission::Rejected(format!("SYSTEM_ERROR: {e}"));
        }

        // Wallet existence gates everything else.
        match self.ledger.get_wallet(intent.wallet_id).await {
            Ok(Some(_)) => {}
            Ok(None) => return Submission::Rejected("WALLET_NOT_FOUND".to_string()),
            Err(e) => return Submission::Rejected(format!("SYSTEM_ERROR: {e:#}")),
        }

        let quote = match self.market_data.get_quote(&intent.ticker, intent.venue).await {
            Some(q) => q,
            None => return Submission::Rejected("NO_MARKET_DATA".to_string()),
        };

        match self.admit(intent, &quote).await {
            Ok(Submission::Accepted(order)) => {
                info!(order_id = %order.id, status = order.status.as_str(), "✅ Order submitted");

                if intent.order_type == OrderType::Market {
                    self.match_and_fill(order.id).await;
                    // Return the post-fill view of the order.
                    if let Ok(Some(updated)) = self.ledger.get_order(order.id).await {
                        return Submission::Accepted(updated);
                    }
                }
                Submission::Accepted(order)
            }
            Ok(rejected) => rejected,
            Err(e) => {
                error!(error = %format!("{e:#}"), "❌ Order submission failed");
                Submission::Rejected(format!("SYSTEM_ERROR: {e:#}"))
            }
        }
    }

    /// Admission transaction: load wallet, persist the quote for later
    /// mark-to-market, check buying power, insert the order and reserve
    /// funds for BUYs.
    async fn admit(&self, intent: &OrderIntent, quote: &Quote) -> Result<Submission> {
        let intent = intent.clone();
        let quote = quote.clone();
        let commission = self.commission_per_trade;

        self.ledger
            .with_tx(move |tx| {
                let now = Utc::now();

                let wallet = match db::get_wallet(tx, intent.wallet_id)? {
                    Some(w) => w,
                    None => return Ok(Submission::Rejected("WALLET_NOT_FOUND".to_string())),
                };

                db::upsert_market_quote(tx, &quote)?;

                let estimated_price = match intent.order_type {
                    OrderType::Market => match intent.side {
                        OrderSide::Buy => quote.ask.unwrap_or(quote.price),
                        OrderSide::Sell => quote.bid.unwrap_or(quote.price),
                    },
                    OrderType::Limit | OrderType::StopLimit => {
                        intent.limit_price.context("limit order without price")?
                    }
                    OrderType::Stop => intent.stop_price.context("stop order without price")?,
                };
                let estimated_amount = Decimal::from(intent.quantity) * estimated_price;

                let mut required = Decimal::ZERO;
                if intent.side == OrderSide::Buy {
                    required = estimated_amount + commission;
                    if !wallet.can_afford(required) {
                        return Ok(Submission::Rejected(format!(
                            "INSUFFICIENT_FUNDS (need: ${required:.2}, have: ${:.2})",
                            wallet.buying_power()
                        )));
                    }
                }

                let order = Order {
                    id: Uuid::new_v4(),
                    wallet_id: intent.wallet_id,
                    ticker: intent.ticker.clone(),
                    venue: intent.venue,
                    side: intent.side,
                    order_type: intent.order_type,
                    quantity: intent.quantity,
                    filled_quantity: 0,
                    limit_price: intent.limit_price,
                    stop_price: intent.stop_price,
                    avg_fill_price: None,
                    status: OrderStatus::Submitted,
                    rejection_reason: None,
                    signal_snapshot: intent.signal_snapshot.clone(),
                    submitted_at: Some(now),
                    filled_at: None,
                    cancelled_at: None,
                    created_at: now,
                    updated_at: now,
                };
                db::insert_order(tx, &order)?;

                if intent.side == OrderSide::Buy {
                    db::reserve_funds(tx, intent.wallet_id, required, now)?;
                }

                Ok(Submission::Accepted(order))
            })
            .await
    }

    // =========================================================================
    // ORDER MATCHING & FILLING
    // =========================================================================

    /// Attempt to advance an active order. Returns true when a fill was
    /// applied. Non-fillable LIMIT orders stay SUBMITTED for the next cycle.
    pub async fn match_and_fill(&self, order_id: Uuid) -> bool {
        debug!(%order_id, "🔄 Matching order");

        let order = match self.ledger.get_order(order_id).await {
            Ok(Some(o)) => o,
            Ok(None) => {
                error!(%order_id, "order not found");
                return false;
            }
            Err(e) => {
                error!(%order_id, error = %format!("{e:#}"), "order load failed");
                return false;
            }
        };

        if !order.is_active() {
            warn!(%order_id, status = order.status.as_str(), "order not active");
            return false;
        }

        let quote = match self.market_data.get_quote(&order.ticker, order.venue).await {
            Some(q) => q,
            None => {
                warn!(ticker = %order.ticker, "no market data for fill");
                return false;
            }
        };

        let fill_price = match self.calculate_fill_price(&order, &quote) {
            Some(p) => p,
            None => {
                debug!(%order_id, "not fillable at current prices");
                return false;
            }
        };

        // Full remaining fill; liquidity-constrained partials would slot in
        // here.
        let fill_quantity = order.remaining_quantity();
        let trade = Trade::from_fill(&order, fill_quantity, fill_price, &quote, self.commission_per_trade);

        match self.apply_fill(&order, &trade, fill_quantity).await {
            Ok(status) => {
                info!(
                    %order_id,
                    quantity = fill_quantity,
                    price = %fill_price,
                    status = status.as_str(),
                    "✅ Order filled"
                );
                true
            }
            Err(e) => {
                error!(%order_id, error = %format!("{e:#}"), "❌ Fill failed");
                false
            }
        }
    }

    /// Fill price per order type.
    ///
    /// MARKET crosses the spread (ask for BUY, bid for SELL) with an optional
    /// uniform half-spread slippage draw; LIMIT fills only when the opposing
    /// side breaches the limit. STOP/STOP_LIMIT are reserved but not
    /// fillable yet.
    fn calculate_fill_price(&self, order: &Order, quote: &Quote) -> Option<Decimal> {
        match order.order_type {
            OrderType::Market => {
                let base = match order.side {
                    OrderSide::Buy => quote.ask.unwrap_or(quote.price),
                    OrderSide::Sell => quote.bid.unwrap_or(quote.price),
                };

                let fill = match (self.enable_slippage, quote.spread()) {
                    (true, Some(spread)) => {
                        use rand::Rng;
                        let draw: f64 = rand::thread_rng().gen_range(-0.5..=0.5);
                        let factor = Decimal::from_f64(draw).unwrap_or(Decimal::ZERO);
                        base + spread * factor
                    }
                    _ => base,
                };
                Some(fill.round_dp_with_strategy(4, RoundingStrategy::MidpointNearestEven))
            }
            OrderType::Limit => {
                let limit = order.limit_price?;
                match order.side {
                    OrderSide::Buy => quote.ask.filter(|ask| *ask <= limit),
                    OrderSide::Sell => quote.bid.filter(|bid| *bid >= limit),
                }
            }
            OrderType::Stop | OrderType::StopLimit => None,
        }
    }

    /// Apply a fill atomically: trade insert, order update, wallet and
    /// position mutation — one commit, or none of it.
    async fn apply_fill(
        &self,
        order: &Order,
        trade: &Trade,
        fill_quantity: i64,
    ) -> Result<OrderStatus> {
        let order = order.clone();
        let trade = trade.clone();

        self.ledger
            .with_tx(move |tx| {
                let now = Utc::now();

                db::insert_trade(tx, &trade)?;

                let new_filled = order.filled_quantity + fill_quantity;
                let status = if new_filled >= order.quantity {
                    OrderStatus::Filled
                } else {
                    OrderStatus::Partial
                };
                let avg_fill = match order.avg_fill_price {
                    Some(prev) => {
                        (prev * Decimal::from(order.filled_quantity)
                            + trade.fill_price * Decimal::from(fill_quantity))
                            / Decimal::from(new_filled)
                    }
                    None => trade.fill_price,
                };
                let filled_at = (status == OrderStatus::Filled).then_some(now);
                db::update_order_fill(tx, order.id, new_filled, avg_fill, status, filled_at, now)?;

                match order.side {
                    OrderSide::Buy => {
                        db::settle_buy(tx, order.wallet_id, trade.net_amount, now)?;
                        apply_buy_to_position(tx, &order, &trade, fill_quantity, now)?;
                    }
                    OrderSide::Sell => {
                        db::settle_sell(tx, order.wallet_id, trade.net_amount, now)?;
                        apply_sell_to_position(tx, &order, &trade, fill_quantity, now)?;
                    }
                }

                Ok(status)
            })
            .await
    }

    // =========================================================================
    // QUERIES
    // =========================================================================

    pub async fn get_wallet(&self, wallet_id: Uuid) -> Result<Option<Wallet>> {
        self.ledger.get_wallet(wallet_id).await
    }

    pub async fn get_open_positions(&self, wallet_id: Uuid) -> Result<Vec<Position>> {
        self.ledger.get_open_positions(wallet_id).await
    }

    /// Wallet equity: cash plus open positions marked at the latest quote.
    /// A position the provider cannot price falls back to the stored quote
    /// history; with no stored quote either it is carried at cost basis and
    /// the shortfall flagged.
    pub async fn get_wallet_equity(&self, wallet_id: Uuid) -> Result<Decimal> {
        let wallet = match self.ledger.get_wallet(wallet_id).await? {
            Some(w) => w,
            None => return Ok(Decimal::ZERO),
        };

        let mut equity = wallet.current_balance;
        for position in self.ledger.get_open_positions(wallet_id).await? {
            let mark = match self
                .market_data
                .get_quote(&position.ticker, position.venue)
                .await
            {
                Some(quote) => Some(quote.price),
                None => {
                    self.ledger
                        .latest_quote_price(&position.ticker, position.venue)
                        .await?
                }
            };
            match mark {
                Some(price) => equity += Decimal::from(position.quantity) * price,
                None => {
                    warn!(
                        ticker = %position.ticker,
                        "no mark for position; using cost basis"
                    );
                    equity += position.total_cost;
                }
            }
        }
        Ok(equity)
    }
}

/// BUY position mutation: average up an existing open position or create a
/// new one. Cost basis carries the commission (net amount).
fn apply_buy_to_position(
    tx: &rusqlite::Transaction<'_>,
    order: &Order,
    trade: &Trade,
    fill_quantity: i64,
    now: chrono::DateTime<Utc>,
) -> Result<()> {
    match db::find_open_position(tx, order.wallet_id, &order.ticker, order.venue)? {
        Some(position) => {
            let new_qty = position.quantity + fill_quantity;
            let new_cost = position.total_cost + trade.net_amount;
            let new_avg = new_cost / Decimal::from(new_qty);
            db::update_position(
                tx,
                position.id,
                new_qty,
                new_avg,
                new_cost,
                position.realised_pnl,
                None,
                now,
            )?;
        }
        None => {
            db::insert_position(
                tx,
                &Position {
                    id: Uuid::new_v4(),
                    wallet_id: order.wallet_id,
                    ticker: order.ticker.clone(),
                    venue: order.venue,
                    quantity: fill_quantity,
                    avg_entry_price: trade.fill_price,
                    total_cost: trade.net_amount,
                    realised_pnl: Decimal::ZERO,
                    opened_at: now,
                    closed_at: None,
                    updated_at: now,
                },
            )?;
        }
    }
    Ok(())
}

/// SELL position mutation: reduce the open position, realise PnL against the
/// average entry, close at zero quantity. Aborts the surrounding transaction
/// when there is nothing (or not enough) to sell.
fn apply_sell_to_position(
    tx: &rusqlite::Transaction<'_>,
    order: &Order,
    trade: &Trade,
    fill_quantity: i64,
    now: chrono::DateTime<Utc>,
) -> Result<()> {
    let position = match db::find_open_position(tx, order.wallet_id, &order.ticker, order.venue)? {
        Some(p) => p,
        None => bail!("OVERSELL: no open position in {}", order.ticker),
    };

    if fill_quantity > position.quantity {
        bail!(
            "OVERSELL: {} > {} held in {}",
            fill_quantity,
            position.quantity,
            order.ticker
        );
    }

    let cost_basis_sold = position.avg_entry_price * Decimal::from(fill_quantity);
    let realised = trade.gross_amount - cost_basis_sold - trade.commission;

    let new_qty = position.quantity - fill_quantity;
    let new_cost = position.total_cost - cost_basis_sold;
    let new_realised = position.realised_pnl + realised;

    if new_qty == 0 {
        db::update_position(
            tx,
            position.id,
            0,
            position.avg_entry_price,
            Decimal::ZERO,
            new_realised,
            Some(now),
            now,
        )?;
    } else {
        db::update_position(
            tx,
            position.id,
            new_qty,
            position.avg_entry_price,
            new_cost,
            new_realised,
            None,
            now,
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::MockMarketDataProvider;
    use crate::models::Venue;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    struct Fixture {
        engine: ExecutionEngine,
        mock: Arc<MockMarketDataProvider>,
        wallet_id: Uuid,
        _dir: tempfile::TempDir,
    }

    async fn fixture(initial_balance: &str) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.db");
        let ledger = LedgerDb::open(path.to_str().unwrap()).unwrap();

        let now = Utc::now();
        let wallet = Wallet {
            id: Uuid::new_v4(),
            name: "Engine-Test".to_string(),
            capital_tier: "10k".to_string(),
            initial_balance: dec(initial_balance),
            current_balance: dec(initial_balance),
            reserved_balance: Decimal::ZERO,
            created_at: now,
            updated_at: now,
        };
        ledger.insert_wallet(&wallet).await.unwrap();

        let mock = Arc::new(MockMarketDataProvider::new(dec("10")));
        let engine = ExecutionEngine::new(
            ledger,
            mock.clone() as Arc<dyn MarketDataProvider>,
            Decimal::ZERO,
            false,
        );

        Fixture {
            engine,
            mock,
            wallet_id: wallet.id,
            _dir: dir,
        }
    }

    fn aapl_quote() -> Quote {
        Quote {
            ticker: "AAPL".to_string(),
            venue: Venue::Nasdaq,
            price: dec("180"),
            bid: Some(dec("179.82")),
            ask: Some(dec("180.18")),
            volume: Some(1_000_000),
            timestamp: Utc::now(),
            provider: "mock".to_string(),
        }
    }

    fn market_buy(wallet_id: Uuid, quantity: i64) -> OrderIntent {
        OrderIntent {
            wallet_id,
            ticker: "AAPL".to_string(),
            venue: Venue::Nasdaq,
            side: OrderSide::Buy,
            order_type: OrderType::Market,
            quantity,
            limit_price: None,
            stop_price: None,
            signal_snapshot: None,
        }
    }

    #[tokio::test]
    async fn market_buy_fills_at_ask_and_settles() {
        let f = fixture("10000").await;
        f.mock.set_quote(aapl_quote());

        let result = f.engine.submit_order(&market_buy(f.wallet_id, 10)).await;
        let order = match result {
            Submission::Accepted(o) => o,
            Submission::Rejected(r) => panic!("rejected: {r}"),
        };
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.filled_quantity, 10);
        assert_eq!(order.avg_fill_price.unwrap(), dec("180.18"));

        let wallet = f.engine.get_wallet(f.wallet_id).await.unwrap().unwrap();
        assert_eq!(wallet.current_balance, dec("8198.20"));
        assert_eq!(wallet.reserved_balance, Decimal::ZERO);
        assert_eq!(wallet.buying_power(), dec("8198.20"));

        let positions = f.engine.get_open_positions(f.wallet_id).await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].quantity, 10);
        assert_eq!(positions[0].avg_entry_price, dec("180.18"));
        assert_eq!(positions[0].total_cost, dec("1801.80"));
    }

    #[tokio::test]
    async fn insufficient_funds_rejected_before_any_write() {
        let f = fixture("1000").await;
        f.mock.set_quote(aapl_quote());

        let result = f.engine.submit_order(&market_buy(f.wallet_id, 100)).await;
        let reason = result.rejection().expect("should reject");
        assert!(reason.starts_with("INSUFFICIENT_FUNDS"), "got: {reason}");

        let wallet = f.engine.get_wallet(f.wallet_id).await.unwrap().unwrap();
        assert_eq!(wallet.current_balance, dec("1000"));
        assert_eq!(wallet.reserved_balance, Decimal::ZERO);
    }

    #[tokio::test]
    async fn unknown_wallet_and_missing_data_reject() {
        let f = fixture("10000").await;
        f.mock.set_quote(aapl_quote());

        let ghost = market_buy(Uuid::new_v4(), 1);
        assert_eq!(
            f.engine.submit_order(&ghost).await.rejection(),
            Some("WALLET_NOT_FOUND")
        );

        let mut no_data = market_buy(f.wallet_id, 1);
        no_data.ticker = "UNKNOWN".to_string();
        assert_eq!(
            f.engine.submit_order(&no_data).await.rejection(),
            Some("NO_MARKET_DATA")
        );
    }

    #[tokio::test]
    async fn oversell_aborts_without_state_change() {
        let f = fixture("10000").await;
        f.mock.set_quote(aapl_quote());

        assert!(f
            .engine
            .submit_order(&market_buy(f.wallet_id, 5))
            .await
            .rejection()
            .is_none());
        let balance_before = f
            .engine
            .get_wallet(f.wallet_id)
            .await
            .unwrap()
            .unwrap()
            .current_balance;

        let mut sell = market_buy(f.wallet_id, 10);
        sell.side = OrderSide::Sell;
        let result = f.engine.submit_order(&sell).await;
        // Admission accepts the SELL; the fill aborts on OVERSELL and the
        // order stays active with no wallet or position change.
        let order = match result {
            Submission::Accepted(o) => o,
            Submission::Rejected(r) => panic!("rejected: {r}"),
        };
        assert_eq!(order.status, OrderStatus::Submitted);
        assert_eq!(order.filled_quantity, 0);

        let wallet = f.engine.get_wallet(f.wallet_id).await.unwrap().unwrap();
        assert_eq!(wallet.current_balance, balance_before);
        let positions = f.engine.get_open_positions(f.wallet_id).await.unwrap();
        assert_eq!(positions[0].quantity, 5);
    }

    #[tokio::test]
    async fn limit_buy_rests_until_ask_crosses() {
        let f = fixture("10000").await;
        f.mock.set_quote(aapl_quote());

        let intent = OrderIntent {
            wallet_id: f.wallet_id,
            ticker: "AAPL".to_string(),
            venue: Venue::Nasdaq,
            side: OrderSide::Buy,
            order_type: OrderType::Limit,
            quantity: 10,
            limit_price: Some(dec("179.00")),
            stop_price: None,
            signal_snapshot: None,
        };
        let order = match f.engine.submit_order(&intent).await {
            Submission::Accepted(o) => o,
            Submission::Rejected(r) => panic!("rejected: {r}"),
        };
        assert_eq!(order.status, OrderStatus::Submitted);

        // Ask 180.18 > 179 limit: not fillable.
        assert!(!f.engine.match_and_fill(order.id).await);

        // Market falls: ask 178.9 <= limit, fill at the ask.
        let mut cheaper = aapl_quote();
        cheaper.price = dec("178.72");
        cheaper.bid = Some(dec("178.54"));
        cheaper.ask = Some(dec("178.90"));
        f.mock.set_quote(cheaper);

        assert!(f.engine.match_and_fill(order.id).await);
        let filled = f.engine.ledger().get_order(order.id).await.unwrap().unwrap();
        assert_eq!(filled.status, OrderStatus::Filled);
        assert_eq!(filled.avg_fill_price.unwrap(), dec("178.90"));

        // Reservation was made at the limit estimate; release capped at net.
        let wallet = f.engine.get_wallet(f.wallet_id).await.unwrap().unwrap();
        assert_eq!(wallet.current_balance, dec("10000") - dec("1789.00"));
        assert_eq!(wallet.reserved_balance, dec("1.00"));
    }

    #[tokio::test]
    async fn stop_orders_are_reserved_but_not_fillable() {
        let f = fixture("10000").await;
        f.mock.set_quote(aapl_quote());

        let intent = OrderIntent {
            wallet_id: f.wallet_id,
            ticker: "AAPL".to_string(),
            venue: Venue::Nasdaq,
            side: OrderSide::Buy,
            order_type: OrderType::Stop,
            quantity: 1,
            limit_price: None,
            stop_price: Some(dec("185.00")),
            signal_snapshot: None,
        };
        let order = match f.engine.submit_order(&intent).await {
            Submission::Accepted(o) => o,
            Submission::Rejected(r) => panic!("rejected: {r}"),
        };
        assert!(!f.engine.match_and_fill(order.id).await);
        let still = f.engine.ledger().get_order(order.id).await.unwrap().unwrap();
        assert_eq!(still.status, OrderStatus::Submitted);
    }

    #[tokio::test]
    async fn equity_marks_positions_at_latest_quote() {
        let f = fixture("10000").await;
        f.mock.set_quote(aapl_quote());
        f.engine.submit_order(&market_buy(f.wallet_id, 10)).await;

        // Price moves to 181: equity = 8198.20 + 10 x 181.
        f.mock.set_price("AAPL", Venue::Nasdaq, dec("181"));
        let equity = f.engine.get_wallet_equity(f.wallet_id).await.unwrap();
        assert_eq!(equity, dec("8198.20") + dec("1810"));
    }
}
