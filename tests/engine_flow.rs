//! End-to-end order flow through the public API: submission, fills, wallet
//! and position accounting, risk gating, starvation fallback and the session
//! gate. Zero commission and no slippage unless a case says otherwise.

use chrono::{DateTime, Duration, Utc};
use papertrader::models::{
    OrderIntent, OrderSide, OrderStatus, OrderType, Quote, Venue, VenueClass, Wallet,
};
use papertrader::{
    ExecutionEngine, FallbackPolicy, LedgerDb, MarketDataProvider, MockMarketDataProvider,
    PositionSizing, RiskLimits, SessionCalendar, SignalSource, StrategyRunner, Submission,
};
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

/// Wednesday 2024-06-12 15:00 UTC: US session open.
fn us_open_instant() -> DateTime<Utc> {
    chrono::NaiveDateTime::parse_from_str("2024-06-12 15:00:00", "%Y-%m-%d %H:%M:%S")
        .unwrap()
        .and_utc()
}

struct Harness {
    ledger: LedgerDb,
    mock: Arc<MockMarketDataProvider>,
    engine: Arc<ExecutionEngine>,
    _dir: tempfile::TempDir,
}

async fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let ledger = LedgerDb::open(dir.path().join("ledger.db").to_str().unwrap()).unwrap();
    let mock = Arc::new(MockMarketDataProvider::new(dec("10")));
    let engine = Arc::new(ExecutionEngine::new(
        ledger.clone(),
        mock.clone() as Arc<dyn MarketDataProvider>,
        Decimal::ZERO,
        false,
    ));
    Harness {
        ledger,
        mock,
        engine,
        _dir: dir,
    }
}

async fn create_wallet(ledger: &LedgerDb, name: &str, initial: &str) -> Wallet {
    let now = Utc::now();
    let wallet = Wallet {
        id: Uuid::new_v4(),
        name: name.to_string(),
        capital_tier: "10k".to_string(),
        initial_balance: dec(initial),
        current_balance: dec(initial),
        reserved_balance: Decimal::ZERO,
        created_at: now,
        updated_at: now,
    };
    ledger.insert_wallet(&wallet).await.unwrap();
    wallet
}

fn quote(ticker: &str, price: &str, bid: &str, ask: &str) -> Quote {
    Quote {
        ticker: ticker.to_string(),
        venue: Venue::Nasdaq,
        price: dec(price),
        bid: Some(dec(bid)),
        ask: Some(dec(ask)),
        volume: Some(1_000_000),
        timestamp: Utc::now(),
        provider: "mock".to_string(),
    }
}

fn market_intent(wallet_id: Uuid, ticker: &str, side: OrderSide, quantity: i64) -> OrderIntent {
    OrderIntent {
        wallet_id,
        ticker: ticker.to_string(),
        venue: Venue::Nasdaq,
        side,
        order_type: OrderType::Market,
        quantity,
        limit_price: None,
        stop_price: None,
        signal_snapshot: None,
    }
}

fn accepted(result: Submission) -> papertrader::models::Order {
    match result {
        Submission::Accepted(order) => order,
        Submission::Rejected(reason) => panic!("unexpected rejection: {reason}"),
    }
}

#[tokio::test]
async fn simple_buy_settles_exactly() {
    let h = harness().await;
    let wallet = create_wallet(&h.ledger, "Scenario-One", "10000").await;
    h.mock.set_quote(quote("AAPL", "180", "179.82", "180.18"));

    let order = accepted(
        h.engine
            .submit_order(&market_intent(wallet.id, "AAPL", OrderSide::Buy, 10))
            .await,
    );

    assert_eq!(order.status, OrderStatus::Filled);
    assert_eq!(order.filled_quantity, 10);
    assert_eq!(order.avg_fill_price.unwrap(), dec("180.18"));

    let wallet = h.engine.get_wallet(wallet.id).await.unwrap().unwrap();
    assert_eq!(wallet.current_balance, dec("8198.20"));
    assert_eq!(wallet.reserved_balance, Decimal::ZERO);

    let positions = h.engine.get_open_positions(wallet.id).await.unwrap();
    assert_eq!(positions.len(), 1);
    assert_eq!(positions[0].quantity, 10);
    assert_eq!(positions[0].avg_entry_price, dec("180.18"));
    assert_eq!(positions[0].total_cost, dec("1801.80"));

    // Conservation: cash + position cost is the initial balance (zero
    // commission).
    assert_eq!(
        wallet.current_balance + positions[0].total_cost,
        dec("10000")
    );

    let trades = h.ledger.list_trades(wallet.id, 10).await.unwrap();
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].fill_price, dec("180.18"));
    assert_eq!(trades[0].gross_amount, dec("1801.80"));
    assert_eq!(trades[0].net_amount, dec("1801.80"));
    assert_eq!(trades[0].quote_bid.unwrap(), dec("179.82"));
    assert_eq!(trades[0].quote_ask.unwrap(), dec("180.18"));
}

#[tokio::test]
async fn partial_then_full_sell_realises_pnl() {
    let h = harness().await;
    let wallet = create_wallet(&h.ledger, "Scenario-Two", "10000").await;
    h.mock.set_quote(quote("AAPL", "180", "179.82", "180.18"));

    accepted(
        h.engine
            .submit_order(&market_intent(wallet.id, "AAPL", OrderSide::Buy, 10))
            .await,
    );

    // Market rallies; bid is exactly 181.00.
    h.mock.set_quote(quote("AAPL", "181.18", "181.00", "181.36"));

    let sell = accepted(
        h.engine
            .submit_order(&market_intent(wallet.id, "AAPL", OrderSide::Sell, 5))
            .await,
    );
    assert_eq!(sell.status, OrderStatus::Filled);
    assert_eq!(sell.avg_fill_price.unwrap(), dec("181.00"));

    let wallet_mid = h.engine.get_wallet(wallet.id).await.unwrap().unwrap();
    assert_eq!(wallet_mid.current_balance, dec("9103.20"));

    let positions = h.engine.get_open_positions(wallet.id).await.unwrap();
    assert_eq!(positions[0].quantity, 5);
    assert_eq!(positions[0].total_cost, dec("900.90"));
    // realised = 5 x 181.00 - 5 x 180.18 = 4.10
    assert_eq!(positions[0].realised_pnl, dec("4.10"));

    // Close the rest.
    accepted(
        h.engine
            .submit_order(&market_intent(wallet.id, "AAPL", OrderSide::Sell, 5))
            .await,
    );

    let wallet_end = h.engine.get_wallet(wallet.id).await.unwrap().unwrap();
    assert_eq!(wallet_end.current_balance, dec("10008.20"));
    assert!(h.engine.get_open_positions(wallet.id).await.unwrap().is_empty());

    // The closed position kept its cumulative realised PnL and counts as a
    // win.
    let (total, winning) = h.ledger.closed_position_stats(wallet.id).await.unwrap();
    assert_eq!((total, winning), (1, 1));

    // Round trip law: realised = q x (sell - buy) with zero commission.
    let trades = h.ledger.list_trades(wallet.id, 10).await.unwrap();
    assert_eq!(trades.len(), 3);
}

#[tokio::test]
async fn risk_gate_rejects_oversized_position() {
    // Wallet $1,000 initial; a $5,000 order breaches the 20% cap of $200.
    let h = harness().await;
    let wallet = create_wallet(&h.ledger, "Scenario-Three", "1000").await;

    let limits = RiskLimits::default();
    let verdict = limits.validate_order(&wallet, dec("5000"), 0);
    let reason = verdict.rejection().expect("must reject");
    assert!(reason.starts_with("POSITION_TOO_LARGE"), "got: {reason}");

    // Nothing reached the ledger.
    assert!(h.ledger.list_trades(wallet.id, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn oversell_is_rejected_without_state_change() {
    let h = harness().await;
    let wallet = create_wallet(&h.ledger, "Scenario-Four", "10000").await;
    h.mock.set_quote(quote("AAPL", "180", "179.82", "180.18"));

    accepted(
        h.engine
            .submit_order(&market_intent(wallet.id, "AAPL", OrderSide::Buy, 5))
            .await,
    );
    let before = h.engine.get_wallet(wallet.id).await.unwrap().unwrap();
    let trades_before = h.ledger.list_trades(wallet.id, 10).await.unwrap().len();

    // SELL 10 against a 5-share position: the fill aborts, the order stays
    // active, and no wallet/position/trade write survives.
    let order = accepted(
        h.engine
            .submit_order(&market_intent(wallet.id, "AAPL", OrderSide::Sell, 10))
            .await,
    );
    assert_eq!(order.status, OrderStatus::Submitted);
    assert_eq!(order.filled_quantity, 0);

    let after = h.engine.get_wallet(wallet.id).await.unwrap().unwrap();
    assert_eq!(after.current_balance, before.current_balance);
    assert_eq!(
        h.ledger.list_trades(wallet.id, 10).await.unwrap().len(),
        trades_before
    );
    let positions = h.engine.get_open_positions(wallet.id).await.unwrap();
    assert_eq!(positions[0].quantity, 5);
}

#[tokio::test]
async fn starvation_triggers_fallback_once_per_wallet() {
    let h = harness().await;
    let momentum = create_wallet(&h.ledger, "Momentum-Long", "10000").await;
    let value = create_wallet(&h.ledger, "Value-Deep", "10000").await;
    h.mock.set_price("NVDA", Venue::Nasdaq, dec("480"));
    h.mock.set_price("BRK.B", Venue::Nasdaq, dec("420"));

    let dir = tempfile::tempdir().unwrap();
    let signals = SignalSource::open(dir.path().join("s.db").to_str().unwrap(), 70, 5).unwrap();
    let runner = StrategyRunner::new(
        h.engine.clone(),
        signals,
        FallbackPolicy::us_daily(3),
        RiskLimits::default(),
        PositionSizing::EqualWeight,
        SessionCalendar::new(),
        VenueClass::Us,
    );

    // Three one-minute-spaced starved cycles over both wallets.
    let t0 = us_open_instant();
    for minute in 0..3 {
        let now = t0 + Duration::seconds(60 * minute);
        runner.run_wallet_at(momentum.id, now).await;
        runner.run_wallet_at(value.id, now + Duration::seconds(5)).await;
    }
    assert_eq!(runner.no_signal_cycles(), 3);

    // The third cycle activated the fallback for each wallet exactly once.
    for wallet in [&momentum, &value] {
        let journal = h.ledger.list_journal(wallet.id, 10).await.unwrap();
        assert_eq!(journal.len(), 1, "wallet {}", wallet.name);
        let (mode, reason_codes, error) = &journal[0];
        assert_eq!(mode, "FALLBACK");
        assert!(!reason_codes.is_empty());
        assert!(error.is_none());
    }

    // Pool tickers differ per strategy wallet.
    let m_trades = h.ledger.list_trades(momentum.id, 10).await.unwrap();
    let v_trades = h.ledger.list_trades(value.id, 10).await.unwrap();
    assert_eq!(m_trades[0].ticker, "NVDA");
    assert_eq!(v_trades[0].ticker, "BRK.B");
}

#[tokio::test]
async fn market_closed_short_circuits_without_side_effects() {
    let h = harness().await;
    let wallet = create_wallet(&h.ledger, "Scenario-Six", "10000").await;

    let dir = tempfile::tempdir().unwrap();
    let signals = SignalSource::open(dir.path().join("s.db").to_str().unwrap(), 70, 5).unwrap();
    signals
        .insert_signal("AAPL", 90.0, dec("180.50"), VenueClass::Us)
        .await
        .unwrap();
    let runner = StrategyRunner::new(
        h.engine.clone(),
        signals,
        FallbackPolicy::us_daily(1),
        RiskLimits::default(),
        PositionSizing::EqualWeight,
        SessionCalendar::new(),
        VenueClass::Us,
    );

    // Saturday 2024-06-15.
    let saturday = chrono::NaiveDateTime::parse_from_str("2024-06-15 15:00:00", "%Y-%m-%d %H:%M:%S")
        .unwrap()
        .and_utc();
    let outcome = runner.run_wallet_at(wallet.id, saturday).await;

    assert_eq!(outcome.error.as_deref(), Some("MARKET_CLOSED"));
    assert_eq!(outcome.orders_submitted, 0);
    // No quote was requested and nothing was written.
    assert_eq!(h.mock.call_count(), 0);
    assert!(h.ledger.list_trades(wallet.id, 10).await.unwrap().is_empty());
    assert!(h.ledger.list_journal(wallet.id, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn commissioned_round_trip_matches_law() {
    // realised = q x (sell - buy) - (commission_buy + commission_sell)
    let dir = tempfile::tempdir().unwrap();
    let ledger = LedgerDb::open(dir.path().join("ledger.db").to_str().unwrap()).unwrap();
    let mock = Arc::new(MockMarketDataProvider::new(dec("10")));
    let engine = ExecutionEngine::new(
        ledger.clone(),
        mock.clone() as Arc<dyn MarketDataProvider>,
        dec("1.00"),
        false,
    );
    let wallet = create_wallet(&ledger, "Commission-Law", "10000").await;

    mock.set_quote(quote("AAPL", "180", "179.82", "180.18"));
    accepted(engine.submit_order(&market_intent(wallet.id, "AAPL", OrderSide::Buy, 10)).await);

    mock.set_quote(quote("AAPL", "181.18", "181.00", "181.36"));
    accepted(engine.submit_order(&market_intent(wallet.id, "AAPL", OrderSide::Sell, 10)).await);

    let (total, _) = ledger.closed_position_stats(wallet.id).await.unwrap();
    assert_eq!(total, 1);

    // Position PnL: 10 x (181.00 - 180.18) = 8.20; the buy-side commission
    // sits in the cost basis and the sell-side commission is deducted, so
    // realised = 8.20 - 1.00 (sell) - 1.00 (buy, via basis) = 6.20.
    let trades = ledger.list_trades(wallet.id, 10).await.unwrap();
    let sell = trades.iter().find(|t| t.side == OrderSide::Sell).unwrap();
    assert_eq!(sell.net_amount, dec("1809.00"));
    let buy = trades.iter().find(|t| t.side == OrderSide::Buy).unwrap();
    assert_eq!(buy.net_amount, dec("1802.80"));

    let wallet_end = engine.get_wallet(wallet.id).await.unwrap().unwrap();
    // 10000 - 1802.80 + 1809.00
    assert_eq!(wallet_end.current_balance, dec("10006.20"));
}
