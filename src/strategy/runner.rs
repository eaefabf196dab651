//! Strategy runner — connects oracle signals to the execution engine.
//!
//! Per wallet, per cycle: session gate, state snapshot, signal pull, sizing,
//! risk gate, submission, metrics snapshot. On signal starvation the shared
//! counter advances at most once per wall-clock minute (however many wallets
//! ask) and the fallback policy takes over; every fallback attempt is
//! journaled.

use crate::engine::{ExecutionEngine, Submission};
use crate::ledger::{JournalEntry, LedgerDb};
use crate::market::SessionCalendar;
use crate::models::{
    MetricsSnapshot, OrderIntent, OrderSide, OrderType, Quote, SignalSnapshot, Venue, VenueClass,
    Wallet,
};
use crate::risk::{RiskLimits, RiskVerdict};
use crate::strategy::fallback::{FallbackIntent, FallbackPolicy};
use crate::strategy::signals::{OracleSignal, SignalSource};
use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionSizing {
    /// Divide buying power equally across the cycle's signals.
    EqualWeight,
    /// Fixed 20% of buying power per signal.
    PercentBuyingPower,
}

/// Per-wallet cycle result. `error` carries the short-circuit reason codes
/// (MARKET_CLOSED, NO_SIGNALS, ...); per-candidate rejections are listed
/// separately and never abort the wallet.
#[derive(Debug, Clone, Default)]
pub struct WalletOutcome {
    pub wallet_id: Option<Uuid>,
    pub wallet_name: String,
    pub error: Option<String>,
    pub signals_processed: usize,
    pub orders_submitted: usize,
    pub orders_rejected: usize,
    pub rejections: Vec<(String, String)>,
    pub fallback_order: Option<(String, i64)>,
}

impl WalletOutcome {
    fn error(name: &str, id: Option<Uuid>, code: &str) -> Self {
        Self {
            wallet_id: id,
            wallet_name: name.to_string(),
            error: Some(code.to_string()),
            ..Default::default()
        }
    }
}

struct Starvation {
    no_signal_cycles: u32,
    last_counted_at: Option<DateTime<Utc>>,
    /// ASX proof-of-life: set once the lifetime trade has gone out.
    fallback_activated: bool,
}

pub struct StrategyRunner {
    engine: Arc<ExecutionEngine>,
    signals: SignalSource,
    fallback: FallbackPolicy,
    risk: RiskLimits,
    sizing: PositionSizing,
    session: SessionCalendar,
    venue_class: VenueClass,
    starvation: Mutex<Starvation>,
}

impl StrategyRunner {
    pub fn new(
        engine: Arc<ExecutionEngine>,
        signals: SignalSource,
        fallback: FallbackPolicy,
        risk: RiskLimits,
        sizing: PositionSizing,
        session: SessionCalendar,
        venue_class: VenueClass,
    ) -> Self {
        Self {
            engine,
            signals,
            fallback,
            risk,
            sizing,
            session,
            venue_class,
            starvation: Mutex::new(Starvation {
                no_signal_cycles: 0,
                last_counted_at: None,
                fallback_activated: false,
            }),
        }
    }

    pub fn session(&self) -> &SessionCalendar {
        &self.session
    }

    pub fn signals(&self) -> &SignalSource {
        &self.signals
    }

    pub fn venue_class(&self) -> VenueClass {
        self.venue_class
    }

    pub fn no_signal_cycles(&self) -> u32 {
        self.starvation.lock().no_signal_cycles
    }

    fn ledger(&self) -> &LedgerDb {
        self.engine.ledger()
    }

    pub async fn run_wallet(&self, wallet_id: Uuid) -> WalletOutcome {
        self.run_wallet_at(wallet_id, Utc::now()).await
    }

    /// Cycle body with an explicit clock, so the session gate and the
    /// starvation dedup are deterministic under test.
    pub async fn run_wallet_at(&self, wallet_id: Uuid, now: DateTime<Utc>) -> WalletOutcome {
        let wallet = match self.engine.get_wallet(wallet_id).await {
            Ok(Some(w)) => w,
            Ok(None) => {
                error!(%wallet_id, "wallet not found");
                return WalletOutcome::error("", Some(wallet_id), "WALLET_NOT_FOUND");
            }
            Err(e) => {
                error!(%wallet_id, error = %format!("{e:#}"), "wallet load failed");
                return WalletOutcome::error("", Some(wallet_id), &format!("SYSTEM_ERROR: {e:#}"));
            }
        };

        info!(wallet = %wallet.name, "🎯 Executing strategy");

        // Session gate first: a closed venue is a clean no-op.
        if !self.session.is_open_at(self.venue_class, now) {
            warn!(venue = self.venue_class.as_str(), "⚠️ Market closed - cycle skipped");
            return WalletOutcome::error(&wallet.name, Some(wallet_id), "MARKET_CLOSED");
        }

        let positions = match self.engine.get_open_positions(wallet_id).await {
            Ok(p) => p,
            Err(e) => {
                return WalletOutcome::error(
                    &wallet.name,
                    Some(wallet_id),
                    &format!("SYSTEM_ERROR: {e:#}"),
                )
            }
        };
        let held: HashSet<String> = positions.iter().map(|p| p.ticker.clone()).collect();

        let signals = match self.signals.top_signals(self.venue_class).await {
            Ok(s) => s,
            Err(e) => {
                return WalletOutcome::error(
                    &wallet.name,
                    Some(wallet_id),
                    &format!("SYSTEM_ERROR: {e:#}"),
                )
            }
        };

        if signals.is_empty() {
            let cycles = self.note_starved_cycle(now);
            return self.run_fallback(&wallet, &held, cycles, now).await;
        }

        // Signals present: starvation over.
        {
            let mut starved = self.starvation.lock();
            starved.no_signal_cycles = 0;
            starved.last_counted_at = None;
        }

        self.execute_signals(&wallet, signals, positions.len(), held)
            .await
    }

    /// Count a starved cycle, at most once per wall-clock minute no matter
    /// how many wallets hit the empty signal set.
    fn note_starved_cycle(&self, now: DateTime<Utc>) -> u32 {
        let mut starved = self.starvation.lock();
        let should_count = match starved.last_counted_at {
            None => true,
            Some(last) => (now - last).num_seconds() >= 60,
        };
        if should_count {
            starved.no_signal_cycles += 1;
            starved.last_counted_at = Some(now);
            warn!(cycles = starved.no_signal_cycles, "No signals found");
        }
        starved.no_signal_cycles
    }

    // =========================================================================
    // SIGNAL EXECUTION
    // =========================================================================

    async fn execute_signals(
        &self,
        wallet: &Wallet,
        signals: Vec<OracleSignal>,
        mut open_positions: usize,
        mut held: HashSet<String>,
    ) -> WalletOutcome {
        let mut outcome = WalletOutcome {
            wallet_id: Some(wallet.id),
            wallet_name: wallet.name.clone(),
            signals_processed: signals.len(),
            ..Default::default()
        };

        let num_signals = signals.len();
        let mut current = wallet.clone();

        for signal in signals {
            if held.contains(&signal.ticker) {
                info!(ticker = %signal.ticker, "⏭️ Skipping - already have position");
                outcome.orders_rejected += 1;
                outcome
                    .rejections
                    .push((signal.ticker.clone(), "DUPLICATE_POSITION".to_string()));
                continue;
            }

            let shares = self.position_size(&current, &signal, num_signals);
            let estimated_cost = Decimal::from(shares) * signal.price;

            if let RiskVerdict::Rejected(reason) =
                self.risk.validate_order(&current, estimated_cost, open_positions)
            {
                warn!(ticker = %signal.ticker, %reason, "❌ Order rejected by risk gate");
                outcome.orders_rejected += 1;
                outcome.rejections.push((signal.ticker.clone(), reason));
                continue;
            }

            // US signals trade on NASDAQ; other markets carry their venue.
            let venue = match signal.market.as_str() {
                "US" => Venue::Nasdaq,
                other => Venue::parse(other).unwrap_or(Venue::Nasdaq),
            };
            let intent = OrderIntent {
                wallet_id: wallet.id,
                ticker: signal.ticker.clone(),
                venue,
                side: OrderSide::Buy,
                order_type: OrderType::Market,
                quantity: shares,
                limit_price: None,
                stop_price: None,
                signal_snapshot: Some(SignalSnapshot {
                    score: signal.score,
                    regime: signal.regime.clone(),
                    confidence: signal.confidence,
                    signal_price: signal.price,
                }),
            };

            info!(
                ticker = %signal.ticker,
                shares,
                score = %signal.score,
                "📝 Submitting signal BUY"
            );
            match self.engine.submit_order(&intent).await {
                Submission::Accepted(order) => {
                    info!(order_id = %order.id, status = order.status.as_str(), "✅ Order submitted");
                    outcome.orders_submitted += 1;
                    held.insert(signal.ticker.clone());

                    // Refresh state that feeds the next candidate's risk check.
                    if let Ok(positions) = self.engine.get_open_positions(wallet.id).await {
                        open_positions = positions.len();
                    }
                    if let Ok(Some(w)) = self.engine.get_wallet(wallet.id).await {
                        current = w;
                    }
                }
                Submission::Rejected(reason) => {
                    error!(ticker = %signal.ticker, %reason, "❌ Order rejected");
                    outcome.orders_rejected += 1;
                    outcome.rejections.push((signal.ticker.clone(), reason));
                }
            }
        }

        outcome
    }

    /// Shares for one candidate under the configured sizing scheme, floored
    /// at a single share. Public so dry runs can show what would be sized.
    pub fn position_size(&self, wallet: &Wallet, signal: &OracleSignal, num_signals: usize) -> i64 {
        let allocation = match self.sizing {
            PositionSizing::EqualWeight => {
                wallet.buying_power() / Decimal::from(num_signals.max(1))
            }
            PositionSizing::PercentBuyingPower => wallet.buying_power() * Decimal::new(20, 2),
        };

        let shares = (allocation / signal.price).trunc().to_i64().unwrap_or(0);
        shares.max(1)
    }

    // =========================================================================
    // FALLBACK PATH
    // =========================================================================

    async fn run_fallback(
        &self,
        wallet: &Wallet,
        held: &HashSet<String>,
        no_signal_cycles: u32,
        now: DateTime<Utc>,
    ) -> WalletOutcome {
        if !self.fallback.should_activate(no_signal_cycles) {
            return WalletOutcome::error(&wallet.name, Some(wallet.id), "NO_SIGNALS");
        }

        if self.fallback.once_per_lifetime() && self.starvation.lock().fallback_activated {
            info!(wallet = %wallet.name, "✅ Proof-of-life trade already executed - standing by");
            return WalletOutcome::error(&wallet.name, Some(wallet.id), "NO_SIGNALS");
        }

        // "Has the wallet already traded today?" guard (UTC day).
        if self.fallback.guards_daily() {
            let start_of_day = now
                .date_naive()
                .and_hms_opt(0, 0, 0)
                .expect("midnight is valid")
                .and_utc();
            match self.ledger().count_trades_since(wallet.id, start_of_day).await {
                Ok(0) => {}
                Ok(_) => {
                    info!(wallet = %wallet.name, "⏭️ Already traded today - fallback skipped");
                    return WalletOutcome::error(
                        &wallet.name,
                        Some(wallet.id),
                        "ALREADY_TRADED_TODAY",
                    );
                }
                Err(e) => {
                    return WalletOutcome::error(
                        &wallet.name,
                        Some(wallet.id),
                        &format!("SYSTEM_ERROR: {e:#}"),
                    )
                }
            }
        }

        let Some(fb) = self.fallback.build_intent(wallet, held) else {
            if self.fallback.once_per_lifetime() {
                // Nothing to do ever again (e.g. the deterministic ticker is
                // already held).
                self.starvation.lock().fallback_activated = true;
            }
            return WalletOutcome::error(&wallet.name, Some(wallet.id), "NO_SIGNALS");
        };

        info!(
            wallet = %wallet.name,
            ticker = %fb.ticker,
            quantity = fb.quantity,
            "🔄 FALLBACK ACTIVATED - placing synthetic order"
        );

        // LIMIT fallbacks are priced from the reference table; seed the
        // provider so admission does not fail on missing market data.
        if let Some(limit) = fb.limit_price {
            let (bid, ask) = self
                .engine
                .market_data()
                .spread_model(&fb.ticker, fb.venue, Some(limit));
            self.engine.market_data().seed_quote(Quote {
                ticker: fb.ticker.clone(),
                venue: fb.venue,
                price: limit,
                bid,
                ask,
                volume: Some(0),
                timestamp: now,
                provider: "reference-price".to_string(),
            });
        }

        let intent = OrderIntent {
            wallet_id: wallet.id,
            ticker: fb.ticker.clone(),
            venue: fb.venue,
            side: OrderSide::Buy,
            order_type: fb.order_type,
            quantity: fb.quantity,
            limit_price: fb.limit_price,
            stop_price: None,
            signal_snapshot: None,
        };

        match self.engine.submit_order(&intent).await {
            Submission::Accepted(order) => {
                info!(
                    wallet = %wallet.name,
                    ticker = %fb.ticker,
                    order_id = %order.id,
                    "✅ FALLBACK ORDER PLACED"
                );
                if self.fallback.once_per_lifetime() {
                    self.starvation.lock().fallback_activated = true;
                }
                self.journal_fallback(wallet, &fb, Some(order.id), "SUBMITTED", None)
                    .await;

                WalletOutcome {
                    wallet_id: Some(wallet.id),
                    wallet_name: wallet.name.clone(),
                    orders_submitted: 1,
                    fallback_order: Some((fb.ticker.clone(), fb.quantity)),
                    ..Default::default()
                }
            }
            Submission::Rejected(reason) => {
                error!(wallet = %wallet.name, %reason, "❌ FALLBACK ORDER FAILED");
                self.journal_fallback(wallet, &fb, None, "FAILED", Some(&reason))
                    .await;

                let mut outcome = WalletOutcome::error(
                    &wallet.name,
                    Some(wallet.id),
                    "FALLBACK_ORDER_FAILED",
                );
                outcome.orders_rejected = 1;
                outcome.rejections.push((fb.ticker.clone(), reason));
                outcome
            }
        }
    }

    /// Journal one fallback attempt, submitted or failed.
    async fn journal_fallback(
        &self,
        wallet: &Wallet,
        fb: &FallbackIntent,
        order_id: Option<Uuid>,
        status: &str,
        error: Option<&str>,
    ) {
        let mut entry = JournalEntry::fallback(wallet.id, self.venue_class.as_str(), &fb.ticker);
        entry.reason_codes = vec![fb.reason.clone()];
        if let Some(e) = error {
            entry.reason_codes.push(e.to_string());
        }
        entry.signal_snapshot = json!({
            "quantity": fb.quantity,
            "price": fb.limit_price.map(|p| p.to_string()),
        });
        entry.order_request = json!({
            "quantity": fb.quantity,
            "order_type": fb.order_type.as_str(),
            "limit_price": fb.limit_price.map(|p| p.to_string()),
        });
        entry.order_response = json!({
            "order_id": order_id.map(|id| id.to_string()),
            "status": status,
        });
        entry.error = error.map(|e| format!("FAILED: {e}"));

        if let Err(e) = self.ledger().insert_journal(&entry).await {
            error!(error = %format!("{e:#}"), "❌ Failed to journal fallback attempt");
        } else {
            info!(ticker = %fb.ticker, quantity = fb.quantity, status, "📝 Journaled fallback");
        }
    }

    // =========================================================================
    // METRICS
    // =========================================================================

    /// Upsert today's metrics row for the wallet.
    pub async fn snapshot_metrics(&self, wallet_id: Uuid) -> Result<()> {
        let Some(wallet) = self.engine.get_wallet(wallet_id).await? else {
            return Ok(());
        };

        let equity = self.engine.get_wallet_equity(wallet_id).await?;
        let pnl = equity - wallet.initial_balance;
        let pnl_pct = if wallet.initial_balance.is_zero() {
            Decimal::ZERO
        } else {
            pnl / wallet.initial_balance * Decimal::from(100)
        };

        let (trade_count, winning_trades) = self.ledger().closed_position_stats(wallet_id).await?;
        let win_rate = if trade_count > 0 {
            Some(Decimal::from(winning_trades) / Decimal::from(trade_count))
        } else {
            None
        };

        let snapshot = MetricsSnapshot {
            wallet_id,
            date: Utc::now().date_naive(),
            equity,
            pnl,
            pnl_pct,
            win_rate,
            trade_count,
            winning_trades,
            // Zero-PnL closes count as losses; declared operator policy.
            losing_trades: trade_count - winning_trades,
        };
        self.ledger().upsert_metrics(&snapshot).await?;

        info!(wallet = %wallet.name, equity = %equity, pnl = %pnl, "📊 Metrics snapshot");
        Ok(())
    }
}
