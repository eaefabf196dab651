//! Cycle driver — the long-running per-venue loop.
//!
//! Each cycle: session check, resting-order rescan, sequential wallet
//! fan-out, metrics snapshots, sleep. Failures are contained at two
//! boundaries: a failed wallet never stops the cycle, and a failed cycle
//! never stops the driver. The shutdown signal is honoured between wallets.

use crate::engine::ExecutionEngine;
use crate::ledger::LedgerDb;
use crate::models::VenueClass;
use crate::strategy::StrategyRunner;
use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Wallets with this name prefix are reserved for tests and never traded by
/// the driver.
pub const TEST_WALLET_PREFIX: &str = "Test-Wallet-";

pub struct CycleDriver {
    engine: Arc<ExecutionEngine>,
    runner: Arc<StrategyRunner>,
    venue_class: VenueClass,
    cycle_interval: Duration,
    /// Proof-of-life mode: only run the first N wallets (ASX runs one).
    wallet_limit: Option<usize>,
    shutdown: watch::Receiver<bool>,
}

impl CycleDriver {
    pub fn new(
        engine: Arc<ExecutionEngine>,
        runner: Arc<StrategyRunner>,
        cycle_interval: Duration,
        wallet_limit: Option<usize>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let venue_class = runner.venue_class();
        Self {
            engine,
            runner,
            venue_class,
            cycle_interval,
            wallet_limit,
            shutdown,
        }
    }

    fn ledger(&self) -> &LedgerDb {
        self.engine.ledger()
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Sleep one interval, waking early on shutdown. Returns true when the
    /// driver should exit.
    async fn sleep_cycle(&mut self) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.cycle_interval) => false,
            _ = self.shutdown.changed() => *self.shutdown.borrow(),
        }
    }

    pub async fn run(mut self) -> Result<()> {
        info!(
            venue = self.venue_class.as_str(),
            interval_s = self.cycle_interval.as_secs(),
            "🚀 Trading runner started"
        );

        let mut cycle: u64 = 0;
        loop {
            if self.shutdown_requested() {
                break;
            }
            cycle += 1;

            info!("{}", "=".repeat(60));
            info!(cycle, now = %Utc::now().format("%Y-%m-%d %H:%M:%S"), "Cycle start");
            info!("{}", "=".repeat(60));

            if let Err(e) = self.run_cycle(cycle).await {
                // Outer boundary: log and keep going.
                error!(cycle, error = %format!("{e:#}"), "❌ Cycle error");
            }

            if self.sleep_cycle().await {
                break;
            }
        }

        info!(venue = self.venue_class.as_str(), "🏁 Runner stopped");
        Ok(())
    }

    async fn run_cycle(&mut self, cycle: u64) -> Result<()> {
        let status = self.runner.session().status(self.venue_class);
        info!(
            venue = self.venue_class.as_str(),
            open = status.is_open,
            local_time = %status.local_time,
            "Market status"
        );
        if !status.is_open {
            if let Some(wait) = status.seconds_until_open {
                info!(
                    next_open_in_s = wait,
                    "Market closed - simulation paused"
                );
            }
            return Ok(());
        }

        // Resting LIMIT orders never re-enter matching on their own; give
        // each one a chance against fresh prices.
        match self.ledger().list_active_resting_orders(self.venue_class).await {
            Ok(order_ids) => {
                for order_id in order_ids {
                    if self.shutdown_requested() {
                        return Ok(());
                    }
                    self.engine.match_and_fill(order_id).await;
                }
            }
            Err(e) => warn!(error = %format!("{e:#}"), "resting order scan failed"),
        }

        let mut wallets = self.ledger().list_active_wallets(TEST_WALLET_PREFIX).await?;
        if let Some(limit) = self.wallet_limit {
            wallets.truncate(limit);
        }
        info!(count = wallets.len(), "Strategy wallets loaded");

        for wallet in wallets {
            if self.shutdown_requested() {
                info!("🛑 Shutdown requested - finishing cycle early");
                return Ok(());
            }

            let outcome = self.runner.run_wallet(wallet.id).await;
            match outcome.error.as_deref() {
                None => {
                    info!(
                        wallet = %wallet.name,
                        submitted = outcome.orders_submitted,
                        rejected = outcome.orders_rejected,
                        "✅ Wallet cycle complete"
                    );
                    if let Some((ticker, quantity)) = &outcome.fallback_order {
                        info!(wallet = %wallet.name, ticker = %ticker, quantity, "└─ FALLBACK trade");
                    }
                    if let Err(e) = self.runner.snapshot_metrics(wallet.id).await {
                        error!(wallet = %wallet.name, error = %format!("{e:#}"), "metrics snapshot failed");
                    }
                }
                Some("MARKET_CLOSED") | Some("NO_SIGNALS") | Some("ALREADY_TRADED_TODAY") => {
                    info!(wallet = %wallet.name, status = outcome.error.as_deref().unwrap_or(""), "⏭️ Skipped");
                }
                Some(other) => {
                    warn!(wallet = %wallet.name, error = other, "⚠️ Wallet cycle error");
                }
            }
        }

        info!(cycle, "✅ Cycle complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::{MarketDataProvider, MockMarketDataProvider, SessionCalendar};
    use crate::models::Wallet;
    use crate::risk::RiskLimits;
    use crate::strategy::{FallbackPolicy, PositionSizing, SignalSource};
    use rust_decimal::Decimal;
    use std::str::FromStr;
    use uuid::Uuid;

    #[tokio::test]
    async fn driver_honours_shutdown_and_skips_closed_market() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = LedgerDb::open(dir.path().join("l.db").to_str().unwrap()).unwrap();
        let now = Utc::now();
        ledger
            .insert_wallet(&Wallet {
                id: Uuid::new_v4(),
                name: "Momentum-Long".to_string(),
                capital_tier: "10k".to_string(),
                initial_balance: Decimal::from_str("10000").unwrap(),
                current_balance: Decimal::from_str("10000").unwrap(),
                reserved_balance: Decimal::ZERO,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();

        let mock = Arc::new(MockMarketDataProvider::new(Decimal::from(10)));
        let engine = Arc::new(ExecutionEngine::new(
            ledger,
            mock as Arc<dyn MarketDataProvider>,
            Decimal::ZERO,
            false,
        ));
        let signals =
            SignalSource::open(dir.path().join("s.db").to_str().unwrap(), 70, 5).unwrap();
        let runner = Arc::new(StrategyRunner::new(
            engine.clone(),
            signals,
            FallbackPolicy::Disabled,
            RiskLimits::default(),
            PositionSizing::EqualWeight,
            SessionCalendar::new(),
            VenueClass::Us,
        ));

        let (tx, rx) = watch::channel(false);
        let driver = CycleDriver::new(engine, runner, Duration::from_secs(60), None, rx);

        let handle = tokio::spawn(driver.run());
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();

        // The driver exits cleanly between cycles.
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("driver should stop")
            .unwrap()
            .unwrap();
    }
}
