//! papertrader CLI
//!
//! - `run --venue <us|asx|tsx>`: the long-running venue trading loop
//! - `simulate --cycles N [--dry-run]`: a bounded simulation against a
//!   dedicated test wallet
//! - `metrics [--wallet NAME] [--date YYYY-MM-DD]`: daily metrics viewer
//!
//! Exit codes: 0 success, 1 configuration/startup failure, 130 interrupt.

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use papertrader::models::{VenueClass, Wallet};
use papertrader::risk::RiskVerdict;
use papertrader::{
    AlphaVantageProvider, Config, CycleDriver, ExecutionEngine, FallbackPolicy, LedgerDb,
    MarketDataProvider, PositionSizing, RiskLimits, SessionCalendar, SignalSource, StrategyRunner,
};
use rust_decimal::Decimal;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

const SIM_WALLET_NAME: &str = "LiveSim-Test-10K";

#[derive(Parser)]
#[command(name = "papertrader", about = "Equity paper-trading engine", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the trading loop for a venue
    Run {
        /// Venue class: us, asx or tsx
        #[arg(long)]
        venue: String,
    },
    /// Run a bounded simulation against the LiveSim test wallet
    Simulate {
        /// Number of execution cycles
        #[arg(long, default_value_t = 5)]
        cycles: u32,
        /// Seconds between cycles
        #[arg(long, default_value_t = 60)]
        interval: u64,
        /// Minimum oracle signal score
        #[arg(long)]
        min_score: Option<i64>,
        /// Compute orders without submitting anything
        #[arg(long)]
        dry_run: bool,
    },
    /// View daily strategy metrics
    Metrics {
        /// Filter by wallet name
        #[arg(long)]
        wallet: Option<String>,
        /// Filter by date (YYYY-MM-DD)
        #[arg(long)]
        date: Option<String>,
    },
}

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    match dispatch(cli).await {
        Ok(()) => {
            if INTERRUPTED.load(Ordering::SeqCst) {
                ExitCode::from(130)
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(e) => {
            error!("❌ {e:#}");
            ExitCode::from(1)
        }
    }
}

async fn dispatch(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Run { venue } => run_venue(&venue).await,
        Command::Simulate {
            cycles,
            interval,
            min_score,
            dry_run,
        } => simulate(cycles, interval, min_score, dry_run).await,
        Command::Metrics { wallet, date } => view_metrics(wallet, date).await,
    }
}

struct Stack {
    config: Config,
    ledger: LedgerDb,
    provider: Arc<AlphaVantageProvider>,
    engine: Arc<ExecutionEngine>,
}

fn commission_for(config: &Config, class: VenueClass) -> Decimal {
    match class {
        VenueClass::Asx => config.commission_asx,
        VenueClass::Us | VenueClass::Tsx => config.commission_us,
    }
}

fn build_stack(class: VenueClass, require_realtime: Option<bool>) -> Result<Stack> {
    let config = Config::from_env()?;
    let api_key = config
        .alphavantage_api_key
        .clone()
        .context("ALPHAVANTAGE_API_KEY not set")?;

    let ledger = LedgerDb::open(&config.database_url)?;
    let provider = Arc::new(AlphaVantageProvider::new(
        api_key,
        config.cache_ttl_s,
        config.spread_bps,
        require_realtime.unwrap_or(config.require_realtime),
    ));
    let engine = Arc::new(ExecutionEngine::new(
        ledger.clone(),
        provider.clone() as Arc<dyn MarketDataProvider>,
        commission_for(&config, class),
        config.enable_slippage,
    ));

    Ok(Stack {
        config,
        ledger,
        provider,
        engine,
    })
}

fn build_runner(stack: &Stack, class: VenueClass, min_score: Option<i64>) -> Result<StrategyRunner> {
    let config = &stack.config;
    let signals = SignalSource::open(
        &config.oracle_database_url,
        min_score.unwrap_or(config.min_signal_score),
        config.max_signals,
    )?;

    let fallback = match class {
        VenueClass::Us => FallbackPolicy::us_daily(config.us_fallback_cycles),
        VenueClass::Asx => FallbackPolicy::asx_proof_of_life(config.asx_fallback_cycles),
        VenueClass::Tsx => FallbackPolicy::Disabled,
    };

    let risk = RiskLimits {
        max_concurrent_positions: config.max_positions,
        max_position_pct: config.max_position_pct,
        min_reserve_pct: config.min_reserve_pct,
    };

    Ok(StrategyRunner::new(
        stack.engine.clone(),
        signals,
        fallback,
        risk,
        PositionSizing::EqualWeight,
        SessionCalendar::new(),
        class,
    ))
}

/// Shutdown channel wired to Ctrl-C.
fn shutdown_channel() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("🛑 Shutdown requested");
            INTERRUPTED.store(true, Ordering::SeqCst);
            let _ = tx.send(true);
        }
    });
    rx
}

async fn run_venue(venue: &str) -> Result<()> {
    let class = VenueClass::parse(venue)?;
    let stack = build_stack(class, None)?;
    let runner = Arc::new(build_runner(&stack, class, None)?);

    // ASX runs in proof-of-life mode: first wallet only.
    let wallet_limit = match class {
        VenueClass::Asx => Some(1),
        _ => None,
    };

    let driver = CycleDriver::new(
        stack.engine.clone(),
        runner,
        Duration::from_secs(stack.config.cycle_interval_s),
        wallet_limit,
        shutdown_channel(),
    );
    driver.run().await
}

// =============================================================================
// SIMULATE
// =============================================================================

async fn ensure_sim_wallet(ledger: &LedgerDb) -> Result<Uuid> {
    if let Some(wallet) = ledger.get_wallet_by_name(SIM_WALLET_NAME).await? {
        info!(wallet = SIM_WALLET_NAME, "✅ Using existing test wallet");
        return Ok(wallet.id);
    }

    let now = Utc::now();
    let wallet = Wallet {
        id: Uuid::new_v4(),
        name: SIM_WALLET_NAME.to_string(),
        capital_tier: "10k".to_string(),
        initial_balance: Decimal::from(10_000),
        current_balance: Decimal::from(10_000),
        reserved_balance: Decimal::ZERO,
        created_at: now,
        updated_at: now,
    };
    ledger.insert_wallet(&wallet).await?;
    info!(wallet = SIM_WALLET_NAME, "✅ Created test wallet");
    Ok(wallet.id)
}

async fn print_wallet_summary(engine: &ExecutionEngine, wallet_id: Uuid) -> Result<()> {
    let Some(wallet) = engine.get_wallet(wallet_id).await? else {
        return Ok(());
    };
    let equity = engine.get_wallet_equity(wallet_id).await?;
    let pnl = equity - wallet.initial_balance;
    let pnl_pct = if wallet.initial_balance.is_zero() {
        Decimal::ZERO
    } else {
        pnl / wallet.initial_balance * Decimal::from(100)
    };
    let positions = engine.get_open_positions(wallet_id).await?;

    println!("\n{}", "=".repeat(70));
    println!("WALLET: {}", wallet.name);
    println!("{}", "=".repeat(70));
    println!("Balance:        ${:.2}", wallet.current_balance);
    println!("Buying Power:   ${:.2}", wallet.buying_power());
    println!("Equity:         ${:.2}", equity);
    println!("PnL:            ${pnl:.2} ({pnl_pct:+.2}%)");
    println!("Open Positions: {}", positions.len());

    for pos in &positions {
        if let Some(quote) = engine.market_data().get_quote(&pos.ticker, pos.venue).await {
            println!(
                "  {}: {} shares @ ${:.2} -> ${:.2} ({:+.2}%)",
                pos.ticker,
                pos.quantity,
                pos.avg_entry_price,
                quote.price,
                pos.unrealised_pnl_pct(quote.price)
            );
        }
    }
    Ok(())
}

async fn print_recent_trades(ledger: &LedgerDb, wallet_id: Uuid) -> Result<()> {
    let trades = ledger.list_trades(wallet_id, 10).await?;
    if trades.is_empty() {
        return Ok(());
    }
    println!("\nRECENT TRADES:");
    for t in trades {
        let slip = t
            .slippage_bps
            .map(|s| format!(" (slip: {s:.1} bps)"))
            .unwrap_or_default();
        println!(
            "  {} - {} {} {} @ ${:.4}{slip}",
            t.filled_at.format("%H:%M:%S"),
            t.side.as_str(),
            t.quantity,
            t.ticker,
            t.fill_price,
        );
    }
    Ok(())
}

async fn simulate(cycles: u32, interval: u64, min_score: Option<i64>, dry_run: bool) -> Result<()> {
    println!("{}", "=".repeat(70));
    println!("LIVE PAPER TRADING SIMULATION");
    println!("{}", "=".repeat(70));

    // Simulations insist on realtime quotes; stale data would make the fills
    // meaningless.
    let stack = build_stack(VenueClass::Us, Some(true))?;
    let runner = build_runner(&stack, VenueClass::Us, min_score)?;

    let status = runner.session().status(VenueClass::Us);
    println!("\nMarket: US ({})", status.timezone);
    println!("Status: {}", if status.is_open { "🟢 OPEN" } else { "🔴 CLOSED" });
    println!("Local time: {}", status.local_time);
    if !status.is_open {
        println!("\n⚠️  Market is CLOSED - orders may not execute realistically");
    }

    let wallet_id = ensure_sim_wallet(&stack.ledger).await?;

    if dry_run {
        println!("\n🔬 DRY RUN MODE - orders are computed but never submitted");
    }

    for cycle in 1..=cycles {
        println!("\n{}", "=".repeat(70));
        println!("CYCLE {cycle}/{cycles}");
        println!("{}", "=".repeat(70));

        if stack.provider.circuit_open() {
            println!("🚨 CIRCUIT BREAKER OPEN - skipping cycle");
            continue;
        }

        if dry_run {
            dry_run_cycle(&stack, &runner, wallet_id).await?;
        } else {
            let outcome = runner.run_wallet(wallet_id).await;
            match outcome.error {
                Some(code) => println!("⚠️  {code}"),
                None => {
                    println!("Signals processed: {}", outcome.signals_processed);
                    println!("Orders submitted:  {}", outcome.orders_submitted);
                    println!("Orders rejected:   {}", outcome.orders_rejected);
                    for (ticker, reason) in &outcome.rejections {
                        println!("  ❌ {ticker}: {reason}");
                    }
                }
            }
            runner.snapshot_metrics(wallet_id).await?;
        }

        print_wallet_summary(&stack.engine, wallet_id).await?;
        if !dry_run {
            print_recent_trades(&stack.ledger, wallet_id).await?;
        }

        if cycle < cycles {
            println!("\n⏳ Waiting {interval}s until next cycle...");
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(interval)) => {}
                _ = tokio::signal::ctrl_c() => {
                    INTERRUPTED.store(true, Ordering::SeqCst);
                    println!("\n⚠️  Simulation interrupted");
                    return Ok(());
                }
            }
        }
    }

    println!("\n{}", "=".repeat(70));
    println!("SIMULATION COMPLETE");
    println!("{}", "=".repeat(70));
    print_wallet_summary(&stack.engine, wallet_id).await?;
    Ok(())
}

/// Show what would be submitted, without touching the ledger.
async fn dry_run_cycle(stack: &Stack, runner: &StrategyRunner, wallet_id: Uuid) -> Result<()> {
    let Some(wallet) = stack.engine.get_wallet(wallet_id).await? else {
        return Ok(());
    };
    let positions = stack.engine.get_open_positions(wallet_id).await?;
    let held: Vec<&str> = positions.iter().map(|p| p.ticker.as_str()).collect();

    let signals = runner.signals().top_signals(VenueClass::Us).await?;
    if signals.is_empty() {
        println!("❌ No signals - nothing to compute");
        return Ok(());
    }

    let risk = RiskLimits {
        max_concurrent_positions: stack.config.max_positions,
        max_position_pct: stack.config.max_position_pct,
        min_reserve_pct: stack.config.min_reserve_pct,
    };

    println!("\n📋 WOULD SUBMIT:");
    for signal in &signals {
        if held.contains(&signal.ticker.as_str()) {
            println!("  ⏭️  SKIP {}: already have position", signal.ticker);
            continue;
        }
        let shares = runner.position_size(&wallet, signal, signals.len());
        let estimated_cost = Decimal::from(shares) * signal.price;
        match risk.validate_order(&wallet, estimated_cost, positions.len()) {
            RiskVerdict::Approved => println!(
                "  ✅ BUY {shares} {} @ ${:.2} = ${estimated_cost:.2} (score: {})",
                signal.ticker, signal.price, signal.score
            ),
            RiskVerdict::Rejected(reason) => {
                println!("  ❌ REJECT {}: {reason}", signal.ticker)
            }
        }
    }
    println!("\n🔬 DRY RUN: no orders submitted");
    Ok(())
}

// =============================================================================
// METRICS
// =============================================================================

async fn view_metrics(wallet: Option<String>, date: Option<String>) -> Result<()> {
    let config = Config::from_env()?;
    let ledger = LedgerDb::open(&config.database_url)?;

    let wallet_id = match &wallet {
        Some(name) => Some(
            ledger
                .get_wallet_by_name(name)
                .await?
                .with_context(|| format!("wallet not found: {name}"))?
                .id,
        ),
        None => None,
    };
    let date = date
        .map(|d| NaiveDate::parse_from_str(&d, "%Y-%m-%d").context("date must be YYYY-MM-DD"))
        .transpose()?;

    let rows = ledger.list_metrics(wallet_id, date, 50).await?;
    if rows.is_empty() {
        println!("No metrics found");
        return Ok(());
    }

    println!("{}", "=".repeat(100));
    println!("STRATEGY METRICS");
    println!("{}", "=".repeat(100));
    for row in rows {
        let name = ledger
            .get_wallet(row.wallet_id)
            .await?
            .map(|w| w.name)
            .unwrap_or_else(|| row.wallet_id.to_string());
        let win_rate = row
            .win_rate
            .map(|w| format!("{:.1}%", w * Decimal::from(100)))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{} {:<24} equity ${:>12.2}  pnl ${:>10.2} ({:+.2}%)  trades {:>3} (W:{} L:{})  win {}",
            row.date,
            name,
            row.equity,
            row.pnl,
            row.pnl_pct,
            row.trade_count,
            row.winning_trades,
            row.losing_trades,
            win_rate,
        );
    }
    Ok(())
}
