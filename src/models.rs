//! Core domain types for the paper trading engine
//!
//! Everything monetary is a `rust_decimal::Decimal` — never a binary float.
//! Enumerated columns round-trip through stable strings so the ledger stays
//! readable with plain SQL.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Trading venue an instrument is listed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Venue {
    Asx,
    Nasdaq,
    Nyse,
    Tsx,
}

/// Venue class used by the session gate and the signal source. NASDAQ and
/// NYSE share the US session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VenueClass {
    Us,
    Asx,
    Tsx,
}

impl Venue {
    pub fn as_str(&self) -> &'static str {
        match self {
            Venue::Asx => "ASX",
            Venue::Nasdaq => "NASDAQ",
            Venue::Nyse => "NYSE",
            Venue::Tsx => "TSX",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "ASX" => Ok(Venue::Asx),
            "NASDAQ" => Ok(Venue::Nasdaq),
            "NYSE" => Ok(Venue::Nyse),
            "TSX" => Ok(Venue::Tsx),
            other => bail!("unknown venue: {other}"),
        }
    }

    pub fn class(&self) -> VenueClass {
        match self {
            Venue::Nasdaq | Venue::Nyse => VenueClass::Us,
            Venue::Asx => VenueClass::Asx,
            Venue::Tsx => VenueClass::Tsx,
        }
    }
}

impl VenueClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            VenueClass::Us => "US",
            VenueClass::Asx => "ASX",
            VenueClass::Tsx => "TSX",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "US" => Ok(VenueClass::Us),
            "ASX" => Ok(VenueClass::Asx),
            "TSX" => Ok(VenueClass::Tsx),
            other => bail!("unknown venue class: {other}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "BUY" => Ok(OrderSide::Buy),
            "SELL" => Ok(OrderSide::Sell),
            other => bail!("unknown order side: {other}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
    Stop,
    StopLimit,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "MARKET",
            OrderType::Limit => "LIMIT",
            OrderType::Stop => "STOP",
            OrderType::StopLimit => "STOP_LIMIT",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "MARKET" => Ok(OrderType::Market),
            "LIMIT" => Ok(OrderType::Limit),
            "STOP" => Ok(OrderType::Stop),
            "STOP_LIMIT" => Ok(OrderType::StopLimit),
            other => bail!("unknown order type: {other}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    Submitted,
    Partial,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Submitted => "SUBMITTED",
            OrderStatus::Partial => "PARTIAL",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Rejected => "REJECTED",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(OrderStatus::Pending),
            "SUBMITTED" => Ok(OrderStatus::Submitted),
            "PARTIAL" => Ok(OrderStatus::Partial),
            "FILLED" => Ok(OrderStatus::Filled),
            "CANCELLED" => Ok(OrderStatus::Cancelled),
            "REJECTED" => Ok(OrderStatus::Rejected),
            other => bail!("unknown order status: {other}"),
        }
    }

    /// PENDING, SUBMITTED and PARTIAL orders can still fill.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            OrderStatus::Pending | OrderStatus::Submitted | OrderStatus::Partial
        )
    }
}

/// Snapshot of the upstream signal that motivated an order, persisted on the
/// order row for auditing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalSnapshot {
    pub score: Decimal,
    pub regime: Option<String>,
    pub confidence: Option<Decimal>,
    pub signal_price: Decimal,
}

/// A trading intent before any order record exists.
#[derive(Debug, Clone)]
pub struct OrderIntent {
    pub wallet_id: Uuid,
    pub ticker: String,
    pub venue: Venue,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: i64,
    pub limit_price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub signal_snapshot: Option<SignalSnapshot>,
}

impl OrderIntent {
    /// Structural validation: price fields required by the order type,
    /// positive quantity.
    pub fn validate(&self) -> Result<()> {
        if self.quantity <= 0 {
            bail!("quantity must be positive");
        }
        if matches!(self.order_type, OrderType::Limit | OrderType::StopLimit)
            && self.limit_price.is_none()
        {
            bail!("{} requires limit_price", self.order_type.as_str());
        }
        if matches!(self.order_type, OrderType::Stop | OrderType::StopLimit)
            && self.stop_price.is_none()
        {
            bail!("{} requires stop_price", self.order_type.as_str());
        }
        Ok(())
    }
}

/// Order record, mirrors the `orders` table.
#[derive(Debug, Clone)]
pub struct Order {
    pub id: Uuid,
    pub wallet_id: Uuid,
    pub ticker: String,
    pub venue: Venue,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: i64,
    pub filled_quantity: i64,
    pub limit_price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub avg_fill_price: Option<Decimal>,
    pub status: OrderStatus,
    pub rejection_reason: Option<String>,
    pub signal_snapshot: Option<SignalSnapshot>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub filled_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    pub fn remaining_quantity(&self) -> i64 {
        self.quantity - self.filled_quantity
    }
}

/// Point-in-time quote for (ticker, venue).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub ticker: String,
    pub venue: Venue,
    pub price: Decimal,
    pub bid: Option<Decimal>,
    pub ask: Option<Decimal>,
    pub volume: Option<i64>,
    pub timestamp: DateTime<Utc>,
    pub provider: String,
}

impl Quote {
    /// Mid-point of bid/ask, falling back to the last price.
    pub fn mid(&self) -> Decimal {
        match (self.bid, self.ask) {
            (Some(bid), Some(ask)) => (bid + ask) / Decimal::TWO,
            _ => self.price,
        }
    }

    pub fn spread(&self) -> Option<Decimal> {
        match (self.bid, self.ask) {
            (Some(bid), Some(ask)) => Some(ask - bid),
            _ => None,
        }
    }

    pub fn spread_bps(&self) -> Option<Decimal> {
        let spread = self.spread()?;
        let mid = self.mid();
        if mid.is_zero() {
            return None;
        }
        Some(spread / mid * Decimal::from(10_000))
    }
}

/// Immutable fill record, mirrors the `trades` table. Append-only.
#[derive(Debug, Clone)]
pub struct Trade {
    pub id: Uuid,
    pub order_id: Uuid,
    pub wallet_id: Uuid,
    pub ticker: String,
    pub venue: Venue,
    pub side: OrderSide,
    pub quantity: i64,
    pub fill_price: Decimal,
    pub slippage_bps: Option<Decimal>,
    pub commission: Decimal,
    pub gross_amount: Decimal,
    pub net_amount: Decimal,
    pub quote_bid: Option<Decimal>,
    pub quote_ask: Option<Decimal>,
    pub quote_mid: Option<Decimal>,
    pub filled_at: DateTime<Utc>,
}

impl Trade {
    /// Build a trade from a fill against a quote.
    ///
    /// gross = quantity × fill_price; net = gross + commission for BUY,
    /// gross − commission for SELL. Slippage is measured against the
    /// quote mid in basis points.
    pub fn from_fill(
        order: &Order,
        quantity: i64,
        fill_price: Decimal,
        quote: &Quote,
        commission: Decimal,
    ) -> Self {
        let gross_amount = Decimal::from(quantity) * fill_price;
        let net_amount = match order.side {
            OrderSide::Buy => gross_amount + commission,
            OrderSide::Sell => gross_amount - commission,
        };

        let mid = quote.mid();
        let slippage_bps = if mid.is_zero() {
            None
        } else {
            Some((fill_price - mid) / mid * Decimal::from(10_000))
        };

        Self {
            id: Uuid::new_v4(),
            order_id: order.id,
            wallet_id: order.wallet_id,
            ticker: order.ticker.clone(),
            venue: order.venue,
            side: order.side,
            quantity,
            fill_price,
            slippage_bps,
            commission,
            gross_amount,
            net_amount,
            quote_bid: quote.bid,
            quote_ask: quote.ask,
            quote_mid: Some(mid),
            filled_at: Utc::now(),
        }
    }
}

/// Open long holding per (wallet, ticker, venue), mirrors the `positions`
/// table. At most one open position per key.
#[derive(Debug, Clone)]
pub struct Position {
    pub id: Uuid,
    pub wallet_id: Uuid,
    pub ticker: String,
    pub venue: Venue,
    pub quantity: i64,
    pub avg_entry_price: Decimal,
    pub total_cost: Decimal,
    pub realised_pnl: Decimal,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    pub fn is_open(&self) -> bool {
        self.quantity != 0 && self.closed_at.is_none()
    }

    pub fn unrealised_pnl(&self, mark: Decimal) -> Decimal {
        Decimal::from(self.quantity) * mark - self.total_cost
    }

    pub fn unrealised_pnl_pct(&self, mark: Decimal) -> Decimal {
        if self.total_cost.is_zero() {
            return Decimal::ZERO;
        }
        self.unrealised_pnl(mark) / self.total_cost * Decimal::from(100)
    }
}

/// A strategy's capital envelope, mirrors the `wallets` table.
#[derive(Debug, Clone)]
pub struct Wallet {
    pub id: Uuid,
    pub name: String,
    pub capital_tier: String,
    pub initial_balance: Decimal,
    pub current_balance: Decimal,
    pub reserved_balance: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    /// Capital available for new orders.
    pub fn buying_power(&self) -> Decimal {
        self.current_balance - self.reserved_balance
    }

    pub fn can_afford(&self, amount: Decimal) -> bool {
        self.buying_power() >= amount
    }
}

/// One row per (wallet, date) in `strategy_metrics`, upserted each cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub wallet_id: Uuid,
    pub date: chrono::NaiveDate,
    pub equity: Decimal,
    pub pnl: Decimal,
    pub pnl_pct: Decimal,
    pub win_rate: Option<Decimal>,
    pub trade_count: i64,
    pub winning_trades: i64,
    pub losing_trades: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn venue_strings_round_trip() {
        for v in [Venue::Asx, Venue::Nasdaq, Venue::Nyse, Venue::Tsx] {
            assert_eq!(Venue::parse(v.as_str()).unwrap(), v);
        }
        assert!(Venue::parse("LSE").is_err());
    }

    #[test]
    fn quote_mid_and_spread() {
        let quote = Quote {
            ticker: "AAPL".into(),
            venue: Venue::Nasdaq,
            price: dec("180"),
            bid: Some(dec("179.82")),
            ask: Some(dec("180.18")),
            volume: Some(1_000_000),
            timestamp: Utc::now(),
            provider: "mock".into(),
        };
        assert_eq!(quote.mid(), dec("180.00"));
        assert_eq!(quote.spread().unwrap(), dec("0.36"));
        assert_eq!(quote.spread_bps().unwrap(), dec("20"));
    }

    #[test]
    fn quote_mid_falls_back_to_price() {
        let quote = Quote {
            ticker: "AAPL".into(),
            venue: Venue::Nasdaq,
            price: dec("180"),
            bid: None,
            ask: None,
            volume: None,
            timestamp: Utc::now(),
            provider: "mock".into(),
        };
        assert_eq!(quote.mid(), dec("180"));
        assert!(quote.spread().is_none());
    }

    #[test]
    fn intent_validation() {
        let mut intent = OrderIntent {
            wallet_id: Uuid::new_v4(),
            ticker: "AAPL".into(),
            venue: Venue::Nasdaq,
            side: OrderSide::Buy,
            order_type: OrderType::Limit,
            quantity: 10,
            limit_price: None,
            stop_price: None,
            signal_snapshot: None,
        };
        assert!(intent.validate().is_err());
        intent.limit_price = Some(dec("100"));
        assert!(intent.validate().is_ok());
        intent.quantity = 0;
        assert!(intent.validate().is_err());
    }

    #[test]
    fn trade_amounts_by_side() {
        let order = Order {
            id: Uuid::new_v4(),
            wallet_id: Uuid::new_v4(),
            ticker: "AAPL".into(),
            venue: Venue::Nasdaq,
            side: OrderSide::Buy,
            order_type: OrderType::Market,
            quantity: 10,
            filled_quantity: 0,
            limit_price: None,
            stop_price: None,
            avg_fill_price: None,
            status: OrderStatus::Submitted,
            rejection_reason: None,
            signal_snapshot: None,
            submitted_at: None,
            filled_at: None,
            cancelled_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let quote = Quote {
            ticker: "AAPL".into(),
            venue: Venue::Nasdaq,
            price: dec("180"),
            bid: Some(dec("179.82")),
            ask: Some(dec("180.18")),
            volume: None,
            timestamp: Utc::now(),
            provider: "mock".into(),
        };

        let buy = Trade::from_fill(&order, 10, dec("180.18"), &quote, dec("1"));
        assert_eq!(buy.gross_amount, dec("1801.80"));
        assert_eq!(buy.net_amount, dec("1802.80"));

        let mut sell_order = order.clone();
        sell_order.side = OrderSide::Sell;
        let sell = Trade::from_fill(&sell_order, 10, dec("179.82"), &quote, dec("1"));
        assert_eq!(sell.gross_amount, dec("1798.20"));
        assert_eq!(sell.net_amount, dec("1797.20"));
    }
}
