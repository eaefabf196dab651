//! Mock quote provider for tests — fixed prices, explicit overrides, and a
//! failure switch for breaker/starvation scenarios.

use crate::market::provider::{synthesise_spread, MarketDataProvider};
use crate::models::{Quote, Venue};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

const MOCK_PRICES: &[(&str, &str)] = &[
    ("AAPL", "180.50"),
    ("MSFT", "370.25"),
    ("GOOGL", "140.80"),
    ("AMZN", "175.30"),
    ("TSLA", "245.60"),
    ("BHP.AX", "53.20"),
    ("WBC.AX", "40.85"),
    ("NAB.AX", "38.50"),
];

pub struct MockMarketDataProvider {
    spread_bps: Decimal,
    quotes: Mutex<HashMap<String, Quote>>,
    failing: AtomicBool,
    calls: AtomicU64,
}

impl MockMarketDataProvider {
    pub fn new(spread_bps: Decimal) -> Self {
        Self {
            spread_bps,
            quotes: Mutex::new(HashMap::new()),
            failing: AtomicBool::new(false),
            calls: AtomicU64::new(0),
        }
    }

    fn key(ticker: &str, venue: Venue) -> String {
        format!("{ticker}:{}", venue.as_str())
    }

    /// Pin an exact quote (bid/ask included) for a ticker.
    pub fn set_quote(&self, quote: Quote) {
        self.quotes
            .lock()
            .insert(Self::key(&quote.ticker, quote.venue), quote);
    }

    /// Convenience: pin a price and derive bid/ask from the spread model.
    pub fn set_price(&self, ticker: &str, venue: Venue, price: Decimal) {
        let (bid, ask) = synthesise_spread(price, self.spread_bps);
        self.set_quote(Quote {
            ticker: ticker.to_string(),
            venue,
            price,
            bid: Some(bid),
            ask: Some(ask),
            volume: Some(1_000_000),
            timestamp: Utc::now(),
            provider: "mock".to_string(),
        });
    }

    /// When failing, every quote request returns `None`.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MarketDataProvider for MockMarketDataProvider {
    async fn get_quote(&self, ticker: &str, venue: Venue) -> Option<Quote> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return None;
        }

        if let Some(quote) = self.quotes.lock().get(&Self::key(ticker, venue)) {
            return Some(quote.clone());
        }

        let raw = MOCK_PRICES.iter().find(|(t, _)| *t == ticker)?.1;
        let price = Decimal::from_str(raw).expect("valid mock price");
        let (bid, ask) = self.spread_model(ticker, venue, Some(price));
        Some(Quote {
            ticker: ticker.to_string(),
            venue,
            price,
            bid,
            ask,
            volume: Some(1_000_000),
            timestamp: Utc::now(),
            provider: "mock".to_string(),
        })
    }

    fn spread_model(
        &self,
        _ticker: &str,
        _venue: Venue,
        price: Option<Decimal>,
    ) -> (Option<Decimal>, Option<Decimal>) {
        match price {
            Some(p) => {
                let (bid, ask) = synthesise_spread(p, self.spread_bps);
                (Some(bid), Some(ask))
            }
            None => (None, None),
        }
    }

    fn seed_quote(&self, quote: Quote) {
        self.set_quote(quote);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[tokio::test]
    async fn mock_serves_table_prices_with_spread() {
        let mock = MockMarketDataProvider::new(dec("10"));
        let quote = mock.get_quote("AAPL", Venue::Nasdaq).await.unwrap();
        assert_eq!(quote.price, dec("180.50"));
        assert!(quote.bid.unwrap() < quote.price);
        assert!(quote.ask.unwrap() > quote.price);
        assert!(mock.get_quote("UNKNOWN", Venue::Nasdaq).await.is_none());
    }

    #[tokio::test]
    async fn overrides_and_failure_switch() {
        let mock = MockMarketDataProvider::new(dec("10"));
        mock.set_price("AAPL", Venue::Nasdaq, dec("200"));
        let quote = mock.get_quote("AAPL", Venue::Nasdaq).await.unwrap();
        assert_eq!(quote.price, dec("200"));

        mock.set_failing(true);
        assert!(mock.get_quote("AAPL", Venue::Nasdaq).await.is_none());
        assert_eq!(mock.call_count(), 2);
    }
}
