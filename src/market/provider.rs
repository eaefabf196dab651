//! Pluggable quote source abstraction.

use crate::models::{Quote, Venue};
use async_trait::async_trait;
use rust_decimal::{Decimal, RoundingStrategy};

/// A source of quotes per (ticker, venue).
///
/// Variants: the live Alpha Vantage client, and a mock for tests. Providers
/// own their cache, rate limiting and failure isolation; callers just ask
/// for a quote and get `None` when the source cannot answer.
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    async fn get_quote(&self, ticker: &str, venue: Venue) -> Option<Quote>;

    /// Modelled (bid, ask) for a ticker, given a reference price when the
    /// upstream does not quote one.
    fn spread_model(
        &self,
        ticker: &str,
        venue: Venue,
        price: Option<Decimal>,
    ) -> (Option<Decimal>, Option<Decimal>);

    /// Prime the provider's cache with an externally-known quote, so a
    /// submission against an instrument the upstream cannot serve (e.g. an
    /// ASX LIMIT order priced from the reference table) does not fail on
    /// missing market data. Providers without a cache ignore this.
    fn seed_quote(&self, _quote: Quote) {}
}

/// Symmetric bid/ask around `price` at `spread_bps` basis points of
/// half-spread, rounded to four decimals half-to-even.
pub fn synthesise_spread(price: Decimal, spread_bps: Decimal) -> (Decimal, Decimal) {
    let factor = spread_bps / Decimal::from(10_000);
    let bid = (price * (Decimal::ONE - factor))
        .round_dp_with_strategy(4, RoundingStrategy::MidpointNearestEven);
    let ask = (price * (Decimal::ONE + factor))
        .round_dp_with_strategy(4, RoundingStrategy::MidpointNearestEven);
    (bid, ask)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn spread_is_symmetric_at_ten_bps() {
        let (bid, ask) = synthesise_spread(dec("180"), dec("10"));
        assert_eq!(bid, dec("179.8200"));
        assert_eq!(ask, dec("180.1800"));
    }

    #[test]
    fn spread_rounds_half_to_even() {
        // ask = 1.00005 exactly: half-to-even keeps 1.0000 (half-up would
        // give 1.0001).
        let (_, ask) = synthesise_spread(Decimal::ONE, dec("0.5"));
        assert_eq!(ask, dec("1.0000"));
    }
}
