//! Alpha Vantage quote client
//!
//! GLOBAL_QUOTE with the Premium realtime entitlement (150 req/min). The
//! provider owns a TTL quote cache, a two-level rate limiter (minimum
//! inter-request interval plus a rolling per-minute counter with a safety
//! margin) and a circuit breaker that opens after consecutive failures.
//! Recovery from OPEN is an explicit operator reset; there is no half-open
//! probing.

use crate::market::provider::{synthesise_spread, MarketDataProvider};
use crate::models::{Quote, Venue};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

const ALPHA_VANTAGE_BASE: &str = "https://www.alphavantage.co/query";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const RATE_LIMIT_SAFETY_MARGIN: u32 = 5;
const MAX_BACKOFF_SECS: u64 = 60;

/// Conservative reference prices served while the breaker is open and the
/// caller tolerates non-realtime data. Deliberately static.
const REFERENCE_PRICES: &[(&str, &str)] = &[
    // Tech
    ("AAPL", "180"),
    ("MSFT", "410"),
    ("GOOGL", "140"),
    ("AMZN", "180"),
    ("NVDA", "480"),
    ("META", "490"),
    ("TSLA", "200"),
    ("AMD", "160"),
    // Value
    ("BRK.B", "420"),
    ("JPM", "200"),
    ("JNJ", "150"),
    ("PG", "170"),
    ("KO", "63"),
    ("V", "270"),
    // ETFs
    ("SPY", "550"),
    ("QQQ", "480"),
    ("DIA", "430"),
    ("IWM", "215"),
    ("XLK", "220"),
    ("XLF", "42"),
    ("XLE", "85"),
    ("XLV", "145"),
    ("XLI", "125"),
    // Volatility
    ("VXX", "45"),
    ("UVXY", "18"),
    ("VIXY", "16"),
];

const DEFAULT_REFERENCE_PRICE: &str = "150";

fn reference_price(ticker: &str) -> Decimal {
    let raw = REFERENCE_PRICES
        .iter()
        .find(|(t, _)| *t == ticker)
        .map(|(_, p)| *p)
        .unwrap_or(DEFAULT_REFERENCE_PRICE);
    Decimal::from_str(raw).expect("valid reference price")
}

struct RateLimiter {
    min_interval: Duration,
    per_minute_limit: u32,
    last_request: Option<Instant>,
    window_start: Instant,
    requests_this_minute: u32,
}

impl RateLimiter {
    fn new(requests_per_minute: u32) -> Self {
        Self {
            min_interval: Duration::from_secs_f64(60.0 / requests_per_minute.max(1) as f64),
            per_minute_limit: requests_per_minute,
            last_request: None,
            window_start: Instant::now(),
            requests_this_minute: 0,
        }
    }
}

struct CircuitBreaker {
    consecutive_failures: u32,
    threshold: u32,
    open: bool,
}

impl CircuitBreaker {
    fn new(threshold: u32) -> Self {
        Self {
            consecutive_failures: 0,
            threshold,
            open: false,
        }
    }

    fn record_failure(&mut self) {
        self.consecutive_failures += 1;
        if !self.open && self.consecutive_failures >= self.threshold {
            self.open = true;
            error!(
                failures = self.consecutive_failures,
                "🚨 Circuit breaker OPENED - market data provider unavailable, manual reset required"
            );
        }
    }

    fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    fn reset(&mut self) {
        self.consecutive_failures = 0;
        self.open = false;
    }
}

struct CachedQuote {
    quote: Quote,
    fetched_at: Instant,
}

pub struct AlphaVantageProvider {
    client: Client,
    base_url: String,
    api_key: String,
    cache_ttl: Duration,
    use_spread_model: bool,
    spread_bps: Decimal,
    require_realtime: bool,
    cache: Mutex<HashMap<String, CachedQuote>>,
    limiter: tokio::sync::Mutex<RateLimiter>,
    breaker: Mutex<CircuitBreaker>,
}

impl AlphaVantageProvider {
    pub fn new(
        api_key: String,
        cache_ttl_s: u64,
        spread_bps: Decimal,
        require_realtime: bool,
    ) -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent("papertrader/0.1 (paper trading engine)")
            .build()
            .expect("build http client");

        Self {
            client,
            base_url: ALPHA_VANTAGE_BASE.to_string(),
            api_key,
            cache_ttl: Duration::from_secs(cache_ttl_s),
            use_spread_model: true,
            spread_bps,
            require_realtime,
            cache: Mutex::new(HashMap::new()),
            // Premium tier: 150 requests/minute.
            limiter: tokio::sync::Mutex::new(RateLimiter::new(150)),
            breaker: Mutex::new(CircuitBreaker::new(5)),
        }
    }

    /// Point the provider at a different endpoint. Test hook.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn circuit_open(&self) -> bool {
        self.breaker.lock().open
    }

    /// Operator reset of the breaker; the only way out of OPEN.
    pub fn reset_circuit(&self) {
        self.breaker.lock().reset();
        info!("Circuit breaker reset");
    }

    fn cache_key(ticker: &str, venue: Venue) -> String {
        format!("{ticker}:{}", venue.as_str())
    }

    fn check_cache(&self, ticker: &str, venue: Venue) -> Option<Quote> {
        let cache = self.cache.lock();
        let cached = cache.get(&Self::cache_key(ticker, venue))?;
        let age = cached.fetched_at.elapsed();
        if age < self.cache_ttl {
            debug!(ticker, age_s = age.as_secs(), "quote cache hit");
            return Some(cached.quote.clone());
        }
        None
    }

    fn update_cache(&self, quote: Quote) {
        let key = Self::cache_key(&quote.ticker, quote.venue);
        self.cache.lock().insert(
            key,
            CachedQuote {
                quote,
                fetched_at: Instant::now(),
            },
        );
    }

    /// Two-level rate limit: sleep out the minute window when the counter
    /// nears the ceiling, then enforce the minimum inter-request interval.
    /// Utilisation is logged whenever the window rolls.
    async fn rate_limit(&self) {
        let mut rl = self.limiter.lock().await;

        let now = Instant::now();
        if now.duration_since(rl.window_start) >= Duration::from_secs(60) {
            info!(
                "📊 API usage last minute: {} requests",
                rl.requests_this_minute
            );
            rl.requests_this_minute = 0;
            rl.window_start = now;
        }

        if rl.requests_this_minute + RATE_LIMIT_SAFETY_MARGIN >= rl.per_minute_limit {
            let elapsed = now.duration_since(rl.window_start);
            let wait = Duration::from_secs(60).saturating_sub(elapsed);
            if !wait.is_zero() {
                warn!(wait_s = wait.as_secs_f64(), "⚠️ Approaching rate limit, sleeping to minute roll");
                sleep(wait).await;
            }
            rl.requests_this_minute = 0;
            rl.window_start = Instant::now();
        }

        if let Some(last) = rl.last_request {
            let elapsed = last.elapsed();
            if elapsed < rl.min_interval {
                sleep(rl.min_interval - elapsed).await;
            }
        }

        rl.last_request = Some(Instant::now());
        rl.requests_this_minute += 1;
    }

    /// Deterministic conservative quote served while the breaker is open and
    /// the caller declared `require_realtime = false`. Tagged so downstream
    /// audit rows show the fallback path.
    fn synthetic_quote(&self, ticker: &str, venue: Venue) -> Quote {
        let price = reference_price(ticker);
        let (bid, ask) = synthesise_spread(price, self.spread_bps);
        Quote {
            ticker: ticker.to_string(),
            venue,
            price,
            bid: Some(bid),
            ask: Some(ask),
            volume: Some(1_000_000),
            timestamp: Utc::now(),
            provider: "synthetic-fallback".to_string(),
        }
    }

    async fn fetch_global_quote(&self, ticker: &str) -> Option<Value> {
        let params = [
            ("function", "GLOBAL_QUOTE"),
            ("symbol", ticker),
            ("entitlement", "realtime"),
            ("apikey", self.api_key.as_str()),
        ];

        debug!(ticker, "fetching realtime quote");
        let mut response = match self.client.get(&self.base_url).query(&params).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(ticker, error = %e, "quote request failed");
                self.breaker.lock().record_failure();
                return None;
            }
        };

        // 429: back off once (bounded), then retry exactly once.
        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            let failures = {
                let mut breaker = self.breaker.lock();
                breaker.record_failure();
                breaker.consecutive_failures
            };
            let backoff = Duration::from_secs(2u64.pow(failures.min(6)).min(MAX_BACKOFF_SECS));
            warn!(ticker, backoff_s = backoff.as_secs(), "⚠️ Rate limited (429), backing off");
            sleep(backoff).await;

            response = match self.client.get(&self.base_url).query(&params).send().await {
                Ok(r) => r,
                Err(e) => {
                    warn!(ticker, error = %e, "quote retry failed");
                    self.breaker.lock().record_failure();
                    return None;
                }
            };
        }

        if !response.status().is_success() {
            error!(ticker, status = %response.status(), "quote request rejected");
            self.breaker.lock().record_failure();
            return None;
        }

        match response.json::<Value>().await {
            Ok(v) => Some(v),
            Err(e) => {
                error!(ticker, error = %e, "quote response was not JSON");
                self.breaker.lock().record_failure();
                None
            }
        }
    }

    fn parse_quote(&self, ticker: &str, venue: Venue, data: &Value) -> Option<Quote> {
        if let Some(msg) = data.get("Error Message").and_then(Value::as_str) {
            error!(ticker, msg, "API error");
            return None;
        }
        if let Some(note) = data.get("Note").and_then(Value::as_str) {
            error!(ticker, note, "API rate limit note");
            return None;
        }

        let quote_data = data.get("Global Quote")?.as_object()?;
        if quote_data.is_empty() {
            warn!(ticker, "empty quote payload");
            return None;
        }

        let price = Decimal::from_str(quote_data.get("05. price")?.as_str()?).ok()?;
        let volume = quote_data
            .get("06. volume")
            .and_then(Value::as_str)
            .and_then(|v| v.parse::<i64>().ok());

        let (bid, ask) = self.spread_model(ticker, venue, Some(price));

        Some(Quote {
            ticker: ticker.to_string(),
            venue,
            price,
            bid,
            ask,
            volume,
            timestamp: Utc::now(),
            provider: "alphavantage-realtime".to_string(),
        })
    }
}

#[async_trait]
impl MarketDataProvider for AlphaVantageProvider {
    async fn get_quote(&self, ticker: &str, venue: Venue) -> Option<Quote> {
        if self.circuit_open() {
            if self.require_realtime {
                error!(
                    ticker,
                    "🚨 Circuit breaker OPEN - refusing quote (realtime required)"
                );
                return None;
            }
            info!(ticker, "📉 Serving synthetic fallback quote (circuit open)");
            return Some(self.synthetic_quote(ticker, venue));
        }

        if let Some(cached) = self.check_cache(ticker, venue) {
            return Some(cached);
        }

        self.rate_limit().await;

        let payload = self.fetch_global_quote(ticker).await?;
        let quote = match self.parse_quote(ticker, venue, &payload) {
            Some(q) => q,
            None => {
                self.breaker.lock().record_failure();
                return None;
            }
        };

        self.update_cache(quote.clone());
        self.breaker.lock().record_success();

        info!(
            ticker,
            price = %quote.price,
            bid = ?quote.bid,
            ask = ?quote.ask,
            "quote fetched"
        );
        Some(quote)
    }

    fn spread_model(
        &self,
        _ticker: &str,
        _venue: Venue,
        price: Option<Decimal>,
    ) -> (Option<Decimal>, Option<Decimal>) {
        if !self.use_spread_model {
            return (None, None);
        }
        match price {
            Some(p) => {
                let (bid, ask) = synthesise_spread(p, self.spread_bps);
                (Some(bid), Some(ask))
            }
            None => (None, None),
        }
    }

    fn seed_quote(&self, quote: Quote) {
        debug!(ticker = %quote.ticker, price = %quote.price, "seeding quote cache");
        self.update_cache(quote);
    }
}
