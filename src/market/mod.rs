//! Market data: quote providers and the venue session gate.

pub mod alpha_vantage;
pub mod mock;
pub mod provider;
pub mod session;

pub use alpha_vantage::AlphaVantageProvider;
pub use mock::MockMarketDataProvider;
pub use provider::{synthesise_spread, MarketDataProvider};
pub use session::{SessionCalendar, SessionStatus};
