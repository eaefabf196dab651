//! Trading risk constraints
//!
//! A pure gate over `(wallet, estimated_cost, open_position_count)`. Three
//! rules, stable reason codes, no side effects:
//!
//! - position count: at most `max_concurrent_positions` open at once
//! - concentration: no single position above `max_position_pct` of the
//!   wallet's initial balance
//! - cash reserve: buying power after the order must keep
//!   `min_reserve_pct` of the initial balance in cash

use crate::models::Wallet;
use rust_decimal::Decimal;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct RiskLimits {
    pub max_concurrent_positions: usize,
    pub max_position_pct: Decimal,
    pub min_reserve_pct: Decimal,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_concurrent_positions: 5,
            max_position_pct: Decimal::from_str("0.20").expect("valid default"),
            min_reserve_pct: Decimal::from_str("0.10").expect("valid default"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RiskVerdict {
    Approved,
    Rejected(String),
}

impl RiskVerdict {
    pub fn rejection(&self) -> Option<&str> {
        match self {
            RiskVerdict::Rejected(reason) => Some(reason),
            RiskVerdict::Approved => None,
        }
    }
}

impl RiskLimits {
    /// Validate a prospective order. Monotone in `estimated_cost`: raising
    /// the cost can only flip Approved to Rejected, never the reverse.
    pub fn validate_order(
        &self,
        wallet: &Wallet,
        estimated_cost: Decimal,
        open_positions: usize,
    ) -> RiskVerdict {
        if open_positions >= self.max_concurrent_positions {
            return RiskVerdict::Rejected(format!(
                "MAX_POSITIONS_REACHED ({open_positions}/{})",
                self.max_concurrent_positions
            ));
        }

        let max_position_size = wallet.initial_balance * self.max_position_pct;
        if estimated_cost > max_position_size {
            return RiskVerdict::Rejected(format!(
                "POSITION_TOO_LARGE (${estimated_cost:.2} > ${max_position_size:.2})"
            ));
        }

        let min_buying_power = wallet.initial_balance * self.min_reserve_pct;
        if wallet.buying_power() - estimated_cost < min_buying_power {
            return RiskVerdict::Rejected(format!(
                "INSUFFICIENT_BUYING_POWER (need reserve: ${min_buying_power:.2})"
            ));
        }

        RiskVerdict::Approved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn wallet(initial: &str, current: &str, reserved: &str) -> Wallet {
        let now = Utc::now();
        Wallet {
            id: Uuid::new_v4(),
            name: "Risk-Test".to_string(),
            capital_tier: "10k".to_string(),
            initial_balance: dec(initial),
            current_balance: dec(current),
            reserved_balance: dec(reserved),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn position_count_limit() {
        let limits = RiskLimits::default();
        let w = wallet("10000", "10000", "0");
        assert_eq!(limits.validate_order(&w, dec("100"), 4), RiskVerdict::Approved);
        let verdict = limits.validate_order(&w, dec("100"), 5);
        assert!(verdict.rejection().unwrap().starts_with("MAX_POSITIONS_REACHED"));
    }

    #[test]
    fn concentration_limit_uses_initial_balance() {
        let limits = RiskLimits::default();
        // Initial $1,000 -> 20% cap = $200; a $5,000 order is far too large.
        let w = wallet("1000", "1000", "0");
        let verdict = limits.validate_order(&w, dec("5000"), 0);
        assert!(verdict.rejection().unwrap().starts_with("POSITION_TOO_LARGE"));
        assert_eq!(limits.validate_order(&w, dec("200"), 0), RiskVerdict::Approved);
    }

    #[test]
    fn cash_reserve_floor() {
        let limits = RiskLimits::default();
        // $10k initial, $1.5k buying power; reserve floor is $1k.
        let w = wallet("10000", "1500", "0");
        assert_eq!(limits.validate_order(&w, dec("400"), 0), RiskVerdict::Approved);
        let verdict = limits.validate_order(&w, dec("600"), 0);
        assert!(verdict
            .rejection()
            .unwrap()
            .starts_with("INSUFFICIENT_BUYING_POWER"));
    }

    #[test]
    fn verdict_is_monotone_in_cost() {
        let limits = RiskLimits::default();
        let w = wallet("10000", "10000", "0");

        let mut rejected = false;
        for cost in 1..60 {
            let verdict = limits.validate_order(&w, Decimal::from(cost * 50), 0);
            match verdict {
                RiskVerdict::Approved => {
                    assert!(!rejected, "approved after a rejection at lower cost");
                }
                RiskVerdict::Rejected(_) => rejected = true,
            }
        }
        assert!(rejected, "sweep should eventually reject");
    }
}
