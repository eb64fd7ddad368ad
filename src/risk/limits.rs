use parking_lot::Mutex;
use std::fmt;

use crate::config::RiskConfig;

/// Account-level limits that suspend new trade submission
#[derive(Debug, Clone)]
pub struct RiskLimits {
    pub max_daily_loss_fraction: f64,
    pub max_concurrent_trades: usize,
}

impl From<&RiskConfig> for RiskLimits {
    fn from(config: &RiskConfig) -> Self {
        Self {
            max_daily_loss_fraction: config.max_daily_loss_fraction,
            max_concurrent_trades: config.max_concurrent_trades,
        }
    }
}

/// Account figures gathered at the start of a position-management cycle
#[derive(Debug, Clone, Copy)]
pub struct AccountSnapshot {
    pub balance: f64,
    /// Realized profit since the start of the trading day, negative for a loss
    pub realized_today: f64,
    pub open_positions: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LimitTrip {
    DailyLoss { loss: f64, limit: f64 },
    ConcurrentTrades { open: usize, limit: usize },
}

impl fmt::Display for LimitTrip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimitTrip::DailyLoss { loss, limit } => {
                write!(f, "daily loss {:.2} reached limit {:.2}", loss, limit)
            }
            LimitTrip::ConcurrentTrades { open, limit } => {
                write!(f, "{} open positions, limit {}", open, limit)
            }
        }
    }
}

impl RiskLimits {
    pub fn check(&self, account: &AccountSnapshot) -> Result<(), LimitTrip> {
        let loss = -account.realized_today;
        let limit = self.max_daily_loss_fraction * account.balance;
        if loss > 0.0 && loss >= limit {
            return Err(LimitTrip::DailyLoss { loss, limit });
        }

        if account.open_positions >= self.max_concurrent_trades {
            return Err(LimitTrip::ConcurrentTrades {
                open: account.open_positions,
                limit: self.max_concurrent_trades,
            });
        }

        Ok(())
    }
}

/// Switch shared by the position manager and the order workers
///
/// While paused, workers drop new signals instead of submitting them.
#[derive(Debug, Default)]
pub struct TradingGate {
    reason: Mutex<Option<String>>,
}

impl TradingGate {
    /// Returns true if this call paused a running gate
    pub fn pause(&self, reason: impl Into<String>) -> bool {
        let mut current = self.reason.lock();
        let was_running = current.is_none();
        *current = Some(reason.into());
        was_running
    }

    /// Returns true if this call resumed a paused gate
    pub fn resume(&self) -> bool {
        self.reason.lock().take().is_some()
    }

    pub fn is_paused(&self) -> bool {
        self.reason.lock().is_some()
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> RiskLimits {
        RiskLimits::from(&RiskConfig::default())
    }

    fn account(realized_today: f64, open_positions: usize) -> AccountSnapshot {
        AccountSnapshot {
            balance: 10_000.0,
            realized_today,
            open_positions,
        }
    }

    #[test]
    fn test_daily_loss_trips() {
        // Default limit is 3% of balance
        let result = limits().check(&account(-350.0, 0));
        assert!(matches!(result, Err(LimitTrip::DailyLoss { .. })));
    }

    #[test]
    fn test_profit_never_trips_daily_loss() {
        assert!(limits().check(&account(900.0, 0)).is_ok());
        assert!(limits().check(&account(-120.0, 1)).is_ok());
    }

    #[test]
    fn test_concurrent_trades_trip() {
        let result = limits().check(&account(0.0, 5));
        assert_eq!(
            result,
            Err(LimitTrip::ConcurrentTrades { open: 5, limit: 5 })
        );
    }

    #[test]
    fn test_gate_transitions() {
        let gate = TradingGate::default();
        assert!(!gate.is_paused());
        assert!(gate.pause("daily loss"));
        assert!(!gate.pause("daily loss"));
        assert_eq!(gate.reason().as_deref(), Some("daily loss"));
        assert!(gate.resume());
        assert!(!gate.resume());
    }
}
