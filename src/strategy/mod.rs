// Trading strategy module
pub mod breakout;
pub mod dispatcher;
pub mod ma_crossover;

use std::sync::Arc;

use crate::error::{BotError, Result};
use crate::models::{Bar, Direction, StrategyParams};

pub use breakout::BreakoutStrategy;
pub use dispatcher::StrategyDispatcher;
pub use ma_crossover::MaCrossoverStrategy;

/// Proposed entry from a strategy, before sizing
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EntryProposal {
    pub direction: Direction,
    pub stop_loss: f64,
    pub take_profit: f64,
}

impl EntryProposal {
    /// Take-profit placed `profit_ratio` stop distances away from `reference`
    pub fn with_profit_ratio(
        direction: Direction,
        reference: f64,
        stop_loss: f64,
        profit_ratio: f64,
    ) -> Self {
        let risk = (reference - stop_loss).abs();
        let take_profit = match direction {
            Direction::Long => reference + risk * profit_ratio,
            Direction::Short => reference - risk * profit_ratio,
        };
        Self {
            direction,
            stop_loss,
            take_profit,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SignalOutcome {
    Enter(EntryProposal),
    NoSignal,
}

/// Pluggable signal logic, selected per binding by name
pub trait Strategy: Send + Sync {
    /// Evaluate closed bars (oldest first) for an entry
    fn evaluate(&self, bars: &[Bar], params: &StrategyParams) -> Result<SignalOutcome>;

    fn name(&self) -> &str;

    /// Bars needed for one evaluation with these parameters
    fn bars_required(&self, params: &StrategyParams) -> usize;
}

/// Names accepted in the `strategy` field of a binding
pub const STRATEGY_NAMES: &[&str] = &["ma_crossover", "breakout"];

pub fn strategy_for(name: &str) -> Result<Arc<dyn Strategy>> {
    match name {
        "ma_crossover" => Ok(Arc::new(MaCrossoverStrategy)),
        "breakout" => Ok(Arc::new(BreakoutStrategy)),
        other => Err(BotError::Configuration(format!(
            "unknown strategy '{}', expected one of {:?}",
            other, STRATEGY_NAMES
        ))),
    }
}

/// Fail with a strategy error when fewer bars than required were supplied
pub(crate) fn require_bars(strategy: &str, bars: &[Bar], required: usize) -> Result<()> {
    if bars.len() < required {
        return Err(BotError::strategy(
            strategy,
            format!("insufficient data: {} bars, need {}", bars.len(), required),
        ));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    pub fn bars_from_closes(closes: &[f64], spread: f64) -> Vec<Bar> {
        let start = Utc.with_ymd_and_hms(2024, 9, 16, 0, 0, 0).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, &close)| Bar {
                timestamp: start + Duration::minutes(5 * i as i64),
                open: close,
                high: close + spread,
                low: close - spread,
                close,
                volume: 100.0,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profit_ratio_long_and_short() {
        let long = EntryProposal::with_profit_ratio(Direction::Long, 1.1050, 1.1000, 2.0);
        assert!((long.take_profit - 1.1150).abs() < 1e-9);

        let short = EntryProposal::with_profit_ratio(Direction::Short, 1.1000, 1.1050, 2.0);
        assert!((short.take_profit - 1.0900).abs() < 1e-9);
    }

    #[test]
    fn test_registry() {
        assert_eq!(strategy_for("ma_crossover").unwrap().name(), "ma_crossover");
        assert_eq!(strategy_for("breakout").unwrap().name(), "breakout");
        let err = strategy_for("martingale").err().unwrap();
        assert!(err.to_string().contains("unknown strategy"));
    }
}
