use super::{require_bars, EntryProposal, SignalOutcome, Strategy};
use crate::error::{BotError, Result};
use crate::indicators::{calculate_atr, donchian_channel};
use crate::models::{Bar, Direction, StrategyParams};

/// Donchian channel breakout
///
/// A close above the prior `channel_period` highs goes long, below the lows
/// goes short. The stop is the tighter of the opposite channel edge and the
/// ATR stop.
#[derive(Debug, Clone, Copy, Default)]
pub struct BreakoutStrategy;

impl Strategy for BreakoutStrategy {
    fn evaluate(&self, bars: &[Bar], params: &StrategyParams) -> Result<SignalOutcome> {
        let ind = &params.indicators;
        require_bars(self.name(), bars, self.bars_required(params))?;

        let channel = donchian_channel(bars, ind.channel_period)
            .ok_or_else(|| BotError::strategy(self.name(), "channel period must be non-zero"))?;
        let atr = calculate_atr(bars, ind.atr_period)
            .ok_or_else(|| BotError::strategy(self.name(), "ATR unavailable"))?;

        let close = bars[bars.len() - 1].close;
        let atr_stop = atr * ind.atr_multiplier;

        let (direction, stop_loss) = if close > channel.upper {
            (Direction::Long, channel.lower.max(close - atr_stop))
        } else if close < channel.lower {
            (Direction::Short, channel.upper.min(close + atr_stop))
        } else {
            return Ok(SignalOutcome::NoSignal);
        };

        if (close - stop_loss).abs() <= f64::EPSILON {
            return Ok(SignalOutcome::NoSignal);
        }

        Ok(SignalOutcome::Enter(EntryProposal::with_profit_ratio(
            direction,
            close,
            stop_loss,
            params.profit_ratio,
        )))
    }

    fn name(&self) -> &str {
        "breakout"
    }

    fn bars_required(&self, params: &StrategyParams) -> usize {
        (params.indicators.channel_period + 1).max(params.indicators.atr_period + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::IndicatorConfig;
    use crate::strategy::test_support::bars_from_closes;

    fn params() -> StrategyParams {
        StrategyParams {
            indicators: IndicatorConfig {
                fast_period: 10,
                slow_period: 30,
                atr_period: 3,
                atr_multiplier: 1.0,
                channel_period: 5,
            },
            risk_fraction: 0.01,
            profit_ratio: 1.5,
        }
    }

    #[test]
    fn test_requires_sufficient_data() {
        let bars = bars_from_closes(&[1.0, 1.0, 1.0], 0.01);
        let err = BreakoutStrategy.evaluate(&bars, &params()).unwrap_err();
        assert!(err.to_string().contains("insufficient data"));
    }

    #[test]
    fn test_upside_break_goes_long() {
        let bars = bars_from_closes(&[1.00, 1.01, 1.00, 1.01, 1.00, 1.01, 1.10], 0.005);

        match BreakoutStrategy.evaluate(&bars, &params()).unwrap() {
            SignalOutcome::Enter(entry) => {
                assert_eq!(entry.direction, Direction::Long);
                assert!(entry.stop_loss < 1.10);
                // Never looser than the channel floor
                assert!(entry.stop_loss >= 0.995 - 1e-9);
                let risk = 1.10 - entry.stop_loss;
                assert!((entry.take_profit - (1.10 + risk * 1.5)).abs() < 1e-9);
            }
            SignalOutcome::NoSignal => panic!("expected a long entry"),
        }
    }

    #[test]
    fn test_downside_break_goes_short() {
        let bars = bars_from_closes(&[1.00, 1.01, 1.00, 1.01, 1.00, 1.01, 0.90], 0.005);

        match BreakoutStrategy.evaluate(&bars, &params()).unwrap() {
            SignalOutcome::Enter(entry) => {
                assert_eq!(entry.direction, Direction::Short);
                assert!(entry.stop_loss > 0.90);
                assert!(entry.stop_loss <= 1.015 + 1e-9);
            }
            SignalOutcome::NoSignal => panic!("expected a short entry"),
        }
    }

    #[test]
    fn test_inside_range_has_no_signal() {
        let bars = bars_from_closes(&[1.00, 1.01, 1.00, 1.01, 1.00, 1.01, 1.005], 0.005);
        assert_eq!(
            BreakoutStrategy.evaluate(&bars, &params()).unwrap(),
            SignalOutcome::NoSignal
        );
    }
}
