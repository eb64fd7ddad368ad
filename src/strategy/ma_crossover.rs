use super::{require_bars, EntryProposal, SignalOutcome, Strategy};
use crate::error::{BotError, Result};
use crate::indicators::{calculate_atr, sma_series};
use crate::models::{Bar, Direction, StrategyParams};

/// Fast/slow simple moving average crossover
///
/// Enters in the direction of a cross that happened on the newest bar, with
/// the stop `atr_multiplier` ATRs behind the close.
#[derive(Debug, Clone, Copy, Default)]
pub struct MaCrossoverStrategy;

impl Strategy for MaCrossoverStrategy {
    fn evaluate(&self, bars: &[Bar], params: &StrategyParams) -> Result<SignalOutcome> {
        let ind = &params.indicators;
        if ind.fast_period == 0 || ind.fast_period >= ind.slow_period {
            return Err(BotError::strategy(
                self.name(),
                format!(
                    "fast_period ({}) must be non-zero and below slow_period ({})",
                    ind.fast_period, ind.slow_period
                ),
            ));
        }
        require_bars(self.name(), bars, self.bars_required(params))?;

        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
        let fast = sma_series(&closes, ind.fast_period);
        let slow = sma_series(&closes, ind.slow_period);

        // Align both series on their last two values
        let (fast_prev, fast_now) = (fast[fast.len() - 2], fast[fast.len() - 1]);
        let (slow_prev, slow_now) = (slow[slow.len() - 2], slow[slow.len() - 1]);

        let direction = if fast_prev <= slow_prev && fast_now > slow_now {
            Direction::Long
        } else if fast_prev >= slow_prev && fast_now < slow_now {
            Direction::Short
        } else {
            return Ok(SignalOutcome::NoSignal);
        };

        let atr = calculate_atr(bars, ind.atr_period)
            .ok_or_else(|| BotError::strategy(self.name(), "ATR unavailable"))?;
        if atr <= 0.0 {
            return Ok(SignalOutcome::NoSignal);
        }

        let close = closes[closes.len() - 1];
        let stop_distance = atr * ind.atr_multiplier;
        let stop_loss = match direction {
            Direction::Long => close - stop_distance,
            Direction::Short => close + stop_distance,
        };

        Ok(SignalOutcome::Enter(EntryProposal::with_profit_ratio(
            direction,
            close,
            stop_loss,
            params.profit_ratio,
        )))
    }

    fn name(&self) -> &str {
        "ma_crossover"
    }

    fn bars_required(&self, params: &StrategyParams) -> usize {
        // One extra bar so the previous crossover state is known
        (params.indicators.slow_period + 1).max(params.indicators.atr_period + 1)
    }
}
