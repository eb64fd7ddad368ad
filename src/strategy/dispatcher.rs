use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use super::{strategy_for, SignalOutcome, Strategy};
use crate::error::Result;
use crate::gateway::{bounded, Gateway};
use crate::logging;
use crate::models::{Direction, SignalDecision, SymbolStrategyBinding, Timeframe, TriggerEvent};
use crate::risk::{round_price, RiskSizer};

/// Turns a detected bar close into a sized signal
///
/// Every failure on the way (feed, strategy, metadata, sizing) is logged and
/// reported as no signal for this cycle.
pub struct StrategyDispatcher {
    gateway: Arc<dyn Gateway>,
    bindings: BTreeMap<(String, Timeframe), SymbolStrategyBinding>,
    strategies: HashMap<String, Arc<dyn Strategy>>,
    sizer: RiskSizer,
    max_trade_fraction: f64,
    call_timeout: Duration,
}

impl StrategyDispatcher {
    pub fn new<'a>(
        gateway: Arc<dyn Gateway>,
        bindings: impl IntoIterator<Item = &'a SymbolStrategyBinding>,
        max_trade_fraction: f64,
        call_timeout: Duration,
    ) -> Result<Self> {
        let mut table = BTreeMap::new();
        let mut strategies = HashMap::new();

        for binding in bindings {
            if !strategies.contains_key(&binding.strategy) {
                strategies.insert(binding.strategy.clone(), strategy_for(&binding.strategy)?);
            }
            let key = (binding.symbol.clone(), binding.timeframe);
            if table.contains_key(&key) {
                tracing::warn!(
                    target: logging::MAIN,
                    symbol = %binding.symbol, timeframe = %binding.timeframe,
                    "duplicate binding ignored: {}", binding
                );
                continue;
            }
            table.insert(key, binding.clone());
        }

        Ok(Self {
            gateway,
            bindings: table,
            strategies,
            sizer: RiskSizer,
            max_trade_fraction,
            call_timeout,
        })
    }

    pub async fn dispatch(&self, trigger: &TriggerEvent) -> Option<SignalDecision> {
        let symbol = trigger.symbol.as_str();
        let timeframe = trigger.timeframe;

        let Some(binding) = self.bindings.get(&(trigger.symbol.clone(), timeframe)) else {
            tracing::error!(target: logging::ERROR, %symbol, %timeframe, "no binding for trigger");
            return None;
        };
        let strategy = self.strategies.get(&binding.strategy)?;

        let count = strategy.bars_required(&binding.params);
        let bars = match bounded(
            self.call_timeout,
            "fetch_recent_bars",
            self.gateway.fetch_recent_bars(symbol, timeframe, count),
        )
        .await
        {
            Ok(bars) => bars,
            Err(e) => {
                tracing::error!(target: logging::ERROR, %symbol, %timeframe, "unable to fetch bars: {}", e);
                return None;
            }
        };

        let proposal = match strategy.evaluate(&bars, &binding.params) {
            Ok(SignalOutcome::Enter(proposal)) => proposal,
            Ok(SignalOutcome::NoSignal) => {
                tracing::info!(%symbol, %timeframe, strategy = strategy.name(), "no signal");
                return None;
            }
            Err(e) => {
                tracing::error!(target: logging::ERROR, %symbol, %timeframe, "{}", e);
                return None;
            }
        };

        let meta = match bounded(
            self.call_timeout,
            "instrument_metadata",
            self.gateway.instrument_metadata(symbol),
        )
        .await
        {
            Ok(meta) => meta,
            Err(e) => {
                tracing::error!(target: logging::ERROR, %symbol, "signal discarded: {}", e);
                return None;
            }
        };

        let direction = proposal.direction;
        let entry_price = meta.entry_price(direction);
        let stop_loss = round_price(proposal.stop_loss, meta.tick_size);
        let take_profit = round_price(proposal.take_profit, meta.tick_size);

        let stop_on_wrong_side = match direction {
            Direction::Long => stop_loss >= entry_price,
            Direction::Short => stop_loss <= entry_price,
        };
        if stop_on_wrong_side {
            tracing::warn!(
                target: logging::ERROR,
                %symbol, ?direction, entry_price, stop_loss,
                "signal discarded: stop loss on the wrong side of entry"
            );
            return None;
        }

        let risk_fraction = self.effective_risk(binding);

        let balance = match bounded(
            self.call_timeout,
            "account_balance",
            self.gateway.account_balance(),
        )
        .await
        {
            Ok(balance) => balance,
            Err(e) => {
                tracing::error!(target: logging::ERROR, %symbol, "signal discarded: {}", e);
                return None;
            }
        };

        let volume = match self
            .sizer
            .size(&meta, entry_price, stop_loss, risk_fraction, balance)
        {
            Ok(volume) => volume,
            Err(e) => {
                tracing::error!(target: logging::ERROR, %symbol, "signal discarded: {}", e);
                return None;
            }
        };

        let signal = SignalDecision {
            id: Uuid::new_v4(),
            symbol: trigger.symbol.clone(),
            timeframe,
            direction,
            entry_price,
            stop_loss,
            take_profit,
            risk_fraction,
            volume,
            signal_time: trigger.bar_time,
        };

        tracing::info!(
            %symbol, %timeframe, signal_id = %signal.id, ?direction,
            entry_price, stop_loss, take_profit, volume,
            "{} signal", strategy.name()
        );
        Some(signal)
    }

    fn effective_risk(&self, binding: &SymbolStrategyBinding) -> f64 {
        let requested = binding.params.risk_fraction;
        if requested > self.max_trade_fraction {
            tracing::info!(
                symbol = %binding.symbol, timeframe = %binding.timeframe,
                "risk {} capped at max_trade_fraction {}", requested, self.max_trade_fraction
            );
            self.max_trade_fraction
        } else {
            requested
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::PaperGateway;
    use crate::models::{Bar, IndicatorConfig, InstrumentMetadata, StrategyParams};
    use crate::strategy::test_support::bars_from_closes;

    fn binding(strategy: &str, risk: f64) -> SymbolStrategyBinding {
        SymbolStrategyBinding {
            symbol: "EURUSD".into(),
            timeframe: Timeframe::M5,
            strategy: strategy.into(),
            params: StrategyParams {
                indicators: IndicatorConfig {
                    fast_period: 3,
                    slow_period: 6,
                    atr_period: 3,
                    atr_multiplier: 2.0,
                    channel_period: 5,
                },
                risk_fraction: risk,
                profit_ratio: 2.0,
            },
        }
    }

    fn paper_with(closes: &[f64]) -> Arc<PaperGateway> {
        let paper = Arc::new(PaperGateway::new(10_000.0));
        paper.set_bars("EURUSD", Timeframe::M5, bars_from_closes(closes, 0.005));
        paper.set_instrument(
            "EURUSD",
            InstrumentMetadata {
                tick_size: 0.0001,
                tick_value: 1.0,
                volume_step: 0.01,
                bid: 1.1498,
                ask: 1.1500,
            },
        );
        paper
    }

    fn trigger(bars: &[Bar]) -> TriggerEvent {
        TriggerEvent {
            symbol: "EURUSD".into(),
            timeframe: Timeframe::M5,
            bar_time: bars[bars.len() - 1].timestamp,
        }
    }

    const RALLY: [f64; 8] = [1.10, 1.09, 1.08, 1.07, 1.06, 1.05, 1.04, 1.15];

    #[tokio::test]
    async fn test_crossover_produces_sized_long() {
        let paper = paper_with(&RALLY);
        let b = binding("ma_crossover", 0.01);
        let dispatcher =
            StrategyDispatcher::new(paper.clone(), [&b], 0.02, Duration::from_secs(1)).unwrap();

        let bars = bars_from_closes(&RALLY, 0.005);
        let signal = dispatcher.dispatch(&trigger(&bars)).await.unwrap();

        assert_eq!(signal.direction, Direction::Long);
        assert_eq!(signal.entry_price, 1.15);
        assert!(signal.stop_loss < signal.entry_price);
        assert!(signal.volume > 0.0);
        assert_eq!(signal.signal_time, bars[7].timestamp);
        // Rounded to the 4 decimals of the tick size
        assert_eq!(round_price(signal.stop_loss, 0.0001), signal.stop_loss);
    }

    #[tokio::test]
    async fn test_flat_market_is_no_signal() {
        let closes = [1.0; 10];
        let paper = paper_with(&closes);
        let b = binding("ma_crossover", 0.01);
        let dispatcher =
            StrategyDispatcher::new(paper.clone(), [&b], 0.02, Duration::from_secs(1)).unwrap();

        let bars = bars_from_closes(&closes, 0.005);
        assert!(dispatcher.dispatch(&trigger(&bars)).await.is_none());
    }

    #[tokio::test]
    async fn test_missing_metadata_discards_signal() {
        let paper = Arc::new(PaperGateway::new(10_000.0));
        paper.set_bars("EURUSD", Timeframe::M5, bars_from_closes(&RALLY, 0.005));
        let b = binding("ma_crossover", 0.01);
        let dispatcher =
            StrategyDispatcher::new(paper.clone(), [&b], 0.02, Duration::from_secs(1)).unwrap();

        let bars = bars_from_closes(&RALLY, 0.005);
        assert!(dispatcher.dispatch(&trigger(&bars)).await.is_none());
    }

    #[tokio::test]
    async fn test_feed_failure_is_no_signal() {
        let paper = Arc::new(PaperGateway::new(10_000.0));
        let b = binding("breakout", 0.01);
        let dispatcher =
            StrategyDispatcher::new(paper.clone(), [&b], 0.02, Duration::from_secs(1)).unwrap();

        let bars = bars_from_closes(&RALLY, 0.005);
        assert!(dispatcher.dispatch(&trigger(&bars)).await.is_none());
    }

    #[tokio::test]
    async fn test_risk_capped_at_max_trade_fraction() {
        let paper = paper_with(&RALLY);
        let b = binding("ma_crossover", 0.05);
        let dispatcher =
            StrategyDispatcher::new(paper.clone(), [&b], 0.02, Duration::from_secs(1)).unwrap();

        let bars = bars_from_closes(&RALLY, 0.005);
        let signal = dispatcher.dispatch(&trigger(&bars)).await.unwrap();
        assert_eq!(signal.risk_fraction, 0.02);
    }

    #[test]
    fn test_unknown_strategy_fails_construction() {
        let paper = Arc::new(PaperGateway::new(10_000.0));
        let b = binding("grid", 0.01);
        assert!(StrategyDispatcher::new(paper, [&b], 0.02, Duration::from_secs(1)).is_err());
    }
}
