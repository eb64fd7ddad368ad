// Bar-close detection for every (symbol, timeframe) stream
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::gateway::{bounded, Gateway};
use crate::logging;
use crate::models::{SymbolStrategyBinding, Timeframe, TriggerEvent};

/// Per-stream state, owned by the tracker
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimingState {
    pub last_time: Option<DateTime<Utc>>,
    /// True only for the poll that detected a new close
    pub ready: bool,
    pub failures: u32,
    pub degraded: bool,
}

pub struct TimingTracker {
    states: BTreeMap<(String, Timeframe), TimingState>,
    max_retries: u32,
    trigger_on_first_bar: bool,
    call_timeout: Duration,
}

impl TimingTracker {
    /// One stream per distinct (symbol, timeframe) among the bindings
    pub fn new<'a>(
        bindings: impl IntoIterator<Item = &'a SymbolStrategyBinding>,
        max_retries: u32,
        trigger_on_first_bar: bool,
        call_timeout: Duration,
    ) -> Self {
        let states = bindings
            .into_iter()
            .map(|b| ((b.symbol.clone(), b.timeframe), TimingState::default()))
            .collect();

        Self {
            states,
            max_retries,
            trigger_on_first_bar,
            call_timeout,
        }
    }

    pub fn state(&self, symbol: &str, timeframe: Timeframe) -> Option<&TimingState> {
        self.states.get(&(symbol.to_string(), timeframe))
    }

    pub fn streams(&self) -> impl Iterator<Item = &(String, Timeframe)> {
        self.states.keys()
    }

    /// Check one stream for a newly closed bar
    ///
    /// Returns a trigger at most once per distinct bar timestamp. Feed failures
    /// never propagate; they count towards the degraded threshold instead.
    pub async fn poll(
        &mut self,
        gateway: &dyn Gateway,
        symbol: &str,
        timeframe: Timeframe,
    ) -> Option<TriggerEvent> {
        let key = (symbol.to_string(), timeframe);
        if !self.states.contains_key(&key) {
            tracing::warn!(target: logging::ERROR, %symbol, %timeframe, "poll for untracked stream");
            return None;
        }

        let fetched = bounded(
            self.call_timeout,
            "fetch_latest_bar_timestamp",
            gateway.fetch_latest_bar_timestamp(symbol, timeframe),
        )
        .await;

        let max_retries = self.max_retries;
        let trigger_on_first_bar = self.trigger_on_first_bar;
        let state = self.states.get_mut(&key)?;
        state.ready = false;

        let bar_time = match fetched {
            Ok(t) => t,
            Err(e) => {
                state.failures += 1;
                tracing::debug!(
                    target: logging::ERROR,
                    %symbol, %timeframe, failures = state.failures,
                    "unable to get latest bar: {}", e
                );
                if state.failures > max_retries && !state.degraded {
                    state.degraded = true;
                    tracing::warn!(
                        target: logging::ERROR,
                        %symbol, %timeframe,
                        "stream degraded after {} consecutive feed failures: {}",
                        state.failures, e
                    );
                }
                return None;
            }
        };

        if state.degraded {
            tracing::info!(
                target: logging::MAIN,
                %symbol, %timeframe,
                "stream recovered after {} failures", state.failures
            );
        }
        state.failures = 0;
        state.degraded = false;

        let is_new = match state.last_time {
            Some(last) => bar_time > last,
            None => true,
        };
        if !is_new {
            return None;
        }

        let first_bar = state.last_time.is_none();
        state.last_time = Some(bar_time);

        if first_bar && !trigger_on_first_bar {
            tracing::info!(%symbol, %timeframe, %bar_time, "seeded last bar time");
            return None;
        }

        state.ready = true;
        tracing::info!(%symbol, %timeframe, %bar_time, "new candle");

        Some(TriggerEvent {
            symbol: symbol.to_string(),
            timeframe,
            bar_time,
        })
    }

    /// Poll every stream once, in a stable order
    pub async fn update_timings(&mut self, gateway: &dyn Gateway) -> Vec<TriggerEvent> {
        let streams: Vec<(String, Timeframe)> = self.states.keys().cloned().collect();
        let mut triggered = Vec::new();

        for (symbol, timeframe) in streams {
            if let Some(trigger) = self.poll(gateway, &symbol, timeframe).await {
                triggered.push(trigger);
            }
        }

        triggered
    }
}

/// Next grid line of `step` strictly after `now`, on the UTC epoch grid
///
/// With 5/15/30 minute bindings the smallest step wins: 14:27 -> 14:30.
pub fn next_boundary(now: DateTime<Utc>, step: Timeframe) -> DateTime<Utc> {
    let step_secs = (step.minutes() * 60) as i64;
    let secs = now.timestamp();
    let next = (secs.div_euclid(step_secs) + 1) * step_secs;
    DateTime::from_timestamp(next, 0).unwrap_or(now + ChronoDuration::seconds(step_secs))
}

/// How long to sleep until the next boundary plus a constant settle offset
pub fn sleep_until_next(now: DateTime<Utc>, step: Timeframe, settle: Duration) -> Duration {
    let wake = next_boundary(now, step);
    let until = (wake - now).to_std().unwrap_or_default();
    until + settle
}
