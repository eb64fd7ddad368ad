use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use super::{retcode, Gateway};
use crate::error::{BotError, Result};
use crate::models::{
    Bar, Direction, InstrumentMetadata, OpenPosition, OrderRequest, SubmitResponse, Timeframe,
};

/// In-memory venue for dry runs
///
/// Pending orders fill immediately at their price. Bars, quotes and broker
/// responses are fed in by the caller.
pub struct PaperGateway {
    state: Mutex<PaperState>,
}

#[derive(Default)]
struct PaperState {
    balance: f64,
    realized_today: f64,
    bars: HashMap<(String, Timeframe), Vec<Bar>>,
    instruments: HashMap<String, InstrumentMetadata>,
    positions: Vec<OpenPosition>,
    next_ticket: u64,
    scripted_statuses: VecDeque<u32>,
    feed_failures: u32,
    submit_delay: Option<Duration>,
    submitted: Vec<OrderRequest>,
    modifications: Vec<(u64, f64)>,
    failing_closes: HashSet<u64>,
    in_flight: HashMap<String, usize>,
    peak_in_flight: usize,
}

impl PaperGateway {
    pub fn new(balance: f64) -> Self {
        Self {
            state: Mutex::new(PaperState {
                balance,
                next_ticket: 1,
                ..Default::default()
            }),
        }
    }

    pub fn set_instrument(&self, symbol: &str, meta: InstrumentMetadata) {
        self.state.lock().instruments.insert(symbol.to_string(), meta);
    }

    pub fn set_bars(&self, symbol: &str, timeframe: Timeframe, bars: Vec<Bar>) {
        self.state
            .lock()
            .bars
            .insert((symbol.to_string(), timeframe), bars);
    }

    pub fn push_bar(&self, symbol: &str, timeframe: Timeframe, bar: Bar) {
        self.state
            .lock()
            .bars
            .entry((symbol.to_string(), timeframe))
            .or_default()
            .push(bar);
    }

    pub fn set_realized_profit_today(&self, profit: f64) {
        self.state.lock().realized_today = profit;
    }

    /// Broker status codes returned by the next submissions, in order.
    /// Once exhausted, submissions succeed.
    pub fn script_order_statuses(&self, statuses: impl IntoIterator<Item = u32>) {
        self.state.lock().scripted_statuses.extend(statuses);
    }

    /// Make the next `count` latest-bar queries fail
    pub fn fail_feed(&self, count: u32) {
        self.state.lock().feed_failures = count;
    }

    pub fn set_submit_delay(&self, delay: Duration) {
        self.state.lock().submit_delay = Some(delay);
    }

    pub fn fail_close(&self, position_id: u64) {
        self.state.lock().failing_closes.insert(position_id);
    }

    /// Open a position directly, as if it had been filled earlier
    pub fn add_position(&self, mut position: OpenPosition) -> u64 {
        let mut state = self.state.lock();
        position.id = state.next_ticket;
        state.next_ticket += 1;
        let id = position.id;
        state.positions.push(position);
        id
    }

    /// Move the market for one symbol's open positions
    pub fn set_price(&self, symbol: &str, price: f64) {
        let mut state = self.state.lock();
        for position in state.positions.iter_mut().filter(|p| p.symbol == symbol) {
            position.current_price = price;
            let sign = match position.direction {
                Direction::Long => 1.0,
                Direction::Short => -1.0,
            };
            position.profit = (price - position.open_price) * sign * position.volume;
        }
    }

    pub fn submitted_orders(&self) -> Vec<OrderRequest> {
        self.state.lock().submitted.clone()
    }

    pub fn modifications(&self) -> Vec<(u64, f64)> {
        self.state.lock().modifications.clone()
    }

    pub fn open_positions(&self) -> Vec<OpenPosition> {
        self.state.lock().positions.clone()
    }

    /// Submissions currently between entry and response for `symbol`
    pub fn in_flight(&self, symbol: &str) -> usize {
        self.state.lock().in_flight.get(symbol).copied().unwrap_or(0)
    }

    /// Highest number of simultaneous submissions seen for any single symbol
    pub fn peak_in_flight_per_symbol(&self) -> usize {
        self.state.lock().peak_in_flight
    }

    fn fill(state: &mut PaperState, request: &OrderRequest) {
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.positions.push(OpenPosition {
            id: ticket,
            symbol: request.symbol.clone(),
            direction: request.direction,
            open_price: request.price,
            stop_loss: request.stop_loss,
            take_profit: request.take_profit,
            current_price: request.price,
            profit: 0.0,
            volume: request.volume,
            initial_stop_loss: Some(request.initial_stop_loss),
        });
    }
}

/// Counts one submission for a symbol until dropped, including when the
/// caller abandons the future mid-delay.
struct InFlight<'a> {
    state: &'a Mutex<PaperState>,
    symbol: String,
}

impl<'a> InFlight<'a> {
    fn enter(state: &'a Mutex<PaperState>, symbol: &str) -> (Self, Option<Duration>) {
        let delay = {
            let mut guarded = state.lock();
            let count = guarded.in_flight.entry(symbol.to_string()).or_insert(0);
            *count += 1;
            let current = *count;
            guarded.peak_in_flight = guarded.peak_in_flight.max(current);
            guarded.submit_delay
        };
        let guard = Self {
            state,
            symbol: symbol.to_string(),
        };
        (guard, delay)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Some(count) = self.state.lock().in_flight.get_mut(&self.symbol) {
            *count = count.saturating_sub(1);
        }
    }
}

#[async_trait]
impl Gateway for PaperGateway {
    async fn fetch_recent_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        count: usize,
    ) -> Result<Vec<Bar>> {
        let state = self.state.lock();
        let bars = state
            .bars
            .get(&(symbol.to_string(), timeframe))
            .filter(|bars| !bars.is_empty())
            .ok_or_else(|| BotError::EmptyData(format!("{} {}", symbol, timeframe)))?;

        let start = bars.len().saturating_sub(count);
        Ok(bars[start..].to_vec())
    }

    async fn fetch_latest_bar_timestamp(
        &self,
        symbol: &str,
        timeframe: Timeframe,
    ) -> Result<DateTime<Utc>> {
        let mut state = self.state.lock();
        if state.feed_failures > 0 {
            state.feed_failures -= 1;
            return Err(BotError::Gateway("paper feed unavailable".into()));
        }

        state
            .bars
            .get(&(symbol.to_string(), timeframe))
            .and_then(|bars| bars.last())
            .map(|bar| bar.timestamp)
            .ok_or_else(|| BotError::EmptyData(format!("{} {}", symbol, timeframe)))
    }

    async fn instrument_metadata(&self, symbol: &str) -> Result<InstrumentMetadata> {
        self.state
            .lock()
            .instruments
            .get(symbol)
            .cloned()
            .ok_or_else(|| BotError::InstrumentUnavailable(symbol.to_string()))
    }

    async fn account_balance(&self) -> Result<f64> {
        Ok(self.state.lock().balance)
    }

    async fn realized_profit_today(&self) -> Result<f64> {
        Ok(self.state.lock().realized_today)
    }

    async fn submit_pending_order(&self, request: &OrderRequest) -> Result<SubmitResponse> {
        let (guard, delay) = InFlight::enter(&self.state, &request.symbol);

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        drop(guard);

        let mut state = self.state.lock();
        state.submitted.push(request.clone());
        let status = state.scripted_statuses.pop_front().unwrap_or(retcode::DONE);
        if status == retcode::DONE || status == retcode::PLACED {
            Self::fill(&mut state, request);
        }

        Ok(SubmitResponse {
            status_code: status,
            raw: format!("{{\"retcode\": {}, \"symbol\": \"{}\"}}", status, request.symbol),
        })
    }

    async fn modify_position_stop(
        &self,
        position_id: u64,
        stop_loss: f64,
        take_profit: f64,
    ) -> Result<bool> {
        let mut state = self.state.lock();
        let Some(position) = state.positions.iter_mut().find(|p| p.id == position_id) else {
            return Ok(false);
        };
        position.stop_loss = stop_loss;
        position.take_profit = take_profit;
        state.modifications.push((position_id, stop_loss));
        Ok(true)
    }

    async fn close_position(&self, position_id: u64) -> Result<bool> {
        let mut state = self.state.lock();
        if state.failing_closes.contains(&position_id) {
            return Err(BotError::Gateway(format!(
                "close rejected for position {}",
                position_id
            )));
        }

        let Some(index) = state.positions.iter().position(|p| p.id == position_id) else {
            return Ok(false);
        };
        let position = state.positions.remove(index);
        state.realized_today += position.profit;
        state.balance += position.profit;
        Ok(true)
    }

    async fn list_open_positions(&self) -> Result<Vec<OpenPosition>> {
        Ok(self.state.lock().positions.clone())
    }

    fn name(&self) -> &str {
        "paper"
    }
}
