use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

use crate::gateway::{bounded, Gateway};
use crate::logging;
use crate::models::{Direction, InstrumentMetadata, OpenPosition};
use crate::risk::{round_price, AccountSnapshot, RiskLimits, TradingGate};

/// Trailing-stop state of one position
///
/// Closed positions are not represented: they are dropped once the gateway
/// stops reporting them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrailState {
    Initial,
    Trailing,
}

/// What one reconciliation cycle did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub open_positions: usize,
    pub stops_moved: usize,
    pub closed_since_last_cycle: usize,
    pub paused: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CloseReport {
    pub closed: Vec<u64>,
    pub failed: Vec<(u64, String)>,
}

/// Periodic reconciliation of open positions
pub struct PositionManager {
    gateway: Arc<dyn Gateway>,
    gate: Arc<TradingGate>,
    limits: RiskLimits,
    /// Fallback trailing distance as a fraction of open price
    max_stop_loss_fraction: f64,
    call_timeout: Duration,
    trail_states: HashMap<u64, TrailState>,
}

impl PositionManager {
    pub fn new(
        gateway: Arc<dyn Gateway>,
        gate: Arc<TradingGate>,
        limits: RiskLimits,
        max_stop_loss_fraction: f64,
        call_timeout: Duration,
    ) -> Self {
        Self {
            gateway,
            gate,
            limits,
            max_stop_loss_fraction,
            call_timeout,
            trail_states: HashMap::new(),
        }
    }

    pub fn trail_state(&self, position_id: u64) -> Option<TrailState> {
        self.trail_states.get(&position_id).copied()
    }

    /// Run cycles every `period` until `shutdown` flips to true
    ///
    /// Hands the manager back so the caller can close positions afterwards.
    pub async fn run(mut self, period: Duration, mut shutdown: watch::Receiver<bool>) -> Self {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            }

            let report = self.run_cycle().await;
            tracing::debug!(
                open = report.open_positions,
                moved = report.stops_moved,
                paused = report.paused,
                "position cycle complete"
            );
        }

        tracing::info!(target: logging::MAIN, "position manager stopped");
        self
    }

    pub async fn run_cycle(&mut self) -> CycleReport {
        let mut report = CycleReport::default();

        let positions = match bounded(
            self.call_timeout,
            "list_open_positions",
            self.gateway.list_open_positions(),
        )
        .await
        {
            Ok(positions) => positions,
            Err(e) => {
                tracing::error!(target: logging::ERROR, "unable to list open positions: {}", e);
                report.paused = self.gate.is_paused();
                return report;
            }
        };
        report.open_positions = positions.len();
        report.closed_since_last_cycle = self.forget_closed(&positions);

        self.check_limits(positions.len()).await;
        report.paused = self.gate.is_paused();

        let mut metadata: HashMap<String, Option<InstrumentMetadata>> = HashMap::new();
        for position in &positions {
            let state = self
                .trail_states
                .entry(position.id)
                .or_insert(TrailState::Initial);
            if favourable_move(position) > risk_distance(position, self.max_stop_loss_fraction) {
                *state = TrailState::Trailing;
            }

            if !metadata.contains_key(&position.symbol) {
                let fetched = bounded(
                    self.call_timeout,
                    "instrument_metadata",
                    self.gateway.instrument_metadata(&position.symbol),
                )
                .await;
                if let Err(e) = &fetched {
                    tracing::error!(target: logging::ERROR, symbol = %position.symbol, "trailing skipped: {}", e);
                }
                metadata.insert(position.symbol.clone(), fetched.ok());
            }
            let Some(Some(meta)) = metadata.get(&position.symbol) else {
                continue;
            };

            let Some(new_stop) = self.trail(position, meta) else {
                continue;
            };
            if self.move_stop(position, new_stop).await {
                report.stops_moved += 1;
            }
        }

        report
    }

    /// New stop loss for a position that has moved more than its initial risk
    ///
    /// The stop follows price at the initial risk distance and only ever
    /// tightens: None unless the result beats the current stop.
    pub fn trail(&self, position: &OpenPosition, meta: &InstrumentMetadata) -> Option<f64> {
        let risk = risk_distance(position, self.max_stop_loss_fraction);
        if risk.is_nan() || risk <= 0.0 || favourable_move(position) <= risk {
            return None;
        }

        let candidate = match position.direction {
            Direction::Long => position.current_price - risk,
            Direction::Short => position.current_price + risk,
        };
        let new_stop = round_price(candidate, meta.tick_size);

        // A zero stop loss means none is set
        let improves = match position.direction {
            Direction::Long => new_stop > position.stop_loss,
            Direction::Short => position.stop_loss <= 0.0 || new_stop < position.stop_loss,
        };
        improves.then_some(new_stop)
    }

    /// Close every open position, continuing past individual failures
    pub async fn close_all(&self) -> CloseReport {
        let mut report = CloseReport::default();

        let positions = match bounded(
            self.call_timeout,
            "list_open_positions",
            self.gateway.list_open_positions(),
        )
        .await
        {
            Ok(positions) => positions,
            Err(e) => {
                tracing::error!(target: logging::ERROR, "close all aborted, cannot list positions: {}", e);
                return report;
            }
        };

        for position in positions {
            let result = bounded(
                self.call_timeout,
                "close_position",
                self.gateway.close_position(position.id),
            )
            .await;

            match result {
                Ok(true) => {
                    tracing::info!(symbol = %position.symbol, position_id = position.id, "position closed");
                    report.closed.push(position.id);
                }
                Ok(false) => {
                    tracing::error!(
                        target: logging::ERROR,
                        symbol = %position.symbol, position_id = position.id,
                        "close request not accepted"
                    );
                    report.failed.push((position.id, "not accepted".to_string()));
                }
                Err(e) => {
                    tracing::error!(
                        target: logging::ERROR,
                        symbol = %position.symbol, position_id = position.id,
                        "close failed: {}", e
                    );
                    report.failed.push((position.id, e.to_string()));
                }
            }
        }

        tracing::info!(
            target: logging::MAIN,
            "closed {} positions, {} failed",
            report.closed.len(),
            report.failed.len()
        );
        report
    }

    fn forget_closed(&mut self, positions: &[OpenPosition]) -> usize {
        let before = self.trail_states.len();
        self.trail_states.retain(|id, _| {
            let open = positions.iter().any(|p| p.id == *id);
            if !open {
                tracing::info!(position_id = *id, "position no longer open");
            }
            open
        });
        before - self.trail_states.len()
    }

    async fn check_limits(&self, open_positions: usize) {
        let balance = bounded(self.call_timeout, "account_balance", self.gateway.account_balance()).await;
        let realized = bounded(
            self.call_timeout,
            "realized_profit_today",
            self.gateway.realized_profit_today(),
        )
        .await;

        let (balance, realized_today) = match (balance, realized) {
            (Ok(b), Ok(r)) => (b, r),
            (Err(e), _) | (_, Err(e)) => {
                // Keep the current gate state until the account can be read
                tracing::error!(target: logging::ERROR, "unable to read account for limits: {}", e);
                return;
            }
        };

        let account = AccountSnapshot {
            balance,
            realized_today,
            open_positions,
        };
        match self.limits.check(&account) {
            Ok(()) => {
                if self.gate.resume() {
                    tracing::info!(target: logging::MAIN, "trading resumed");
                }
            }
            Err(trip) => {
                if self.gate.pause(trip.to_string()) {
                    tracing::warn!(target: logging::MAIN, "trading paused: {}", trip);
                }
            }
        }
    }

    async fn move_stop(&self, position: &OpenPosition, new_stop: f64) -> bool {
        let result = bounded(
            self.call_timeout,
            "modify_position_stop",
            self.gateway
                .modify_position_stop(position.id, new_stop, position.take_profit),
        )
        .await;

        match result {
            Ok(true) => {
                tracing::info!(
                    symbol = %position.symbol, position_id = position.id,
                    "trailing stop {} -> {} (price {})",
                    position.stop_loss, new_stop, position.current_price
                );
                true
            }
            Ok(false) => {
                tracing::warn!(
                    target: logging::ERROR,
                    symbol = %position.symbol, position_id = position.id,
                    "stop modification not accepted"
                );
                false
            }
            Err(e) => {
                tracing::error!(
                    target: logging::ERROR,
                    symbol = %position.symbol, position_id = position.id,
                    "stop modification failed: {}", e
                );
                false
            }
        }
    }
}

/// Distance between open price and the recorded initial stop
fn risk_distance(position: &OpenPosition, fallback_fraction: f64) -> f64 {
    match position.initial_stop_loss {
        Some(initial) if initial > 0.0 => (position.open_price - initial).abs(),
        _ => fallback_fraction * position.open_price,
    }
}

fn favourable_move(position: &OpenPosition) -> f64 {
    match position.direction {
        Direction::Long => position.current_price - position.open_price,
        Direction::Short => position.open_price - position.current_price,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RiskConfig;
    use crate::gateway::PaperGateway;

    fn meta() -> InstrumentMetadata {
        InstrumentMetadata {
            tick_size: 0.0001,
            tick_value: 1.0,
            volume_step: 0.01,
            bid: 1.1000,
            ask: 1.1002,
        }
    }

    fn position(direction: Direction, open: f64, stop: f64, current: f64) -> OpenPosition {
        OpenPosition {
            id: 0,
            symbol: "EURUSD".into(),
            direction,
            open_price: open,
            stop_loss: stop,
            take_profit: 0.0,
            current_price: current,
            profit: 0.0,
            volume: 1.0,
            initial_stop_loss: Some(stop),
        }
    }

    fn manager(paper: &Arc<PaperGateway>) -> PositionManager {
        PositionManager::new(
            paper.clone(),
            Arc::new(TradingGate::default()),
            RiskLimits::from(&RiskConfig::default()),
            0.01,
            Duration::from_secs(1),
        )
    }

    #[test]
    fn test_no_trail_inside_initial_risk() {
        let paper = Arc::new(PaperGateway::new(10_000.0));
        let pm = manager(&paper);
        // Moved 40 ticks with 50 ticks of risk
        let p = position(Direction::Long, 1.1000, 1.0950, 1.1040);
        assert_eq!(pm.trail(&p, &meta()), None);
    }

    #[test]
    fn test_long_trails_at_risk_distance() {
        let paper = Arc::new(PaperGateway::new(10_000.0));
        let pm = manager(&paper);
        let p = position(Direction::Long, 1.1000, 1.0950, 1.1080);
        assert_eq!(pm.trail(&p, &meta()), Some(1.1030));
    }

    #[test]
    fn test_short_trails_at_risk_distance() {
        let paper = Arc::new(PaperGateway::new(10_000.0));
        let pm = manager(&paper);
        let p = position(Direction::Short, 1.1000, 1.1050, 1.0920);
        assert_eq!(pm.trail(&p, &meta()), Some(1.0970));
    }

    #[test]
    fn test_trail_never_loosens() {
        let paper = Arc::new(PaperGateway::new(10_000.0));
        let pm = manager(&paper);

        let mut long = position(Direction::Long, 1.1000, 1.0950, 1.1080);
        long.stop_loss = 1.1040;
        assert_eq!(pm.trail(&long, &meta()), None);

        let mut short = position(Direction::Short, 1.1000, 1.1050, 1.0920);
        short.stop_loss = 1.0960;
        assert_eq!(pm.trail(&short, &meta()), None);
    }

    #[test]
    fn test_fallback_distance_without_initial_stop() {
        let paper = Arc::new(PaperGateway::new(10_000.0));
        let pm = manager(&paper);
        // 1% of 2000.00 = 20.00
        let mut p = position(Direction::Long, 2000.0, 0.0, 2030.0);
        p.initial_stop_loss = None;
        let gold = InstrumentMetadata {
            tick_size: 0.01,
            ..meta()
        };
        assert_eq!(pm.trail(&p, &gold), Some(2010.0));
    }

    #[tokio::test]
    async fn test_cycle_moves_stop_and_tracks_state() {
        let paper = Arc::new(PaperGateway::new(10_000.0));
        paper.set_instrument("EURUSD", meta());
        let id = paper.add_position(position(Direction::Long, 1.1000, 1.0950, 1.1000));
        let mut pm = manager(&paper);

        let report = pm.run_cycle().await;
        assert_eq!(report.stops_moved, 0);
        assert_eq!(pm.trail_state(id), Some(TrailState::Initial));

        paper.set_price("EURUSD", 1.1080);
        let report = pm.run_cycle().await;
        assert_eq!(report.stops_moved, 1);
        assert_eq!(pm.trail_state(id), Some(TrailState::Trailing));
        assert_eq!(paper.modifications(), vec![(id, 1.1030)]);

        // Price pulls back: state stays Trailing, stop stays put
        paper.set_price("EURUSD", 1.1060);
        let report = pm.run_cycle().await;
        assert_eq!(report.stops_moved, 0);
        assert_eq!(pm.trail_state(id), Some(TrailState::Trailing));

        paper.close_position(id).await.unwrap();
        let report = pm.run_cycle().await;
        assert_eq!(report.closed_since_last_cycle, 1);
        assert_eq!(pm.trail_state(id), None);
    }

    #[tokio::test]
    async fn test_daily_loss_pauses_and_resumes() {
        let paper = Arc::new(PaperGateway::new(10_000.0));
        let mut pm = manager(&paper);

        paper.set_realized_profit_today(-400.0);
        assert!(pm.run_cycle().await.paused);

        paper.set_realized_profit_today(-100.0);
        assert!(!pm.run_cycle().await.paused);
    }

    #[tokio::test]
    async fn test_close_all_continues_past_failures() {
        let paper = Arc::new(PaperGateway::new(10_000.0));
        let first = paper.add_position(position(Direction::Long, 1.1, 1.09, 1.1));
        let second = paper.add_position(position(Direction::Short, 1.1, 1.11, 1.1));
        let third = paper.add_position(position(Direction::Long, 1.1, 1.09, 1.1));
        paper.fail_close(second);

        let report = manager(&paper).close_all().await;
        assert_eq!(report.closed, vec![first, third]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, second);
        assert_eq!(paper.open_positions().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let paper = Arc::new(PaperGateway::new(10_000.0));
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(manager(&paper).run(Duration::from_secs(5), rx));

        tokio::time::sleep(Duration::from_secs(12)).await;
        tx.send(true).unwrap();
        let pm = task.await.unwrap();
        assert!(pm.trail_state(1).is_none());
    }
}
