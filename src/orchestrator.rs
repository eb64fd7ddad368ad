//! Wires the timing loop, order workers and position manager together
//!
//! All shared state lives behind the handles held by [`BotHandle`]; the loops
//! only talk to each other through the signal queue, the trading gate and the
//! gateway.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::BotConfig;
use crate::error::{BotError, Result};
use crate::execution::{CloseReport, ExecutorStats, OrderExecutor, PositionManager, SignalQueue};
use crate::gateway::{bounded, Gateway};
use crate::logging;
use crate::models::{SymbolStrategyBinding, Timeframe};
use crate::risk::{RiskLimits, TradingGate};
use crate::strategy::StrategyDispatcher;
use crate::timing::{sleep_until_next, TimingTracker};

pub struct Orchestrator;

/// Running bot. Dropping it without `stop` leaves the tasks running.
pub struct BotHandle {
    shutdown: watch::Sender<bool>,
    queue: Arc<SignalQueue>,
    gate: Arc<TradingGate>,
    executor: Arc<OrderExecutor>,
    timing_task: JoinHandle<()>,
    worker_task: JoinHandle<()>,
    position_task: JoinHandle<PositionManager>,
    close_on_shutdown: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ShutdownReport {
    pub discarded_signals: usize,
    pub executor: ExecutorStats,
    /// Present when positions were closed on the way out
    pub closed: Option<CloseReport>,
}

impl Orchestrator {
    /// Check the gateway is reachable, then spawn every loop
    ///
    /// Fails without starting anything when the account cannot be read.
    pub async fn start(config: BotConfig, gateway: Arc<dyn Gateway>) -> Result<BotHandle> {
        config.validate()?;
        let call_timeout = config.gateway.timeout();

        let balance = bounded(call_timeout, "account_balance", gateway.account_balance())
            .await
            .map_err(|e| {
                BotError::Startup(format!("{} gateway login check failed: {}", gateway.name(), e))
            })?;

        log_settings(&config, gateway.name(), balance);

        let bindings: Vec<SymbolStrategyBinding> =
            config.bindings().into_values().flatten().collect();
        let step = config
            .smallest_timeframe()
            .ok_or_else(|| BotError::Configuration("no timeframes configured".into()))?;

        let tracker = TimingTracker::new(
            bindings.iter(),
            config.error_handling.max_retries,
            config.timing.trigger_on_first_bar,
            call_timeout,
        );
        let dispatcher = StrategyDispatcher::new(
            gateway.clone(),
            bindings.iter(),
            config.risk.max_trade_fraction,
            call_timeout,
        )?;

        let queue = Arc::new(SignalQueue::new(
            config.signal_management.max_pending_per_symbol,
        ));
        let gate = Arc::new(TradingGate::default());
        let executor = Arc::new(
            OrderExecutor::new(
                gateway.clone(),
                gate.clone(),
                config.signal_management.order_retries,
                call_timeout,
            )
            .with_trade_processor(config.signal_management.trade_processor)
            .with_max_concurrent_trades(config.risk.max_concurrent_trades),
        );
        let position_manager = PositionManager::new(
            gateway.clone(),
            gate.clone(),
            RiskLimits::from(&config.risk),
            config.risk.max_stop_loss_fraction,
            call_timeout,
        );

        let (shutdown, shutdown_rx) = watch::channel(false);

        let timing_task = tokio::spawn(timing_loop(
            tracker,
            dispatcher,
            gateway.clone(),
            queue.clone(),
            step,
            Duration::from_secs(config.timing.settle_secs),
            shutdown_rx.clone(),
        ));
        let worker_task = tokio::spawn(
            executor
                .clone()
                .run_workers(queue.clone(), config.signal_management.workers),
        );
        let position_task = tokio::spawn(position_manager.run(
            Duration::from_secs(config.trade_management.interval_secs),
            shutdown_rx,
        ));

        tracing::info!(
            target: logging::MAIN,
            "🚀 {} started: {} streams, {} order workers",
            config.bot_name,
            bindings.len(),
            config.signal_management.workers
        );

        Ok(BotHandle {
            shutdown,
            queue,
            gate,
            executor,
            timing_task,
            worker_task,
            position_task,
            close_on_shutdown: config.trade_management.close_on_shutdown,
        })
    }
}

impl BotHandle {
    pub fn is_paused(&self) -> bool {
        self.gate.is_paused()
    }

    pub fn pending_signals(&self) -> usize {
        self.queue.len()
    }

    pub fn executor_stats(&self) -> ExecutorStats {
        self.executor.stats()
    }

    /// Stop every loop and wait for in-flight submissions
    ///
    /// The timing loop finishes its current iteration first, then the queue is
    /// closed and the workers drain. Open positions are closed afterwards when
    /// `close_on_shutdown` is set.
    pub async fn stop(self) -> ShutdownReport {
        tracing::info!(target: logging::MAIN, "⚠️  shutdown requested");
        let _ = self.shutdown.send(true);

        if let Err(e) = self.timing_task.await {
            tracing::error!(target: logging::ERROR, "timing loop ended abnormally: {}", e);
        }

        let discarded_signals = self.queue.close();
        if let Err(e) = self.worker_task.await {
            tracing::error!(target: logging::ERROR, "worker pool ended abnormally: {}", e);
        }

        let closed = match self.position_task.await {
            Ok(manager) if self.close_on_shutdown => Some(manager.close_all().await),
            Ok(_) => None,
            Err(e) => {
                tracing::error!(target: logging::ERROR, "position manager ended abnormally: {}", e);
                None
            }
        };

        tracing::info!(target: logging::MAIN, "👋 stopped");
        ShutdownReport {
            discarded_signals,
            executor: self.executor.stats(),
            closed,
        }
    }
}

fn log_settings(config: &BotConfig, gateway: &str, balance: f64) {
    tracing::info!(
        target: logging::MAIN,
        "connected to {} gateway, balance {:.2}",
        gateway,
        balance
    );
    for line in config.summary().lines() {
        tracing::info!(target: logging::MAIN, "{}", line);
    }
    for binding in config.bindings().values().flatten() {
        tracing::info!(symbol = %binding.symbol, "binding: {}", binding);
    }
}

/// Poll every stream on the timeframe grid and queue the resulting signals
async fn timing_loop(
    mut tracker: TimingTracker,
    dispatcher: StrategyDispatcher,
    gateway: Arc<dyn Gateway>,
    queue: Arc<SignalQueue>,
    step: Timeframe,
    settle: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        for trigger in tracker.update_timings(gateway.as_ref()).await {
            if let Some(signal) = dispatcher.dispatch(&trigger).await {
                queue.push(signal);
            }
        }

        let wait = sleep_until_next(Utc::now(), step, settle);
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    tracing::info!(target: logging::MAIN, "timing loop stopped");
}
