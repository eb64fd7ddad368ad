use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use super::queue::SignalQueue;
use crate::error::BotError;
use crate::gateway::{bounded, retcode, Gateway};
use crate::logging;
use crate::models::{OrderOutcome, OrderRequest, OrderResult, SignalDecision};
use crate::risk::{LimitTrip, TradingGate};

/// Map a broker status code onto the three outcomes the executor acts on
pub fn classify(status_code: u32) -> OrderOutcome {
    match status_code {
        retcode::PLACED | retcode::DONE | retcode::DONE_PARTIAL => OrderOutcome::Success,
        retcode::REQUOTE
        | retcode::TIMEOUT
        | retcode::PRICE_CHANGED
        | retcode::PRICE_OFF
        | retcode::TOO_MANY_REQUESTS
        | retcode::CONNECTION => OrderOutcome::Recoverable,
        _ => OrderOutcome::Fatal,
    }
}

/// Counters over the executor's lifetime
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutorStats {
    pub succeeded: u64,
    pub retries_exhausted: u64,
    pub fatal: u64,
    pub dropped_while_paused: u64,
    /// Signals refused because every concurrent-trade slot was taken
    pub dropped_at_limit: u64,
    pub panicked: u64,
}

pub struct OrderExecutor {
    gateway: Arc<dyn Gateway>,
    gate: Arc<TradingGate>,
    order_retries: u32,
    call_timeout: Duration,
    trade_processor: bool,
    max_concurrent_trades: Option<usize>,
    // Serializes slot claims so concurrent workers see each other's reservations
    admission: tokio::sync::Mutex<()>,
    reserved: Mutex<usize>,
    stats: Mutex<ExecutorStats>,
}

/// A claimed concurrent-trade slot, released when the submission ends
struct TradeSlot<'a> {
    reserved: &'a Mutex<usize>,
}

impl Drop for TradeSlot<'_> {
    fn drop(&mut self) {
        let mut reserved = self.reserved.lock();
        *reserved = reserved.saturating_sub(1);
    }
}

impl OrderExecutor {
    pub fn new(
        gateway: Arc<dyn Gateway>,
        gate: Arc<TradingGate>,
        order_retries: u32,
        call_timeout: Duration,
    ) -> Self {
        Self {
            gateway,
            gate,
            order_retries,
            call_timeout,
            trade_processor: false,
            max_concurrent_trades: None,
            admission: tokio::sync::Mutex::new(()),
            reserved: Mutex::new(0),
            stats: Mutex::new(ExecutorStats::default()),
        }
    }

    /// Emit per-attempt lines on the trade processor sink
    pub fn with_trade_processor(mut self, enabled: bool) -> Self {
        self.trade_processor = enabled;
        self
    }

    /// Refuse a submission once open positions plus submissions in flight
    /// reach `limit`
    pub fn with_max_concurrent_trades(mut self, limit: usize) -> Self {
        self.max_concurrent_trades = Some(limit);
        self
    }

    pub fn stats(&self) -> ExecutorStats {
        self.stats.lock().clone()
    }

    /// Submit one signal, retrying recoverable statuses up to `order_retries` times
    ///
    /// A call that errors or times out is not retried, since the venue may
    /// already have accepted the order.
    pub async fn execute(&self, signal: &SignalDecision) -> OrderResult {
        let request = OrderRequest::from(signal);
        let symbol = request.symbol.as_str();

        let _slot = match self.claim_slot().await {
            Ok(slot) => slot,
            Err(reason) => {
                self.stats.lock().dropped_at_limit += 1;
                tracing::warn!(
                    target: logging::TRADE_PROCESSOR,
                    %symbol, signal_id = %request.signal_id,
                    "signal dropped before submission: {}", reason
                );
                return OrderResult {
                    signal_id: request.signal_id,
                    symbol: request.symbol.clone(),
                    outcome: OrderOutcome::Fatal,
                    status_code: None,
                    attempts: 0,
                    raw: reason,
                };
            }
        };

        let mut attempts = 0;

        loop {
            attempts += 1;
            if self.trade_processor {
                tracing::info!(
                    target: logging::TRADE_PROCESSOR,
                    %symbol, signal_id = %request.signal_id, attempt = attempts,
                    "submitting {} {} @ {} sl={} tp={}",
                    request.direction.pending_order_type(), request.volume,
                    request.price, request.stop_loss, request.take_profit
                );
            }

            let response = match bounded(
                self.call_timeout,
                "submit_pending_order",
                self.gateway.submit_pending_order(&request),
            )
            .await
            {
                Ok(response) => response,
                Err(e) => {
                    tracing::error!(
                        target: logging::ERROR,
                        %symbol, signal_id = %request.signal_id,
                        "order submission failed, signal dropped: {}", e
                    );
                    return self.finish(&request, OrderOutcome::Fatal, None, attempts, e.to_string());
                }
            };

            let outcome = classify(response.status_code);
            match outcome {
                OrderOutcome::Success => {
                    tracing::info!(
                        %symbol, signal_id = %request.signal_id, status = response.status_code,
                        "order placed after {} attempt(s)", attempts
                    );
                }
                OrderOutcome::Recoverable if attempts <= self.order_retries => {
                    tracing::warn!(
                        target: logging::TRADE_PROCESSOR,
                        %symbol, signal_id = %request.signal_id, status = response.status_code,
                        "recoverable rejection, retrying ({}/{})", attempts, self.order_retries
                    );
                    continue;
                }
                OrderOutcome::Recoverable => {
                    tracing::error!(
                        target: logging::ERROR,
                        %symbol, signal_id = %request.signal_id,
                        "retries exhausted after {} attempts: {}",
                        attempts,
                        BotError::OrderRejected { status: response.status_code, raw: response.raw.clone() }
                    );
                }
                OrderOutcome::Fatal => {
                    tracing::error!(
                        target: logging::ERROR,
                        %symbol, signal_id = %request.signal_id,
                        "signal dropped: {}",
                        BotError::OrderRejected { status: response.status_code, raw: response.raw.clone() }
                    );
                }
            }

            return self.finish(
                &request,
                outcome,
                Some(response.status_code),
                attempts,
                response.raw,
            );
        }
    }

    /// Reserve a slot against `max_concurrent_trades`, counting the venue's
    /// open positions plus slots already held by other submissions
    async fn claim_slot(&self) -> std::result::Result<Option<TradeSlot<'_>>, String> {
        let Some(limit) = self.max_concurrent_trades else {
            return Ok(None);
        };

        let _admission = self.admission.lock().await;
        let open = bounded(
            self.call_timeout,
            "list_open_positions",
            self.gateway.list_open_positions(),
        )
        .await
        .map_err(|e| format!("open positions unavailable: {}", e))?
        .len();

        let mut reserved = self.reserved.lock();
        let taken = open + *reserved;
        if taken >= limit {
            return Err(LimitTrip::ConcurrentTrades { open: taken, limit }.to_string());
        }
        *reserved += 1;
        Ok(Some(TradeSlot {
            reserved: &self.reserved,
        }))
    }

    fn finish(
        &self,
        request: &OrderRequest,
        outcome: OrderOutcome,
        status_code: Option<u32>,
        attempts: u32,
        raw: String,
    ) -> OrderResult {
        {
            let mut stats = self.stats.lock();
            match outcome {
                OrderOutcome::Success => stats.succeeded += 1,
                OrderOutcome::Recoverable => stats.retries_exhausted += 1,
                OrderOutcome::Fatal => stats.fatal += 1,
            }
        }

        OrderResult {
            signal_id: request.signal_id,
            symbol: request.symbol.clone(),
            outcome,
            status_code,
            attempts,
            raw,
        }
    }

    /// Drain the queue with `workers` concurrent workers until it is closed
    ///
    /// Each submission runs in its own task so a panic only loses that signal.
    pub async fn run_workers(self: Arc<Self>, queue: Arc<SignalQueue>, workers: usize) {
        let handles: Vec<_> = (0..workers.max(1))
            .map(|worker| {
                let executor = Arc::clone(&self);
                let queue = Arc::clone(&queue);
                tokio::spawn(async move { executor.worker(worker, queue).await })
            })
            .collect();

        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(target: logging::ERROR, "order worker exited abnormally: {}", e);
            }
        }
        tracing::info!(target: logging::MAIN, "order workers stopped");
    }

    async fn worker(self: Arc<Self>, worker: usize, queue: Arc<SignalQueue>) {
        tracing::debug!(target: logging::TRADE_PROCESSOR, worker, "order worker started");

        while let Some(lease) = queue.pop().await {
            if let Some(reason) = self.gate.reason() {
                self.stats.lock().dropped_while_paused += 1;
                tracing::warn!(
                    target: logging::TRADE_PROCESSOR,
                    symbol = %lease.symbol, signal_id = %lease.id,
                    "trading paused ({}), signal dropped", reason
                );
                continue;
            }

            let executor = Arc::clone(&self);
            let signal = lease.signal().clone();
            let submission = tokio::spawn(async move { executor.execute(&signal).await });

            if let Err(e) = submission.await {
                self.stats.lock().panicked += 1;
                tracing::error!(
                    target: logging::ERROR,
                    symbol = %lease.symbol, signal_id = %lease.id,
                    "order task failed: {}", e
                );
            }
            // Releases the symbol for the next signal
            drop(lease);
        }

        tracing::debug!(target: logging::TRADE_PROCESSOR, worker, "order worker finished");
    }
}
