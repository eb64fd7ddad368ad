// Market and broker gateway boundary
pub mod bridge;
pub mod paper;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Duration;

use crate::error::{BotError, Result};
use crate::models::{Bar, InstrumentMetadata, OpenPosition, OrderRequest, SubmitResponse, Timeframe};

pub use bridge::BridgeClient;
pub use paper::PaperGateway;

/// Broker return codes (MetaTrader trade server codes)
pub mod retcode {
    pub const REQUOTE: u32 = 10004;
    pub const REJECT: u32 = 10006;
    pub const PLACED: u32 = 10008;
    pub const DONE: u32 = 10009;
    pub const DONE_PARTIAL: u32 = 10010;
    pub const TIMEOUT: u32 = 10012;
    pub const INVALID: u32 = 10013;
    pub const INVALID_VOLUME: u32 = 10014;
    pub const INVALID_PRICE: u32 = 10015;
    pub const INVALID_STOPS: u32 = 10016;
    pub const MARKET_CLOSED: u32 = 10018;
    pub const NO_MONEY: u32 = 10019;
    pub const PRICE_CHANGED: u32 = 10020;
    pub const PRICE_OFF: u32 = 10021;
    pub const TOO_MANY_REQUESTS: u32 = 10024;
    pub const CONNECTION: u32 = 10031;
}

/// Everything the core needs from the market-data feed and the execution venue
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Recent bars for a symbol, oldest first
    async fn fetch_recent_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        count: usize,
    ) -> Result<Vec<Bar>>;

    /// Timestamp of the newest bar. Changes exactly once per bar close.
    async fn fetch_latest_bar_timestamp(
        &self,
        symbol: &str,
        timeframe: Timeframe,
    ) -> Result<DateTime<Utc>>;

    async fn instrument_metadata(&self, symbol: &str) -> Result<InstrumentMetadata>;

    async fn account_balance(&self) -> Result<f64>;

    /// Realized profit (negative for a loss) of positions closed today
    async fn realized_profit_today(&self) -> Result<f64>;

    async fn submit_pending_order(&self, request: &OrderRequest) -> Result<SubmitResponse>;

    async fn modify_position_stop(
        &self,
        position_id: u64,
        stop_loss: f64,
        take_profit: f64,
    ) -> Result<bool>;

    async fn close_position(&self, position_id: u64) -> Result<bool>;

    async fn list_open_positions(&self) -> Result<Vec<OpenPosition>>;

    fn name(&self) -> &str;
}

/// Run a gateway call with an upper bound on its duration
pub async fn bounded<T, F>(limit: Duration, operation: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(BotError::timeout(operation, limit.as_secs())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[tokio::test]
    async fn test_bounded_passes_result_through() {
        let value = bounded(Duration::from_secs(1), "fast", async { Ok(42) })
            .await
            .unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_times_out() {
        let result: Result<()> = bounded(Duration::from_secs(2), "slow_call", async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransientFeed);
        assert!(err.to_string().contains("slow_call"));
    }
}
