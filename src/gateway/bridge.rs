use async_trait::async_trait;
use chrono::{DateTime, Utc};
use governor::{Quota, RateLimiter};
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use super::{retcode, Gateway};
use crate::error::{BotError, Result};
use crate::models::{
    Bar, Direction, InstrumentMetadata, OpenPosition, OrderRequest, SubmitResponse, Timeframe,
};

// Type alias for the rate limiter to simplify signatures
type BridgeRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Prefix used to carry the initial stop-loss in the broker's order comment
const INITIAL_STOP_TAG: &str = "isl=";

/// JSON-over-HTTP client for a terminal bridge in front of the broker
///
/// Cloneable; all clones share the same rate limiter.
#[derive(Clone)]
pub struct BridgeClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    rate_limiter: Arc<BridgeRateLimiter>,
}

#[derive(Debug, Deserialize)]
struct BarResponse {
    time: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    #[serde(default)]
    tick_volume: f64,
}

#[derive(Debug, Deserialize)]
struct SymbolResponse {
    trade_tick_size: f64,
    trade_tick_value: f64,
    volume_step: f64,
    bid: f64,
    ask: f64,
}

#[derive(Debug, Deserialize)]
struct AccountResponse {
    balance: f64,
}

#[derive(Debug, Deserialize)]
struct HistoryTodayResponse {
    profit: f64,
}

#[derive(Debug, Deserialize)]
struct RetcodeResponse {
    retcode: u32,
}

#[derive(Debug, Deserialize)]
struct PositionResponse {
    ticket: u64,
    symbol: String,
    /// 0 = buy, 1 = sell
    #[serde(rename = "type")]
    position_type: u8,
    price_open: f64,
    sl: f64,
    tp: f64,
    price_current: f64,
    profit: f64,
    volume: f64,
    #[serde(default)]
    comment: String,
}

#[derive(Debug, Serialize)]
struct PendingOrderBody<'a> {
    action: &'static str,
    symbol: &'a str,
    volume: f64,
    #[serde(rename = "type")]
    order_type: &'static str,
    price: f64,
    sl: f64,
    tp: f64,
    type_filling: &'static str,
    type_time: &'static str,
    comment: String,
}

#[derive(Debug, Serialize)]
struct ModifyStopBody {
    sl: f64,
    tp: f64,
}

/// Encode the initial stop into the order comment
pub fn encode_initial_stop(stop_loss: f64) -> String {
    format!("{}{}", INITIAL_STOP_TAG, stop_loss)
}

/// Recover the initial stop from an order comment, if one was recorded
pub fn parse_initial_stop(comment: &str) -> Option<f64> {
    comment
        .split_whitespace()
        .find_map(|part| part.strip_prefix(INITIAL_STOP_TAG))
        .and_then(|value| value.parse::<f64>().ok())
        .filter(|value| value.is_finite() && *value > 0.0)
}

impl BridgeClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
        requests_per_second: u32,
    ) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;

        let rps = NonZeroU32::new(requests_per_second.max(1)).unwrap_or(NonZeroU32::MIN);
        let rate_limiter = Arc::new(RateLimiter::direct(Quota::per_second(rps)));

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            rate_limiter,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.header("X-API-Key", key),
            None => request,
        }
    }

    /// Send a rate-limited request and return the body of a 2xx response
    async fn send(&self, request: RequestBuilder) -> Result<String> {
        self.rate_limiter.until_ready().await;

        let response = self.authorize(request).send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(BotError::Gateway(format!("bridge returned {}: {}", status, body)));
        }

        Ok(body)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let body = self.send(self.client.get(self.url(path))).await?;
        Ok(serde_json::from_str(&body)?)
    }

    async fn bars(&self, symbol: &str, timeframe: Timeframe, count: usize) -> Result<Vec<Bar>> {
        let path = format!(
            "/bars/{}?timeframe={}&count={}",
            symbol,
            timeframe.as_str(),
            count
        );
        let raw: Vec<BarResponse> = self.get_json(&path).await?;

        let mut bars = raw
            .into_iter()
            .map(|b| {
                let timestamp = DateTime::from_timestamp(b.time, 0).ok_or_else(|| {
                    BotError::Gateway(format!("invalid bar time {} for {}", b.time, symbol))
                })?;
                Ok(Bar {
                    timestamp,
                    open: b.open,
                    high: b.high,
                    low: b.low,
                    close: b.close,
                    volume: b.tick_volume,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        bars.sort_by_key(|b| b.timestamp);
        Ok(bars)
    }
}

#[async_trait]
impl Gateway for BridgeClient {
    async fn fetch_recent_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        count: usize,
    ) -> Result<Vec<Bar>> {
        let bars = self.bars(symbol, timeframe, count).await?;
        if bars.is_empty() {
            return Err(BotError::EmptyData(format!("{} {}", symbol, timeframe)));
        }
        Ok(bars)
    }

    async fn fetch_latest_bar_timestamp(
        &self,
        symbol: &str,
        timeframe: Timeframe,
    ) -> Result<DateTime<Utc>> {
        self.bars(symbol, timeframe, 1)
            .await?
            .last()
            .map(|b| b.timestamp)
            .ok_or_else(|| BotError::EmptyData(format!("{} {}", symbol, timeframe)))
    }

    async fn instrument_metadata(&self, symbol: &str) -> Result<InstrumentMetadata> {
        let info: SymbolResponse = self
            .get_json(&format!("/symbols/{}", symbol))
            .await
            .map_err(|e| BotError::InstrumentUnavailable(format!("{}: {}", symbol, e)))?;

        Ok(InstrumentMetadata {
            tick_size: info.trade_tick_size,
            tick_value: info.trade_tick_value,
            volume_step: info.volume_step,
            bid: info.bid,
            ask: info.ask,
        })
    }

    async fn account_balance(&self) -> Result<f64> {
        let account: AccountResponse = self.get_json("/account").await?;
        Ok(account.balance)
    }

    async fn realized_profit_today(&self) -> Result<f64> {
        let history: HistoryTodayResponse = self.get_json("/history/today").await?;
        Ok(history.profit)
    }

    async fn submit_pending_order(&self, request: &OrderRequest) -> Result<SubmitResponse> {
        let body = PendingOrderBody {
            action: "pending",
            symbol: &request.symbol,
            volume: request.volume,
            order_type: request.direction.pending_order_type(),
            price: request.price,
            sl: request.stop_loss,
            tp: request.take_profit,
            type_filling: "return",
            type_time: "gtc",
            comment: encode_initial_stop(request.initial_stop_loss),
        };

        let raw = self
            .send(self.client.post(self.url("/orders")).json(&body))
            .await?;
        let parsed: RetcodeResponse = serde_json::from_str(&raw)?;

        Ok(SubmitResponse {
            status_code: parsed.retcode,
            raw,
        })
    }

    async fn modify_position_stop(
        &self,
        position_id: u64,
        stop_loss: f64,
        take_profit: f64,
    ) -> Result<bool> {
        let raw = self
            .send(
                self.client
                    .post(self.url(&format!("/positions/{}/sltp", position_id)))
                    .json(&ModifyStopBody {
                        sl: stop_loss,
                        tp: take_profit,
                    }),
            )
            .await?;
        let parsed: RetcodeResponse = serde_json::from_str(&raw)?;
        Ok(parsed.retcode == retcode::DONE)
    }

    async fn close_position(&self, position_id: u64) -> Result<bool> {
        let raw = self
            .send(
                self.client
                    .delete(self.url(&format!("/positions/{}", position_id))),
            )
            .await?;
        let parsed: RetcodeResponse = serde_json::from_str(&raw)?;
        Ok(parsed.retcode == retcode::DONE)
    }

    async fn list_open_positions(&self) -> Result<Vec<OpenPosition>> {
        let raw: Vec<PositionResponse> = self.get_json("/positions").await?;

        raw.into_iter()
            .map(|p| {
                let direction = match p.position_type {
                    0 => Direction::Long,
                    1 => Direction::Short,
                    other => {
                        return Err(BotError::Gateway(format!(
                            "unknown position type {} for ticket {}",
                            other, p.ticket
                        )))
                    }
                };
                Ok(OpenPosition {
                    id: p.ticket,
                    initial_stop_loss: parse_initial_stop(&p.comment),
                    symbol: p.symbol,
                    direction,
                    open_price: p.price_open,
                    stop_loss: p.sl,
                    take_profit: p.tp,
                    current_price: p.price_current,
                    profit: p.profit,
                    volume: p.volume,
                })
            })
            .collect()
    }

    fn name(&self) -> &str {
        "bridge"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn client(url: String) -> BridgeClient {
        BridgeClient::new(url, Some("secret".into()), Duration::from_secs(5), 100).unwrap()
    }

    #[test]
    fn test_initial_stop_comment_round_trip() {
        let comment = encode_initial_stop(1.1);
        assert_eq!(comment, "isl=1.1");
        assert_eq!(parse_initial_stop(&comment), Some(1.1));
        assert_eq!(parse_initial_stop("manual trade"), None);
        assert_eq!(parse_initial_stop("isl=abc"), None);
        assert_eq!(parse_initial_stop("tp1 isl=0.6543"), Some(0.6543));
    }

    #[tokio::test]
    async fn test_fetch_recent_bars_sorted() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/bars/EURUSD")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("timeframe".into(), "M5".into()),
                Matcher::UrlEncoded("count".into(), "2".into()),
            ]))
            .match_header("X-API-Key", "secret")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"[
                    {"time": 1726497300, "open": 1.1, "high": 1.2, "low": 1.0, "close": 1.15, "tick_volume": 10},
                    {"time": 1726497000, "open": 1.0, "high": 1.1, "low": 0.9, "close": 1.1, "tick_volume": 12}
                ]"#,
            )
            .create_async()
            .await;

        let bars = client(server.url())
            .fetch_recent_bars("EURUSD", Timeframe::M5, 2)
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(bars.len(), 2);
        assert!(bars[0].timestamp < bars[1].timestamp);
        assert_eq!(bars[1].close, 1.15);
    }

    #[tokio::test]
    async fn test_latest_timestamp_empty_is_transient() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/bars/EURUSD")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body("[]")
            .create_async()
            .await;

        let err = client(server.url())
            .fetch_latest_bar_timestamp("EURUSD", Timeframe::M5)
            .await
            .unwrap_err();
        assert!(matches!(err, BotError::EmptyData(_)));
    }

    #[tokio::test]
    async fn test_submit_pending_order_encodes_comment() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/orders")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "type": "BUY_STOP",
                "symbol": "EURUSD",
                "comment": "isl=1.1",
            })))
            .with_status(200)
            .with_body(r#"{"retcode": 10009, "order": 55}"#)
            .create_async()
            .await;

        let request = OrderRequest {
            signal_id: uuid::Uuid::new_v4(),
            symbol: "EURUSD".into(),
            direction: Direction::Long,
            volume: 2.0,
            price: 1.105,
            stop_loss: 1.1,
            take_profit: 1.115,
            initial_stop_loss: 1.1,
        };

        let response = client(server.url())
            .submit_pending_order(&request)
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(response.status_code, retcode::DONE);
        assert!(response.raw.contains("\"order\": 55"));
    }

    #[tokio::test]
    async fn test_list_open_positions_adapts_comment() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/positions")
            .with_status(200)
            .with_body(
                r#"[
                    {"ticket": 7, "symbol": "EURUSD", "type": 0, "price_open": 1.105, "sl": 1.1,
                     "tp": 1.115, "price_current": 1.111, "profit": 12.0, "volume": 2.0, "comment": "isl=1.1"},
                    {"ticket": 8, "symbol": "GBPUSD", "type": 1, "price_open": 1.3, "sl": 1.31,
                     "tp": 1.28, "price_current": 1.29, "profit": 5.0, "volume": 1.0}
                ]"#,
            )
            .create_async()
            .await;

        let positions = client(server.url()).list_open_positions().await.unwrap();
        assert_eq!(positions.len(), 2);
        assert_eq!(positions[0].direction, Direction::Long);
        assert_eq!(positions[0].initial_stop_loss, Some(1.1));
        assert_eq!(positions[1].direction, Direction::Short);
        assert_eq!(positions[1].initial_stop_loss, None);
    }

    #[tokio::test]
    async fn test_http_error_surfaces_as_gateway_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/account")
            .with_status(503)
            .with_body("terminal offline")
            .create_async()
            .await;

        let err = client(server.url()).account_balance().await.unwrap_err();
        assert!(matches!(err, BotError::Gateway(_)));
        assert!(err.to_string().contains("terminal offline"));
    }

    #[tokio::test]
    async fn test_modify_and_close_map_retcode() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/positions/7/sltp")
            .with_status(200)
            .with_body(r#"{"retcode": 10009}"#)
            .create_async()
            .await;
        server
            .mock("DELETE", "/positions/7")
            .with_status(200)
            .with_body(r#"{"retcode": 10013}"#)
            .create_async()
            .await;

        let bridge = client(server.url());
        assert!(bridge.modify_position_stop(7, 1.108, 1.115).await.unwrap());
        assert!(!bridge.close_position(7).await.unwrap());
    }
}
