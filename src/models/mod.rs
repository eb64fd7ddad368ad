use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::BotError;

/// OHLCV bar for one timeframe bucket
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Bar granularity, using the broker's naming (M5, H1, D1...)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Timeframe {
    M1,
    M2,
    M3,
    M4,
    M5,
    M6,
    M10,
    M12,
    M15,
    M20,
    M30,
    H1,
    H2,
    H3,
    H4,
    H6,
    H8,
    H12,
    D1,
    W1,
}

impl Timeframe {
    pub fn minutes(self) -> u64 {
        match self {
            Timeframe::M1 => 1,
            Timeframe::M2 => 2,
            Timeframe::M3 => 3,
            Timeframe::M4 => 4,
            Timeframe::M5 => 5,
            Timeframe::M6 => 6,
            Timeframe::M10 => 10,
            Timeframe::M12 => 12,
            Timeframe::M15 => 15,
            Timeframe::M20 => 20,
            Timeframe::M30 => 30,
            Timeframe::H1 => 60,
            Timeframe::H2 => 120,
            Timeframe::H3 => 180,
            Timeframe::H4 => 240,
            Timeframe::H6 => 360,
            Timeframe::H8 => 480,
            Timeframe::H12 => 720,
            Timeframe::D1 => 1440,
            Timeframe::W1 => 10080,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Timeframe::M1 => "M1",
            Timeframe::M2 => "M2",
            Timeframe::M3 => "M3",
            Timeframe::M4 => "M4",
            Timeframe::M5 => "M5",
            Timeframe::M6 => "M6",
            Timeframe::M10 => "M10",
            Timeframe::M12 => "M12",
            Timeframe::M15 => "M15",
            Timeframe::M20 => "M20",
            Timeframe::M30 => "M30",
            Timeframe::H1 => "H1",
            Timeframe::H2 => "H2",
            Timeframe::H3 => "H3",
            Timeframe::H4 => "H4",
            Timeframe::H6 => "H6",
            Timeframe::H8 => "H8",
            Timeframe::H12 => "H12",
            Timeframe::D1 => "D1",
            Timeframe::W1 => "W1",
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = BotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tf = match s.trim().to_ascii_uppercase().as_str() {
            "M1" => Timeframe::M1,
            "M2" => Timeframe::M2,
            "M3" => Timeframe::M3,
            "M4" => Timeframe::M4,
            "M5" => Timeframe::M5,
            "M6" => Timeframe::M6,
            "M10" => Timeframe::M10,
            "M12" => Timeframe::M12,
            "M15" => Timeframe::M15,
            "M20" => Timeframe::M20,
            "M30" => Timeframe::M30,
            "H1" => Timeframe::H1,
            "H2" => Timeframe::H2,
            "H3" => Timeframe::H3,
            "H4" => Timeframe::H4,
            "H6" => Timeframe::H6,
            "H8" => Timeframe::H8,
            "H12" => Timeframe::H12,
            "D1" => Timeframe::D1,
            "W1" => Timeframe::W1,
            other => {
                return Err(BotError::Configuration(format!(
                    "unsupported timeframe '{}'",
                    other
                )))
            }
        };
        Ok(tf)
    }
}

impl TryFrom<String> for Timeframe {
    type Error = BotError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Timeframe> for String {
    fn from(tf: Timeframe) -> Self {
        tf.as_str().to_string()
    }
}

/// Order direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// Pending order type sent to the broker
    pub fn pending_order_type(self) -> &'static str {
        match self {
            Direction::Long => "BUY_STOP",
            Direction::Short => "SELL_STOP",
        }
    }
}

/// Indicator settings for a binding. Unused fields are ignored by a strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndicatorConfig {
    pub fast_period: usize,
    pub slow_period: usize,
    pub atr_period: usize,
    pub atr_multiplier: f64,
    pub channel_period: usize,
}

impl Default for IndicatorConfig {
    fn default() -> Self {
        Self {
            fast_period: 10,
            slow_period: 30,
            atr_period: 14,
            atr_multiplier: 1.5,
            channel_period: 20,
        }
    }
}

/// Strategy parameters carried by a binding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyParams {
    pub indicators: IndicatorConfig,
    /// Fraction of account balance risked per trade
    pub risk_fraction: f64,
    /// Take-profit distance as a multiple of the stop distance
    pub profit_ratio: f64,
}

/// One strategy bound to one symbol/timeframe. Built from config, never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolStrategyBinding {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub strategy: String,
    pub params: StrategyParams,
}

impl fmt::Display for SymbolStrategyBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} strategy={} risk={} profit_ratio={} indicators={:?}",
            self.symbol,
            self.timeframe,
            self.strategy,
            self.params.risk_fraction,
            self.params.profit_ratio,
            self.params.indicators
        )
    }
}

/// Emitted by the timing tracker when a new bar has closed
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerEvent {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub bar_time: DateTime<Utc>,
}

/// Directional trade recommendation, sized and ready for submission
#[derive(Debug, Clone, PartialEq)]
pub struct SignalDecision {
    pub id: Uuid,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub direction: Direction,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub risk_fraction: f64,
    pub volume: f64,
    pub signal_time: DateTime<Utc>,
}

/// Instrument properties needed for sizing and rounding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentMetadata {
    pub tick_size: f64,
    pub tick_value: f64,
    pub volume_step: f64,
    pub bid: f64,
    pub ask: f64,
}

impl InstrumentMetadata {
    pub fn entry_price(&self, direction: Direction) -> f64 {
        match direction {
            Direction::Long => self.ask,
            Direction::Short => self.bid,
        }
    }
}

/// Pending order derived 1:1 from a signal
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub signal_id: Uuid,
    pub symbol: String,
    pub direction: Direction,
    pub volume: f64,
    pub price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    /// Original stop, used later as the trailing distance
    pub initial_stop_loss: f64,
}

impl From<&SignalDecision> for OrderRequest {
    fn from(signal: &SignalDecision) -> Self {
        Self {
            signal_id: signal.id,
            symbol: signal.symbol.clone(),
            direction: signal.direction,
            volume: signal.volume,
            price: signal.entry_price,
            stop_loss: signal.stop_loss,
            take_profit: signal.take_profit,
            initial_stop_loss: signal.stop_loss,
        }
    }
}

/// Raw gateway response to an order submission
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitResponse {
    pub status_code: u32,
    pub raw: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderOutcome {
    Success,
    Recoverable,
    Fatal,
}

/// Final result of executing one signal
#[derive(Debug, Clone, PartialEq)]
pub struct OrderResult {
    pub signal_id: Uuid,
    pub symbol: String,
    pub outcome: OrderOutcome,
    /// Last broker status code, absent when the call itself failed
    pub status_code: Option<u32>,
    pub attempts: u32,
    pub raw: String,
}

/// Open position as reported by the gateway
#[derive(Debug, Clone, PartialEq)]
pub struct OpenPosition {
    pub id: u64,
    pub symbol: String,
    pub direction: Direction,
    pub open_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub current_price: f64,
    pub profit: f64,
    pub volume: f64,
    pub initial_stop_loss: Option<f64>,
}
