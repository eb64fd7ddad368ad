//! Bot configuration
//!
//! Loaded from a TOML file with `FXBOT__` environment overrides, e.g.
//! `FXBOT__RISK__MAX_DAILY_LOSS_FRACTION=0.02`.

use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::error::{BotError, Result};
use crate::models::{IndicatorConfig, StrategyParams, SymbolStrategyBinding, Timeframe};
use crate::strategy;

#[derive(Debug, Clone, Deserialize)]
pub struct BotConfig {
    #[serde(default = "default_bot_name")]
    pub bot_name: String,
    #[serde(default)]
    pub strategy_name: String,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub error_handling: ErrorHandlingConfig,
    #[serde(default)]
    pub signal_management: SignalManagementConfig,
    #[serde(default)]
    pub trade_management: TradeManagementConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub tradable_symbols: Vec<BindingConfig>,
}

fn default_bot_name() -> String {
    "fxbot".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayKind {
    Bridge,
    Paper,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub kind: GatewayKind,
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
    pub requests_per_second: u32,
    pub paper_balance: f64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            kind: GatewayKind::Paper,
            base_url: "http://127.0.0.1:8228".to_string(),
            api_key: None,
            timeout_secs: 10,
            requests_per_second: 10,
            paper_balance: 10_000.0,
        }
    }
}

impl GatewayConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    pub max_trade_fraction: f64,
    pub max_stop_loss_fraction: f64,
    pub max_concurrent_trades: usize,
    pub max_daily_loss_fraction: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_trade_fraction: 0.02,
            max_stop_loss_fraction: 0.01,
            max_concurrent_trades: 5,
            max_daily_loss_fraction: 0.03,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ErrorHandlingConfig {
    pub max_retries: u32,
}

impl Default for ErrorHandlingConfig {
    fn default() -> Self {
        Self { max_retries: 3 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SignalManagementConfig {
    pub workers: usize,
    pub max_pending_per_symbol: usize,
    pub order_retries: u32,
    pub trade_processor: bool,
}

impl Default for SignalManagementConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_pending_per_symbol: 8,
            order_retries: 3,
            trade_processor: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TradeManagementConfig {
    pub interval_secs: u64,
    pub close_on_shutdown: bool,
}

impl Default for TradeManagementConfig {
    fn default() -> Self {
        Self {
            interval_secs: 5,
            close_on_shutdown: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub settle_secs: u64,
    pub trigger_on_first_bar: bool,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            settle_secs: 1,
            trigger_on_first_bar: true,
        }
    }
}

/// One `[[tradable_symbols]]` entry
#[derive(Debug, Clone, Deserialize)]
pub struct BindingConfig {
    pub symbol: String,
    pub granularity: Timeframe,
    #[serde(default = "default_strategy")]
    pub strategy: String,
    pub risk: f64,
    pub profit_ratio: f64,
    #[serde(default)]
    pub indicators: IndicatorConfig,
}

fn default_strategy() -> String {
    "ma_crossover".to_string()
}

impl BotConfig {
    /// Load from an optional TOML file plus environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            if !path.exists() {
                return Err(BotError::Configuration(format!(
                    "config file {} not found",
                    path.display()
                )));
            }
            builder = builder.add_source(File::from(path).format(FileFormat::Toml));
        }

        builder = builder.add_source(
            Environment::with_prefix("FXBOT")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder
            .build()
            .map_err(|e| BotError::Configuration(e.to_string()))?;

        let parsed: BotConfig = config
            .try_deserialize()
            .map_err(|e| BotError::Configuration(e.to_string()))?;
        parsed.validate()?;
        Ok(parsed)
    }

    /// Parse from TOML text (no environment overrides)
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let parsed: BotConfig = Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| BotError::Configuration(e.to_string()))?;
        parsed.validate()?;
        Ok(parsed)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tradable_symbols.is_empty() {
            return Err(BotError::Configuration(
                "at least one tradable symbol is required".into(),
            ));
        }

        for binding in &self.tradable_symbols {
            if !(binding.risk > 0.0 && binding.risk <= 1.0) {
                return Err(BotError::Configuration(format!(
                    "{} {}: risk must be a fraction in (0, 1], got {}",
                    binding.symbol, binding.granularity, binding.risk
                )));
            }
            if binding.profit_ratio <= 0.0 {
                return Err(BotError::Configuration(format!(
                    "{} {}: profit_ratio must be positive",
                    binding.symbol, binding.granularity
                )));
            }
            strategy::strategy_for(&binding.strategy)?;
        }

        let r = &self.risk;
        for (name, value) in [
            ("max_trade_fraction", r.max_trade_fraction),
            ("max_stop_loss_fraction", r.max_stop_loss_fraction),
            ("max_daily_loss_fraction", r.max_daily_loss_fraction),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(BotError::Configuration(format!(
                    "risk.{} must be in (0, 1], got {}",
                    name, value
                )));
            }
        }

        if self.signal_management.workers == 0 {
            return Err(BotError::Configuration(
                "signal_management.workers must be at least 1".into(),
            ));
        }
        if self.signal_management.max_pending_per_symbol == 0 {
            return Err(BotError::Configuration(
                "signal_management.max_pending_per_symbol must be at least 1".into(),
            ));
        }
        if self.trade_management.interval_secs == 0 {
            return Err(BotError::Configuration(
                "trade_management.interval_secs must be at least 1".into(),
            ));
        }

        Ok(())
    }

    /// Dispatch table: symbol -> its bindings, in config order
    pub fn bindings(&self) -> BTreeMap<String, Vec<SymbolStrategyBinding>> {
        let mut table: BTreeMap<String, Vec<SymbolStrategyBinding>> = BTreeMap::new();
        for b in &self.tradable_symbols {
            table
                .entry(b.symbol.clone())
                .or_default()
                .push(SymbolStrategyBinding {
                    symbol: b.symbol.clone(),
                    timeframe: b.granularity,
                    strategy: b.strategy.clone(),
                    params: StrategyParams {
                        indicators: b.indicators.clone(),
                        risk_fraction: b.risk,
                        profit_ratio: b.profit_ratio,
                    },
                });
        }
        table
    }

    /// Smallest configured timeframe, driving the timing loop cadence
    pub fn smallest_timeframe(&self) -> Option<Timeframe> {
        self.tradable_symbols
            .iter()
            .map(|b| b.granularity)
            .min_by_key(|tf| tf.minutes())
    }

    /// Multi-line settings summary for the main log
    pub fn summary(&self) -> String {
        let mut out = format!(
            "{} ({}) risk: max_trade={} max_daily_loss={} max_concurrent={}\n",
            self.bot_name,
            self.strategy_name,
            self.risk.max_trade_fraction,
            self.risk.max_daily_loss_fraction,
            self.risk.max_concurrent_trades
        );
        for (symbol, bindings) in self.bindings() {
            out.push_str(&format!("{}:\n", symbol));
            for binding in bindings {
                out.push_str(&format!("\t{}\n", binding));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
bot_name = "test-bot"
strategy_name = "trend"

[risk]
max_trade_fraction = 0.02
max_daily_loss_fraction = 0.05

[signal_management]
workers = 2

[[tradable_symbols]]
symbol = "EURUSD"
granularity = "M5"
risk = 0.01
profit_ratio = 2.0

[[tradable_symbols]]
symbol = "EURUSD"
granularity = "H1"
strategy = "breakout"
risk = 0.005
profit_ratio = 1.5

[tradable_symbols.indicators]
channel_period = 30

[[tradable_symbols]]
symbol = "XAUUSD"
granularity = "M15"
risk = 0.01
profit_ratio = 3.0
"#;

    #[test]
    fn test_parse_sample() {
        let config = BotConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.bot_name, "test-bot");
        assert_eq!(config.signal_management.workers, 2);
        assert_eq!(config.signal_management.order_retries, 3);
        assert_eq!(config.risk.max_concurrent_trades, 5);
        assert_eq!(config.tradable_symbols.len(), 3);
    }

    #[test]
    fn test_bindings_grouped_by_symbol() {
        let config = BotConfig::from_toml_str(SAMPLE).unwrap();
        let table = config.bindings();
        assert_eq!(table.len(), 2);

        let eurusd = &table["EURUSD"];
        assert_eq!(eurusd.len(), 2);
        assert_eq!(eurusd[0].timeframe, Timeframe::M5);
        assert_eq!(eurusd[0].strategy, "ma_crossover");
        assert_eq!(eurusd[1].strategy, "breakout");
        assert_eq!(eurusd[1].params.indicators.channel_period, 30);
        assert_eq!(eurusd[1].params.indicators.fast_period, 10);
    }

    #[test]
    fn test_smallest_timeframe() {
        let config = BotConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.smallest_timeframe(), Some(Timeframe::M5));
    }

    #[test]
    fn test_rejects_percentage_risk() {
        let toml = r#"
[[tradable_symbols]]
symbol = "EURUSD"
granularity = "M5"
risk = 1.5
profit_ratio = 2.0
"#;
        let err = BotConfig::from_toml_str(toml).unwrap_err();
        assert!(err.to_string().contains("risk must be a fraction"));
    }

    #[test]
    fn test_rejects_unknown_timeframe() {
        let toml = r#"
[[tradable_symbols]]
symbol = "EURUSD"
granularity = "MN1"
risk = 0.01
profit_ratio = 2.0
"#;
        assert!(BotConfig::from_toml_str(toml).is_err());
    }

    #[test]
    fn test_rejects_unknown_strategy() {
        let toml = r#"
[[tradable_symbols]]
symbol = "EURUSD"
granularity = "M5"
strategy = "grid"
risk = 0.01
profit_ratio = 2.0
"#;
        let err = BotConfig::from_toml_str(toml).unwrap_err();
        assert!(err.to_string().contains("unknown strategy"));
    }

    #[test]
    fn test_shipped_settings_file_loads() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("fxbot.toml");
        let config = BotConfig::load(Some(&path)).unwrap();

        assert_eq!(config.tradable_symbols.len(), 3);
        assert_eq!(config.bindings()["EURUSD"].len(), 2);
        assert_eq!(config.smallest_timeframe(), Some(Timeframe::M5));
        assert_eq!(config.gateway.kind, GatewayKind::Paper);
    }

    #[test]
    fn test_missing_file_is_configuration_error() {
        let err = BotConfig::load(Some(Path::new("/nonexistent/fxbot.toml"))).unwrap_err();
        assert!(matches!(err, BotError::Configuration(_)));
    }

    #[test]
    fn test_rejects_empty_symbols() {
        let err = BotConfig::from_toml_str("bot_name = \"x\"").unwrap_err();
        assert!(err.to_string().contains("at least one tradable symbol"));
    }
}
