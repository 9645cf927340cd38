//! Configuration management for FusionBot
//!
//! Loads from YAML files + environment variables via .env

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::estimator::EstimatorConfig;
use crate::execution::ExecutionConfig;
use crate::oracle::AggregatorConfig;
use crate::risk::{RiskLimits, SizerConfig};
use crate::strategy::FusionConfig;
use crate::types::Timeframe;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub bot: BotConfig,
    pub oracle: OracleConfig,
    pub exchange: ExchangeConfig,
    pub persistence: PersistenceConfig,
    pub logging: LoggingConfig,
    #[serde(default)]
    pub risk: RiskLimits,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub fusion: FusionConfig,
    #[serde(default)]
    pub estimator: EstimatorConfig,
    #[serde(default)]
    pub sizer: SizerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BotConfig {
    /// Version tag for logs
    pub tag: String,
    /// Spot symbols to trade (e.g. BTCUSDT)
    pub symbols: Vec<String>,
    /// Every candle timeframe to build; the smallest is the aggregation base
    pub timeframes: Vec<Timeframe>,
    /// Timeframe whose closed candles drive decisions
    pub primary_timeframe: Timeframe,
    /// Context timeframes fused alongside the primary one
    pub auxiliary_timeframes: Vec<Timeframe>,
    /// Primary candles required before the first evaluation
    pub min_history: usize,
    /// Minimum seconds between evaluations of the same symbol
    pub cooldown_secs: u64,
    pub status_interval_secs: u64,
    /// Primary candles used for swing structure and ATR
    pub swing_lookback: usize,
    pub atr_period: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OracleConfig {
    /// Binance combined-stream endpoint
    pub ws_url: String,
    /// Binance REST endpoint for klines
    pub rest_url: String,
    /// First reconnect delay in milliseconds
    pub reconnect_base_ms: u64,
    /// Reconnect delay cap in milliseconds
    pub reconnect_max_ms: u64,
    /// Finalized candles kept per timeframe
    pub buffer_capacity: usize,
    /// Candles handed to the strategy with every close
    pub listener_window: usize,
    /// Historical candles fetched per timeframe at startup (0 disables)
    pub bootstrap_limit: usize,
    pub tick_channel_size: usize,
    pub candle_channel_size: usize,
}

/// Live exchange credentials
#[derive(Clone, Deserialize)]
pub struct ExchangeConfig {
    pub rest_url: String,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    /// Asset whose balance is reported at startup
    pub quote_asset: String,
}

impl fmt::Debug for ExchangeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExchangeConfig")
            .field("rest_url", &self.rest_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("api_secret", &self.api_secret.as_ref().map(|_| "<redacted>"))
            .field("quote_asset", &self.quote_asset)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    /// Data directory
    pub data_dir: String,
    /// Engine snapshot file name inside `data_dir`
    pub state_file: String,
    /// Enable CSV logging of closed trades
    pub journal_enabled: bool,
    pub journal_file: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
    /// Filter used when RUST_LOG is unset
    pub level: String,
}

fn check_fraction(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 && value <= 1.0 {
        Ok(())
    } else {
        Err(ConfigError::invalid(field, format!("{value} not in (0, 1]")))
    }
}

fn check_unit(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::invalid(field, format!("{value} not in [0, 1]")))
    }
}

fn check_rate(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if (0.0..0.1).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::invalid(field, format!("{value} not in [0, 0.1)")))
    }
}

impl AppConfig {
    /// Load configuration from `config/default.yaml`, `config/local.yaml`
    /// and the environment
    pub fn load() -> Result<Self> {
        // Load .env file first
        dotenvy::dotenv().ok();
        Self::build(
            Config::builder()
                .add_source(File::with_name("config/default").required(false))
                .add_source(File::with_name("config/local").required(false)),
        )
    }

    /// Load from a specific file plus the environment
    pub fn load_from(path: &Path) -> Result<Self> {
        Self::build(Config::builder().add_source(File::from(path).required(true)))
    }

    /// Built-in defaults plus the environment, no files
    pub fn from_env() -> Result<Self> {
        Self::build(Config::builder())
    }

    fn build(
        files: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<Self> {
        let config = Self::defaults(files)?
            // Override with environment variables (FUSIONBOT_*)
            .add_source(Environment::with_prefix("FUSIONBOT").separator("__"))
            .build()
            .context("Failed to build configuration")?;

        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        app_config.validate()?;

        Ok(app_config)
    }

    fn defaults(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
        // Defaults sit below every other source regardless of call order
        Ok(builder
            .set_default("bot.tag", env!("CARGO_PKG_VERSION"))?
            .set_default("bot.symbols", vec!["BTCUSDT"])?
            .set_default("bot.timeframes", vec!["1m", "5m", "15m", "1h"])?
            .set_default("bot.primary_timeframe", "5m")?
            .set_default("bot.auxiliary_timeframes", vec!["15m", "1h"])?
            .set_default("bot.min_history", 30)?
            .set_default("bot.cooldown_secs", 900)?
            .set_default("bot.status_interval_secs", 60)?
            .set_default("bot.swing_lookback", 50)?
            .set_default("bot.atr_period", 14)?
            // Oracle defaults
            .set_default("oracle.ws_url", crate::oracle::sources::BINANCE_WS_URL)?
            .set_default("oracle.rest_url", crate::oracle::sources::BINANCE_REST_URL)?
            .set_default("oracle.reconnect_base_ms", 1000)?
            .set_default("oracle.reconnect_max_ms", 60_000)?
            .set_default("oracle.buffer_capacity", 1000)?
            .set_default("oracle.listener_window", 200)?
            .set_default("oracle.bootstrap_limit", 500)?
            .set_default("oracle.tick_channel_size", 10_000)?
            .set_default("oracle.candle_channel_size", 256)?
            // Exchange defaults
            .set_default("exchange.rest_url", crate::oracle::sources::BINANCE_REST_URL)?
            .set_default("exchange.quote_asset", "USDT")?
            // Persistence defaults
            .set_default("persistence.data_dir", "./data")?
            .set_default("persistence.state_file", "engine_state.json")?
            .set_default("persistence.journal_enabled", true)?
            .set_default("persistence.journal_file", "trades.csv")?
            // Logging defaults
            .set_default("logging.json", false)?
            .set_default("logging.level", "info")?)
    }

    /// Range-check every setting. The first violation is reported.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let bot = &self.bot;
        if bot.symbols.is_empty() || bot.symbols.iter().any(|s| s.trim().is_empty()) {
            return Err(ConfigError::invalid("bot.symbols", "at least one symbol required"));
        }
        let base = bot
            .timeframes
            .iter()
            .min()
            .copied()
            .ok_or_else(|| ConfigError::invalid("bot.timeframes", "no timeframes configured"))?;
        if let Some(tf) = bot.timeframes.iter().find(|tf| tf.secs() % base.secs() != 0) {
            return Err(ConfigError::invalid(
                "bot.timeframes",
                format!("{tf} is not a multiple of {base}"),
            ));
        }
        if !bot.timeframes.contains(&bot.primary_timeframe) {
            return Err(ConfigError::invalid(
                "bot.primary_timeframe",
                format!("{} is not in bot.timeframes", bot.primary_timeframe),
            ));
        }
        if let Some(tf) = bot
            .auxiliary_timeframes
            .iter()
            .find(|tf| !bot.timeframes.contains(tf))
        {
            return Err(ConfigError::invalid(
                "bot.auxiliary_timeframes",
                format!("{tf} is not in bot.timeframes"),
            ));
        }
        if bot.min_history == 0 {
            return Err(ConfigError::invalid("bot.min_history", "must be at least 1"));
        }
        if bot.status_interval_secs == 0 {
            return Err(ConfigError::invalid("bot.status_interval_secs", "must be positive"));
        }
        if bot.atr_period == 0 {
            return Err(ConfigError::invalid("bot.atr_period", "must be at least 1"));
        }

        let oracle = &self.oracle;
        if oracle.reconnect_base_ms == 0 || oracle.reconnect_max_ms < oracle.reconnect_base_ms {
            return Err(ConfigError::invalid(
                "oracle.reconnect_max_ms",
                "need 0 < reconnect_base_ms <= reconnect_max_ms",
            ));
        }
        if oracle.buffer_capacity < bot.min_history {
            return Err(ConfigError::invalid(
                "oracle.buffer_capacity",
                "must hold at least bot.min_history candles",
            ));
        }
        if oracle.tick_channel_size == 0 || oracle.candle_channel_size == 0 {
            return Err(ConfigError::invalid("oracle.tick_channel_size", "channels must be bounded above 0"));
        }

        let risk = &self.risk;
        if !(risk.initial_capital.is_finite() && risk.initial_capital > 0.0) {
            return Err(ConfigError::invalid("risk.initial_capital", "must be positive"));
        }
        check_fraction("risk.max_position_fraction", risk.max_position_fraction)?;
        check_fraction("risk.max_daily_loss_fraction", risk.max_daily_loss_fraction)?;
        check_fraction("risk.max_drawdown_fraction", risk.max_drawdown_fraction)?;
        if risk.max_concurrent_positions == 0 {
            return Err(ConfigError::invalid("risk.max_concurrent_positions", "must be at least 1"));
        }

        let exec = &self.execution;
        check_rate("execution.commission_rate", exec.commission_rate)?;
        check_rate("execution.slippage", exec.slippage)?;
        if exec.order_timeout_ms == 0 {
            return Err(ConfigError::invalid("execution.order_timeout_ms", "must be positive"));
        }
        if !exec.paper {
            let missing = |v: &Option<String>| v.as_deref().map_or(true, |s| s.trim().is_empty());
            if missing(&self.exchange.api_key) || missing(&self.exchange.api_secret) {
                return Err(ConfigError::invalid(
                    "exchange.api_key",
                    "live trading requires api_key and api_secret",
                ));
            }
        }

        let fusion = &self.fusion;
        check_unit("fusion.min_confidence", fusion.min_confidence)?;
        check_unit("fusion.min_coherence", fusion.min_coherence)?;
        check_unit("fusion.deadband", fusion.deadband)?;
        if fusion.saturation_count == 0 {
            return Err(ConfigError::invalid("fusion.saturation_count", "must be at least 1"));
        }
        check_fraction("fusion.base_position_fraction", fusion.base_position_fraction)?;
        if !(fusion.min_position_fraction <= fusion.base_position_fraction
            && fusion.base_position_fraction <= fusion.max_position_fraction)
        {
            return Err(ConfigError::invalid(
                "fusion.base_position_fraction",
                "need min <= base <= max",
            ));
        }
        if fusion.min_stop_fraction > fusion.max_stop_fraction {
            return Err(ConfigError::invalid("fusion.min_stop_fraction", "exceeds max_stop_fraction"));
        }

        let est = &self.estimator;
        if est.warmup < 2 {
            return Err(ConfigError::invalid("estimator.warmup", "must be at least 2"));
        }
        if !(est.process_noise > 0.0) || !(est.dt > 0.0) {
            return Err(ConfigError::invalid("estimator.process_noise", "process_noise and dt must be positive"));
        }
        if est.recent_window == 0 || est.recent_window > est.innovation_window {
            return Err(ConfigError::invalid(
                "estimator.recent_window",
                "need 0 < recent_window <= innovation_window",
            ));
        }

        let sizer = &self.sizer;
        if !(0.0 < sizer.min_stop_fraction && sizer.min_stop_fraction <= sizer.max_stop_fraction) {
            return Err(ConfigError::invalid("sizer.min_stop_fraction", "need 0 < min <= max"));
        }
        if !(0.0 < sizer.min_reward_risk && sizer.min_reward_risk <= sizer.max_reward_risk) {
            return Err(ConfigError::invalid("sizer.min_reward_risk", "need 0 < min <= max"));
        }

        Ok(())
    }

    pub fn aggregator_config(&self) -> AggregatorConfig {
        AggregatorConfig {
            timeframes: self.bot.timeframes.clone(),
            capacity: self.oracle.buffer_capacity,
            listener_window: self.oracle.listener_window,
        }
    }

    /// Primary timeframe followed by the auxiliaries, without duplicates
    pub fn signal_timeframes(&self) -> Vec<Timeframe> {
        let mut tfs = vec![self.bot.primary_timeframe];
        for tf in &self.bot.auxiliary_timeframes {
            if !tfs.contains(tf) {
                tfs.push(*tf);
            }
        }
        tfs
    }

    pub fn state_path(&self) -> PathBuf {
        Path::new(&self.persistence.data_dir).join(&self.persistence.state_file)
    }

    pub fn journal_path(&self) -> PathBuf {
        Path::new(&self.persistence.data_dir).join(&self.persistence.journal_file)
    }

    /// Generate a digest of the config (without secrets) for logging
    pub fn digest(&self) -> String {
        format!(
            "bot={} symbols={:?} primary={} aux={:?} mode={} capital={:.2} min_conf={:.2} min_coh={:.2}",
            self.bot.tag,
            self.bot.symbols,
            self.bot.primary_timeframe,
            self.bot
                .auxiliary_timeframes
                .iter()
                .map(|tf| tf.to_string())
                .collect::<Vec<_>>(),
            if self.execution.paper { "paper" } else { "live" },
            self.risk.initial_capital,
            self.fusion.min_confidence,
            self.fusion.min_coherence,
        )
    }
}

impl fmt::Display for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.digest())
    }
}
