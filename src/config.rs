use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::env;
use std::fmt;
use std::fs::File;
use std::num::ParseFloatError;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_INSTRUMENT_A: &str = "PAXGUSDT-LINEAR.BYBIT";
const DEFAULT_INSTRUMENT_B: &str = "XAUTUSDT-LINEAR.BYBIT";
const DEFAULT_GRID_LEVELS: [f64; 8] = [0.001, 0.002, 0.003, 0.004, 0.005, 0.006, 0.008, 0.01];
const DEFAULT_BASE_NOTIONAL_PER_LEVEL: f64 = 100.0;
const DEFAULT_MAX_TOTAL_NOTIONAL: f64 = 1000.0;
const DEFAULT_EXTREME_SPREAD_STOP: f64 = 0.015;
const DEFAULT_ORDER_TIMEOUT_SECS: f64 = 5.0;
const DEFAULT_RECONCILIATION_INTERVAL_SECS: u64 = 60;
const DEFAULT_DRIFT_THRESHOLD: f64 = 100.0;
const DEFAULT_IMBALANCE_ALERT_RATIO: f64 = 0.20;
const DEFAULT_STARTUP_DELAY_SECS: f64 = 10.0;
const DEFAULT_MAKER_OFFSET_BPS: f64 = 2.0;
const DEFAULT_PAPER_FILL_PROBABILITY: f64 = 1.0;
const DEFAULT_PAPER_SIZE_STEP: f64 = 0.001;

#[derive(Debug)]
pub enum ConfigError {
    ParseFloatError(ParseFloatError),
    InvalidValue(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::ParseFloatError(e) => write!(f, "Parse float error: {}", e),
            ConfigError::InvalidValue(e) => write!(f, "Invalid value: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<ParseFloatError> for ConfigError {
    fn from(err: ParseFloatError) -> ConfigError {
        ConfigError::ParseFloatError(err)
    }
}

/// How startup sync turns detected notional into a count of occupied levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartupEstimate {
    /// `floor(detected / (2 * base))`, ignoring level weights.
    Unweighted,
    /// Walks levels ascending while their weighted notional fits in the detected amount.
    Weighted,
}

impl FromStr for StartupEstimate {
    type Err = ConfigError;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "unweighted" => Ok(StartupEstimate::Unweighted),
            "weighted" => Ok(StartupEstimate::Weighted),
            other => Err(ConfigError::InvalidValue(format!("startup_estimate '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloseOrderStyle {
    Aggressive,
    Passive,
}

impl FromStr for CloseOrderStyle {
    type Err = ConfigError;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "aggressive" => Ok(CloseOrderStyle::Aggressive),
            "passive" => Ok(CloseOrderStyle::Passive),
            other => Err(ConfigError::InvalidValue(format!("close_order_style '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LevelWeight {
    pub level: f64,
    pub weight: f64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
enum StringOrVec {
    String(String),
    Vec(Vec<f64>),
}

impl StringOrVec {
    fn into_levels(self) -> std::result::Result<Vec<f64>, ConfigError> {
        match self {
            StringOrVec::String(value) => parse_levels(&value),
            StringOrVec::Vec(values) => Ok(values),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
struct GridTradeYaml {
    instrument_a: Option<String>,
    instrument_b: Option<String>,
    grid_levels: Option<StringOrVec>,
    level_weights: Option<Vec<LevelWeight>>,
    base_notional_per_level: Option<f64>,
    max_total_notional: Option<f64>,
    extreme_spread_stop: Option<f64>,
    order_timeout_secs: Option<f64>,
    reconciliation_interval_secs: Option<u64>,
    drift_threshold: Option<f64>,
    imbalance_alert_ratio: Option<f64>,
    startup_delay_secs: Option<f64>,
    initial_notional_override: Option<f64>,
    startup_estimate: Option<StartupEstimate>,
    close_order_style: Option<CloseOrderStyle>,
    maker_offset_bps: Option<f64>,
    replay_file: Option<String>,
    paper_fill_probability: Option<f64>,
    paper_size_step: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct GridTradeConfig {
    pub instrument_a: String,
    pub instrument_b: String,
    /// Ascending spread fractions.
    pub grid_levels: Vec<f64>,
    pub level_weights: Vec<LevelWeight>,
    /// Per-leg notional of a weight-1.0 level.
    pub base_notional_per_level: f64,
    pub max_total_notional: f64,
    pub extreme_spread_stop: f64,
    pub order_timeout_secs: f64,
    pub reconciliation_interval_secs: u64,
    pub drift_threshold: f64,
    pub imbalance_alert_ratio: f64,
    pub startup_delay_secs: f64,
    /// Disabled when zero.
    pub initial_notional_override: f64,
    pub startup_estimate: StartupEstimate,
    pub close_order_style: CloseOrderStyle,
    pub maker_offset_bps: f64,
    pub replay_file: Option<String>,
    pub paper_fill_probability: f64,
    pub paper_size_step: f64,
}

impl Default for GridTradeConfig {
    fn default() -> Self {
        Self {
            instrument_a: DEFAULT_INSTRUMENT_A.to_string(),
            instrument_b: DEFAULT_INSTRUMENT_B.to_string(),
            grid_levels: DEFAULT_GRID_LEVELS.to_vec(),
            level_weights: Vec::new(),
            base_notional_per_level: DEFAULT_BASE_NOTIONAL_PER_LEVEL,
            max_total_notional: DEFAULT_MAX_TOTAL_NOTIONAL,
            extreme_spread_stop: DEFAULT_EXTREME_SPREAD_STOP,
            order_timeout_secs: DEFAULT_ORDER_TIMEOUT_SECS,
            reconciliation_interval_secs: DEFAULT_RECONCILIATION_INTERVAL_SECS,
            drift_threshold: DEFAULT_DRIFT_THRESHOLD,
            imbalance_alert_ratio: DEFAULT_IMBALANCE_ALERT_RATIO,
            startup_delay_secs: DEFAULT_STARTUP_DELAY_SECS,
            initial_notional_override: 0.0,
            startup_estimate: StartupEstimate::Unweighted,
            close_order_style: CloseOrderStyle::Aggressive,
            maker_offset_bps: DEFAULT_MAKER_OFFSET_BPS,
            replay_file: None,
            paper_fill_probability: DEFAULT_PAPER_FILL_PROBABILITY,
            paper_size_step: DEFAULT_PAPER_SIZE_STEP,
        }
    }
}

impl GridTradeConfig {
    pub fn from_env_or_yaml() -> Result<Self> {
        let config_path = env::var("GRIDTRADE_CONFIG_PATH")
            .ok()
            .filter(|value| !value.trim().is_empty());
        if let Some(path) = config_path {
            return Self::from_yaml_path(path);
        }
        Self::from_env()
    }

    pub fn from_yaml_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let file = File::open(path_ref)
            .with_context(|| format!("failed to open grid config {}", path_ref.display()))?;
        let yaml: GridTradeYaml = serde_yaml::from_reader(file)
            .with_context(|| format!("failed to parse grid config {}", path_ref.display()))?;

        let mut cfg = Self::from_yaml(yaml)?;
        cfg.apply_env_overrides()?;
        cfg.normalize_levels();
        Ok(cfg)
    }

    fn from_yaml(yaml: GridTradeYaml) -> Result<Self> {
        let defaults = Self::default();
        let grid_levels = match yaml.grid_levels {
            Some(levels) => levels.into_levels().context("invalid grid_levels")?,
            None => defaults.grid_levels,
        };
        Ok(GridTradeConfig {
            instrument_a: yaml.instrument_a.unwrap_or(defaults.instrument_a),
            instrument_b: yaml.instrument_b.unwrap_or(defaults.instrument_b),
            grid_levels,
            level_weights: yaml.level_weights.unwrap_or_default(),
            base_notional_per_level: yaml
                .base_notional_per_level
                .unwrap_or(DEFAULT_BASE_NOTIONAL_PER_LEVEL),
            max_total_notional: yaml.max_total_notional.unwrap_or(DEFAULT_MAX_TOTAL_NOTIONAL),
            extreme_spread_stop: yaml.extreme_spread_stop.unwrap_or(DEFAULT_EXTREME_SPREAD_STOP),
            order_timeout_secs: yaml.order_timeout_secs.unwrap_or(DEFAULT_ORDER_TIMEOUT_SECS),
            reconciliation_interval_secs: yaml
                .reconciliation_interval_secs
                .unwrap_or(DEFAULT_RECONCILIATION_INTERVAL_SECS),
            drift_threshold: yaml.drift_threshold.unwrap_or(DEFAULT_DRIFT_THRESHOLD),
            imbalance_alert_ratio: yaml
                .imbalance_alert_ratio
                .unwrap_or(DEFAULT_IMBALANCE_ALERT_RATIO),
            startup_delay_secs: yaml.startup_delay_secs.unwrap_or(DEFAULT_STARTUP_DELAY_SECS),
            initial_notional_override: yaml.initial_notional_override.unwrap_or(0.0),
            startup_estimate: yaml.startup_estimate.unwrap_or(StartupEstimate::Unweighted),
            close_order_style: yaml.close_order_style.unwrap_or(CloseOrderStyle::Aggressive),
            maker_offset_bps: yaml.maker_offset_bps.unwrap_or(DEFAULT_MAKER_OFFSET_BPS),
            replay_file: yaml.replay_file.filter(|v| !v.trim().is_empty()),
            paper_fill_probability: yaml
                .paper_fill_probability
                .unwrap_or(DEFAULT_PAPER_FILL_PROBABILITY),
            paper_size_step: yaml.paper_size_step.unwrap_or(DEFAULT_PAPER_SIZE_STEP),
        })
    }

    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();
        cfg.apply_env_overrides()?;
        cfg.normalize_levels();
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(value) = env_string("INSTRUMENT_A") {
            self.instrument_a = value;
        }
        if let Some(value) = env_string("INSTRUMENT_B") {
            self.instrument_b = value;
        }
        if let Some(value) = env_string("GRID_LEVELS") {
            self.grid_levels = parse_levels(&value).context("invalid GRID_LEVELS")?;
        }
        if let Some(value) = env_string("LEVEL_WEIGHTS") {
            self.level_weights = parse_level_weights(&value).context("invalid LEVEL_WEIGHTS")?;
        }
        override_from_env(&mut self.base_notional_per_level, "BASE_NOTIONAL_PER_LEVEL");
        override_from_env(&mut self.max_total_notional, "MAX_TOTAL_NOTIONAL");
        override_from_env(&mut self.extreme_spread_stop, "EXTREME_SPREAD_STOP");
        override_from_env(&mut self.order_timeout_secs, "ORDER_TIMEOUT_SECS");
        override_from_env(
            &mut self.reconciliation_interval_secs,
            "RECONCILIATION_INTERVAL_SECS",
        );
        override_from_env(&mut self.drift_threshold, "DRIFT_THRESHOLD");
        override_from_env(&mut self.imbalance_alert_ratio, "IMBALANCE_ALERT_RATIO");
        override_from_env(&mut self.startup_delay_secs, "STARTUP_DELAY_SECS");
        override_from_env(&mut self.initial_notional_override, "INITIAL_NOTIONAL_OVERRIDE");
        if let Some(value) = env_string("STARTUP_ESTIMATE") {
            self.startup_estimate = value
                .parse::<StartupEstimate>()
                .map_err(anyhow::Error::new)?;
        }
        if let Some(value) = env_string("CLOSE_ORDER_STYLE") {
            self.close_order_style = value
                .parse::<CloseOrderStyle>()
                .map_err(anyhow::Error::new)?;
        }
        override_from_env(&mut self.maker_offset_bps, "MAKER_OFFSET_BPS");
        if let Some(value) = env_string("REPLAY_FILE") {
            self.replay_file = Some(value);
        }
        override_from_env(&mut self.paper_fill_probability, "PAPER_FILL_PROBABILITY");
        override_from_env(&mut self.paper_size_step, "PAPER_SIZE_STEP");
        Ok(())
    }

    fn normalize_levels(&mut self) {
        self.grid_levels
            .sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        self.grid_levels.dedup();
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| anyhow::Error::new(ConfigError::InvalidValue(msg));

        if self.grid_levels.is_empty() {
            return Err(invalid("grid_levels must not be empty".to_string()));
        }
        if let Some(level) = self
            .grid_levels
            .iter()
            .find(|l| !l.is_finite() || **l <= 0.0)
        {
            return Err(invalid(format!("grid level {} must be finite and > 0", level)));
        }
        if self.grid_levels.windows(2).any(|w| w[0] >= w[1]) {
            return Err(invalid(format!(
                "grid_levels must be strictly ascending: {:?}",
                self.grid_levels
            )));
        }
        if let Some(w) = self
            .level_weights
            .iter()
            .find(|w| !w.weight.is_finite() || w.weight <= 0.0)
        {
            return Err(invalid(format!(
                "weight {} for level {} must be > 0",
                w.weight, w.level
            )));
        }
        for (name, value) in [
            ("base_notional_per_level", self.base_notional_per_level),
            ("max_total_notional", self.max_total_notional),
            ("order_timeout_secs", self.order_timeout_secs),
            ("extreme_spread_stop", self.extreme_spread_stop),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(invalid(format!("{} must be > 0 (got {})", name, value)));
            }
        }
        if !self.startup_delay_secs.is_finite() || self.startup_delay_secs < 0.0 {
            return Err(invalid(format!(
                "startup_delay_secs must be >= 0 (got {})",
                self.startup_delay_secs
            )));
        }
        if !(0.0..=1.0).contains(&self.paper_fill_probability) {
            return Err(invalid(format!(
                "paper_fill_probability must be within [0, 1] (got {})",
                self.paper_fill_probability
            )));
        }
        if self.instrument_a.trim().is_empty() || self.instrument_b.trim().is_empty() {
            return Err(invalid("both instruments must be set".to_string()));
        }
        if self.instrument_a == self.instrument_b {
            return Err(anyhow!(
                "instrument_a and instrument_b must differ (both {})",
                self.instrument_a
            ));
        }
        Ok(())
    }

    pub fn order_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.order_timeout_secs.max(0.0))
    }

    pub fn startup_delay(&self) -> Duration {
        Duration::from_secs_f64(self.startup_delay_secs.max(0.0))
    }

    pub fn reconciliation_interval(&self) -> Duration {
        Duration::from_secs(self.reconciliation_interval_secs)
    }
}

fn env_string(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn override_from_env<T: FromStr>(target: &mut T, key: &str) {
    if let Some(value) = env_string(key) {
        match value.trim().parse() {
            Ok(parsed) => *target = parsed,
            Err(_) => log::warn!("ignoring unparsable {}={}", key, value),
        }
    }
}

/// Comma-separated fractions, e.g. `0.001,0.002,0.003`.
pub fn parse_levels(value: &str) -> std::result::Result<Vec<f64>, ConfigError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| item.parse::<f64>().map_err(ConfigError::from))
        .collect()
}

/// Comma-separated `level:weight` pairs, e.g. `0.008:1.5,0.01:2`.
pub fn parse_level_weights(value: &str) -> std::result::Result<Vec<LevelWeight>, ConfigError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| -> std::result::Result<LevelWeight, ConfigError> {
            let (level, weight) = item
                .split_once(':')
                .ok_or_else(|| ConfigError::InvalidValue(format!("expected level:weight, got '{}'", item)))?;
            Ok(LevelWeight {
                level: level.trim().parse()?,
                weight: weight.trim().parse()?,
            })
        })
        .collect()
}
