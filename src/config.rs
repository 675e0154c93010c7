//! Engine configuration
//!
//! A flat key mapping loaded from JSON. Unknown keys are ignored and missing
//! keys fall back to the defaults below. A best-params snapshot written by the
//! sweep can be laid over the base mapping before validation.

use chrono::NaiveTime;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;
use tracing::{debug, info};

use crate::error::ConfigError;
use crate::trading_core::lifecycle::{IntrabarPriority, TradePolicy};
use crate::trading_core::market_state::MarketStateConfig;
use crate::trading_core::order_flow::AnalyzerConfig;
use crate::trading_core::risk::{RiskConfig, SessionWindow};
use crate::trading_core::signal::{SignalConfig, StopMode};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Instrument symbol passed to the bar source
    pub symbol: String,
    /// Bar interval passed to the bar source ("15s", "1m", ...)
    pub interval: String,

    // Signal thresholds
    /// Minimum score for a non-NONE signal
    pub min_signal_strength: f64,
    /// Minimum absolute per-bar delta
    pub min_delta: f64,
    /// Bar delta must exceed rolling |delta| by this factor for full delta credit
    pub min_delta_multiplier: f64,
    /// Dominant side volume needed to flag a big trade
    pub big_trade_threshold: f64,
    /// Dominant side must beat the other side by this much
    pub big_trade_edge: f64,
    /// TP1 distance as a multiple of stop distance
    pub rr_first: f64,
    /// TP2 distance as a multiple of stop distance
    pub rr_second: f64,
    /// ATR multiple for the stop distance
    pub atr_stop_multiplier: f64,
    /// How the stop is placed
    pub stop_mode: StopMode,
    /// Extra distance past the structural level in structure mode
    pub stop_buffer: f64,
    /// Floor on stop distance in ticks
    pub min_stop_ticks: u32,
    /// Max distance from a level that counts as "at" it
    pub level_tolerance: f64,
    /// Bars used to judge the approach direction for fades
    pub approach_bars: usize,

    // Entry filters
    /// Bars in the trend moving average; 0 disables the trend filter
    pub trend_ma_bars: usize,
    /// Closes in the volatility window; 0 disables the regime filter
    pub regime_window: usize,
    /// Regimes (0 low, 1 normal, 2 high volatility) that may trade; empty disables
    pub allowed_regimes: Vec<u8>,

    // Analyzer
    /// Bars in the rolling profile window
    #[serde(alias = "lookback")]
    pub window_size: usize,
    /// Share of window volume inside the value area
    #[serde(alias = "value_area_pct")]
    pub value_area_fraction: f64,
    /// Profile level width
    pub tick_size: f64,
    /// Bars in the rolling delta window
    pub delta_lookback: usize,
    /// Bars in the ATR average
    pub atr_period: usize,
    /// Max HVN/LVN nodes reported
    pub max_nodes: usize,

    // Risk
    /// Fraction of balance risked per trade
    pub risk_pct: f64,
    /// Session loss (fraction of starting balance) that halts trading
    pub max_daily_drawdown_pct: f64,
    /// Losing streak that halts trading
    pub max_consecutive_losses: u32,
    /// Trades opened per session
    pub max_daily_trades: u32,
    /// Session open, HH:MM exchange time
    pub session_start: String,
    /// Session close, HH:MM exchange time
    pub session_end: String,
    /// Exchange timezone for the session clock
    pub timezone: String,
    /// Currency per point per contract
    pub point_value: f64,
    /// Position size cap
    pub max_contracts: u32,
    /// Balance used when no persisted balance exists
    pub account_balance: f64,

    // Trade management
    /// Share of the position closed at TP1
    pub scale_out_pct: f64,
    /// Which touch wins when one bar spans stop and target
    pub intrabar_priority: IntrabarPriority,
    /// Close at bar close after this many bars (0 disables)
    pub max_hold_bars: u32,

    // Live loop
    /// Seconds between evaluation cycles
    pub poll_secs: u64,
    /// Seconds before a bar fetch is abandoned
    pub fetch_timeout_secs: u64,
    /// Bars requested per fetch
    pub fetch_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            symbol: "NQ=F".to_string(),
            interval: "1m".to_string(),
            min_signal_strength: 0.6,
            min_delta: 500.0,
            min_delta_multiplier: 1.3,
            big_trade_threshold: 500.0,
            big_trade_edge: 100.0,
            rr_first: 1.0,
            rr_second: 2.0,
            atr_stop_multiplier: 1.5,
            stop_mode: StopMode::Atr,
            stop_buffer: 0.5,      // 2 ticks
            min_stop_ticks: 4,
            level_tolerance: 2.5,  // 10 ticks
            approach_bars: 3,
            trend_ma_bars: 0,
            regime_window: 0,
            allowed_regimes: vec![0, 1],
            window_size: 30,
            value_area_fraction: 0.70,
            tick_size: 0.25,       // NQ
            delta_lookback: 10,
            atr_period: 14,
            max_nodes: 5,
            risk_pct: 0.01,
            max_daily_drawdown_pct: 0.03,
            max_consecutive_losses: 3,
            max_daily_trades: 20,
            session_start: "09:30".to_string(),
            session_end: "16:00".to_string(),
            timezone: "America/New_York".to_string(),
            point_value: 20.0,     // NQ: $20/point
            max_contracts: 10,
            account_balance: 100_000.0,
            scale_out_pct: 0.5,
            intrabar_priority: IntrabarPriority::StopFirst,
            max_hold_bars: 0,
            poll_secs: 15,
            fetch_timeout_secs: 10,
            fetch_limit: 200,
        }
    }
}

fn out_of_range(key: &'static str, value: impl ToString, expected: &'static str) -> ConfigError {
    ConfigError::OutOfRange {
        key,
        value: value.to_string(),
        expected,
    }
}

fn parse_hhmm(key: &'static str, value: &str) -> Result<NaiveTime, ConfigError> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M").map_err(|_| ConfigError::InvalidTime {
        key,
        value: value.to_string(),
    })
}

/// Pull the parameter mapping out of an overlay document.
///
/// Accepts either a best-params snapshot (`{"params": {...}, "metrics": {...}}`)
/// or a plain mapping.
fn overlay_params(overlay: Value) -> Map<String, Value> {
    match overlay {
        Value::Object(mut map) => match map.remove("params") {
            Some(Value::Object(params)) => params,
            Some(other) => {
                map.insert("params".to_string(), other);
                map
            }
            None => map,
        },
        _ => Map::new(),
    }
}

/// Old key names accepted for a field
const KEY_ALIASES: [(&str, &str); 2] = [
    ("lookback", "window_size"),
    ("value_area_pct", "value_area_fraction"),
];

/// Rewrite aliased keys to their field names so a base and an overlay that
/// name the same field differently merge into one entry.
fn canonical_keys(mut map: Map<String, Value>) -> Map<String, Value> {
    for (alias, field) in KEY_ALIASES {
        if let Some(value) = map.remove(alias) {
            map.insert(field.to_string(), value);
        }
    }
    map
}

impl EngineConfig {
    /// Parse a mapping, apply an optional overlay and validate.
    pub fn from_json_str(base: &str, overlay: Option<&str>) -> Result<Self, ConfigError> {
        let mut merged = match serde_json::from_str::<Value>(base)? {
            Value::Object(map) => canonical_keys(map),
            Value::Null => Map::new(),
            _ => {
                return Err(out_of_range("config", "non-object document", "a JSON object"));
            }
        };
        if let Some(overlay) = overlay {
            let params = canonical_keys(overlay_params(serde_json::from_str(overlay)?));
            debug!("Applying {} overlay params", params.len());
            merged.extend(params);
        }

        let config: Self = serde_json::from_value(Value::Object(merged))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from disk. A missing base path yields the defaults.
    pub fn load(path: Option<&Path>, overlay: Option<&Path>) -> Result<Self, ConfigError> {
        let read = |p: &Path| {
            std::fs::read_to_string(p).map_err(|source| ConfigError::Io {
                path: p.to_path_buf(),
                source,
            })
        };
        let base = match path {
            Some(p) => read(p)?,
            None => "{}".to_string(),
        };
        let overlay = overlay.map(read).transpose()?;
        let config = Self::from_json_str(&base, overlay.as_deref())?;
        info!(
            "Config loaded: {} {} | min_strength {:.2} | min_delta {:.0} | rr {:.2}/{:.2}",
            config.symbol,
            config.interval,
            config.min_signal_strength,
            config.min_delta,
            config.rr_first,
            config.rr_second
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let unit = |key: &'static str, v: f64| {
            if v.is_finite() && v > 0.0 && v <= 1.0 {
                Ok(())
            } else {
                Err(out_of_range(key, v, "0 < x <= 1"))
            }
        };
        let positive = |key: &'static str, v: f64| {
            if v.is_finite() && v > 0.0 {
                Ok(())
            } else {
                Err(out_of_range(key, v, "> 0"))
            }
        };
        let non_negative = |key: &'static str, v: f64| {
            if v.is_finite() && v >= 0.0 {
                Ok(())
            } else {
                Err(out_of_range(key, v, ">= 0"))
            }
        };

        if !(0.0..=1.0).contains(&self.min_signal_strength) {
            return Err(out_of_range("min_signal_strength", self.min_signal_strength, "0..=1"));
        }
        non_negative("min_delta", self.min_delta)?;
        positive("min_delta_multiplier", self.min_delta_multiplier)?;
        non_negative("big_trade_threshold", self.big_trade_threshold)?;
        non_negative("big_trade_edge", self.big_trade_edge)?;
        positive("rr_first", self.rr_first)?;
        positive("rr_second", self.rr_second)?;
        if self.rr_first >= self.rr_second {
            return Err(ConfigError::TargetOrder {
                rr_first: self.rr_first,
                rr_second: self.rr_second,
            });
        }
        positive("atr_stop_multiplier", self.atr_stop_multiplier)?;
        non_negative("stop_buffer", self.stop_buffer)?;
        non_negative("level_tolerance", self.level_tolerance)?;
        if self.approach_bars == 0 {
            return Err(out_of_range("approach_bars", 0, ">= 1"));
        }
        if self.regime_window > 0 && self.regime_window < 3 {
            return Err(out_of_range("regime_window", self.regime_window, "0 or >= 3"));
        }
        if let Some(bad) = self.allowed_regimes.iter().find(|r| **r > 2) {
            return Err(out_of_range("allowed_regimes", bad, "0, 1 or 2"));
        }

        if self.window_size < 2 {
            return Err(out_of_range("window_size", self.window_size, ">= 2"));
        }
        unit("value_area_fraction", self.value_area_fraction)?;
        positive("tick_size", self.tick_size)?;
        if self.delta_lookback == 0 {
            return Err(out_of_range("delta_lookback", 0, ">= 1"));
        }
        if self.atr_period == 0 {
            return Err(out_of_range("atr_period", 0, ">= 1"));
        }

        unit("risk_pct", self.risk_pct)?;
        unit("max_daily_drawdown_pct", self.max_daily_drawdown_pct)?;
        if self.max_consecutive_losses == 0 {
            return Err(out_of_range("max_consecutive_losses", 0, ">= 1"));
        }
        if self.max_daily_trades == 0 {
            return Err(out_of_range("max_daily_trades", 0, ">= 1"));
        }
        self.session_window()?;
        positive("point_value", self.point_value)?;
        if self.max_contracts == 0 {
            return Err(out_of_range("max_contracts", 0, ">= 1"));
        }
        positive("account_balance", self.account_balance)?;

        unit("scale_out_pct", self.scale_out_pct)?;
        if self.poll_secs == 0 {
            return Err(out_of_range("poll_secs", 0, ">= 1"));
        }
        if self.fetch_timeout_secs == 0 {
            return Err(out_of_range("fetch_timeout_secs", 0, ">= 1"));
        }
        if self.fetch_limit == 0 {
            return Err(out_of_range("fetch_limit", 0, ">= 1"));
        }
        Ok(())
    }

    pub fn tz(&self) -> Result<Tz, ConfigError> {
        self.timezone
            .parse::<Tz>()
            .map_err(|_| ConfigError::InvalidTimezone(self.timezone.clone()))
    }

    pub fn session_window(&self) -> Result<SessionWindow, ConfigError> {
        Ok(SessionWindow {
            start: parse_hhmm("session_start", &self.session_start)?,
            end: parse_hhmm("session_end", &self.session_end)?,
            tz: self.tz()?,
        })
    }

    pub fn analyzer_config(&self) -> AnalyzerConfig {
        AnalyzerConfig {
            window_size: self.window_size,
            tick_size: self.tick_size,
            value_area_fraction: self.value_area_fraction,
            delta_lookback: self.delta_lookback,
            big_trade_threshold: self.big_trade_threshold,
            big_trade_edge: self.big_trade_edge,
            max_nodes: self.max_nodes,
        }
    }

    pub fn market_state_config(&self) -> MarketStateConfig {
        MarketStateConfig {
            lookback_bars: self.delta_lookback,
            atr_period: self.atr_period,
            sustained_delta: self.min_delta,
            ..MarketStateConfig::default()
        }
    }

    pub fn signal_config(&self) -> SignalConfig {
        SignalConfig {
            min_signal_strength: self.min_signal_strength,
            min_delta: self.min_delta,
            min_delta_multiplier: self.min_delta_multiplier,
            rr_first: self.rr_first,
            rr_second: self.rr_second,
            atr_stop_multiplier: self.atr_stop_multiplier,
            stop_mode: self.stop_mode,
            stop_buffer: self.stop_buffer,
            min_stop_distance: self.min_stop_ticks as f64 * self.tick_size,
            level_tolerance: self.level_tolerance,
            approach_bars: self.approach_bars,
        }
    }

    pub fn risk_config(&self) -> Result<RiskConfig, ConfigError> {
        Ok(RiskConfig {
            risk_pct: self.risk_pct,
            max_daily_drawdown_pct: self.max_daily_drawdown_pct,
            max_consecutive_losses: self.max_consecutive_losses,
            max_daily_trades: self.max_daily_trades,
            session: self.session_window()?,
            point_value: self.point_value,
            max_contracts: self.max_contracts,
        })
    }

    pub fn trade_policy(&self) -> TradePolicy {
        TradePolicy {
            scale_out_pct: self.scale_out_pct,
            intrabar_priority: self.intrabar_priority,
            max_hold_bars: self.max_hold_bars,
            point_value: self.point_value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.session_window().unwrap().start, NaiveTime::from_hms_opt(9, 30, 0).unwrap());
    }

    #[test]
    fn test_missing_and_unknown_keys() {
        let config = EngineConfig::from_json_str(
            r#"{"min_delta": 300, "telegram_token": "abc", "lookback": 60}"#,
            None,
        )
        .unwrap();
        assert_eq!(config.min_delta, 300.0);
        assert_eq!(config.window_size, 60);
        assert_eq!(config.rr_first, 1.0);
        assert_eq!(config.max_consecutive_losses, 3);
    }

    #[test]
    fn test_negative_risk_pct_rejected() {
        let err = EngineConfig::from_json_str(r#"{"risk_pct": -0.01}"#, None).unwrap_err();
        assert!(matches!(err, ConfigError::OutOfRange { key: "risk_pct", .. }));
        assert!(err.to_string().contains("risk_pct"));
    }

    #[test]
    fn test_target_order_rejected() {
        let err = EngineConfig::from_json_str(r#"{"rr_first": 2.0, "rr_second": 1.5}"#, None)
            .unwrap_err();
        assert!(matches!(err, ConfigError::TargetOrder { .. }));
    }

    #[test]
    fn test_filter_knobs() {
        let config = EngineConfig::default();
        assert_eq!(config.trend_ma_bars, 0);
        assert_eq!(config.regime_window, 0);
        assert_eq!(config.allowed_regimes, vec![0, 1]);

        let config = EngineConfig::from_json_str(
            r#"{"trend_ma_bars": 50, "regime_window": 20, "allowed_regimes": [1, 2]}"#,
            None,
        )
        .unwrap();
        assert_eq!(config.trend_ma_bars, 50);
        assert_eq!(config.allowed_regimes, vec![1, 2]);

        let err = EngineConfig::from_json_str(r#"{"regime_window": 2}"#, None).unwrap_err();
        assert!(matches!(err, ConfigError::OutOfRange { key: "regime_window", .. }));
        let err = EngineConfig::from_json_str(r#"{"allowed_regimes": [0, 3]}"#, None).unwrap_err();
        assert!(matches!(err, ConfigError::OutOfRange { key: "allowed_regimes", .. }));
    }

    #[test]
    fn test_bad_session_time_rejected() {
        let err = EngineConfig::from_json_str(r#"{"session_start": "9h30"}"#, None).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidTime { key: "session_start", .. }));

        let err = EngineConfig::from_json_str(r#"{"timezone": "Mars/Olympus"}"#, None).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidTimezone(_)));
    }

    #[test]
    fn test_best_params_overlay() {
        let overlay = r#"{
            "metrics": {"win_rate": 61.0},
            "params": {"min_signal_strength": 0.75, "rr_second": 1.8, "big_trade_edge": 3}
        }"#;
        let config = EngineConfig::from_json_str(r#"{"min_signal_strength": 0.5}"#, Some(overlay))
            .unwrap();
        assert_eq!(config.min_signal_strength, 0.75);
        assert_eq!(config.rr_second, 1.8);
        assert_eq!(config.big_trade_edge, 3.0);
    }

    #[test]
    fn test_overlay_alias_replaces_field() {
        let config = EngineConfig::from_json_str(
            r#"{"window_size": 30, "value_area_fraction": 0.70}"#,
            Some(r#"{"params": {"lookback": 60, "value_area_pct": 0.8}}"#),
        )
        .unwrap();
        assert_eq!(config.window_size, 60);
        assert_eq!(config.value_area_fraction, 0.8);

        let config = EngineConfig::from_json_str(
            r#"{"lookback": 45}"#,
            Some(r#"{"window_size": 20}"#),
        )
        .unwrap();
        assert_eq!(config.window_size, 20);
    }

    #[test]
    fn test_plain_overlay_and_malformed_json() {
        let config = EngineConfig::from_json_str("{}", Some(r#"{"max_daily_trades": 5}"#)).unwrap();
        assert_eq!(config.max_daily_trades, 5);

        let err = EngineConfig::from_json_str("{not json", None).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_enum_keys() {
        let config = EngineConfig::from_json_str(
            r#"{"stop_mode": "structure", "intrabar_priority": "nearest_to_open"}"#,
            None,
        )
        .unwrap();
        assert_eq!(config.stop_mode, StopMode::Structure);
        assert_eq!(config.intrabar_priority, IntrabarPriority::NearestToOpen);
    }
}
