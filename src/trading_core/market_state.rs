//! Market State Detection
//!
//! Determines if the market is Balanced (rotating inside value) or
//! Unbalanced (accepted outside the prior value area with order flow
//! pushing the same way).

use serde::{Deserialize, Serialize};

use super::bars::Bar;
use super::order_flow::FlowSnapshot;

/// Market state classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MarketState {
    /// Rotational market - price oscillating around fair value
    /// Use Mean Reversion trades (fade at POC/HVN)
    Balanced,
    /// Directional market - price pushing toward new fair value
    /// Use Trend Continuation trades (join through LVN)
    Unbalanced,
}

impl std::fmt::Display for MarketState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MarketState::Balanced => write!(f, "BALANCED"),
            MarketState::Unbalanced => write!(f, "UNBALANCED"),
        }
    }
}

/// Configuration for market state detection
#[derive(Debug, Clone)]
pub struct MarketStateConfig {
    /// Bars used for fair value and rotation count (default: 10)
    pub lookback_bars: usize,
    /// True ranges averaged for ATR (default: 14)
    pub atr_period: usize,
    /// Signed delta over the lookback needed for "sustained" flow (default: 500)
    pub sustained_delta: f64,
    /// Share of lookback bars that must agree with the flow (default: 0.6)
    pub min_directional_share: f64,
}

impl Default for MarketStateConfig {
    fn default() -> Self {
        Self {
            lookback_bars: 10,
            atr_period: 14,
            sustained_delta: 500.0,
            min_directional_share: 0.6,
        }
    }
}

/// Result of market state analysis for a specific bar
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketStateResult {
    /// The determined market state
    pub state: MarketState,
    /// Fair value (VWAP over the lookback)
    pub fair_value: f64,
    /// Average True Range
    pub atr: f64,
    /// Number of times price crossed fair value
    pub rotation_count: u32,
    /// Signed delta over the lookback
    pub cumulative_delta: f64,
    /// Order flow direction: 1 = buyers, -1 = sellers, 0 = neutral
    pub trend_direction: i8,
    /// Close vs prior value area: 1 = above VAH, -1 = below VAL, 0 = inside/unknown
    pub value_position: i8,
}

/// Calculate VWAP (Volume Weighted Average Price) for a window of bars
pub fn calculate_vwap(bars: &[Bar]) -> f64 {
    let (Some(first), Some(last)) = (bars.first(), bars.last()) else {
        return 0.0;
    };

    let mut sum_pv = 0.0;
    let mut sum_v = 0.0;

    for bar in bars {
        let typical_price = (bar.high + bar.low + bar.close) / 3.0;
        sum_pv += typical_price * bar.volume;
        sum_v += bar.volume;
    }

    if sum_v <= 0.0 {
        // Fallback to simple midpoint
        return (first.open + last.close) / 2.0;
    }

    sum_pv / sum_v
}

/// Average True Range over the last `period` true ranges
pub fn calculate_atr(bars: &[Bar], period: usize) -> f64 {
    if bars.len() < 2 {
        return bars.first().map(|b| b.range()).unwrap_or(0.0);
    }

    let start = bars.len().saturating_sub(period + 1);
    let window = &bars[start..];

    let mut sum_tr = 0.0;
    let mut prev_close = window[0].close;

    for bar in window.iter().skip(1) {
        let tr = (bar.high - bar.low)
            .max((bar.high - prev_close).abs())
            .max((bar.low - prev_close).abs());
        sum_tr += tr;
        prev_close = bar.close;
    }

    sum_tr / (window.len() - 1) as f64
}

/// Count how many times price crosses through a level
fn count_fair_value_crosses(bars: &[Bar], fair_value: f64) -> u32 {
    let Some(first) = bars.first() else {
        return 0;
    };

    let mut crosses = 0u32;
    let mut prev_above = first.close > fair_value;

    for bar in bars.iter().skip(1) {
        let curr_above = bar.close > fair_value;
        if curr_above != prev_above {
            crosses += 1;
        }
        prev_above = curr_above;
    }

    crosses
}

/// Classify the current bar. `bars` is the recent window ending at the
/// current bar; `flow` is the analyzer snapshot for that bar.
pub fn detect_market_state(
    bars: &[Bar],
    flow: &FlowSnapshot,
    config: &MarketStateConfig,
) -> MarketStateResult {
    let start = bars.len().saturating_sub(config.lookback_bars);
    let window = &bars[start..];

    let fair_value = calculate_vwap(window);
    let atr = calculate_atr(bars, config.atr_period);
    let rotation_count = count_fair_value_crosses(window, fair_value);

    let cumulative_delta = flow.window_delta;
    let trend_direction = if cumulative_delta >= config.sustained_delta
        && flow.buy_bar_share >= config.min_directional_share
    {
        1i8
    } else if cumulative_delta <= -config.sustained_delta
        && flow.sell_bar_share >= config.min_directional_share
    {
        -1i8
    } else {
        0i8
    };

    let value_position = match flow.prior_value_area {
        Some(va) if flow.close > va.vah => 1i8,
        Some(va) if flow.close < va.val => -1i8,
        _ => 0i8,
    };

    // UNBALANCED: price accepted outside prior value with flow behind it
    // BALANCED: everything else, including no prior value area yet
    let state = if value_position != 0 && value_position == trend_direction {
        MarketState::Unbalanced
    } else {
        MarketState::Balanced
    };

    MarketStateResult {
        state,
        fair_value,
        atr,
        rotation_count,
        cumulative_delta,
        trend_direction,
        value_position,
    }
}
