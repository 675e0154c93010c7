//! Order-Flow Analyzer
//!
//! Maintains cumulative volume delta incrementally and rebuilds the volume
//! profile over a rolling bar window on every bar. Also flags big trades and
//! absorption (a big trade whose push the next bar fails to extend).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::debug;

use super::bars::{Aggressor, Bar};
use super::volume_profile::{ValueArea, VolumeProfile};
use crate::error::DataError;

#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    /// Bars kept for the volume profile
    pub window_size: usize,
    /// Profile level width
    pub tick_size: f64,
    /// Share of volume inside the value area
    pub value_area_fraction: f64,
    /// Bars in the rolling delta averages
    pub delta_lookback: usize,
    /// Dominant side volume for a big trade
    pub big_trade_threshold: f64,
    /// Margin the dominant side must win by
    pub big_trade_edge: f64,
    /// HVN/LVN cap
    pub max_nodes: usize,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            window_size: 30,
            tick_size: 0.25,
            value_area_fraction: 0.70,
            delta_lookback: 10,
            big_trade_threshold: 500.0,
            big_trade_edge: 100.0,
            max_nodes: 5,
        }
    }
}

/// Which side's aggression was absorbed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Absorption {
    /// Big buying that failed to lift price (bearish)
    BuyingAbsorbed,
    /// Big selling that failed to push price down (bullish)
    SellingAbsorbed,
}

/// Running CVD with a rolling delta window
#[derive(Debug, Clone, Default)]
pub struct CvdTracker {
    cvd: f64,
    lookback: usize,
    recent: VecDeque<f64>,
    sum: f64,
    abs_sum: f64,
}

impl CvdTracker {
    pub fn new(lookback: usize) -> Self {
        Self {
            lookback: lookback.max(1),
            ..Self::default()
        }
    }

    /// Add one bar's delta. O(1).
    pub fn push(&mut self, delta: f64) -> f64 {
        self.cvd += delta;
        self.recent.push_back(delta);
        self.sum += delta;
        self.abs_sum += delta.abs();
        if self.recent.len() > self.lookback {
            if let Some(old) = self.recent.pop_front() {
                self.sum -= old;
                self.abs_sum -= old.abs();
            }
        }
        self.cvd
    }

    /// Session boundary: CVD and the delta window start over
    pub fn reset(&mut self) {
        self.cvd = 0.0;
        self.recent.clear();
        self.sum = 0.0;
        self.abs_sum = 0.0;
    }

    pub fn cvd(&self) -> f64 {
        self.cvd
    }

    /// Signed delta summed over the lookback
    pub fn window_delta(&self) -> f64 {
        self.sum
    }

    pub fn rolling_avg_delta(&self) -> f64 {
        if self.recent.is_empty() {
            0.0
        } else {
            self.sum / self.recent.len() as f64
        }
    }

    pub fn rolling_avg_abs_delta(&self) -> f64 {
        if self.recent.is_empty() {
            0.0
        } else {
            self.abs_sum / self.recent.len() as f64
        }
    }

    /// Share of lookback bars whose delta has the given sign
    pub fn directional_share(&self, sign: f64) -> f64 {
        if self.recent.is_empty() {
            return 0.0;
        }
        let hits = self.recent.iter().filter(|d| **d * sign > 0.0).count();
        hits as f64 / self.recent.len() as f64
    }
}

/// Everything the signal rules need about the current bar
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowSnapshot {
    pub timestamp: DateTime<Utc>,
    pub close: f64,
    pub cvd: f64,
    /// This bar's delta
    pub cvd_delta: f64,
    pub rolling_avg_delta: f64,
    pub rolling_avg_abs_delta: f64,
    /// Signed delta over the lookback
    pub window_delta: f64,
    /// Share of lookback bars with positive delta
    pub buy_bar_share: f64,
    /// Share of lookback bars with negative delta
    pub sell_bar_share: f64,
    pub profile: VolumeProfile,
    pub poc: Option<f64>,
    pub vah: Option<f64>,
    pub val: Option<f64>,
    pub hvn: Vec<f64>,
    pub lvn: Vec<f64>,
    /// Value area of the window before this bar
    pub prior_value_area: Option<ValueArea>,
    pub big_trade: Option<Aggressor>,
    pub absorption: Option<Absorption>,
}

impl FlowSnapshot {
    pub fn big_trade_flag(&self) -> bool {
        self.big_trade.is_some()
    }

    pub fn absorption_flag(&self) -> bool {
        self.absorption.is_some()
    }
}

pub struct OrderFlowAnalyzer {
    config: AnalyzerConfig,
    window: VecDeque<Bar>,
    cvd: CvdTracker,
    last_big_trade: Option<Aggressor>,
}

impl OrderFlowAnalyzer {
    pub fn new(config: AnalyzerConfig) -> Self {
        let cvd = CvdTracker::new(config.delta_lookback);
        Self {
            window: VecDeque::with_capacity(config.window_size + 1),
            config,
            cvd,
            last_big_trade: None,
        }
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    /// Bars currently in the profile window, oldest first
    pub fn window(&self) -> &VecDeque<Bar> {
        &self.window
    }

    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.window.back().map(|b| b.timestamp)
    }

    pub fn cvd(&self) -> f64 {
        self.cvd.cvd()
    }

    /// Reject a bar without touching any state
    pub fn check(&self, bar: &Bar) -> Result<(), DataError> {
        bar.validate()?;
        if let Some(previous) = self.last_timestamp() {
            if bar.timestamp <= previous {
                return Err(DataError::NonMonotonic {
                    previous,
                    current: bar.timestamp,
                });
            }
        }
        Ok(())
    }

    /// New session: CVD restarts from zero. The profile window is kept.
    pub fn start_session(&mut self) {
        debug!("CVD reset at session boundary (was {:.0})", self.cvd.cvd());
        self.cvd.reset();
    }

    pub fn classify_big_trade(&self, bar: &Bar) -> Option<Aggressor> {
        let edge = self.config.big_trade_edge;
        let threshold = self.config.big_trade_threshold;
        if bar.buy_volume >= threshold && bar.buy_volume - bar.sell_volume >= edge {
            Some(Aggressor::Buy)
        } else if bar.sell_volume >= threshold && bar.sell_volume - bar.buy_volume >= edge {
            Some(Aggressor::Sell)
        } else {
            None
        }
    }

    /// Feed one bar and return the snapshot for it.
    pub fn on_bar(&mut self, bar: &Bar) -> Result<FlowSnapshot, DataError> {
        self.check(bar)?;

        let prior_value_area = if self.window.is_empty() {
            None
        } else {
            VolumeProfile::from_bars(&self.window, self.config.tick_size)
                .value_area(self.config.value_area_fraction)
        };

        let absorption = match (self.last_big_trade, self.window.back()) {
            (Some(Aggressor::Buy), Some(prev)) if bar.close <= prev.close => {
                Some(Absorption::BuyingAbsorbed)
            }
            (Some(Aggressor::Sell), Some(prev)) if bar.close >= prev.close => {
                Some(Absorption::SellingAbsorbed)
            }
            _ => None,
        };

        let big_trade = self.classify_big_trade(bar);
        let delta = bar.delta();
        let cvd = self.cvd.push(delta);

        self.window.push_back(bar.clone());
        while self.window.len() > self.config.window_size {
            self.window.pop_front();
        }
        self.last_big_trade = big_trade;

        let profile = VolumeProfile::from_bars(&self.window, self.config.tick_size);
        let value_area = profile.value_area(self.config.value_area_fraction);
        let (hvn, lvn) = profile.volume_nodes(self.config.max_nodes);

        if let Some(side) = big_trade {
            debug!(
                "Big {} bar @ {:.2} | buy {:.0} sell {:.0}",
                side, bar.close, bar.buy_volume, bar.sell_volume
            );
        }

        Ok(FlowSnapshot {
            timestamp: bar.timestamp,
            close: bar.close,
            cvd,
            cvd_delta: delta,
            rolling_avg_delta: self.cvd.rolling_avg_delta(),
            rolling_avg_abs_delta: self.cvd.rolling_avg_abs_delta(),
            window_delta: self.cvd.window_delta(),
            buy_bar_share: self.cvd.directional_share(1.0),
            sell_bar_share: self.cvd.directional_share(-1.0),
            poc: value_area.map(|va| va.poc),
            vah: value_area.map(|va| va.vah),
            val: value_area.map(|va| va.val),
            profile,
            hvn,
            lvn,
            prior_value_area,
            big_trade,
            absorption,
        })
    }
}
