//! Signal Generator
//!
//! Turns an order-flow snapshot plus market state into a scored directional
//! signal. Balanced markets fade into POC/HVN when delta opposes the
//! approach; unbalanced markets join the move through a broken value edge or
//! an LVN. Every NONE carries the reason of the first filter that failed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::bars::{Aggressor, Bar};
use super::market_state::{MarketState, MarketStateResult};
use super::order_flow::{Absorption, FlowSnapshot};

const W_DELTA: f64 = 0.35;
const W_BIG_TRADE: f64 = 0.25;
const W_ABSORPTION: f64 = 0.15;
const W_STRUCTURE: f64 = 0.25;

/// Signal direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Long,
    Short,
    None,
}

impl Side {
    /// +1 long, -1 short, 0 none
    pub fn sign(&self) -> f64 {
        match self {
            Side::Long => 1.0,
            Side::Short => -1.0,
            Side::None => 0.0,
        }
    }

    /// Aggressor whose volume supports this side
    pub fn aggressor(&self) -> Option<Aggressor> {
        match self {
            Side::Long => Some(Aggressor::Buy),
            Side::Short => Some(Aggressor::Sell),
            Side::None => None,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Long => write!(f, "LONG"),
            Side::Short => write!(f, "SHORT"),
            Side::None => write!(f, "NONE"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SetupKind {
    /// Join an unbalanced move
    Continuation,
    /// Mean reversion inside balance
    Fade,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopMode {
    /// ATR distance times `atr_stop_multiplier`
    Atr,
    /// Beyond the level that triggered the setup
    Structure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub timestamp: DateTime<Utc>,
    pub side: Side,
    pub strength: f64,
    pub entry: f64,
    pub stop: f64,
    pub tp1: f64,
    pub tp2: f64,
    pub reason: String,
    pub market_state: MarketState,
    pub setup: Option<SetupKind>,
}

impl Signal {
    pub fn is_actionable(&self) -> bool {
        self.side != Side::None
    }

    /// Entry-to-stop distance
    pub fn risk_distance(&self) -> f64 {
        (self.entry - self.stop).abs()
    }

    /// This bar's signal downgraded to NONE by an entry filter
    pub fn filtered(&self, reason: String) -> Signal {
        Signal {
            side: Side::None,
            stop: self.entry,
            tp1: self.entry,
            tp2: self.entry,
            reason,
            setup: None,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone)]
pub struct SignalConfig {
    pub min_signal_strength: f64,
    pub min_delta: f64,
    pub min_delta_multiplier: f64,
    pub rr_first: f64,
    pub rr_second: f64,
    pub atr_stop_multiplier: f64,
    pub stop_mode: StopMode,
    pub stop_buffer: f64,
    pub min_stop_distance: f64,
    pub level_tolerance: f64,
    pub approach_bars: usize,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            min_signal_strength: 0.6,
            min_delta: 500.0,
            min_delta_multiplier: 1.3,
            rr_first: 1.0,
            rr_second: 2.0,
            atr_stop_multiplier: 1.5,
            stop_mode: StopMode::Atr,
            stop_buffer: 0.5,
            min_stop_distance: 1.0, // 4 ticks
            level_tolerance: 2.5,
            approach_bars: 3,
        }
    }
}

/// Structural level a setup keys off
#[derive(Debug, Clone, Copy)]
struct Trigger {
    price: f64,
    score: f64,
    label: &'static str,
}

pub struct SignalGenerator {
    config: SignalConfig,
}

impl SignalGenerator {
    pub fn new(config: SignalConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SignalConfig {
        &self.config
    }

    fn none(
        &self,
        flow: &FlowSnapshot,
        market: &MarketStateResult,
        strength: f64,
        reason: String,
    ) -> Signal {
        Signal {
            timestamp: flow.timestamp,
            side: Side::None,
            strength,
            entry: flow.close,
            stop: flow.close,
            tp1: flow.close,
            tp2: flow.close,
            reason,
            market_state: market.state,
            setup: None,
        }
    }

    /// Proximity score: 1.0 on the level, 0.5 at the tolerance edge
    fn proximity(&self, price: f64, level: f64) -> Option<f64> {
        let dist = (price - level).abs();
        let tol = self.config.level_tolerance;
        if dist > tol {
            None
        } else if tol <= 0.0 {
            Some(1.0)
        } else {
            Some(1.0 - 0.5 * dist / tol)
        }
    }

    fn continuation_trigger(&self, flow: &FlowSnapshot, side: Side) -> Option<Trigger> {
        let mut candidates = Vec::new();
        if let Some(va) = flow.prior_value_area {
            match side {
                Side::Long if flow.close > va.vah => candidates.push(Trigger {
                    price: va.vah,
                    score: 1.0,
                    label: "VAH breakout",
                }),
                Side::Short if flow.close < va.val => candidates.push(Trigger {
                    price: va.val,
                    score: 1.0,
                    label: "VAL breakdown",
                }),
                _ => {}
            }
        }
        for &lvn in &flow.lvn {
            if let Some(score) = self.proximity(flow.close, lvn) {
                candidates.push(Trigger {
                    price: lvn,
                    score,
                    label: "LVN",
                });
            }
        }
        best_trigger(candidates)
    }

    fn fade_trigger(&self, flow: &FlowSnapshot, side: Side) -> Option<Trigger> {
        let mut levels: Vec<(f64, &'static str)> = Vec::new();
        if let Some(poc) = flow.poc {
            levels.push((poc, "POC"));
        }
        match side {
            Side::Long => levels.extend(flow.val.map(|v| (v, "VAL"))),
            Side::Short => levels.extend(flow.vah.map(|v| (v, "VAH"))),
            Side::None => {}
        }
        levels.extend(flow.hvn.iter().map(|h| (*h, "HVN")));

        let candidates = levels
            .into_iter()
            .filter_map(|(price, label)| {
                self.proximity(flow.close, price)
                    .map(|score| Trigger { price, score, label })
            })
            .collect();
        best_trigger(candidates)
    }

    /// Score the current bar. `bars` is the recent window ending at it.
    pub fn generate(
        &self,
        flow: &FlowSnapshot,
        bars: &[Bar],
        market: &MarketStateResult,
    ) -> Signal {
        let c = &self.config;

        if bars.len() < 2 {
            return self.none(flow, market, 0.0, format!("insufficient data: {} bars", bars.len()));
        }

        let delta = flow.cvd_delta;
        if delta == 0.0 || delta.abs() < c.min_delta {
            return self.none(
                flow,
                market,
                0.0,
                format!("insufficient delta: |Δ| {:.0} < min_delta {:.0}", delta.abs(), c.min_delta),
            );
        }
        let side = if delta > 0.0 { Side::Long } else { Side::Short };
        let sign = side.sign();

        let (setup, trigger) = match market.state {
            MarketState::Unbalanced => {
                if f64::from(market.trend_direction) != sign {
                    return self.none(
                        flow,
                        market,
                        0.0,
                        format!("delta against unbalanced trend ({} flow)", side),
                    );
                }
                (SetupKind::Continuation, self.continuation_trigger(flow, side))
            }
            MarketState::Balanced => {
                let back = c.approach_bars.min(bars.len() - 1);
                let approach = flow.close - bars[bars.len() - 1 - back].close;
                if approach == 0.0 {
                    return self.none(flow, market, 0.0, "no approach move to fade".to_string());
                }
                if approach * sign > 0.0 {
                    return self.none(
                        flow,
                        market,
                        0.0,
                        format!("delta confirms approach, no fade ({} flow)", side),
                    );
                }
                (SetupKind::Fade, self.fade_trigger(flow, side))
            }
        };
        let Some(trigger) = trigger else {
            return self.none(flow, market, 0.0, "no structural level nearby".to_string());
        };

        let denom = flow.rolling_avg_abs_delta * c.min_delta_multiplier;
        let delta_score = if denom > 0.0 {
            (delta.abs() / denom).min(1.0)
        } else {
            1.0
        };
        let big_trade = flow.big_trade.is_some() && flow.big_trade == side.aggressor();
        let absorbed = matches!(
            (side, flow.absorption),
            (Side::Long, Some(Absorption::SellingAbsorbed))
                | (Side::Short, Some(Absorption::BuyingAbsorbed))
        );

        let mut strength = W_DELTA * delta_score + W_STRUCTURE * trigger.score;
        if big_trade {
            strength += W_BIG_TRADE;
        }
        if absorbed {
            strength += W_ABSORPTION;
        }
        let strength = strength.clamp(0.0, 1.0);

        if strength < c.min_signal_strength {
            return self.none(
                flow,
                market,
                strength,
                format!(
                    "strength {:.2} below min_signal_strength {:.2}",
                    strength, c.min_signal_strength
                ),
            );
        }

        let entry = flow.close;
        let atr_distance = market.atr * c.atr_stop_multiplier;
        let distance = match c.stop_mode {
            StopMode::Atr => atr_distance,
            StopMode::Structure => {
                let stop = trigger.price - sign * c.stop_buffer;
                let d = (entry - stop) * sign;
                if d > 0.0 {
                    d
                } else {
                    atr_distance
                }
            }
        }
        .max(c.min_stop_distance);

        if !(distance.is_finite() && distance > 0.0) {
            return self.none(flow, market, strength, "no valid stop distance".to_string());
        }

        let mut reason = format!(
            "{} {} {}: {} {:.2} | Δ {:+.0}",
            market.state,
            match setup {
                SetupKind::Continuation => "continuation",
                SetupKind::Fade => "fade",
            },
            side,
            trigger.label,
            trigger.price,
            delta
        );
        if big_trade {
            reason.push_str(" | big trade");
        }
        if absorbed {
            reason.push_str(" | absorption");
        }

        Signal {
            timestamp: flow.timestamp,
            side,
            strength,
            entry,
            stop: entry - sign * distance,
            tp1: entry + sign * distance * c.rr_first,
            tp2: entry + sign * distance * c.rr_second,
            reason,
            market_state: market.state,
            setup: Some(setup),
        }
    }
}

/// Highest score wins; earlier candidates win ties.
fn best_trigger(candidates: Vec<Trigger>) -> Option<Trigger> {
    candidates
        .into_iter()
        .fold(None, |best: Option<Trigger>, t| match best {
            Some(b) if b.score >= t.score => Some(b),
            _ => Some(t),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trading_core::market_state::{detect_market_state, MarketStateConfig};
    use crate::trading_core::order_flow::{AnalyzerConfig, OrderFlowAnalyzer};
    use chrono::{Duration, TimeZone};

    fn ts(i: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 4, 15, 0, 0).unwrap() + Duration::minutes(i)
    }

    /// Run bars through analyzer + market state, score the last one
    fn score(bars: &[Bar], config: SignalConfig) -> (Signal, MarketStateResult) {
        let mut analyzer = OrderFlowAnalyzer::new(AnalyzerConfig::default());
        let mut flow = None;
        for bar in bars {
            flow = Some(analyzer.on_bar(bar).unwrap());
        }
        let flow = flow.unwrap();
        let window: Vec<Bar> = analyzer.window().iter().cloned().collect();
        let market = detect_market_state(&window, &flow, &MarketStateConfig::default());
        let signal = SignalGenerator::new(config).generate(&flow, &window, &market);
        (signal, market)
    }

    fn uptrend(n: i64) -> Vec<Bar> {
        (0..n)
            .map(|i| {
                let o = 100.0 + i as f64;
                Bar::new(ts(i), o, o + 1.25, o - 0.25, o + 1.0, 800.0, 200.0)
            })
            .collect()
    }

    fn flat(n: i64) -> Vec<Bar> {
        (0..n)
            .map(|i| Bar::new(ts(i), 100.0, 100.25, 99.75, 100.0, 500.0, 500.0))
            .collect()
    }

    #[test]
    fn test_uptrend_gives_unbalanced_long() {
        let (signal, market) = score(&uptrend(50), SignalConfig::default());
        assert_eq!(market.state, MarketState::Unbalanced);
        assert_eq!(signal.side, Side::Long);
        assert_eq!(signal.market_state, MarketState::Unbalanced);
        assert_eq!(signal.setup, Some(SetupKind::Continuation));
        assert!(signal.strength >= 0.6, "strength {}", signal.strength);
        assert!(signal.strength <= 1.0);
        assert!(signal.reason.contains("VAH breakout"));
        assert!(signal.stop < signal.entry);
        assert!(signal.entry < signal.tp1 && signal.tp1 < signal.tp2);
    }

    #[test]
    fn test_flat_bars_insufficient_delta() {
        let (signal, _) = score(&flat(10), SignalConfig::default());
        assert_eq!(signal.side, Side::None);
        assert!(signal.reason.contains("insufficient delta"), "{}", signal.reason);
    }

    #[test]
    fn test_single_bar_insufficient_data() {
        let (signal, _) = score(&uptrend(1), SignalConfig::default());
        assert_eq!(signal.side, Side::None);
        assert!(signal.reason.starts_with("insufficient data"));
    }

    #[test]
    fn test_strength_filter() {
        let config = SignalConfig {
            min_signal_strength: 0.95,
            ..SignalConfig::default()
        };
        let (signal, _) = score(&uptrend(50), config);
        assert_eq!(signal.side, Side::None);
        assert!(signal.reason.contains("below min_signal_strength"));
        assert!(signal.strength > 0.0 && signal.strength < 0.95);
    }

    #[test]
    fn test_selling_into_uptrend_is_rejected() {
        let mut bars = uptrend(49);
        let o = 149.0;
        bars.push(Bar::new(ts(49), o, o + 1.25, o - 0.25, o + 1.0, 100.0, 800.0));
        let (signal, market) = score(&bars, SignalConfig::default());
        // flow still net long over the lookback, close above prior value
        assert_eq!(market.state, MarketState::Unbalanced);
        assert_eq!(signal.side, Side::None);
        assert!(signal.reason.contains("against unbalanced trend"));
    }

    #[test]
    fn test_balanced_fade_at_poc() {
        // Rotation around 100 builds value there
        let mut bars: Vec<Bar> = (0..30)
            .map(|i| {
                let c = if i % 2 == 0 { 99.75 } else { 100.25 };
                Bar::new(ts(i), 100.0, 100.5, 99.5, c, 300.0, 300.0)
            })
            .collect();
        // Sell-off back into value ...
        bars.push(Bar::new(ts(30), 100.25, 100.25, 99.25, 99.5, 200.0, 400.0));
        bars.push(Bar::new(ts(31), 99.5, 99.5, 98.75, 99.0, 200.0, 400.0));
        // ... met by heavy buying near the POC
        bars.push(Bar::new(ts(32), 99.0, 99.75, 98.75, 99.5, 1400.0, 300.0));

        let (signal, market) = score(&bars, SignalConfig::default());
        assert_eq!(market.state, MarketState::Balanced);
        assert_eq!(signal.side, Side::Long, "{}", signal.reason);
        assert_eq!(signal.setup, Some(SetupKind::Fade));
        assert!(signal.reason.starts_with("BALANCED fade LONG"));
        assert!(signal.strength >= 0.6);
    }

    #[test]
    fn test_structure_stop_sits_beyond_level() {
        let config = SignalConfig {
            stop_mode: StopMode::Structure,
            ..SignalConfig::default()
        };
        let (signal, _) = score(&uptrend(50), config);
        assert_eq!(signal.side, Side::Long);
        assert!(signal.stop < signal.entry);
        let (atr_signal, _) = score(&uptrend(50), SignalConfig::default());
        // VAH sits well below the close, so the structural stop is wider
        assert!(signal.risk_distance() > atr_signal.risk_distance());
    }

    #[test]
    fn test_targets_scale_with_risk() {
        let (signal, market) = score(&uptrend(50), SignalConfig::default());
        let risk = market.atr * 1.5;
        assert!((signal.risk_distance() - risk).abs() < 1e-9);
        assert!((signal.tp1 - (signal.entry + risk)).abs() < 1e-9);
        assert!((signal.tp2 - (signal.entry + 2.0 * risk)).abs() < 1e-9);
    }

    #[test]
    fn test_deterministic() {
        let (a, _) = score(&uptrend(50), SignalConfig::default());
        let (b, _) = score(&uptrend(50), SignalConfig::default());
        assert_eq!(a, b);
    }

    #[test]
    fn test_strength_bounds_across_inputs() {
        let mut bars = uptrend(20);
        for i in 20..60 {
            let o = 120.0 + ((i * 7) % 11) as f64 * 0.5 - 2.5;
            let buy = 200.0 + ((i * 13) % 17) as f64 * 60.0;
            let sell = 200.0 + ((i * 5) % 19) as f64 * 55.0;
            bars.push(Bar::new(ts(i), o, o + 1.0, o - 1.0, o + 0.5, buy, sell));
        }
        let config = SignalConfig::default();
        let mut analyzer = OrderFlowAnalyzer::new(AnalyzerConfig::default());
        let generator = SignalGenerator::new(config.clone());
        for bar in &bars {
            let flow = analyzer.on_bar(bar).unwrap();
            let window: Vec<Bar> = analyzer.window().iter().cloned().collect();
            let market = detect_market_state(&window, &flow, &MarketStateConfig::default());
            let signal = generator.generate(&flow, &window, &market);
            assert!((0.0..=1.0).contains(&signal.strength));
            if signal.is_actionable() {
                assert!(signal.strength >= config.min_signal_strength);
                let s = signal.side.sign();
                assert!((signal.tp1 - signal.entry) * s > 0.0);
                assert!((signal.tp2 - signal.tp1) * s > 0.0);
            } else {
                assert!(!signal.reason.is_empty());
            }
        }
    }
}
