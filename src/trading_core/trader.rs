//! Core Trading Logic
//!
//! Broker-agnostic evaluation cycle used by both:
//! - Backtest replay (bars from a file or generator)
//! - Live polling (bars from a provider)
//!
//! One bar goes through analyzer -> market state -> signal -> entry filters
//! -> risk -> trade tracker. All mutable state lives in the caller's
//! `PersistedState`, which is replaced in a single assignment once the bar is
//! fully processed.

use tracing::{debug, info};

use super::bars::Bar;
use super::filters::{RegimeDetector, TrendMaFilter};
use super::lifecycle::{OpenTrade, TradeEvent, TradePolicy};
use super::market_state::{detect_market_state, MarketStateConfig, MarketStateResult};
use super::order_flow::OrderFlowAnalyzer;
use super::risk::{RiskDecision, RiskManager};
use super::signal::{Signal, SignalGenerator};
use super::state_store::{CycleSummary, PersistedState};
use crate::config::EngineConfig;
use crate::error::{ConfigError, DataError};

/// What happened while processing one bar
#[derive(Debug, Clone)]
pub struct CycleOutcome {
    pub signal: Signal,
    /// None when a trade was already active at the start of the cycle
    pub decision: Option<RiskDecision>,
    pub events: Vec<TradeEvent>,
    pub market: MarketStateResult,
}

impl CycleOutcome {
    /// Approved and opened a trade this bar
    pub fn opened(&self) -> bool {
        self.events.iter().any(|e| matches!(e, TradeEvent::Opened { .. }))
    }
}

pub struct Engine {
    analyzer: OrderFlowAnalyzer,
    market_config: MarketStateConfig,
    signals: SignalGenerator,
    risk: RiskManager,
    policy: TradePolicy,
    trend: Option<TrendMaFilter>,
    regime: Option<RegimeDetector>,
}

impl Engine {
    pub fn new(config: &EngineConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            analyzer: OrderFlowAnalyzer::new(config.analyzer_config()),
            market_config: config.market_state_config(),
            signals: SignalGenerator::new(config.signal_config()),
            risk: RiskManager::new(config.risk_config()?),
            policy: config.trade_policy(),
            trend: (config.trend_ma_bars > 0).then(|| TrendMaFilter::new(config.trend_ma_bars)),
            regime: (config.regime_window > 0 && !config.allowed_regimes.is_empty())
                .then(|| RegimeDetector::new(config.regime_window, config.allowed_regimes.clone())),
        })
    }

    pub fn analyzer(&self) -> &OrderFlowAnalyzer {
        &self.analyzer
    }

    pub fn risk_manager(&self) -> &RiskManager {
        &self.risk
    }

    pub fn policy(&self) -> &TradePolicy {
        &self.policy
    }

    /// Feed history to the analyzer without evaluating signals. Invalid or
    /// out-of-order bars are skipped; returns how many were accepted.
    pub fn warm_up(&mut self, bars: &[Bar]) -> usize {
        let mut accepted = 0;
        for bar in bars {
            match self.analyzer.on_bar(bar) {
                Ok(_) => {
                    self.observe_close(bar.close);
                    accepted += 1;
                }
                Err(e) => debug!("Warm-up skipped bar: {}", e),
            }
        }
        debug!("Warmed up analyzer with {} bars", accepted);
        accepted
    }

    fn observe_close(&mut self, close: f64) {
        if let Some(trend) = self.trend.as_mut() {
            trend.on_close(close);
        }
        if let Some(regime) = self.regime.as_mut() {
            regime.on_close(close);
        }
    }

    /// Downgrade an actionable signal that trades against the trend MA or
    /// in a disallowed volatility regime. `regime_block` is judged on the
    /// closes before this bar.
    fn apply_filters(&self, signal: Signal, close: f64, regime_block: Option<String>) -> Signal {
        if !signal.is_actionable() {
            return signal;
        }
        let block = self
            .trend
            .as_ref()
            .and_then(|t| t.check(signal.side, close))
            .or(regime_block);
        match block {
            Some(reason) => {
                debug!("FILTERED: {} signal | {}", signal.side, reason);
                signal.filtered(reason)
            }
            None => signal,
        }
    }

    /// Process one completed bar against `state`.
    ///
    /// On a data error nothing is touched, neither `state` nor the analyzer.
    pub fn process_bar(
        &mut self,
        bar: &Bar,
        state: &mut PersistedState,
    ) -> Result<CycleOutcome, DataError> {
        self.analyzer.check(bar)?;

        let mut working = state.clone();

        // Session boundary
        let session_date = self.risk.session_date(bar.timestamp);
        if self.risk.roll_session(&mut working.risk, session_date, working.balance) {
            info!("SESSION: {} | balance {:.2}", session_date, working.balance);
            self.analyzer.start_session();
        }

        let flow = self.analyzer.on_bar(bar)?;
        let regime_block = self.regime.as_ref().and_then(|r| r.check());
        self.observe_close(bar.close);

        // Manage the open trade first; a close this bar blocks a new entry
        // until the next one.
        let mut events = Vec::new();
        let was_active = working.open_trade.as_ref().is_some_and(|t| t.is_active());
        if let Some(trade) = working.open_trade.as_mut() {
            events = trade.on_bar(bar, &self.policy);
            let still_active = trade.is_active();
            for event in &events {
                if let TradeEvent::Closed(closed) = event {
                    working.balance += closed.pnl;
                    self.risk.record_close(&mut working.risk, closed.pnl, working.balance);
                }
            }
            if !still_active {
                working.open_trade = None;
            }
        }

        let window: Vec<Bar> = self.analyzer.window().iter().cloned().collect();
        let market = detect_market_state(&window, &flow, &self.market_config);
        let signal = self.signals.generate(&flow, &window, &market);
        let signal = self.apply_filters(signal, bar.close, regime_block);
        if signal.is_actionable() {
            debug!(
                "SIGNAL: {} {:.2} @ {:.2} | {}",
                signal.side, signal.strength, signal.entry, signal.reason
            );
        }

        let decision = if was_active {
            if signal.is_actionable() {
                debug!("Ignoring {} signal: trade already open", signal.side);
            }
            None
        } else {
            let decision =
                self.risk
                    .evaluate(&signal, &working.risk, bar.timestamp, working.balance);
            if decision.approved {
                if let Some(mut trade) = OpenTrade::pending(&signal, decision.size) {
                    trade.activate();
                    self.risk.record_open(&mut working.risk);
                    events.push(TradeEvent::Opened {
                        trade: trade.clone(),
                    });
                    working.open_trade = Some(trade);
                }
            } else if signal.is_actionable() {
                info!("REJECTED: {} signal | {}", signal.side, decision.reason);
            }
            Some(decision)
        };

        working.last_bar_ts = Some(bar.timestamp);
        working.last_cycle = Some(CycleSummary {
            bar_ts: bar.timestamp,
            bars: window.len(),
            market_state: market.state,
            side: signal.side,
            strength: signal.strength,
            signal_reason: signal.reason.clone(),
            risk_reason: decision
                .as_ref()
                .map(|d| d.reason.clone())
                .unwrap_or_else(|| "trade already open".to_string()),
        });
        *state = working;

        Ok(CycleOutcome {
            signal,
            decision,
            events,
            market,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trading_core::lifecycle::{ExitReason, TradeStatus};
    use crate::trading_core::signal::Side;
    use crate::trading_core::state_store;
    use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
    use uuid::Uuid;

    /// 10:00 New York (EST)
    fn ts(i: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 4, 15, 0, 0).unwrap() + Duration::minutes(i)
    }

    fn uptrend(n: i64) -> Vec<Bar> {
        (0..n)
            .map(|i| {
                let o = 100.0 + i as f64;
                Bar::new(ts(i), o, o + 1.25, o - 0.25, o + 1.0, 800.0, 200.0)
            })
            .collect()
    }

    /// A long opened well above the bar so it gaps through the stop
    fn losing_long(bar: &Bar, n: u8) -> OpenTrade {
        let entry = bar.high + 10.0;
        OpenTrade {
            id: Uuid::new_v5(&Uuid::NAMESPACE_OID, &[n]),
            side: Side::Long,
            size: 1,
            entry,
            stop: entry - 5.0,
            initial_stop: entry - 5.0,
            tp1: entry + 5.0,
            tp2: entry + 10.0,
            status: TradeStatus::Open,
            partial_size: 0,
            partial_realized: 0.0,
            opened_at: bar.timestamp - Duration::minutes(1),
            bars_held: 0,
        }
    }

    #[test]
    fn test_uptrend_opens_long() {
        let mut engine = Engine::new(&EngineConfig::default()).unwrap();
        let mut state = PersistedState::new(100_000.0);

        let mut opened = Vec::new();
        for bar in uptrend(50) {
            let outcome = engine.process_bar(&bar, &mut state).unwrap();
            for event in outcome.events {
                if let TradeEvent::Opened { trade } = event {
                    opened.push(trade);
                }
            }
        }

        assert!(!opened.is_empty());
        assert!(opened.iter().all(|t| t.side == Side::Long));
        assert!(state.risk.trades_today >= 1);
        assert_eq!(state.last_bar_ts, Some(ts(49)));
        assert_eq!(state.risk.session_date, NaiveDate::from_ymd_opt(2025, 3, 4));
    }

    #[test]
    fn test_three_losses_halt_fourth_signal() {
        let mut engine = Engine::new(&EngineConfig::default()).unwrap();
        let bars = uptrend(53);
        assert_eq!(engine.warm_up(&bars[..49]), 49);

        let mut state = PersistedState::new(100_000.0);
        state.risk.session_date = NaiveDate::from_ymd_opt(2025, 3, 4);
        state.risk.session_start_balance = 100_000.0;

        for (k, bar) in bars[49..52].iter().enumerate() {
            state.open_trade = Some(losing_long(bar, k as u8));
            let outcome = engine.process_bar(bar, &mut state).unwrap();

            let closed = outcome
                .events
                .iter()
                .find_map(|e| match e {
                    TradeEvent::Closed(c) => Some(c),
                    _ => None,
                })
                .unwrap();
            assert_eq!(closed.reason, ExitReason::Stop);
            assert!(closed.pnl < 0.0);
            // the cycle that closed a trade does not evaluate a new one
            assert!(outcome.decision.is_none());
            assert!(state.open_trade.is_none());
            assert_eq!(state.risk.consecutive_losses, k as u32 + 1);
        }
        assert!(state.risk.halted);
        assert!(state.balance < 100_000.0);

        let outcome = engine.process_bar(&bars[52], &mut state).unwrap();
        assert_eq!(outcome.signal.side, Side::Long);
        let decision = outcome.decision.as_ref().unwrap();
        assert!(!decision.approved);
        assert!(decision.reason.contains("consecutive loss halt"), "{}", decision.reason);
        assert!(state.open_trade.is_none());
        assert!(!outcome.opened());
    }

    #[test]
    fn test_invalid_bar_leaves_state_untouched() {
        let mut engine = Engine::new(&EngineConfig::default()).unwrap();
        let mut state = PersistedState::new(100_000.0);
        let bars = uptrend(3);
        engine.process_bar(&bars[0], &mut state).unwrap();
        let before = state.clone();

        let bad = Bar::new(ts(1), 100.0, 99.0, 101.0, 100.0, 10.0, 10.0);
        assert!(matches!(
            engine.process_bar(&bad, &mut state),
            Err(DataError::InvalidBar { .. })
        ));
        // replaying an old bar is rejected too
        assert!(matches!(
            engine.process_bar(&bars[0], &mut state),
            Err(DataError::NonMonotonic { .. })
        ));
        assert_eq!(state, before);
        assert_eq!(engine.analyzer().window().len(), 1);

        engine.process_bar(&bars[1], &mut state).unwrap();
        assert_eq!(state.last_bar_ts, Some(ts(1)));
    }

    #[test]
    fn test_none_cycle_reason_is_kept() {
        let mut engine = Engine::new(&EngineConfig::default()).unwrap();
        let mut state = PersistedState::new(100_000.0);
        for i in 0..5 {
            let bar = Bar::new(ts(i), 100.0, 100.5, 99.5, 100.0, 300.0, 300.0);
            engine.process_bar(&bar, &mut state).unwrap();
        }

        let cycle = state.last_cycle.clone().unwrap();
        assert_eq!(cycle.bar_ts, ts(4));
        assert_eq!(cycle.bars, 5);
        assert_eq!(cycle.side, Side::None);
        assert!(cycle.signal_reason.contains("insufficient delta"), "{}", cycle.signal_reason);
        assert!(cycle.risk_reason.starts_with("no signal: insufficient delta"), "{}", cycle.risk_reason);

        let status = state_store::format_status(&state);
        assert!(status.contains("insufficient delta"), "{}", status);
    }

    /// Closes far above the uptrend, fed as history only
    fn high_history() -> Vec<Bar> {
        (0..50)
            .map(|i| Bar::new(ts(i - 100), 300.0, 300.25, 299.75, 300.0, 100.0, 100.0))
            .collect()
    }

    #[test]
    fn test_trend_ma_filters_long_below_average() {
        let mut plain = Engine::new(&EngineConfig::default()).unwrap();
        let mut filtered = Engine::new(&EngineConfig {
            trend_ma_bars: 100,
            ..EngineConfig::default()
        })
        .unwrap();
        plain.warm_up(&high_history());
        filtered.warm_up(&high_history());

        let mut plain_state = PersistedState::new(100_000.0);
        let mut state = PersistedState::new(100_000.0);
        let mut blocked = 0;
        for bar in uptrend(60) {
            let expected = plain.process_bar(&bar, &mut plain_state).unwrap();
            let outcome = filtered.process_bar(&bar, &mut state).unwrap();
            if expected.signal.is_actionable() {
                blocked += 1;
                assert_eq!(outcome.signal.side, Side::None);
                assert!(outcome.signal.reason.starts_with("against trend MA"), "{}", outcome.signal.reason);
                assert_eq!(outcome.signal.strength, expected.signal.strength);
            }
            assert!(!outcome.opened());
        }
        assert!(blocked > 0);
        assert_eq!(state.risk.trades_today, 0);
    }

    #[test]
    fn test_regime_filter_blocks_disallowed_regime() {
        let mut plain = Engine::new(&EngineConfig::default()).unwrap();
        let mut filtered = Engine::new(&EngineConfig {
            regime_window: 5,
            allowed_regimes: vec![2],
            ..EngineConfig::default()
        })
        .unwrap();

        let mut plain_state = PersistedState::new(100_000.0);
        let mut state = PersistedState::new(100_000.0);
        let mut blocked = 0;
        for bar in uptrend(60) {
            let expected = plain.process_bar(&bar, &mut plain_state).unwrap();
            let outcome = filtered.process_bar(&bar, &mut state).unwrap();
            if expected.signal.is_actionable() {
                blocked += 1;
                let reason = &outcome.signal.reason;
                assert!(reason.starts_with("regime ") && reason.ends_with(" not allowed"), "{}", reason);
                assert_eq!(outcome.signal.setup, None);
            }
        }
        // steady drift never reaches the high-volatility band
        assert!(blocked > 0);
        assert!(state.open_trade.is_none());
        assert_eq!(state.last_cycle.unwrap().side, Side::None);
    }

    #[test]
    fn test_session_roll_clears_halt() {
        let mut engine = Engine::new(&EngineConfig::default()).unwrap();
        let mut state = PersistedState::new(100_000.0);
        state.risk.session_date = NaiveDate::from_ymd_opt(2025, 3, 3);
        state.risk.halted = true;
        state.risk.consecutive_losses = 3;

        let bar = Bar::new(ts(0), 100.0, 101.0, 99.5, 100.5, 300.0, 200.0);
        engine.process_bar(&bar, &mut state).unwrap();

        assert!(!state.risk.halted);
        assert_eq!(state.risk.consecutive_losses, 0);
        assert_eq!(state.risk.session_date, NaiveDate::from_ymd_opt(2025, 3, 4));
        assert_eq!(state.risk.session_start_balance, 100_000.0);
    }
}
