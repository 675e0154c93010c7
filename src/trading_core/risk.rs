//! Risk Manager
//!
//! Gates candidate signals on the session clock and daily limits, and sizes
//! approved trades from a fixed fraction of the balance. All state lives in
//! [`RiskState`], which the caller owns and persists.

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::signal::Signal;

/// Trading window in exchange-local time
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub tz: Tz,
}

impl SessionWindow {
    fn minutes(t: NaiveTime) -> u32 {
        t.hour() * 60 + t.minute()
    }

    /// Start inclusive, end exclusive. A window with start after end wraps
    /// past midnight; equal bounds mean always open.
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        let local = now.with_timezone(&self.tz);
        let current = local.hour() * 60 + local.minute();
        let start = Self::minutes(self.start);
        let end = Self::minutes(self.end);

        if start == end {
            true
        } else if start < end {
            current >= start && current < end
        } else {
            current >= start || current < end
        }
    }

    /// Trading date a timestamp belongs to. For overnight windows the
    /// evening part counts toward the next day.
    pub fn session_date(&self, ts: DateTime<Utc>) -> NaiveDate {
        let local = ts.with_timezone(&self.tz);
        let date = local.date_naive();
        let start = Self::minutes(self.start);
        let end = Self::minutes(self.end);
        let current = local.hour() * 60 + local.minute();
        if start > end && current >= start {
            date + Duration::days(1)
        } else {
            date
        }
    }
}

const fn hm(hour: u32, min: u32) -> NaiveTime {
    match NaiveTime::from_hms_opt(hour, min, 0) {
        Some(t) => t,
        None => panic!("invalid session time"),
    }
}

/// Regular trading hours, exchange time (evaluated at compile time)
const RTH_OPEN: NaiveTime = hm(9, 30);
const RTH_CLOSE: NaiveTime = hm(16, 0);

#[derive(Debug, Clone)]
pub struct RiskConfig {
    /// Fraction of balance risked per trade
    pub risk_pct: f64,
    /// Session loss as a fraction of starting balance that halts trading
    pub max_daily_drawdown_pct: f64,
    pub max_consecutive_losses: u32,
    pub max_daily_trades: u32,
    pub session: SessionWindow,
    /// Currency per point per contract
    pub point_value: f64,
    pub max_contracts: u32,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            risk_pct: 0.01,
            max_daily_drawdown_pct: 0.03,
            max_consecutive_losses: 3,
            max_daily_trades: 20,
            session: SessionWindow {
                start: RTH_OPEN,
                end: RTH_CLOSE,
                tz: chrono_tz::America::New_York,
            },
            point_value: 20.0,
            max_contracts: 10,
        }
    }
}

/// Per-session risk counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RiskState {
    pub session_date: Option<NaiveDate>,
    /// Realized PnL this session
    pub session_pnl: f64,
    pub consecutive_losses: u32,
    /// Set once a daily limit is breached; cleared by the next session
    pub halted: bool,
    pub halt_reason: Option<String>,
    /// Trades opened this session
    pub trades_today: u32,
    pub session_start_balance: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskDecision {
    pub approved: bool,
    pub size: u32,
    pub reason: String,
}

impl RiskDecision {
    fn reject(reason: impl Into<String>) -> Self {
        Self {
            approved: false,
            size: 0,
            reason: reason.into(),
        }
    }
}

pub struct RiskManager {
    config: RiskConfig,
}

impl RiskManager {
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    pub fn session_date(&self, ts: DateTime<Utc>) -> NaiveDate {
        self.config.session.session_date(ts)
    }

    /// Start a fresh session if `date` differs from the stored one.
    pub fn roll_session(&self, state: &mut RiskState, date: NaiveDate, balance: f64) -> bool {
        if state.session_date == Some(date) {
            return false;
        }
        if state.halted {
            info!("New session {} - clearing halt ({:?})", date, state.halt_reason);
        }
        *state = RiskState {
            session_date: Some(date),
            session_start_balance: balance,
            ..RiskState::default()
        };
        true
    }

    fn starting_balance(state: &RiskState, balance: f64) -> f64 {
        if state.session_start_balance > 0.0 {
            state.session_start_balance
        } else {
            balance
        }
    }

    fn drawdown_breached(&self, state: &RiskState, balance: f64) -> bool {
        let limit = Self::starting_balance(state, balance) * self.config.max_daily_drawdown_pct;
        state.session_pnl < 0.0 && -state.session_pnl >= limit
    }

    /// Contracts for a trade risking `risk_pct` of `balance`
    pub fn position_size(&self, entry: f64, stop: f64, balance: f64) -> Result<u32, String> {
        let distance = (entry - stop).abs();
        if !distance.is_finite() || distance <= 0.0 {
            return Err(format!("invalid stop distance {:.2}", distance));
        }
        if !balance.is_finite() || balance <= 0.0 {
            return Err(format!("non-positive balance {:.2}", balance));
        }
        let risk_amount = balance * self.config.risk_pct;
        let per_contract = distance * self.config.point_value;
        let raw = (risk_amount / per_contract).floor();
        if raw < 1.0 {
            return Err(format!(
                "size zero: risk {:.2} < {:.2} per contract",
                risk_amount, per_contract
            ));
        }
        Ok((raw as u32).min(self.config.max_contracts))
    }

    pub fn evaluate(
        &self,
        signal: &Signal,
        state: &RiskState,
        now: DateTime<Utc>,
        balance: f64,
    ) -> RiskDecision {
        let c = &self.config;

        if !signal.is_actionable() {
            return RiskDecision::reject(format!("no signal: {}", signal.reason));
        }
        if state.consecutive_losses >= c.max_consecutive_losses {
            return RiskDecision::reject(format!(
                "consecutive loss halt ({} losses)",
                state.consecutive_losses
            ));
        }
        if self.drawdown_breached(state, balance) {
            return RiskDecision::reject(format!(
                "daily drawdown halt (session pnl {:.2})",
                state.session_pnl
            ));
        }
        if state.halted {
            let reason = state.halt_reason.as_deref().unwrap_or("trading halted");
            return RiskDecision::reject(reason.to_string());
        }
        if state.trades_today >= c.max_daily_trades {
            return RiskDecision::reject(format!(
                "daily trade cap reached ({}/{})",
                state.trades_today, c.max_daily_trades
            ));
        }
        if !c.session.contains(now) {
            return RiskDecision::reject(format!(
                "outside session window {}-{}",
                c.session.start.format("%H:%M"),
                c.session.end.format("%H:%M")
            ));
        }

        match self.position_size(signal.entry, signal.stop, balance) {
            Ok(size) => RiskDecision {
                approved: true,
                size,
                reason: format!("approved {} x{}", signal.side, size),
            },
            Err(reason) => RiskDecision::reject(reason),
        }
    }

    pub fn record_open(&self, state: &mut RiskState) {
        state.trades_today += 1;
    }

    /// Apply a closed trade's PnL and trip halts if a limit is hit.
    pub fn record_close(&self, state: &mut RiskState, pnl: f64, balance: f64) {
        state.session_pnl += pnl;
        if pnl < 0.0 {
            state.consecutive_losses += 1;
        } else {
            state.consecutive_losses = 0;
        }

        if state.halted {
            return;
        }
        if state.consecutive_losses >= self.config.max_consecutive_losses {
            warn!(
                "CONSECUTIVE LOSS HALT: {} losses in a row",
                state.consecutive_losses
            );
            state.halted = true;
            state.halt_reason = Some("consecutive loss halt".to_string());
        } else if self.drawdown_breached(state, balance) {
            warn!(
                "DAILY DRAWDOWN HALT: session pnl {:.2} (limit {:.1}%)",
                state.session_pnl,
                self.config.max_daily_drawdown_pct * 100.0
            );
            state.halted = true;
            state.halt_reason = Some("daily drawdown halt".to_string());
        }
    }
}
