//! Trade Lifecycle Tracker
//!
//! State machine for the single open trade:
//! PENDING -> OPEN -> TP1_HIT -> CLOSED, or OPEN/TP1_HIT -> CLOSED on the stop.
//! TP1 scales out part of the position and moves the stop to entry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use super::bars::Bar;
use super::signal::{Side, Signal};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeStatus {
    Pending,
    Open,
    Tp1Hit,
    Closed,
}

impl std::fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TradeStatus::Pending => write!(f, "PENDING"),
            TradeStatus::Open => write!(f, "OPEN"),
            TradeStatus::Tp1Hit => write!(f, "TP1_HIT"),
            TradeStatus::Closed => write!(f, "CLOSED"),
        }
    }
}

/// Which touch counts first when one bar spans both stop and target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntrabarPriority {
    /// Assume the adverse outcome
    StopFirst,
    /// Whichever level is closer to the bar's open; stop on a tie
    NearestToOpen,
    /// Assume the favorable outcome
    TargetFirst,
}

impl IntrabarPriority {
    pub fn stop_first(&self, bar: &Bar, stop: f64, target: f64) -> bool {
        match self {
            IntrabarPriority::StopFirst => true,
            IntrabarPriority::TargetFirst => false,
            IntrabarPriority::NearestToOpen => {
                (bar.open - stop).abs() <= (bar.open - target).abs()
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitReason {
    Stop,
    Breakeven,
    Target,
    Timeout,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitReason::Stop => write!(f, "STOP"),
            ExitReason::Breakeven => write!(f, "BREAKEVEN"),
            ExitReason::Target => write!(f, "TARGET"),
            ExitReason::Timeout => write!(f, "TIMEOUT"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TradePolicy {
    /// Share of the position closed at TP1
    pub scale_out_pct: f64,
    pub intrabar_priority: IntrabarPriority,
    /// 0 disables the timeout
    pub max_hold_bars: u32,
    /// Currency per point per contract
    pub point_value: f64,
}

impl Default for TradePolicy {
    fn default() -> Self {
        Self {
            scale_out_pct: 0.5,
            intrabar_priority: IntrabarPriority::StopFirst,
            max_hold_bars: 0,
            point_value: 20.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub id: Uuid,
    pub side: Side,
    pub size: u32,
    pub entry: f64,
    pub exit_price: f64,
    /// Total realized PnL including any TP1 partial
    pub pnl: f64,
    pub reason: ExitReason,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    pub bars_held: u32,
}

/// Notification-worthy transitions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TradeEvent {
    Opened {
        trade: OpenTrade,
    },
    Tp1Hit {
        id: Uuid,
        timestamp: DateTime<Utc>,
        price: f64,
        new_stop: f64,
        partial_size: u32,
        partial_pnl: f64,
    },
    Closed(ClosedTrade),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenTrade {
    pub id: Uuid,
    pub side: Side,
    pub size: u32,
    pub entry: f64,
    /// Current stop, moved to entry at TP1
    pub stop: f64,
    pub initial_stop: f64,
    pub tp1: f64,
    pub tp2: f64,
    pub status: TradeStatus,
    /// Contracts closed at TP1
    pub partial_size: u32,
    /// PnL realized by the TP1 partial
    pub partial_realized: f64,
    pub opened_at: DateTime<Utc>,
    pub bars_held: u32,
}

impl OpenTrade {
    /// New PENDING trade for an approved signal. None for a NONE signal or
    /// a zero size.
    pub fn pending(signal: &Signal, size: u32) -> Option<Self> {
        if !signal.is_actionable() || size == 0 {
            return None;
        }
        let key = format!(
            "{}:{}:{}",
            signal.timestamp.timestamp_millis(),
            signal.side,
            signal.entry
        );
        Some(Self {
            id: Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes()),
            side: signal.side,
            size,
            entry: signal.entry,
            stop: signal.stop,
            initial_stop: signal.stop,
            tp1: signal.tp1,
            tp2: signal.tp2,
            status: TradeStatus::Pending,
            partial_size: 0,
            partial_realized: 0.0,
            opened_at: signal.timestamp,
            bars_held: 0,
        })
    }

    /// PENDING -> OPEN once the entry is filled
    pub fn activate(&mut self) -> bool {
        if self.status != TradeStatus::Pending {
            return false;
        }
        self.status = TradeStatus::Open;
        info!(
            "ENTRY: {} x{} @ {:.2} | Stop: {:.2} | TP1: {:.2} | TP2: {:.2}",
            self.side, self.size, self.entry, self.stop, self.tp1, self.tp2
        );
        true
    }

    pub fn is_active(&self) -> bool {
        matches!(self.status, TradeStatus::Open | TradeStatus::Tp1Hit)
    }

    /// Contracts still on
    pub fn remaining(&self) -> u32 {
        self.size - self.partial_size
    }

    fn pnl(&self, exit: f64, qty: u32, point_value: f64) -> f64 {
        (exit - self.entry) * self.side.sign() * qty as f64 * point_value
    }

    /// Unrealized PnL of the remaining size at `price`
    pub fn open_pnl(&self, price: f64, point_value: f64) -> f64 {
        self.pnl(price, self.remaining(), point_value)
    }

    fn stop_touched(&self, bar: &Bar) -> bool {
        match self.side {
            Side::Long => bar.low <= self.stop,
            Side::Short => bar.high >= self.stop,
            Side::None => false,
        }
    }

    fn reached(&self, bar: &Bar, level: f64) -> bool {
        match self.side {
            Side::Long => bar.high >= level,
            Side::Short => bar.low <= level,
            Side::None => false,
        }
    }

    /// Stop fill: the stop price, or the open if the bar gapped through it
    fn stop_fill(&self, bar: &Bar) -> f64 {
        match self.side {
            Side::Long if bar.open < self.stop => bar.open,
            Side::Short if bar.open > self.stop => bar.open,
            _ => self.stop,
        }
    }

    fn close(
        &mut self,
        at: DateTime<Utc>,
        exit_price: f64,
        reason: ExitReason,
        point_value: f64,
    ) -> TradeEvent {
        let pnl = self.partial_realized + self.pnl(exit_price, self.remaining(), point_value);
        self.status = TradeStatus::Closed;
        info!(
            "EXIT ({}): {} @ {:.2} | Entry: {:.2} | PnL: {:.2}",
            reason, self.side, exit_price, self.entry, pnl
        );
        TradeEvent::Closed(ClosedTrade {
            id: self.id,
            side: self.side,
            size: self.size,
            entry: self.entry,
            exit_price,
            pnl,
            reason,
            opened_at: self.opened_at,
            closed_at: at,
            bars_held: self.bars_held,
        })
    }

    fn take_first_target(&mut self, at: DateTime<Utc>, policy: &TradePolicy) -> TradeEvent {
        let partial = if self.size >= 2 {
            ((self.size as f64 * policy.scale_out_pct).floor() as u32).max(1)
        } else {
            0
        };
        if partial >= self.size {
            return self.close(at, self.tp1, ExitReason::Target, policy.point_value);
        }

        let partial_pnl = self.pnl(self.tp1, partial, policy.point_value);
        self.partial_size = partial;
        self.partial_realized = partial_pnl;
        self.stop = self.entry;
        self.status = TradeStatus::Tp1Hit;
        info!(
            "TP1: {} @ {:.2} | closed x{} ({:.2}) | Stop -> {:.2}",
            self.side, self.tp1, partial, partial_pnl, self.stop
        );
        TradeEvent::Tp1Hit {
            id: self.id,
            timestamp: at,
            price: self.tp1,
            new_stop: self.stop,
            partial_size: partial,
            partial_pnl,
        }
    }

    /// Advance the trade with one completed bar.
    ///
    /// TP2 may fill in the same bar as TP1; the breakeven stop only applies
    /// from the following bar.
    pub fn on_bar(&mut self, bar: &Bar, policy: &TradePolicy) -> Vec<TradeEvent> {
        let mut events = Vec::new();
        if !self.is_active() {
            return events;
        }
        self.bars_held += 1;
        let pv = policy.point_value;
        let priority = policy.intrabar_priority;

        match self.status {
            TradeStatus::Open => {
                let stop_hit = self.stop_touched(bar);
                let tp1_hit = self.reached(bar, self.tp1);
                if stop_hit && (!tp1_hit || priority.stop_first(bar, self.stop, self.tp1)) {
                    let fill = self.stop_fill(bar);
                    events.push(self.close(bar.timestamp, fill, ExitReason::Stop, pv));
                    return events;
                }
                if tp1_hit {
                    events.push(self.take_first_target(bar.timestamp, policy));
                    if self.status == TradeStatus::Closed {
                        return events;
                    }
                    if self.reached(bar, self.tp2) {
                        events.push(self.close(bar.timestamp, self.tp2, ExitReason::Target, pv));
                        return events;
                    }
                }
            }
            TradeStatus::Tp1Hit => {
                let stop_hit = self.stop_touched(bar);
                let tp2_hit = self.reached(bar, self.tp2);
                if stop_hit && (!tp2_hit || priority.stop_first(bar, self.stop, self.tp2)) {
                    let fill = self.stop_fill(bar);
                    events.push(self.close(bar.timestamp, fill, ExitReason::Breakeven, pv));
                    return events;
                }
                if tp2_hit {
                    events.push(self.close(bar.timestamp, self.tp2, ExitReason::Target, pv));
                    return events;
                }
            }
            TradeStatus::Pending | TradeStatus::Closed => {}
        }

        if policy.max_hold_bars > 0 && self.bars_held >= policy.max_hold_bars {
            events.push(self.close(bar.timestamp, bar.close, ExitReason::Timeout, pv));
        }
        events
    }
}
