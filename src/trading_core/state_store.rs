//! Persisted engine state
//!
//! The open trade and the session's risk counters survive restarts as one
//! flat JSON record. Writes go to a temp file first and are renamed into
//! place. An unreadable file falls back to an empty state with a warning.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::lifecycle::{OpenTrade, TradeStatus};
use super::market_state::MarketState;
use super::risk::RiskState;
use super::signal::Side;

/// Everything that must outlive one evaluation cycle
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PersistedState {
    pub open_trade: Option<OpenTrade>,
    pub risk: RiskState,
    /// Account balance after realized PnL
    pub balance: f64,
    /// Last bar fully processed
    pub last_bar_ts: Option<DateTime<Utc>>,
    /// What the last evaluation decided, NONE cycles included
    pub last_cycle: Option<CycleSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleSummary {
    pub bar_ts: DateTime<Utc>,
    /// Bars in the analyzer window
    pub bars: usize,
    pub market_state: MarketState,
    pub side: Side,
    pub strength: f64,
    pub signal_reason: String,
    pub risk_reason: String,
}

impl PersistedState {
    pub fn new(balance: f64) -> Self {
        Self {
            balance,
            ..Self::default()
        }
    }
}

/// On-disk shape. Trade fields are null when no trade is open.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct StateRecord {
    side: Option<Side>,
    entry: Option<f64>,
    stop: Option<f64>,
    tp1: Option<f64>,
    tp2: Option<f64>,
    status: Option<TradeStatus>,
    #[serde(default)]
    partial_realized: f64,
    #[serde(default)]
    session_pnl: f64,
    #[serde(default)]
    consecutive_losses: u32,
    #[serde(default)]
    halted: bool,
    session_date: Option<NaiveDate>,

    trade_id: Option<Uuid>,
    size: Option<u32>,
    initial_stop: Option<f64>,
    #[serde(default)]
    partial_size: u32,
    opened_at: Option<DateTime<Utc>>,
    #[serde(default)]
    bars_held: u32,
    halt_reason: Option<String>,
    #[serde(default)]
    trades_today: u32,
    #[serde(default)]
    session_start_balance: f64,
    #[serde(default)]
    balance: f64,
    last_bar_ts: Option<DateTime<Utc>>,
    #[serde(default)]
    last_cycle: Option<CycleSummary>,
}

impl From<&PersistedState> for StateRecord {
    fn from(state: &PersistedState) -> Self {
        let risk = &state.risk;
        let mut record = StateRecord {
            session_pnl: risk.session_pnl,
            consecutive_losses: risk.consecutive_losses,
            halted: risk.halted,
            session_date: risk.session_date,
            halt_reason: risk.halt_reason.clone(),
            trades_today: risk.trades_today,
            session_start_balance: risk.session_start_balance,
            balance: state.balance,
            last_bar_ts: state.last_bar_ts,
            last_cycle: state.last_cycle.clone(),
            ..StateRecord::default()
        };
        if let Some(t) = &state.open_trade {
            record.side = Some(t.side);
            record.entry = Some(t.entry);
            record.stop = Some(t.stop);
            record.tp1 = Some(t.tp1);
            record.tp2 = Some(t.tp2);
            record.status = Some(t.status);
            record.partial_realized = t.partial_realized;
            record.trade_id = Some(t.id);
            record.size = Some(t.size);
            record.initial_stop = Some(t.initial_stop);
            record.partial_size = t.partial_size;
            record.opened_at = Some(t.opened_at);
            record.bars_held = t.bars_held;
        }
        record
    }
}

impl TryFrom<StateRecord> for PersistedState {
    type Error = String;

    fn try_from(r: StateRecord) -> Result<Self, Self::Error> {
        let open_trade = match r.side {
            None | Some(Side::None) => None,
            Some(side) => {
                let missing = |field: &str| format!("open trade missing {}", field);
                let status = r.status.ok_or_else(|| missing("status"))?;
                if status == TradeStatus::Closed {
                    None
                } else {
                    let stop = r.stop.ok_or_else(|| missing("stop"))?;
                    let size = r.size.ok_or_else(|| missing("size"))?;
                    if r.partial_size >= size {
                        return Err(format!("partial size {} >= size {}", r.partial_size, size));
                    }
                    Some(OpenTrade {
                        id: r.trade_id.ok_or_else(|| missing("trade_id"))?,
                        side,
                        size,
                        entry: r.entry.ok_or_else(|| missing("entry"))?,
                        stop,
                        initial_stop: r.initial_stop.unwrap_or(stop),
                        tp1: r.tp1.ok_or_else(|| missing("tp1"))?,
                        tp2: r.tp2.ok_or_else(|| missing("tp2"))?,
                        status,
                        partial_size: r.partial_size,
                        partial_realized: r.partial_realized,
                        opened_at: r.opened_at.ok_or_else(|| missing("opened_at"))?,
                        bars_held: r.bars_held,
                    })
                }
            }
        };

        Ok(PersistedState {
            open_trade,
            risk: RiskState {
                session_date: r.session_date,
                session_pnl: r.session_pnl,
                consecutive_losses: r.consecutive_losses,
                halted: r.halted,
                halt_reason: r.halt_reason,
                trades_today: r.trades_today,
                session_start_balance: r.session_start_balance,
            },
            balance: r.balance,
            last_bar_ts: r.last_bar_ts,
            last_cycle: r.last_cycle,
        })
    }
}

/// Render the flat JSON record
pub fn to_json(state: &PersistedState) -> Result<String> {
    serde_json::to_string_pretty(&StateRecord::from(state)).context("Failed to serialize state")
}

/// Parse the flat JSON record
pub fn from_json(content: &str) -> Result<PersistedState> {
    let record: StateRecord = serde_json::from_str(content).context("Malformed state JSON")?;
    PersistedState::try_from(record).map_err(anyhow::Error::msg)
}

/// Human-readable summary for the `status` command
pub fn format_status(state: &PersistedState) -> String {
    let risk = &state.risk;
    let mut lines = vec![
        format!("Balance:        {:.2}", state.balance),
        format!(
            "Session:        {} | PnL {:.2} | trades {} | losses in a row {}",
            risk.session_date.map(|d| d.to_string()).unwrap_or_else(|| "-".into()),
            risk.session_pnl,
            risk.trades_today,
            risk.consecutive_losses
        ),
    ];
    if risk.halted {
        lines.push(format!(
            "Halted:         {}",
            risk.halt_reason.as_deref().unwrap_or("yes")
        ));
    }
    match &state.open_trade {
        Some(t) => lines.push(format!(
            "Open trade:     {} {} x{} @ {:.2} | stop {:.2} | tp1 {:.2} | tp2 {:.2}",
            t.side, t.status, t.size, t.entry, t.stop, t.tp1, t.tp2
        )),
        None => lines.push("Open trade:     none".to_string()),
    }
    match &state.last_cycle {
        Some(c) => {
            lines.push(format!(
                "Last cycle:     {} | {} bars | {} | {} {:.2}",
                c.bar_ts, c.bars, c.market_state, c.side, c.strength
            ));
            lines.push(format!("  signal:       {}", c.signal_reason));
            lines.push(format!("  risk:         {}", c.risk_reason));
        }
        None => lines.push("Last cycle:     none".to_string()),
    }
    lines.join("\n")
}

/// File-backed state store
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load state, or a fresh state with `balance` when the file is missing
    /// or unreadable.
    pub fn load(&self, balance: f64) -> PersistedState {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No state at {}, starting fresh", self.path.display());
                return PersistedState::new(balance);
            }
            Err(e) => {
                warn!("State file {} unreadable ({}), starting fresh", self.path.display(), e);
                return PersistedState::new(balance);
            }
        };

        match from_json(&content) {
            Ok(mut state) => {
                if state.balance <= 0.0 {
                    state.balance = balance;
                }
                debug!(
                    "State loaded: trade {} | session pnl {:.2} | losses {}",
                    state.open_trade.as_ref().map(|t| t.status.to_string()).unwrap_or_else(|| "none".into()),
                    state.risk.session_pnl,
                    state.risk.consecutive_losses
                );
                state
            }
            Err(e) => {
                warn!(
                    "State file {} is corrupt ({:#}), treating as no open trade and a fresh session",
                    self.path.display(),
                    e
                );
                PersistedState::new(balance)
            }
        }
    }

    /// Write via temp file + rename so a crash never leaves a torn file.
    pub fn save(&self, state: &PersistedState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }
        let json = to_json(state)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json).with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to move state into {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_state() -> PersistedState {
        let opened_at = Utc.with_ymd_and_hms(2025, 1, 15, 15, 0, 0).unwrap();
        PersistedState {
            open_trade: Some(OpenTrade {
                id: Uuid::new_v5(&Uuid::NAMESPACE_OID, b"t1"),
                side: Side::Long,
                size: 4,
                entry: 21_034.25,
                stop: 21_034.25,
                initial_stop: 21_029.5,
                tp1: 21_039.0,
                tp2: 21_043.75,
                status: TradeStatus::Tp1Hit,
                partial_size: 2,
                partial_realized: 190.0,
                opened_at,
                bars_held: 7,
            }),
            risk: RiskState {
                session_date: NaiveDate::from_ymd_opt(2025, 1, 15),
                session_pnl: -412.5,
                consecutive_losses: 2,
                halted: false,
                halt_reason: None,
                trades_today: 3,
                session_start_balance: 100_000.0,
            },
            balance: 99_587.5,
            last_bar_ts: Some(opened_at + chrono::Duration::minutes(7)),
            last_cycle: Some(CycleSummary {
                bar_ts: opened_at + chrono::Duration::minutes(7),
                bars: 30,
                market_state: MarketState::Balanced,
                side: Side::None,
                strength: 0.35,
                signal_reason: "insufficient delta: 120 < 500".to_string(),
                risk_reason: "trade already open".to_string(),
            }),
        }
    }

    #[test]
    fn test_round_trip_is_identical() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        let state = sample_state();

        store.save(&state).unwrap();
        let loaded = store.load(1.0);
        assert_eq!(loaded, state);

        // writing what we read yields the same bytes
        let first = std::fs::read_to_string(store.path()).unwrap();
        store.save(&loaded).unwrap();
        let second = std::fs::read_to_string(store.path()).unwrap();
        assert_eq!(first, second);
        assert!(!dir.path().join("state.json.tmp").exists());
    }

    #[test]
    fn test_flat_schema_fields() {
        let json = to_json(&sample_state()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        for key in [
            "side",
            "entry",
            "stop",
            "tp1",
            "tp2",
            "status",
            "partial_realized",
            "session_pnl",
            "consecutive_losses",
            "halted",
            "session_date",
        ] {
            assert!(value.get(key).is_some(), "missing {}", key);
        }
        assert_eq!(value["side"], "LONG");
        assert_eq!(value["status"], "TP1_HIT");
        assert_eq!(value["session_date"], "2025-01-15");
    }

    #[test]
    fn test_no_trade_serializes_nulls() {
        let state = PersistedState::new(50_000.0);
        let json = to_json(&state).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert!(value["side"].is_null());
        assert!(value["entry"].is_null());
        assert_eq!(from_json(&json).unwrap(), state);
    }

    #[test]
    fn test_missing_file_is_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("nested").join("state.json"));
        let state = store.load(25_000.0);
        assert_eq!(state, PersistedState::new(25_000.0));

        store.save(&state).unwrap();
        assert!(store.path().exists());
    }

    #[test]
    fn test_corrupt_file_fails_safe() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = StateStore::new(&path);

        std::fs::write(&path, "{\"side\": \"LONG\", \"entry\": ").unwrap();
        assert_eq!(store.load(10_000.0), PersistedState::new(10_000.0));

        // parses, but the trade is incomplete
        std::fs::write(&path, r#"{"side": "SHORT", "entry": 100.0, "status": "OPEN"}"#).unwrap();
        let state = store.load(10_000.0);
        assert!(state.open_trade.is_none());
        assert_eq!(state.balance, 10_000.0);
    }

    #[test]
    fn test_minimal_record_without_extensions() {
        let state = from_json(
            r#"{"side": null, "session_pnl": -150.0, "consecutive_losses": 1,
                "halted": false, "session_date": "2025-02-03", "unknown": 1}"#,
        )
        .unwrap();
        assert!(state.open_trade.is_none());
        assert_eq!(state.risk.session_pnl, -150.0);
        assert_eq!(state.risk.consecutive_losses, 1);
        assert!(state.last_cycle.is_none());
    }

    #[test]
    fn test_format_status_shows_last_cycle() {
        let text = format_status(&sample_state());
        assert!(text.contains("99587.50"), "{}", text);
        assert!(text.contains("insufficient delta: 120 < 500"), "{}", text);
        assert!(text.contains("trade already open"), "{}", text);
        assert!(text.contains("30 bars"), "{}", text);

        let text = format_status(&PersistedState::new(1_000.0));
        assert!(text.contains("Open trade:     none"));
        assert!(text.contains("Last cycle:     none"));
    }
}
