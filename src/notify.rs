//! Event sinks
//!
//! The engine reports actionable signals and trade transitions to an
//! `EventSink`. Delivery (chat, broker, dashboard) lives behind this trait;
//! the crate ships a tracing sink and a JSONL trade journal.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::trading_core::lifecycle::TradeEvent;
use crate::trading_core::signal::Signal;

pub trait EventSink: Send + Sync {
    fn on_signal(&self, signal: &Signal);
    fn on_trade_event(&self, event: &TradeEvent);
}

/// Logs events through tracing
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl EventSink for LogSink {
    fn on_signal(&self, signal: &Signal) {
        info!(
            "SIGNAL: {} ({:.2}) @ {:.2} | Stop: {:.2} | TP1: {:.2} | TP2: {:.2} | {}",
            signal.side, signal.strength, signal.entry, signal.stop, signal.tp1, signal.tp2, signal.reason
        );
    }

    fn on_trade_event(&self, event: &TradeEvent) {
        match event {
            TradeEvent::Opened { trade } => info!(
                "OPENED: {} x{} @ {:.2} | Stop: {:.2} | id {}",
                trade.side, trade.size, trade.entry, trade.stop, trade.id
            ),
            TradeEvent::Tp1Hit {
                price,
                new_stop,
                partial_size,
                partial_pnl,
                ..
            } => info!(
                "TP1 HIT: @ {:.2} | closed x{} ({:+.2}) | Stop -> {:.2}",
                price, partial_size, partial_pnl, new_stop
            ),
            TradeEvent::Closed(closed) => info!(
                "CLOSED ({}): {} @ {:.2} | PnL: {:+.2} | {} bars",
                closed.reason, closed.side, closed.exit_price, closed.pnl, closed.bars_held
            ),
        }
    }
}

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum JournalEntry<'a> {
    Signal(&'a Signal),
    Trade(&'a TradeEvent),
}

#[derive(Serialize)]
struct JournalLine<'a> {
    logged_at: DateTime<Utc>,
    #[serde(flatten)]
    entry: JournalEntry<'a>,
}

/// Appends one JSON object per event to a file
pub struct JournalSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JournalSink {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open journal {}", path.display()))?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, entry: JournalEntry<'_>) {
        let line = JournalLine {
            logged_at: Utc::now(),
            entry,
        };
        let result = serde_json::to_string(&line)
            .map_err(anyhow::Error::from)
            .and_then(|json| {
                let mut file = self
                    .file
                    .lock()
                    .map_err(|_| anyhow::anyhow!("journal lock poisoned"))?;
                writeln!(file, "{}", json)?;
                file.flush()?;
                Ok(())
            });
        if let Err(e) = result {
            warn!("Failed to write journal {}: {}", self.path.display(), e);
        }
    }
}

impl EventSink for JournalSink {
    fn on_signal(&self, signal: &Signal) {
        self.append(JournalEntry::Signal(signal));
    }

    fn on_trade_event(&self, event: &TradeEvent) {
        self.append(JournalEntry::Trade(event));
    }
}

/// Forwards to several sinks in order
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Box<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: impl EventSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }
}

impl EventSink for FanoutSink {
    fn on_signal(&self, signal: &Signal) {
        for sink in &self.sinks {
            sink.on_signal(signal);
        }
    }

    fn on_trade_event(&self, event: &TradeEvent) {
        for sink in &self.sinks {
            sink.on_trade_event(event);
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Recorded {
    Signal(Signal),
    Trade(TradeEvent),
}

/// Keeps every event in memory; clones share the buffer
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    events: Arc<Mutex<Vec<Recorded>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Recorded> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn trade_events(&self) -> Vec<TradeEvent> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Recorded::Trade(t) => Some(t),
                Recorded::Signal(_) => None,
            })
            .collect()
    }

    fn push(&self, event: Recorded) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

impl EventSink for RecordingSink {
    fn on_signal(&self, signal: &Signal) {
        self.push(Recorded::Signal(signal.clone()));
    }

    fn on_trade_event(&self, event: &TradeEvent) {
        self.push(Recorded::Trade(event.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trading_core::lifecycle::OpenTrade;
    use crate::trading_core::market_state::MarketState;
    use crate::trading_core::signal::Side;
    use chrono::TimeZone;

    fn signal() -> Signal {
        Signal {
            timestamp: Utc.with_ymd_and_hms(2025, 1, 15, 15, 0, 0).unwrap(),
            side: Side::Short,
            strength: 0.72,
            entry: 100.0,
            stop: 102.0,
            tp1: 98.0,
            tp2: 96.0,
            reason: "BALANCED fade SHORT".to_string(),
            market_state: MarketState::Balanced,
            setup: None,
        }
    }

    #[test]
    fn test_journal_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal").join("events.jsonl");
        let sink = JournalSink::open(&path).unwrap();

        let signal = signal();
        let trade = OpenTrade::pending(&signal, 2).unwrap();
        sink.on_signal(&signal);
        sink.on_trade_event(&TradeEvent::Opened { trade });
        drop(sink);

        // reopening appends
        let sink = JournalSink::open(&path).unwrap();
        sink.on_signal(&signal);

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["kind"], "signal");
        assert_eq!(lines[0]["side"], "SHORT");
        assert_eq!(lines[1]["kind"], "trade");
        assert_eq!(lines[1]["event"], "opened");
        assert_eq!(lines[1]["trade"]["size"], 2);
        assert!(lines[2]["logged_at"].is_string());
    }

    #[test]
    fn test_recording_and_fanout() {
        let recorder = RecordingSink::new();
        let fanout = FanoutSink::new().with(LogSink).with(recorder.clone());
        fanout.on_signal(&signal());
        assert_eq!(recorder.events(), vec![Recorded::Signal(signal())]);
        assert!(recorder.trade_events().is_empty());
    }
}
