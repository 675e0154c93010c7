//! Bar sources
//!
//! Every provider returns completed bars in ascending time order, at most
//! `limit` of them (the most recent).

pub mod binance;
pub mod csv_file;
pub mod yahoo;

use anyhow::Result;
use chrono::Duration;
use std::future::Future;
use std::sync::{Arc, Mutex};

use crate::trading_core::bars::Bar;

pub use self::binance::BinanceBarSource;
pub use self::csv_file::CsvBarSource;
pub use self::yahoo::YahooBarSource;

pub trait BarSource: Send + Sync {
    fn fetch(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<Bar>>> + Send;
}

/// Provider chosen at runtime from the CLI
pub enum AnySource {
    Csv(CsvBarSource),
    Binance(BinanceBarSource),
    Yahoo(YahooBarSource),
    Fixture(FixtureBarSource),
}

impl AnySource {
    pub fn name(&self) -> &'static str {
        match self {
            AnySource::Csv(_) => "csv",
            AnySource::Binance(_) => "binance",
            AnySource::Yahoo(_) => "yahoo",
            AnySource::Fixture(_) => "fixture",
        }
    }
}

impl BarSource for AnySource {
    async fn fetch(&self, symbol: &str, interval: &str, limit: usize) -> Result<Vec<Bar>> {
        match self {
            AnySource::Csv(s) => s.fetch(symbol, interval, limit).await,
            AnySource::Binance(s) => s.fetch(symbol, interval, limit).await,
            AnySource::Yahoo(s) => s.fetch(symbol, interval, limit).await,
            AnySource::Fixture(s) => s.fetch(symbol, interval, limit).await,
        }
    }
}

/// In-memory bars for tests and replays. Clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct FixtureBarSource {
    bars: Arc<Mutex<Vec<Bar>>>,
    delay: Option<std::time::Duration>,
    fail: Option<String>,
}

impl FixtureBarSource {
    pub fn new(bars: Vec<Bar>) -> Self {
        Self {
            bars: Arc::new(Mutex::new(bars)),
            ..Self::default()
        }
    }

    /// Sleep this long before answering
    pub fn with_delay(mut self, delay: std::time::Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Always fail with `message`
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            fail: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn push(&self, bar: Bar) {
        if let Ok(mut bars) = self.bars.lock() {
            bars.push(bar);
        }
    }
}

impl BarSource for FixtureBarSource {
    async fn fetch(&self, _symbol: &str, _interval: &str, limit: usize) -> Result<Vec<Bar>> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = &self.fail {
            anyhow::bail!("{}", message);
        }
        let bars = self
            .bars
            .lock()
            .map_err(|_| anyhow::anyhow!("fixture bars poisoned"))?
            .clone();
        Ok(finalize(bars, limit))
    }
}

/// Sort ascending, drop repeated timestamps and keep the last `limit` bars.
pub fn finalize(mut bars: Vec<Bar>, limit: usize) -> Vec<Bar> {
    bars.sort_by_key(|b| b.timestamp);
    bars.dedup_by_key(|b| b.timestamp);
    if bars.len() > limit {
        bars.drain(..bars.len() - limit);
    }
    bars
}

/// Length of a provider interval string such as "15s", "1m", "1h", "1d".
pub fn interval_duration(interval: &str) -> Option<Duration> {
    let interval = interval.trim();
    let split = interval.find(|c: char| !c.is_ascii_digit())?;
    let (count, unit) = interval.split_at(split);
    let count: i64 = count.parse().ok()?;
    if count <= 0 {
        return None;
    }
    match unit {
        "s" => Some(Duration::seconds(count)),
        "m" => Some(Duration::minutes(count)),
        "h" => Some(Duration::hours(count)),
        "d" => Some(Duration::days(count)),
        "wk" | "w" => Some(Duration::weeks(count)),
        _ => None,
    }
}
