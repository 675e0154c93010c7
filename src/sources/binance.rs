//! Binance klines
//!
//! Public REST klines carry the taker-buy base volume (field 9), which gives
//! a real aggressor split without an API key.

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

use super::{finalize, BarSource};
use crate::trading_core::bars::Bar;

pub const DEFAULT_BASE_URL: &str = "https://api.binance.com";

/// Binance caps a klines request at 1000 rows
const MAX_LIMIT: usize = 1000;

#[derive(Debug, Clone)]
pub struct BinanceBarSource {
    client: Client,
    base_url: String,
}

impl BinanceBarSource {
    pub fn new(timeout: Duration) -> Result<Self> {
        Self::with_base_url(DEFAULT_BASE_URL, timeout)
    }

    pub fn with_base_url(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: Client::builder()
                .timeout(timeout)
                .build()
                .context("Failed to create HTTP client")?,
            base_url: base_url.into(),
        })
    }
}

fn field(row: &[serde_json::Value], idx: usize) -> Option<f64> {
    match row.get(idx)? {
        serde_json::Value::String(s) => s.parse().ok(),
        serde_json::Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

/// Parse kline rows. Rows still forming at `now` and malformed rows are dropped.
pub fn parse_klines(raw: &[serde_json::Value], now: DateTime<Utc>) -> Vec<Bar> {
    raw.iter()
        .filter_map(|row| {
            let row = row.as_array()?;
            if row.len() < 10 {
                return None;
            }
            let open_time = Utc.timestamp_millis_opt(row[0].as_i64()?).single()?;
            let close_time = Utc.timestamp_millis_opt(row[6].as_i64()?).single()?;
            if close_time > now {
                return None;
            }
            let volume = field(row, 5)?;
            let buy = field(row, 9)?.clamp(0.0, volume);
            let mut bar = Bar::new(
                open_time,
                field(row, 1)?,
                field(row, 2)?,
                field(row, 3)?,
                field(row, 4)?,
                buy,
                volume - buy,
            );
            bar.volume = volume;
            Some(bar)
        })
        .collect()
}

impl BarSource for BinanceBarSource {
    async fn fetch(&self, symbol: &str, interval: &str, limit: usize) -> Result<Vec<Bar>> {
        // one extra row in case the newest is still forming
        let request_limit = (limit + 1).min(MAX_LIMIT);
        let url = format!("{}/api/v3/klines", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[
                ("symbol", symbol.to_string()),
                ("interval", interval.to_string()),
                ("limit", request_limit.to_string()),
            ])
            .send()
            .await
            .with_context(|| format!("Failed to send GET request to {}", url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Klines error ({}): {}", status, body);
        }

        let raw: Vec<serde_json::Value> = response
            .json()
            .await
            .context("Failed to parse klines response")?;
        let bars = parse_klines(&raw, Utc::now());
        debug!("Binance {} {}: {} closed bars", symbol, interval, bars.len());
        Ok(finalize(bars, limit))
    }
}
