//! Yahoo Finance chart API
//!
//! Only total volume is published, so the buy/sell split is estimated from
//! each bar's shape with [`approximate_split`].

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, TimeZone, Utc};
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{finalize, interval_duration, BarSource};
use crate::trading_core::bars::{approximate_split, Bar};

pub const DEFAULT_BASE_URL: &str = "https://query1.finance.yahoo.com";

const USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 Chrome/120.0.0.0 Safari/537.36";

#[derive(Debug, Deserialize)]
pub struct ChartResponse {
    chart: Chart,
}

#[derive(Debug, Deserialize)]
struct Chart {
    #[serde(default)]
    result: Option<Vec<ChartResult>>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    #[serde(default)]
    timestamp: Vec<i64>,
    indicators: Indicators,
}

#[derive(Debug, Deserialize)]
struct Indicators {
    quote: Vec<Quote>,
}

#[derive(Debug, Default, Deserialize)]
struct Quote {
    #[serde(default)]
    open: Vec<Option<f64>>,
    #[serde(default)]
    high: Vec<Option<f64>>,
    #[serde(default)]
    low: Vec<Option<f64>>,
    #[serde(default)]
    close: Vec<Option<f64>>,
    #[serde(default)]
    volume: Vec<Option<f64>>,
}

/// How far back Yahoo serves a given interval
fn max_lookback(interval: &str) -> Duration {
    match interval {
        "1m" | "2m" => Duration::days(7),
        "5m" | "15m" | "30m" | "60m" | "1h" | "90m" => Duration::days(60),
        _ => Duration::days(730),
    }
}

/// Convert a chart response into bars. Rows with missing prices are skipped.
pub fn parse_chart(response: ChartResponse) -> Result<Vec<Bar>> {
    if let Some(error) = response.chart.error.filter(|e| !e.is_null()) {
        anyhow::bail!("Yahoo chart error: {}", error);
    }
    let Some(result) = response.chart.result.and_then(|r| r.into_iter().next()) else {
        return Ok(Vec::new());
    };
    let quote = result.indicators.quote.into_iter().next().unwrap_or_default();

    let at = |v: &Vec<Option<f64>>, i: usize| v.get(i).copied().flatten();
    let mut bars = Vec::with_capacity(result.timestamp.len());
    let mut skipped = 0;
    for (i, &ts) in result.timestamp.iter().enumerate() {
        let (Some(open), Some(high), Some(low), Some(close), Some(timestamp)) = (
            at(&quote.open, i),
            at(&quote.high, i),
            at(&quote.low, i),
            at(&quote.close, i),
            Utc.timestamp_opt(ts, 0).single(),
        ) else {
            skipped += 1;
            continue;
        };
        let volume = at(&quote.volume, i).unwrap_or(0.0).max(0.0);
        let (buy, sell) = approximate_split(open, high, low, close, volume);
        let mut bar = Bar::new(timestamp, open, high, low, close, buy, sell);
        bar.volume = volume;
        bars.push(bar);
    }
    if skipped > 0 {
        debug!("Skipped {} incomplete chart rows", skipped);
    }
    Ok(bars)
}

#[derive(Debug, Clone)]
pub struct YahooBarSource {
    client: Client,
    base_url: String,
}

impl YahooBarSource {
    pub fn new(timeout: std::time::Duration) -> Result<Self> {
        Self::with_base_url(DEFAULT_BASE_URL, timeout)
    }

    pub fn with_base_url(base_url: impl Into<String>, timeout: std::time::Duration) -> Result<Self> {
        Ok(Self {
            client: Client::builder()
                .timeout(timeout)
                .user_agent(USER_AGENT)
                .build()
                .context("Failed to create HTTP client")?,
            base_url: base_url.into(),
        })
    }

    fn window(interval: &str, limit: usize, now: DateTime<Utc>) -> (i64, i64) {
        let step = interval_duration(interval).unwrap_or_else(|| Duration::minutes(1));
        // ask for twice the span to ride over closed market hours
        let wanted = step * (limit.min(100_000) as i32) * 2;
        let span = wanted.min(max_lookback(interval));
        ((now - span).timestamp(), now.timestamp())
    }
}

impl BarSource for YahooBarSource {
    async fn fetch(&self, symbol: &str, interval: &str, limit: usize) -> Result<Vec<Bar>> {
        let now = Utc::now();
        let (period1, period2) = Self::window(interval, limit, now);
        let url = format!("{}/v8/finance/chart/{}", self.base_url, symbol);
        let response = self
            .client
            .get(&url)
            .query(&[
                ("period1", period1.to_string()),
                ("period2", period2.to_string()),
                ("interval", interval.to_string()),
                ("events", "history".to_string()),
            ])
            .send()
            .await
            .with_context(|| format!("Failed to send GET request to {}", url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Yahoo chart request failed ({}): {}", status, body);
        }

        let chart: ChartResponse = response
            .json()
            .await
            .context("Failed to parse chart response")?;
        let mut bars = parse_chart(chart)?;

        // the newest bar is still forming until its interval has elapsed
        if let (Some(step), Some(last)) = (interval_duration(interval), bars.last()) {
            if last.timestamp + step > now {
                bars.pop();
            }
        }
        if bars.is_empty() {
            warn!("Yahoo returned no bars for {} {}", symbol, interval);
        }
        Ok(finalize(bars, limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_chart() {
        let body = r#"{"chart": {"result": [{
            "meta": {"symbol": "NQ=F"},
            "timestamp": [1736175600, 1736175660, 1736175720],
            "indicators": {"quote": [{
                "open":   [100.0, 100.5, null],
                "high":   [101.0, 100.75, 101.0],
                "low":    [99.0, 100.0, 100.0],
                "close":  [101.0, 100.0, 100.5],
                "volume": [400, null, 10]
            }]}
        }], "error": null}}"#;
        let chart: ChartResponse = serde_json::from_str(body).unwrap();
        let bars = parse_chart(chart).unwrap();

        assert_eq!(bars.len(), 2);
        // closed at the high from mid-range: mostly buying
        assert!(bars[0].buy_volume > bars[0].sell_volume);
        assert_eq!(bars[0].volume, 400.0);
        assert_eq!(bars[1].volume, 0.0);
    }

    #[test]
    fn test_chart_error_is_reported() {
        let body = r#"{"chart": {"result": null, "error": {"code": "Not Found"}}}"#;
        let chart: ChartResponse = serde_json::from_str(body).unwrap();
        assert!(parse_chart(chart).is_err());
    }

    #[test]
    fn test_request_window_is_capped() {
        let now = Utc.with_ymd_and_hms(2025, 1, 10, 0, 0, 0).unwrap();
        let (p1, p2) = YahooBarSource::window("1m", 200, now);
        assert_eq!(p2 - p1, 400 * 60);
        let (p1, p2) = YahooBarSource::window("1m", 50_000, now);
        assert_eq!(p2 - p1, 7 * 86_400);
    }
}
