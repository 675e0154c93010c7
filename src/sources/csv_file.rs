//! CSV bar files
//!
//! Plain or zstd-compressed (`.zst`) CSV with headers
//! `timestamp,open,high,low,close,volume[,buy_volume,sell_volume]`.
//! Timestamps may be RFC 3339, `%Y-%m-%d %H:%M:%S` (UTC) or epoch
//! seconds/milliseconds. Without a buy/sell split the volume is divided evenly.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::Deserialize;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

use super::{finalize, BarSource};
use crate::trading_core::bars::Bar;

#[derive(Debug, Deserialize)]
struct CsvRow {
    timestamp: String,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    #[serde(default)]
    volume: Option<f64>,
    #[serde(default)]
    buy_volume: Option<f64>,
    #[serde(default)]
    sell_volume: Option<f64>,
}

fn is_zstd(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "zst")
}

pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    let epoch: i64 = raw.parse().ok()?;
    // 10^11 seconds is year 5138; anything larger is milliseconds
    if epoch.abs() >= 100_000_000_000 {
        Utc.timestamp_millis_opt(epoch).single()
    } else {
        Utc.timestamp_opt(epoch, 0).single()
    }
}

fn row_to_bar(row: CsvRow) -> Result<Bar> {
    let timestamp = parse_timestamp(&row.timestamp)
        .with_context(|| format!("Failed to parse timestamp: {}", row.timestamp))?;
    let bar = match (row.buy_volume, row.sell_volume) {
        (Some(buy), Some(sell)) => {
            let mut bar = Bar::new(timestamp, row.open, row.high, row.low, row.close, buy, sell);
            if let Some(volume) = row.volume {
                bar.volume = volume;
            }
            bar
        }
        _ => Bar::from_ohlcv(
            timestamp,
            row.open,
            row.high,
            row.low,
            row.close,
            row.volume.unwrap_or(0.0),
        ),
    };
    Ok(bar)
}

/// Parse bars from any CSV reader
pub fn parse_bars<R: Read>(reader: R) -> Result<Vec<Bar>> {
    let mut csv_reader = csv::Reader::from_reader(reader);
    let mut bars = Vec::new();
    for (i, result) in csv_reader.deserialize().enumerate() {
        let row: CsvRow = result.with_context(|| format!("Failed to parse CSV row {}", i + 1))?;
        bars.push(row_to_bar(row).with_context(|| format!("Bad CSV row {}", i + 1))?);
    }
    Ok(bars)
}

/// Read every bar in `path`, in file order
pub fn read_bars(path: &Path) -> Result<Vec<Bar>> {
    let file = File::open(path).with_context(|| format!("Failed to open file: {:?}", path))?;
    let bars = if is_zstd(path) {
        let decoder = zstd::stream::Decoder::new(file)
            .with_context(|| format!("Failed to create zstd decoder for: {:?}", path))?;
        parse_bars(BufReader::new(decoder))?
    } else {
        parse_bars(BufReader::new(file))?
    };
    debug!("Loaded {} bars from {:?}", bars.len(), path);
    Ok(bars)
}

/// Write bars with the full header, compressing when the path ends in `.zst`
pub fn write_bars(path: &Path, bars: &[Bar]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let file = File::create(path).with_context(|| format!("Failed to create {:?}", path))?;
    if is_zstd(path) {
        let encoder = zstd::stream::Encoder::new(file, 3)?.auto_finish();
        write_to(BufWriter::new(encoder), bars)
    } else {
        write_to(BufWriter::new(file), bars)
    }
}

fn write_to<W: Write>(writer: W, bars: &[Bar]) -> Result<()> {
    let mut csv_writer = csv::Writer::from_writer(writer);
    for bar in bars {
        csv_writer.serialize(bar).context("Failed to write bar row")?;
    }
    csv_writer.flush()?;
    Ok(())
}

/// Bars from a local file, re-read on every fetch so an appending writer is
/// picked up by the live loop.
#[derive(Debug, Clone)]
pub struct CsvBarSource {
    path: PathBuf,
}

impl CsvBarSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BarSource for CsvBarSource {
    async fn fetch(&self, _symbol: &str, _interval: &str, limit: usize) -> Result<Vec<Bar>> {
        let path = self.path.clone();
        let bars = tokio::task::spawn_blocking(move || read_bars(&path))
            .await
            .context("CSV reader task failed")??;
        Ok(finalize(bars, limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WITH_SPLIT: &str = "\
timestamp,open,high,low,close,volume,buy_volume,sell_volume
2025-01-06T15:00:00Z,100.0,101.0,99.5,100.5,1000,600,400
2025-01-06 15:01:00,100.5,102.0,100.25,101.75,800,500,300
1736175720,101.75,102.0,101.0,101.25,500,,
";

    #[test]
    fn test_parse_with_split() {
        let bars = parse_bars(WITH_SPLIT.as_bytes()).unwrap();
        assert_eq!(bars.len(), 3);
        assert_eq!(bars[0].buy_volume, 600.0);
        assert_eq!(bars[0].delta(), 200.0);
        assert_eq!(bars[1].timestamp - bars[0].timestamp, chrono::Duration::minutes(1));
        // empty split columns fall back to an even split
        assert_eq!(bars[2].buy_volume, 250.0);
        assert_eq!(bars[2].sell_volume, 250.0);
        assert_eq!(bars[2].timestamp - bars[1].timestamp, chrono::Duration::minutes(1));
    }

    #[test]
    fn test_parse_without_split_columns() {
        let data = "timestamp,open,high,low,close,volume\n1736175600000,10,11,9,10.5,42\n";
        let bars = parse_bars(data.as_bytes()).unwrap();
        assert_eq!(bars[0].volume, 42.0);
        assert_eq!(bars[0].buy_volume, 21.0);
        assert_eq!(bars[0].timestamp, parse_timestamp("2025-01-06T15:00:00Z").unwrap());
    }

    #[test]
    fn test_bad_row_is_an_error() {
        let data = "timestamp,open,high,low,close,volume\nyesterday,10,11,9,10.5,42\n";
        let err = parse_bars(data.as_bytes()).unwrap_err();
        assert!(format!("{:#}", err).contains("timestamp"));
    }

    #[tokio::test]
    async fn test_zstd_round_trip_through_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bars.csv.zst");
        let bars = parse_bars(WITH_SPLIT.as_bytes()).unwrap();
        write_bars(&path, &bars).unwrap();

        let source = CsvBarSource::new(&path);
        let fetched = source.fetch("NQ=F", "1m", 2).await.unwrap();
        assert_eq!(fetched, bars[1..].to_vec());
    }
}
