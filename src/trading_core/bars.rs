//! Bar model
//!
//! Fixed-interval OHLC bars annotated with aggressor volume. When a provider
//! has no buy/sell split the volume is divided evenly, or estimated from the
//! bar's shape with [`approximate_split`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DataError;

/// Aggressor side of traded volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Aggressor {
    Buy,
    Sell,
}

impl std::fmt::Display for Aggressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Aggressor::Buy => write!(f, "BUY"),
            Aggressor::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub buy_volume: f64,
    pub sell_volume: f64,
}

impl Bar {
    /// Bar with an explicit aggressor split
    pub fn new(
        timestamp: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        buy_volume: f64,
        sell_volume: f64,
    ) -> Self {
        Self {
            timestamp,
            open,
            high,
            low,
            close,
            volume: buy_volume + sell_volume,
            buy_volume,
            sell_volume,
        }
    }

    /// Bar without aggressor data: volume split evenly
    pub fn from_ohlcv(
        timestamp: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Self {
        Self {
            timestamp,
            open,
            high,
            low,
            close,
            volume,
            buy_volume: volume / 2.0,
            sell_volume: volume / 2.0,
        }
    }

    /// Per-bar delta (buy - sell)
    pub fn delta(&self) -> f64 {
        self.buy_volume - self.sell_volume
    }

    pub fn range(&self) -> f64 {
        self.high - self.low
    }

    pub fn is_bullish(&self) -> bool {
        self.close >= self.open
    }

    pub fn validate(&self) -> Result<(), DataError> {
        let invalid = |reason: &str| DataError::InvalidBar {
            timestamp: self.timestamp,
            reason: reason.to_string(),
        };

        let fields = [
            self.open,
            self.high,
            self.low,
            self.close,
            self.volume,
            self.buy_volume,
            self.sell_volume,
        ];
        if fields.iter().any(|v| !v.is_finite()) {
            return Err(invalid("non-finite field"));
        }
        if self.high < self.low {
            return Err(invalid("high below low"));
        }
        if self.open > self.high || self.open < self.low {
            return Err(invalid("open outside high/low"));
        }
        if self.close > self.high || self.close < self.low {
            return Err(invalid("close outside high/low"));
        }
        if self.volume < 0.0 || self.buy_volume < 0.0 || self.sell_volume < 0.0 {
            return Err(invalid("negative volume"));
        }
        Ok(())
    }
}

/// Estimate (buy, sell) volume from where the bar closed relative to its open.
///
/// A bar closing at its high from its low is all buying; a doji is an even
/// split. Zero-range bars split evenly.
pub fn approximate_split(open: f64, high: f64, low: f64, close: f64, volume: f64) -> (f64, f64) {
    let range = high - low;
    if range <= 0.0 || volume <= 0.0 {
        return (volume / 2.0, volume / 2.0);
    }
    let body = ((close - open) / range).clamp(-1.0, 1.0);
    let buy_pct = 0.5 + 0.5 * body;
    let buy = volume * buy_pct;
    (buy, volume - buy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 4, 15, 0, 0).unwrap()
    }

    #[test]
    fn test_even_split_when_missing() {
        let bar = Bar::from_ohlcv(ts(), 100.0, 101.0, 99.0, 100.5, 300.0);
        assert_eq!(bar.buy_volume, 150.0);
        assert_eq!(bar.sell_volume, 150.0);
        assert_eq!(bar.delta(), 0.0);
    }

    #[test]
    fn test_new_sums_volume() {
        let bar = Bar::new(ts(), 100.0, 101.0, 99.0, 100.5, 800.0, 200.0);
        assert_eq!(bar.volume, 1000.0);
        assert_eq!(bar.delta(), 600.0);
        assert!(bar.is_bullish());
    }

    #[test]
    fn test_validate_rejects_malformed() {
        let mut bar = Bar::new(ts(), 100.0, 101.0, 99.0, 100.5, 10.0, 10.0);
        assert!(bar.validate().is_ok());

        bar.high = 98.0;
        assert!(matches!(bar.validate(), Err(DataError::InvalidBar { .. })));

        let mut bar = Bar::new(ts(), 100.0, 101.0, 99.0, 100.5, 10.0, 10.0);
        bar.close = f64::NAN;
        assert!(bar.validate().is_err());

        let bar = Bar::new(ts(), 100.0, 101.0, 99.0, 100.5, -5.0, 10.0);
        assert!(bar.validate().is_err());
    }

    #[test]
    fn test_approximate_split() {
        let (buy, sell) = approximate_split(100.0, 102.0, 100.0, 102.0, 100.0);
        assert_eq!((buy, sell), (100.0, 0.0));

        let (buy, sell) = approximate_split(101.0, 102.0, 100.0, 101.0, 100.0);
        assert_eq!((buy, sell), (50.0, 50.0));

        let (buy, sell) = approximate_split(101.5, 102.0, 100.0, 100.5, 100.0);
        assert_eq!(buy, 25.0);
        assert_eq!(sell, 75.0);

        let (buy, sell) = approximate_split(100.0, 100.0, 100.0, 100.0, 40.0);
        assert_eq!((buy, sell), (20.0, 20.0));
    }
}
