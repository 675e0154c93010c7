//! Entry filters applied after signal scoring
//!
//! Both keep their own close history, fed with every bar the engine accepts
//! (warm-up included), so they can look further back than the profile window.

use std::collections::VecDeque;

use super::signal::Side;

/// Volatility history kept for the median
const MAX_VOL_HISTORY: usize = 2000;
/// Rolling volatilities needed before the bands mean anything
const MIN_VOL_HISTORY: usize = 10;

/// Long only above the moving average of closes, short only below it.
#[derive(Debug, Clone)]
pub struct TrendMaFilter {
    bars: usize,
    closes: VecDeque<f64>,
}

impl TrendMaFilter {
    pub fn new(bars: usize) -> Self {
        Self {
            bars: bars.max(1),
            closes: VecDeque::with_capacity(bars.max(1)),
        }
    }

    pub fn on_close(&mut self, close: f64) {
        self.closes.push_back(close);
        if self.closes.len() > self.bars {
            self.closes.pop_front();
        }
    }

    /// Mean of the closes seen so far, up to `bars` of them
    pub fn average(&self) -> Option<f64> {
        if self.closes.is_empty() {
            return None;
        }
        Some(self.closes.iter().sum::<f64>() / self.closes.len() as f64)
    }

    /// Rejection reason when `side` trades against the average
    pub fn check(&self, side: Side, close: f64) -> Option<String> {
        let ma = self.average()?;
        match side {
            Side::Long if close <= ma => Some(format!(
                "against trend MA: close {:.2} <= MA({}) {:.2}",
                close, self.bars, ma
            )),
            Side::Short if close >= ma => Some(format!(
                "against trend MA: close {:.2} >= MA({}) {:.2}",
                close, self.bars, ma
            )),
            _ => None,
        }
    }
}

/// Volatility regime from the std of close-to-close returns.
///
/// 0 = low (below 0.7x the median rolling std), 2 = high (above 1.4x),
/// 1 otherwise or while history is short.
#[derive(Debug, Clone)]
pub struct RegimeDetector {
    window: usize,
    allowed: Vec<u8>,
    closes: VecDeque<f64>,
    vols: VecDeque<f64>,
}

fn return_std(closes: &VecDeque<f64>) -> Option<f64> {
    let returns: Vec<f64> = closes
        .iter()
        .zip(closes.iter().skip(1))
        .filter(|(prev, _)| **prev != 0.0)
        .map(|(prev, next)| (next - prev) / prev)
        .collect();
    if returns.len() < 2 {
        return None;
    }
    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let var = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);
    Some(var.sqrt())
}

fn median(values: &VecDeque<f64>) -> f64 {
    let mut sorted: Vec<f64> = values.iter().copied().collect();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

impl RegimeDetector {
    pub fn new(window: usize, allowed: Vec<u8>) -> Self {
        Self {
            window: window.max(3),
            allowed,
            closes: VecDeque::new(),
            vols: VecDeque::new(),
        }
    }

    pub fn on_close(&mut self, close: f64) {
        self.closes.push_back(close);
        if self.closes.len() > self.window {
            self.closes.pop_front();
        }
        if self.closes.len() == self.window {
            if let Some(vol) = return_std(&self.closes) {
                self.vols.push_back(vol);
                if self.vols.len() > MAX_VOL_HISTORY {
                    self.vols.pop_front();
                }
            }
        }
    }

    /// Regime of the closes seen so far
    pub fn regime(&self) -> u8 {
        if self.closes.len() < self.window {
            return 1;
        }
        let Some(vol) = return_std(&self.closes) else {
            return 1;
        };
        if vol <= 0.0 {
            return 0;
        }
        if self.vols.len() < MIN_VOL_HISTORY {
            return 1;
        }
        let med = median(&self.vols);
        if med <= 0.0 {
            1
        } else if vol < med * 0.7 {
            0
        } else if vol > med * 1.4 {
            2
        } else {
            1
        }
    }

    /// Rejection reason when the current regime is not allowed
    pub fn check(&self) -> Option<String> {
        if self.allowed.is_empty() {
            return None;
        }
        let regime = self.regime();
        (!self.allowed.contains(&regime)).then(|| format!("regime {} not allowed", regime))
    }
}
