//! Synthetic order-flow bars
//!
//! Seeded generator for demos and tests. Volume alternates between buy,
//! sell and neutral pressure regimes with occasional big lots, and price
//! drifts with the resulting delta.

use chrono::{DateTime, Duration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Exp1, StandardNormal};

use crate::trading_core::bars::Bar;

#[derive(Debug, Clone)]
pub struct SampleConfig {
    /// Starting price; price stays within +/- 500 of it (default: 20000)
    pub base_price: f64,
    /// Price increment (default: 0.25)
    pub tick_size: f64,
    /// Multiplier applied to raw lot counts (default: 10)
    pub volume_scale: f64,
}

impl Default for SampleConfig {
    fn default() -> Self {
        Self {
            base_price: 20_000.0,
            tick_size: 0.25,
            volume_scale: 10.0,
        }
    }
}

/// Pressure regime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Regime {
    Sell,
    Neutral,
    Buy,
}

impl Regime {
    fn pick(rng: &mut StdRng) -> Self {
        let u: f64 = rng.gen();
        if u < 0.35 {
            Regime::Sell
        } else if u < 0.65 {
            Regime::Neutral
        } else {
            Regime::Buy
        }
    }
}

/// `n` bars spaced `interval` apart starting at `start`, reproducible for `seed`.
pub fn generate_bars(n: usize, seed: u64, start: DateTime<Utc>, interval: Duration) -> Vec<Bar> {
    generate_bars_with(&SampleConfig::default(), n, seed, start, interval)
}

pub fn generate_bars_with(
    config: &SampleConfig,
    n: usize,
    seed: u64,
    start: DateTime<Utc>,
    interval: Duration,
) -> Vec<Bar> {
    let mut rng = StdRng::seed_from_u64(seed);
    let base = config.base_price;
    let step = config.tick_size * 2.0;

    let mut bars = Vec::with_capacity(n);
    let mut price = base;
    let mut regime = Regime::Neutral;
    let mut regime_left = 0u32;

    for i in 0..n {
        if regime_left == 0 {
            regime_left = rng.gen_range(30..120);
            regime = Regime::pick(&mut rng);
        }
        regime_left -= 1;

        let (buy_bias, sell_bias) = match regime {
            Regime::Buy => (25.0, -10.0),
            Regime::Sell => (-10.0, 25.0),
            Regime::Neutral => (0.0, 0.0),
        };
        let mut base_buy = 40.0 + buy_bias + rng.sample::<f64, _>(Exp1) * 20.0;
        let mut base_sell = 40.0 + sell_bias + rng.sample::<f64, _>(Exp1) * 20.0;

        // occasional big lot on the pressured side
        if rng.gen_bool(0.08) {
            if regime != Regime::Sell {
                base_buy += rng.gen_range(25..60u32) as f64;
            }
            if regime != Regime::Buy {
                base_sell += rng.gen_range(25..60u32) as f64;
            }
        }

        let buy = (base_buy + rng.sample::<f64, _>(StandardNormal) * 15.0).max(5.0);
        let sell = (base_sell + rng.sample::<f64, _>(StandardNormal) * 15.0).max(5.0);
        let ret = (buy - sell) / 100.0;

        let open = price;
        price = (price + ret * step).clamp(base - 500.0, base + 500.0);
        let close = price;
        let high = open.max(close) + rng.gen::<f64>() * step;
        let low = open.min(close) - rng.gen::<f64>() * step;

        bars.push(Bar::new(
            start + interval * i as i32,
            open,
            high,
            low,
            close,
            (buy * config.volume_scale).round(),
            (sell * config.volume_scale).round(),
        ));
    }

    bars
}
