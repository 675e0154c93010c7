//! Parameter Sweep Module
//!
//! Runs one backtest per parameter combination in parallel with Rayon,
//! ranks them by score and saves the winner as a best-params snapshot that
//! the engine can overlay onto its config at load.

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering as CmpOrdering;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{info, warn};

use crate::backtest::{Backtester, PerformanceMetrics};
use crate::config::EngineConfig;
use crate::trading_core::bars::Bar;

/// Score for runs with too few trades to judge
pub const INSUFFICIENT_TRADES_SCORE: f64 = -1e9;

/// Parameters varied by the sweep. Field names match config keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepParams {
    pub min_signal_strength: f64,
    pub min_delta: f64,
    pub rr_first: f64,
    pub rr_second: f64,
    pub min_delta_multiplier: f64,
    pub big_trade_edge: f64,
    pub big_trade_threshold: f64,
}

impl SweepParams {
    pub fn apply(&self, base: &EngineConfig) -> EngineConfig {
        EngineConfig {
            min_signal_strength: self.min_signal_strength,
            min_delta: self.min_delta,
            rr_first: self.rr_first,
            rr_second: self.rr_second,
            min_delta_multiplier: self.min_delta_multiplier,
            big_trade_edge: self.big_trade_edge,
            big_trade_threshold: self.big_trade_threshold,
            ..base.clone()
        }
    }
}

/// Values tried for each parameter
#[derive(Debug, Clone)]
pub struct SweepGrid {
    pub min_signal_strength: Vec<f64>,
    pub min_delta: Vec<f64>,
    pub rr_first: Vec<f64>,
    pub rr_second: Vec<f64>,
    pub min_delta_multiplier: Vec<f64>,
    pub big_trade_edge: Vec<f64>,
    pub big_trade_threshold: Vec<f64>,
}

impl Default for SweepGrid {
    fn default() -> Self {
        Self {
            min_signal_strength: vec![0.6, 0.7, 0.8],
            min_delta: vec![300.0, 500.0, 700.0],
            rr_first: vec![0.75, 1.0],
            rr_second: vec![1.5, 2.0],
            min_delta_multiplier: vec![1.2, 1.3, 1.4],
            big_trade_edge: vec![100.0, 200.0],
            big_trade_threshold: vec![400.0, 500.0],
        }
    }
}

impl SweepGrid {
    /// Every combination, skipping those with `rr_second <= rr_first`
    pub fn combinations(&self) -> Vec<SweepParams> {
        let mut combinations = Vec::new();

        for &min_signal_strength in &self.min_signal_strength {
            for &min_delta in &self.min_delta {
                for &rr_first in &self.rr_first {
                    for &rr_second in &self.rr_second {
                        if rr_second <= rr_first {
                            continue;
                        }
                        for &min_delta_multiplier in &self.min_delta_multiplier {
                            for &big_trade_edge in &self.big_trade_edge {
                                for &big_trade_threshold in &self.big_trade_threshold {
                                    combinations.push(SweepParams {
                                        min_signal_strength,
                                        min_delta,
                                        rr_first,
                                        rr_second,
                                        min_delta_multiplier,
                                        big_trade_edge,
                                        big_trade_threshold,
                                    });
                                }
                            }
                        }
                    }
                }
            }
        }

        combinations
    }
}

/// Reproducible random subset of at most `max` combinations, in grid order
pub fn sample_combinations(combinations: Vec<SweepParams>, max: usize, seed: u64) -> Vec<SweepParams> {
    if combinations.len() <= max {
        return combinations;
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let mut picked = rand::seq::index::sample(&mut rng, combinations.len(), max).into_vec();
    picked.sort_unstable();
    picked.into_iter().map(|i| combinations[i].clone()).collect()
}

#[derive(Debug, Clone)]
pub struct SweepOptions {
    /// Win rate (percent) the score is centred on (default: 80)
    pub target_win_rate: f64,
    /// Runs with fewer trades score INSUFFICIENT_TRADES_SCORE (default: 25)
    pub min_trades: u32,
}

impl Default for SweepOptions {
    fn default() -> Self {
        Self {
            target_win_rate: 80.0,
            min_trades: 25,
        }
    }
}

/// Higher is better: win rate near target, then profit factor, minus a
/// penalty for drawdown beyond 10%.
pub fn score(metrics: &PerformanceMetrics, options: &SweepOptions) -> f64 {
    if metrics.trade_count < options.min_trades {
        return INSUFFICIENT_TRADES_SCORE;
    }
    // no losing trades counts as a very high profit factor
    let pf = metrics.profit_factor.unwrap_or(99.0);
    let wr_score = 100.0 - (metrics.win_rate - options.target_win_rate).abs();
    let pf_score = (pf * 25.0).min(50.0);
    let dd_penalty = (metrics.max_drawdown_pct - 10.0).max(0.0) * 2.0;
    wr_score + pf_score - dd_penalty
}

/// Results from a single backtest run
#[derive(Debug, Clone, Serialize)]
pub struct SweepResult {
    pub params: SweepParams,
    pub metrics: PerformanceMetrics,
    pub score: f64,
}

fn rank(a: &SweepResult, b: &SweepResult) -> CmpOrdering {
    let desc = |x: f64, y: f64| y.partial_cmp(&x).unwrap_or(CmpOrdering::Equal);
    desc(a.score, b.score)
        .then_with(|| desc(a.metrics.win_rate, b.metrics.win_rate))
        .then_with(|| {
            desc(
                a.metrics.profit_factor.unwrap_or(f64::MAX),
                b.metrics.profit_factor.unwrap_or(f64::MAX),
            )
        })
}

/// Run every combination in parallel and return results best first. Ties
/// keep grid order, so the ranking is deterministic.
pub fn run_sweep(
    bars: &[Bar],
    base: &EngineConfig,
    combinations: &[SweepParams],
    options: &SweepOptions,
) -> Vec<SweepResult> {
    let total = combinations.len();
    info!("Running {} parameter combinations over {} bars", total, bars.len());
    let completed = AtomicUsize::new(0);
    let start = std::time::Instant::now();

    let mut results: Vec<SweepResult> = combinations
        .par_iter()
        .filter_map(|params| {
            let report = Backtester::new(params.apply(base))
                .and_then(|bt| bt.run(bars))
                .map_err(|e| warn!("Skipping {:?}: {}", params, e))
                .ok()?;

            let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
            if done % 50 == 0 || done == total {
                info!("[{}/{}] {:.1}s elapsed", done, total, start.elapsed().as_secs_f64());
            }

            Some(SweepResult {
                params: params.clone(),
                score: score(&report.metrics, options),
                metrics: report.metrics,
            })
        })
        .collect();

    results.sort_by(rank);
    results
}

/// Best combination, written for later use as a config overlay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestParams {
    pub params: SweepParams,
    pub metrics: PerformanceMetrics,
}

impl BestParams {
    pub fn from_result(result: &SweepResult) -> Self {
        Self {
            params: result.params.clone(),
            metrics: result.metrics.clone(),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("Malformed best params {}", path.display()))
    }
}

#[derive(Serialize)]
struct SweepRow {
    min_signal_strength: f64,
    min_delta: f64,
    rr_first: f64,
    rr_second: f64,
    min_delta_multiplier: f64,
    big_trade_edge: f64,
    big_trade_threshold: f64,
    trade_count: u32,
    win_rate: f64,
    profit_factor: Option<f64>,
    net_pnl: f64,
    max_drawdown_pct: f64,
    sharpe: f64,
    score: f64,
}

/// Write all results to CSV, one row per combination
pub fn write_results_csv(path: &Path, results: &[SweepResult]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    for r in results {
        let p = &r.params;
        let m = &r.metrics;
        writer.serialize(SweepRow {
            min_signal_strength: p.min_signal_strength,
            min_delta: p.min_delta,
            rr_first: p.rr_first,
            rr_second: p.rr_second,
            min_delta_multiplier: p.min_delta_multiplier,
            big_trade_edge: p.big_trade_edge,
            big_trade_threshold: p.big_trade_threshold,
            trade_count: m.trade_count,
            win_rate: m.win_rate,
            profit_factor: m.profit_factor,
            net_pnl: m.net_pnl,
            max_drawdown_pct: m.max_drawdown_pct,
            sharpe: m.sharpe,
            score: r.score,
        })?;
    }
    writer.flush()?;
    Ok(())
}

/// Print the top results in a readable format
pub fn print_summary(results: &[SweepResult], top: usize) {
    println!("\n=== SWEEP SUMMARY ===");
    println!("Combinations run: {}", results.len());
    for (i, r) in results.iter().take(top).enumerate() {
        let p = &r.params;
        let m = &r.metrics;
        let pf = m
            .profit_factor
            .map(|pf| format!("{:.2}", pf))
            .unwrap_or_else(|| "n/a".to_string());
        println!(
            "  {}. Score={:.1} WR={:.1}% PF={} P&L={:+.1} Trades={} DD={:.1}%",
            i + 1,
            r.score,
            m.win_rate,
            pf,
            m.net_pnl,
            m.trade_count,
            m.max_drawdown_pct
        );
        println!(
            "     strength={} delta={} rr={}/{} mult={} edge={} big={}",
            p.min_signal_strength,
            p.min_delta,
            p.rr_first,
            p.rr_second,
            p.min_delta_multiplier,
            p.big_trade_edge,
            p.big_trade_threshold
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample;
    use chrono::{Duration, TimeZone, Utc};

    fn metrics(trades: u32, win_rate: f64, pf: Option<f64>, dd_pct: f64) -> PerformanceMetrics {
        PerformanceMetrics {
            trade_count: trades,
            win_rate,
            profit_factor: pf,
            max_drawdown_pct: dd_pct,
            ..PerformanceMetrics::default()
        }
    }

    fn small_grid() -> SweepGrid {
        SweepGrid {
            min_signal_strength: vec![0.6, 0.7],
            min_delta: vec![300.0, 500.0],
            rr_first: vec![1.0],
            rr_second: vec![1.0, 2.0],
            min_delta_multiplier: vec![1.3],
            big_trade_edge: vec![100.0],
            big_trade_threshold: vec![500.0],
        }
    }

    #[test]
    fn test_score() {
        let opts = SweepOptions::default();
        assert_eq!(score(&metrics(24, 80.0, Some(3.0), 0.0), &opts), INSUFFICIENT_TRADES_SCORE);
        // 100 - 0 + min(75, 50) - 0
        assert_eq!(score(&metrics(30, 80.0, Some(3.0), 5.0), &opts), 150.0);
        // 100 - 20 + 25 - (15 - 10) * 2
        assert_eq!(score(&metrics(30, 60.0, Some(1.0), 15.0), &opts), 95.0);
        assert_eq!(score(&metrics(30, 100.0, None, 0.0), &opts), 130.0);
    }

    #[test]
    fn test_combinations_skip_inverted_targets() {
        let combos = small_grid().combinations();
        // rr_second 1.0 is not beyond rr_first 1.0
        assert_eq!(combos.len(), 4);
        assert!(combos.iter().all(|c| c.rr_second > c.rr_first));
        assert_eq!(SweepGrid::default().combinations().len(), 3 * 3 * 4 * 3 * 2 * 2);
    }

    #[test]
    fn test_sample_combinations_is_reproducible() {
        let all = SweepGrid::default().combinations();
        let a = sample_combinations(all.clone(), 10, 123);
        let b = sample_combinations(all.clone(), 10, 123);
        assert_eq!(a.len(), 10);
        assert_eq!(a, b);
        assert_eq!(sample_combinations(all.clone(), 10_000, 1).len(), all.len());
    }

    #[test]
    fn test_sweep_ranking_is_deterministic() {
        let start = Utc.with_ymd_and_hms(2025, 1, 6, 14, 30, 0).unwrap();
        let bars = sample::generate_bars(800, 9, start, Duration::minutes(1));
        let combos = small_grid().combinations();
        let opts = SweepOptions {
            min_trades: 0,
            ..SweepOptions::default()
        };
        let base = EngineConfig::default();

        let first = run_sweep(&bars, &base, &combos, &opts);
        let second = run_sweep(&bars, &base, &combos, &opts);
        assert_eq!(first.len(), combos.len());

        let order = |r: &[SweepResult]| r.iter().map(|x| x.params.clone()).collect::<Vec<_>>();
        assert_eq!(order(&first), order(&second));
        for pair in first.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }

    #[test]
    fn test_best_params_overlay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("best_params.json");
        let best = BestParams {
            params: SweepParams {
                min_signal_strength: 0.75,
                min_delta: 420.0,
                rr_first: 0.8,
                rr_second: 1.8,
                min_delta_multiplier: 1.2,
                big_trade_edge: 150.0,
                big_trade_threshold: 450.0,
            },
            metrics: metrics(40, 70.0, Some(1.6), 4.0),
        };
        best.save(&path).unwrap();
        assert_eq!(BestParams::load(&path).unwrap(), best);

        let overlay = std::fs::read_to_string(&path).unwrap();
        let config = EngineConfig::from_json_str("{}", Some(&overlay)).unwrap();
        assert_eq!(config.min_signal_strength, 0.75);
        assert_eq!(config.min_delta, 420.0);
        assert_eq!(config.rr_second, 1.8);
        assert_eq!(config.big_trade_threshold, 450.0);
        assert_eq!(config, best.params.apply(&EngineConfig::default()));
    }
}
