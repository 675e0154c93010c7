//! Backtest / replay engine
//!
//! Feeds a bar series through the same evaluation cycle the live loop uses,
//! one bar at a time with no lookahead, and summarizes the closed trades.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::ConfigError;
use crate::trading_core::bars::Bar;
use crate::trading_core::lifecycle::{ClosedTrade, TradeEvent};
use crate::trading_core::state_store::PersistedState;
use crate::trading_core::trader::Engine;

/// Summary statistics over closed trades
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub trade_count: u32,
    pub wins: u32,
    pub losses: u32,
    pub breakevens: u32,
    /// Percent, 0-100
    pub win_rate: f64,
    pub gross_profit: f64,
    /// Positive sum of losing PnL
    pub gross_loss: f64,
    /// None when there were no losing trades
    pub profit_factor: Option<f64>,
    pub net_pnl: f64,
    pub avg_win: f64,
    /// Negative average of losing PnL
    pub avg_loss: f64,
    pub max_drawdown: f64,
    /// Max drawdown as percent of the equity peak
    pub max_drawdown_pct: f64,
    /// Per-trade mean / std of PnL, not annualized
    pub sharpe: f64,
    pub initial_balance: f64,
    pub final_balance: f64,
}

#[derive(Debug, Clone, Default)]
pub struct BacktestReport {
    pub metrics: PerformanceMetrics,
    pub trades: Vec<ClosedTrade>,
    /// Balance after each closed trade, starting with the initial balance
    pub equity_curve: Vec<f64>,
    /// Rejected actionable signals grouped by reason
    pub rejections: BTreeMap<String, u32>,
    /// Actionable signals produced
    pub signals: u32,
    pub invalid_bars: u32,
    pub open_at_end: bool,
}

/// Compute metrics and the equity curve from closed trades in order.
pub fn compute_metrics(trades: &[ClosedTrade], initial_balance: f64) -> (PerformanceMetrics, Vec<f64>) {
    let mut equity_curve = Vec::with_capacity(trades.len() + 1);
    equity_curve.push(initial_balance);

    let mut m = PerformanceMetrics {
        trade_count: trades.len() as u32,
        initial_balance,
        final_balance: initial_balance,
        ..PerformanceMetrics::default()
    };

    let mut balance = initial_balance;
    let mut peak = initial_balance;
    for trade in trades {
        if trade.pnl > 0.0 {
            m.wins += 1;
            m.gross_profit += trade.pnl;
        } else if trade.pnl < 0.0 {
            m.losses += 1;
            m.gross_loss += -trade.pnl;
        } else {
            m.breakevens += 1;
        }

        balance += trade.pnl;
        equity_curve.push(balance);
        peak = peak.max(balance);
        let dd = peak - balance;
        if dd > m.max_drawdown {
            m.max_drawdown = dd;
            m.max_drawdown_pct = if peak > 0.0 { dd / peak * 100.0 } else { 0.0 };
        }
    }

    m.final_balance = balance;
    m.net_pnl = m.gross_profit - m.gross_loss;
    if m.trade_count == 0 {
        return (m, equity_curve);
    }

    m.win_rate = m.wins as f64 / m.trade_count as f64 * 100.0;
    m.profit_factor = (m.gross_loss > 0.0).then(|| m.gross_profit / m.gross_loss);
    if m.wins > 0 {
        m.avg_win = m.gross_profit / m.wins as f64;
    }
    if m.losses > 0 {
        m.avg_loss = -(m.gross_loss / m.losses as f64);
    }

    let n = m.trade_count as f64;
    let mean = trades.iter().map(|t| t.pnl).sum::<f64>() / n;
    let variance = trades.iter().map(|t| (t.pnl - mean).powi(2)).sum::<f64>() / n;
    let std_dev = variance.sqrt();
    m.sharpe = if std_dev > 0.0 { mean / std_dev } else { 0.0 };

    (m, equity_curve)
}

/// Group rejection reasons by their leading text so counts don't split on
/// embedded numbers.
fn reason_key(reason: &str) -> String {
    let cut = reason
        .find(|c: char| c == '(' || c == ':' || c.is_ascii_digit())
        .unwrap_or(reason.len());
    reason[..cut]
        .trim_end_matches(|c: char| c == ' ' || c == '-')
        .to_string()
}

pub struct Backtester {
    config: EngineConfig,
}

impl Backtester {
    pub fn new(config: EngineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Replay `bars` in order from a fresh state.
    pub fn run(&self, bars: &[Bar]) -> Result<BacktestReport, ConfigError> {
        let mut engine = Engine::new(&self.config)?;
        let initial_balance = self.config.account_balance;
        let mut state = PersistedState::new(initial_balance);
        let mut report = BacktestReport::default();

        for bar in bars {
            let outcome = match engine.process_bar(bar, &mut state) {
                Ok(outcome) => outcome,
                Err(e) => {
                    debug!("Skipping bar: {}", e);
                    report.invalid_bars += 1;
                    continue;
                }
            };

            if outcome.signal.is_actionable() {
                report.signals += 1;
                match &outcome.decision {
                    Some(d) if !d.approved => {
                        *report.rejections.entry(reason_key(&d.reason)).or_insert(0) += 1;
                    }
                    None => {
                        *report
                            .rejections
                            .entry("trade already open".to_string())
                            .or_insert(0) += 1;
                    }
                    Some(_) => {}
                }
            }

            for event in outcome.events {
                if let TradeEvent::Closed(closed) = event {
                    report.trades.push(closed);
                }
            }
        }

        if report.invalid_bars > 0 {
            warn!("Skipped {} invalid bars", report.invalid_bars);
        }
        report.open_at_end = state.open_trade.is_some();
        let (metrics, equity_curve) = compute_metrics(&report.trades, initial_balance);
        report.metrics = metrics;
        report.equity_curve = equity_curve;

        info!(
            "Backtest: {} bars | {} signals | {} trades | PnL {:.2}",
            bars.len(),
            report.signals,
            report.metrics.trade_count,
            report.metrics.net_pnl
        );
        Ok(report)
    }
}

/// Export closed trades as CSV
pub fn write_trades_csv(path: &Path, trades: &[ClosedTrade]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    for trade in trades {
        writer.serialize(trade).context("Failed to write trade row")?;
    }
    writer.flush()?;
    Ok(())
}

/// Print a report in a readable format
pub fn print_report(report: &BacktestReport) {
    let m = &report.metrics;
    println!("\n=== BACKTEST RESULTS ===");
    println!("Total Trades:      {}", m.trade_count);
    println!("Wins:              {} ({:.1}%)", m.wins, m.win_rate);
    println!("Losses:            {}", m.losses);
    println!("Breakevens:        {}", m.breakevens);
    match m.profit_factor {
        Some(pf) => println!("Profit Factor:     {:.2}", pf),
        None => println!("Profit Factor:     n/a (no losses)"),
    }
    println!("Sharpe (per trade): {:.2}", m.sharpe);
    println!("Net P&L:           ${:.2}", m.net_pnl);
    println!("Avg Win:           ${:.2}", m.avg_win);
    println!("Avg Loss:          ${:.2}", m.avg_loss);
    println!("Max Drawdown:      ${:.2} ({:.2}%)", m.max_drawdown, m.max_drawdown_pct);
    println!("Balance:           ${:.2} -> ${:.2}", m.initial_balance, m.final_balance);
    println!();
    println!("Signals:           {}", report.signals);
    println!("Invalid bars:      {}", report.invalid_bars);
    if report.open_at_end {
        println!("Trade still open at end of data");
    }
    if !report.rejections.is_empty() {
        println!("\nRejections:");
        for (reason, count) in &report.rejections {
            println!("  {:<28} {}", reason, count);
        }
    }
}
