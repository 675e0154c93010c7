//! Trading Core - Shared trading logic for backtest and live polling
//!
//! This module contains the core engine components:
//! - Bars with aggressor volume split
//! - Volume profile (POC, value area, HVN/LVN)
//! - Order flow analysis (CVD, big trades, absorption)
//! - Market state detection
//! - Signal generation
//! - Trend and volatility-regime entry filters
//! - Risk gating and position sizing
//! - Trade lifecycle tracking
//! - Persisted state and the per-bar evaluation cycle

pub mod bars;
pub mod volume_profile;
pub mod order_flow;
pub mod market_state;
pub mod signal;
pub mod filters;
pub mod risk;
pub mod lifecycle;
pub mod state_store;
pub mod trader;

// Re-export commonly used types
pub use bars::{approximate_split, Aggressor, Bar};
pub use volume_profile::{ValueArea, VolumeProfile};
pub use order_flow::{Absorption, AnalyzerConfig, CvdTracker, FlowSnapshot, OrderFlowAnalyzer};
pub use market_state::{MarketState, MarketStateConfig, MarketStateResult};
pub use signal::{SetupKind, Side, Signal, SignalConfig, SignalGenerator, StopMode};
pub use filters::{RegimeDetector, TrendMaFilter};
pub use risk::{RiskConfig, RiskDecision, RiskManager, RiskState, SessionWindow};
pub use lifecycle::{
    ClosedTrade, ExitReason, IntrabarPriority, OpenTrade, TradeEvent, TradePolicy, TradeStatus,
};
pub use state_store::{CycleSummary, PersistedState, StateStore};
pub use trader::{CycleOutcome, Engine};
