// Library crate - exports the engine and its adapters

pub mod backtest;
pub mod config;
pub mod error;
pub mod live;
pub mod notify;
pub mod sample;
pub mod sources;
pub mod sweep;
pub mod trading_core;

// Re-export commonly used types
pub use config::EngineConfig;
pub use error::{ConfigError, DataError};
pub use trading_core::{Bar, Engine, PersistedState, Signal, StateStore, TradeEvent};
