//! Live polling loop
//!
//! Every `poll_secs` the runner fetches recent bars, feeds the ones it has
//! not seen to the engine, persists state after each bar and reports to the
//! sink. A cycle that is still running when the next tick fires causes that
//! tick to be skipped rather than queued.

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::error::DataError;
use crate::notify::EventSink;
use crate::sources::BarSource;
use crate::trading_core::bars::Bar;
use crate::trading_core::state_store::{PersistedState, StateStore};
use crate::trading_core::trader::Engine;

#[derive(Debug, Clone, PartialEq)]
pub enum CycleStatus {
    /// A previous cycle still held the session
    Skipped,
    /// Fetch failed or timed out; nothing was touched
    FetchFailed(String),
    /// Number of new bars processed
    Processed(usize),
}

struct LiveSession {
    engine: Engine,
    state: PersistedState,
    store: StateStore,
    warmed: bool,
}

pub struct LiveRunner<S, K> {
    config: Arc<EngineConfig>,
    source: Arc<S>,
    sink: Arc<K>,
    session: Arc<Mutex<LiveSession>>,
}

impl<S, K> Clone for LiveRunner<S, K> {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            source: Arc::clone(&self.source),
            sink: Arc::clone(&self.sink),
            session: Arc::clone(&self.session),
        }
    }
}

/// Split fetched bars into warm-up history and bars still to evaluate.
///
/// Without a usable `last_bar_ts` only the newest bar is evaluated.
fn split_new(
    bars: Vec<Bar>,
    last_bar_ts: Option<DateTime<Utc>>,
    warmed: bool,
) -> (Vec<Bar>, Vec<Bar>) {
    let (history, fresh): (Vec<Bar>, Vec<Bar>) = match last_bar_ts {
        Some(last) => bars.into_iter().partition(|b| b.timestamp <= last),
        None => (Vec::new(), bars),
    };
    if warmed {
        return (Vec::new(), fresh);
    }
    if history.is_empty() && fresh.len() > 1 {
        let mut history = fresh;
        let newest = history.split_off(history.len() - 1);
        return (history, newest);
    }
    (history, fresh)
}

impl<S, K> LiveRunner<S, K>
where
    S: BarSource + 'static,
    K: EventSink + 'static,
{
    pub fn new(config: EngineConfig, source: S, sink: K, store: StateStore) -> Result<Self> {
        config.validate()?;
        let engine = Engine::new(&config)?;
        let state = store.load(config.account_balance);
        info!(
            "Live runner ready: {} {} | balance {:.2} | open trade: {}",
            config.symbol,
            config.interval,
            state.balance,
            state.open_trade.is_some()
        );
        Ok(Self {
            config: Arc::new(config),
            source: Arc::new(source),
            sink: Arc::new(sink),
            session: Arc::new(Mutex::new(LiveSession {
                engine,
                state,
                store,
                warmed: false,
            })),
        })
    }

    /// Snapshot of the current state; waits for a running cycle
    pub async fn state(&self) -> PersistedState {
        self.session.lock().await.state.clone()
    }

    async fn fetch(&self) -> Result<Vec<Bar>, DataError> {
        let secs = self.config.fetch_timeout_secs;
        let fetch = self
            .source
            .fetch(&self.config.symbol, &self.config.interval, self.config.fetch_limit);
        match tokio::time::timeout(Duration::from_secs(secs), fetch).await {
            Ok(Ok(bars)) => Ok(bars),
            Ok(Err(e)) => Err(DataError::Provider(format!("{:#}", e))),
            Err(_) => Err(DataError::FetchTimeout { secs }),
        }
    }

    /// Run one evaluation cycle unless another is in progress.
    pub async fn try_cycle(&self) -> CycleStatus {
        let Ok(mut guard) = self.session.try_lock() else {
            debug!("Previous cycle still running, skipping tick");
            return CycleStatus::Skipped;
        };
        let session = &mut *guard;

        let bars = match self.fetch().await {
            Ok(bars) => bars,
            Err(e) => {
                warn!("Cycle skipped: {}", e);
                return CycleStatus::FetchFailed(e.to_string());
            }
        };

        let (history, fresh) = split_new(bars, session.state.last_bar_ts, session.warmed);
        if !session.warmed {
            let accepted = session.engine.warm_up(&history);
            info!("Warm-up: {} bars, {} to evaluate", accepted, fresh.len());
            session.warmed = true;
        }

        let mut processed = 0;
        for bar in &fresh {
            let outcome = match session.engine.process_bar(bar, &mut session.state) {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!("Skipping bar: {}", e);
                    continue;
                }
            };
            processed += 1;

            if let Err(e) = session.store.save(&session.state) {
                error!("Failed to persist state: {:#}", e);
            }
            if outcome.signal.is_actionable() {
                self.sink.on_signal(&outcome.signal);
            }
            for event in &outcome.events {
                self.sink.on_trade_event(event);
            }
        }
        CycleStatus::Processed(processed)
    }

    /// Poll until `shutdown` completes. The cycle in flight at shutdown is
    /// allowed to finish.
    pub async fn run<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.poll_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        info!("Polling every {}s", self.config.poll_secs);
        let mut in_flight: Option<JoinHandle<CycleStatus>> = None;

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
                _ = ticker.tick() => {
                    let runner = self.clone();
                    let handle = tokio::spawn(async move {
                        let status = runner.try_cycle().await;
                        match &status {
                            CycleStatus::Processed(n) if *n > 0 => debug!("Processed {} bars", n),
                            CycleStatus::Skipped => info!("Tick skipped: cycle still running"),
                            _ => {}
                        }
                        status
                    });
                    if let Some(previous) = in_flight.replace(handle) {
                        if previous.is_finished() {
                            previous.await?;
                        }
                    }
                }
            }
        }

        if let Some(handle) = in_flight {
            handle.await?;
        }
        // wait for any cycle still holding the session
        let state = self.state().await;
        info!(
            "Stopped | balance {:.2} | open trade: {}",
            state.balance,
            state.open_trade.is_some()
        );
        Ok(())
    }
}
