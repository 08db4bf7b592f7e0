//! Engine orchestration
//!
//! Owns the full decision path: tick in, candle out, setup transitions,
//! risk sizing, bracket submission. The path runs inline on one task so a
//! candle's consequences are fully applied before the next candle is
//! processed; the event bus only feeds observers.

use anyhow::{Context, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::aggregator::CandleAggregator;
use crate::config::EngineConfig;
use crate::connection::{ConnectionPhase, ConnectionSupervisor};
use crate::events::{EngineEvent, EventBus};
use crate::executor::{OrderExecutor, SubmitOutcome};
use crate::order::TradeStatus;
use crate::risk::{RiskManager, SizeDecision};
use crate::setup::{SessionLevels, SessionWarmup, SetupCandidate, SetupTracker, SetupTransition};
use crate::store::StateStore;
use crate::types::{Candle, Tick};
use crate::venue::{VenueClient, VenueEvent};

/// How many recent candles feed the volatility estimate
const VOLATILITY_WINDOW: usize = 20;

/// The trading engine: one per process
pub struct Engine {
    config: EngineConfig,
    bus: Arc<EventBus>,
    venue: Arc<dyn VenueClient>,
    supervisor: Arc<ConnectionSupervisor>,
    store: Arc<StateStore>,
    aggregator: CandleAggregator,
    trackers: HashMap<String, SetupTracker>,
    risk: RiskManager,
    executor: OrderExecutor,
    /// Overnight candle collection per symbol while levels are unknown
    warmups: HashMap<String, SessionWarmup>,
    /// Recent completed candles per symbol, for the volatility estimate
    recent_candles: HashMap<String, VecDeque<Candle>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Engine {
    pub fn new(config: EngineConfig, venue: Arc<dyn VenueClient>) -> Result<Self> {
        let bus = Arc::new(EventBus::new(config.event_history));
        let store = Arc::new(StateStore::new(&config.state_dir)?);
        let supervisor = Arc::new(ConnectionSupervisor::new(
            config.supervisor_config(),
            venue.clone(),
            bus.clone(),
        ));
        let executor = OrderExecutor::new(
            venue.clone(),
            supervisor.clone(),
            store.clone(),
            bus.clone(),
            config.point_value,
        );
        let risk = RiskManager::new(config.risk_config(), config.starting_equity);
        let aggregator = CandleAggregator::new(config.candle_secs, config.max_gap_fill);

        let mut trackers = HashMap::new();
        for symbol in &config.symbols {
            trackers.insert(
                symbol.clone(),
                SetupTracker::new(symbol, config.tracker_config()),
            );
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            config,
            bus,
            venue,
            supervisor,
            store,
            aggregator,
            trackers,
            risk,
            executor,
            warmups: HashMap::new(),
            recent_candles: HashMap::new(),
            shutdown_tx,
            shutdown_rx,
        })
    }

    pub fn bus(&self) -> Arc<EventBus> {
        self.bus.clone()
    }

    pub fn supervisor(&self) -> Arc<ConnectionSupervisor> {
        self.supervisor.clone()
    }

    /// Handle for requesting shutdown from outside the run loop
    pub fn shutdown_handle(&self) -> watch::Sender<bool> {
        self.shutdown_tx.clone()
    }

    pub fn executor(&self) -> &OrderExecutor {
        &self.executor
    }

    pub fn risk(&self) -> &RiskManager {
        &self.risk
    }

    /// Restore persisted state, connect, subscribe, and reconcile
    pub async fn start(&mut self) -> Result<()> {
        info!(
            "Starting engine in {} mode for {:?}",
            self.config.mode, self.config.symbols
        );

        // Rehydrate before touching the venue so reconciliation sees the
        // pre-crash view.
        if let Some(snapshot) = self.store.load_risk().await? {
            info!(
                "Restored risk snapshot: equity {:.2}, halted {}",
                snapshot.equity, snapshot.halted
            );
            self.risk = RiskManager::restore(self.config.risk_config(), snapshot);
        }
        self.executor.restore().await?;
        let setups = self.store.active_setups().await?;
        if !setups.is_empty() {
            info!("Restored {} active setup(s)", setups.len());
            for tracker in self.trackers.values_mut() {
                tracker.restore(setups.clone());
            }
        }

        if let (Some(high), Some(low)) = (
            self.config.session_high_override,
            self.config.session_low_override,
        ) {
            for tracker in self.trackers.values_mut() {
                tracker.set_session_levels(SessionLevels {
                    session_high: high,
                    session_low: low,
                });
            }
        }

        self.supervisor.connect().await?;
        for symbol in &self.config.symbols {
            self.supervisor.subscribe(symbol).await?;
        }

        self.reconcile().await?;
        Ok(())
    }

    /// Supply reference levels computed from prior-session history
    pub fn set_session_levels(&mut self, symbol: &str, levels: SessionLevels) {
        if let Some(tracker) = self.trackers.get_mut(symbol) {
            tracker.set_session_levels(levels);
        }
    }

    /// Compare local open trades against venue positions at startup
    ///
    /// A venue position with no local trade is never adopted: it raises a
    /// critical alert for the operator. A local open trade with no venue
    /// position was closed while we were down and is finalized as such.
    pub async fn reconcile(&mut self) -> Result<()> {
        let positions = self
            .venue
            .query_positions()
            .await
            .context("querying positions for reconciliation")?;
        let open_trades = self.store.open_trades().await?;

        for position in &positions {
            let covered = open_trades.iter().any(|t| t.symbol == position.symbol);
            if !covered {
                error!(
                    "Reconciliation: venue holds {} x{} with no local trade; refusing to adopt",
                    position.symbol, position.net_quantity
                );
                self.bus
                    .publish_and_wait(EngineEvent::ReconciliationAlert {
                        symbol: position.symbol.clone(),
                        detail: format!(
                            "venue position {} contracts at {:.2} has no local record",
                            position.net_quantity, position.avg_price
                        ),
                    })
                    .await;
            }
        }

        for trade in &open_trades {
            let held = positions.iter().any(|p| p.symbol == trade.symbol);
            if !held {
                warn!(
                    "Reconciliation: local open trade on {} has no venue position; finalizing as externally closed",
                    trade.symbol
                );
                self.executor.close_trade_externally(trade.setup_id).await?;
            }
        }
        Ok(())
    }

    /// Main loop: venue events in, decisions out; exits on shutdown signal
    pub async fn run(&mut self) -> Result<()> {
        let mut events = self.venue.subscribe_events();
        let mut shutdown = self.shutdown_rx.clone();

        let mut heartbeat = tokio::spawn(
            self.supervisor
                .clone()
                .heartbeat_loop(self.shutdown_rx.clone()),
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Shutdown requested");
                        break;
                    }
                }
                event = events.recv() => match event {
                    Ok(VenueEvent::Tick(tick)) => {
                        if let Err(e) = self.on_tick(&tick).await {
                            error!("Tick processing failed: {:#}", e);
                        }
                    }
                    Ok(other) => {
                        match self.executor.handle_venue_event(&other).await {
                            Ok(Some(closed)) => self.realize(&closed).await?,
                            Ok(None) => {}
                            Err(e) => error!("Venue event handling failed: {:#}", e),
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("Venue event stream lagged, {} event(s) missed", missed);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        warn!("Venue event stream closed");
                        break;
                    }
                },
            }

            if self.supervisor.status().phase == ConnectionPhase::SafeMode {
                error!("Safe mode active; run loop stopping");
                break;
            }
        }

        // Signal first so the heartbeat can finish any in-flight venue call,
        // then give it a bounded window before forcing it.
        let _ = self.shutdown_tx.send(true);
        if tokio::time::timeout(
            Duration::from_secs(self.config.shutdown_timeout_secs),
            &mut heartbeat,
        )
        .await
        .is_err()
        {
            warn!("Heartbeat task did not stop inside the budget; aborting it");
            heartbeat.abort();
        }
        self.shutdown().await
    }

    /// Fold one tick; drive the full decision path for completed candles
    pub async fn on_tick(&mut self, tick: &Tick) -> Result<()> {
        let completed = self.aggregator.on_tick(tick);
        for candle in completed {
            self.on_candle(&candle).await?;
        }
        Ok(())
    }

    /// Route a non-tick venue event through execution, realizing P&L on
    /// closed trades. The run loop does this internally; replay drivers call
    /// it directly.
    pub async fn process_venue_event(&mut self, event: &VenueEvent) -> Result<()> {
        if let Some(closed) = self.executor.handle_venue_event(event).await? {
            self.realize(&closed).await?;
        }
        Ok(())
    }

    /// Apply one completed candle end to end
    pub async fn on_candle(&mut self, candle: &Candle) -> Result<()> {
        self.bus.publish(EngineEvent::CandleCompleted {
            candle: candle.clone(),
        });

        let window = self
            .recent_candles
            .entry(candle.symbol.clone())
            .or_default();
        window.push_back(candle.clone());
        while window.len() > VOLATILITY_WINDOW {
            window.pop_front();
        }

        let tracker = match self.trackers.get_mut(&candle.symbol) {
            Some(tracker) => tracker,
            None => return Ok(()),
        };

        // No explicit levels yet: derive them from the overnight window
        if tracker.session_levels().is_none() {
            let warmup = self.warmups.entry(candle.symbol.clone()).or_default();
            if let Some(levels) = warmup.observe(candle) {
                tracker.set_session_levels(levels);
            }
        }

        let transitions = tracker.process_candle(candle);

        for transition in transitions {
            self.on_transition(&candle.symbol, transition).await?;
        }
        self.persist_setups().await?;
        Ok(())
    }

    async fn on_transition(&mut self, symbol: &str, transition: SetupTransition) -> Result<()> {
        match transition {
            SetupTransition::EntryTriggered {
                setup_id,
                entry,
                stop,
                target,
            } => {
                self.bus.publish(EngineEvent::SetupDetected {
                    setup_id,
                    symbol: symbol.to_string(),
                    entry,
                    stop,
                    target,
                });
                self.try_enter(symbol, setup_id, entry, stop).await?;
            }
            SetupTransition::Invalidated { setup_id, reason } => {
                self.bus.publish(EngineEvent::SetupInvalidated {
                    setup_id,
                    symbol: symbol.to_string(),
                    reason,
                });
            }
            SetupTransition::Liq1Swept { .. }
            | SetupTransition::ConsolBroken { .. }
            | SetupTransition::Liq2Confirmed { .. } => {}
        }
        Ok(())
    }

    async fn try_enter(
        &mut self,
        symbol: &str,
        setup_id: Uuid,
        entry: f64,
        stop: f64,
    ) -> Result<()> {
        // One open position per symbol
        if self.executor.open_trade(symbol).is_some() {
            info!(
                "Setup {} skipped: position already open on {}",
                setup_id, symbol
            );
            return Ok(());
        }

        let volatility = self.volatility(symbol);
        let quantity = match self.risk.size_position(entry, stop, volatility) {
            SizeDecision::Units(q) if q > 0 => q,
            SizeDecision::Units(_) => {
                info!("Setup {} skipped: risk sizing returned zero", setup_id);
                return Ok(());
            }
            SizeDecision::Halted { drawdown_pct } => {
                warn!(
                    "Setup {} refused: drawdown halt at {:.1}%",
                    setup_id,
                    drawdown_pct * 100.0
                );
                return Ok(());
            }
        };

        let setup = match self
            .trackers
            .get(symbol)
            .and_then(|t| t.get(&setup_id))
            .cloned()
        {
            Some(s) => s,
            None => return Ok(()),
        };

        match self.executor.submit(&setup, quantity).await {
            Ok(SubmitOutcome::Submitted(_)) | Ok(SubmitOutcome::Duplicate { .. }) => {}
            Err(e) => {
                // Already published as OrderRejected; the engine keeps running
                warn!("Submission for setup {} failed: {:#}", setup_id, e);
            }
        }
        Ok(())
    }

    /// Mean candle range over the recent window, when enough history exists
    fn volatility(&self, symbol: &str) -> Option<f64> {
        let window = self.recent_candles.get(symbol)?;
        if window.len() < VOLATILITY_WINDOW / 2 {
            return None;
        }
        let sum: f64 = window.iter().map(|c| c.range()).sum();
        Some(sum / window.len() as f64)
    }

    /// Apply a closed trade's realized P&L to the risk manager
    async fn realize(&mut self, trade: &crate::order::Trade) -> Result<()> {
        if trade.status == TradeStatus::Closed {
            if let Some(pnl) = trade.pnl_dollars(self.config.point_value) {
                self.risk.record_pnl(pnl);
                self.store.save_risk(&self.risk.snapshot()).await?;
            }
        }
        Ok(())
    }

    async fn persist_setups(&self) -> Result<()> {
        let mut setups: HashMap<Uuid, SetupCandidate> = HashMap::new();
        for tracker in self.trackers.values() {
            for candidate in tracker.all_candidates() {
                setups.insert(candidate.id, candidate.clone());
            }
        }
        self.store.save_setups(&setups).await
    }

    /// Invalidate all active setups at session close
    pub async fn end_session(&mut self) -> Result<()> {
        let mut all = Vec::new();
        for tracker in self.trackers.values_mut() {
            let symbol = tracker.symbol().to_string();
            for transition in tracker.end_session() {
                all.push((symbol.clone(), transition));
            }
        }
        for (symbol, transition) in all {
            self.on_transition(&symbol, transition).await?;
        }
        self.persist_setups().await?;
        Ok(())
    }

    /// Graceful shutdown inside the configured budget
    ///
    /// Finalizes open buckets, persists all state, disconnects, and drains
    /// the event bus so pending subscriber tasks finish. If the budget
    /// elapses, persistence continues best effort and disconnect is forced.
    pub async fn shutdown(&mut self) -> Result<()> {
        info!(
            "Shutting down (budget {}s)",
            self.config.shutdown_timeout_secs
        );
        let _ = self.shutdown_tx.send(true);

        let budget = Duration::from_secs(self.config.shutdown_timeout_secs);
        let sequence = async {
            let final_candles = self.aggregator.force_finalize_all();
            for candle in &final_candles {
                // Final partial candles complete the record but trigger no
                // new orders.
                self.bus.publish(EngineEvent::CandleCompleted {
                    candle: candle.clone(),
                });
            }
            self.persist_setups().await?;
            self.executor.persist_all().await?;
            self.store.save_risk(&self.risk.snapshot()).await?;
            self.supervisor.disconnect().await?;
            self.bus.drain().await;
            Ok::<(), anyhow::Error>(())
        };

        match tokio::time::timeout(budget, sequence).await {
            Ok(result) => {
                result?;
                info!("Shutdown complete; {}", self.executor.stats().summary());
            }
            Err(_) => {
                warn!("Shutdown budget elapsed; forcing disconnect");
                if let Err(e) = self.venue.disconnect().await {
                    error!("Forced disconnect failed: {:#}", e);
                }
            }
        }
        Ok(())
    }
}
