//! Order execution
//!
//! Turns a completed setup into exactly one venue bracket. Before any
//! submission the executor scans venue open and recently-filled orders for
//! the setup's idempotency key; a match means the bracket already exists and
//! submission is skipped. Brackets are persisted before the network call so
//! a crash between persist and ack is caught by the same scan on restart.

use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::connection::ConnectionSupervisor;
use crate::events::{EngineEvent, EventBus};
use crate::order::{
    idempotency_key, BracketOrder, BracketStatus, LegRole, OrderSide, OrderState, Trade,
};
use crate::setup::SetupCandidate;
use crate::store::StateStore;
use crate::venue::{BracketRequest, VenueClient, VenueEvent, VenueOrderStatus};

/// Outcome of a submission request
#[derive(Debug, Clone)]
pub enum SubmitOutcome {
    /// A new bracket went to the venue
    Submitted(Box<BracketOrder>),
    /// The venue already holds this setup's bracket; nothing was sent
    Duplicate { reference: String },
}

/// Running totals for the session
#[derive(Debug, Clone, Default)]
pub struct ExecutionStats {
    pub submitted: u32,
    pub duplicates_refused: u32,
    pub rejected: u32,
    pub trades_opened: u32,
    pub trades_closed: u32,
    pub wins: u32,
    pub losses: u32,
    pub realized_points: f64,
}

impl ExecutionStats {
    /// One-line session summary for the status log
    pub fn summary(&self) -> String {
        format!(
            "{} submitted, {} rejected, {} duplicate(s) refused, {}W/{}L, {:+.2} pts realized",
            self.submitted,
            self.rejected,
            self.duplicates_refused,
            self.wins,
            self.losses,
            self.realized_points
        )
    }
}

/// Places brackets and tracks them through fills to closed trades
pub struct OrderExecutor {
    venue: Arc<dyn VenueClient>,
    supervisor: Arc<ConnectionSupervisor>,
    store: Arc<StateStore>,
    bus: Arc<EventBus>,
    point_value: f64,
    brackets: HashMap<Uuid, BracketOrder>,
    trades: HashMap<Uuid, Trade>,
    stats: ExecutionStats,
}

impl OrderExecutor {
    pub fn new(
        venue: Arc<dyn VenueClient>,
        supervisor: Arc<ConnectionSupervisor>,
        store: Arc<StateStore>,
        bus: Arc<EventBus>,
        point_value: f64,
    ) -> Self {
        Self {
            venue,
            supervisor,
            store,
            bus,
            point_value,
            brackets: HashMap::new(),
            trades: HashMap::new(),
            stats: ExecutionStats::default(),
        }
    }

    /// Rehydrate brackets and trades persisted by a previous run
    pub async fn restore(&mut self) -> Result<()> {
        self.brackets = self.store.load_brackets().await?;
        self.trades = self.store.load_trades().await?;
        let live = self.brackets.values().filter(|b| !b.is_terminal()).count();
        if live > 0 || !self.trades.is_empty() {
            info!(
                "Restored {} bracket(s) ({} live) and {} trade(s)",
                self.brackets.len(),
                live,
                self.trades.len()
            );
        }
        Ok(())
    }

    pub fn brackets(&self) -> &HashMap<Uuid, BracketOrder> {
        &self.brackets
    }

    pub fn trades(&self) -> &HashMap<Uuid, Trade> {
        &self.trades
    }

    pub fn open_trade(&self, symbol: &str) -> Option<&Trade> {
        self.trades
            .values()
            .find(|t| t.symbol == symbol && t.status == crate::order::TradeStatus::Open)
    }

    pub fn stats(&self) -> &ExecutionStats {
        &self.stats
    }

    /// Submit the bracket for a completed setup, exactly once
    ///
    /// The setup must carry computed entry/stop/target levels. Retries reuse
    /// the persisted bracket's references rather than minting new ones.
    pub async fn submit(
        &mut self,
        setup: &SetupCandidate,
        quantity: i32,
    ) -> Result<SubmitOutcome> {
        // A dead link gets one supervised reconnect before giving up;
        // orders are never queued against it.
        if self.supervisor.ensure_connected().is_err() {
            self.supervisor
                .reconnect()
                .await
                .context("venue unavailable for order submission")?;
            self.supervisor.ensure_connected()?;
        }

        let entry = setup.entry_price.context("setup has no entry price")?;
        let stop = setup.stop_price.context("setup has no stop price")?;
        let target = setup.target_price.context("setup has no target price")?;

        // Duplicate scan: the venue's open and recently-filled orders are the
        // source of truth for whether this setup already has a bracket.
        let key = idempotency_key(&setup.id);
        let existing = self
            .venue
            .query_open_orders()
            .await
            .context("querying open orders for duplicate scan")?;
        if let Some(order) = existing.iter().find(|o| o.reference.contains(&key)) {
            warn!(
                "Bracket for setup {} already at venue (reference {}); refusing duplicate",
                setup.id, order.reference
            );
            self.stats.duplicates_refused += 1;
            return Ok(SubmitOutcome::Duplicate {
                reference: order.reference.clone(),
            });
        }

        // Reuse the persisted bracket on retry so references stay fixed
        let mut bracket = match self.brackets.get(&setup.id) {
            Some(existing) if !existing.is_terminal() => existing.clone(),
            _ => BracketOrder::new(
                setup.id,
                &setup.symbol,
                OrderSide::Sell,
                quantity,
                entry,
                stop,
                target,
                Utc::now(),
            ),
        };

        // Persist before the network call; a crash after this point is
        // recovered by the duplicate scan, not by resubmitting blindly.
        self.brackets.insert(setup.id, bracket.clone());
        self.store.save_brackets(&self.brackets).await?;

        let request = BracketRequest {
            symbol: bracket.symbol.clone(),
            side: bracket.side,
            quantity: bracket.quantity,
            entry_ref: bracket.entry.reference.clone(),
            stop_ref: bracket.stop.reference.clone(),
            target_ref: bracket.target.reference.clone(),
            entry_price: None,
            stop_price: bracket.stop.price,
            target_price: bracket.target.price,
        };

        match self.venue.submit_bracket(request).await {
            Ok(ack) => {
                bracket.entry.venue_order_id = Some(ack.entry_order_id);
                bracket.stop.venue_order_id = Some(ack.stop_order_id);
                bracket.target.venue_order_id = Some(ack.target_order_id);
                for role in [LegRole::Entry, LegRole::Stop, LegRole::Target] {
                    bracket.leg_mut(role).state = OrderState::Working;
                }
                info!(
                    "Bracket {} submitted for {}: {} x{} stop {:.2} target {:.2}",
                    bracket.idempotency_key,
                    bracket.symbol,
                    bracket.side,
                    bracket.quantity,
                    bracket.stop.price,
                    bracket.target.price
                );
                self.stats.submitted += 1;

                self.brackets.insert(setup.id, bracket.clone());
                self.store.save_brackets(&self.brackets).await?;

                self.bus.publish(EngineEvent::OrderPlaced {
                    setup_id: setup.id,
                    reference: bracket.entry.reference.clone(),
                    side: bracket.side,
                    quantity: bracket.quantity,
                    stop: bracket.stop.price,
                    target: bracket.target.price,
                });
                Ok(SubmitOutcome::Submitted(Box::new(bracket)))
            }
            Err(e) => {
                warn!("Bracket submission for setup {} failed: {:#}", setup.id, e);
                bracket.status = BracketStatus::Rejected;
                self.stats.rejected += 1;
                self.brackets.insert(setup.id, bracket.clone());
                self.store.save_brackets(&self.brackets).await?;
                self.bus.publish(EngineEvent::OrderRejected {
                    setup_id: setup.id,
                    reference: bracket.entry.reference.clone(),
                    reason: format!("{:#}", e),
                });
                Err(e)
            }
        }
    }

    /// Apply a venue fill or status change
    ///
    /// Returns the closed trade when a stop or target fill flattens a
    /// position, so the caller can realize P&L.
    pub async fn handle_venue_event(&mut self, event: &VenueEvent) -> Result<Option<Trade>> {
        match event {
            VenueEvent::Fill {
                reference,
                price,
                quantity,
            } => self.handle_fill(reference, *price, *quantity).await,
            VenueEvent::OrderStatus {
                reference,
                status,
                reason,
            } => {
                self.handle_status(reference, *status, reason.as_deref())
                    .await?;
                Ok(None)
            }
            VenueEvent::Tick(_) => Ok(None),
        }
    }

    async fn handle_fill(
        &mut self,
        reference: &str,
        price: f64,
        quantity: i32,
    ) -> Result<Option<Trade>> {
        let (setup_id, role) = match self.find_leg(reference) {
            Some(found) => found,
            None => {
                warn!("Fill for unknown reference {}, ignoring", reference);
                return Ok(None);
            }
        };

        let bracket = match self.brackets.get_mut(&setup_id) {
            Some(b) => b,
            None => return Ok(None),
        };
        bracket.leg_mut(role).state = OrderState::Filled;

        let mut closed = None;
        match role {
            LegRole::Entry => {
                bracket.status = BracketStatus::PositionOpen;
                let trade = Trade::open(bracket, price, Utc::now());
                info!(
                    "Entry filled for {} at {:.2} x{}; position open",
                    bracket.idempotency_key, price, quantity
                );
                self.trades.insert(setup_id, trade);
                self.stats.trades_opened += 1;
            }
            LegRole::Stop | LegRole::Target => {
                bracket.status = BracketStatus::Complete;
                // The surviving protective leg is dead once the other fills
                let other = match role {
                    LegRole::Stop => LegRole::Target,
                    _ => LegRole::Stop,
                };
                if bracket.leg(other).state == OrderState::Working {
                    bracket.leg_mut(other).state = OrderState::Cancelled;
                }
                if let Some(trade) = self.trades.get_mut(&setup_id) {
                    trade.close(price, Utc::now());
                    info!(
                        "{} filled for {} at {:.2}; trade closed ({:+.2} pts)",
                        role,
                        bracket.idempotency_key,
                        price,
                        trade.pnl_points.unwrap_or(0.0)
                    );
                    self.stats.trades_closed += 1;
                    let pnl = trade.pnl_points.unwrap_or(0.0);
                    if pnl >= 0.0 {
                        self.stats.wins += 1;
                    } else {
                        self.stats.losses += 1;
                    }
                    self.stats.realized_points += pnl;
                    closed = Some(trade.clone());
                }
            }
        }

        self.store.save_brackets(&self.brackets).await?;
        self.store.save_trades(&self.trades).await?;

        self.bus.publish(EngineEvent::OrderFilled {
            setup_id,
            reference: reference.to_string(),
            leg: role,
            fill_price: price,
            quantity,
        });
        Ok(closed)
    }

    async fn handle_status(
        &mut self,
        reference: &str,
        status: VenueOrderStatus,
        reason: Option<&str>,
    ) -> Result<()> {
        let (setup_id, role) = match self.find_leg(reference) {
            Some(found) => found,
            None => return Ok(()),
        };
        let bracket = match self.brackets.get_mut(&setup_id) {
            Some(b) => b,
            None => return Ok(()),
        };

        match status {
            VenueOrderStatus::Working => {
                bracket.leg_mut(role).state = OrderState::Working;
            }
            VenueOrderStatus::Cancelled => {
                bracket.leg_mut(role).state = OrderState::Cancelled;
            }
            VenueOrderStatus::Rejected => {
                bracket.leg_mut(role).state = OrderState::Rejected;
                if role == LegRole::Entry {
                    bracket.status = BracketStatus::Rejected;
                }
                self.stats.rejected += 1;
                self.bus.publish(EngineEvent::OrderRejected {
                    setup_id,
                    reference: reference.to_string(),
                    reason: reason.unwrap_or("venue reject").to_string(),
                });
            }
            VenueOrderStatus::Filled => {
                // Fills arrive through the Fill event with a price
            }
        }
        self.store.save_brackets(&self.brackets).await?;
        Ok(())
    }

    fn find_leg(&self, reference: &str) -> Option<(Uuid, LegRole)> {
        self.brackets.iter().find_map(|(id, bracket)| {
            bracket.leg_for_reference(reference).map(|role| (*id, role))
        })
    }

    /// Finalize a locally-open trade the venue no longer holds
    pub async fn close_trade_externally(&mut self, setup_id: Uuid) -> Result<Option<Trade>> {
        let trade = match self.trades.get_mut(&setup_id) {
            Some(t) if t.status == crate::order::TradeStatus::Open => t,
            _ => return Ok(None),
        };
        trade.close_externally(Utc::now());
        let finalized = trade.clone();
        if let Some(bracket) = self.brackets.get_mut(&setup_id) {
            bracket.status = BracketStatus::Complete;
        }
        self.store.save_trades(&self.trades).await?;
        self.store.save_brackets(&self.brackets).await?;
        Ok(Some(finalized))
    }

    pub fn point_value(&self) -> f64 {
        self.point_value
    }

    /// Persist current brackets and trades (used at shutdown)
    pub async fn persist_all(&self) -> Result<()> {
        self.store.save_brackets(&self.brackets).await?;
        self.store.save_trades(&self.trades).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::SupervisorConfig;
    use crate::order::TradeStatus;
    use crate::setup::{SessionLevels, SetupState};
    use crate::venue::SimVenue;

    async fn harness() -> (
        tempfile::TempDir,
        Arc<SimVenue>,
        Arc<ConnectionSupervisor>,
        OrderExecutor,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::new(dir.path()).unwrap());
        let bus = Arc::new(EventBus::new(100));
        let venue = Arc::new(SimVenue::new(15290.0));
        let supervisor = Arc::new(ConnectionSupervisor::new(
            SupervisorConfig {
                base_delay_secs: 0,
                max_delay_secs: 0,
                ..Default::default()
            },
            venue.clone(),
            bus.clone(),
        ));
        supervisor.connect().await.unwrap();
        let executor = OrderExecutor::new(venue.clone(), supervisor.clone(), store, bus, 20.0);
        (dir, venue, supervisor, executor)
    }

    fn complete_setup() -> SetupCandidate {
        let mut setup = sample_setup();
        setup.state = SetupState::SetupComplete;
        setup.entry_price = Some(15286.0);
        setup.stop_price = Some(15307.0);
        setup.target_price = Some(15244.0);
        setup
    }

    fn sample_setup() -> SetupCandidate {
        // Walk a tracker far enough to own a real candidate, then adjust
        let mut tracker = crate::setup::SetupTracker::new("NQ.c.0", Default::default());
        tracker.set_session_levels(SessionLevels {
            session_high: 15280.0,
            session_low: 15200.0,
        });
        tracker.process_candle(&crate::types::Candle {
            symbol: "NQ.c.0".to_string(),
            timestamp: chrono::DateTime::from_timestamp(1_700_000_040, 0).unwrap(),
            open: 15275.0,
            high: 15286.0,
            low: 15270.0,
            close: 15285.0,
            volume: 100,
            tick_count: 10,
        });
        tracker.all_candidates()[0].clone()
    }

    #[tokio::test]
    async fn test_submit_places_one_bracket() {
        let (_dir, venue, _sup, mut executor) = harness().await;
        let setup = complete_setup();

        let outcome = executor.submit(&setup, 2).await.unwrap();
        let bracket = match outcome {
            SubmitOutcome::Submitted(b) => b,
            other => panic!("expected Submitted, got {:?}", other),
        };
        assert_eq!(bracket.quantity, 2);
        assert_eq!(bracket.side, OrderSide::Sell);
        assert!(bracket.entry.venue_order_id.is_some());

        let orders = venue.query_open_orders().await.unwrap();
        assert_eq!(orders.len(), 3);
    }

    #[tokio::test]
    async fn test_resubmission_refused_as_duplicate() {
        let (_dir, venue, _sup, mut executor) = harness().await;
        let setup = complete_setup();

        executor.submit(&setup, 1).await.unwrap();
        let before = venue.query_open_orders().await.unwrap().len();

        // Same setup submitted again: one live bracket, a Duplicate outcome
        let outcome = executor.submit(&setup, 1).await.unwrap();
        match outcome {
            SubmitOutcome::Duplicate { reference } => {
                assert!(reference.contains(&idempotency_key(&setup.id)));
            }
            other => panic!("expected Duplicate, got {:?}", other),
        }
        assert_eq!(venue.query_open_orders().await.unwrap().len(), before);
        assert_eq!(executor.stats().duplicates_refused, 1);
        assert_eq!(executor.stats().submitted, 1);
    }

    #[tokio::test]
    async fn test_duplicate_detected_across_restart() {
        let (dir, venue, supervisor, mut executor) = harness().await;
        let setup = complete_setup();
        executor.submit(&setup, 1).await.unwrap();

        // Fresh executor over the same store, as after a crash and restart
        let store = Arc::new(StateStore::new(dir.path()).unwrap());
        let bus = Arc::new(EventBus::new(100));
        let mut restarted =
            OrderExecutor::new(venue.clone(), supervisor, store, bus, 20.0);
        restarted.restore().await.unwrap();

        let outcome = restarted.submit(&setup, 1).await.unwrap();
        assert!(matches!(outcome, SubmitOutcome::Duplicate { .. }));
    }

    #[tokio::test]
    async fn test_entry_fill_opens_trade_and_exit_closes_it() {
        let (_dir, venue, _sup, mut executor) = harness().await;
        let setup = complete_setup();
        let mut events = venue.subscribe_events();

        executor.submit(&setup, 2).await.unwrap();
        // SimVenue fills the entry at the mark on submit
        let fill = events.recv().await.unwrap();
        executor.handle_venue_event(&fill).await.unwrap();

        let trade = executor.open_trade("NQ.c.0").expect("trade should be open");
        assert_eq!(trade.entry_price, 15290.0);
        assert_eq!(executor.stats().trades_opened, 1);

        // Target fill flattens and returns the closed trade
        let target_ref = executor.brackets()[&setup.id].target.reference.clone();
        venue.fill_reference(&target_ref, 15244.0, 2);
        let fill = events.recv().await.unwrap();
        let closed = executor.handle_venue_event(&fill).await.unwrap().unwrap();

        assert_eq!(closed.status, TradeStatus::Closed);
        assert_eq!(closed.pnl_points, Some(46.0));
        assert!(executor.open_trade("NQ.c.0").is_none());

        let bracket = &executor.brackets()[&setup.id];
        assert_eq!(bracket.status, BracketStatus::Complete);
        assert_eq!(bracket.stop.state, OrderState::Cancelled);
    }

    #[tokio::test]
    async fn test_submit_reconnects_dead_link_first() {
        let (_dir, venue, sup, mut executor) = harness().await;
        venue.drop_link();
        sup.disconnect().await.unwrap();

        // The supervised reconnect recovers the link before submission
        let setup = complete_setup();
        let outcome = executor.submit(&setup, 1).await.unwrap();
        assert!(matches!(outcome, SubmitOutcome::Submitted(_)));
        assert!(venue.is_alive().await);
    }

    #[tokio::test]
    async fn test_submit_refused_when_reconnect_exhausts() {
        let (_dir, venue, sup, mut executor) = harness().await;
        venue.drop_link();
        sup.disconnect().await.unwrap();
        venue.fail_next_connects(100);

        let setup = complete_setup();
        assert!(executor.submit(&setup, 1).await.is_err());
        assert_eq!(executor.stats().submitted, 0);
        assert_eq!(sup.status().phase, crate::connection::ConnectionPhase::SafeMode);
    }

    #[tokio::test]
    async fn test_incomplete_setup_refused() {
        let (_dir, _venue, _sup, mut executor) = harness().await;
        let setup = sample_setup(); // no computed levels
        assert!(executor.submit(&setup, 1).await.is_err());
    }

    #[tokio::test]
    async fn test_external_close_finalizes_without_pnl() {
        let (_dir, venue, _sup, mut executor) = harness().await;
        let setup = complete_setup();
        let mut events = venue.subscribe_events();

        executor.submit(&setup, 1).await.unwrap();
        let fill = events.recv().await.unwrap();
        executor.handle_venue_event(&fill).await.unwrap();

        let finalized = executor
            .close_trade_externally(setup.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(finalized.status, TradeStatus::ClosedExternally);
        assert!(finalized.pnl_points.is_none());

        // Idempotent: a second call is a no-op
        assert!(executor
            .close_trade_externally(setup.id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_unknown_reference_ignored() {
        let (_dir, _venue, _sup, mut executor) = harness().await;
        let result = executor
            .handle_venue_event(&VenueEvent::Fill {
                reference: "swp-nobody-0-entry".to_string(),
                price: 15290.0,
                quantity: 1,
            })
            .await
            .unwrap();
        assert!(result.is_none());
    }
}
