//! Venue adapter seam
//!
//! `VenueClient` is the single boundary between the engine and an execution
//! venue: connectivity, market data subscriptions, bracket submission, and
//! open-order/position queries for reconciliation. `SimVenue` implements it
//! in-process for simulation runs and tests, including scripted connect
//! failures for exercising the reconnect path.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::order::OrderSide;
use crate::types::Tick;

/// Status of an order as reported by the venue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VenueOrderStatus {
    Working,
    Filled,
    Cancelled,
    Rejected,
}

/// An order as the venue sees it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueOrder {
    pub venue_order_id: String,
    /// Client reference supplied at submission
    pub reference: String,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: i32,
    pub status: VenueOrderStatus,
}

/// A position as the venue sees it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenuePosition {
    pub symbol: String,
    /// Signed contracts; negative is short
    pub net_quantity: i32,
    pub avg_price: f64,
}

/// Bracket submission payload
#[derive(Debug, Clone)]
pub struct BracketRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: i32,
    pub entry_ref: String,
    pub stop_ref: String,
    pub target_ref: String,
    /// None means enter at market
    pub entry_price: Option<f64>,
    pub stop_price: f64,
    pub target_price: f64,
}

/// Venue acknowledgment of a bracket
#[derive(Debug, Clone)]
pub struct BracketAck {
    pub entry_order_id: String,
    pub stop_order_id: String,
    pub target_order_id: String,
}

/// Asynchronous notifications from the venue
#[derive(Debug, Clone)]
pub enum VenueEvent {
    /// A leg filled, identified by its client reference
    Fill {
        reference: String,
        price: f64,
        quantity: i32,
    },
    /// A leg changed status without filling
    OrderStatus {
        reference: String,
        status: VenueOrderStatus,
        reason: Option<String>,
    },
    /// Market data print for a subscribed symbol
    Tick(Tick),
}

/// Execution venue boundary
#[async_trait]
pub trait VenueClient: Send + Sync {
    async fn connect(&self) -> Result<()>;
    async fn disconnect(&self) -> Result<()>;

    /// Liveness probe used by the heartbeat loop
    async fn is_alive(&self) -> bool;

    async fn subscribe(&self, symbol: &str) -> Result<()>;
    async fn unsubscribe(&self, symbol: &str) -> Result<()>;

    /// Submit a bracket; the venue must treat leg references as client ids
    async fn submit_bracket(&self, request: BracketRequest) -> Result<BracketAck>;

    /// Open orders plus recently filled ones, for duplicate detection and
    /// startup reconciliation
    async fn query_open_orders(&self) -> Result<Vec<VenueOrder>>;

    async fn query_positions(&self) -> Result<Vec<VenuePosition>>;

    /// Subscribe to fills, status changes, and market data
    fn subscribe_events(&self) -> broadcast::Receiver<VenueEvent>;
}

/// In-process venue for simulation and tests
///
/// Brackets fill the entry immediately at the configured mark price. Connect
/// attempts can be scripted to fail a set number of times.
pub struct SimVenue {
    connected: AtomicBool,
    /// Remaining connect attempts that will fail
    connect_failures: AtomicU32,
    connect_attempts: AtomicU32,
    next_order_id: AtomicU64,
    /// Mark price in millipoints, updated by tests and tick injection
    mark_millipoints: AtomicU64,
    fill_entry_on_submit: AtomicBool,
    orders: Mutex<Vec<VenueOrder>>,
    positions: Mutex<HashMap<String, VenuePosition>>,
    subscriptions: Mutex<Vec<String>>,
    events: broadcast::Sender<VenueEvent>,
}

impl SimVenue {
    pub fn new(mark_price: f64) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            connected: AtomicBool::new(false),
            connect_failures: AtomicU32::new(0),
            connect_attempts: AtomicU32::new(0),
            next_order_id: AtomicU64::new(1),
            mark_millipoints: AtomicU64::new((mark_price * 1000.0) as u64),
            fill_entry_on_submit: AtomicBool::new(true),
            orders: Mutex::new(Vec::new()),
            positions: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(Vec::new()),
            events,
        }
    }

    /// Make the next `n` connect calls fail
    pub fn fail_next_connects(&self, n: u32) {
        self.connect_failures.store(n, Ordering::SeqCst);
    }

    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    /// Simulate an unannounced link drop
    pub fn drop_link(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn set_mark_price(&self, price: f64) {
        self.mark_millipoints
            .store((price * 1000.0) as u64, Ordering::SeqCst);
    }

    pub fn mark_price(&self) -> f64 {
        self.mark_millipoints.load(Ordering::SeqCst) as f64 / 1000.0
    }

    /// Disable the immediate entry fill (orders rest as Working)
    pub fn set_fill_entry_on_submit(&self, fill: bool) {
        self.fill_entry_on_submit.store(fill, Ordering::SeqCst);
    }

    /// Seed a venue-side order, for reconciliation and duplicate tests
    pub fn seed_order(&self, order: VenueOrder) {
        self.orders
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(order);
    }

    /// Seed a venue-side position, for reconciliation tests
    pub fn seed_position(&self, position: VenuePosition) {
        self.positions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(position.symbol.clone(), position);
    }

    /// Remove a venue-side position, simulating an external flatten
    pub fn clear_position(&self, symbol: &str) {
        self.positions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(symbol);
    }

    /// Inject a market data tick to subscribers
    pub fn push_tick(&self, tick: Tick) {
        self.set_mark_price(tick.price);
        let _ = self.events.send(VenueEvent::Tick(tick));
    }

    /// Fill a resting leg by client reference at `price`
    pub fn fill_reference(&self, reference: &str, price: f64, quantity: i32) {
        {
            let mut orders = self
                .orders
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(order) = orders.iter_mut().find(|o| o.reference == reference) {
                order.status = VenueOrderStatus::Filled;
            }
        }
        let _ = self.events.send(VenueEvent::Fill {
            reference: reference.to_string(),
            price,
            quantity,
        });
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn next_id(&self) -> String {
        format!("sim-{}", self.next_order_id.fetch_add(1, Ordering::SeqCst))
    }
}

#[async_trait]
impl VenueClient for SimVenue {
    async fn connect(&self) -> Result<()> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.connect_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.connect_failures.store(remaining - 1, Ordering::SeqCst);
            bail!("simulated connect failure ({} more scripted)", remaining - 1);
        }
        self.connected.store(true, Ordering::SeqCst);
        info!("SimVenue connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        info!("SimVenue disconnected");
        Ok(())
    }

    async fn is_alive(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn subscribe(&self, symbol: &str) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            bail!("not connected");
        }
        let mut subs = self
            .subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !subs.iter().any(|s| s == symbol) {
            subs.push(symbol.to_string());
        }
        debug!("SimVenue subscribed to {}", symbol);
        Ok(())
    }

    async fn unsubscribe(&self, symbol: &str) -> Result<()> {
        self.subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .retain(|s| s != symbol);
        Ok(())
    }

    async fn submit_bracket(&self, request: BracketRequest) -> Result<BracketAck> {
        if !self.connected.load(Ordering::SeqCst) {
            bail!("not connected");
        }

        let ack = BracketAck {
            entry_order_id: self.next_id(),
            stop_order_id: self.next_id(),
            target_order_id: self.next_id(),
        };

        {
            let mut orders = self
                .orders
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            for (id, reference, side, status) in [
                (
                    &ack.entry_order_id,
                    &request.entry_ref,
                    request.side,
                    VenueOrderStatus::Working,
                ),
                (
                    &ack.stop_order_id,
                    &request.stop_ref,
                    request.side.opposite(),
                    VenueOrderStatus::Working,
                ),
                (
                    &ack.target_order_id,
                    &request.target_ref,
                    request.side.opposite(),
                    VenueOrderStatus::Working,
                ),
            ] {
                orders.push(VenueOrder {
                    venue_order_id: id.clone(),
                    reference: reference.clone(),
                    symbol: request.symbol.clone(),
                    side,
                    quantity: request.quantity,
                    status,
                });
            }
        }

        if self.fill_entry_on_submit.load(Ordering::SeqCst) {
            let fill_price = request.entry_price.unwrap_or_else(|| self.mark_price());
            let signed = match request.side {
                OrderSide::Buy => request.quantity,
                OrderSide::Sell => -request.quantity,
            };
            self.positions
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .insert(
                    request.symbol.clone(),
                    VenuePosition {
                        symbol: request.symbol.clone(),
                        net_quantity: signed,
                        avg_price: fill_price,
                    },
                );
            self.fill_reference(&request.entry_ref, fill_price, request.quantity);
        }

        Ok(ack)
    }

    async fn query_open_orders(&self) -> Result<Vec<VenueOrder>> {
        if !self.connected.load(Ordering::SeqCst) {
            bail!("not connected");
        }
        Ok(self
            .orders
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .filter(|o| matches!(o.status, VenueOrderStatus::Working | VenueOrderStatus::Filled))
            .cloned()
            .collect())
    }

    async fn query_positions(&self) -> Result<Vec<VenuePosition>> {
        if !self.connected.load(Ordering::SeqCst) {
            bail!("not connected");
        }
        Ok(self
            .positions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .filter(|p| p.net_quantity != 0)
            .cloned()
            .collect())
    }

    fn subscribe_events(&self) -> broadcast::Receiver<VenueEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(quantity: i32) -> BracketRequest {
        BracketRequest {
            symbol: "NQ.c.0".to_string(),
            side: OrderSide::Sell,
            quantity,
            entry_ref: "swp-abc12345-1000-entry".to_string(),
            stop_ref: "swp-abc12345-1000-stop".to_string(),
            target_ref: "swp-abc12345-1000-target".to_string(),
            entry_price: None,
            stop_price: 15307.0,
            target_price: 15244.0,
        }
    }

    #[tokio::test]
    async fn test_scripted_connect_failures() {
        let venue = SimVenue::new(15290.0);
        venue.fail_next_connects(2);

        assert!(venue.connect().await.is_err());
        assert!(venue.connect().await.is_err());
        assert!(venue.connect().await.is_ok());
        assert!(venue.is_alive().await);
        assert_eq!(venue.connect_attempts(), 3);
    }

    #[tokio::test]
    async fn test_submit_fills_entry_and_opens_position() {
        let venue = SimVenue::new(15290.0);
        venue.connect().await.unwrap();
        let mut events = venue.subscribe_events();

        let ack = venue.submit_bracket(request(2)).await.unwrap();
        assert!(ack.entry_order_id.starts_with("sim-"));

        let positions = venue.query_positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].net_quantity, -2);
        assert_eq!(positions[0].avg_price, 15290.0);

        match events.recv().await.unwrap() {
            VenueEvent::Fill { reference, price, quantity } => {
                assert_eq!(reference, "swp-abc12345-1000-entry");
                assert_eq!(price, 15290.0);
                assert_eq!(quantity, 2);
            }
            other => panic!("expected Fill, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_open_orders_include_recently_filled() {
        let venue = SimVenue::new(15290.0);
        venue.connect().await.unwrap();
        venue.submit_bracket(request(1)).await.unwrap();

        let orders = venue.query_open_orders().await.unwrap();
        // Entry filled, stop and target still working: all three visible
        assert_eq!(orders.len(), 3);
        assert!(orders
            .iter()
            .any(|o| o.status == VenueOrderStatus::Filled));
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let venue = SimVenue::new(15290.0);
        assert!(venue.submit_bracket(request(1)).await.is_err());
        assert!(venue.subscribe("NQ.c.0").await.is_err());
        assert!(venue.query_open_orders().await.is_err());

        venue.connect().await.unwrap();
        venue.subscribe("NQ.c.0").await.unwrap();
        venue.drop_link();
        assert!(!venue.is_alive().await);
        assert!(venue.submit_bracket(request(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_subscriptions_deduplicate() {
        let venue = SimVenue::new(15290.0);
        venue.connect().await.unwrap();
        venue.subscribe("NQ.c.0").await.unwrap();
        venue.subscribe("NQ.c.0").await.unwrap();
        assert_eq!(venue.subscriptions(), vec!["NQ.c.0".to_string()]);

        venue.unsubscribe("NQ.c.0").await.unwrap();
        assert!(venue.subscriptions().is_empty());
    }
}
