//! Order and trade domain types
//!
//! A completed setup becomes exactly one bracket order: a short entry with a
//! protective stop and a profit target. Every bracket carries an idempotency
//! key derived from its setup id, and every leg carries a client reference
//! fixed at the first submission attempt so retries never mint new identity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Order direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(&self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// Role of a leg within a bracket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LegRole {
    Entry,
    Stop,
    Target,
}

impl LegRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Entry => "entry",
            Self::Stop => "stop",
            Self::Target => "target",
        }
    }
}

impl std::fmt::Display for LegRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle of a single leg
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderState {
    /// Built locally, not yet sent
    Pending,
    /// Sent to the venue, no ack yet
    Submitted,
    /// Acknowledged and resting
    Working,
    Filled,
    Cancelled,
    Rejected,
}

/// One leg of a bracket
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderLeg {
    pub role: LegRole,
    /// Client reference, fixed at first submission and reused on retries
    pub reference: String,
    /// Venue-assigned id, known after ack
    pub venue_order_id: Option<String>,
    pub price: f64,
    pub state: OrderState,
}

/// Bracket lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BracketStatus {
    /// Sent to the venue, entry not yet filled
    Submitted,
    /// Entry filled; stop and target protect the open position
    PositionOpen,
    /// Stop or target filled, position flat
    Complete,
    Rejected,
}

/// Idempotency key for a setup's single bracket: "swp-" plus the first 8 hex
/// characters of the setup id. Stable across retries and restarts.
pub fn idempotency_key(setup_id: &Uuid) -> String {
    format!("swp-{}", &setup_id.simple().to_string()[..8])
}

/// A bracket order: short entry, protective stop, profit target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BracketOrder {
    pub setup_id: Uuid,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: i32,
    pub idempotency_key: String,
    /// Fixed at first submission attempt; part of every leg reference
    pub submitted_at: DateTime<Utc>,
    pub entry: OrderLeg,
    pub stop: OrderLeg,
    pub target: OrderLeg,
    pub status: BracketStatus,
}

impl BracketOrder {
    /// Build a bracket with leg references derived from the idempotency key
    /// and the first-attempt timestamp. Construct once per setup; reload from
    /// the store on retry instead of rebuilding.
    pub fn new(
        setup_id: Uuid,
        symbol: &str,
        side: OrderSide,
        quantity: i32,
        entry_price: f64,
        stop_price: f64,
        target_price: f64,
        submitted_at: DateTime<Utc>,
    ) -> Self {
        let key = idempotency_key(&setup_id);
        let leg = |role: LegRole, price: f64| OrderLeg {
            role,
            reference: format!("{}-{}-{}", key, submitted_at.timestamp_millis(), role),
            venue_order_id: None,
            price,
            state: OrderState::Pending,
        };
        Self {
            setup_id,
            symbol: symbol.to_string(),
            side,
            quantity,
            idempotency_key: key.clone(),
            submitted_at,
            entry: leg(LegRole::Entry, entry_price),
            stop: leg(LegRole::Stop, stop_price),
            target: leg(LegRole::Target, target_price),
            status: BracketStatus::Submitted,
        }
    }

    pub fn leg(&self, role: LegRole) -> &OrderLeg {
        match role {
            LegRole::Entry => &self.entry,
            LegRole::Stop => &self.stop,
            LegRole::Target => &self.target,
        }
    }

    pub fn leg_mut(&mut self, role: LegRole) -> &mut OrderLeg {
        match role {
            LegRole::Entry => &mut self.entry,
            LegRole::Stop => &mut self.stop,
            LegRole::Target => &mut self.target,
        }
    }

    /// Find the leg that owns a client reference
    pub fn leg_for_reference(&self, reference: &str) -> Option<LegRole> {
        [LegRole::Entry, LegRole::Stop, LegRole::Target]
            .into_iter()
            .find(|role| self.leg(*role).reference == reference)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, BracketStatus::Complete | BracketStatus::Rejected)
    }
}

/// Terminal state of a trade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeStatus {
    Open,
    Closed,
    /// Finalized from reconciliation: the venue shows no position for a
    /// locally-open trade, so it was closed while we were down
    ClosedExternally,
}

/// A position opened by a filled bracket entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub setup_id: Uuid,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: i32,
    pub entry_price: f64,
    pub exit_price: Option<f64>,
    pub stop_price: f64,
    pub target_price: f64,
    pub status: TradeStatus,
    /// Realized P&L in points per contract, set on close
    pub pnl_points: Option<f64>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Trade {
    pub fn open(bracket: &BracketOrder, fill_price: f64, at: DateTime<Utc>) -> Self {
        Self {
            setup_id: bracket.setup_id,
            symbol: bracket.symbol.clone(),
            side: bracket.side,
            quantity: bracket.quantity,
            entry_price: fill_price,
            exit_price: None,
            stop_price: bracket.stop.price,
            target_price: bracket.target.price,
            status: TradeStatus::Open,
            pnl_points: None,
            opened_at: at,
            closed_at: None,
        }
    }

    /// Record the exit fill and realize P&L in points per contract
    pub fn close(&mut self, exit_price: f64, at: DateTime<Utc>) {
        self.exit_price = Some(exit_price);
        self.pnl_points = Some(match self.side {
            OrderSide::Sell => self.entry_price - exit_price,
            OrderSide::Buy => exit_price - self.entry_price,
        });
        self.status = TradeStatus::Closed;
        self.closed_at = Some(at);
    }

    /// Finalize a trade the venue no longer holds a position for. The true
    /// exit price is unknown; P&L stays unset and the status records why.
    pub fn close_externally(&mut self, at: DateTime<Utc>) {
        self.status = TradeStatus::ClosedExternally;
        self.closed_at = Some(at);
    }

    /// Realized P&L in dollars, given the contract's point value
    pub fn pnl_dollars(&self, point_value: f64) -> Option<f64> {
        self.pnl_points
            .map(|points| points * point_value * self.quantity as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bracket() -> BracketOrder {
        BracketOrder::new(
            Uuid::new_v4(),
            "NQ.c.0",
            OrderSide::Sell,
            2,
            15286.0,
            15307.0,
            15244.0,
            Utc::now(),
        )
    }

    #[test]
    fn test_idempotency_key_is_stable() {
        let id = Uuid::new_v4();
        let a = idempotency_key(&id);
        let b = idempotency_key(&id);
        assert_eq!(a, b);
        assert!(a.starts_with("swp-"));
        assert_eq!(a.len(), 12);
    }

    #[test]
    fn test_leg_references_embed_key_and_role() {
        let b = bracket();
        for role in [LegRole::Entry, LegRole::Stop, LegRole::Target] {
            let leg = b.leg(role);
            assert!(leg.reference.starts_with(&b.idempotency_key));
            assert!(leg.reference.ends_with(role.as_str()));
            assert_eq!(leg.state, OrderState::Pending);
        }
        assert_eq!(b.leg_for_reference(&b.stop.reference), Some(LegRole::Stop));
        assert_eq!(b.leg_for_reference("swp-unknown"), None);
    }

    #[test]
    fn test_rebuilding_with_same_inputs_yields_same_references() {
        let id = Uuid::new_v4();
        let at = Utc::now();
        let a = BracketOrder::new(id, "NQ.c.0", OrderSide::Sell, 1, 15286.0, 15307.0, 15244.0, at);
        let b = BracketOrder::new(id, "NQ.c.0", OrderSide::Sell, 1, 15286.0, 15307.0, 15244.0, at);
        assert_eq!(a.entry.reference, b.entry.reference);
        assert_eq!(a.stop.reference, b.stop.reference);
        assert_eq!(a.target.reference, b.target.reference);
    }

    #[test]
    fn test_short_trade_pnl() {
        let b = bracket();
        let mut t = Trade::open(&b, 15286.0, Utc::now());
        assert_eq!(t.status, TradeStatus::Open);

        t.close(15244.0, Utc::now());
        assert_eq!(t.status, TradeStatus::Closed);
        assert_eq!(t.pnl_points, Some(42.0));
        // 42 points x $20 x 2 contracts
        assert_eq!(t.pnl_dollars(20.0), Some(1680.0));
    }

    #[test]
    fn test_short_trade_loss() {
        let b = bracket();
        let mut t = Trade::open(&b, 15286.0, Utc::now());
        t.close(15307.0, Utc::now());
        assert_eq!(t.pnl_points, Some(-21.0));
    }

    #[test]
    fn test_external_close_leaves_pnl_unset() {
        let b = bracket();
        let mut t = Trade::open(&b, 15286.0, Utc::now());
        t.close_externally(Utc::now());
        assert_eq!(t.status, TradeStatus::ClosedExternally);
        assert!(t.pnl_points.is_none());
        assert!(t.pnl_dollars(20.0).is_none());
        assert!(t.closed_at.is_some());
    }

    #[test]
    fn test_side_opposite() {
        assert_eq!(OrderSide::Sell.opposite(), OrderSide::Buy);
        assert_eq!(OrderSide::Buy.opposite(), OrderSide::Sell);
    }
}
