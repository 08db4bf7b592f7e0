//! sweepbot: an automated liquidity-sweep trading engine for index futures
//!
//! Aggregates venue ticks into candles, detects two-stage liquidity-sweep
//! short setups with a causal state machine, sizes entries against equity
//! and drawdown, and places idempotent bracket orders through a pluggable
//! venue adapter. State is persisted across restarts and reconciled against
//! the venue on startup.

pub mod aggregator;
pub mod config;
pub mod connection;
pub mod engine;
pub mod events;
pub mod executor;
pub mod order;
pub mod risk;
pub mod setup;
pub mod store;
pub mod types;
pub mod venue;

pub use aggregator::CandleAggregator;
pub use config::{EngineConfig, ExecutionMode};
pub use connection::{ConnectionPhase, ConnectionStatus, ConnectionSupervisor};
pub use engine::Engine;
pub use events::{EngineEvent, EventBus, EventKind};
pub use executor::{OrderExecutor, SubmitOutcome};
pub use order::{BracketOrder, BracketStatus, OrderSide, Trade, TradeStatus};
pub use risk::{RiskManager, SizeDecision};
pub use setup::{SessionLevels, SetupState, SetupTracker};
pub use store::StateStore;
pub use types::{Candle, Tick};
pub use venue::{SimVenue, VenueClient};
