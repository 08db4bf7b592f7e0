//! Engine configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Execution mode determines whether orders go to a simulated or live venue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionMode {
    /// In-process simulated venue (no external connectivity)
    Simulation,
    /// Live trading through a wired venue adapter
    Live,
}

impl Default for ExecutionMode {
    fn default() -> Self {
        Self::Simulation
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Simulation => write!(f, "Simulation"),
            Self::Live => write!(f, "Live"),
        }
    }
}

/// Full engine configuration, supplied once at construction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Execution mode (simulation or live)
    pub mode: ExecutionMode,

    /// Symbols to trade (e.g., "NQ.c.0" for front month NQ)
    pub symbols: Vec<String>,

    /// Exchange (e.g., "CME")
    pub exchange: String,

    /// Candle bucket width in seconds
    pub candle_secs: i64,

    /// Maximum number of missing buckets filled with synthetic candles
    pub max_gap_fill: u32,

    /// Dollar value per point (NQ = $20, MNQ = $2)
    pub point_value: f64,

    /// Stop buffer beyond the spike-rule level in points
    pub stop_buffer: f64,

    /// Minimum body/range ratio for the no-wick reference candle
    pub no_wick_ratio: f64,

    /// Target distance as a multiple of entry-to-stop risk
    pub target_r: f64,

    /// Max candles in consolidation before the setup times out
    pub max_consol_candles: usize,

    /// Max candles waiting for the no-wick candle before timeout
    pub max_liq2_wait_candles: usize,

    /// Max candles waiting for the entry trigger before timeout
    pub max_entry_wait_candles: usize,

    /// Fraction of equity risked per trade
    pub risk_per_trade: f64,

    /// Hard cap on position size in contracts
    pub max_position_size: i32,

    /// Reference volatility in points; wider expected excursions shrink size
    pub vol_reference: f64,

    /// Drawdown from peak equity where sizing starts shrinking
    pub warn_drawdown_pct: f64,

    /// Drawdown from peak equity where new orders are refused
    pub halt_drawdown_pct: f64,

    /// Starting account equity for risk tracking
    pub starting_equity: f64,

    /// Reconnect backoff base delay in seconds
    pub base_delay_secs: u64,

    /// Reconnect backoff delay cap in seconds
    pub max_delay_secs: u64,

    /// Consecutive failed reconnect attempts before safe mode
    pub max_reconnect_attempts: u32,

    /// Smaller attempt budget used by the heartbeat loss path
    pub heartbeat_attempts: u32,

    /// Heartbeat interval in seconds while connected
    pub heartbeat_secs: u64,

    /// Overall graceful shutdown budget in seconds
    pub shutdown_timeout_secs: u64,

    /// Directory for durable state snapshots
    pub state_dir: PathBuf,

    /// Event bus diagnostic history depth
    pub event_history: usize,

    /// Optional explicit session high for cold starts without candle history
    pub session_high_override: Option<f64>,

    /// Optional explicit session low for cold starts without candle history
    pub session_low_override: Option<f64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Simulation,
            symbols: vec!["NQ.c.0".to_string()],
            exchange: "CME".to_string(),
            candle_secs: 60,
            max_gap_fill: 2,
            point_value: 20.0, // NQ = $20/pt
            stop_buffer: 2.0,
            no_wick_ratio: 0.7,
            target_r: 2.0,
            max_consol_candles: 120,
            max_liq2_wait_candles: 30,
            max_entry_wait_candles: 30,
            risk_per_trade: 0.01,
            max_position_size: 3,
            vol_reference: 40.0,
            warn_drawdown_pct: 0.05,
            halt_drawdown_pct: 0.10,
            starting_equity: 50_000.0,
            base_delay_secs: 1,
            max_delay_secs: 60,
            max_reconnect_attempts: 6,
            heartbeat_attempts: 3,
            heartbeat_secs: 30,
            shutdown_timeout_secs: 10,
            state_dir: PathBuf::from("state"),
            event_history: 1000,
            session_high_override: None,
            session_low_override: None,
        }
    }
}

impl EngineConfig {
    /// Tracker settings derived from the flat config
    pub fn tracker_config(&self) -> crate::setup::TrackerConfig {
        crate::setup::TrackerConfig {
            stop_buffer: self.stop_buffer,
            no_wick_ratio: self.no_wick_ratio,
            target_r: self.target_r,
            max_consol_candles: self.max_consol_candles,
            max_liq2_wait_candles: self.max_liq2_wait_candles,
            max_entry_wait_candles: self.max_entry_wait_candles,
        }
    }

    /// Risk settings derived from the flat config
    pub fn risk_config(&self) -> crate::risk::RiskConfig {
        crate::risk::RiskConfig {
            risk_per_trade: self.risk_per_trade,
            max_position_size: self.max_position_size,
            point_value: self.point_value,
            vol_reference: self.vol_reference,
            warn_drawdown_pct: self.warn_drawdown_pct,
            halt_drawdown_pct: self.halt_drawdown_pct,
        }
    }

    /// Connection supervisor settings derived from the flat config
    pub fn supervisor_config(&self) -> crate::connection::SupervisorConfig {
        crate::connection::SupervisorConfig {
            base_delay_secs: self.base_delay_secs,
            max_delay_secs: self.max_delay_secs,
            max_reconnect_attempts: self.max_reconnect_attempts,
            heartbeat_attempts: self.heartbeat_attempts,
            heartbeat_secs: self.heartbeat_secs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.mode, ExecutionMode::Simulation);
        assert_eq!(config.candle_secs, 60);
        assert_eq!(config.max_reconnect_attempts, 6);
        assert!(config.halt_drawdown_pct > config.warn_drawdown_pct);
    }

    #[test]
    fn test_sub_configs_inherit_values() {
        let config = EngineConfig {
            stop_buffer: 3.0,
            max_position_size: 5,
            base_delay_secs: 2,
            ..Default::default()
        };

        assert_eq!(config.tracker_config().stop_buffer, 3.0);
        assert_eq!(config.risk_config().max_position_size, 5);
        assert_eq!(config.supervisor_config().base_delay_secs, 2);
    }
}
