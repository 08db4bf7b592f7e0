//! Position sizing and drawdown control
//!
//! Sizes each trade from current equity and the entry-to-stop distance, then
//! scales down under elevated volatility and under drawdown from peak equity.
//! Past the halt threshold the manager refuses new orders until an operator
//! clears it.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Risk manager settings
#[derive(Debug, Clone)]
pub struct RiskConfig {
    /// Fraction of equity risked per trade
    pub risk_per_trade: f64,
    /// Hard cap on contracts per order
    pub max_position_size: i32,
    /// Dollar value per point
    pub point_value: f64,
    /// Volatility above this reference shrinks size proportionally
    pub vol_reference: f64,
    /// Drawdown where sizing starts shrinking
    pub warn_drawdown_pct: f64,
    /// Drawdown where new orders are refused
    pub halt_drawdown_pct: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            risk_per_trade: 0.01,
            max_position_size: 3,
            point_value: 20.0,
            vol_reference: 40.0,
            warn_drawdown_pct: 0.05,
            halt_drawdown_pct: 0.10,
        }
    }
}

/// Outcome of a sizing request
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SizeDecision {
    /// Approved for this many contracts
    Units(i32),
    /// Refused: drawdown halt is latched
    Halted { drawdown_pct: f64 },
}

/// Equity, drawdown, and sizing state
///
/// The halt flag is sticky: once latched it survives equity recovery and is
/// only released by `clear_halt`, so a bounce off the lows never silently
/// resumes trading.
#[derive(Debug, Clone)]
pub struct RiskManager {
    pub equity: f64,
    pub peak_equity: f64,
    pub halted: bool,
    config: RiskConfig,
}

impl RiskManager {
    pub fn new(config: RiskConfig, starting_equity: f64) -> Self {
        Self {
            equity: starting_equity,
            peak_equity: starting_equity,
            halted: false,
            config,
        }
    }

    /// Rehydrate equity tracking from a snapshot, keeping fresh config
    pub fn restore(config: RiskConfig, snapshot: RiskSnapshot) -> Self {
        Self {
            equity: snapshot.equity,
            peak_equity: snapshot.peak_equity,
            halted: snapshot.halted,
            config,
        }
    }

    pub fn snapshot(&self) -> RiskSnapshot {
        RiskSnapshot {
            equity: self.equity,
            peak_equity: self.peak_equity,
            halted: self.halted,
        }
    }

    /// Current drawdown from peak equity as a fraction
    pub fn drawdown_pct(&self) -> f64 {
        if self.peak_equity <= 0.0 {
            return 0.0;
        }
        ((self.peak_equity - self.equity) / self.peak_equity).max(0.0)
    }

    /// Size a short at `entry` with stop at `stop`
    ///
    /// Base size is floor(equity * risk_per_trade / (stop_distance * point_value)).
    /// Elevated volatility scales it down by vol_reference / vol. Between the
    /// warn and halt drawdown thresholds the size shrinks linearly; at or
    /// past halt the request is refused and the halt latches. While trading
    /// is enabled the size is floored at one contract and capped at
    /// max_position_size.
    pub fn size_position(&mut self, entry: f64, stop: f64, volatility: Option<f64>) -> SizeDecision {
        let dd = self.drawdown_pct();

        if self.halted {
            return SizeDecision::Halted { drawdown_pct: dd };
        }
        if dd >= self.config.halt_drawdown_pct {
            warn!(
                "Drawdown {:.1}% breached halt threshold {:.1}%; refusing new orders",
                dd * 100.0,
                self.config.halt_drawdown_pct * 100.0
            );
            self.halted = true;
            return SizeDecision::Halted { drawdown_pct: dd };
        }

        let stop_distance = (stop - entry).abs();
        if stop_distance <= 0.0 {
            return SizeDecision::Units(0);
        }

        let risk_dollars = self.equity * self.config.risk_per_trade;
        let mut size = (risk_dollars / (stop_distance * self.config.point_value)).floor();

        // Volatility scale-down only; calm markets never size up
        if let Some(vol) = volatility {
            if vol > self.config.vol_reference && vol > 0.0 {
                size = (size * self.config.vol_reference / vol).floor();
            }
        }

        // Linear reduction between warn and halt thresholds
        if dd > self.config.warn_drawdown_pct {
            let span = self.config.halt_drawdown_pct - self.config.warn_drawdown_pct;
            let factor = 1.0 - (dd - self.config.warn_drawdown_pct) / span;
            size = (size * factor.max(0.0)).floor();
        }

        // Trading is enabled, so rounding never silently skips the signal
        let units = (size.max(1.0) as i32).min(self.config.max_position_size);
        SizeDecision::Units(units)
    }

    /// Apply realized P&L in dollars and advance the peak
    pub fn record_pnl(&mut self, pnl_dollars: f64) {
        self.equity += pnl_dollars;
        if self.equity > self.peak_equity {
            self.peak_equity = self.equity;
        }
        info!(
            "Equity {:.2} (peak {:.2}, drawdown {:.2}%)",
            self.equity,
            self.peak_equity,
            self.drawdown_pct() * 100.0
        );
    }

    /// Overwrite equity from an authoritative account snapshot
    pub fn set_equity(&mut self, equity: f64) {
        self.equity = equity;
        if self.equity > self.peak_equity {
            self.peak_equity = self.equity;
        }
    }

    /// Operator override releasing the drawdown halt
    pub fn clear_halt(&mut self) {
        if self.halted {
            info!("Drawdown halt cleared by operator");
        }
        self.halted = false;
    }
}

/// Persisted equity tracking state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskSnapshot {
    pub equity: f64,
    pub peak_equity: f64,
    pub halted: bool,
}
