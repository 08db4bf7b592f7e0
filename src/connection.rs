//! Connection supervision
//!
//! Owns venue connectivity: exponential backoff reconnects, a terminal safe
//! mode after the attempt budget is exhausted, re-subscription of market data
//! on restore, and a periodic heartbeat that detects silent link drops.
//! Status is published through a watch channel and mutated only here.

use anyhow::{bail, Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};

use crate::events::{EngineEvent, EventBus};
use crate::venue::VenueClient;

/// Supervisor settings
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Backoff base delay in seconds
    pub base_delay_secs: u64,
    /// Backoff delay cap in seconds
    pub max_delay_secs: u64,
    /// Consecutive failures before safe mode
    pub max_reconnect_attempts: u32,
    /// Smaller budget used when the heartbeat notices a drop
    pub heartbeat_attempts: u32,
    /// Heartbeat probe interval in seconds
    pub heartbeat_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            base_delay_secs: 1,
            max_delay_secs: 60,
            max_reconnect_attempts: 6,
            heartbeat_attempts: 3,
            heartbeat_secs: 30,
        }
    }
}

/// Connection lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Disconnected,
    Connecting,
    Connected,
    /// Terminal until an operator clears it; no orders leave this process
    SafeMode,
}

/// Published connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub phase: ConnectionPhase,
    pub consecutive_failures: u32,
}

/// Backoff delay for a 1-based attempt number: base * 2^attempt, capped
pub fn backoff_delay(base_secs: u64, cap_secs: u64, attempt: u32) -> Duration {
    let exp = base_secs.saturating_mul(2u64.saturating_pow(attempt));
    Duration::from_secs(exp.min(cap_secs))
}

/// Supervises one venue connection
pub struct ConnectionSupervisor {
    config: SupervisorConfig,
    venue: Arc<dyn VenueClient>,
    bus: Arc<EventBus>,
    status_tx: watch::Sender<ConnectionStatus>,
    status_rx: watch::Receiver<ConnectionStatus>,
    /// Symbols to restore after a reconnect
    subscriptions: Mutex<Vec<String>>,
}

impl ConnectionSupervisor {
    pub fn new(config: SupervisorConfig, venue: Arc<dyn VenueClient>, bus: Arc<EventBus>) -> Self {
        let (status_tx, status_rx) = watch::channel(ConnectionStatus {
            phase: ConnectionPhase::Disconnected,
            consecutive_failures: 0,
        });
        Self {
            config,
            venue,
            bus,
            status_tx,
            status_rx,
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status_rx.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_rx.clone()
    }

    fn set_status(&self, phase: ConnectionPhase, consecutive_failures: u32) {
        let _ = self.status_tx.send(ConnectionStatus {
            phase,
            consecutive_failures,
        });
    }

    /// Initial connect; a failure here goes through the full reconnect path
    pub async fn connect(&self) -> Result<()> {
        self.set_status(ConnectionPhase::Connecting, 0);
        match self.venue.connect().await {
            Ok(()) => {
                self.set_status(ConnectionPhase::Connected, 0);
                info!("Venue connected");
                Ok(())
            }
            Err(e) => {
                warn!("Initial connect failed: {:#}", e);
                self.reconnect().await
            }
        }
    }

    /// Reconnect with the full attempt budget
    pub async fn reconnect(&self) -> Result<()> {
        self.reconnect_with_budget(self.config.max_reconnect_attempts)
            .await
    }

    /// Reconnect with up to `budget` attempts, backing off between them
    ///
    /// Attempt n sleeps base * 2^n (capped) before trying. Exhausting the
    /// budget enters safe mode and returns an error.
    pub async fn reconnect_with_budget(&self, budget: u32) -> Result<()> {
        if self.status().phase == ConnectionPhase::SafeMode {
            bail!("in safe mode; reconnect refused until cleared");
        }

        for attempt in 1..=budget {
            self.set_status(ConnectionPhase::Connecting, attempt - 1);
            let delay = backoff_delay(
                self.config.base_delay_secs,
                self.config.max_delay_secs,
                attempt,
            );
            info!(
                "Reconnect attempt {}/{} in {}s",
                attempt,
                budget,
                delay.as_secs()
            );
            tokio::time::sleep(delay).await;

            match self.venue.connect().await {
                Ok(()) => {
                    self.set_status(ConnectionPhase::Connected, 0);
                    self.restore_subscriptions().await?;
                    info!("Reconnected after {} attempt(s)", attempt);
                    self.bus
                        .publish(EngineEvent::ConnectionRestored { attempts: attempt });
                    return Ok(());
                }
                Err(e) => {
                    warn!("Reconnect attempt {}/{} failed: {:#}", attempt, budget, e);
                }
            }
        }

        self.enter_safe_mode(budget).await;
        bail!("reconnect budget ({}) exhausted; safe mode entered", budget)
    }

    async fn enter_safe_mode(&self, consecutive_failures: u32) {
        error!(
            "Entering safe mode after {} consecutive connection failures",
            consecutive_failures
        );
        self.set_status(ConnectionPhase::SafeMode, consecutive_failures);
        // Safe mode must be fully acknowledged before anything else proceeds
        self.bus
            .publish_and_wait(EngineEvent::SafeModeEntered {
                consecutive_failures,
            })
            .await;
    }

    /// Operator override releasing safe mode; does not reconnect by itself
    pub fn clear_safe_mode(&self) {
        if self.status().phase == ConnectionPhase::SafeMode {
            info!("Safe mode cleared by operator");
            self.set_status(ConnectionPhase::Disconnected, 0);
        }
    }

    /// Guard for order submission paths
    pub fn ensure_connected(&self) -> Result<()> {
        match self.status().phase {
            ConnectionPhase::Connected => Ok(()),
            ConnectionPhase::SafeMode => bail!("safe mode active; order refused"),
            phase => bail!("venue not connected (phase {:?})", phase),
        }
    }

    /// Subscribe to a symbol's market data, remembering it for restores
    pub async fn subscribe(&self, symbol: &str) -> Result<()> {
        self.venue
            .subscribe(symbol)
            .await
            .with_context(|| format!("subscribing to {}", symbol))?;
        let mut subs = self.subscriptions.lock().await;
        if !subs.iter().any(|s| s == symbol) {
            subs.push(symbol.to_string());
        }
        Ok(())
    }

    async fn restore_subscriptions(&self) -> Result<()> {
        let subs = self.subscriptions.lock().await.clone();
        for symbol in subs {
            self.venue
                .subscribe(&symbol)
                .await
                .with_context(|| format!("restoring subscription to {}", symbol))?;
            info!("Restored subscription to {}", symbol);
        }
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.venue.disconnect().await?;
        self.set_status(ConnectionPhase::Disconnected, 0);
        Ok(())
    }

    /// Periodic liveness probe; exits when `shutdown` flips or on safe mode
    ///
    /// A dead link publishes ConnectionLost and reconnects with the smaller
    /// heartbeat budget.
    pub async fn heartbeat_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(Duration::from_secs(self.config.heartbeat_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Heartbeat loop stopping");
                        return;
                    }
                    continue;
                }
            }

            if self.status().phase != ConnectionPhase::Connected {
                if self.status().phase == ConnectionPhase::SafeMode {
                    return;
                }
                continue;
            }

            if self.venue.is_alive().await {
                continue;
            }

            warn!("Heartbeat: venue link is dead");
            self.set_status(ConnectionPhase::Disconnected, 0);
            self.bus.publish(EngineEvent::ConnectionLost {
                reason: "heartbeat probe failed".to_string(),
            });

            if let Err(e) = self
                .reconnect_with_budget(self.config.heartbeat_attempts)
                .await
            {
                error!("Heartbeat reconnect failed: {:#}", e);
                if self.status().phase == ConnectionPhase::SafeMode {
                    return;
                }
            }
        }
    }
}
