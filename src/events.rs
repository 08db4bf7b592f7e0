//! Typed in-process event bus
//!
//! Connects aggregation, detection, and execution to external observers
//! (dashboards, alerting, trade logs) without back-pressure on the core.
//! Each subscriber is invoked independently; a failing subscriber is logged
//! and never aborts dispatch to the rest.

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::order::{LegRole, OrderSide};
use crate::types::Candle;

/// Events emitted by the engine
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A candle bucket was finalized
    CandleCompleted { candle: Candle },
    /// A setup reached SETUP_COMPLETE with computed levels
    SetupDetected {
        setup_id: Uuid,
        symbol: String,
        entry: f64,
        stop: f64,
        target: f64,
    },
    /// A setup was invalidated before completing
    SetupInvalidated {
        setup_id: Uuid,
        symbol: String,
        reason: String,
    },
    /// A bracket order was accepted by the venue
    OrderPlaced {
        setup_id: Uuid,
        reference: String,
        side: OrderSide,
        quantity: i32,
        stop: f64,
        target: f64,
    },
    /// A bracket leg filled
    OrderFilled {
        setup_id: Uuid,
        reference: String,
        leg: LegRole,
        fill_price: f64,
        quantity: i32,
    },
    /// An order was rejected (venue reject or risk refusal)
    OrderRejected {
        setup_id: Uuid,
        reference: String,
        reason: String,
    },
    /// The venue link dropped
    ConnectionLost { reason: String },
    /// The venue link was re-established
    ConnectionRestored { attempts: u32 },
    /// Reconnection exhausted its budget; trading is halted until cleared
    SafeModeEntered { consecutive_failures: u32 },
    /// Startup reconciliation found a mismatch requiring operator attention
    ReconciliationAlert { symbol: String, detail: String },
}

/// Registry key for subscriptions, one per event variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    CandleCompleted,
    SetupDetected,
    SetupInvalidated,
    OrderPlaced,
    OrderFilled,
    OrderRejected,
    ConnectionLost,
    ConnectionRestored,
    SafeModeEntered,
    ReconciliationAlert,
}

impl EngineEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::CandleCompleted { .. } => EventKind::CandleCompleted,
            Self::SetupDetected { .. } => EventKind::SetupDetected,
            Self::SetupInvalidated { .. } => EventKind::SetupInvalidated,
            Self::OrderPlaced { .. } => EventKind::OrderPlaced,
            Self::OrderFilled { .. } => EventKind::OrderFilled,
            Self::OrderRejected { .. } => EventKind::OrderRejected,
            Self::ConnectionLost { .. } => EventKind::ConnectionLost,
            Self::ConnectionRestored { .. } => EventKind::ConnectionRestored,
            Self::SafeModeEntered { .. } => EventKind::SafeModeEntered,
            Self::ReconciliationAlert { .. } => EventKind::ReconciliationAlert,
        }
    }
}

/// A recorded event with its dispatch time, kept for diagnostics
#[derive(Debug, Clone)]
pub struct EventRecord {
    pub at: DateTime<Utc>,
    pub event: EngineEvent,
}

/// Async event handler; failures are isolated per subscriber
pub type EventHandler = Arc<dyn Fn(EngineEvent) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Publish/subscribe dispatcher keyed by event kind
pub struct EventBus {
    subscribers: RwLock<HashMap<EventKind, Vec<(String, EventHandler)>>>,
    history: Mutex<VecDeque<EventRecord>>,
    history_cap: usize,
    /// Detached subscriber tasks still in flight, joined by `drain`
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl EventBus {
    pub fn new(history_cap: usize) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
            history_cap,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Register a named subscriber for one event kind
    pub fn subscribe(&self, kind: EventKind, name: &str, handler: EventHandler) {
        let mut subs = self
            .subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subs.entry(kind).or_default().push((name.to_string(), handler));
        debug!("Subscriber '{}' registered for {:?}", name, kind);
    }

    /// Register a named subscriber for several event kinds at once
    pub fn subscribe_many(&self, kinds: &[EventKind], name: &str, handler: EventHandler) {
        for kind in kinds {
            self.subscribe(*kind, name, handler.clone());
        }
    }

    fn record(&self, event: &EngineEvent) {
        let mut history = self
            .history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        history.push_back(EventRecord {
            at: Utc::now(),
            event: event.clone(),
        });
        while history.len() > self.history_cap {
            history.pop_front();
        }
    }

    fn handlers_for(&self, kind: EventKind) -> Vec<(String, EventHandler)> {
        let subs = self
            .subscribers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subs.get(&kind).cloned().unwrap_or_default()
    }

    /// Dispatch an event; each subscriber runs on its own task so the
    /// publisher is not blocked beyond scheduling
    pub fn publish(&self, event: EngineEvent) {
        self.record(&event);

        let mut tasks = self
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        tasks.retain(|task| !task.is_finished());

        for (name, handler) in self.handlers_for(event.kind()) {
            let event = event.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = handler(event).await {
                    warn!("Event subscriber '{}' failed: {:#}", name, e);
                }
            }));
        }
    }

    /// Join every detached subscriber task still in flight
    ///
    /// Called at shutdown so pending handlers (trade logs, alerts) finish
    /// before the process exits.
    pub async fn drain(&self) {
        let pending: Vec<JoinHandle<()>> = {
            let mut tasks = self
                .tasks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            tasks.drain(..).collect()
        };
        for task in pending {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!("Event subscriber task failed: {}", e);
                }
            }
        }
    }

    /// Dispatch an event and wait for every subscriber to finish
    ///
    /// Reserved for events that must be fully processed before the publisher
    /// continues (safe-mode / circuit-breaker notifications).
    pub async fn publish_and_wait(&self, event: EngineEvent) {
        self.record(&event);

        for (name, handler) in self.handlers_for(event.kind()) {
            if let Err(e) = handler(event.clone()).await {
                warn!("Event subscriber '{}' failed: {:#}", name, e);
            }
        }
    }

    /// Snapshot of the recent event history
    pub fn history(&self) -> Vec<EventRecord> {
        self.history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn lost_event() -> EngineEvent {
        EngineEvent::ConnectionLost {
            reason: "test".to_string(),
        }
    }

    #[tokio::test]
    async fn test_failing_subscriber_does_not_abort_dispatch() {
        let bus = EventBus::new(100);
        let calls = Arc::new(AtomicUsize::new(0));

        bus.subscribe(
            EventKind::ConnectionLost,
            "failing",
            Arc::new(|_| Box::pin(async { bail!("subscriber exploded") })),
        );

        let calls_clone = calls.clone();
        bus.subscribe(
            EventKind::ConnectionLost,
            "counting",
            Arc::new(move |_| {
                let calls = calls_clone.clone();
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }),
        );

        bus.publish_and_wait(lost_event()).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_publish_schedules_all_subscribers() {
        let bus = EventBus::new(100);
        let calls = Arc::new(AtomicUsize::new(0));

        for name in ["a", "b", "c"] {
            let calls_clone = calls.clone();
            bus.subscribe(
                EventKind::ConnectionLost,
                name,
                Arc::new(move |_| {
                    let calls = calls_clone.clone();
                    Box::pin(async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                }),
            );
        }

        bus.publish(lost_event());

        // Handlers run on spawned tasks; give the scheduler a moment
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_drain_waits_for_detached_subscribers() {
        let bus = EventBus::new(100);
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_clone = calls.clone();
        bus.subscribe(
            EventKind::ConnectionLost,
            "slow",
            Arc::new(move |_| {
                let calls = calls_clone.clone();
                Box::pin(async move {
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }),
        );

        bus.publish(lost_event());
        bus.drain().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let bus = EventBus::new(5);
        for _ in 0..20 {
            bus.publish_and_wait(lost_event()).await;
        }
        assert_eq!(bus.history().len(), 5);
    }

    #[tokio::test]
    async fn test_events_only_reach_matching_kind() {
        let bus = EventBus::new(10);
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_clone = calls.clone();
        bus.subscribe(
            EventKind::SafeModeEntered,
            "safe-mode-only",
            Arc::new(move |_| {
                let calls = calls_clone.clone();
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }),
        );

        bus.publish_and_wait(lost_event()).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        bus.publish_and_wait(EngineEvent::SafeModeEntered {
            consecutive_failures: 6,
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
