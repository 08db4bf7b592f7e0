//! Durable engine state
//!
//! JSON snapshots under one state directory: setups, brackets, trades, and
//! the risk snapshot. Writes go to a temp file then rename, so a crash mid
//! write never leaves a torn snapshot. Reads tolerate individually corrupt
//! records by skipping them with a warning instead of refusing to start.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::order::{BracketOrder, Trade, TradeStatus};
use crate::risk::RiskSnapshot;
use crate::setup::SetupCandidate;

const SETUPS_FILE: &str = "setups.json";
const BRACKETS_FILE: &str = "brackets.json";
const TRADES_FILE: &str = "trades.json";
const RISK_FILE: &str = "risk.json";

/// File-backed state store; all writes serialize through one lock
pub struct StateStore {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl StateStore {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating state directory {}", dir.display()))?;
        Ok(Self {
            dir,
            lock: Mutex::new(()),
        })
    }

    fn path(&self, file: &str) -> PathBuf {
        self.dir.join(file)
    }

    /// Atomic write: temp file in the same directory, then rename
    async fn write_json<T: Serialize>(&self, file: &str, value: &T) -> Result<()> {
        let _guard = self.lock.lock().await;
        let path = self.path(file);
        let tmp = self.path(&format!("{}.tmp", file));
        let json = serde_json::to_string_pretty(value)?;
        tokio::fs::write(&tmp, json)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("renaming into {}", path.display()))?;
        debug!("Persisted {}", path.display());
        Ok(())
    }

    /// Load a map file, skipping records that fail to deserialize
    async fn read_map<T: DeserializeOwned>(&self, file: &str) -> Result<HashMap<Uuid, T>> {
        let path = self.path(file);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("reading {}", path.display()));
            }
        };

        let values: HashMap<Uuid, serde_json::Value> = serde_json::from_str(&raw)
            .with_context(|| format!("parsing {}", path.display()))?;

        let mut out = HashMap::new();
        for (id, value) in values {
            match serde_json::from_value::<T>(value) {
                Ok(record) => {
                    out.insert(id, record);
                }
                Err(e) => {
                    warn!("Skipping corrupt record {} in {}: {}", id, file, e);
                }
            }
        }
        Ok(out)
    }

    pub async fn save_setups(&self, setups: &HashMap<Uuid, SetupCandidate>) -> Result<()> {
        self.write_json(SETUPS_FILE, setups).await
    }

    pub async fn load_setups(&self) -> Result<HashMap<Uuid, SetupCandidate>> {
        self.read_map(SETUPS_FILE).await
    }

    pub async fn save_brackets(&self, brackets: &HashMap<Uuid, BracketOrder>) -> Result<()> {
        self.write_json(BRACKETS_FILE, brackets).await
    }

    pub async fn load_brackets(&self) -> Result<HashMap<Uuid, BracketOrder>> {
        self.read_map(BRACKETS_FILE).await
    }

    pub async fn save_trades(&self, trades: &HashMap<Uuid, Trade>) -> Result<()> {
        self.write_json(TRADES_FILE, trades).await
    }

    pub async fn load_trades(&self) -> Result<HashMap<Uuid, Trade>> {
        self.read_map(TRADES_FILE).await
    }

    pub async fn save_risk(&self, snapshot: &RiskSnapshot) -> Result<()> {
        self.write_json(RISK_FILE, snapshot).await
    }

    pub async fn load_risk(&self) -> Result<Option<RiskSnapshot>> {
        let path = self.path(RISK_FILE);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        };
        match serde_json::from_str(&raw) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(e) => {
                warn!("Risk snapshot corrupt, starting fresh: {}", e);
                Ok(None)
            }
        }
    }

    /// Setups not yet terminal, for startup rehydration
    pub async fn active_setups(&self) -> Result<Vec<SetupCandidate>> {
        Ok(self
            .load_setups()
            .await?
            .into_values()
            .filter(|s| !s.state.is_terminal())
            .collect())
    }

    /// Trades still marked open, for startup reconciliation
    pub async fn open_trades(&self) -> Result<Vec<Trade>> {
        Ok(self
            .load_trades()
            .await?
            .into_values()
            .filter(|t| t.status == TradeStatus::Open)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::OrderSide;
    use chrono::Utc;

    fn store() -> (tempfile::TempDir, StateStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path()).unwrap();
        (dir, store)
    }

    fn bracket() -> BracketOrder {
        BracketOrder::new(
            Uuid::new_v4(),
            "NQ.c.0",
            OrderSide::Sell,
            1,
            15286.0,
            15307.0,
            15244.0,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_missing_files_load_empty() {
        let (_dir, store) = store();
        assert!(store.load_setups().await.unwrap().is_empty());
        assert!(store.load_brackets().await.unwrap().is_empty());
        assert!(store.load_trades().await.unwrap().is_empty());
        assert!(store.load_risk().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_bracket_roundtrip() {
        let (_dir, store) = store();
        let b = bracket();
        let mut brackets = HashMap::new();
        brackets.insert(b.setup_id, b.clone());

        store.save_brackets(&brackets).await.unwrap();
        let loaded = store.load_brackets().await.unwrap();

        assert_eq!(loaded.len(), 1);
        let back = &loaded[&b.setup_id];
        assert_eq!(back.idempotency_key, b.idempotency_key);
        assert_eq!(back.entry.reference, b.entry.reference);
    }

    #[tokio::test]
    async fn test_corrupt_record_skipped_not_fatal() {
        let (dir, store) = store();
        let b = bracket();

        let json = format!(
            r#"{{"{}": {}, "{}": {{"not": "a bracket"}}}}"#,
            b.setup_id,
            serde_json::to_string(&b).unwrap(),
            Uuid::new_v4(),
        );
        std::fs::write(dir.path().join("brackets.json"), json).unwrap();

        let loaded = store.load_brackets().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(loaded.contains_key(&b.setup_id));
    }

    #[tokio::test]
    async fn test_no_tmp_file_left_behind() {
        let (dir, store) = store();
        store.save_brackets(&HashMap::new()).await.unwrap();

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().map(|x| x == "tmp").unwrap_or(false))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_open_trades_filter() {
        let (_dir, store) = store();
        let b = bracket();
        let open = Trade::open(&b, 15286.0, Utc::now());

        let b2 = bracket();
        let mut closed = Trade::open(&b2, 15290.0, Utc::now());
        closed.close(15280.0, Utc::now());

        let mut trades = HashMap::new();
        trades.insert(open.setup_id, open.clone());
        trades.insert(closed.setup_id, closed);
        store.save_trades(&trades).await.unwrap();

        let open_trades = store.open_trades().await.unwrap();
        assert_eq!(open_trades.len(), 1);
        assert_eq!(open_trades[0].setup_id, open.setup_id);
    }

    #[tokio::test]
    async fn test_active_setups_excludes_terminal() {
        use crate::setup::{SessionLevels, SetupTracker};

        let (_dir, store) = store();
        let mut tracker = SetupTracker::new("NQ.c.0", Default::default());
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
        let active = tracker.all_candidates()[0].clone();
        tracker.end_session();
        let terminal = tracker.all_candidates()[0].clone();

        let mut setups = HashMap::new();
        setups.insert(active.id, active.clone());
        store.save_setups(&setups).await.unwrap();
        assert_eq!(store.active_setups().await.unwrap().len(), 1);

        setups.insert(terminal.id, terminal);
        store.save_setups(&setups).await.unwrap();
        // Invalidation replaced the record; nothing active remains
        assert!(store.active_setups().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_risk_snapshot_roundtrip() {
        let (_dir, store) = store();
        let snapshot = RiskSnapshot {
            equity: 48_000.0,
            peak_equity: 52_000.0,
            halted: true,
        };
        store.save_risk(&snapshot).await.unwrap();

        let back = store.load_risk().await.unwrap().unwrap();
        assert_eq!(back.equity, 48_000.0);
        assert!(back.halted);
    }
}
