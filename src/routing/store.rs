//! Durable ledger storage.
//!
//! The ledger itself is in-memory. A [`LedgerStore`] lets spend survive a
//! restart: the persister task listens to ledger events, snapshots open
//! periods off the ledger lock and writes them through the store.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::ledger::{BudgetLedger, BudgetPeriod, LedgerEvent};

/// Ledger store failures.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem failure.
    #[error("ledger store I/O error on '{path}': {source}")]
    Io {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// Stored data could not be (de)serialized.
    #[error("ledger store encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

fn default_flush_interval_ms() -> u64 {
    1_000
}

/// Where and how often the ledger is persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PersistenceConfig {
    /// JSON file holding open periods. Unset keeps the ledger in memory only.
    #[serde(default)]
    pub ledger_path: Option<PathBuf>,
    /// Minimum milliseconds between writes.
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            ledger_path: None,
            flush_interval_ms: default_flush_interval_ms(),
        }
    }
}

/// Persistence seam for budget periods.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Load every stored period. An absent store is empty, not an error.
    async fn load(&self) -> Result<Vec<BudgetPeriod>, StoreError>;
    /// Replace stored contents with `periods`.
    async fn save(&self, periods: &[BudgetPeriod]) -> Result<(), StoreError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct LedgerFile {
    version: u32,
    periods: Vec<BudgetPeriod>,
}

const LEDGER_FILE_VERSION: u32 = 1;

/// Single JSON file, replaced atomically via write-then-rename.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    /// Store at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[async_trait]
impl LedgerStore for JsonFileStore {
    async fn load(&self) -> Result<Vec<BudgetPeriod>, StoreError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.io(e)),
        };
        let file: LedgerFile = serde_json::from_slice(&bytes)?;
        if file.version != LEDGER_FILE_VERSION {
            warn!(
                path = %self.path.display(),
                version = file.version,
                "unknown ledger file version, loading anyway"
            );
        }
        Ok(file.periods)
    }

    async fn save(&self, periods: &[BudgetPeriod]) -> Result<(), StoreError> {
        let body = serde_json::to_vec_pretty(&LedgerFile {
            version: LEDGER_FILE_VERSION,
            periods: periods.to_vec(),
        })?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body).await.map_err(|e| self.io(e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| self.io(e))
    }
}

/// Volatile store, for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct MemoryStore {
    periods: Mutex<Vec<BudgetPeriod>>,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn load(&self) -> Result<Vec<BudgetPeriod>, StoreError> {
        Ok(self.periods.lock().clone())
    }

    async fn save(&self, periods: &[BudgetPeriod]) -> Result<(), StoreError> {
        *self.periods.lock() = periods.to_vec();
        Ok(())
    }
}

/// Load stored periods into `ledger`. Returns how many were restored.
///
/// # Errors
///
/// Returns the store error if loading fails.
pub async fn restore_ledger(ledger: &BudgetLedger, store: &dyn LedgerStore) -> Result<usize, StoreError> {
    let periods = store.load().await?;
    Ok(ledger.restore(periods))
}

/// Spawn the persister task.
///
/// Writes the ledger's open periods through `store` at most once per
/// `flush_interval` after any debit or rollover, and once more on shutdown.
pub fn spawn_persister(
    ledger: Arc<BudgetLedger>,
    store: Arc<dyn LedgerStore>,
    flush_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let mut events = ledger.subscribe();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(flush_interval.max(Duration::from_millis(10)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut dirty = false;

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(LedgerEvent::Debited { .. }) | Ok(LedgerEvent::RolledOver { .. }) => dirty = true,
                    Ok(LedgerEvent::Alert(_)) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "persister lagged behind ledger events");
                        dirty = true;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = ticker.tick() => {
                    if dirty {
                        dirty = !flush(&ledger, store.as_ref()).await;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        if dirty {
            flush(&ledger, store.as_ref()).await;
        }
        info!("ledger persister stopped");
    })
}

async fn flush(ledger: &BudgetLedger, store: &dyn LedgerStore) -> bool {
    let periods = ledger.periods();
    match store.save(&periods).await {
        Ok(()) => {
            debug!(periods = periods.len(), "ledger persisted");
            true
        }
        Err(e) => {
            error!(error = %e, "ledger persist failed, will retry");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::routing::ledger::{BudgetConfig, PeriodKind};
    use chrono::Utc;

    #[tokio::test]
    async fn test_json_store_missing_file_loads_empty() {
        let dir = tempfile::tempdir()
            .unwrap_or_else(|e| std::panic::panic_any(format!("test: tempdir failed: {e}")));
        let store = JsonFileStore::new(dir.path().join("ledger.json"));
        let loaded = store.load().await;
        assert!(matches!(loaded, Ok(ref v) if v.is_empty()));
    }

    #[tokio::test]
    async fn test_json_store_save_then_load() {
        let dir = tempfile::tempdir()
            .unwrap_or_else(|e| std::panic::panic_any(format!("test: tempdir failed: {e}")));
        let store = JsonFileStore::new(dir.path().join("ledger.json"));
        let mut period = BudgetPeriod::open("a", PeriodKind::Daily, 10, Utc::now());
        period.spent_micros = 7;
        period.warning_sent = true;
        store
            .save(std::slice::from_ref(&period))
            .await
            .unwrap_or_else(|e| std::panic::panic_any(format!("test: save failed: {e}")));
        let loaded = store
            .load()
            .await
            .unwrap_or_else(|e| std::panic::panic_any(format!("test: load failed: {e}")));
        assert_eq!(loaded, vec![period]);
    }

    #[tokio::test]
    async fn test_json_store_corrupt_file_is_encoding_error() {
        let dir = tempfile::tempdir()
            .unwrap_or_else(|e| std::panic::panic_any(format!("test: tempdir failed: {e}")));
        let path = dir.path().join("ledger.json");
        std::fs::write(&path, b"{ not json")
            .unwrap_or_else(|e| std::panic::panic_any(format!("test: write failed: {e}")));
        let result = JsonFileStore::new(path).load().await;
        assert!(matches!(result, Err(StoreError::Encoding(_))));
    }

    #[tokio::test]
    async fn test_persister_flushes_on_shutdown() {
        let ledger = Arc::new(BudgetLedger::new(BudgetConfig::default(), Arc::new(SystemClock)));
        let store = Arc::new(MemoryStore::new());
        let (tx, rx) = watch::channel(false);
        let handle = spawn_persister(
            Arc::clone(&ledger),
            store.clone(),
            Duration::from_secs(3600),
            rx,
        );
        // Let the task subscribe and consume its first immediate tick.
        tokio::time::sleep(Duration::from_millis(50)).await;
        ledger.debit("a", PeriodKind::Daily, 42);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let _ = tx.send(true);
        let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;

        let saved = store.load().await.unwrap_or_default();
        assert!(saved
            .iter()
            .any(|p| p.owner == "a" && p.kind == PeriodKind::Daily && p.spent_micros == 42));
    }

    #[tokio::test]
    async fn test_restore_ledger_round_trip() {
        let store = MemoryStore::new();
        let mut period = BudgetPeriod::open("a", PeriodKind::Daily, 0, Utc::now());
        period.spent_micros = 5_000_000;
        store
            .save(&[period])
            .await
            .unwrap_or_else(|e| std::panic::panic_any(format!("test: save failed: {e}")));
        let ledger = BudgetLedger::new(BudgetConfig::default(), Arc::new(SystemClock));
        let restored = restore_ledger(&ledger, &store).await.unwrap_or(0);
        assert_eq!(restored, 1);
        assert_eq!(ledger.remaining("a", PeriodKind::Daily), 95_000_000);
    }
}
