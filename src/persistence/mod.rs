//! Persistence Module
//!
//! Durable engine snapshot behind the `StateStore` trait plus a CSV journal
//! of closed trades.

use csv::WriterBuilder;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use tracing::info;

use crate::error::PersistenceError;
use crate::risk::DailyLossWindow;
use crate::types::{ClosedTrade, Position};

pub const STATE_VERSION: u32 = 1;

/// Snapshot written after every state change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    pub version: u32,
    pub capital: f64,
    pub total_pnl: f64,
    pub peak_capital: f64,
    pub positions: Vec<Position>,
    pub timestamp: i64,
    #[serde(default)]
    pub daily: DailyLossWindow,
    #[serde(default)]
    pub closed_trades: u64,
    #[serde(default)]
    pub winning_trades: u64,
}

impl PersistedState {
    fn validate(&self) -> Result<(), String> {
        if !self.capital.is_finite() || !self.total_pnl.is_finite() || !self.peak_capital.is_finite()
        {
            return Err("non-finite account figures".to_string());
        }
        if let Some(p) = self
            .positions
            .iter()
            .find(|p| !(p.size > 0.0) || !(p.entry_price > 0.0))
        {
            return Err(format!("position {} has invalid size or price", p.id));
        }
        Ok(())
    }
}

/// Durable home of the engine snapshot.
///
/// `load` returns `Ok(None)` when nothing was ever saved. Anything unreadable
/// is an error: callers must not fall back to defaults.
pub trait StateStore: Send + Sync {
    fn load(&self) -> Result<Option<PersistedState>, PersistenceError>;
    fn save(&self, state: &PersistedState) -> Result<(), PersistenceError>;
    fn describe(&self) -> String;
}

/// JSON file written via temp file + rename
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn io(&self, source: std::io::Error) -> PersistenceError {
        PersistenceError::Io {
            path: self.path.clone(),
            source,
        }
    }

    fn corrupted(&self, reason: impl Into<String>) -> PersistenceError {
        PersistenceError::Corrupted {
            path: self.path.clone(),
            reason: reason.into(),
        }
    }
}

impl StateStore for JsonFileStore {
    fn load(&self) -> Result<Option<PersistedState>, PersistenceError> {
        if !self.path.exists() {
            info!(path = %self.path.display(), "💾 No state file found, starting fresh");
            return Ok(None);
        }

        let json = fs::read_to_string(&self.path).map_err(|e| self.io(e))?;
        let value: serde_json::Value =
            serde_json::from_str(&json).map_err(|e| self.corrupted(e.to_string()))?;
        let version = value
            .get("version")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| self.corrupted("missing version"))?;
        if version != STATE_VERSION as u64 {
            return Err(PersistenceError::UnsupportedVersion {
                found: version as u32,
                expected: STATE_VERSION,
            });
        }
        let state: PersistedState =
            serde_json::from_value(value).map_err(|e| self.corrupted(e.to_string()))?;
        state.validate().map_err(|e| self.corrupted(e))?;

        info!(
            path = %self.path.display(),
            capital = %format!("${:.2}", state.capital),
            positions = state.positions.len(),
            "💾 State loaded"
        );
        Ok(Some(state))
    }

    fn save(&self, state: &PersistedState) -> Result<(), PersistenceError> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|e| self.io(e))?;
        }
        let json = serde_json::to_vec_pretty(state)?;
        let tmp = self.temp_path();
        {
            let mut file = fs::File::create(&tmp).map_err(|e| self.io(e))?;
            file.write_all(&json).map_err(|e| self.io(e))?;
            file.sync_all().map_err(|e| self.io(e))?;
        }
        fs::rename(&tmp, &self.path).map_err(|e| self.io(e))?;
        tracing::debug!(path = %self.path.display(), "💾 State saved");
        Ok(())
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Process-local store for tests and dry runs
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<Option<PersistedState>>,
    saves: AtomicUsize,
    fail: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: PersistedState) -> Self {
        Self {
            state: Mutex::new(Some(state)),
            ..Default::default()
        }
    }

    /// Make subsequent saves fail with an io error
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> Option<PersistedState> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl StateStore for MemoryStore {
    fn load(&self) -> Result<Option<PersistedState>, PersistenceError> {
        Ok(self.snapshot())
    }

    fn save(&self, state: &PersistedState) -> Result<(), PersistenceError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(PersistenceError::Io {
                path: PathBuf::from("<memory>"),
                source: std::io::Error::new(std::io::ErrorKind::Other, "simulated failure"),
            });
        }
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = Some(state.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

/// Closed trade row in the journal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub exit_ts: i64,
    pub position_id: String,
    pub symbol: String,
    pub side: String,
    pub size: f64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub entry_ts: i64,
    pub pnl: f64,
    pub commission: f64,
    /// TAKE_PROFIT, STOP_LOSS, MANUAL, SHUTDOWN
    pub exit_reason: String,
}

impl From<&ClosedTrade> for TradeRecord {
    fn from(t: &ClosedTrade) -> Self {
        Self {
            exit_ts: t.exit_ts,
            position_id: t.position_id.clone(),
            symbol: t.symbol.clone(),
            side: t.side.to_string(),
            size: t.size,
            entry_price: t.entry_price,
            exit_price: t.exit_price,
            entry_ts: t.entry_ts,
            pnl: t.pnl,
            commission: t.commission,
            exit_reason: t.exit_reason.to_string(),
        }
    }
}

/// Append-only CSV of closed trades
#[derive(Debug, Clone)]
pub struct TradeJournal {
    path: PathBuf,
}

impl TradeJournal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn append(&self, trade: &ClosedTrade) -> Result<(), PersistenceError> {
        let io = |source| PersistenceError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(io)?;
        }
        let is_new = !self.path.exists();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(io)?;
        let mut writer = WriterBuilder::new().has_headers(is_new).from_writer(file);
        writer.serialize(TradeRecord::from(trade))?;
        writer.flush().map_err(io)?;
        Ok(())
    }

    pub fn read_all(&self) -> Result<Vec<TradeRecord>, PersistenceError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let mut reader = csv::Reader::from_path(&self.path)?;
        let records = reader.deserialize().collect::<Result<Vec<TradeRecord>, _>>()?;
        Ok(records)
    }
}
