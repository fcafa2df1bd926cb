//! Model, settings, and request-log records plus the store that holds them.

use chrono::{DateTime, Utc};
use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, warn};

use crate::error::StoreError;

/// Request log rows kept; older rows are dropped first.
pub const MAX_STORED_LOGS: usize = 10_000;

/// A configured upstream model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelConfig {
    pub id: String,
    pub name: String,
    /// Routing key matched against the `model` field of incoming requests
    pub model_id: String,
    pub provider: String,
    pub api_url: String,
    pub api_key: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

fn default_enabled() -> bool {
    true
}

impl ModelConfig {
    pub fn new(
        model_id: impl Into<String>,
        provider: impl Into<String>,
        api_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        let model_id = model_id.into();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: model_id.clone(),
            model_id,
            provider: provider.into(),
            api_url: api_url.into(),
            api_key: api_key.into(),
            enabled: true,
            created_at: Utc::now(),
        }
    }
}

/// Persisted server settings. Only `request_timeout_secs` affects forwarding;
/// the retry fields are stored for operators but never consulted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerSettings {
    #[serde(default = "default_settings_host")]
    pub host: String,
    #[serde(default = "default_settings_port")]
    pub port: u16,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub is_running: bool,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

fn default_settings_host() -> String {
    "0.0.0.0".to_string()
}

fn default_settings_port() -> u16 {
    3000
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_request_timeout() -> u64 {
    120
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_settings_host(),
            port: default_settings_port(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            request_timeout_secs: default_request_timeout(),
            is_running: false,
            created_at: Utc::now(),
        }
    }
}

/// One row per forward attempt that reached a provider (or failed trying).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestLogEntry {
    pub id: String,
    pub model_id: String,
    pub method: String,
    pub path: String,
    /// Absent when the exchange failed at the transport level
    pub status_code: Option<u16>,
    pub duration_ms: Option<u64>,
    pub error_message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl RequestLogEntry {
    pub fn new(model_id: &str, method: &str, path: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            model_id: model_id.to_string(),
            method: method.to_string(),
            path: path.to_string(),
            status_code: None,
            duration_ms: None,
            error_message: None,
            timestamp: Utc::now(),
        }
    }
}

/// What the gateway needs from whatever persists its records.
///
/// Calls are synchronous and may touch the filesystem; async callers run
/// writes on the blocking pool.
pub trait ModelStore: Send + Sync {
    fn enabled_models(&self) -> Result<Vec<ModelConfig>, StoreError>;

    /// Enabled configuration whose model id equals `model_id`. With duplicates,
    /// the most recently created one wins.
    fn find_enabled_model(&self, model_id: &str) -> Result<Option<ModelConfig>, StoreError>;

    fn append_log(&self, entry: RequestLogEntry) -> Result<(), StoreError>;

    fn server_settings(&self) -> Result<ServerSettings, StoreError>;

    fn save_server_settings(&self, settings: &ServerSettings) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreData {
    #[serde(default)]
    models: Vec<ModelConfig>,
    #[serde(default)]
    server: ServerSettings,
}

#[derive(Default)]
struct LogState {
    /// Rows of an in-memory store
    memory: VecDeque<RequestLogEntry>,
    /// Rows in the sidecar file, counted on first append
    file_rows: Option<usize>,
}

/// JSON document store for models and settings. Without a path it lives only in memory.
///
/// The document is replaced atomically (temp file + rename) under an exclusive
/// `.lock` file, and every write re-reads it first, so a gateway and a CLI can
/// share one file without dropping each other's edits. Readers reload whenever
/// the file changed on disk. Request log rows go to an append-only JSON-lines
/// sidecar (`<name>.requests.jsonl`) so a forwarded request never rewrites the
/// document.
pub struct JsonStore {
    path: Option<PathBuf>,
    data: RwLock<StoreData>,
    seen_modified: Mutex<Option<SystemTime>>,
    logs: Mutex<LogState>,
    log_capacity: usize,
}

impl JsonStore {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            data: RwLock::new(StoreData::default()),
            seen_modified: Mutex::new(None),
            logs: Mutex::new(LogState::default()),
            log_capacity: MAX_STORED_LOGS,
        }
    }

    /// Open the store at `path`; a missing file yields an empty store.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let (data, modified) = if path.exists() {
            read_data(&path)?
        } else {
            (StoreData::default(), None)
        };

        debug!(
            path = %path.display(),
            models = data.models.len(),
            "Opened store"
        );

        Ok(Self {
            path: Some(path),
            data: RwLock::new(data),
            seen_modified: Mutex::new(modified),
            logs: Mutex::new(LogState::default()),
            log_capacity: MAX_STORED_LOGS,
        })
    }

    /// Keep at most `capacity` request log rows instead of [`MAX_STORED_LOGS`].
    pub fn with_log_capacity(mut self, capacity: usize) -> Self {
        self.log_capacity = capacity.max(1);
        self
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn all_models(&self) -> Result<Vec<ModelConfig>, StoreError> {
        self.refresh()?;
        Ok(self.data.read().models.clone())
    }

    /// Insert a model, or replace the record with the same identity.
    pub fn upsert_model(&self, model: ModelConfig) -> Result<(), StoreError> {
        self.mutate(|data| {
            match data.models.iter_mut().find(|m| m.id == model.id) {
                Some(existing) => *existing = model,
                None => data.models.push(model),
            }
            true
        })
    }

    /// Remove every record with this model id. Returns how many were removed.
    pub fn remove_model(&self, model_id: &str) -> Result<usize, StoreError> {
        let mut removed = 0;
        self.mutate(|data| {
            let before = data.models.len();
            data.models.retain(|m| m.model_id != model_id);
            removed = before - data.models.len();
            removed > 0
        })?;
        Ok(removed)
    }

    /// Toggle every record with this model id. Returns how many matched.
    pub fn set_enabled(&self, model_id: &str, enabled: bool) -> Result<usize, StoreError> {
        let mut matched = 0;
        self.mutate(|data| {
            for model in data.models.iter_mut().filter(|m| m.model_id == model_id) {
                model.enabled = enabled;
                matched += 1;
            }
            matched > 0
        })?;
        Ok(matched)
    }

    /// The newest `count` request log rows, oldest first.
    pub fn recent_logs(&self, count: usize) -> Result<Vec<RequestLogEntry>, StoreError> {
        let count = count.min(self.log_capacity);
        let Some(path) = &self.path else {
            let logs = self.logs.lock();
            let start = logs.memory.len().saturating_sub(count);
            return Ok(logs.memory.iter().skip(start).cloned().collect());
        };

        let mut rows = read_log_rows(&log_path(path))?;
        let start = rows.len().saturating_sub(count);
        Ok(rows.split_off(start))
    }

    /// Re-read, apply `change`, and write back when it reports a modification,
    /// all under the cross-process lock.
    fn mutate(&self, change: impl FnOnce(&mut StoreData) -> bool) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            change(&mut self.data.write());
            return Ok(());
        };

        let _lock = StoreLock::acquire(path)?;
        // Lock order is always file lock, data, then seen_modified
        let mut data = self.data.write();
        let mut seen = self.seen_modified.lock();

        if path.exists() {
            let (fresh, modified) = read_data(path)?;
            *data = fresh;
            *seen = modified;
        }

        if change(&mut data) {
            write_atomic(path, &data)?;
            *seen = modified_time(path);
        }
        Ok(())
    }

    fn refresh(&self) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let Some(modified) = modified_time(path) else {
            return Ok(());
        };
        if *self.seen_modified.lock() == Some(modified) {
            return Ok(());
        }

        let mut data = self.data.write();
        let mut seen = self.seen_modified.lock();
        if *seen == Some(modified) {
            return Ok(());
        }

        // Writers rename a complete file into place, so no lock is needed here
        let (fresh, modified) = read_data(path)?;
        debug!(path = %path.display(), "Store changed on disk, reloading");
        *data = fresh;
        *seen = modified;
        Ok(())
    }

    fn append_file_log(&self, path: &Path, entry: &RequestLogEntry) -> Result<(), StoreError> {
        let log_path = log_path(path);
        let mut line = serde_json::to_string(entry).map_err(StoreError::Serialize)?;
        line.push('\n');

        let _lock = StoreLock::acquire(path)?;
        let mut logs = self.logs.lock();
        let rows = match logs.file_rows {
            Some(rows) => rows,
            None => count_lines(&log_path)?,
        };

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(io_error(&log_path))?;
        file.write_all(line.as_bytes())
            .map_err(io_error(&log_path))?;

        let rows = rows + 1;
        let slack = (self.log_capacity / 10).max(1);
        logs.file_rows = Some(if rows > self.log_capacity + slack {
            trim_log(&log_path, self.log_capacity)?
        } else {
            rows
        });
        Ok(())
    }
}

impl ModelStore for JsonStore {
    fn enabled_models(&self) -> Result<Vec<ModelConfig>, StoreError> {
        self.refresh()?;
        Ok(self
            .data
            .read()
            .models
            .iter()
            .filter(|m| m.enabled)
            .cloned()
            .collect())
    }

    fn find_enabled_model(&self, model_id: &str) -> Result<Option<ModelConfig>, StoreError> {
        self.refresh()?;
        // max_by_key keeps the last of equal keys, so ties go to the later record
        Ok(self
            .data
            .read()
            .models
            .iter()
            .filter(|m| m.enabled && m.model_id == model_id)
            .max_by_key(|m| m.created_at)
            .cloned())
    }

    fn append_log(&self, entry: RequestLogEntry) -> Result<(), StoreError> {
        match &self.path {
            Some(path) => self.append_file_log(path, &entry),
            None => {
                let mut logs = self.logs.lock();
                logs.memory.push_back(entry);
                while logs.memory.len() > self.log_capacity {
                    logs.memory.pop_front();
                }
                Ok(())
            }
        }
    }

    fn server_settings(&self) -> Result<ServerSettings, StoreError> {
        self.refresh()?;
        Ok(self.data.read().server.clone())
    }

    fn save_server_settings(&self, settings: &ServerSettings) -> Result<(), StoreError> {
        let settings = settings.clone();
        self.mutate(|data| {
            data.server = settings;
            true
        })
    }
}

/// Exclusive fs2 lock on `<store>.lock`, released on drop.
struct StoreLock(File);

impl StoreLock {
    fn acquire(store_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = store_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(io_error(parent))?;
        }

        let lock_path = store_path.with_extension("lock");
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(io_error(&lock_path))?;
        file.lock_exclusive().map_err(io_error(&lock_path))?;
        Ok(Self(file))
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.0) {
            warn!(error = %e, "Failed to release store lock");
        }
    }
}

fn io_error(path: &Path) -> impl Fn(io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.display().to_string(),
        source,
    }
}

fn log_path(store_path: &Path) -> PathBuf {
    store_path.with_extension("requests.jsonl")
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Content and mtime come from the same open handle, so a concurrent rename
/// cannot pair new content with an old timestamp.
fn read_data(path: &Path) -> Result<(StoreData, Option<SystemTime>), StoreError> {
    let mut file = File::open(path).map_err(io_error(path))?;
    let modified = file.metadata().and_then(|m| m.modified()).ok();
    let mut content = String::new();
    file.read_to_string(&mut content)
        .map_err(io_error(path))?;

    let data = if content.trim().is_empty() {
        StoreData::default()
    } else {
        serde_json::from_str(&content).map_err(|source| StoreError::Corrupt {
            path: path.display().to_string(),
            source,
        })?
    };
    Ok((data, modified))
}

/// Write to `<name>.tmp` and rename over the original.
fn write_atomic(path: &Path, data: &StoreData) -> Result<(), StoreError> {
    let content = serde_json::to_string_pretty(data).map_err(StoreError::Serialize)?;
    let temp_path = path.with_extension("tmp");
    std::fs::write(&temp_path, content).map_err(io_error(&temp_path))?;
    std::fs::rename(&temp_path, path).map_err(io_error(path))
}

fn read_log_rows(log_path: &Path) -> Result<Vec<RequestLogEntry>, StoreError> {
    let content = match std::fs::read_to_string(log_path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(io_error(log_path)(e)),
    };

    Ok(content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match serde_json::from_str(line) {
            Ok(row) => Some(row),
            Err(e) => {
                warn!(error = %e, "Skipping unreadable request log row");
                None
            }
        })
        .collect())
}

fn count_lines(log_path: &Path) -> Result<usize, StoreError> {
    match std::fs::read_to_string(log_path) {
        Ok(content) => Ok(content.lines().filter(|l| !l.trim().is_empty()).count()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(io_error(log_path)(e)),
    }
}

/// Rewrite the sidecar keeping only the newest `capacity` rows. Returns the rows kept.
fn trim_log(log_path: &Path, capacity: usize) -> Result<usize, StoreError> {
    let content = std::fs::read_to_string(log_path).map_err(io_error(log_path))?;
    let lines: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
    let kept = &lines[lines.len().saturating_sub(capacity)..];

    let mut trimmed = kept.join("\n");
    trimmed.push('\n');
    let temp_path = log_path.with_extension("tmp");
    std::fs::write(&temp_path, trimmed).map_err(io_error(&temp_path))?;
    std::fs::rename(&temp_path, log_path).map_err(io_error(log_path))?;

    debug!(path = %log_path.display(), kept = kept.len(), "Trimmed request log");
    Ok(kept.len())
}
