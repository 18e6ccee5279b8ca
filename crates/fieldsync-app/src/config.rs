//! Application configuration.

use std::path::PathBuf;

use fieldsync_core::defaults::{
    ATTACHMENTS_DIR, DATABASE_FILE, DB_MAX_CONNECTIONS, MAX_CAPTURE_BYTES,
};
use fieldsync_db::PoolConfig;
use fieldsync_jobs::{HttpRemoteConfig, SchedulerConfig};

/// Everything needed to open a [`crate::FieldSync`] instance.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Directory holding the database file and the attachments directory.
    pub data_dir: PathBuf,
    /// Largest source binary `stage` accepts.
    pub max_capture_bytes: u64,
    pub pool: PoolConfig,
    pub scheduler: SchedulerConfig,
    /// `None` runs offline: captures queue up but nothing is uploaded.
    pub remote: Option<HttpRemoteConfig>,
}

impl AppConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            max_capture_bytes: MAX_CAPTURE_BYTES,
            pool: PoolConfig::default(),
            scheduler: SchedulerConfig::default(),
            remote: None,
        }
    }

    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `FIELDSYNC_DATA_DIR` | `./fieldsync-data` | Database and attachment storage |
    /// | `FIELDSYNC_MAX_CAPTURE_BYTES` | `20971520` | Largest accepted photo |
    /// | `FIELDSYNC_DB_MAX_CONNECTIONS` | `4` | Reader pool size |
    ///
    /// Scheduler and remote settings are read by [`SchedulerConfig::from_env`]
    /// and [`HttpRemoteConfig::from_env`].
    pub fn from_env() -> Self {
        let data_dir = std::env::var("FIELDSYNC_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./fieldsync-data"));

        let max_capture_bytes = std::env::var("FIELDSYNC_MAX_CAPTURE_BYTES")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(MAX_CAPTURE_BYTES);

        let max_connections = std::env::var("FIELDSYNC_DB_MAX_CONNECTIONS")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(DB_MAX_CONNECTIONS);

        Self {
            max_capture_bytes,
            pool: PoolConfig::new().max_connections(max_connections),
            scheduler: SchedulerConfig::from_env(),
            remote: HttpRemoteConfig::from_env(),
            ..Self::new(data_dir)
        }
    }

    pub fn with_max_capture_bytes(mut self, bytes: u64) -> Self {
        self.max_capture_bytes = bytes;
        self
    }

    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_remote(mut self, remote: HttpRemoteConfig) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(DATABASE_FILE)
    }

    pub fn attachments_dir(&self) -> PathBuf {
        self.data_dir.join(ATTACHMENTS_DIR)
    }
}
