use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// Keeps `created_at + retention` far from chrono's range limits.
const MAX_RETENTION_SECS: u64 = 100 * 365 * 24 * 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen: String,
    pub database_path: String,
    pub uploads_dir: String,
    /// Origin that download links are built from, e.g. `https://files.example`.
    pub public_url: String,
    pub allowed_origins: Vec<String>,
    pub max_upload_size: u64,
    pub retention_secs: u64,
    pub reclaim_interval_secs: u64,
    pub max_db_connections: u32,
    pub client_request_timeout_secs: u64,
    pub client_disconnect_timeout_secs: u64,
    pub keep_alive_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:6969".to_string(),
            database_path: "./fleeting.sqlite3".to_string(),
            uploads_dir: "./uploads".to_string(),
            public_url: "http://localhost:6969".to_string(),
            allowed_origins: Vec::new(),
            max_upload_size: 100 * 1024 * 1024,
            retention_secs: 7 * 24 * 60 * 60,
            reclaim_interval_secs: 60 * 60,
            max_db_connections: 8,
            client_request_timeout_secs: 10,
            client_disconnect_timeout_secs: 30,
            keep_alive_secs: 120,
        }
    }
}

impl Config {
    /// Reads `path`, or writes the defaults there when it does not exist yet.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            toml::from_str(&contents).with_context(|| format!("failed to parse {}", path.display()))
        } else {
            let default_config = Config::default();
            let toml_string = toml::to_string_pretty(&default_config)
                .context("failed to serialize default config")?;
            std::fs::write(path, toml_string)
                .with_context(|| format!("failed to write {}", path.display()))?;
            Ok(default_config)
        }
    }

    pub fn from_env_config() -> anyhow::Result<Self> {
        let path = std::env::var("FLEETING_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config.toml"));
        let mut final_cfg = Self::load(&path)?;
        final_cfg.apply_env(|key| std::env::var(key).ok());

        std::fs::create_dir_all(&final_cfg.uploads_dir)
            .with_context(|| format!("failed to create uploads dir {}", final_cfg.uploads_dir))?;
        Ok(final_cfg)
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("FLEETING_LISTEN") {
            self.listen = v;
        }
        if let Some(v) = lookup("FLEETING_DATABASE_PATH") {
            self.database_path = v;
        }
        if let Some(v) = lookup("FLEETING_UPLOADS_DIR") {
            self.uploads_dir = v;
        }
        if let Some(v) = lookup("FLEETING_PUBLIC_URL") {
            self.public_url = v;
        }
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.retention_secs.min(MAX_RETENTION_SECS) as i64)
    }

    pub fn reclaim_interval(&self) -> Duration {
        Duration::from_secs(self.reclaim_interval_secs.max(1))
    }
}
