use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_CONFIG_FILE: &str = "gmex.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreSettings,
    #[serde(default)]
    pub sync: SyncSettings,
    #[serde(default)]
    pub provider: ProviderSettings,
    #[serde(default)]
    pub auth: AuthSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// Archive directory. Resolved from the environment when unset.
    pub root: Option<PathBuf>,
    pub io_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub query: String,
    pub limit: usize,
    pub workers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub call_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    pub credentials_path: PathBuf,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            root: None,
            io_timeout_secs: 30,
        }
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            query: "in:inbox".to_string(),
            limit: 50,
            workers: 4,
        }
    }
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 8_000,
            call_timeout_secs: 30,
        }
    }
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            credentials_path: PathBuf::from("credentials.json"),
        }
    }
}

/// Snapshot of the environment variables the config layer honours.
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    pub data_dir: Option<String>,
    pub xdg_data_home: Option<String>,
    pub home: Option<String>,
    pub query: Option<String>,
    pub limit: Option<String>,
}

impl EnvOverrides {
    pub fn from_process() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        Self {
            data_dir: var("EMAIL_ARCHIVE_DATA_DIR"),
            xdg_data_home: var("XDG_DATA_HOME"),
            home: var("HOME"),
            query: var("GMEX_QUERY"),
            limit: var("GMEX_LIMIT"),
        }
    }
}

impl Config {
    /// Loads `path` (or `gmex.toml` in the working directory) and applies the
    /// process environment. A missing or unreadable file yields defaults.
    pub fn load(path: Option<&Path>) -> Self {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => config,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "ignoring invalid config file");
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        };
        config.apply_env(&EnvOverrides::from_process());
        config
    }

    pub fn apply_env(&mut self, env: &EnvOverrides) {
        if let Some(dir) = &env.data_dir {
            self.store.root = Some(PathBuf::from(dir));
        }
        if self.store.root.is_none() {
            let base = match (&env.xdg_data_home, &env.home) {
                (Some(xdg), _) => PathBuf::from(xdg),
                (None, Some(home)) => Path::new(home).join(".local").join("share"),
                (None, None) => PathBuf::from("."),
            };
            self.store.root = Some(base.join("email-archive"));
        }
        if let Some(query) = &env.query {
            self.sync.query = query.clone();
        }
        if let Some(limit) = &env.limit {
            match limit.parse() {
                Ok(limit) => self.sync.limit = limit,
                Err(_) => warn!(value = %limit, "ignoring non-numeric GMEX_LIMIT"),
            }
        }
    }

    pub fn store_root(&self) -> PathBuf {
        self.store
            .root
            .clone()
            .unwrap_or_else(|| PathBuf::from("email-archive"))
    }
}

impl StoreSettings {
    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs.max(1))
    }
}

impl ProviderSettings {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs.max(1))
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}
