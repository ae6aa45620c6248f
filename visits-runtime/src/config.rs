use {
    std::{path::PathBuf, fs, time::Duration},
    serde::Deserialize,
    thiserror::Error,
    tracing::warn,
    visits_common::COUNTER_KEY_DEFAULT,
    crate::kv::{BoxedStorage, SqliteStorage, MemoryStorage, NamespacedStorage},
};

const DEFAULT_HTTP_PORT: u16 = 8080;
const DEFAULT_METRICS_PORT: u16 = 8081;
const DEFAULT_COUNTER_TIMEOUT_MS: u64 = 3000;

#[derive(Deserialize, Clone, Debug)]
pub struct ServerConfig {
    #[serde(skip_deserializing)]
    pub config_path: Option<PathBuf>,

    #[serde(default)]
    pub http: HttpConfig,
    pub metrics_port: Option<u16>,

    pub kv: KvConfig,
    #[serde(default)]
    pub counter: CounterConfig,
}

#[derive(Deserialize, Clone, Debug, Default)]
pub struct HttpConfig {
    pub port: Option<u16>,
    /// Paths served by the counter handler. Entries ending with `/` match as prefixes.
    /// Absent or empty means every path.
    pub routes: Option<Vec<String>>,
}

#[derive(Deserialize, Clone, Debug, Eq, PartialEq)]
pub struct KvConfig {
    #[serde(flatten)]
    pub driver: KvDriverConfig,
    pub table: Option<String>,
}

#[derive(Deserialize, Clone, Debug, Eq, PartialEq)]
#[serde(tag = "driver")]
pub enum KvDriverConfig {
    #[serde(rename = "sqlite")]
    Sqlite {
        path: Option<String>,
        in_memory: Option<bool>,
        busy_timeout_ms: Option<u64>,
    },
    #[serde(rename = "memory")]
    Memory,
}

#[derive(Deserialize, Clone, Debug, Default)]
pub struct CounterConfig {
    pub key: Option<String>,
    pub timeout_ms: Option<u64>,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0:?}")]
    FailedToRead(std::io::Error),

    #[error("failed to parse config: {reason}")]
    FailedToParse { reason: String },

    #[error("invalid kv configuration: {reason}")]
    InvalidKv { reason: String },
}

impl ServerConfig {
    pub fn new(kv: KvConfig) -> Self {
        Self {
            config_path: None,
            http: HttpConfig::default(),
            metrics_port: None,
            kv,
            counter: CounterConfig::default(),
        }
    }

    pub fn load(file_path: PathBuf) -> Result<Self, ConfigError> {
        let content = fs::read(&file_path).map_err(ConfigError::FailedToRead)?;
        let mut config = Self::parse(&content)?;
        config.config_path = Some(file_path);
        Ok(config)
    }

    pub fn parse(content: &[u8]) -> Result<Self, ConfigError> {
        serde_yml::from_slice(content)
            .map_err(|err| ConfigError::FailedToParse { reason: err.to_string() })
    }

    pub fn with_http_port(mut self, port: u16) -> Self {
        self.http.port = Some(port);
        self
    }

    pub fn with_routes(mut self, routes: Vec<String>) -> Self {
        self.http.routes = Some(routes);
        self
    }

    pub fn with_metrics_port(mut self, port: u16) -> Self {
        self.metrics_port = Some(port);
        self
    }

    pub fn with_counter_key(mut self, key: impl Into<String>) -> Self {
        self.counter.key = Some(key.into());
        self
    }

    pub fn with_counter_timeout(mut self, timeout: Duration) -> Self {
        self.counter.timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn http_port(&self) -> u16 {
        self.http.port.unwrap_or(DEFAULT_HTTP_PORT)
    }

    pub fn routes(&self) -> Vec<String> {
        self.http.routes.clone().unwrap_or_default()
    }

    pub fn metrics_port(&self) -> u16 {
        self.metrics_port.unwrap_or(DEFAULT_METRICS_PORT)
    }

    pub fn counter_key(&self) -> String {
        self.counter.key.clone().unwrap_or_else(|| COUNTER_KEY_DEFAULT.to_owned())
    }

    pub fn counter_timeout(&self) -> Duration {
        Duration::from_millis(self.counter.timeout_ms.unwrap_or(DEFAULT_COUNTER_TIMEOUT_MS))
    }
}

impl KvConfig {
    pub fn memory() -> Self {
        Self { driver: KvDriverConfig::Memory, table: None }
    }

    pub fn sqlite_in_memory() -> Self {
        Self {
            driver: KvDriverConfig::Sqlite { path: None, in_memory: Some(true), busy_timeout_ms: None },
            table: None,
        }
    }

    pub fn sqlite(path: impl Into<String>) -> Self {
        Self {
            driver: KvDriverConfig::Sqlite { path: Some(path.into()), in_memory: None, busy_timeout_ms: None },
            table: None,
        }
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }
}

/// Busy timeout of sqlite connections defaults to, and is capped at, half of `counter_timeout`.
pub fn kv_from_config(config: &KvConfig, counter_timeout: Duration) -> Result<BoxedStorage, ConfigError> {
    match &config.driver {
        KvDriverConfig::Sqlite { path, in_memory, busy_timeout_ms } => {
            let busy_timeout_cap = counter_timeout / 2;
            let busy_timeout = match busy_timeout_ms.map(Duration::from_millis) {
                Some(v) if v > busy_timeout_cap => {
                    warn!("kv busy_timeout_ms {v:?} exceeds half of counter timeout, using {busy_timeout_cap:?}");
                    busy_timeout_cap
                },
                Some(v) => v,
                None => busy_timeout_cap,
            };

            let storage = if in_memory.unwrap_or(false) {
                SqliteStorage::in_memory()
                    .map_err(|err| ConfigError::InvalidKv { reason: format!("failed to open in-memory sqlite: {err}") })?
            } else {
                let path = path.as_ref()
                    .ok_or_else(|| ConfigError::InvalidKv { reason: "sqlite driver requires either path or in_memory: true".to_owned() })?;
                let path = PathBuf::from(path);
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        fs::create_dir_all(parent)
                            .map_err(|err| ConfigError::InvalidKv { reason: format!("failed to create directory for sqlite database: {err:?}") })?;
                    }
                }
                SqliteStorage::new_with_busy_timeout(&path, busy_timeout)
                    .map_err(|err| ConfigError::InvalidKv { reason: format!("failed to open sqlite database at {path:?}: {err}") })?
            };

            Ok(namespaced(storage, config.table.as_deref()))
        },
        KvDriverConfig::Memory => Ok(namespaced(MemoryStorage::new(), config.table.as_deref())),
    }
}

fn namespaced<T: crate::kv::KVStorage + Send + Sync + 'static>(storage: T, table: Option<&str>) -> BoxedStorage {
    match table {
        Some(table) => BoxedStorage::new(NamespacedStorage::new(format!("{table}/"), storage)),
        None => BoxedStorage::new(storage),
    }
}
