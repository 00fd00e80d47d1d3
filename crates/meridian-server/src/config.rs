//! Server configuration

use anyhow::Context;
use meridian_core::{DatabaseConfig, ReplicationConfig, RevisionsCollectionConfiguration, RevisionsConfiguration};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default location of the optional TOML file
pub const DEFAULT_CONFIG_PATH: &str = "config/meridian.toml";

/// Server configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Replication listener address
    pub addr: SocketAddr,
    /// Root data directory; the database lives in `<data_dir>/<name>`
    pub data_dir: PathBuf,
    /// Emit JSON log lines
    pub log_json: bool,
    /// Database settings
    pub database: DatabaseSection,
    /// Incoming replication settings
    pub replication: ReplicationSection,
    /// Document versioning
    pub revisions: RevisionsSection,
}

/// `[database]` table
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseSection {
    /// Database name
    pub name: String,
    /// Node tag
    pub node_tag: String,
    /// Fixed database id
    pub database_id: Option<String>,
    /// LMDB map size in MiB
    pub map_size_mb: usize,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            node_tag: "A".to_string(),
            database_id: None,
            map_size_mb: 256,
        }
    }
}

/// `[replication]` table
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReplicationSection {
    /// Peer read timeout in seconds
    pub active_connection_timeout_secs: u64,
    /// Initial session read buffer size
    pub read_buffer_size: usize,
    /// Largest accepted envelope
    pub max_frame_size: usize,
    /// Largest accepted length-prefixed item field
    pub max_item_size: usize,
    /// Batch document bytes before a warning
    pub max_batch_document_bytes: u64,
    /// Reply `MissingAttachments` instead of applying documents without their blobs
    pub supports_missing_attachments: bool,
    /// Transaction merger queue capacity
    pub merger_queue_capacity: usize,
}

impl Default for ReplicationSection {
    fn default() -> Self {
        let defaults = ReplicationConfig::default();
        Self {
            active_connection_timeout_secs: defaults.active_connection_timeout.as_secs(),
            read_buffer_size: defaults.read_buffer_size,
            max_frame_size: defaults.max_frame_size,
            max_item_size: defaults.max_item_size,
            max_batch_document_bytes: defaults.max_batch_document_bytes,
            supports_missing_attachments: defaults.supports_missing_attachments,
            merger_queue_capacity: defaults.merger_queue_capacity,
        }
    }
}

/// `[revisions]` table; applies to every collection
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RevisionsSection {
    /// Version documents
    pub enabled: bool,
    /// Revisions kept per document
    pub minimum_revisions_to_keep: Option<u64>,
    /// Revisions younger than this are never dropped
    pub minimum_revision_age_days: Option<u64>,
    /// Drop the chain when the document is deleted
    pub purge_on_delete: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigFile {
    bind_addr: Option<String>,
    data_dir: Option<String>,
    log_json: Option<bool>,
    database: DatabaseSection,
    replication: ReplicationSection,
    revisions: RevisionsSection,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], 17800)),
            data_dir: PathBuf::from("./data"),
            log_json: false,
            database: DatabaseSection::default(),
            replication: ReplicationSection::default(),
            revisions: RevisionsSection::default(),
        }
    }
}

impl Config {
    /// Load from the process environment and the config file it points to.
    /// Priority: environment variables > config file > defaults
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load with `lookup` standing in for the environment
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let path = lookup("MERIDIAN_CONFIG").unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
        let mut config = match Self::read_file(Path::new(&path))? {
            Some(file) => Self::from_file(file)?,
            None => Self::default(),
        };

        if let Some(addr) = lookup("MERIDIAN_BIND_ADDR") {
            config.addr = addr
                .parse()
                .with_context(|| format!("Invalid MERIDIAN_BIND_ADDR '{}'", addr))?;
        }
        if let Some(data_dir) = lookup("MERIDIAN_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }
        if let Some(name) = lookup("MERIDIAN_DATABASE") {
            config.database.name = name;
        }
        if let Some(tag) = lookup("MERIDIAN_NODE_TAG") {
            config.database.node_tag = tag;
        }
        if let Some(json) = lookup("MERIDIAN_LOG_JSON") {
            config.log_json = json.parse::<bool>().unwrap_or(config.log_json);
        }
        Ok(config)
    }

    /// Load a specific file, ignoring `MERIDIAN_CONFIG`
    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let file = Self::read_file(path)?
            .with_context(|| format!("Config file not found: {:?}", path))?;
        Self::from_file(file)
    }

    fn read_file(path: &Path) -> anyhow::Result<Option<ConfigFile>> {
        if !path.exists() {
            tracing::debug!("Config file not found: {:?}", path);
            return Ok(None);
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        let file = toml::from_str::<ConfigFile>(&content)
            .with_context(|| format!("Failed to parse config file {:?}", path))?;
        tracing::info!("Loaded configuration from {:?}", path);
        Ok(Some(file))
    }

    fn from_file(file: ConfigFile) -> anyhow::Result<Self> {
        let defaults = Self::default();
        let addr = match file.bind_addr {
            Some(addr) => addr
                .parse()
                .with_context(|| format!("Invalid bind_addr '{}'", addr))?,
            None => defaults.addr,
        };
        Ok(Self {
            addr,
            data_dir: file.data_dir.map(PathBuf::from).unwrap_or(defaults.data_dir),
            log_json: file.log_json.unwrap_or(defaults.log_json),
            database: file.database,
            replication: file.replication,
            revisions: file.revisions,
        })
    }

    /// Set the bind address
    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    /// Set the data directory
    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = data_dir.into();
        self
    }

    /// Core configuration of the served database
    pub fn database_config(&self) -> anyhow::Result<DatabaseConfig> {
        let replication = ReplicationConfig {
            active_connection_timeout: Duration::from_secs(self.replication.active_connection_timeout_secs),
            read_buffer_size: self.replication.read_buffer_size,
            max_frame_size: self.replication.max_frame_size,
            max_item_size: self.replication.max_item_size,
            max_batch_document_bytes: self.replication.max_batch_document_bytes,
            supports_missing_attachments: self.replication.supports_missing_attachments,
            merger_queue_capacity: self.replication.merger_queue_capacity,
        };

        let mut config = DatabaseConfig::new(&self.database.name, self.data_dir.join(&self.database.name))
            .with_node_tag(&self.database.node_tag)
            .with_map_size(self.database.map_size_mb * 1024 * 1024)
            .with_replication(replication);
        if let Some(id) = &self.database.database_id {
            config = config.with_database_id(id);
        }
        if self.revisions.enabled {
            let mut default = RevisionsCollectionConfiguration::enabled()
                .with_purge_on_delete(self.revisions.purge_on_delete);
            if let Some(keep) = self.revisions.minimum_revisions_to_keep {
                default = default.with_minimum_revisions_to_keep(keep);
            }
            if let Some(days) = self.revisions.minimum_revision_age_days {
                default = default.with_minimum_revision_age_to_keep(Duration::from_secs(days * 24 * 3600));
            }
            config = config.with_revisions(RevisionsConfiguration::with_default(default));
        }

        config.validate().map_err(|e| anyhow::anyhow!("Invalid database configuration: {}", e))?;
        Ok(config)
    }
}
