//! Database, revisions and replication configuration

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// How long conflict revisions are kept when nothing else is configured
pub const CONFLICT_REVISIONS_MAX_AGE: Duration = Duration::from_secs(45 * 24 * 60 * 60);

/// Retention policy for one collection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RevisionsCollectionConfiguration {
    /// Do not create revisions for this collection
    pub disabled: bool,
    /// Keep at most this many revisions per document
    pub minimum_revisions_to_keep: Option<u64>,
    /// Never drop revisions younger than this
    pub minimum_revision_age_to_keep: Option<Duration>,
    /// Drop the whole chain when the document is deleted
    pub purge_on_delete: bool,
}

impl RevisionsCollectionConfiguration {
    /// Versioning enabled with no retention limits
    pub fn enabled() -> Self {
        Self::default()
    }

    /// Configuration that never versions
    pub fn disabled() -> Self {
        Self {
            disabled: true,
            ..Default::default()
        }
    }

    /// Set the count limit
    pub fn with_minimum_revisions_to_keep(mut self, count: u64) -> Self {
        self.minimum_revisions_to_keep = Some(count);
        self
    }

    /// Set the age limit
    pub fn with_minimum_revision_age_to_keep(mut self, age: Duration) -> Self {
        self.minimum_revision_age_to_keep = Some(age);
        self
    }

    /// Enable/disable purge on delete
    pub fn with_purge_on_delete(mut self, purge: bool) -> Self {
        self.purge_on_delete = purge;
        self
    }

    /// True if any retention limit applies
    pub fn has_retention(&self) -> bool {
        self.minimum_revisions_to_keep.is_some() || self.minimum_revision_age_to_keep.is_some()
    }
}

/// Revisions configuration of one database
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RevisionsConfiguration {
    /// Applies to collections without their own entry
    pub default: Option<RevisionsCollectionConfiguration>,
    /// Per-collection overrides, keyed by collection name
    pub collections: HashMap<String, RevisionsCollectionConfiguration>,
}

impl RevisionsConfiguration {
    /// Configuration with a default entry
    pub fn with_default(default: RevisionsCollectionConfiguration) -> Self {
        Self {
            default: Some(default),
            collections: HashMap::new(),
        }
    }

    /// Add a collection override
    pub fn with_collection(
        mut self,
        collection: impl Into<String>,
        config: RevisionsCollectionConfiguration,
    ) -> Self {
        self.collections.insert(collection.into(), config);
        self
    }

    /// Policy used for conflict and resolved revisions
    pub fn conflicts() -> Self {
        Self::with_default(
            RevisionsCollectionConfiguration::enabled()
                .with_minimum_revision_age_to_keep(CONFLICT_REVISIONS_MAX_AGE),
        )
    }

    /// Collection override lookup, case-insensitive
    pub fn collection(&self, collection: &str) -> Option<&RevisionsCollectionConfiguration> {
        self.collections.get(collection).or_else(|| {
            self.collections
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(collection))
                .map(|(_, config)| config)
        })
    }
}

/// Incoming replication settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Peer read timeout; keep-alive frames are sent well inside it
    pub active_connection_timeout: Duration,

    /// Initial size of the session read buffer
    pub read_buffer_size: usize,

    /// Largest accepted JSON envelope
    pub max_frame_size: usize,

    /// Largest length-prefixed field of a replication item (document body, id, key)
    pub max_item_size: usize,

    /// Document bytes per batch before a warning is logged
    pub max_batch_document_bytes: u64,

    /// The peer understands the missing-attachments reply
    pub supports_missing_attachments: bool,

    /// Capacity of the transaction merger queue
    pub merger_queue_capacity: usize,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            active_connection_timeout: Duration::from_secs(60),
            read_buffer_size: 32 * 1024,
            max_frame_size: 16 * 1024 * 1024,
            max_item_size: 64 * 1024 * 1024,
            max_batch_document_bytes: 128 * 1024 * 1024,
            supports_missing_attachments: true,
            merger_queue_capacity: 1024,
        }
    }
}

impl ReplicationConfig {
    /// Set the active connection timeout
    pub fn with_active_connection_timeout(mut self, timeout: Duration) -> Self {
        self.active_connection_timeout = timeout;
        self
    }

    /// Set the initial read buffer size
    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    /// Set the largest accepted item field
    pub fn with_max_item_size(mut self, size: usize) -> Self {
        self.max_item_size = size;
        self
    }

    /// Enable/disable the missing-attachments handshake
    pub fn with_missing_attachments_support(mut self, enabled: bool) -> Self {
        self.supports_missing_attachments = enabled;
        self
    }

    /// Interval between "Processing" frames while a batch is applied
    pub fn keep_alive_interval(&self) -> Duration {
        let two_thirds = self.active_connection_timeout * 2 / 3;
        two_thirds.min(Duration::from_millis(3000))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.active_connection_timeout.is_zero() {
            return Err("active_connection_timeout must be greater than zero".into());
        }
        if self.read_buffer_size < 16 {
            return Err("read_buffer_size must be at least 16 bytes".into());
        }
        if self.max_frame_size == 0 {
            return Err("max_frame_size must be at least 1".into());
        }
        if self.max_item_size == 0 {
            return Err("max_item_size must be at least 1".into());
        }
        if self.merger_queue_capacity == 0 {
            return Err("merger_queue_capacity must be at least 1".into());
        }
        Ok(())
    }
}

/// Configuration of one database
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database name
    pub name: String,

    /// Directory holding the LMDB environment
    pub data_dir: PathBuf,

    /// Tag of the node hosting this database
    pub node_tag: String,

    /// Fixed database id; generated and persisted on first open when absent
    pub database_id: Option<String>,

    /// LMDB map size in bytes
    pub map_size: usize,

    /// Revisions configuration; `None` means documents are not versioned
    pub revisions: Option<RevisionsConfiguration>,

    /// Policy applied to conflict and resolved revisions
    pub conflict_revisions: RevisionsConfiguration,

    /// Incoming replication settings
    pub replication: ReplicationConfig,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            data_dir: PathBuf::from("./data"),
            node_tag: "A".to_string(),
            database_id: None,
            map_size: 256 * 1024 * 1024,
            revisions: None,
            conflict_revisions: RevisionsConfiguration::conflicts(),
            replication: ReplicationConfig::default(),
        }
    }
}

impl DatabaseConfig {
    /// Configuration for `name` stored under `data_dir`
    pub fn new(name: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Set the node tag
    pub fn with_node_tag(mut self, tag: impl Into<String>) -> Self {
        self.node_tag = tag.into();
        self
    }

    /// Pin the database id
    pub fn with_database_id(mut self, id: impl Into<String>) -> Self {
        self.database_id = Some(id.into());
        self
    }

    /// Set the LMDB map size
    pub fn with_map_size(mut self, map_size: usize) -> Self {
        self.map_size = map_size;
        self
    }

    /// Enable revisions
    pub fn with_revisions(mut self, revisions: RevisionsConfiguration) -> Self {
        self.revisions = Some(revisions);
        self
    }

    /// Replace replication settings
    pub fn with_replication(mut self, replication: ReplicationConfig) -> Self {
        self.replication = replication;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("database name must not be empty".into());
        }
        if self.node_tag.is_empty() {
            return Err("node_tag must not be empty".into());
        }
        if let Some(id) = &self.database_id {
            if id.is_empty() || id.contains(':') || id.contains(',') {
                return Err(format!("database_id '{}' is not a valid change vector id", id));
            }
        }
        if self.map_size < 1024 * 1024 {
            return Err("map_size must be at least 1 MiB".into());
        }
        self.replication.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DatabaseConfig::default();
        assert!(config.revisions.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_conflict_configuration() {
        let conflicts = RevisionsConfiguration::conflicts();
        let default = conflicts.default.unwrap();
        assert!(!default.disabled);
        assert_eq!(default.minimum_revisions_to_keep, None);
        assert_eq!(default.minimum_revision_age_to_keep, Some(CONFLICT_REVISIONS_MAX_AGE));
    }

    #[test]
    fn test_collection_lookup_is_case_insensitive() {
        let config = RevisionsConfiguration::default().with_collection(
            "Users",
            RevisionsCollectionConfiguration::enabled().with_minimum_revisions_to_keep(3),
        );
        assert!(config.collection("users").is_some());
        assert!(config.collection("Orders").is_none());
    }

    #[test]
    fn test_keep_alive_interval() {
        let config = ReplicationConfig::default();
        assert_eq!(config.keep_alive_interval(), Duration::from_millis(3000));

        let short = config.with_active_connection_timeout(Duration::from_millis(900));
        assert_eq!(short.keep_alive_interval(), Duration::from_millis(600));
    }

    #[test]
    fn test_invalid_database_id() {
        let config = DatabaseConfig::default().with_database_id("a:b");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_replication_validation() {
        let mut config = ReplicationConfig::default();
        config.merger_queue_capacity = 0;
        assert!(config.validate().is_err());

        let config = ReplicationConfig::default().with_max_item_size(0);
        assert!(config.validate().is_err());
    }
}
