//! TestContext - test lifecycle and resource cleanup

use crate::config::DatabaseConfig;
use crate::database::Database;
use crate::storage::Storage;
use crate::time::{Clock, ManualClock};
use chrono::{TimeZone, Utc};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Context for managing test resources and lifecycle
///
/// Owns a temporary directory and a manual clock starting at
/// 2024-01-01T00:00:00Z. Everything opened through the context shares the
/// clock, so tests can move time forward deterministically.
pub struct TestContext {
    temp_dir: TempDir,
    clock: Arc<ManualClock>,
}

impl TestContext {
    /// Create a new TestContext with a unique temporary directory
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temporary directory");
        let start = Utc
            .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
            .single()
            .expect("valid start time");

        Self {
            temp_dir,
            clock: Arc::new(ManualClock::new(start)),
        }
    }

    /// Path to the temporary directory
    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Shared clock
    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    /// Move the shared clock forward
    pub fn advance_clock(&self, by: Duration) {
        self.clock.advance(by);
    }

    /// Small-map configuration for database `name` under the temp directory,
    /// with a fixed database id equal to the name
    pub fn database_config(&self, name: &str) -> DatabaseConfig {
        DatabaseConfig::new(name, self.path().join(name))
            .with_database_id(name)
            .with_map_size(64 * 1024 * 1024)
    }

    /// Open bare storage for database `name`
    pub fn storage(&self, name: &str) -> Storage {
        Storage::open(&self.database_config(name), self.clock()).expect("Failed to open storage")
    }

    /// Open database `name` with the default configuration
    pub fn database(&self, name: &str) -> Arc<Database> {
        self.open_database(self.database_config(name))
    }

    /// Open a database with a custom configuration
    pub fn open_database(&self, config: DatabaseConfig) -> Arc<Database> {
        Arc::new(Database::open_with_clock(config, self.clock()).expect("Failed to open database"))
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}
