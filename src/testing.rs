//! Testing utilities for migration development and verification.
//!
//! [SourceTreeBuilder] lays out a migration source tree in a temporary
//! directory, and [MigrationTestHarness] runs a SQLite-backed manager
//! against a private in-memory database with helpers for seeding data,
//! querying state and capturing schema snapshots.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use crate::driver::{SqlProvider, SqlProviderFactory};
use crate::engine::{InstallReport, MigrationManager, RollbackReport};
use crate::error::Error;
use crate::sources::{Direction, Sources};
use crate::sqlite::{SqliteDialect, SqliteDriver, SqliteMigrationManager, SqliteProvider};

static HARNESS_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Builds a migration source tree inside a temporary directory.
///
/// # Example
///
/// ```
/// use sqlmigration::testing::SourceTreeBuilder;
/// use sqlmigration::Direction;
///
/// let tree = SourceTreeBuilder::new()
///     .script("v0001", Direction::Install, "01-init.sql", "CREATE TABLE t (id INTEGER);")
///     .script("v0001", Direction::Rollback, "01-drop.sql", "DROP TABLE t;");
/// let sources = tree.load().unwrap();
/// assert_eq!(sources.version_names(), vec!["v0001"]);
/// ```
pub struct SourceTreeBuilder {
    root: TempDir,
}

impl SourceTreeBuilder {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            root: tempfile::tempdir().expect("failed to create temporary directory"),
        }
    }

    /// Add a script; the version and direction directories are created as
    /// needed.
    pub fn script(
        self,
        version: &str,
        direction: Direction,
        name: &str,
        content: &str,
    ) -> Self {
        let directory = self
            .root
            .path()
            .join(version)
            .join(direction.directory_name());
        fs::create_dir_all(&directory).expect("failed to create script directory");
        fs::write(directory.join(name), content).expect("failed to write script");
        self
    }

    /// Add an empty version directory (no scripts in either direction).
    pub fn empty_version(self, version: &str) -> Self {
        fs::create_dir_all(self.root.path().join(version))
            .expect("failed to create version directory");
        self
    }

    pub fn path(&self) -> &Path {
        self.root.path()
    }

    pub fn load(&self) -> Result<Sources, Error> {
        Sources::load_from_filesystem(&CancellationToken::new(), self.root.path())
    }
}

/// A captured database schema for comparison and snapshotting. Internal
/// SQLite tables and the manager's version table are excluded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    pub tables: BTreeMap<String, TableSchema>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    /// The CREATE statement as recorded by SQLite.
    pub sql: String,
    pub columns: Vec<ColumnInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub type_name: String,
    pub not_null: bool,
    pub primary_key: bool,
}

/// A test harness wrapping a [SqliteMigrationManager] over a private
/// shared-memory database.
///
/// # Example
///
/// ```
/// use sqlmigration::testing::{MigrationTestHarness, SourceTreeBuilder};
/// use sqlmigration::Direction;
///
/// let sources = SourceTreeBuilder::new()
///     .script("v0001", Direction::Install, "01-init.sql",
///             "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT);")
///     .load()
///     .unwrap();
/// let mut harness = MigrationTestHarness::new(sources).unwrap();
///
/// harness.install_all().unwrap();
/// harness.assert_table_exists("users").unwrap();
/// harness.execute("INSERT INTO users VALUES (1, 'alice')").unwrap();
/// let name: String = harness.query_one("SELECT name FROM users WHERE id = 1").unwrap();
/// assert_eq!(name, "alice");
/// ```
pub struct MigrationTestHarness {
    manager: SqliteMigrationManager,
    probe: SqliteProvider,
    cancel: CancellationToken,
}

impl MigrationTestHarness {
    pub fn new(sources: Sources) -> Result<Self, Error> {
        let name = format!(
            "sqlmigration_test_harness_{}",
            HARNESS_COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        let driver = SqliteDriver::shared_memory(name)?;
        let cancel = CancellationToken::new();
        let probe = driver.create(&cancel)?;
        let manager = MigrationManager::new(sources, driver, SqliteDialect);
        Ok(Self {
            manager,
            probe,
            cancel,
        })
    }

    pub fn manager(&self) -> &SqliteMigrationManager {
        &self.manager
    }

    /// Install every pending version.
    pub fn install_all(&self) -> Result<InstallReport, Error> {
        self.manager.install(&self.cancel, None)
    }

    /// Install pending versions up to and including `target_version`.
    pub fn install_to(&self, target_version: &str) -> Result<InstallReport, Error> {
        self.manager.install(&self.cancel, Some(target_version))
    }

    /// Roll back every installed version.
    pub fn rollback_all(&self) -> Result<RollbackReport, Error> {
        self.manager.rollback(&self.cancel, None)
    }

    /// Roll back installed versions down to (but not including)
    /// `target_version`.
    pub fn rollback_to(&self, target_version: &str) -> Result<RollbackReport, Error> {
        self.manager.rollback(&self.cancel, Some(target_version))
    }

    /// Run ad-hoc SQL against the database, e.g. to seed test data.
    pub fn execute(&mut self, sql: &str) -> Result<u64, Error> {
        self.probe.execute_sql(sql)
    }

    /// Run a query expected to produce exactly one value.
    pub fn query_one<T: rusqlite::types::FromSql>(&self, sql: &str) -> Result<T, Error> {
        let value = self
            .probe
            .connection()
            .query_row(sql, [], |row| row.get(0))?;
        Ok(value)
    }

    pub fn assert_table_exists(&self, table_name: &str) -> Result<(), Error> {
        let count: i64 = self.probe.connection().query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
            rusqlite::params![table_name],
            |row| row.get(0),
        )?;
        if count == 0 {
            return Err(Error::Generic(format!(
                "expected table '{table_name}' to exist"
            )));
        }
        Ok(())
    }

    pub fn assert_table_not_exists(&self, table_name: &str) -> Result<(), Error> {
        match self.assert_table_exists(table_name) {
            Ok(()) => Err(Error::Generic(format!(
                "expected table '{table_name}' to not exist"
            ))),
            Err(Error::Generic(_)) => Ok(()),
            Err(other) => Err(other),
        }
    }

    /// Capture the current user schema.
    pub fn schema_snapshot(&self) -> Result<SchemaSnapshot, Error> {
        let connection = self.probe.connection();
        let mut statement = connection.prepare(
            "SELECT name, sql FROM sqlite_master \
             WHERE type='table' AND name NOT LIKE 'sqlite_%' AND name != ?1 \
             ORDER BY name",
        )?;
        let tables_raw = statement
            .query_map(
                rusqlite::params![self.manager.version_table_name()],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )?
            .collect::<Result<Vec<_>, _>>()?;

        let mut tables = BTreeMap::new();
        for (name, sql) in tables_raw {
            let mut column_statement =
                connection.prepare(&format!("PRAGMA table_info({name})"))?;
            let columns = column_statement
                .query_map([], |row| {
                    Ok(ColumnInfo {
                        name: row.get(1)?,
                        type_name: row.get(2)?,
                        not_null: row.get::<_, i64>(3)? != 0,
                        primary_key: row.get::<_, i64>(5)? != 0,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            tables.insert(name, TableSchema { sql, columns });
        }
        Ok(SchemaSnapshot { tables })
    }
}
