//! SQLite driver and dialect.
//!
//! [SqliteDriver] opens a dedicated connection per engine scope, targeting
//! either a database file or a named in-process shared-memory database.
//! The shared-memory target exists because the engine acquires a fresh
//! connection per transaction: a plain `:memory:` database would vanish
//! between them, so the driver holds an anchor connection that keeps the
//! shared database alive for its own lifetime.

use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use tokio_util::sync::CancellationToken;

use crate::driver::{SqlProvider, SqlProviderFactory};
use crate::engine::{AppliedVersion, MigrationDialect, MigrationManager};
use crate::error::{ensure_not_cancelled, Error};

/// A [MigrationManager] wired to SQLite.
pub type SqliteMigrationManager = MigrationManager<SqliteDriver, SqliteDialect>;

#[derive(Debug)]
enum SqliteTarget {
    File(PathBuf),
    SharedMemory(String),
}

/// Connection factory for SQLite databases.
#[derive(Debug)]
pub struct SqliteDriver {
    target: SqliteTarget,
    busy_timeout: Duration,
    _anchor: Option<Connection>,
}

impl SqliteDriver {
    /// Target a database file.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            target: SqliteTarget::File(path.into()),
            busy_timeout: Duration::from_secs(30),
            _anchor: None,
        }
    }

    /// Target a named in-process shared-memory database. The driver keeps
    /// an anchor connection open so the database survives between the
    /// engine's short-lived connections.
    pub fn shared_memory(name: impl Into<String>) -> Result<Self, Error> {
        let mut driver = Self {
            target: SqliteTarget::SharedMemory(name.into()),
            busy_timeout: Duration::from_secs(30),
            _anchor: None,
        };
        driver._anchor = Some(driver.open()?);
        Ok(driver)
    }

    /// Set the busy timeout applied to every connection this driver
    /// opens, so concurrent access waits instead of failing immediately.
    /// Defaults to 30 seconds.
    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    fn open(&self) -> Result<Connection, Error> {
        let connection = match &self.target {
            SqliteTarget::File(path) => Connection::open(path)?,
            SqliteTarget::SharedMemory(name) => Connection::open_with_flags(
                format!("file:{name}?mode=memory&cache=shared"),
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_URI
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?,
        };
        connection.busy_timeout(self.busy_timeout)?;
        Ok(connection)
    }
}

/// A live SQLite connection.
#[derive(Debug)]
pub struct SqliteProvider {
    connection: Connection,
}

impl SqliteProvider {
    /// The underlying connection, for dialect hooks and tests.
    pub fn connection(&self) -> &Connection {
        &self.connection
    }
}

impl SqlProvider for SqliteProvider {
    fn execute_sql(&mut self, sql: &str) -> Result<u64, Error> {
        // execute_batch: migration scripts regularly carry several
        // statements in one file
        self.connection.execute_batch(sql)?;
        Ok(self.connection.changes())
    }
}

impl SqlProviderFactory for SqliteDriver {
    type Provider = SqliteProvider;

    fn create(&self, cancel: &CancellationToken) -> Result<SqliteProvider, Error> {
        ensure_not_cancelled(cancel)?;
        Ok(SqliteProvider {
            connection: self.open()?,
        })
    }

    fn using_provider_with_transaction<T>(
        &self,
        cancel: &CancellationToken,
        worker: impl FnOnce(&mut SqliteProvider) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let mut provider = self.create(cancel)?;
        provider.connection.execute_batch("BEGIN IMMEDIATE")?;
        match worker(&mut provider) {
            Ok(value) => {
                provider.connection.execute_batch("COMMIT")?;
                Ok(value)
            }
            Err(error) => {
                // the connection is dropped right after; a failed rollback
                // must not mask the original error
                let _ = provider.connection.execute_batch("ROLLBACK");
                Err(error)
            }
        }
    }
}

/// SQLite implementation of the version-table hooks.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDialect;

impl SqliteDialect {
    fn table_exists(provider: &SqliteProvider, version_table_name: &str) -> Result<bool, Error> {
        let found = provider
            .connection
            .query_row(
                "SELECT name FROM sqlite_master WHERE type='table' AND name=?1",
                params![version_table_name],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }
}

impl MigrationDialect<SqliteProvider> for SqliteDialect {
    fn get_current_version(
        &self,
        cancel: &CancellationToken,
        provider: &mut SqliteProvider,
        version_table_name: &str,
    ) -> Result<Option<String>, Error> {
        ensure_not_cancelled(cancel)?;
        if !Self::table_exists(provider, version_table_name)? {
            return Ok(None);
        }
        let version: Option<String> = provider.connection.query_row(
            &format!("SELECT MAX(version) FROM {version_table_name}"),
            [],
            |row| row.get(0),
        )?;
        Ok(version)
    }

    fn is_version_table_exist(
        &self,
        cancel: &CancellationToken,
        provider: &mut SqliteProvider,
        version_table_name: &str,
    ) -> Result<bool, Error> {
        ensure_not_cancelled(cancel)?;
        Self::table_exists(provider, version_table_name)
    }

    fn create_version_table(
        &self,
        cancel: &CancellationToken,
        provider: &mut SqliteProvider,
        version_table_name: &str,
    ) -> Result<(), Error> {
        ensure_not_cancelled(cancel)?;
        provider.connection.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {version_table_name} (\
                 version TEXT PRIMARY KEY NOT NULL, \
                 log TEXT NOT NULL, \
                 applied_at TEXT NOT NULL)"
            ),
            [],
        )?;
        Ok(())
    }

    fn verify_version_table_structure(
        &self,
        cancel: &CancellationToken,
        provider: &mut SqliteProvider,
        version_table_name: &str,
    ) -> Result<(), Error> {
        ensure_not_cancelled(cancel)?;
        let mut statement = provider
            .connection
            .prepare(&format!("PRAGMA table_info({version_table_name})"))?;
        let columns: Vec<String> = statement
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<Result<Vec<_>, _>>()?;
        for required in ["version", "log", "applied_at"] {
            if !columns.iter().any(|column| column == required) {
                return Err(Error::WrongMigrationData(format!(
                    "version table '{version_table_name}' is missing required column '{required}'"
                )));
            }
        }
        Ok(())
    }

    fn is_version_log_exist(
        &self,
        cancel: &CancellationToken,
        provider: &mut SqliteProvider,
        version_table_name: &str,
        version_name: &str,
    ) -> Result<bool, Error> {
        ensure_not_cancelled(cancel)?;
        if !Self::table_exists(provider, version_table_name)? {
            return Ok(false);
        }
        let found = provider
            .connection
            .query_row(
                &format!("SELECT version FROM {version_table_name} WHERE version = ?1"),
                params![version_name],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn insert_version_log(
        &self,
        cancel: &CancellationToken,
        provider: &mut SqliteProvider,
        version_table_name: &str,
        version_name: &str,
        log_text: &str,
    ) -> Result<(), Error> {
        ensure_not_cancelled(cancel)?;
        provider.connection.execute(
            &format!(
                "INSERT INTO {version_table_name} (version, log, applied_at) VALUES (?1, ?2, ?3)"
            ),
            params![version_name, log_text, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn remove_version_log(
        &self,
        cancel: &CancellationToken,
        provider: &mut SqliteProvider,
        version_table_name: &str,
        version_name: &str,
    ) -> Result<(), Error> {
        ensure_not_cancelled(cancel)?;
        provider.connection.execute(
            &format!("DELETE FROM {version_table_name} WHERE version = ?1"),
            params![version_name],
        )?;
        Ok(())
    }

    fn get_version_history(
        &self,
        cancel: &CancellationToken,
        provider: &mut SqliteProvider,
        version_table_name: &str,
    ) -> Result<Vec<AppliedVersion>, Error> {
        ensure_not_cancelled(cancel)?;
        if !Self::table_exists(provider, version_table_name)? {
            return Ok(Vec::new());
        }
        let mut statement = provider.connection.prepare(&format!(
            "SELECT version, log, applied_at FROM {version_table_name} ORDER BY version"
        ))?;
        let rows = statement
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(version, log, applied_at_raw)| {
                let applied_at = chrono::DateTime::parse_from_rfc3339(&applied_at_raw)
                    .map_err(|error| {
                        Error::Generic(format!(
                            "failed to parse applied_at for version '{version}': {error}"
                        ))
                    })?
                    .with_timezone(&Utc);
                Ok(AppliedVersion {
                    version,
                    applied_at,
                    log,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::{Script, Sources, VersionBundle};
    use std::fs;

    fn sample_sources() -> Sources {
        let v0001 = VersionBundle::new(
            "v0001",
            [
                Script::new(
                    "01-init.sql",
                    "/migrations/v0001/install/01-init.sql",
                    "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL);",
                ),
                Script::new(
                    "02-seed.sql",
                    "/migrations/v0001/install/02-seed.sql",
                    "INSERT INTO users (id, name) VALUES (1, 'alice');\n\
                     INSERT INTO users (id, name) VALUES (2, 'bob');",
                ),
            ],
            [Script::new(
                "01-drop.sql",
                "/migrations/v0001/rollback/01-drop.sql",
                "DROP TABLE users;",
            )],
        );
        let v0002 = VersionBundle::new(
            "v0002",
            [Script::new(
                "01-add-email.sql",
                "/migrations/v0002/install/01-add-email.sql",
                "ALTER TABLE users ADD COLUMN email TEXT;",
            )],
            [Script::new(
                "01-remove-email.sql",
                "/migrations/v0002/rollback/01-remove-email.sql",
                "ALTER TABLE users RENAME TO users_wide;\n\
                 CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL);\n\
                 INSERT INTO users (id, name) SELECT id, name FROM users_wide;\n\
                 DROP TABLE users_wide;",
            )],
        );
        Sources::new([v0001, v0002]).unwrap()
    }

    fn manager_for(name: &str, sources: Sources) -> SqliteMigrationManager {
        let driver = SqliteDriver::shared_memory(name).unwrap();
        MigrationManager::new(sources, driver, SqliteDialect)
    }

    #[test]
    fn install_from_clean_applies_schema_and_records_versions() {
        let cancel = CancellationToken::new();
        let driver = SqliteDriver::shared_memory("install_from_clean").unwrap();
        let probe = driver.create(&cancel).unwrap();
        let manager = MigrationManager::new(sample_sources(), driver, SqliteDialect);

        let report = manager.install(&cancel, None).unwrap();
        assert!(!report.version_table_existed);
        assert!(report.version_table_created);
        assert_eq!(report.versions_installed, vec!["v0001", "v0002"]);

        let connection = probe.connection();
        let names: i64 = connection
            .query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))
            .unwrap();
        assert_eq!(names, 2);
        // v0002 added the email column
        let _: Option<String> = connection
            .query_row("SELECT email FROM users WHERE id = 1", [], |row| {
                row.get(0)
            })
            .unwrap();

        let recorded: Vec<(String, String)> = {
            let mut statement = connection
                .prepare("SELECT version, log FROM __migration ORDER BY version")
                .unwrap();
            statement
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
                .unwrap()
                .collect::<Result<Vec<_>, _>>()
                .unwrap()
        };
        assert_eq!(recorded.len(), 2);
        assert_eq!(recorded[0].0, "v0001");
        assert!(
            recorded[0].1.contains("[INFO] Execute SQL script: 01-init.sql"),
            "{}",
            recorded[0].1
        );
        assert!(recorded[0].1.contains("[TRACE]"));
        assert_eq!(recorded[1].0, "v0002");

        assert_eq!(
            manager.get_current_version(&cancel).unwrap().as_deref(),
            Some("v0002")
        );
        let history = manager.get_version_history(&cancel).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].version, "v0001");
        // applied_at round-trips through rfc3339
        assert!(history[0].applied_at <= Utc::now());
    }

    #[test]
    fn install_resumes_from_recorded_version() {
        let cancel = CancellationToken::new();
        let manager = manager_for("install_resumes", sample_sources());

        let first = manager.install(&cancel, Some("v0001")).unwrap();
        assert_eq!(first.versions_installed, vec!["v0001"]);
        assert_eq!(
            manager.get_current_version(&cancel).unwrap().as_deref(),
            Some("v0001")
        );

        let second = manager.install(&cancel, None).unwrap();
        assert!(second.version_table_existed);
        assert_eq!(second.versions_installed, vec!["v0002"]);
    }

    #[test]
    fn rollback_reverses_install() {
        let cancel = CancellationToken::new();
        let driver = SqliteDriver::shared_memory("rollback_reverses").unwrap();
        let probe = driver.create(&cancel).unwrap();
        let manager = MigrationManager::new(sample_sources(), driver, SqliteDialect);

        manager.install(&cancel, None).unwrap();
        let report = manager.rollback(&cancel, None).unwrap();
        assert_eq!(report.versions_rolled_back, vec!["v0002", "v0001"]);
        assert!(report.versions_skipped.is_empty());

        let users_left: i64 = probe
            .connection()
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='users'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(users_left, 0);
        assert_eq!(manager.get_current_version(&cancel).unwrap(), None);
        let rows: i64 = probe
            .connection()
            .query_row("SELECT COUNT(*) FROM __migration", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 0);
    }

    #[test]
    fn rollback_skips_versions_missing_from_the_version_table() {
        let cancel = CancellationToken::new();
        let driver = SqliteDriver::shared_memory("rollback_skips").unwrap();
        let probe = driver.create(&cancel).unwrap();
        let manager = MigrationManager::new(sample_sources(), driver, SqliteDialect);

        manager.install(&cancel, None).unwrap();
        // lose v0001's log row, as if it had been installed by other means
        probe
            .connection()
            .execute("DELETE FROM __migration WHERE version = 'v0001'", [])
            .unwrap();

        let report = manager.rollback(&cancel, None).unwrap();
        assert_eq!(report.versions_rolled_back, vec!["v0002"]);
        assert_eq!(report.versions_skipped, vec!["v0001"]);
        // v0001's rollback never ran, so the users table is still there
        let users_left: i64 = probe
            .connection()
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='users'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(users_left, 1);
    }

    #[test]
    fn rollback_on_a_never_installed_database_skips_everything() {
        let cancel = CancellationToken::new();
        let driver = SqliteDriver::shared_memory("rollback_never_installed").unwrap();
        let probe = driver.create(&cancel).unwrap();
        let manager = MigrationManager::new(sample_sources(), driver, SqliteDialect);

        // no install has ever run, so there is no version table at all
        let report = manager.rollback(&cancel, None).unwrap();
        assert!(report.versions_rolled_back.is_empty());
        assert_eq!(report.versions_skipped, vec!["v0002", "v0001"]);

        // and the database is left untouched
        let tables: i64 = probe
            .connection()
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 0);
    }

    #[test]
    fn failing_script_rolls_back_only_its_version() {
        let cancel = CancellationToken::new();
        let sources = Sources::new([
            VersionBundle::new(
                "v0001",
                [Script::new(
                    "01-init.sql",
                    "/migrations/v0001/install/01-init.sql",
                    "CREATE TABLE t1 (id INTEGER PRIMARY KEY);",
                )],
                [],
            ),
            VersionBundle::new(
                "v0002",
                [
                    Script::new(
                        "01-ok.sql",
                        "/migrations/v0002/install/01-ok.sql",
                        "CREATE TABLE t2 (id INTEGER PRIMARY KEY);",
                    ),
                    Script::new(
                        "02-bad.sql",
                        "/migrations/v0002/install/02-bad.sql",
                        "bleep blorp",
                    ),
                ],
                [],
            ),
        ])
        .unwrap();
        let driver = SqliteDriver::shared_memory("failing_script").unwrap();
        let probe = driver.create(&cancel).unwrap();
        let manager = MigrationManager::new(sources, driver, SqliteDialect);

        match manager.install(&cancel, None) {
            Err(Error::Sqlite(_)) => {}
            other => panic!("expected a SQLite error, got {other:?}"),
        }

        // v0001 committed; v0002's partial work was rolled back
        let tables = {
            let mut statement = probe
                .connection()
                .prepare("SELECT name FROM sqlite_master WHERE type='table' AND name LIKE 't%' ORDER BY name")
                .unwrap();
            statement
                .query_map([], |row| row.get::<_, String>(0))
                .unwrap()
                .collect::<Result<Vec<_>, _>>()
                .unwrap()
        };
        assert_eq!(tables, vec!["t1"]);
        assert_eq!(
            manager.get_current_version(&cancel).unwrap().as_deref(),
            Some("v0001")
        );
    }

    #[test]
    fn verify_rejects_a_foreign_table_with_the_same_name() {
        let cancel = CancellationToken::new();
        let driver = SqliteDriver::shared_memory("verify_rejects").unwrap();
        let probe = driver.create(&cancel).unwrap();
        probe
            .connection()
            .execute("CREATE TABLE __migration (version TEXT, note TEXT)", [])
            .unwrap();
        let manager = MigrationManager::new(sample_sources(), driver, SqliteDialect);

        match manager.install(&cancel, None) {
            Err(Error::WrongMigrationData(message)) => {
                assert!(message.contains("missing required column"), "{message}");
            }
            other => panic!("expected WrongMigrationData, got {other:?}"),
        }
    }

    #[test]
    fn unknown_kind_scripts_warn_in_the_persisted_log() {
        let cancel = CancellationToken::new();
        let sources = Sources::new([VersionBundle::new(
            "v0001",
            [
                Script::new(
                    "01-init.sql",
                    "/migrations/v0001/install/01-init.sql",
                    "CREATE TABLE t1 (id INTEGER PRIMARY KEY);",
                ),
                Script::new(
                    "99-notes.txt",
                    "/migrations/v0001/install/99-notes.txt",
                    "operator notes",
                ),
            ],
            [],
        )])
        .unwrap();
        let driver = SqliteDriver::shared_memory("unknown_kind_warns").unwrap();
        let probe = driver.create(&cancel).unwrap();
        let manager = MigrationManager::new(sources, driver, SqliteDialect);

        manager.install(&cancel, None).unwrap();
        let log_text: String = probe
            .connection()
            .query_row(
                "SELECT log FROM __migration WHERE version = 'v0001'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert!(log_text.contains("unknown kind of script"), "{log_text}");
    }

    #[test]
    fn installs_sources_loaded_from_disk() {
        let cancel = CancellationToken::new();
        let tree = tempfile::tempdir().unwrap();
        let install_dir = tree.path().join("v0001").join("install");
        fs::create_dir_all(&install_dir).unwrap();
        fs::write(
            install_dir.join("01-init.sql"),
            "CREATE TABLE loaded (id INTEGER PRIMARY KEY);",
        )
        .unwrap();

        let sources = Sources::load_from_filesystem(&cancel, tree.path()).unwrap();
        let driver = SqliteDriver::shared_memory("from_disk").unwrap();
        let probe = driver.create(&cancel).unwrap();
        let manager = MigrationManager::new(sources, driver, SqliteDialect);

        let report = manager.install(&cancel, None).unwrap();
        assert_eq!(report.versions_installed, vec!["v0001"]);
        let count: i64 = probe
            .connection()
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='loaded'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn custom_version_table_name_is_honoured() {
        let cancel = CancellationToken::new();
        let driver = SqliteDriver::shared_memory("custom_table_name").unwrap();
        let probe = driver.create(&cancel).unwrap();
        let manager = MigrationManager::new(sample_sources(), driver, SqliteDialect)
            .with_version_table_name("schema_history");

        manager.install(&cancel, Some("v0001")).unwrap();
        let rows: i64 = probe
            .connection()
            .query_row("SELECT COUNT(*) FROM schema_history", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn statement_facade_reports_affected_rows() {
        let cancel = CancellationToken::new();
        let driver = SqliteDriver::shared_memory("statement_facade").unwrap();
        let mut provider = driver.create(&cancel).unwrap();
        provider
            .statement("CREATE TABLE counted (id INTEGER PRIMARY KEY)")
            .execute(&cancel)
            .unwrap();
        let affected = provider
            .statement("INSERT INTO counted (id) VALUES (1)")
            .execute(&cancel)
            .unwrap();
        assert_eq!(affected, 1);
    }

    #[test]
    fn cancelled_token_prevents_any_work() {
        let cancel = CancellationToken::new();
        let driver = SqliteDriver::shared_memory("cancelled_token").unwrap();
        let probe = driver.create(&cancel).unwrap();
        let manager = MigrationManager::new(sample_sources(), driver, SqliteDialect);

        cancel.cancel();
        assert_eq!(manager.install(&cancel, None), Err(Error::Cancelled));
        let tables: i64 = probe
            .connection()
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 0);
    }
}
