//! PostgreSQL driver and dialect.
//!
//! Mirrors the SQLite module over the synchronous `postgres` client:
//! the driver opens a dedicated connection per engine scope from a
//! connection string, transactions are bracketed explicitly, and the
//! version-table hooks go through `information_schema`.

use chrono::Utc;
use postgres::{Client, NoTls};
use tokio_util::sync::CancellationToken;

use crate::driver::{SqlProvider, SqlProviderFactory};
use crate::engine::{AppliedVersion, MigrationDialect, MigrationManager};
use crate::error::{ensure_not_cancelled, Error};

/// A [MigrationManager] wired to PostgreSQL.
pub type PostgresMigrationManager = MigrationManager<PostgresDriver, PostgresDialect>;

/// Connection factory for PostgreSQL databases.
#[derive(Debug, Clone)]
pub struct PostgresDriver {
    connection_string: String,
}

impl PostgresDriver {
    /// Target the database described by a libpq-style connection string,
    /// e.g. `host=localhost user=postgres dbname=app`.
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
        }
    }
}

/// A live PostgreSQL connection.
pub struct PostgresProvider {
    client: Client,
}

impl PostgresProvider {
    /// The underlying client, for dialect hooks and tests.
    pub fn client(&mut self) -> &mut Client {
        &mut self.client
    }
}

impl SqlProvider for PostgresProvider {
    fn execute_sql(&mut self, sql: &str) -> Result<u64, Error> {
        // batch_execute: migration scripts regularly carry several
        // statements in one file; it reports no row count
        self.client.batch_execute(sql)?;
        Ok(0)
    }
}

impl SqlProviderFactory for PostgresDriver {
    type Provider = PostgresProvider;

    fn create(&self, cancel: &CancellationToken) -> Result<PostgresProvider, Error> {
        ensure_not_cancelled(cancel)?;
        let client = Client::connect(&self.connection_string, NoTls)?;
        Ok(PostgresProvider { client })
    }

    fn using_provider_with_transaction<T>(
        &self,
        cancel: &CancellationToken,
        worker: impl FnOnce(&mut PostgresProvider) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let mut provider = self.create(cancel)?;
        provider.client.batch_execute("BEGIN")?;
        match worker(&mut provider) {
            Ok(value) => {
                provider.client.batch_execute("COMMIT")?;
                Ok(value)
            }
            Err(error) => {
                // the connection is dropped right after; a failed rollback
                // must not mask the original error
                let _ = provider.client.batch_execute("ROLLBACK");
                Err(error)
            }
        }
    }
}

/// PostgreSQL implementation of the version-table hooks.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDialect;

impl PostgresDialect {
    fn table_exists(provider: &mut PostgresProvider, version_table_name: &str) -> Result<bool, Error> {
        let exists: bool = provider
            .client
            .query_one(
                "SELECT EXISTS (SELECT FROM information_schema.tables \
                 WHERE table_schema = 'public' AND table_name = $1)",
                &[&version_table_name],
            )?
            .get(0);
        Ok(exists)
    }
}

impl MigrationDialect<PostgresProvider> for PostgresDialect {
    fn get_current_version(
        &self,
        cancel: &CancellationToken,
        provider: &mut PostgresProvider,
        version_table_name: &str,
    ) -> Result<Option<String>, Error> {
        ensure_not_cancelled(cancel)?;
        if !Self::table_exists(provider, version_table_name)? {
            return Ok(None);
        }
        let row = provider
            .client
            .query_one(&format!("SELECT MAX(version) FROM {version_table_name}"), &[])?;
        Ok(row.get::<_, Option<String>>(0))
    }

    fn is_version_table_exist(
        &self,
        cancel: &CancellationToken,
        provider: &mut PostgresProvider,
        version_table_name: &str,
    ) -> Result<bool, Error> {
        ensure_not_cancelled(cancel)?;
        Self::table_exists(provider, version_table_name)
    }

    fn create_version_table(
        &self,
        cancel: &CancellationToken,
        provider: &mut PostgresProvider,
        version_table_name: &str,
    ) -> Result<(), Error> {
        ensure_not_cancelled(cancel)?;
        provider.client.batch_execute(&format!(
            "CREATE TABLE IF NOT EXISTS {version_table_name} (\
             version TEXT PRIMARY KEY NOT NULL, \
             log TEXT NOT NULL, \
             applied_at TEXT NOT NULL)"
        ))?;
        Ok(())
    }

    fn verify_version_table_structure(
        &self,
        cancel: &CancellationToken,
        provider: &mut PostgresProvider,
        version_table_name: &str,
    ) -> Result<(), Error> {
        ensure_not_cancelled(cancel)?;
        let rows = provider.client.query(
            "SELECT column_name FROM information_schema.columns \
             WHERE table_schema = 'public' AND table_name = $1",
            &[&version_table_name],
        )?;
        let columns: Vec<String> = rows.into_iter().map(|row| row.get(0)).collect();
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
        provider: &mut PostgresProvider,
        version_table_name: &str,
        version_name: &str,
    ) -> Result<bool, Error> {
        ensure_not_cancelled(cancel)?;
        if !Self::table_exists(provider, version_table_name)? {
            return Ok(false);
        }
        let row = provider.client.query_opt(
            &format!("SELECT version FROM {version_table_name} WHERE version = $1"),
            &[&version_name],
        )?;
        Ok(row.is_some())
    }

    fn insert_version_log(
        &self,
        cancel: &CancellationToken,
        provider: &mut PostgresProvider,
        version_table_name: &str,
        version_name: &str,
        log_text: &str,
    ) -> Result<(), Error> {
        ensure_not_cancelled(cancel)?;
        provider.client.execute(
            &format!(
                "INSERT INTO {version_table_name} (version, log, applied_at) VALUES ($1, $2, $3)"
            ),
            &[&version_name, &log_text, &Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn remove_version_log(
        &self,
        cancel: &CancellationToken,
        provider: &mut PostgresProvider,
        version_table_name: &str,
        version_name: &str,
    ) -> Result<(), Error> {
        ensure_not_cancelled(cancel)?;
        provider.client.execute(
            &format!("DELETE FROM {version_table_name} WHERE version = $1"),
            &[&version_name],
        )?;
        Ok(())
    }

    fn get_version_history(
        &self,
        cancel: &CancellationToken,
        provider: &mut PostgresProvider,
        version_table_name: &str,
    ) -> Result<Vec<AppliedVersion>, Error> {
        ensure_not_cancelled(cancel)?;
        if !Self::table_exists(provider, version_table_name)? {
            return Ok(Vec::new());
        }
        let rows = provider.client.query(
            &format!("SELECT version, log, applied_at FROM {version_table_name} ORDER BY version"),
            &[],
        )?;
        rows.into_iter()
            .map(|row| {
                let version: String = row.get(0);
                let log: String = row.get(1);
                let applied_at_raw: String = row.get(2);
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
