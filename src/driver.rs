//! The narrow database contract the engine consumes.
//!
//! The engine never holds a raw connection: it acquires providers through
//! the factory's scoped methods, which guarantee disposal on every exit
//! path, and — for the transactional variant — commit iff the worker
//! returns `Ok` and roll back otherwise. Against a provider the engine
//! touches exactly one surface: `provider.statement(sql).execute(cancel)`.

use tokio_util::sync::CancellationToken;

use crate::error::{ensure_not_cancelled, Error};

/// A single SQL text bound to a provider, ready to run.
pub struct Statement<'a> {
    provider: &'a mut (dyn SqlProvider + 'a),
    sql: String,
}

impl<'a> Statement<'a> {
    /// Run the SQL text. The cancellation token is checked before the
    /// statement is submitted; the driver call itself is awaited to
    /// completion (cancellation never kills an in-flight statement).
    /// Returns the affected row count where the driver reports one.
    pub fn execute(self, cancel: &CancellationToken) -> Result<u64, Error> {
        ensure_not_cancelled(cancel)?;
        self.provider.execute_sql(&self.sql)
    }
}

/// A live database connection (possibly inside a transaction scope).
pub trait SqlProvider {
    /// Submit a single SQL text and wait for its completion. Returns the
    /// affected row count where the driver reports one, `0` otherwise.
    fn execute_sql(&mut self, sql: &str) -> Result<u64, Error>;

    /// Bind a SQL text to this provider.
    fn statement(&mut self, sql: &str) -> Statement<'_>
    where
        Self: Sized,
    {
        Statement {
            provider: self,
            sql: sql.to_owned(),
        }
    }
}

/// Creates [SqlProvider]s and scopes their lifetime.
pub trait SqlProviderFactory {
    type Provider: SqlProvider;

    /// Open a short-lived connection.
    fn create(&self, cancel: &CancellationToken) -> Result<Self::Provider, Error>;

    /// Run `worker` against a fresh provider, disposing of it on all exit
    /// paths.
    fn using_provider<T>(
        &self,
        cancel: &CancellationToken,
        worker: impl FnOnce(&mut Self::Provider) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let mut provider = self.create(cancel)?;
        let result = worker(&mut provider);
        drop(provider);
        result
    }

    /// As [SqlProviderFactory::using_provider], but a transaction is
    /// opened on entry and committed iff `worker` returns `Ok`; any error
    /// rolls the transaction back before the provider is disposed.
    fn using_provider_with_transaction<T>(
        &self,
        cancel: &CancellationToken,
        worker: impl FnOnce(&mut Self::Provider) -> Result<T, Error>,
    ) -> Result<T, Error>;
}
