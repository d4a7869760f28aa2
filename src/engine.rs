//! The migration execution engine.
//!
//! [MigrationManager] plans which versions to apply (forward or backward)
//! from the recorded current version and an optional target, then drives
//! each planned version inside its own dedicated transaction: scripts run
//! strictly sequenced in ASCII name order (reversed for rollback), a
//! capture log collects the transcript, and the dialect hooks record the
//! outcome in the version table. All install scripts of a version commit
//! before the next version begins; a failure aborts only the in-flight
//! version's transaction.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::driver::{SqlProvider, SqlProviderFactory};
use crate::error::{ensure_not_cancelled, Error};
use crate::log::{CaptureLog, MigrationLog, TracingLog, LINE_ENDING};
use crate::sources::{Direction, Script, ScriptKind, Sources};

/// Name of the version bookkeeping table unless overridden.
pub const DEFAULT_VERSION_TABLE_NAME: &str = "__migration";

/// One recorded install: a row of the version table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedVersion {
    pub version: String,
    /// When the version was installed.
    pub applied_at: DateTime<Utc>,
    /// The captured execution transcript persisted with the row.
    pub log: String,
}

/// The dialect-specific hooks the engine composes. Implementations know
/// the concrete provider type and are free to use its full connection
/// surface; the engine itself only ever calls these hooks plus
/// `statement(..).execute(..)`.
pub trait MigrationDialect<P: SqlProvider> {
    /// Highest version recorded in the version table, or `None` when the
    /// table is absent or empty. Versions compare as raw strings.
    fn get_current_version(
        &self,
        cancel: &CancellationToken,
        provider: &mut P,
        version_table_name: &str,
    ) -> Result<Option<String>, Error>;

    fn is_version_table_exist(
        &self,
        cancel: &CancellationToken,
        provider: &mut P,
        version_table_name: &str,
    ) -> Result<bool, Error>;

    fn create_version_table(
        &self,
        cancel: &CancellationToken,
        provider: &mut P,
        version_table_name: &str,
    ) -> Result<(), Error>;

    /// Sanity-check a pre-existing version table. Only invoked when
    /// [MigrationDialect::is_version_table_exist] returned true.
    fn verify_version_table_structure(
        &self,
        cancel: &CancellationToken,
        provider: &mut P,
        version_table_name: &str,
    ) -> Result<(), Error>;

    fn is_version_log_exist(
        &self,
        cancel: &CancellationToken,
        provider: &mut P,
        version_table_name: &str,
        version_name: &str,
    ) -> Result<bool, Error>;

    fn insert_version_log(
        &self,
        cancel: &CancellationToken,
        provider: &mut P,
        version_table_name: &str,
        version_name: &str,
        log_text: &str,
    ) -> Result<(), Error>;

    fn remove_version_log(
        &self,
        cancel: &CancellationToken,
        provider: &mut P,
        version_table_name: &str,
        version_name: &str,
    ) -> Result<(), Error>;

    /// All recorded installs, ordered by version. Empty when the version
    /// table is absent.
    fn get_version_history(
        &self,
        cancel: &CancellationToken,
        provider: &mut P,
        version_table_name: &str,
    ) -> Result<Vec<AppliedVersion>, Error>;
}

/// Everything a scripted step gets to see about the script it runs.
#[derive(Debug, Clone, Copy)]
pub struct ScriptContext<'a> {
    pub version_name: &'a str,
    pub direction: Direction,
    pub script: &'a Script,
}

/// A precompiled scripted-step plugin, registered on the manager keyed by
/// filename extension (`js`, `lua`, ...). Handlers receive the capability
/// envelope — cancellation token, SQL provider, logger — and nothing
/// else; an error aborts the enclosing version's transaction.
pub trait ScriptHandler<P: SqlProvider>: Send + Sync {
    fn run(
        &self,
        cancel: &CancellationToken,
        context: &ScriptContext<'_>,
        provider: &mut P,
        log: &dyn MigrationLog,
    ) -> Result<(), Error>;
}

/// A report of actions performed by [MigrationManager::install].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InstallReport {
    pub version_table_existed: bool,
    pub version_table_created: bool,
    /// Versions installed by this call, in execution order.
    pub versions_installed: Vec<String>,
}

/// A report of actions performed by [MigrationManager::rollback].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RollbackReport {
    /// Versions rolled back by this call, in execution order.
    pub versions_rolled_back: Vec<String>,
    /// Versions that had no version-log row and were skipped with a
    /// warning.
    pub versions_skipped: Vec<String>,
}

/// The entrypoint for executing migration sources against a database.
///
/// Composes the immutable [Sources], a driver facade
/// ([SqlProviderFactory]) and a [MigrationDialect]. The manager is
/// single-actor: concurrent `install`/`rollback` calls on one manager are
/// outside the contract.
pub struct MigrationManager<F, D>
where
    F: SqlProviderFactory,
    D: MigrationDialect<F::Provider>,
{
    sources: Sources,
    factory: F,
    dialect: D,
    version_table_name: String,
    log: Arc<dyn MigrationLog>,
    script_handlers: HashMap<String, Box<dyn ScriptHandler<F::Provider>>>,
}

// Manual Debug impl since the log and handlers are trait objects
impl<F, D> fmt::Debug for MigrationManager<F, D>
where
    F: SqlProviderFactory,
    D: MigrationDialect<F::Provider>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationManager")
            .field("versions", &self.sources.version_names())
            .field("version_table_name", &self.version_table_name)
            .field(
                "script_handlers",
                &self.script_handlers.keys().collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl<F, D> MigrationManager<F, D>
where
    F: SqlProviderFactory,
    D: MigrationDialect<F::Provider>,
{
    pub fn new(sources: Sources, factory: F, dialect: D) -> Self {
        Self {
            sources,
            factory,
            dialect,
            version_table_name: DEFAULT_VERSION_TABLE_NAME.to_owned(),
            log: Arc::new(TracingLog::new()),
            script_handlers: HashMap::new(),
        }
    }

    /// Set a custom name for the version bookkeeping table.
    /// Defaults to `"__migration"`.
    pub fn with_version_table_name(mut self, name: impl Into<String>) -> Self {
        self.version_table_name = name.into();
        self
    }

    /// Replace the injected log. Defaults to [TracingLog].
    pub fn with_log(mut self, log: Arc<dyn MigrationLog>) -> Self {
        self.log = log;
        self
    }

    /// Register a scripted-step handler for scripts whose filename
    /// extension equals `extension` (without the dot).
    pub fn with_script_handler(
        mut self,
        extension: impl Into<String>,
        handler: impl ScriptHandler<F::Provider> + 'static,
    ) -> Self {
        self.script_handlers.insert(extension.into(), Box::new(handler));
        self
    }

    pub fn sources(&self) -> &Sources {
        &self.sources
    }

    pub fn version_table_name(&self) -> &str {
        &self.version_table_name
    }

    /// The highest version recorded in the database, or `None` when no
    /// version has been installed yet.
    pub fn get_current_version(&self, cancel: &CancellationToken) -> Result<Option<String>, Error> {
        self.factory.using_provider(cancel, |provider| {
            self.dialect
                .get_current_version(cancel, provider, &self.version_table_name)
        })
    }

    /// All recorded installs, ordered by version; empty when the version
    /// table is absent.
    pub fn get_version_history(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<AppliedVersion>, Error> {
        self.factory.using_provider(cancel, |provider| {
            self.dialect
                .get_version_history(cancel, provider, &self.version_table_name)
        })
    }

    /// Which versions [MigrationManager::install] would execute, in
    /// order, without touching anything.
    pub fn preview_install(
        &self,
        cancel: &CancellationToken,
        target_version: Option<&str>,
    ) -> Result<Vec<String>, Error> {
        self.validate_target(target_version)?;
        let current_version = self.get_current_version(cancel)?;
        Ok(plan_install(
            &self.sources,
            current_version.as_deref(),
            target_version,
        ))
    }

    /// Which versions [MigrationManager::rollback] would execute, in
    /// order, without touching anything.
    pub fn preview_rollback(
        &self,
        cancel: &CancellationToken,
        target_version: Option<&str>,
    ) -> Result<Vec<String>, Error> {
        self.validate_target(target_version)?;
        let current_version = self.get_current_version(cancel)?;
        Ok(plan_rollback(
            &self.sources,
            current_version.as_deref(),
            target_version,
        ))
    }

    /// Bring the database forward: execute the install scripts of every
    /// version above the current one (and, when given, at or below
    /// `target_version`), each version inside its own dedicated
    /// transaction, recording a version-log row per installed version.
    pub fn install(
        &self,
        cancel: &CancellationToken,
        target_version: Option<&str>,
    ) -> Result<InstallReport, Error> {
        self.validate_target(target_version)?;
        let current_version = self.get_current_version(cancel)?;
        let planned = plan_install(&self.sources, current_version.as_deref(), target_version);

        tracing::debug!(
            current_version = ?current_version,
            target_version = ?target_version,
            planned = ?planned,
            "Considering versions to install"
        );

        let version_table_existed = self.factory.using_provider(cancel, |provider| {
            let existed =
                self.dialect
                    .is_version_table_exist(cancel, provider, &self.version_table_name)?;
            if existed {
                self.dialect.verify_version_table_structure(
                    cancel,
                    provider,
                    &self.version_table_name,
                )?;
            } else {
                tracing::info!(
                    table = %self.version_table_name,
                    "Creating version bookkeeping table"
                );
                self.dialect
                    .create_version_table(cancel, provider, &self.version_table_name)?;
            }
            Ok(existed)
        })?;

        let mut versions_installed = Vec::new();
        for version_name in &planned {
            ensure_not_cancelled(cancel)?;
            let bundle = self.sources.version_bundle(version_name)?;
            let capture = CaptureLog::new(self.log.child(version_name));
            self.factory
                .using_provider_with_transaction(cancel, |provider| {
                    for script in bundle.install_scripts() {
                        self.run_script(
                            cancel,
                            provider,
                            &capture,
                            version_name,
                            Direction::Install,
                            script,
                        )?;
                    }
                    let log_text = capture.flush();
                    self.dialect.insert_version_log(
                        cancel,
                        provider,
                        &self.version_table_name,
                        version_name,
                        &log_text,
                    )
                })?;
            tracing::info!(version = %version_name, "Version installed");
            versions_installed.push(version_name.clone());
        }

        Ok(InstallReport {
            version_table_existed,
            version_table_created: !version_table_existed,
            versions_installed,
        })
    }

    /// Bring the database backward: execute the rollback scripts of every
    /// version at or below the current one (and, when given, above
    /// `target_version`) in descending order, removing the version-log
    /// row per rolled-back version. Versions with no recorded install are
    /// skipped with a warning.
    pub fn rollback(
        &self,
        cancel: &CancellationToken,
        target_version: Option<&str>,
    ) -> Result<RollbackReport, Error> {
        self.validate_target(target_version)?;
        let current_version = self.get_current_version(cancel)?;
        let planned = plan_rollback(&self.sources, current_version.as_deref(), target_version);

        tracing::debug!(
            current_version = ?current_version,
            target_version = ?target_version,
            planned = ?planned,
            "Considering versions to roll back"
        );

        let mut report = RollbackReport::default();
        for version_name in &planned {
            ensure_not_cancelled(cancel)?;
            let bundle = self.sources.version_bundle(version_name)?;
            let capture = CaptureLog::new(self.log.child(version_name));
            let rolled_back = self
                .factory
                .using_provider_with_transaction(cancel, |provider| {
                    if !self.dialect.is_version_log_exist(
                        cancel,
                        provider,
                        &self.version_table_name,
                        version_name,
                    )? {
                        capture.warn(&format!(
                            "Skip rollback for version '{version_name}': not present inside database"
                        ));
                        return Ok(false);
                    }
                    for script in bundle.rollback_scripts().rev() {
                        self.run_script(
                            cancel,
                            provider,
                            &capture,
                            version_name,
                            Direction::Rollback,
                            script,
                        )?;
                    }
                    self.dialect.remove_version_log(
                        cancel,
                        provider,
                        &self.version_table_name,
                        version_name,
                    )?;
                    Ok(true)
                })?;
            if rolled_back {
                tracing::info!(version = %version_name, "Version rolled back");
                report.versions_rolled_back.push(version_name.clone());
            } else {
                report.versions_skipped.push(version_name.clone());
            }
        }
        Ok(report)
    }

    fn validate_target(&self, target_version: Option<&str>) -> Result<(), Error> {
        if let Some(target) = target_version {
            if !self.sources.contains_version(target) {
                return Err(Error::InvalidArgument {
                    argument: "target_version",
                    message: format!("version '{target}' is not present in the sources"),
                });
            }
        }
        Ok(())
    }

    fn run_script(
        &self,
        cancel: &CancellationToken,
        provider: &mut F::Provider,
        log: &CaptureLog,
        version_name: &str,
        direction: Direction,
        script: &Script,
    ) -> Result<(), Error> {
        ensure_not_cancelled(cancel)?;

        if let Some(handler) = script
            .extension()
            .and_then(|extension| self.script_handlers.get(extension))
        {
            log.info(&format!("Execute script: {}", script.name()));
            log.trace(&format!("{LINE_ENDING}{}", script.content()));
            let context = ScriptContext {
                version_name,
                direction,
                script,
            };
            return handler.run(cancel, &context, provider, log);
        }

        match script.kind() {
            ScriptKind::Sql => {
                log.info(&format!("Execute SQL script: {}", script.name()));
                log.trace(&format!("{LINE_ENDING}{}", script.content()));
                provider.statement(script.content()).execute(cancel)?;
                Ok(())
            }
            ScriptKind::JavaScript => Err(Error::InvalidOperation(format!(
                "no script handler registered for '{version_name}:{}'; \
                 register a handler for the 'js' extension or remove the script",
                script.name()
            ))),
            ScriptKind::Unknown => {
                log.warn(&format!(
                    "Skip script '{version_name}:{}' due to unknown kind of script",
                    script.name()
                ));
                Ok(())
            }
        }
    }
}

/// Versions to install, ascending: above the current version (when one is
/// recorded), at or below the target (when one is given).
fn plan_install(
    sources: &Sources,
    current_version: Option<&str>,
    target_version: Option<&str>,
) -> Vec<String> {
    sources
        .version_names()
        .into_iter()
        .filter(|version| current_version.map_or(true, |current| *version > current))
        .filter(|version| target_version.map_or(true, |target| *version <= target))
        .map(str::to_owned)
        .collect()
}

/// Versions to roll back, descending: at or below the current version
/// (when one is recorded), above the target (when one is given).
fn plan_rollback(
    sources: &Sources,
    current_version: Option<&str>,
    target_version: Option<&str>,
) -> Vec<String> {
    let mut planned: Vec<String> = sources
        .version_names()
        .into_iter()
        .filter(|version| current_version.map_or(true, |current| *version <= current))
        .filter(|version| target_version.map_or(true, |target| *version > target))
        .map(str::to_owned)
        .collect();
    planned.reverse();
    planned
}
