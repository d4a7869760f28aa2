#![cfg_attr(docsrs, feature(doc_cfg))]
//! `sqlmigration` is a schema migration engine driven by versioned trees
//! of install/rollback scripts.
//!
//! Core concepts:
//! - Migrations live on disk as plain script files, grouped by version:
//!   `R/<version>/install/*.sql` and `R/<version>/rollback/*.sql`. Version
//!   directory names and script file names are ordered by raw ASCII
//!   comparison, so sequencing is encoded into the names (`v0001`,
//!   `01-init.sql`) and nothing else.
//! - [Sources] holds a loaded tree as an immutable value: it can be
//!   transformed ([Sources::map], e.g. for templating) and written back
//!   out, and the engine executes it without ever touching the
//!   filesystem again.
//! - [MigrationManager] brings a database from its recorded version to a
//!   target version — forward or backward — executing each version inside
//!   its own transaction and persisting a per-version execution transcript
//!   in a bookkeeping table.
//!
//! # Example
//!
//! ```
//! use sqlmigration::{CancellationToken, MigrationManager, Script, Sources, VersionBundle};
//! use sqlmigration::sqlite::{SqliteDialect, SqliteDriver};
//!
//! // sources are usually loaded with Sources::load_from_filesystem; they
//! // can equally be assembled in memory
//! let sources = Sources::new([
//!     VersionBundle::new(
//!         "v0001",
//!         [Script::new(
//!             "01-init.sql",
//!             "/migrations/v0001/install/01-init.sql",
//!             "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)",
//!         )],
//!         [Script::new(
//!             "01-drop.sql",
//!             "/migrations/v0001/rollback/01-drop.sql",
//!             "DROP TABLE users",
//!         )],
//!     ),
//! ])
//! .unwrap();
//!
//! let driver = SqliteDriver::shared_memory("crate_docs_example").unwrap();
//! let manager = MigrationManager::new(sources, driver, SqliteDialect);
//! let cancel = CancellationToken::new();
//!
//! let report = manager.install(&cancel, None).unwrap();
//! assert_eq!(report.versions_installed, vec!["v0001"]);
//! assert_eq!(
//!     manager.get_current_version(&cancel).unwrap().as_deref(),
//!     Some("v0001")
//! );
//!
//! manager.rollback(&cancel, None).unwrap();
//! assert_eq!(manager.get_current_version(&cancel).unwrap(), None);
//! ```
//!
//! # Scripted steps
//!
//! Scripts other than plain SQL (`.js`, `.lua`, ...) run through
//! [ScriptHandler] plugins registered on the manager per filename
//! extension. A handler receives the cancellation token, the SQL provider
//! of the enclosing transaction and the capture logger — and nothing
//! else; an error aborts the version's transaction. Files with an
//! unrecognized extension are skipped with a warning.
//!
//! # Database support
//!
//! - [`SQLite`](sqlite) - available with the `sqlite` feature flag (default).
//! - [`PostgreSQL`](postgres) - available with the `postgres` feature flag.
//!
//! Other databases plug in by implementing [SqlProviderFactory] for the
//! connection lifecycle and [MigrationDialect] for the version-table
//! hooks.
//!
//! # Cancellation
//!
//! Every long-running operation takes a [CancellationToken] and checks it
//! before each filesystem or database boundary. A requested cancellation
//! surfaces as [Error::Cancelled] and aborts the in-flight transaction;
//! a statement already submitted to the database is awaited, never
//! killed.

mod error;
pub use error::Error;

mod sources;
pub use sources::{Direction, MapContext, Script, ScriptKind, Sources, VersionBundle};

mod log;
pub use log::{CaptureLog, MigrationLog, TracingLog};

mod driver;
pub use driver::{SqlProvider, SqlProviderFactory, Statement};

mod engine;
pub use engine::{
    AppliedVersion, InstallReport, MigrationDialect, MigrationManager, RollbackReport,
    ScriptContext, ScriptHandler, DEFAULT_VERSION_TABLE_NAME,
};

pub use tokio_util::sync::CancellationToken;

#[cfg(feature = "sqlite")]
#[cfg_attr(docsrs, doc(cfg(feature = "sqlite")))]
pub mod sqlite;

#[cfg(feature = "postgres")]
#[cfg_attr(docsrs, doc(cfg(feature = "postgres")))]
pub mod postgres;

#[cfg(feature = "testing")]
#[cfg_attr(docsrs, doc(cfg(feature = "testing")))]
pub mod testing;
