use std::path::PathBuf;

use tokio_util::sync::CancellationToken;

/// Error type for the sqlmigration crate.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The migration source tree is missing, malformed or logically
    /// inconsistent.
    #[error("wrong migration data: {0}")]
    WrongMigrationData(String),
    /// A bad parameter was passed to a public operation.
    #[error("invalid argument '{argument}': {message}")]
    InvalidArgument {
        argument: &'static str,
        message: String,
    },
    /// The URL scheme is not recognized by the sources loader.
    #[error("not supported URL schema: {0}")]
    NotSupportedUrlSchema(String),
    /// The URL scheme is recognized but not implemented.
    #[error("not implemented: {0}")]
    NotImplemented(String),
    /// The operation was invoked in a state that cannot support it.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    /// Cooperative cancellation was requested and acknowledged.
    #[error("the operation was cancelled")]
    Cancelled,
    /// A filesystem operation failed while loading or saving sources.
    #[error("i/o failure on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[cfg(feature = "sqlite")]
    #[error("{0}")]
    Sqlite(#[from] rusqlite::Error),
    #[cfg(feature = "postgres")]
    #[error("{0}")]
    Postgres(#[from] postgres::Error),
    #[error("{0}")]
    Generic(String),
}

impl From<String> for Error {
    fn from(value: String) -> Self {
        Self::Generic(value)
    }
}

// Manual PartialEq implementation because io::Error and postgres::Error
// don't implement PartialEq
impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::WrongMigrationData(a), Self::WrongMigrationData(b)) => a == b,
            (
                Self::InvalidArgument {
                    argument: a,
                    message: am,
                },
                Self::InvalidArgument {
                    argument: b,
                    message: bm,
                },
            ) => a == b && am == bm,
            (Self::NotSupportedUrlSchema(a), Self::NotSupportedUrlSchema(b)) => a == b,
            (Self::NotImplemented(a), Self::NotImplemented(b)) => a == b,
            (Self::InvalidOperation(a), Self::InvalidOperation(b)) => a == b,
            (Self::Cancelled, Self::Cancelled) => true,
            (
                Self::Io {
                    path: a,
                    source: asrc,
                },
                Self::Io {
                    path: b,
                    source: bsrc,
                },
            ) => a == b && asrc.to_string() == bsrc.to_string(),
            #[cfg(feature = "sqlite")]
            (Self::Sqlite(a), Self::Sqlite(b)) => a == b,
            #[cfg(feature = "postgres")]
            (Self::Postgres(a), Self::Postgres(b)) => a.to_string() == b.to_string(),
            (Self::Generic(a), Self::Generic(b)) => a == b,
            _ => false,
        }
    }
}

/// Check the cancellation token, surfacing a requested cancellation as
/// [Error::Cancelled]. Called before every I/O boundary.
pub(crate) fn ensure_not_cancelled(cancel: &CancellationToken) -> Result<(), Error> {
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    Ok(())
}
