use std::io;
use std::path::PathBuf;

use heed::{Error as HeedError, MdbError};
use thiserror::Error;

use crate::FileId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("internal: {0}.")]
    Internal(#[from] InternalError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    User(#[from] UserError),
    #[error("the operation was cancelled by the host")]
    Cancelled,
    #[error("indices are not available while the host is catching up")]
    NotReady,
}

#[derive(Error, Debug)]
pub enum InternalError {
    #[error(transparent)]
    Store(#[from] MdbError),
    #[error(transparent)]
    Heed(HeedError),
    #[error("cannot open the index environment at {}: {error}", path.display())]
    OpenFailed { path: PathBuf, error: HeedError },
    #[error("cannot insert into the {database_name} database: {error}")]
    StorePut { database_name: &'static str, error: HeedError },
    #[error("cannot delete from the {database_name} database: {error}")]
    StoreDeletion { database_name: &'static str, error: HeedError },
    #[error(transparent)]
    Serialization(#[from] SerializationError),
    #[error("the index storage is closed")]
    StorageClosed,
    #[error("file {0} has no stable file id")]
    IllegalFileId(FileId),
}

#[derive(Error, Debug)]
pub enum SerializationError {
    #[error("{}", match .db_name {
        Some(name) => format!("decoding from the {name} database failed"),
        None => "decoding failed".to_string(),
    })]
    Decoding { db_name: Option<&'static str> },
    #[error("{}", match .db_name {
        Some(name) => format!("encoding into the {name} database failed"),
        None => "encoding failed".to_string(),
    })]
    Encoding { db_name: Option<&'static str> },
}

#[derive(Error, Debug)]
pub enum UserError {
    #[error("index `{0}` is not registered")]
    UnknownIndex(String),
    #[error("index `{0}` is already registered")]
    IndexAlreadyRegistered(String),
    #[error("index `{0}` is registered with different key or value types")]
    WrongIndexTypes(String),
    #[error("the database file is in an invalid state")]
    InvalidStoreFile,
    #[error("maximum database size has been reached")]
    MaxDatabaseSizeReached,
    #[error("an environment is already opened for this index")]
    EnvAlreadyOpened,
}

impl From<HeedError> for Error {
    fn from(error: HeedError) -> Error {
        use self::Error::*;
        use self::InternalError::*;
        use self::SerializationError::*;
        use self::UserError::*;

        match error {
            HeedError::Io(error) => Error::from(error),
            HeedError::Mdb(MdbError::MapFull) => User(MaxDatabaseSizeReached),
            HeedError::Mdb(MdbError::Invalid) => User(InvalidStoreFile),
            HeedError::Mdb(error) => Internal(Store(error)),
            HeedError::Encoding(_) => Internal(Serialization(Encoding { db_name: None })),
            HeedError::Decoding(_) => Internal(Serialization(Decoding { db_name: None })),
            // Notably the already-opened environment report, which has
            // changed shape across heed releases.
            error => Internal(Heed(error)),
        }
    }
}

/// A little macro helper to autogenerate From implementation that needs two `Into`.
macro_rules! error_from_sub_error {
    () => {};
    ($sub:ty => $intermediate:ty) => {
        impl From<$sub> for Error {
            fn from(error: $sub) -> Error {
                Error::from(<$intermediate>::from(error))
            }
        }
    };
    ($($sub:ty => $intermediate:ty $(,)?),+) => {
        $(error_from_sub_error!($sub => $intermediate);)+
    };
}

error_from_sub_error! {
    SerializationError => InternalError,
    MdbError => InternalError,
}

impl Error {
    /// Failures that indicate broken or unreachable storage. Queries convert
    /// them into a rebuild request and a benign empty result; everything else
    /// propagates to the caller.
    pub fn is_storage_defect(&self) -> bool {
        matches!(
            self,
            Error::Internal(_)
                | Error::Io(_)
                | Error::User(UserError::InvalidStoreFile)
                | Error::User(UserError::MaxDatabaseSizeReached)
        )
    }
}

#[test]
fn storage_defects_are_not_cancellations() {
    assert!(!Error::Cancelled.is_storage_defect());
    assert!(!Error::NotReady.is_storage_defect());
    assert!(Error::from(InternalError::StorageClosed).is_storage_defect());
}
