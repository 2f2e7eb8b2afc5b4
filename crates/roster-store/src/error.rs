use roster_core::{RegistryError, UserId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("email already registered: {0}")]
    DuplicateEmail(String),
    #[error("user {0} not found")]
    UserNotFound(UserId),
    #[error("invalid data: {0}")]
    InvalidData(String),
    #[error("embedding cipher: {0}")]
    Cipher(String),
    #[error("database/key mismatch: {0}")]
    KeyMismatch(String),
}

impl StoreError {
    /// Lock contention that may clear on retry.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(e, _))
                if matches!(e.code, rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked)
        )
    }
}

impl From<StoreError> for RegistryError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::UserNotFound(id) => RegistryError::UserNotFound(id),
            e if e.is_busy() => RegistryError::Busy(e.to_string()),
            e => RegistryError::Storage(e.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
