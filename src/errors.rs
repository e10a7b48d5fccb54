use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Failed to enumerate databases: {0}")]
    Enumeration(String),

    #[error("Failed to dump database {database}: {reason}")]
    PerDatabaseDump { database: String, reason: String },

    #[error("No databases were dumped successfully")]
    NoDatabasesDumped,

    #[error("Staging directory error: {0}")]
    Staging(String),

    #[error("Archive creation failed: {0}")]
    Archive(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Storage connection failed: {0}")]
    StorageConnect(String),

    #[error("Storage upload failed: {0}")]
    StorageUpload(String),

    #[error("Storage listing failed: {0}")]
    StorageList(String),

    #[error("Storage delete failed: {0}")]
    StorageDelete(String),

    #[error("Run cancelled: {0}")]
    Cancelled(String),

    #[error("Another backup run is already in progress")]
    RunInProgress,
}

impl BackupError {
    pub fn dump(database: impl Into<String>, reason: impl ToString) -> Self {
        BackupError::PerDatabaseDump {
            database: database.into(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
