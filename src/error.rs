use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum RecallError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error at {path}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("LevelDB error at {path}: {detail}")]
    LevelDb { path: PathBuf, detail: String },

    #[error("Codec violation in field {field:?}: {detail}")]
    Codec { field: String, detail: String },

    #[error("Lock held: {0}")]
    LockHeld(PathBuf),

    #[error("Corrupt permissions file: {0}")]
    CorruptPermissions(PathBuf),

    #[error("{0}")]
    Other(String),
}
