use thiserror::Error;

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid media file: {0}")]
    InvalidMedia(String),

    #[error("media not found: {0}")]
    NotFound(String),

    #[error("probe failed: {0}")]
    Probe(String),

    #[error("operation cancelled: {0}")]
    Cancelled(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl MediaError {
    /// True for database errors worth retrying on a later run (busy/locked),
    /// as opposed to schema or constraint problems.
    pub fn is_transient(&self) -> bool {
        match self {
            MediaError::Database(sqlx::Error::Database(db)) => {
                let msg = db.message().to_ascii_lowercase();
                msg.contains("locked") || msg.contains("busy")
            }
            MediaError::Io(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, MediaError>;
