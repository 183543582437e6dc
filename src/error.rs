use thiserror::Error;

/// Crate-wide error type. Repository failures bubble up as `Db`; the
/// external collaborators (inference engine, fetcher, vector store,
/// document reader) report through their own variants so callers can
/// tell a storage problem from an engine problem.
#[derive(Debug, Error)]
pub enum Error {
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("inference engine error: {0}")]
    Engine(String),

    #[error("resource fetch error: {0}")]
    Fetch(String),

    #[error("document extraction error: {0}")]
    Extract(String),

    #[error("unsupported file type: .{0}")]
    UnsupportedFileType(String),

    #[error("vector store error: {0}")]
    VectorStore(String),
}

pub type Result<T> = std::result::Result<T, Error>;
