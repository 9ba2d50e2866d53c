use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("unique constraint violated on '{field}': value {key} already exists")]
    UniqueViolated { field: String, key: String },

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("invalid modifier: {0}")]
    InvalidModifier(String),

    #[error("corrupt datafile: {0}")]
    CorruptDatafile(String),

    #[error("invalid options: {0}")]
    InvalidOptions(String),

    #[error("'_id' is immutable")]
    IdImmutable,

    #[error("update document mixes modifier keys and plain fields")]
    MixedFieldsAndModifiers,

    #[error("projection mixes inclusion and exclusion")]
    ProjectionConflict,

    #[error("index not found: {0}")]
    IndexNotFound(String),

    #[error("document not found")]
    NotFound,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
