use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Unsupported serialization version: {0}")]
    UnsupportedVersion(u8),
    #[error("Malformed archive: {0}")]
    Malformed(&'static str),
    #[error("Value store is full")]
    TableFull,
    #[error("Persist state error: {0}")]
    Persist(String),
}

pub type CoreResult<T> = Result<T, CoreError>;
