use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, GraphError>;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("schema error: {0}")]
    Schema(String),
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(&'static str),
    #[error("duplicate key: {0}")]
    DuplicateKey(i64),
    #[error("unknown vertex: {0}")]
    UnknownVertex(i64),
    #[error("corrupt log: {0}")]
    CorruptLog(&'static str),
    #[error("corruption detected: {0}")]
    Corruption(&'static str),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}
