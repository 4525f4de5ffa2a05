use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DatabaseError {
    /// Every call after `close` fails with this.
    #[error("database closed")]
    Closed,

    /// A key that must exist is absent. Optional lookups return `None`.
    #[error("key {} not found", hex::encode(.0))]
    NotFound(Vec<u8>),

    /// Stored bytes could not be decoded.
    #[error("corrupt value: {0}")]
    Corruption(String),
}

impl DatabaseError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, DatabaseError>;
