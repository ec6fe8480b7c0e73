#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("Key not found")]
    NotFound,

    #[error("Key already exists")]
    AlreadyExists,

    #[error("Resource exhausted: failed to allocate {size} bytes")]
    ResourceExhausted { size: usize },

    #[error("Invalid options: {0}")]
    InvalidOptions(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
