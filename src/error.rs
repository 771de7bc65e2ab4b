use thiserror::Error;

/// Which level of the hash hierarchy rejected the data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyLevel {
    /// The resident master hash table loaded at mount time.
    MasterTable,
    /// A per-block sector digest table checked against the master table.
    Block,
    /// A raw sector image checked against its block's digest table.
    Sector,
}

impl std::fmt::Display for VerifyLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VerifyLevel::MasterTable => write!(f, "master table"),
            VerifyLevel::Block => write!(f, "block"),
            VerifyLevel::Sector => write!(f, "sector"),
        }
    }
}

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("management buffer too small: need {required} bytes, got {provided}")]
    BufferTooSmall { required: usize, provided: usize },

    #[error("invalid image descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("offset {offset} (length {length}) is outside the verified image regions")]
    OutOfRange { offset: u32, length: u32 },

    #[error("device I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{level} hash verification failed at index {index}")]
    IntegrityFailure { level: VerifyLevel, index: u32 },
}

pub type Result<T> = std::result::Result<T, CacheError>;
