use thiserror::Error;

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Bincode error: {0}")]
    BincodeError(String),

    #[error("Envelope too large: {len} bytes (max {max})")]
    EnvelopeTooLarge { len: usize, max: usize },

    #[error("Invalid sample: {0}")]
    InvalidSample(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),
}

impl From<bincode::Error> for MediaError {
    fn from(error: bincode::Error) -> Self {
        MediaError::BincodeError(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MediaError>;
