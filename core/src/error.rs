use thiserror::Error;

#[derive(Debug, Error)]
pub enum TapeError {
    /// Total sample count would exceed [`crate::SAMPLE_LIMIT`].
    #[error("Tape too long (exceeds {} samples)", crate::SAMPLE_LIMIT)]
    TooLong,

    #[error("Invalid chunk at offset {offset}: {detail}")]
    MalformedChunk { offset: u64, detail: String },

    #[error("Unsupported chunk '{kind}' at offset {offset}")]
    UnsupportedChunk { offset: u64, kind: String },

    #[error("File is not in a recognizable Atari cassette format")]
    UnrecognizedFormat,

    #[error("Failed to read {wanted} bytes at position {offset}")]
    UnexpectedEof { offset: u64, wanted: usize },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),
}

pub type Result<T> = std::result::Result<T, TapeError>;
