use thiserror::Error;

/// Errors surfaced while opening songs and building streams.
///
/// The buffer-fill path never produces these; it logs and reports end of
/// stream through its boolean result instead.
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unsupported audio format: {0}")]
    UnsupportedFormat(String),

    #[error("Decoding error: {0}")]
    Decode(String),

    #[error("Audio device error: {0}")]
    Device(String),

    #[error("Stream error: {0}")]
    Stream(String),
}

pub type Result<T> = std::result::Result<T, AudioError>;
