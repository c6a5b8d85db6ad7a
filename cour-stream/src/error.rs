use std::io;

pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy of the stream layer.
///
/// `Again` and `Timeout` are transient and never recorded in the sticky
/// error slot of a stream; everything else is.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("stream is not open")]
    NotOpen,

    #[error("stream does not support {0}")]
    NotSupported(&'static str),

    #[error("buffer space exhausted")]
    BufSpace,

    #[error("operation timed out")]
    Timeout,

    #[error("operation would block")]
    Again,

    #[error("seek position out of range")]
    BadSeek,

    #[error("no such filter codec: {0}")]
    NoCodec(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Transient conditions do not poison the stream.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Again | Error::Timeout)
    }
}
