pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("no such message or record")]
    NoEnt,

    #[error("record already exists")]
    Exists,

    #[error("mailbox is read-only")]
    ReadOnly,

    #[error("message handle detached from its mailbox")]
    Detached,

    #[error("mailbox changed on disk; rescan required")]
    Sync,

    #[error("scan interrupted by observer")]
    Interrupted,

    #[error("no mailbox backend for scheme: {0}")]
    NoSuchScheme(String),

    #[error("invalid mailbox locator: {0}")]
    BadUrl(String),

    #[error(transparent)]
    Lock(#[from] cour_lock::Error),

    #[error(transparent)]
    Stream(#[from] cour_stream::Error),

    #[error(transparent)]
    Mime(#[from] cour_mime::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
