//! MIME multipart support for messages served from the storage engines.
//!
//! [`MultipartReader`] walks a body stream with a boundary-driven state
//! machine and exposes each part as offsets plus bounded stream windows;
//! [`MultipartBuilder`] assembles a composite body stream from an ordered
//! list of parts.

pub mod compose;
pub mod parse;

pub use compose::{generate_boundary, MultipartBuilder};
pub use parse::{content_type_boundary, is_multipart, MultipartReader, PartLocation};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("content type carries no usable boundary")]
    BadBoundary,

    #[error("multipart parse error: {0}")]
    Parse(String),

    #[error(transparent)]
    Stream(#[from] cour_stream::Error),
}
