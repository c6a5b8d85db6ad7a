//! Buffered byte streams and the line-oriented codecs built on them.
//!
//! A [`Stream`] owns a boxed [`StreamImpl`] backend and layers buffering,
//! flags, byte accounting, sticky error state and event callbacks on top.
//! Backends cover files, memory, bounded windows over shared streams,
//! paired input/output transports, read-spooling caches and a diagnostic
//! sink. Filters wrap a stream with a named codec; the transcript stream
//! tees a transport into a session log with credential redaction.

pub mod error;
pub mod file;
pub mod filter;
pub mod iostream;
pub mod mem;
pub mod rdcache;
pub mod stream;
pub mod streamref;
pub mod xscript;

pub use error::{Error, Result};
pub use file::{DbgStream, FdStream, FileStream, MapFileStream};
pub use filter::{create_codec, Codec, FallbackPolicy, FilterMode, FilterStream};
pub use iostream::IoStream;
pub use mem::{MemStream, NullStream};
pub use rdcache::RdCacheStream;
pub use stream::{
    copy, copy_nl, BufferMode, SharedStream, Stream, StreamEvent, StreamFlags, StreamImpl,
    DEFAULT_BUFSIZE,
};
pub use streamref::StreamRef;
pub use xscript::{Channel, ChannelConfig, TranscriptLevel, TranscriptStream};
