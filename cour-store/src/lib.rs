//! Local mailbox storage engines.
//!
//! A [`Mailbox`] is an ordered, mutable collection of messages with
//! persistent UIDs and per-message flags, mapped onto one of three
//! on-disk layouts — mbox, maildir or dotmail — with byte-exact
//! preservation of unchanged data, crash-safe mutation through an
//! atomic temp+rename flush, advisory locking and an incremental
//! scanner that tolerates concurrent appenders.

pub mod attribute;
pub mod dotmail;
pub mod envelope;
pub mod error;
pub mod folder;
pub mod guard;
pub mod header;
pub mod mailbox;
pub mod maildir;
pub mod mbox;
pub mod message;
pub mod observable;
pub mod property;
pub mod registrar;
pub mod uidmeta;
pub mod url;

pub use attribute::Attributes;
pub use envelope::{Envelope, ENVELOPE_DATE_FORMAT, MAILER_DAEMON};
pub use error::{Error, Result};
pub use folder::{glob_match, Folder, FolderEntry};
pub use header::{HeaderField, Headers};
pub use mailbox::{LockerChoice, Mailbox, MailboxOps, OpenOptions};
pub use message::{BodyCodec, MessageHandle, OutgoingMessage};
pub use observable::{EventKind, MailboxEvent, Observable, ObserverAction};
pub use registrar::{detect_format, MailboxFormat};
pub use url::{MailboxUrl, Scheme};
