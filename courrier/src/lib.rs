//! Courrier: local mailbox storage.
//!
//! The facade over the storage stack. [`Mailbox`] maps an abstract
//! mailbox onto mbox, maildir or dotmail files; [`stream`] holds the
//! buffered stream layer and filter codecs the engines are built on,
//! [`lock`] the advisory file locker, and [`mime`] the multipart
//! reader/writer used when serving messages.
//!
//! ```no_run
//! use courrier::{Mailbox, OpenOptions, OutgoingMessage};
//!
//! # async fn demo() -> courrier::Result<()> {
//! let mbox = Mailbox::open("/var/mail/joe", OpenOptions::read_write()).await?;
//! let count = mbox.count().await?;
//! mbox.append(&OutgoingMessage::from_bytes(
//!     &b"From: joe@example.org\nSubject: hello\n\nhi\n"[..],
//! ))
//! .await?;
//! assert_eq!(mbox.count().await?, count + 1);
//! mbox.close().await?;
//! # Ok(())
//! # }
//! ```

pub use cour_lock as lock;
pub use cour_mime as mime;
pub use cour_store as store;
pub use cour_stream as stream;

pub use cour_store::{
    Attributes, BodyCodec, Envelope, Error, EventKind, Folder, FolderEntry, Headers, LockerChoice,
    Mailbox, MailboxEvent, MailboxFormat, MailboxUrl, MessageHandle, Observable, ObserverAction,
    OpenOptions, OutgoingMessage, Result, Scheme,
};
