use std::sync::Arc;

use async_trait::async_trait;
use cour_lock::LockerHints;
use tokio::sync::RwLock;

use crate::attribute::Attributes;
use crate::error::Result;
use crate::message::{MessageHandle, OutgoingMessage};
use crate::observable::Observable;
use crate::registrar;
use crate::url::MailboxUrl;

/// How the mailbox lock is chosen at open time.
#[derive(Clone, Debug, Default)]
pub enum LockerChoice {
    /// Dotlock with the library defaults.
    #[default]
    Default,
    /// Caller-supplied hints.
    Hints(LockerHints),
    /// No filesystem locking (single-writer setups, tests).
    None,
}

/// Open-time configuration, passed as a plain struct; there is no
/// process-global state to configure.
#[derive(Clone, Debug, Default)]
pub struct OpenOptions {
    pub write: bool,
    /// Create the store if it does not exist (implies `write`).
    pub create: bool,
    pub locker: LockerChoice,
    /// Autodetection strictness for `file:` locators; level 0 accepts
    /// any existing file as mbox, level 1 and up demand a From_ line.
    pub detect_level: u8,
}

impl OpenOptions {
    pub fn read_only() -> OpenOptions {
        OpenOptions::default()
    }

    pub fn read_write() -> OpenOptions {
        OpenOptions {
            write: true,
            ..OpenOptions::default()
        }
    }

    pub fn create() -> OpenOptions {
        OpenOptions {
            write: true,
            create: true,
            ..OpenOptions::default()
        }
    }
}

/// The uniform engine interface. One implementation per on-disk layout;
/// the registrar picks which one a locator resolves to.
#[async_trait]
pub trait MailboxOps: Send {
    /// Scan from the given 1-based ordinal, dispatching MessageAdd
    /// events for messages at or past it. Returns the message count.
    async fn scan(&mut self, from: usize) -> Result<usize>;

    async fn count(&mut self) -> Result<usize>;

    /// Messages not yet marked seen.
    async fn recent(&mut self) -> Result<usize>;

    /// Ordinal of the first unread message.
    async fn unseen(&mut self) -> Result<Option<usize>>;

    async fn size(&mut self) -> Result<u64>;

    async fn uidvalidity(&mut self) -> Result<u32>;
    async fn set_uidvalidity(&mut self, value: u32) -> Result<()>;
    async fn uidnext(&mut self) -> Result<u32>;
    async fn message_uid(&mut self, ordinal: usize) -> Result<u32>;

    async fn get_message(&mut self, ordinal: usize) -> Result<MessageHandle>;

    /// Fetch a single message by its quick-access token (a byte offset
    /// or a relative file name, format depending on the engine) without
    /// a full scan.
    async fn quick_get_message(&mut self, qid: &str) -> Result<MessageHandle>;

    async fn append(&mut self, msg: &OutgoingMessage) -> Result<()>;

    async fn get_attributes(&mut self, ordinal: usize) -> Result<Attributes>;
    async fn add_attributes(&mut self, ordinal: usize, attrs: Attributes) -> Result<()>;
    async fn del_attributes(&mut self, ordinal: usize, attrs: Attributes) -> Result<()>;
    async fn set_attributes(&mut self, ordinal: usize, attrs: Attributes) -> Result<()>;

    /// Persist pending changes, keeping deleted messages.
    async fn sync(&mut self) -> Result<()>;

    /// Persist pending changes, dropping messages marked deleted and
    /// renumbering the survivors.
    async fn expunge(&mut self) -> Result<()>;

    /// Flush and release locks; outstanding handles become inert.
    async fn close(&mut self) -> Result<()>;
}

pub(crate) enum Engine {
    Mbox(crate::mbox::MboxMailbox),
    Maildir(crate::maildir::MaildirMailbox),
    Dotmail(crate::dotmail::DotmailMailbox),
}

impl Engine {
    fn ops(&mut self) -> &mut dyn MailboxOps {
        match self {
            Engine::Mbox(m) => m,
            Engine::Maildir(m) => m,
            Engine::Dotmail(m) => m,
        }
    }
}

/// A mailbox: an ordered, mutable collection of messages with stable
/// UIDs and per-message flags, backed by one of the storage engines.
///
/// The facade owns the engine behind a reader/writer monitor. All
/// operations that may rescan or mutate take the writer half; observer
/// callbacks are synchronous closures registered on the observable and
/// never re-enter the async API, so no lock juggling is needed around
/// notifications.
pub struct Mailbox {
    url: MailboxUrl,
    observable: Arc<Observable>,
    engine: RwLock<Engine>,
}

impl Mailbox {
    /// Open a mailbox by locator, dispatching on its scheme.
    pub async fn open(locator: &str, opts: OpenOptions) -> Result<Mailbox> {
        let url = MailboxUrl::parse(locator)?;
        let observable = Arc::new(Observable::new());
        let engine = registrar::open_engine(&url, &opts, observable.clone()).await?;
        Ok(Mailbox {
            url,
            observable,
            engine: RwLock::new(engine),
        })
    }

    pub fn url(&self) -> &MailboxUrl {
        &self.url
    }

    pub fn observable(&self) -> Arc<Observable> {
        self.observable.clone()
    }

    pub async fn scan(&self, from: usize) -> Result<usize> {
        self.engine.write().await.ops().scan(from).await
    }

    pub async fn count(&self) -> Result<usize> {
        self.engine.write().await.ops().count().await
    }

    pub async fn recent(&self) -> Result<usize> {
        self.engine.write().await.ops().recent().await
    }

    pub async fn unseen(&self) -> Result<Option<usize>> {
        self.engine.write().await.ops().unseen().await
    }

    pub async fn size(&self) -> Result<u64> {
        self.engine.write().await.ops().size().await
    }

    pub async fn uidvalidity(&self) -> Result<u32> {
        self.engine.write().await.ops().uidvalidity().await
    }

    pub async fn set_uidvalidity(&self, value: u32) -> Result<()> {
        self.engine.write().await.ops().set_uidvalidity(value).await
    }

    pub async fn uidnext(&self) -> Result<u32> {
        self.engine.write().await.ops().uidnext().await
    }

    pub async fn message_uid(&self, ordinal: usize) -> Result<u32> {
        self.engine.write().await.ops().message_uid(ordinal).await
    }

    pub async fn get_message(&self, ordinal: usize) -> Result<MessageHandle> {
        self.engine.write().await.ops().get_message(ordinal).await
    }

    pub async fn quick_get_message(&self, qid: &str) -> Result<MessageHandle> {
        self.engine.write().await.ops().quick_get_message(qid).await
    }

    pub async fn append(&self, msg: &OutgoingMessage) -> Result<()> {
        self.engine.write().await.ops().append(msg).await
    }

    pub async fn get_attributes(&self, ordinal: usize) -> Result<Attributes> {
        self.engine.write().await.ops().get_attributes(ordinal).await
    }

    pub async fn add_attributes(&self, ordinal: usize, attrs: Attributes) -> Result<()> {
        self.engine
            .write()
            .await
            .ops()
            .add_attributes(ordinal, attrs)
            .await
    }

    pub async fn del_attributes(&self, ordinal: usize, attrs: Attributes) -> Result<()> {
        self.engine
            .write()
            .await
            .ops()
            .del_attributes(ordinal, attrs)
            .await
    }

    pub async fn set_attributes(&self, ordinal: usize, attrs: Attributes) -> Result<()> {
        self.engine
            .write()
            .await
            .ops()
            .set_attributes(ordinal, attrs)
            .await
    }

    pub async fn sync(&self) -> Result<()> {
        self.engine.write().await.ops().sync().await
    }

    pub async fn expunge(&self) -> Result<()> {
        self.engine.write().await.ops().expunge().await
    }

    pub async fn close(&self) -> Result<()> {
        self.engine.write().await.ops().close().await
    }
}
