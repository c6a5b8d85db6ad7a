//! The traditional From_-delimited single-file mailbox.
//!
//! A byte-offset index over the file is rebuilt incrementally by the
//! scanner; mutation is persisted by an atomic temp+rename flush. UIDs
//! live in `X-UID` headers with the mailbox-wide counters in an
//! `X-IMAPbase` header carried by the first message.

mod flush;
mod scan;

pub use scan::{parse_from_line, FromLine};

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use cour_lock::{Locker, LockerHints};
use cour_stream::{
    copy_nl, FileStream, FilterMode, FilterStream, MemStream, SharedStream, Stream, StreamFlags,
    StreamRef,
};

use crate::attribute::Attributes;
use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::header::Headers;
use crate::mailbox::{LockerChoice, MailboxOps, OpenOptions};
use crate::message::{BodyCodec, MessageHandle, MessageSource, OutgoingMessage, SessionTether};
use crate::observable::{MailboxEvent, Observable, ObserverAction};
use crate::uidmeta::{
    format_imapbase_value, header_value, parse_imapbase_value, uidvalidity_now, HDR_STATUS,
    HDR_X_IMAPBASE, HDR_X_UID, UID_HEADERS,
};

pub(crate) use flush::FlushMode;

/// Level >= 1 demands a valid From_ line in the first 128 bytes; level 0
/// accepts any existing file. An empty file is a valid empty mailbox.
pub async fn looks_like_mbox(path: &Path, level: u8) -> Result<bool> {
    let meta = match tokio::fs::metadata(path).await {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    if !meta.is_file() {
        return Ok(false);
    }
    if level == 0 || meta.len() == 0 {
        return Ok(true);
    }
    let mut file = tokio::fs::File::open(path).await?;
    let mut buf = [0u8; 128];
    use tokio::io::AsyncReadExt;
    let n = file.read(&mut buf).await?;
    Ok(parse_from_line(&buf[..n]).is_some())
}

/// One message's slot in the index. `message_end` is the inclusive
/// offset of the last content byte; the blank separator line after it
/// belongs to no message.
#[derive(Clone, Debug)]
pub(crate) struct MboxRecord {
    pub message_start: u64,
    pub from_length: u64,
    pub body_start: u64,
    pub message_end: u64,
    pub env_sender: String,
    pub env_date: String,
    pub uid: u32,
    pub uid_modified: bool,
    pub attrs: Attributes,
}

impl MboxRecord {
    fn header_start(&self) -> u64 {
        self.message_start + self.from_length
    }

    /// Raw header block length, excluding the blank separator line.
    fn header_len(&self) -> u64 {
        (self.body_start - 1).saturating_sub(self.header_start())
    }

    fn body_len(&self) -> u64 {
        (self.message_end + 1).saturating_sub(self.body_start)
    }

    fn dirty(&self) -> bool {
        self.uid_modified
            || self.attrs.contains(Attributes::MODIFIED)
            || self.attrs.contains(Attributes::DELETED)
    }
}

pub struct MboxMailbox {
    path: PathBuf,
    writable: bool,
    stream: SharedStream,
    locker: Option<Locker>,
    observable: Arc<Observable>,
    tether: Arc<SessionTether>,
    pub(crate) messages: Vec<MboxRecord>,
    /// Size snapshot from the last scan; detects external growth.
    size: u64,
    pub(crate) uidvalidity: u32,
    pub(crate) uidnext: u32,
    pub(crate) uidvalidity_scanned: bool,
    pub(crate) uidvalidity_changed: bool,
    pub(crate) x_imapbase_off: u64,
    pub(crate) x_imapbase_len: usize,
}

impl MboxMailbox {
    pub async fn open(
        path: &Path,
        opts: &OpenOptions,
        observable: Arc<Observable>,
    ) -> Result<MboxMailbox> {
        let writable = opts.write || opts.create;
        if opts.create && tokio::fs::metadata(path).await.is_err() {
            tokio::fs::File::create(path).await?;
        }
        let mut flags = StreamFlags::READ;
        if writable {
            flags = flags | StreamFlags::WRITE;
        }
        let stream = FileStream::create(path, flags).await?.into_shared();
        let locker = match &opts.locker {
            LockerChoice::None => None,
            LockerChoice::Default => Some(Locker::create(path, LockerHints::default()).await?),
            LockerChoice::Hints(hints) => Some(Locker::create(path, hints.clone()).await?),
        };
        Ok(MboxMailbox {
            path: path.to_path_buf(),
            writable,
            stream,
            locker,
            observable,
            tether: SessionTether::new(),
            messages: Vec::new(),
            size: 0,
            uidvalidity: 0,
            uidnext: 0,
            uidvalidity_scanned: false,
            uidvalidity_changed: false,
            x_imapbase_off: 0,
            x_imapbase_len: 0,
        })
    }

    pub(crate) fn writable(&self) -> bool {
        self.writable
    }

    pub(crate) fn replace_stream(&mut self, stream: SharedStream) {
        self.stream = stream;
    }

    fn dispatch(&self, event: MailboxEvent) -> Result<()> {
        match self.observable.notify(&event) {
            ObserverAction::Continue => Ok(()),
            ObserverAction::Stop => Err(Error::Interrupted),
        }
    }

    pub(crate) fn alloc_next_uid(&mut self) -> u32 {
        if self.uidnext == 0 {
            self.uidnext = 1;
        }
        self.uidvalidity_changed = true;
        let uid = self.uidnext;
        self.uidnext += 1;
        uid
    }

    /// Close out one scanned message: fix its end offset, settle its
    /// uid, and announce it. Long scans keep the dotlock fresh every
    /// hundred messages.
    async fn finalize_scanned(
        &mut self,
        mut rec: MboxRecord,
        end: u64,
        force_init_uids: &mut bool,
    ) -> Result<()> {
        rec.message_end = end;
        if rec.body_start == 0 {
            rec.body_start = rec.message_end + 1;
        }
        if rec.uid == 0 {
            *force_init_uids = true;
        }
        if *force_init_uids {
            rec.uid = self.alloc_next_uid();
            rec.uid_modified = true;
        }
        self.messages.push(rec);
        let count = self.messages.len();
        if count % 100 == 0 {
            if let Some(locker) = &mut self.locker {
                if locker.is_locked() {
                    let _ = locker.touch().await;
                }
            }
        }
        self.dispatch(MailboxEvent::MessageAdd { ordinal: count })
    }

    /// Scan the file from `offset`, appending to the index.
    ///
    /// `offset` equal to the current file size is a no-op. A non-zero
    /// offset lands on the blank separator written after the previous
    /// message, so leading blank lines are skipped there; at offset zero
    /// the first physical line must be a valid From_ line.
    async fn rescan_unlocked(&mut self, offset: u64) -> Result<()> {
        {
            let mut guard = self.stream.lock().await;
            self.size = guard.size().await?;
        }
        if offset == self.size {
            return Ok(());
        }

        let mut stream = StreamRef::whole(self.stream.clone())
            .open_stream(StreamFlags::READ)
            .await?;
        stream.seek(SeekFrom::Start(offset)).await?;

        #[derive(PartialEq)]
        enum State {
            Init,
            Header,
            Body,
            EmptyLine,
        }

        let mut state = State::Init;
        let mut pos = offset;
        let mut line: Vec<u8> = Vec::new();
        let mut current: Option<MboxRecord> = None;
        let mut force_init_uids = false;
        let mut numlines: u64 = 0;

        loop {
            line.clear();
            let n = stream.read_line(&mut line).await?;
            if n == 0 {
                break;
            }
            match state {
                State::Init => {
                    if offset > 0 && line == b"\n" {
                        // The separator blank belongs to no message.
                    } else {
                        match parse_from_line(&line) {
                            Some(from) => {
                                current = Some(MboxRecord {
                                    message_start: pos,
                                    from_length: n as u64,
                                    body_start: 0,
                                    message_end: 0,
                                    env_sender: from.sender,
                                    env_date: from.date,
                                    uid: 0,
                                    uid_modified: false,
                                    attrs: Attributes::empty(),
                                });
                                state = State::Header;
                            }
                            None => {
                                tracing::error!(path = %self.path.display(),
                                    "file does not start with a valid From_ line");
                                return Err(Error::Parse(format!(
                                    "{}: not a valid mbox file",
                                    self.path.display()
                                )));
                            }
                        }
                    }
                }
                State::Header => {
                    let rec = current.as_mut().expect("header state without message");
                    if line == b"\n" {
                        rec.body_start = pos + 1;
                        state = State::Body;
                    } else if line[0] == b' ' || line[0] == b'\t' {
                        // Continuation line.
                    } else if let Some(value) = header_value(&line, HDR_X_IMAPBASE) {
                        if self.messages.is_empty() {
                            if let Some((v, nx)) = parse_imapbase_value(value) {
                                if !self.uidvalidity_scanned {
                                    self.uidvalidity = v;
                                    self.uidnext = nx;
                                    self.uidvalidity_scanned = true;
                                }
                                self.x_imapbase_off = pos;
                                self.x_imapbase_len = n - 1;
                            }
                        }
                    } else if let Some(value) = header_value(&line, HDR_X_UID) {
                        if !force_init_uids && rec.uid == 0 {
                            let parsed: Option<u32> = value.trim().parse().ok();
                            let prev_uid = self.messages.last().map(|m| m.uid).unwrap_or(0);
                            match parsed {
                                Some(uid) if uid < self.uidnext && uid > prev_uid => {
                                    rec.uid = uid;
                                }
                                _ => force_init_uids = true,
                            }
                        }
                    } else if let Some(value) = header_value(&line, HDR_STATUS) {
                        rec.attrs.merge_status_letters(value);
                    }
                }
                State::Body => {
                    if line == b"\n" {
                        state = State::EmptyLine;
                    }
                }
                State::EmptyLine => {
                    if let Some(from) = parse_from_line(&line) {
                        let rec = current.take().expect("empty-line state without message");
                        self.finalize_scanned(rec, pos - 2, &mut force_init_uids)
                            .await?;
                        current = Some(MboxRecord {
                            message_start: pos,
                            from_length: n as u64,
                            body_start: 0,
                            message_end: 0,
                            env_sender: from.sender,
                            env_date: from.date,
                            uid: 0,
                            uid_modified: false,
                            attrs: Attributes::empty(),
                        });
                        state = State::Header;
                    } else if line == b"\n" {
                        // Still in a run of blank lines.
                    } else {
                        state = State::Body;
                    }
                }
            }
            pos += n as u64;
            numlines += 1;
            if numlines % 1000 == 0 {
                self.dispatch(MailboxEvent::Progress)?;
            }
        }

        if let Some(rec) = current.take() {
            // A file ending in a blank-terminated message leaves the
            // scanner in the empty-line state; that final blank is the
            // separator and belongs to no message, exactly as in the
            // mid-file case.
            let end = if state == State::EmptyLine {
                pos - 2
            } else {
                pos - 1
            };
            self.finalize_scanned(rec, end, &mut force_init_uids)
                .await?;
        }

        if force_init_uids {
            self.uidvalidity = uidvalidity_now();
            self.uidvalidity_changed = true;
            self.uidvalidity_scanned = true;
        }

        Ok(())
    }

    fn is_updated(&self, current_size: u64) -> bool {
        current_size == self.size
    }

    /// Revalidate against the file and pick up external growth. A file
    /// that shrank under us is corrupt: observers are told and the index
    /// is rebuilt from scratch.
    pub(crate) async fn refresh(&mut self) -> Result<()> {
        let current = {
            let mut guard = self.stream.lock().await;
            guard.size().await?
        };
        if self.is_updated(current) {
            return Ok(());
        }
        if current < self.size {
            tracing::warn!(path = %self.path.display(),
                "mailbox shrank from {} to {} bytes; rescanning", self.size, current);
            self.dispatch(MailboxEvent::Corrupt)?;
            self.reset_index();
            return self.rescan_unlocked(0).await;
        }
        let offset = match self.messages.last() {
            Some(last) => last.message_end + 1,
            None => 0,
        };
        self.rescan_unlocked(offset).await
    }

    fn reset_index(&mut self) {
        self.messages.clear();
        self.size = 0;
        self.uidvalidity_scanned = false;
        self.uidvalidity_changed = false;
        self.x_imapbase_off = 0;
        self.x_imapbase_len = 0;
    }

    /// Lazy UID initialization for mailboxes that never carried an
    /// X-IMAPbase: first call assigns ordinal UIDs and stamps a fresh
    /// uidvalidity, to be persisted by the next flush.
    pub(crate) async fn uid_setup(&mut self) -> Result<()> {
        if self.uidvalidity_scanned {
            return Ok(());
        }
        self.refresh().await?;
        if self.uidvalidity_scanned {
            return Ok(());
        }
        self.uidvalidity = uidvalidity_now();
        self.uidnext = 1;
        self.uidvalidity_scanned = true;
        self.uidvalidity_changed = true;
        for i in 0..self.messages.len() {
            let uid = self.alloc_next_uid();
            self.messages[i].uid = uid;
            self.messages[i].uid_modified = true;
        }
        Ok(())
    }

    fn record(&self, ordinal: usize) -> Result<&MboxRecord> {
        if ordinal == 0 || ordinal > self.messages.len() {
            return Err(Error::NoEnt);
        }
        Ok(&self.messages[ordinal - 1])
    }

    fn record_mut(&mut self, ordinal: usize) -> Result<&mut MboxRecord> {
        if ordinal == 0 || ordinal > self.messages.len() {
            return Err(Error::NoEnt);
        }
        Ok(&mut self.messages[ordinal - 1])
    }

    async fn make_handle(&mut self, ordinal: usize) -> Result<MessageHandle> {
        self.uid_setup().await?;
        let rec = self.record(ordinal)?;
        let header_start = rec.header_start();
        let header_len = rec.header_len();
        let mut headers_raw = vec![0u8; header_len as usize];
        {
            let mut stream = StreamRef::new(self.stream.clone(), header_start, Some(header_len))
                .open_stream(StreamFlags::READ)
                .await?;
            stream.read_exact(&mut headers_raw).await?;
        }
        let headers = Headers::parse(&headers_raw);
        let rec = self.record(ordinal)?;
        Ok(MessageHandle::new(
            ordinal,
            rec.uid,
            rec.attrs,
            Envelope::new(rec.env_sender.clone(), rec.env_date.clone()),
            headers,
            MessageSource {
                stream: self.stream.clone(),
                header_start,
                header_len,
                body_start: rec.body_start,
                body_len: rec.body_len(),
                codec: BodyCodec::Fromrb,
            },
            self.tether.clone(),
        ))
    }

    async fn append_unlocked(&mut self, msg: &OutgoingMessage) -> Result<()> {
        let (orig_size, start) = {
            let mut guard = self.stream.lock().await;
            let size = guard.size().await?;
            // Make sure the previous message is terminated by exactly
            // its own newline plus one blank line.
            let pad = if self.messages.is_empty() || size == 0 {
                0
            } else {
                let from = size.saturating_sub(2);
                guard.seek(SeekFrom::Start(from)).await?;
                let mut tail = [0u8; 2];
                let got = (size - from) as usize;
                guard.read_exact(&mut tail[..got]).await?;
                if tail[got - 1] != b'\n' {
                    2
                } else if got < 2 || tail[0] != b'\n' {
                    1
                } else {
                    0
                }
            };
            guard.seek(SeekFrom::Start(size)).await?;
            for _ in 0..pad {
                guard.write_all(b"\n").await?;
            }
            (size, size + pad)
        };

        let result = self.append_body(msg, start).await;
        if let Err(e) = result {
            // Leave the mailbox exactly as it was.
            let mut guard = self.stream.lock().await;
            if let Err(te) = guard.truncate(orig_size).await {
                tracing::error!(path = %self.path.display(), error = %te,
                    "cannot truncate mailbox after failed append");
            }
            return Err(e);
        }

        self.rescan_unlocked(start).await?;
        self.dispatch(MailboxEvent::MessageAppend {
            offset: start.to_string(),
        })?;
        Ok(())
    }

    async fn append_body(&mut self, msg: &OutgoingMessage, start: u64) -> Result<()> {
        let env = msg.resolved_envelope();
        let headers = msg.headers();
        let first_message = self.messages.is_empty();
        let uid_headers = if self.uidvalidity_scanned {
            let mut out = String::new();
            if first_message {
                out.push_str(&format!(
                    "{}: {}\n",
                    HDR_X_IMAPBASE,
                    format_imapbase_value(self.uidvalidity, self.uidnext)
                ));
            }
            let uid = self.alloc_next_uid();
            out.push_str(&format!("{}: {}\n", HDR_X_UID, uid));
            out
        } else {
            String::new()
        };

        let mut guard = self.stream.lock().await;
        guard.seek(SeekFrom::Start(start)).await?;
        guard
            .write_all(format!("From {} {}\n", env.sender, env.date).as_bytes())
            .await?;
        guard
            .write_all(&headers.to_bytes_excluding(&UID_HEADERS))
            .await?;
        guard.write_all(uid_headers.as_bytes()).await?;
        guard.write_all(b"\n").await?;

        // Body goes through the From_ escaper.
        let mut body_src = Stream::new(
            Box::new(MemStream::from(msg.body().to_vec())),
            StreamFlags::READ | StreamFlags::SEEK,
        );
        body_src.open().await?;
        let mut encoded = FilterStream::create(
            body_src,
            "FROMRB",
            FilterMode::Encode,
            StreamFlags::READ,
        )
        .await?;
        copy_nl(&mut guard, &mut encoded, None).await?;
        guard.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl MailboxOps for MboxMailbox {
    async fn scan(&mut self, from: usize) -> Result<usize> {
        if from == 0 || (!self.messages.is_empty() && from > self.messages.len()) {
            return Err(Error::NoEnt);
        }
        let current = {
            let mut guard = self.stream.lock().await;
            guard.size().await?
        };
        if !self.is_updated(current) {
            self.messages.truncate(from.saturating_sub(1));
            self.refresh().await?;
        } else {
            for i in from..=self.messages.len() {
                if self
                    .observable
                    .notify(&MailboxEvent::MessageAdd { ordinal: i })
                    == ObserverAction::Stop
                {
                    break;
                }
                if (i + 1) % 50 == 0 {
                    self.observable.notify(&MailboxEvent::Progress);
                }
            }
        }
        Ok(self.messages.len())
    }

    async fn count(&mut self) -> Result<usize> {
        self.refresh().await?;
        Ok(self.messages.len())
    }

    async fn recent(&mut self) -> Result<usize> {
        self.refresh().await?;
        Ok(self
            .messages
            .iter()
            .filter(|m| m.attrs.is_unseen())
            .count())
    }

    async fn unseen(&mut self) -> Result<Option<usize>> {
        self.refresh().await?;
        Ok(self
            .messages
            .iter()
            .position(|m| m.attrs.is_unread())
            .map(|i| i + 1))
    }

    async fn size(&mut self) -> Result<u64> {
        let mut guard = self.stream.lock().await;
        Ok(guard.size().await?)
    }

    async fn uidvalidity(&mut self) -> Result<u32> {
        self.uid_setup().await?;
        Ok(self.uidvalidity)
    }

    async fn set_uidvalidity(&mut self, value: u32) -> Result<()> {
        self.uid_setup().await?;
        if self.uidvalidity != value {
            self.uidvalidity = value;
            self.uidvalidity_changed = true;
        }
        Ok(())
    }

    async fn uidnext(&mut self) -> Result<u32> {
        self.uid_setup().await?;
        Ok(self.uidnext)
    }

    async fn message_uid(&mut self, ordinal: usize) -> Result<u32> {
        self.uid_setup().await?;
        Ok(self.record(ordinal)?.uid)
    }

    async fn get_message(&mut self, ordinal: usize) -> Result<MessageHandle> {
        if self.messages.is_empty() {
            self.refresh().await?;
        }
        self.make_handle(ordinal).await
    }

    async fn quick_get_message(&mut self, qid: &str) -> Result<MessageHandle> {
        let offset: u64 = qid
            .parse()
            .map_err(|_| Error::Parse(format!("bad message token: {}", qid)))?;
        // An already-built index is searched directly; the token may
        // name any message, not just the first.
        if let Some(i) = self
            .messages
            .iter()
            .position(|m| m.message_start == offset)
        {
            return self.make_handle(i + 1).await;
        }
        if !self.messages.is_empty() {
            return Err(Error::Exists);
        }
        self.rescan_unlocked(offset).await?;
        match self
            .messages
            .iter()
            .position(|m| m.message_start == offset)
        {
            Some(i) => self.make_handle(i + 1).await,
            None if self.messages.is_empty() => Err(Error::NoEnt),
            None => Err(Error::Exists),
        }
    }

    async fn append(&mut self, msg: &OutgoingMessage) -> Result<()> {
        if !self.writable {
            return Err(Error::ReadOnly);
        }
        self.refresh().await?;
        if let Some(locker) = &mut self.locker {
            locker.lock().await?;
        }
        let result = self.append_unlocked(msg).await;
        if let Some(locker) = &mut self.locker {
            let _ = locker.unlock().await;
        }
        result
    }

    async fn get_attributes(&mut self, ordinal: usize) -> Result<Attributes> {
        if self.messages.is_empty() {
            self.refresh().await?;
        }
        Ok(self.record(ordinal)?.attrs)
    }

    async fn add_attributes(&mut self, ordinal: usize, attrs: Attributes) -> Result<()> {
        if !self.writable {
            return Err(Error::ReadOnly);
        }
        let rec = self.record_mut(ordinal)?;
        rec.attrs.insert(attrs);
        rec.attrs.insert(Attributes::MODIFIED);
        Ok(())
    }

    async fn del_attributes(&mut self, ordinal: usize, attrs: Attributes) -> Result<()> {
        if !self.writable {
            return Err(Error::ReadOnly);
        }
        let rec = self.record_mut(ordinal)?;
        rec.attrs.remove(attrs);
        rec.attrs.insert(Attributes::MODIFIED);
        Ok(())
    }

    async fn set_attributes(&mut self, ordinal: usize, attrs: Attributes) -> Result<()> {
        if !self.writable {
            return Err(Error::ReadOnly);
        }
        let rec = self.record_mut(ordinal)?;
        rec.attrs = attrs.union(Attributes::MODIFIED);
        Ok(())
    }

    async fn sync(&mut self) -> Result<()> {
        self.flush(FlushMode::Sync).await
    }

    async fn expunge(&mut self) -> Result<()> {
        self.flush(FlushMode::Expunge).await
    }

    async fn close(&mut self) -> Result<()> {
        if self.writable {
            self.flush(FlushMode::Sync).await?;
        }
        self.tether.detach();
        if let Some(locker) = &mut self.locker {
            if locker.is_locked() {
                let _ = locker.remove_lock().await;
            }
        }
        let mut guard = self.stream.lock().await;
        guard.close().await?;
        Ok(())
    }
}

/// Last access time of the backing file, used by readers that honor
/// the traditional "new mail since last read" heuristic.
pub async fn mailbox_atime(path: &Path) -> Result<std::time::SystemTime> {
    let meta = tokio::fs::metadata(path).await?;
    Ok(meta.accessed()?)
}
