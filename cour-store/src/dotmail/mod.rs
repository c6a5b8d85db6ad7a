//! The dotmail store: a single file of dot-terminated messages.
//!
//! Each message is headers, a blank line, a dot-stuffed body and a
//! terminating line holding a single `.`. Message UIDs live in `X-UID`
//! headers; the first message carries `X-IMAPbase`. The flush pipeline
//! mirrors the mbox engine with DOT coding in place of From_ quoting.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use cour_lock::{Locker, LockerHints};
use cour_stream::{
    copy, copy_nl, FdStream, FileStream, FilterMode, FilterStream, MemStream, SharedStream,
    Stream, StreamFlags, StreamRef,
};
use rand::Rng;

use crate::attribute::Attributes;
use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::guard::UninterruptibleSection;
use crate::header::Headers;
use crate::mailbox::{LockerChoice, MailboxOps, OpenOptions};
use crate::message::{BodyCodec, MessageHandle, MessageSource, OutgoingMessage, SessionTether};
use crate::observable::{MailboxEvent, Observable, ObserverAction};
use crate::uidmeta::{
    format_imapbase_value, header_value, parse_imapbase_value, uidvalidity_now, ENGINE_HEADERS,
    HDR_STATUS, HDR_X_IMAPBASE, HDR_X_UID, UID_HEADERS,
};

/// A file is plausibly dotmail when it is empty or starts with a header
/// field line. Probed after mbox, which has the stronger signature.
pub async fn looks_like_dotmail(path: &Path) -> Result<bool> {
    let meta = match tokio::fs::metadata(path).await {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    if !meta.is_file() {
        return Ok(false);
    }
    if meta.len() == 0 {
        return Ok(true);
    }
    use tokio::io::AsyncReadExt;
    let mut file = tokio::fs::File::open(path).await?;
    let mut buf = [0u8; 128];
    let n = file.read(&mut buf).await?;
    let line = &buf[..n];
    let colon = line.iter().position(|&b| b == b':');
    let newline = line.iter().position(|&b| b == b'\n').unwrap_or(n);
    Ok(matches!(colon, Some(c) if c > 0 && c < newline
        && line[..c].iter().all(|&b| b.is_ascii_graphic() && b != b':')))
}

/// Index slot for one message. `message_end` is the inclusive offset of
/// the last content byte; the `.\n` terminator occupies the two bytes
/// after it.
#[derive(Clone, Debug)]
struct DotmailRecord {
    message_start: u64,
    body_start: u64,
    message_end: u64,
    uid: u32,
    uid_modified: bool,
    attrs: Attributes,
}

impl DotmailRecord {
    fn header_len(&self) -> u64 {
        (self.body_start - 1).saturating_sub(self.message_start)
    }

    fn body_len(&self) -> u64 {
        (self.message_end + 1).saturating_sub(self.body_start)
    }

    fn terminator_end(&self) -> u64 {
        self.message_end + 3
    }

    fn dirty(&self) -> bool {
        self.uid_modified
            || self.attrs.contains(Attributes::MODIFIED)
            || self.attrs.contains(Attributes::DELETED)
    }
}

struct TrackedRef {
    orig_index: usize,
    message_start: u64,
    body_start: u64,
    message_end: u64,
}

pub struct DotmailMailbox {
    path: PathBuf,
    writable: bool,
    stream: SharedStream,
    locker: Option<Locker>,
    observable: Arc<Observable>,
    tether: Arc<SessionTether>,
    messages: Vec<DotmailRecord>,
    size: u64,
    uidvalidity: u32,
    uidnext: u32,
    uidvalidity_scanned: bool,
}

impl DotmailMailbox {
    pub async fn open(
        path: &Path,
        opts: &OpenOptions,
        observable: Arc<Observable>,
    ) -> Result<DotmailMailbox> {
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
        Ok(DotmailMailbox {
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
        })
    }

    fn dispatch(&self, event: MailboxEvent) -> Result<()> {
        match self.observable.notify(&event) {
            ObserverAction::Continue => Ok(()),
            ObserverAction::Stop => Err(Error::Interrupted),
        }
    }

    /// Allocating a UID invalidates the stored X-IMAPbase, which lives
    /// in the first message; that message is marked for rewrite.
    fn alloc_next_uid(&mut self) -> u32 {
        if self.uidnext == 0 {
            self.uidnext = 1;
        }
        let uid = self.uidnext;
        self.uidnext += 1;
        if let Some(first) = self.messages.first_mut() {
            first.uid_modified = true;
        }
        uid
    }

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
            Header,
            Body,
        }

        let mut state = State::Header;
        let mut pos = offset;
        let mut line: Vec<u8> = Vec::new();
        let mut current: Option<DotmailRecord> = None;
        let mut hdr_status: Option<String> = None;
        let mut hdr_imapbase: Option<String> = None;
        let mut hdr_uid: Option<String> = None;
        let mut force_init_uids = false;
        let mut numlines: u64 = 0;

        loop {
            line.clear();
            let n = stream.read_line(&mut line).await?;
            if n == 0 {
                break;
            }
            if current.is_none() {
                current = Some(DotmailRecord {
                    message_start: pos,
                    body_start: 0,
                    message_end: 0,
                    uid: 0,
                    uid_modified: false,
                    attrs: Attributes::empty(),
                });
                hdr_status = None;
                hdr_imapbase = None;
                hdr_uid = None;
                state = State::Header;
            }
            match state {
                State::Header => {
                    if line == b"\n" {
                        current.as_mut().unwrap().body_start = pos + 1;
                        state = State::Body;
                    } else if let Some(v) = header_value(&line, HDR_STATUS) {
                        hdr_status = Some(v.to_string());
                    } else if let Some(v) = header_value(&line, HDR_X_IMAPBASE) {
                        hdr_imapbase = Some(v.to_string());
                    } else if let Some(v) = header_value(&line, HDR_X_UID) {
                        hdr_uid = Some(v.to_string());
                    }
                }
                State::Body => {
                    if line == b".\n" {
                        let mut rec = current.take().unwrap();
                        rec.message_end = pos.saturating_sub(1);
                        if rec.body_start == 0 {
                            rec.body_start = rec.message_end + 1;
                        }
                        if let Some(status) = hdr_status.take() {
                            rec.attrs.merge_status_letters(&status);
                        }
                        if self.messages.is_empty() && !self.uidvalidity_scanned {
                            if let Some(base) = hdr_imapbase.take() {
                                if let Some((v, nx)) = parse_imapbase_value(&base) {
                                    self.uidvalidity = v;
                                    self.uidnext = nx;
                                    self.uidvalidity_scanned = true;
                                }
                            }
                        }
                        if self.uidvalidity_scanned {
                            let parsed: Option<u32> =
                                hdr_uid.take().and_then(|v| v.trim().parse().ok());
                            let prev_uid = self.messages.last().map(|m| m.uid).unwrap_or(0);
                            match parsed {
                                Some(uid)
                                    if !force_init_uids
                                        && uid < self.uidnext
                                        && uid > prev_uid =>
                                {
                                    rec.uid = uid
                                }
                                _ => force_init_uids = true,
                            }
                        }
                        self.messages.push(rec);
                        if force_init_uids {
                            let uid = self.alloc_next_uid();
                            let last = self.messages.last_mut().unwrap();
                            last.uid = uid;
                            last.uid_modified = true;
                        }
                        let count = self.messages.len();
                        if count % 100 == 0 {
                            if let Some(locker) = &mut self.locker {
                                if locker.is_locked() {
                                    let _ = locker.touch().await;
                                }
                            }
                        }
                        self.dispatch(MailboxEvent::MessageAdd { ordinal: count })?;
                    }
                }
            }
            pos += n as u64;
            numlines += 1;
            if numlines % 1000 == 0 {
                self.dispatch(MailboxEvent::Progress)?;
            }
        }

        if current.is_some() {
            tracing::error!(path = %self.path.display(),
                "message {} ended prematurely", self.messages.len() + 1);
        }
        Ok(())
    }

    async fn refresh(&mut self) -> Result<()> {
        let current = {
            let mut guard = self.stream.lock().await;
            guard.size().await?
        };
        if current == self.size {
            return Ok(());
        }
        if current < self.size {
            tracing::warn!(path = %self.path.display(),
                "mailbox shrank from {} to {} bytes; rescanning", self.size, current);
            self.dispatch(MailboxEvent::Corrupt)?;
            self.messages.clear();
            self.size = 0;
            self.uidvalidity_scanned = false;
            return self.rescan_unlocked(0).await;
        }
        let offset = match self.messages.last() {
            Some(last) => last.terminator_end(),
            None => 0,
        };
        self.rescan_unlocked(offset).await
    }

    async fn uid_setup(&mut self) -> Result<()> {
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
        for i in 0..self.messages.len() {
            let uid = self.alloc_next_uid();
            self.messages[i].uid = uid;
            self.messages[i].uid_modified = true;
        }
        Ok(())
    }

    fn record(&self, ordinal: usize) -> Result<&DotmailRecord> {
        if ordinal == 0 || ordinal > self.messages.len() {
            return Err(Error::NoEnt);
        }
        Ok(&self.messages[ordinal - 1])
    }

    async fn make_handle(&mut self, ordinal: usize) -> Result<MessageHandle> {
        self.uid_setup().await?;
        let rec = self.record(ordinal)?.clone();
        let mut raw = vec![0u8; rec.header_len() as usize];
        {
            let mut src = StreamRef::new(
                self.stream.clone(),
                rec.message_start,
                Some(rec.header_len()),
            )
            .open_stream(StreamFlags::READ)
            .await?;
            src.read_exact(&mut raw).await?;
        }
        let headers = Headers::parse(&raw);
        let envelope = Envelope::reconstruct(&headers);
        Ok(MessageHandle::new(
            ordinal,
            rec.uid,
            rec.attrs,
            envelope,
            headers,
            MessageSource {
                stream: self.stream.clone(),
                header_start: rec.message_start,
                header_len: rec.header_len(),
                body_start: rec.body_start,
                body_len: rec.body_len(),
                codec: BodyCodec::Dot,
            },
            self.tether.clone(),
        ))
    }

    async fn append_unlocked(&mut self, msg: &OutgoingMessage) -> Result<()> {
        let start = {
            let mut guard = self.stream.lock().await;
            guard.size().await?
        };
        let result = self.append_body(msg, start).await;
        if let Err(e) = result {
            let mut guard = self.stream.lock().await;
            if let Err(te) = guard.truncate(start).await {
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
        let headers = msg.headers();
        let first_message = self.messages.is_empty();
        // The UID is allocated first so the X-IMAPbase written alongside
        // carries the post-allocation uidnext; the on-disk counters are
        // consistent the moment the append lands.
        let uid_headers = if self.uidvalidity_scanned {
            let uid = self.alloc_next_uid();
            let mut out = String::new();
            if first_message {
                out.push_str(&format!(
                    "{}: {}\n",
                    HDR_X_IMAPBASE,
                    format_imapbase_value(self.uidvalidity, self.uidnext)
                ));
            }
            out.push_str(&format!("{}: {}\n", HDR_X_UID, uid));
            out
        } else {
            String::new()
        };

        let mut guard = self.stream.lock().await;
        guard.seek(SeekFrom::Start(start)).await?;
        guard
            .write_all(&headers.to_bytes_excluding(&UID_HEADERS))
            .await?;
        guard.write_all(uid_headers.as_bytes()).await?;
        guard.write_all(b"\n").await?;

        let mut body_src = Stream::new(
            Box::new(MemStream::from(msg.body().to_vec())),
            StreamFlags::READ | StreamFlags::SEEK,
        );
        body_src.open().await?;
        let mut encoded =
            FilterStream::create(body_src, "DOT", FilterMode::Encode, StreamFlags::READ).await?;
        copy_nl(&mut guard, &mut encoded, None).await?;
        guard.write_all(b".\n").await?;
        guard.flush().await?;
        Ok(())
    }

    async fn flush(&mut self, expunge: bool) -> Result<()> {
        if let Some(locker) = &mut self.locker {
            locker.lock().await?;
        }
        let guard = UninterruptibleSection::enter();
        let result = self.flush_unlocked(expunge).await;
        drop(guard);
        if let Some(locker) = &mut self.locker {
            let _ = locker.unlock().await;
        }
        result
    }

    async fn flush_unlocked(&mut self, expunge: bool) -> Result<()> {
        tracing::trace!(path = %self.path.display(), expunge, "dotmail flush");
        if self.messages.is_empty() {
            return Ok(());
        }
        self.refresh().await?;

        let dirty = self
            .messages
            .iter()
            .position(|m| m.dirty())
            .unwrap_or(self.messages.len());
        if dirty == self.messages.len() {
            return Ok(());
        }

        let (temp_path, mut temp) = self.create_temp_file().await?;
        let mut tracker: Vec<TrackedRef> = Vec::new();
        let mut result = self.flush_temp(dirty, &mut temp, expunge, &mut tracker).await;
        if result.is_ok() {
            result = temp.close().await.map_err(Into::into);
        }
        if result.is_ok() {
            result = self.swap_files(&temp_path, tracker).await;
        }
        let _ = tokio::fs::remove_file(&temp_path).await;
        result
    }

    async fn create_temp_file(&self) -> Result<(PathBuf, Stream)> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let base = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "dotmail".to_string());
        loop {
            let name = format!(".{}.{:08x}.tmp", base, rand::thread_rng().gen::<u32>());
            let path = dir.join(name);
            match std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(file) => {
                    let mut stream = Stream::new(
                        Box::new(FdStream::new(file)),
                        StreamFlags::RDWR | StreamFlags::SEEK,
                    )
                    .buffered(cour_stream::BufferMode::Full, 0);
                    stream.open().await?;
                    return Ok((path, stream));
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn flush_temp(
        &mut self,
        dirty: usize,
        temp: &mut Stream,
        expunge: bool,
        tracker: &mut Vec<TrackedRef>,
    ) -> Result<()> {
        let count = self.messages.len();
        let mut save_imapbase = 0usize;
        let mut expunged = 0usize;
        let mut start = 0usize;
        let mut i = dirty;

        while i < count {
            if expunge && self.messages[i].attrs.contains(Attributes::DELETED) {
                self.copy_unchanged(start, i, temp, tracker).await?;
                self.observable.notify(&MailboxEvent::MessageExpunge {
                    ordinal: i + 1,
                    expunged,
                });
                expunged += 1;
                if i == save_imapbase {
                    save_imapbase = i + 1;
                    if save_imapbase < count {
                        self.messages[save_imapbase]
                            .attrs
                            .insert(Attributes::MODIFIED);
                    }
                }
                i += 1;
                start = i;
                continue;
            }
            if self.messages[i].dirty() {
                self.copy_unchanged(start, i, temp, tracker).await?;
                let with_imapbase = i == save_imapbase;
                self.reconstruct(i, temp, with_imapbase, tracker).await?;
                i += 1;
                start = i;
                continue;
            }
            i += 1;
        }
        self.copy_unchanged(start, count, temp, tracker).await?;

        match tracker.last() {
            Some(last) => temp.truncate(last.message_end + 3).await?,
            None => temp.truncate(0).await?,
        }
        temp.flush().await?;
        Ok(())
    }

    async fn copy_unchanged(
        &mut self,
        from: usize,
        to: usize,
        temp: &mut Stream,
        tracker: &mut Vec<TrackedRef>,
    ) -> Result<()> {
        if to <= from {
            return Ok(());
        }
        let start = self.messages[from].message_start;
        let stop = if to == self.messages.len() {
            self.messages[to - 1].terminator_end()
        } else {
            self.messages[to].message_start
        };
        let dest = temp.position().await?;
        let delta = dest as i64 - start as i64;
        for (index, rec) in self.messages[from..to].iter().enumerate() {
            tracker.push(TrackedRef {
                orig_index: from + index,
                message_start: (rec.message_start as i64 + delta) as u64,
                body_start: (rec.body_start as i64 + delta) as u64,
                message_end: (rec.message_end as i64 + delta) as u64,
            });
        }
        let mut src = StreamRef::new(self.stream.clone(), start, Some(stop - start))
            .open_stream(StreamFlags::READ)
            .await?;
        copy(temp, &mut src, None).await?;
        Ok(())
    }

    async fn reconstruct(
        &mut self,
        i: usize,
        temp: &mut Stream,
        with_imapbase: bool,
        tracker: &mut Vec<TrackedRef>,
    ) -> Result<()> {
        let rec = self.messages[i].clone();
        let message_start = temp.position().await?;

        let mut raw = vec![0u8; rec.header_len() as usize];
        {
            let mut src = StreamRef::new(
                self.stream.clone(),
                rec.message_start,
                Some(rec.header_len()),
            )
            .open_stream(StreamFlags::READ)
            .await?;
            src.read_exact(&mut raw).await?;
        }
        let headers = Headers::parse(&raw);
        temp.write_all(&headers.to_bytes_excluding(&ENGINE_HEADERS))
            .await?;

        if self.uidvalidity_scanned {
            if with_imapbase {
                temp.write_all(
                    format!(
                        "{}: {}\n",
                        HDR_X_IMAPBASE,
                        format_imapbase_value(self.uidvalidity, self.uidnext)
                    )
                    .as_bytes(),
                )
                .await?;
            }
            temp.write_all(format!("{}: {}\n", HDR_X_UID, rec.uid).as_bytes())
                .await?;
        }
        let status = rec.attrs.persistent().to_status_letters();
        if !status.is_empty() {
            temp.write_all(format!("{}: {}\n", HDR_STATUS, status).as_bytes())
                .await?;
        }
        temp.write_all(b"\n").await?;

        let body_start = temp.position().await?;
        if rec.body_len() > 0 {
            let mut src = StreamRef::new(self.stream.clone(), rec.body_start, Some(rec.body_len()))
                .open_stream(StreamFlags::READ)
                .await?;
            copy_nl(temp, &mut src, None).await?;
        }
        let message_end = temp.position().await?.saturating_sub(1);
        temp.write_all(b".\n").await?;

        tracker.push(TrackedRef {
            orig_index: i,
            message_start,
            body_start,
            message_end,
        });
        Ok(())
    }

    async fn swap_files(&mut self, temp_path: &Path, tracker: Vec<TrackedRef>) -> Result<()> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let base = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "dotmail".to_string());
        let backup = dir.join(format!(
            ".{}.{:08x}.bak",
            base,
            rand::thread_rng().gen::<u32>()
        ));

        if let Err(e) = tokio::fs::rename(&self.path, &backup).await {
            tracing::error!(path = %self.path.display(), error = %e,
                "cannot move mailbox aside for rewrite");
            return Err(e.into());
        }
        match tokio::fs::rename(temp_path, &self.path).await {
            Ok(()) => {
                self.tracker_sync(tracker);
                let mut flags = StreamFlags::READ;
                if self.writable {
                    flags = flags | StreamFlags::WRITE;
                }
                let fresh = FileStream::create(&self.path, flags).await?;
                self.stream = fresh.into_shared();
                let _ = tokio::fs::remove_file(&backup).await;
                Ok(())
            }
            Err(e) => {
                tracing::error!(temp = %temp_path.display(), path = %self.path.display(),
                    error = %e, "cannot move rewritten mailbox into place");
                if let Err(restore) = tokio::fs::rename(&backup, &self.path).await {
                    tracing::error!(error = %restore,
                        "failed to restore {} from backup; backup left in {}",
                        self.path.display(), backup.display());
                }
                Err(e.into())
            }
        }
    }

    fn tracker_sync(&mut self, tracker: Vec<TrackedRef>) {
        if tracker.is_empty() {
            self.messages.clear();
            self.size = 0;
            self.uidvalidity_scanned = false;
            return;
        }
        let mut kept = Vec::with_capacity(tracker.len());
        for r in &tracker {
            let mut rec = self.messages[r.orig_index].clone();
            rec.message_start = r.message_start;
            rec.body_start = r.body_start;
            rec.message_end = r.message_end;
            rec.uid_modified = false;
            rec.attrs.remove(Attributes::MODIFIED);
            kept.push(rec);
        }
        self.size = kept.last().map(|m| m.terminator_end()).unwrap_or(0);
        self.messages = kept;
    }
}

#[async_trait]
impl MailboxOps for DotmailMailbox {
    async fn scan(&mut self, from: usize) -> Result<usize> {
        if from == 0 || (!self.messages.is_empty() && from > self.messages.len()) {
            return Err(Error::NoEnt);
        }
        let current = {
            let mut guard = self.stream.lock().await;
            guard.size().await?
        };
        if current != self.size {
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
            if let Some(first) = self.messages.first_mut() {
                first.uid_modified = true;
            }
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
        if ordinal == 0 || ordinal > self.messages.len() {
            return Err(Error::NoEnt);
        }
        let rec = &mut self.messages[ordinal - 1];
        rec.attrs.insert(attrs);
        rec.attrs.insert(Attributes::MODIFIED);
        Ok(())
    }

    async fn del_attributes(&mut self, ordinal: usize, attrs: Attributes) -> Result<()> {
        if !self.writable {
            return Err(Error::ReadOnly);
        }
        if ordinal == 0 || ordinal > self.messages.len() {
            return Err(Error::NoEnt);
        }
        let rec = &mut self.messages[ordinal - 1];
        rec.attrs.remove(attrs);
        rec.attrs.insert(Attributes::MODIFIED);
        Ok(())
    }

    async fn set_attributes(&mut self, ordinal: usize, attrs: Attributes) -> Result<()> {
        if !self.writable {
            return Err(Error::ReadOnly);
        }
        if ordinal == 0 || ordinal > self.messages.len() {
            return Err(Error::NoEnt);
        }
        self.messages[ordinal - 1].attrs = attrs.union(Attributes::MODIFIED);
        Ok(())
    }

    async fn sync(&mut self) -> Result<()> {
        self.flush(false).await
    }

    async fn expunge(&mut self) -> Result<()> {
        self.flush(true).await
    }

    async fn close(&mut self) -> Result<()> {
        if self.writable {
            self.flush(false).await?;
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
