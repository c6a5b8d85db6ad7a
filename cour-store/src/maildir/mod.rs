//! The maildir store: one message per file under `tmp/`, `new/` and
//! `cur/`, with flags and UIDs encoded in file names.
//!
//! State changes are single `rename(2)` calls, so no filesystem lock is
//! needed; delivery stages into `tmp/` and hard-links into place.

mod name;

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use cour_stream::{FileStream, SharedStream, StreamFlags};

use crate::attribute::Attributes;
use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::header::Headers;
use crate::mailbox::{MailboxOps, OpenOptions};
use crate::message::{BodyCodec, MessageHandle, MessageSource, OutgoingMessage, SessionTether};
use crate::observable::{MailboxEvent, Observable, ObserverAction};
use crate::property::{needs_attribute_fixup, PropertyFile, PROP_FILE_NAME, PROP_VERSION};
use crate::uidmeta::{uidvalidity_now, ENGINE_HEADERS};

use name::{delivery_cmp, format_name, generate_unique, parse_name};

const DELIVERY_RETRIES: u32 = 30;
const DELIVERY_RETRY_SLEEP: std::time::Duration = std::time::Duration::from_secs(2);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Subdir {
    Cur,
    New,
    Tmp,
}

impl Subdir {
    fn name(self) -> &'static str {
        match self {
            Subdir::Cur => "cur",
            Subdir::New => "new",
            Subdir::Tmp => "tmp",
        }
    }
}

/// Names that never denote messages inside a maildir.
pub fn reserved_name(name: &str) -> bool {
    name == "cur" || name == "new" || name == "tmp" || name.starts_with(".mh") || name.starts_with(".mu")
}

#[derive(Clone, Debug)]
struct MaildirRecord {
    subdir: Subdir,
    file_name: String,
    uniq_len: usize,
    uid: u32,
    attrs: Attributes,
}

impl MaildirRecord {
    fn uniq(&self) -> &str {
        &self.file_name[..self.uniq_len]
    }
}

pub struct MaildirMailbox {
    path: PathBuf,
    writable: bool,
    observable: Arc<Observable>,
    tether: Arc<SessionTether>,
    messages: Vec<MaildirRecord>,
    prop: PropertyFile,
    uidvalidity: u32,
    next_uid: u32,
    scanned: bool,
    /// (new/, cur/) mtimes at last scan; drives rescan-on-change.
    stamps: (Option<SystemTime>, Option<SystemTime>),
    delivery_seq: usize,
}

impl MaildirMailbox {
    pub async fn open(
        path: &Path,
        opts: &OpenOptions,
        observable: Arc<Observable>,
    ) -> Result<MaildirMailbox> {
        let writable = opts.write || opts.create;
        if opts.create {
            for sub in ["tmp", "new", "cur"] {
                tokio::fs::create_dir_all(path.join(sub)).await?;
            }
        } else {
            tokio::fs::metadata(path).await?;
        }
        let prop = PropertyFile::load(path.join(PROP_FILE_NAME)).await?;
        let uidvalidity = prop
            .get("uid-validity")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        Ok(MaildirMailbox {
            path: path.to_path_buf(),
            writable,
            observable,
            tether: SessionTether::new(),
            messages: Vec::new(),
            prop,
            uidvalidity,
            next_uid: 1,
            scanned: false,
            stamps: (None, None),
            delivery_seq: 0,
        })
    }

    fn subdir_path(&self, subdir: Subdir) -> PathBuf {
        self.path.join(subdir.name())
    }

    fn message_path(&self, rec: &MaildirRecord) -> PathBuf {
        self.subdir_path(rec.subdir).join(&rec.file_name)
    }

    fn dispatch(&self, event: MailboxEvent) -> Result<()> {
        match self.observable.notify(&event) {
            ObserverAction::Continue => Ok(()),
            ObserverAction::Stop => Err(Error::Interrupted),
        }
    }

    async fn read_stamps(&self) -> (Option<SystemTime>, Option<SystemTime>) {
        let stamp = |p: PathBuf| async move {
            tokio::fs::metadata(p).await.and_then(|m| m.modified()).ok()
        };
        (
            stamp(self.subdir_path(Subdir::New)).await,
            stamp(self.subdir_path(Subdir::Cur)).await,
        )
    }

    /// Stale deliveries die on writable open.
    async fn tmp_flush(&self) -> Result<()> {
        if !self.writable {
            return Ok(());
        }
        let tmp = self.subdir_path(Subdir::Tmp);
        let mut dir = match tokio::fs::read_dir(&tmp).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            if name.to_string_lossy().starts_with('.') {
                continue;
            }
            let _ = tokio::fs::remove_file(entry.path()).await;
        }
        Ok(())
    }

    async fn scan_subdir(
        &self,
        subdir: Subdir,
        legacy: bool,
        out: &mut Vec<MaildirRecord>,
    ) -> Result<()> {
        let dir_path = self.subdir_path(subdir);
        if !dir_path.is_dir() && !self.writable {
            return Ok(());
        }
        if !dir_path.is_dir() {
            tokio::fs::create_dir_all(&dir_path).await?;
        }
        let mut dir = tokio::fs::read_dir(&dir_path).await?;
        while let Some(entry) = dir.next_entry().await? {
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if file_name.starts_with('.') {
                continue;
            }
            let meta = match entry.metadata().await {
                Ok(m) => m,
                Err(_) => continue,
            };
            if !meta.is_file() {
                continue;
            }
            let parsed = parse_name(&file_name, legacy);
            let mut attrs = parsed.flags;
            if subdir == Subdir::New {
                attrs.insert(Attributes::RECENT);
            }
            out.push(MaildirRecord {
                subdir,
                file_name,
                uniq_len: parsed.uniq_len,
                uid: parsed.uid.unwrap_or(0),
                attrs,
            });
        }
        Ok(())
    }

    async fn scan_unlocked(&mut self, notify: bool) -> Result<()> {
        let legacy = needs_attribute_fixup(&self.prop);

        self.tmp_flush().await?;

        let mut records = Vec::new();
        self.scan_subdir(Subdir::Cur, legacy, &mut records).await?;
        self.scan_subdir(Subdir::New, legacy, &mut records).await?;
        records.sort_by(|a, b| delivery_cmp(&a.file_name, &b.file_name));

        // UID fixup: uids must be strictly increasing in delivery
        // order. One bad entry renumbers the lot and bumps uidvalidity.
        // new/ entries keep their plain names; their uids live in
        // memory until a rename records them.
        let mut bad_uids = false;
        let mut next = 1u32;
        for rec in records.iter_mut() {
            match rec.subdir {
                Subdir::Cur if rec.uid == 0 || rec.uid < next => {
                    bad_uids = true;
                    break;
                }
                Subdir::Cur => next = rec.uid + 1,
                _ => {
                    rec.uid = next;
                    next += 1;
                }
            }
        }
        let mut renames = Vec::new();
        if bad_uids {
            next = 1;
            for (i, rec) in records.iter_mut().enumerate() {
                rec.uid = next;
                next += 1;
                if rec.subdir == Subdir::Cur {
                    renames.push(i);
                }
            }
        }
        self.next_uid = next;

        if bad_uids {
            self.uidvalidity = uidvalidity_now();
            tracing::debug!(path = %self.path.display(),
                "maildir uids renumbered; uidvalidity reset to {}", self.uidvalidity);
        }
        if self.uidvalidity == 0 {
            self.uidvalidity = uidvalidity_now();
        }

        // Legacy stores get their letters rewritten in the standard
        // alphabet while we are at it.
        if legacy {
            for (i, rec) in records.iter().enumerate() {
                if rec.subdir == Subdir::Cur && !renames.contains(&i) {
                    renames.push(i);
                }
            }
            renames.sort_unstable();
        }

        self.messages = records;
        if self.writable {
            for i in renames {
                self.rename_record(i).await?;
            }
            self.prop.set("version", PROP_VERSION);
            self.prop
                .set("uid-validity", &self.uidvalidity.to_string());
            self.prop.save().await?;
        }

        self.stamps = self.read_stamps().await;
        self.scanned = true;

        if notify {
            for i in 1..=self.messages.len() {
                self.dispatch(MailboxEvent::MessageAdd { ordinal: i })?;
                if i % 50 == 0 {
                    self.dispatch(MailboxEvent::Progress)?;
                }
            }
        }
        Ok(())
    }

    /// Rename a message file to encode its current flags and uid.
    /// Renaming moves new/ entries into cur/; a missing source means
    /// someone expunged behind our back.
    async fn rename_record(&mut self, index: usize) -> Result<()> {
        let rec = self.messages[index].clone();
        let old_path = self.message_path(&rec);
        let new_name = format_name(rec.uniq(), rec.attrs.persistent(), rec.uid);
        let new_path = self.subdir_path(Subdir::Cur).join(&new_name);
        if old_path == new_path {
            return Ok(());
        }
        match tokio::fs::rename(&old_path, &new_path).await {
            Ok(()) => {
                let rec = &mut self.messages[index];
                rec.subdir = Subdir::Cur;
                let parsed = parse_name(&new_name, false);
                rec.uniq_len = parsed.uniq_len;
                rec.file_name = new_name;
                rec.attrs.remove(Attributes::MODIFIED);
                rec.attrs.remove(Attributes::RECENT);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.dispatch(MailboxEvent::Corrupt)?;
                Err(Error::NoEnt)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn refresh(&mut self) -> Result<()> {
        if !self.scanned {
            return self.scan_unlocked(false).await;
        }
        let stamps = self.read_stamps().await;
        if stamps != self.stamps {
            self.scan_unlocked(false).await?;
        }
        Ok(())
    }

    fn record(&self, ordinal: usize) -> Result<&MaildirRecord> {
        if ordinal == 0 || ordinal > self.messages.len() {
            return Err(Error::NoEnt);
        }
        Ok(&self.messages[ordinal - 1])
    }

    async fn make_handle(&mut self, ordinal: usize) -> Result<MessageHandle> {
        let rec = self.record(ordinal)?.clone();
        let path = self.message_path(&rec);
        let stream: SharedStream = FileStream::create(&path, StreamFlags::READ)
            .await?
            .into_shared();
        let (headers, header_len, body_start, body_len) = {
            let mut guard = stream.lock().await;
            let size = guard.size().await?;
            guard.seek(SeekFrom::Start(0)).await?;
            let mut raw = Vec::new();
            let mut line = Vec::new();
            let mut offset = 0u64;
            loop {
                line.clear();
                let n = guard.read_line(&mut line).await?;
                if n == 0 || line == b"\n" {
                    offset += n as u64;
                    break;
                }
                raw.extend_from_slice(&line);
                offset += n as u64;
            }
            let header_len = raw.len() as u64;
            (
                Headers::parse(&raw),
                header_len,
                offset,
                size.saturating_sub(offset),
            )
        };
        let envelope = Envelope::reconstruct(&headers);
        Ok(MessageHandle::new(
            ordinal,
            rec.uid,
            rec.attrs,
            envelope,
            headers,
            MessageSource {
                stream,
                header_start: 0,
                header_len,
                body_start,
                body_len,
                codec: BodyCodec::None,
            },
            self.tether.clone(),
        ))
    }

    /// Deliver a message: write under tmp/ with an exclusive create,
    /// hard-link into new/ (or cur/ when it arrives already read), then
    /// drop the tmp link.
    async fn deliver(&mut self, msg: &OutgoingMessage) -> Result<()> {
        let tmp_dir = self.subdir_path(Subdir::Tmp);
        let mut unique = None;
        for attempt in 0..DELIVERY_RETRIES {
            let candidate = generate_unique(&tmp_dir, self.delivery_seq + self.messages.len());
            match tokio::fs::metadata(tmp_dir.join(&candidate)).await {
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    unique = Some(candidate);
                    break;
                }
                Err(e) => return Err(e.into()),
                Ok(_) => {
                    tracing::warn!(name = %candidate,
                        "tmp file exists during delivery (attempt {})", attempt + 1);
                    tokio::time::sleep(DELIVERY_RETRY_SLEEP).await;
                }
            }
        }
        let unique = unique.ok_or(Error::Exists)?;
        self.delivery_seq += 1;

        let tmp_path = tmp_dir.join(&unique);
        {
            use std::io::Write;
            let mut file = std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&tmp_path)?;
            let headers = msg.headers();
            file.write_all(&headers.to_bytes_excluding(&ENGINE_HEADERS))?;
            file.write_all(b"\n")?;
            file.write_all(msg.body())?;
            file.sync_data()?;
        }

        let uid = self.next_uid;
        self.next_uid += 1;

        let mut attrs = msg.attrs;
        let (subdir, dest_name) = if attrs.contains(Attributes::READ) {
            (
                Subdir::Cur,
                format_name(&unique, attrs.persistent(), uid),
            )
        } else {
            attrs.insert(Attributes::RECENT);
            (Subdir::New, unique.clone())
        };
        let dest_path = self.subdir_path(subdir).join(&dest_name);

        if let Err(e) = std::fs::hard_link(&tmp_path, &dest_path) {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }
        let _ = tokio::fs::remove_file(&tmp_path).await;

        let parsed = parse_name(&dest_name, false);
        self.messages.push(MaildirRecord {
            subdir,
            file_name: dest_name,
            uniq_len: parsed.uniq_len,
            uid,
            attrs,
        });
        self.stamps = self.read_stamps().await;
        self.dispatch(MailboxEvent::MessageAdd {
            ordinal: self.messages.len(),
        })?;
        Ok(())
    }

    async fn flush(&mut self, expunge: bool) -> Result<()> {
        self.refresh().await?;
        let mut expunged = 0usize;
        let mut i = 0usize;
        while i < self.messages.len() {
            if expunge && self.messages[i].attrs.contains(Attributes::DELETED) {
                let path = self.message_path(&self.messages[i]);
                let _ = tokio::fs::remove_file(&path).await;
                self.observable.notify(&MailboxEvent::MessageExpunge {
                    ordinal: i + 1 + expunged,
                    expunged,
                });
                expunged += 1;
                self.messages.remove(i);
                continue;
            }
            if self.messages[i].attrs.contains(Attributes::MODIFIED) {
                self.rename_record(i).await?;
            }
            i += 1;
        }
        if self.writable {
            self.prop.set("version", PROP_VERSION);
            self.prop
                .set("uid-validity", &self.uidvalidity.to_string());
            self.prop.save().await?;
        }
        self.stamps = self.read_stamps().await;
        Ok(())
    }

    async fn subdir_size(&self, subdir: Subdir) -> Result<u64> {
        let mut total = 0u64;
        let mut dir = match tokio::fs::read_dir(self.subdir_path(subdir)).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = dir.next_entry().await? {
            if entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            if let Ok(meta) = entry.metadata().await {
                if meta.is_file() {
                    total += meta.len();
                }
            }
        }
        Ok(total)
    }
}

#[async_trait]
impl MailboxOps for MaildirMailbox {
    async fn scan(&mut self, from: usize) -> Result<usize> {
        if from == 0 {
            return Err(Error::NoEnt);
        }
        self.scan_unlocked(true).await?;
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
            .filter(|m| m.attrs.contains(Attributes::RECENT))
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
        Ok(self.subdir_size(Subdir::New).await? + self.subdir_size(Subdir::Cur).await?)
    }

    async fn uidvalidity(&mut self) -> Result<u32> {
        self.refresh().await?;
        Ok(self.uidvalidity)
    }

    async fn set_uidvalidity(&mut self, value: u32) -> Result<()> {
        self.refresh().await?;
        if self.uidvalidity != value {
            self.uidvalidity = value;
            if self.writable {
                self.prop.set("uid-validity", &value.to_string());
                self.prop.save().await?;
            }
        }
        Ok(())
    }

    async fn uidnext(&mut self) -> Result<u32> {
        self.refresh().await?;
        Ok(self.next_uid)
    }

    async fn message_uid(&mut self, ordinal: usize) -> Result<u32> {
        self.refresh().await?;
        Ok(self.record(ordinal)?.uid)
    }

    async fn get_message(&mut self, ordinal: usize) -> Result<MessageHandle> {
        self.refresh().await?;
        self.make_handle(ordinal).await
    }

    async fn quick_get_message(&mut self, qid: &str) -> Result<MessageHandle> {
        let (subdir, file_name) = match qid.split_once('/') {
            Some(("cur", name)) => (Subdir::Cur, name),
            Some(("new", name)) => (Subdir::New, name),
            _ => return Err(Error::Parse(format!("bad message token: {}", qid))),
        };
        tokio::fs::metadata(self.subdir_path(subdir).join(file_name)).await?;
        let legacy = needs_attribute_fixup(&self.prop);
        let parsed = parse_name(file_name, legacy);
        let mut attrs = parsed.flags;
        if subdir == Subdir::New {
            attrs.insert(Attributes::RECENT);
        }
        self.messages.push(MaildirRecord {
            subdir,
            file_name: file_name.to_string(),
            uniq_len: parsed.uniq_len,
            uid: parsed.uid.unwrap_or(0),
            attrs,
        });
        let ordinal = self.messages.len();
        self.make_handle(ordinal).await
    }

    async fn append(&mut self, msg: &OutgoingMessage) -> Result<()> {
        if !self.writable {
            return Err(Error::ReadOnly);
        }
        self.refresh().await?;
        self.deliver(msg).await
    }

    async fn get_attributes(&mut self, ordinal: usize) -> Result<Attributes> {
        self.refresh().await?;
        Ok(self.record(ordinal)?.attrs)
    }

    async fn add_attributes(&mut self, ordinal: usize, attrs: Attributes) -> Result<()> {
        if !self.writable {
            return Err(Error::ReadOnly);
        }
        self.refresh().await?;
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
        self.refresh().await?;
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
        self.refresh().await?;
        if ordinal == 0 || ordinal > self.messages.len() {
            return Err(Error::NoEnt);
        }
        self.messages[ordinal - 1].attrs = attrs.union(Attributes::MODIFIED);
        Ok(())
    }

    async fn sync(&mut self) -> Result<()> {
        if !self.writable {
            return Ok(());
        }
        self.flush(false).await
    }

    async fn expunge(&mut self) -> Result<()> {
        if !self.writable {
            return Err(Error::ReadOnly);
        }
        self.flush(true).await
    }

    async fn close(&mut self) -> Result<()> {
        if self.writable {
            self.flush(false).await?;
        }
        self.tether.detach();
        Ok(())
    }
}
