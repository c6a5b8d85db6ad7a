use std::io::SeekFrom;
use std::path::PathBuf;

use cour_stream::{copy, FdStream, FileStream, Stream, StreamFlags, StreamRef};
use rand::Rng;

use crate::attribute::Attributes;
use crate::error::Result;
use crate::guard::UninterruptibleSection;
use crate::header::Headers;
use crate::observable::MailboxEvent;
use crate::uidmeta::{
    format_imapbase_header, format_imapbase_value, ENGINE_HEADERS, HDR_STATUS, HDR_X_IMAPBASE,
    HDR_X_UID,
};

use super::MboxMailbox;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum FlushMode {
    /// Persist changes, keeping deleted messages.
    Sync,
    /// Persist changes, dropping deleted messages.
    Expunge,
    /// Persist only the uidvalidity/uidnext counters.
    Uidvalidity,
}

/// New offsets of one kept message, recorded while the temp copy is
/// written and applied to the index after the rename succeeds.
struct TrackedRef {
    orig_index: usize,
    message_start: u64,
    from_length: u64,
    body_start: u64,
    message_end: u64,
}

impl MboxMailbox {
    pub(crate) async fn flush(&mut self, mode: FlushMode) -> Result<()> {
        if let Some(locker) = &mut self.locker {
            locker.lock().await?;
        }
        // No observer fires and no signal interrupts between here and
        // the completed rename pair.
        let guard = UninterruptibleSection::enter();
        let result = self.flush_unlocked(mode).await;
        drop(guard);
        if let Some(locker) = &mut self.locker {
            let _ = locker.unlock().await;
        }
        result
    }

    async fn flush_unlocked(&mut self, mode: FlushMode) -> Result<()> {
        tracing::trace!(path = %self.path.display(), ?mode, "mbox flush");
        if self.messages.is_empty() {
            return Ok(());
        }
        if mode == FlushMode::Uidvalidity && !self.uidvalidity_changed {
            return Ok(());
        }
        self.refresh().await?;

        if self.uidvalidity_changed {
            let formatted = format_imapbase_header(self.uidvalidity, self.uidnext);
            if self.x_imapbase_len > 0 && self.x_imapbase_len >= formatted.len() {
                // The reserved width suffices: patch the header line in
                // place and leave every other byte alone.
                let mut guard = self.stream.lock().await;
                guard.seek(SeekFrom::Start(self.x_imapbase_off)).await?;
                guard
                    .write_all(
                        format!("{:<width$}", formatted, width = self.x_imapbase_len).as_bytes(),
                    )
                    .await?;
                guard.flush().await?;
            } else {
                // No header yet, or too narrow: rewrite from the first
                // message on.
                self.messages[0].uid_modified = true;
                if mode == FlushMode::Uidvalidity {
                    for rec in self.messages.iter_mut().skip(1) {
                        rec.attrs.remove(Attributes::MODIFIED);
                        rec.attrs.remove(Attributes::DELETED);
                    }
                }
            }
        }

        let dirty = self
            .messages
            .iter()
            .position(|m| m.dirty())
            .unwrap_or(self.messages.len());

        let mut result = Ok(());
        if dirty < self.messages.len() {
            let (temp_path, mut temp) = self.create_temp_file().await?;
            let mut tracker: Vec<TrackedRef> = Vec::new();

            result = self
                .flush_temp(dirty, &mut temp, mode == FlushMode::Expunge, &mut tracker)
                .await;
            if result.is_ok() {
                result = temp.close().await.map_err(Into::into);
            }
            if result.is_ok() {
                result = self.swap_files(&temp_path, tracker).await;
            }
            let _ = tokio::fs::remove_file(&temp_path).await;
        }

        self.uidvalidity_changed = false;
        result
    }

    async fn create_temp_file(&self) -> Result<(PathBuf, Stream)> {
        let dir = self.path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let base = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "mbox".to_string());
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

    /// Write the post-flush image of the mailbox to `temp`, starting
    /// from the first dirty message. Everything before it is copied
    /// byte for byte.
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
                // Keep uidvalidity/uidnext even when their carrier goes.
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
                let imapbase = if i == save_imapbase {
                    Some(format_imapbase_value(self.uidvalidity, self.uidnext))
                } else {
                    None
                };
                self.reconstruct(i, temp, imapbase.as_deref(), tracker)
                    .await?;
                i += 1;
                start = i;
                continue;
            }

            i += 1;
        }
        self.copy_unchanged(start, count, temp, tracker).await?;

        match tracker.last() {
            Some(last) => temp.truncate(last.message_end + 1).await?,
            None => temp.truncate(0).await?,
        }
        temp.flush().await?;
        Ok(())
    }

    /// Copy messages `[from, to)` unchanged, exact byte preservation,
    /// recording their shifted offsets.
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
            self.messages[to - 1].message_end + 1
        } else {
            self.messages[to].message_start
        };
        let dest = temp.position().await?;
        let delta = dest as i64 - start as i64;

        for (index, rec) in self.messages[from..to].iter().enumerate() {
            tracker.push(TrackedRef {
                orig_index: from + index,
                message_start: (rec.message_start as i64 + delta) as u64,
                from_length: rec.from_length,
                body_start: (rec.body_start as i64 + delta) as u64,
                message_end: (rec.message_end as i64 + delta) as u64,
            });
        }
        if self.x_imapbase_len > 0
            && self.x_imapbase_off >= start
            && self.x_imapbase_off < stop
        {
            self.x_imapbase_off = (self.x_imapbase_off as i64 + delta) as u64;
        }

        let mut src = StreamRef::new(self.stream.clone(), start, Some(stop - start))
            .open_stream(StreamFlags::READ)
            .await?;
        copy(temp, &mut src, None).await?;
        Ok(())
    }

    /// Write a fresh copy of message `i`: envelope line, headers with
    /// the engine-owned ones re-synthesized, and the raw body. A blank
    /// separator follows; a trailing one is cut by the final truncate.
    async fn reconstruct(
        &mut self,
        i: usize,
        temp: &mut Stream,
        imapbase: Option<&str>,
        tracker: &mut Vec<TrackedRef>,
    ) -> Result<()> {
        let rec = self.messages[i].clone();
        let message_start = temp.position().await?;

        let from_line = format!("From {} {}\n", rec.env_sender, rec.env_date);
        temp.write_all(from_line.as_bytes()).await?;

        let mut raw = vec![0u8; rec.header_len() as usize];
        {
            let mut src = StreamRef::new(
                self.stream.clone(),
                rec.header_start(),
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
            if let Some(value) = imapbase {
                let line = format!("{}: {}", HDR_X_IMAPBASE, value);
                self.x_imapbase_off = temp.position().await?;
                self.x_imapbase_len = line.len();
                temp.write_all(line.as_bytes()).await?;
                temp.write_all(b"\n").await?;
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
            cour_stream::copy_nl(temp, &mut src, None).await?;
        }
        let message_end = temp.position().await?.saturating_sub(1);
        temp.write_all(b"\n").await?;

        tracker.push(TrackedRef {
            orig_index: i,
            message_start,
            from_length: from_line.len() as u64,
            body_start,
            message_end,
        });
        Ok(())
    }

    /// The rename pair: original aside to a backup, temp into place.
    /// Any failure before the second rename leaves the mailbox
    /// untouched; a failure after it restores from the backup.
    async fn swap_files(&mut self, temp_path: &PathBuf, tracker: Vec<TrackedRef>) -> Result<()> {
        let dir = self.path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let base = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "mbox".to_string());
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
                if self.writable() {
                    flags = flags | StreamFlags::WRITE;
                }
                let fresh = FileStream::create(&self.path, flags).await?;
                self.replace_stream(fresh.into_shared());
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

    /// Apply the tracked offsets: drop expunged records, renumber the
    /// survivors in order, clear the per-message dirt.
    fn tracker_sync(&mut self, tracker: Vec<TrackedRef>) {
        if tracker.is_empty() {
            self.messages.clear();
            self.size = 0;
            self.uidvalidity_scanned = false;
            self.x_imapbase_off = 0;
            self.x_imapbase_len = 0;
            return;
        }
        let mut kept = Vec::with_capacity(tracker.len());
        for r in &tracker {
            let mut rec = self.messages[r.orig_index].clone();
            rec.message_start = r.message_start;
            rec.from_length = r.from_length;
            rec.body_start = r.body_start;
            rec.message_end = r.message_end;
            rec.uid_modified = false;
            rec.attrs.remove(Attributes::MODIFIED);
            kept.push(rec);
        }
        self.size = kept.last().map(|m| m.message_end + 1).unwrap_or(0);
        self.messages = kept;
    }
}
