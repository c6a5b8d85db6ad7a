use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::stream::{Stream, StreamFlags, StreamImpl};

fn open_options(flags: StreamFlags) -> OpenOptions {
    let mut opts = OpenOptions::new();
    opts.read(flags.contains(StreamFlags::READ))
        .write(flags.contains(StreamFlags::WRITE) || flags.contains(StreamFlags::APPEND))
        .create(flags.contains(StreamFlags::CREATE));
    opts
}

/// Stream over a file opened by path.
pub struct FileStream {
    path: PathBuf,
    flags: StreamFlags,
    file: Option<File>,
}

impl FileStream {
    pub fn new<P: AsRef<Path>>(path: P, flags: StreamFlags) -> FileStream {
        FileStream {
            path: path.as_ref().to_path_buf(),
            flags,
            file: None,
        }
    }

    /// Conventional constructor: an open, full-buffered stream.
    pub async fn create<P: AsRef<Path>>(path: P, flags: StreamFlags) -> Result<Stream> {
        let mut stream = Stream::new(
            Box::new(FileStream::new(path, flags)),
            flags | StreamFlags::SEEK,
        )
        .buffered(crate::stream::BufferMode::Full, 0);
        stream.open().await?;
        Ok(stream)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn file(&mut self) -> Result<&mut File> {
        self.file.as_mut().ok_or(Error::NotOpen)
    }
}

#[async_trait]
impl StreamImpl for FileStream {
    async fn open(&mut self) -> Result<()> {
        let file = open_options(self.flags).open(&self.path).await?;
        self.file = Some(file);
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.file()?.read(buf).await?)
    }

    async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        Ok(self.file()?.write(buf).await?)
    }

    async fn seek(&mut self, pos: u64) -> Result<u64> {
        Ok(self.file()?.seek(SeekFrom::Start(pos)).await?)
    }

    async fn size(&mut self) -> Result<u64> {
        Ok(self.file()?.metadata().await?.len())
    }

    async fn truncate(&mut self, size: u64) -> Result<()> {
        self.file()?.set_len(size).await?;
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        let file = self.file()?;
        file.flush().await?;
        file.sync_data().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
        }
        Ok(())
    }

    fn seekable(&self) -> bool {
        true
    }
}

/// Stream over an already-open file object (temp files, inherited fds).
pub struct FdStream {
    file: Option<File>,
}

impl FdStream {
    pub fn new(file: std::fs::File) -> FdStream {
        FdStream {
            file: Some(File::from_std(file)),
        }
    }

    fn file(&mut self) -> Result<&mut File> {
        self.file.as_mut().ok_or(Error::NotOpen)
    }
}

#[async_trait]
impl StreamImpl for FdStream {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.file()?.read(buf).await?)
    }

    async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        Ok(self.file()?.write(buf).await?)
    }

    async fn seek(&mut self, pos: u64) -> Result<u64> {
        Ok(self.file()?.seek(SeekFrom::Start(pos)).await?)
    }

    async fn size(&mut self) -> Result<u64> {
        Ok(self.file()?.metadata().await?.len())
    }

    async fn truncate(&mut self, size: u64) -> Result<()> {
        self.file()?.set_len(size).await?;
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        let file = self.file()?;
        file.flush().await?;
        file.sync_data().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
        }
        Ok(())
    }

    fn seekable(&self) -> bool {
        true
    }
}

/// File stream that spools the whole file into memory on open and writes
/// it back on flush. Stands in for a memory-mapped file; callers that
/// cannot spool (irregular files) should fall back to [`FileStream`],
/// which `open` arranges automatically.
pub struct MapFileStream {
    path: PathBuf,
    flags: StreamFlags,
    data: Vec<u8>,
    pos: u64,
    dirty: bool,
    fallback: Option<FileStream>,
    open: bool,
}

impl MapFileStream {
    pub fn new<P: AsRef<Path>>(path: P, flags: StreamFlags) -> MapFileStream {
        MapFileStream {
            path: path.as_ref().to_path_buf(),
            flags,
            data: Vec::new(),
            pos: 0,
            dirty: false,
            fallback: None,
            open: false,
        }
    }

    async fn write_back(&mut self) -> Result<()> {
        if self.dirty {
            tokio::fs::write(&self.path, &self.data).await?;
            self.dirty = false;
        }
        Ok(())
    }
}

#[async_trait]
impl StreamImpl for MapFileStream {
    async fn open(&mut self) -> Result<()> {
        match tokio::fs::read(&self.path).await {
            Ok(data) => {
                self.data = data;
                self.pos = 0;
                self.open = true;
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound
                && self.flags.contains(StreamFlags::CREATE) =>
            {
                self.data = Vec::new();
                self.pos = 0;
                self.dirty = true;
                self.open = true;
                Ok(())
            }
            Err(_) => {
                // Spooling failed; degrade to plain file I/O.
                let mut fb = FileStream::new(&self.path, self.flags);
                fb.open().await?;
                self.fallback = Some(fb);
                self.open = true;
                Ok(())
            }
        }
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if let Some(fb) = &mut self.fallback {
            return fb.read(buf).await;
        }
        let start = (self.pos as usize).min(self.data.len());
        let n = buf.len().min(self.data.len() - start);
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        self.pos += n as u64;
        Ok(n)
    }

    async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if let Some(fb) = &mut self.fallback {
            return fb.write(buf).await;
        }
        let start = self.pos as usize;
        if start > self.data.len() {
            self.data.resize(start, 0);
        }
        let overlap = (self.data.len() - start).min(buf.len());
        self.data[start..start + overlap].copy_from_slice(&buf[..overlap]);
        self.data.extend_from_slice(&buf[overlap..]);
        self.pos += buf.len() as u64;
        self.dirty = true;
        Ok(buf.len())
    }

    async fn seek(&mut self, pos: u64) -> Result<u64> {
        if let Some(fb) = &mut self.fallback {
            return fb.seek(pos).await;
        }
        self.pos = pos;
        Ok(pos)
    }

    async fn size(&mut self) -> Result<u64> {
        if let Some(fb) = &mut self.fallback {
            return fb.size().await;
        }
        Ok(self.data.len() as u64)
    }

    async fn truncate(&mut self, size: u64) -> Result<()> {
        if let Some(fb) = &mut self.fallback {
            return fb.truncate(size).await;
        }
        self.data.truncate(size as usize);
        self.dirty = true;
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        if let Some(fb) = &mut self.fallback {
            return fb.flush().await;
        }
        self.write_back().await
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(fb) = &mut self.fallback {
            return fb.close().await;
        }
        self.write_back().await?;
        self.open = false;
        Ok(())
    }

    fn seekable(&self) -> bool {
        true
    }
}

/// Writes each completed line to the diagnostic sink.
#[derive(Default)]
pub struct DbgStream {
    line: Vec<u8>,
}

impl DbgStream {
    pub fn new() -> DbgStream {
        DbgStream::default()
    }
}

#[async_trait]
impl StreamImpl for DbgStream {
    async fn read(&mut self, _buf: &mut [u8]) -> Result<usize> {
        Ok(0)
    }

    async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        for &b in buf {
            if b == b'\n' {
                tracing::debug!(target: "cour_stream::dbg", "{}", String::from_utf8_lossy(&self.line));
                self.line.clear();
            } else {
                self.line.push(b);
            }
        }
        Ok(buf.len())
    }

    async fn flush(&mut self) -> Result<()> {
        if !self.line.is_empty() {
            tracing::debug!(target: "cour_stream::dbg", "{}", String::from_utf8_lossy(&self.line));
            self.line.clear();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::BufferMode;

    fn scratch(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("cour-stream-{}-{}", std::process::id(), name));
        p
    }

    #[tokio::test]
    async fn file_stream_round_trip() {
        let path = scratch("file-rt");
        let mut s = FileStream::create(
            &path,
            StreamFlags::RDWR | StreamFlags::CREATE,
        )
        .await
        .unwrap();
        s.write_all(b"alpha\nbeta\n").await.unwrap();
        s.flush().await.unwrap();
        s.seek(SeekFrom::Start(6)).await.unwrap();
        let mut line = Vec::new();
        s.read_line(&mut line).await.unwrap();
        assert_eq!(line, b"beta\n");
        s.close().await.unwrap();
        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn mapfile_spools_and_writes_back() {
        let path = scratch("mapfile");
        std::fs::write(&path, b"mapped contents").unwrap();
        let mut s = Stream::new(
            Box::new(MapFileStream::new(&path, StreamFlags::RDWR)),
            StreamFlags::RDWR | StreamFlags::SEEK,
        )
        .buffered(BufferMode::Full, 0);
        s.open().await.unwrap();
        s.seek(SeekFrom::Start(7)).await.unwrap();
        s.write_all(b"patched!").await.unwrap();
        s.close().await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"mapped patched!");
        std::fs::remove_file(&path).unwrap();
    }
}
