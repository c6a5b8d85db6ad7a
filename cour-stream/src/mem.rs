use async_trait::async_trait;

use crate::error::Result;
use crate::stream::StreamImpl;

/// Growable in-memory stream.
#[derive(Default)]
pub struct MemStream {
    data: Vec<u8>,
    pos: u64,
}

impl MemStream {
    pub fn new() -> MemStream {
        MemStream::default()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }

    pub fn contents(&self) -> &[u8] {
        &self.data
    }
}

impl From<Vec<u8>> for MemStream {
    fn from(data: Vec<u8>) -> MemStream {
        MemStream { data, pos: 0 }
    }
}

#[async_trait]
impl StreamImpl for MemStream {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let start = (self.pos as usize).min(self.data.len());
        let n = buf.len().min(self.data.len() - start);
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        self.pos += n as u64;
        Ok(n)
    }

    async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let start = self.pos as usize;
        if start > self.data.len() {
            self.data.resize(start, 0);
        }
        let overlap = (self.data.len() - start).min(buf.len());
        self.data[start..start + overlap].copy_from_slice(&buf[..overlap]);
        self.data.extend_from_slice(&buf[overlap..]);
        self.pos += buf.len() as u64;
        Ok(buf.len())
    }

    async fn seek(&mut self, pos: u64) -> Result<u64> {
        self.pos = pos;
        Ok(pos)
    }

    async fn size(&mut self) -> Result<u64> {
        Ok(self.data.len() as u64)
    }

    async fn truncate(&mut self, size: u64) -> Result<()> {
        self.data.truncate(size as usize);
        if self.pos > size {
            self.pos = size;
        }
        Ok(())
    }

    fn seekable(&self) -> bool {
        true
    }
}

/// Discards writes, returns end-of-stream on reads.
#[derive(Default)]
pub struct NullStream {
    written: u64,
}

impl NullStream {
    pub fn new() -> NullStream {
        NullStream::default()
    }

    pub fn written(&self) -> u64 {
        self.written
    }
}

#[async_trait]
impl StreamImpl for NullStream {
    async fn read(&mut self, _buf: &mut [u8]) -> Result<usize> {
        Ok(0)
    }

    async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.written += buf.len() as u64;
        Ok(buf.len())
    }

    async fn seek(&mut self, pos: u64) -> Result<u64> {
        Ok(pos)
    }

    async fn size(&mut self) -> Result<u64> {
        Ok(0)
    }

    async fn truncate(&mut self, _size: u64) -> Result<()> {
        Ok(())
    }

    fn seekable(&self) -> bool {
        true
    }
}
