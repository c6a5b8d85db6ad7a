use async_trait::async_trait;

use crate::error::Result;
use crate::stream::StreamImpl;

/// Adds SEEK to a non-seekable source by spooling everything read so far.
///
/// Seeks beyond the cached region pull the missing bytes from the source
/// first; data already spooled is served from memory.
pub struct RdCacheStream {
    source: Box<dyn StreamImpl>,
    cache: Vec<u8>,
    pos: u64,
    source_eof: bool,
}

impl RdCacheStream {
    pub fn new(source: Box<dyn StreamImpl>) -> RdCacheStream {
        RdCacheStream {
            source,
            cache: Vec::new(),
            pos: 0,
            source_eof: false,
        }
    }

    async fn fill_to(&mut self, target: u64) -> Result<()> {
        let mut chunk = [0u8; 8192];
        while !self.source_eof && (self.cache.len() as u64) < target {
            let n = self.source.read(&mut chunk).await?;
            if n == 0 {
                self.source_eof = true;
                break;
            }
            self.cache.extend_from_slice(&chunk[..n]);
        }
        Ok(())
    }
}

#[async_trait]
impl StreamImpl for RdCacheStream {
    async fn open(&mut self) -> Result<()> {
        self.source.open().await
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.fill_to(self.pos + buf.len() as u64).await?;
        let start = (self.pos as usize).min(self.cache.len());
        let n = buf.len().min(self.cache.len() - start);
        buf[..n].copy_from_slice(&self.cache[start..start + n]);
        self.pos += n as u64;
        Ok(n)
    }

    async fn write(&mut self, _buf: &[u8]) -> Result<usize> {
        Err(crate::error::Error::NotSupported("write"))
    }

    async fn seek(&mut self, pos: u64) -> Result<u64> {
        self.pos = pos;
        Ok(pos)
    }

    async fn size(&mut self) -> Result<u64> {
        self.fill_to(u64::MAX).await?;
        Ok(self.cache.len() as u64)
    }

    async fn close(&mut self) -> Result<()> {
        self.source.close().await
    }

    fn seekable(&self) -> bool {
        true
    }
}
