use async_trait::async_trait;

use crate::error::Result;
use crate::stream::{BufferMode, SharedStream, Stream, StreamFlags, StreamImpl};

/// A bounded window over a shared stream, with its own cursor.
///
/// The window starts at `start` and spans `len` bytes when bounded;
/// an unbounded ref tracks the parent's end. Each operation borrows the
/// parent for the duration of the call only, so several refs over the
/// same parent can interleave.
pub struct StreamRef {
    parent: SharedStream,
    start: u64,
    len: Option<u64>,
    pos: u64,
}

impl StreamRef {
    pub fn new(parent: SharedStream, start: u64, len: Option<u64>) -> StreamRef {
        StreamRef {
            parent,
            start,
            len,
            pos: 0,
        }
    }

    /// Whole-stream reference.
    pub fn whole(parent: SharedStream) -> StreamRef {
        StreamRef::new(parent, 0, None)
    }

    /// Wrap into an open, buffered [`Stream`].
    pub async fn open_stream(self, flags: StreamFlags) -> Result<Stream> {
        let mut stream = Stream::new(Box::new(self), flags | StreamFlags::SEEK)
            .buffered(BufferMode::Full, 0);
        stream.open().await?;
        Ok(stream)
    }

    async fn remaining(&mut self) -> Result<u64> {
        match self.len {
            Some(len) => Ok(len.saturating_sub(self.pos)),
            None => {
                let mut parent = self.parent.lock().await;
                let size = parent.size().await?;
                Ok(size.saturating_sub(self.start + self.pos))
            }
        }
    }
}

#[async_trait]
impl StreamImpl for StreamRef {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let remaining = self.remaining().await?;
        let want = (buf.len() as u64).min(remaining) as usize;
        if want == 0 {
            return Ok(0);
        }
        let mut parent = self.parent.lock().await;
        parent
            .seek(std::io::SeekFrom::Start(self.start + self.pos))
            .await?;
        let n = parent.read(&mut buf[..want]).await?;
        self.pos += n as u64;
        Ok(n)
    }

    async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let data = match self.len {
            Some(len) => {
                let room = len.saturating_sub(self.pos) as usize;
                &buf[..buf.len().min(room)]
            }
            None => buf,
        };
        if data.is_empty() && !buf.is_empty() {
            return Err(crate::error::Error::BufSpace);
        }
        let mut parent = self.parent.lock().await;
        parent
            .seek(std::io::SeekFrom::Start(self.start + self.pos))
            .await?;
        let n = parent.write(data).await?;
        self.pos += n as u64;
        Ok(n)
    }

    async fn seek(&mut self, pos: u64) -> Result<u64> {
        self.pos = pos;
        Ok(pos)
    }

    async fn size(&mut self) -> Result<u64> {
        match self.len {
            Some(len) => Ok(len),
            None => {
                let mut parent = self.parent.lock().await;
                let size = parent.size().await?;
                Ok(size.saturating_sub(self.start))
            }
        }
    }

    async fn flush(&mut self) -> Result<()> {
        let mut parent = self.parent.lock().await;
        parent.flush().await
    }

    fn seekable(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::MemStream;

    async fn shared(data: &[u8]) -> SharedStream {
        let mut s = Stream::new(
            Box::new(MemStream::from(data.to_vec())),
            StreamFlags::RDWR | StreamFlags::SEEK,
        )
        .buffered(BufferMode::Full, 0);
        s.open().await.unwrap();
        s.into_shared()
    }

    #[tokio::test]
    async fn bounded_window_stops_at_limit() {
        let parent = shared(b"0123456789").await;
        let mut r = StreamRef::new(parent, 2, Some(5))
            .open_stream(StreamFlags::READ)
            .await
            .unwrap();
        let mut buf = Vec::new();
        let mut chunk = [0u8; 16];
        loop {
            let n = r.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
        }
        assert_eq!(buf, b"23456");
    }

    #[tokio::test]
    async fn two_refs_have_independent_cursors() {
        let parent = shared(b"abcdefgh").await;
        let mut a = StreamRef::new(parent.clone(), 0, Some(4))
            .open_stream(StreamFlags::READ)
            .await
            .unwrap();
        let mut b = StreamRef::new(parent, 4, Some(4))
            .open_stream(StreamFlags::READ)
            .await
            .unwrap();
        let mut x = [0u8; 2];
        let mut y = [0u8; 2];
        a.read_exact(&mut x).await.unwrap();
        b.read_exact(&mut y).await.unwrap();
        a.read_exact(&mut x).await.unwrap();
        assert_eq!(&x, b"cd");
        assert_eq!(&y, b"ef");
    }
}
