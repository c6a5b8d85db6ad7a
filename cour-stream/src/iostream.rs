use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::stream::StreamImpl;

/// Pairs an input backend with an output backend.
///
/// The one stream kind whose transport query reports two halves; see
/// [`IoStream::halves`].
pub struct IoStream {
    input: Box<dyn StreamImpl>,
    output: Box<dyn StreamImpl>,
}

impl IoStream {
    pub fn new(input: Box<dyn StreamImpl>, output: Box<dyn StreamImpl>) -> IoStream {
        IoStream { input, output }
    }

    pub fn halves(&mut self) -> (&mut dyn StreamImpl, &mut dyn StreamImpl) {
        (self.input.as_mut(), self.output.as_mut())
    }
}

#[async_trait]
impl StreamImpl for IoStream {
    async fn open(&mut self) -> Result<()> {
        self.input.open().await?;
        self.output.open().await
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.input.read(buf).await
    }

    async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.output.write(buf).await
    }

    async fn flush(&mut self) -> Result<()> {
        self.output.flush().await
    }

    async fn wait(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.input.wait(timeout).await
    }

    async fn close(&mut self) -> Result<()> {
        let r1 = self.input.close().await;
        let r2 = self.output.close().await;
        r1.and(r2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::MemStream;
    use crate::stream::{Stream, StreamFlags};

    #[tokio::test]
    async fn reads_and_writes_use_separate_halves() {
        let io = IoStream::new(
            Box::new(MemStream::from(b"incoming".to_vec())),
            Box::new(MemStream::new()),
        );
        let mut s = Stream::new(Box::new(io), StreamFlags::RDWR);
        s.open().await.unwrap();
        let mut buf = [0u8; 8];
        s.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"incoming");
        s.write_all(b"outgoing").await.unwrap();
        s.flush().await.unwrap();
    }
}
