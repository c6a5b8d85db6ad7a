use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::stream::{SharedStream, Stream, StreamImpl};

/// Direction of data through a transcript stream.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Channel {
    Read = 0,
    Write = 1,
}

/// Externally visible transcript level of one channel.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TranscriptLevel {
    /// Everything is logged.
    Normal,
    /// PASS/LOGIN arguments are redacted.
    Secure,
    /// Log `(data...)` once, then suppress.
    Payload,
}

/// Internal channel state; extends the public level with the transient
/// payload-tracking states.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum State {
    Normal,
    Secure,
    Payload,
    SkipLen,
    Disabled,
}

#[derive(Clone, Copy, Debug)]
pub struct ChannelConfig {
    pub level: TranscriptLevel,
    /// For `Payload`: revert to `Normal` after this many bytes. Zero
    /// suppresses until the level is reset.
    pub length: u64,
}

impl ChannelConfig {
    pub fn normal() -> ChannelConfig {
        ChannelConfig {
            level: TranscriptLevel::Normal,
            length: 0,
        }
    }
}

struct ChannelState {
    state: State,
    length: u64,
}

impl ChannelState {
    fn level(&self) -> ChannelConfig {
        ChannelConfig {
            level: match self.state {
                State::Normal => TranscriptLevel::Normal,
                State::Secure => TranscriptLevel::Secure,
                State::Payload | State::SkipLen | State::Disabled => TranscriptLevel::Payload,
            },
            length: self.length,
        }
    }

    fn apply(&mut self, cfg: ChannelConfig) {
        self.state = match cfg.level {
            TranscriptLevel::Normal => State::Normal,
            TranscriptLevel::Secure => State::Secure,
            TranscriptLevel::Payload => State::Payload,
        };
        self.length = cfg.length;
    }
}

/// Find the position just past `word` at argument position `n` of the
/// line, where arguments are words or double-quoted strings.
fn word_match(buf: &[u8], n: usize, word: &[u8]) -> Option<usize> {
    let mut i = 0;
    let mut n = n as isize;
    loop {
        while i < buf.len() && buf[i].is_ascii_whitespace() {
            i += 1;
        }
        if n == 0 {
            break;
        }
        n -= 1;
        if i < buf.len() && buf[i] == b'"' {
            i += 1;
            while i < buf.len() && buf[i] != b'"' {
                if buf[i] == b'\\' {
                    i += 1;
                }
                i += 1;
            }
        } else {
            while i < buf.len() && !buf[i].is_ascii_whitespace() {
                i += 1;
            }
        }
    }
    if i + word.len() <= buf.len()
        && buf[i..i + word.len()].eq_ignore_ascii_case(word)
        && buf.get(i + word.len()).is_some_and(|b| *b == b' ' || *b == b'\t')
    {
        Some(i + word.len())
    } else {
        None
    }
}

/// Skip one argument (word or quoted string) starting at `i`, after
/// leading whitespace.
fn skip_argument(buf: &[u8], mut i: usize) -> usize {
    while i < buf.len() && buf[i].is_ascii_whitespace() {
        i += 1;
    }
    if i < buf.len() && buf[i] == b'"' {
        i += 1;
        while i < buf.len() && buf[i] != b'"' {
            if buf[i] == b'\\' {
                i += 1;
            }
            i += 1;
        }
        if i < buf.len() {
            i += 1;
        }
    } else {
        while i < buf.len() && !buf[i].is_ascii_whitespace() {
            i += 1;
        }
    }
    i
}

/// Session logger tee.
///
/// Wraps a transport stream; every lineful of data moved in either
/// direction is copied to the log stream behind a direction prefix
/// (`C: ` for reads, `S: ` for writes by default). Each channel runs its
/// own redaction state machine.
pub struct TranscriptStream {
    transport: Stream,
    logger: SharedStream,
    prefix: [String; 2],
    channel: [ChannelState; 2],
}

impl TranscriptStream {
    pub fn new(transport: Stream, logger: SharedStream) -> TranscriptStream {
        TranscriptStream {
            transport,
            logger,
            prefix: ["C: ".to_string(), "S: ".to_string()],
            channel: [
                ChannelState {
                    state: State::Normal,
                    length: 0,
                },
                ChannelState {
                    state: State::Normal,
                    length: 0,
                },
            ],
        }
    }

    pub fn set_prefixes(&mut self, read: &str, write: &str) {
        self.prefix[0] = read.to_string();
        self.prefix[1] = write.to_string();
    }

    /// Set both channel levels at once, returning the previous pair so
    /// callers can stack modes around authentication exchanges.
    pub fn set_levels(
        &mut self,
        read: ChannelConfig,
        write: ChannelConfig,
    ) -> (ChannelConfig, ChannelConfig) {
        let prev = (self.channel[0].level(), self.channel[1].level());
        self.channel[0].apply(read);
        self.channel[1].apply(write);
        prev
    }

    /// Reconfigure one channel, returning its previous configuration.
    pub fn set_channel(&mut self, dir: Channel, cfg: ChannelConfig) -> ChannelConfig {
        let prev = self.channel[dir as usize].level();
        self.channel[dir as usize].apply(cfg);
        prev
    }

    pub fn transport(&mut self) -> &mut Stream {
        &mut self.transport
    }

    pub fn logger(&self) -> SharedStream {
        self.logger.clone()
    }

    async fn log(&mut self, dir: Channel, mut buf: &[u8]) {
        let dir = dir as usize;
        while !buf.is_empty() {
            match self.channel[dir].state {
                State::Normal | State::Secure => {
                    let prefix = self.prefix[dir].clone();
                    let mut logger = self.logger.lock().await;
                    let _ = logger.write_all(prefix.as_bytes()).await;
                }
                State::Payload => {
                    let prefix = self.prefix[dir].clone();
                    let mut logger = self.logger.lock().await;
                    let _ = logger.write_all(prefix.as_bytes()).await;
                    let _ = logger.write_all(b"(data...)\n").await;
                    drop(logger);
                    self.channel[dir].state = if self.channel[dir].length > 0 {
                        State::SkipLen
                    } else {
                        State::Disabled
                    };
                    continue;
                }
                State::SkipLen => {
                    let len = (buf.len() as u64).min(self.channel[dir].length) as usize;
                    self.channel[dir].length -= len as u64;
                    buf = &buf[len..];
                    if self.channel[dir].length == 0 {
                        self.channel[dir].state = State::Normal;
                    }
                    continue;
                }
                State::Disabled => return,
            }

            match buf.iter().position(|&b| b == b'\n') {
                Some(p) => {
                    let mut len = p;
                    if p > 0 && buf[p - 1] == b'\r' {
                        len -= 1;
                    }
                    let line = &buf[..len];
                    if self.channel[dir].state == State::Secure {
                        self.log_secure_line(line).await;
                    } else {
                        let mut logger = self.logger.lock().await;
                        let _ = logger.write_all(line).await;
                    }
                    {
                        let mut logger = self.logger.lock().await;
                        let _ = logger.write_all(b"\n").await;
                    }
                    buf = &buf[p + 1..];
                }
                None => {
                    let mut logger = self.logger.lock().await;
                    let _ = logger.write_all(buf).await;
                    return;
                }
            }
        }
    }

    async fn log_secure_line(&mut self, line: &[u8]) {
        if word_match(line, 0, b"PASS").is_some() {
            let mut logger = self.logger.lock().await;
            let _ = logger.write_all(b"PASS ***").await;
        } else if let Some(mut i) = word_match(line, 1, b"LOGIN") {
            // Keep the tag, the command and the user name; hide the
            // password.
            i = skip_argument(line, i);
            let mut logger = self.logger.lock().await;
            let _ = logger.write_all(&line[..i]).await;
            let _ = logger.write_all(b" \"***\"").await;
        } else {
            let mut logger = self.logger.lock().await;
            let _ = logger.write_all(line).await;
        }
    }
}

#[async_trait]
impl StreamImpl for TranscriptStream {
    async fn open(&mut self) -> Result<()> {
        if !self.transport.is_open() {
            self.transport.open().await?;
        }
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = self.transport.read(buf).await?;
        if n > 0 {
            let data = buf[..n].to_vec();
            self.log(Channel::Read, &data).await;
        }
        Ok(n)
    }

    async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.transport.write_all(buf).await?;
        self.log(Channel::Write, buf).await;
        Ok(buf.len())
    }

    async fn flush(&mut self) -> Result<()> {
        self.transport.flush().await
    }

    async fn wait(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.transport.wait(timeout).await
    }

    async fn close(&mut self) -> Result<()> {
        self.transport.close().await?;
        let mut logger = self.logger.lock().await;
        logger.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::MemStream;
    use crate::stream::StreamFlags;

    async fn transcript_of(lines: &[&[u8]], secure: bool) -> String {
        let mut transport = Stream::new(Box::new(MemStream::new()), StreamFlags::RDWR);
        transport.open().await.unwrap();
        let mut logger = Stream::new(Box::new(MemStream::new()), StreamFlags::RDWR);
        logger.open().await.unwrap();
        let logger = logger.into_shared();
        let mut xs = TranscriptStream::new(transport, logger.clone());
        if secure {
            xs.set_levels(
                ChannelConfig {
                    level: TranscriptLevel::Secure,
                    length: 0,
                },
                ChannelConfig {
                    level: TranscriptLevel::Secure,
                    length: 0,
                },
            );
        }
        for line in lines {
            xs.write(line).await.unwrap();
        }
        let mut out = Vec::new();
        let mut guard = logger.lock().await;
        guard.seek(std::io::SeekFrom::Start(0)).await.unwrap();
        let mut chunk = [0u8; 256];
        loop {
            let n = guard.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&chunk[..n]);
        }
        String::from_utf8(out).unwrap()
    }

    #[tokio::test]
    async fn normal_lines_are_prefixed() {
        let log = transcript_of(&[b"HELO there\n"], false).await;
        assert_eq!(log, "S: HELO there\n");
    }

    #[tokio::test]
    async fn pass_is_redacted_in_secure_mode() {
        let log = transcript_of(&[b"PASS hunter2\n"], true).await;
        assert_eq!(log, "S: PASS ***\n");
    }

    #[tokio::test]
    async fn login_password_is_redacted() {
        let log = transcript_of(&[b"a1 LOGIN \"joe\" \"secret\"\n"], true).await;
        assert_eq!(log, "S: a1 LOGIN \"joe\" \"***\"\n");
    }

    #[tokio::test]
    async fn payload_collapses_to_marker() {
        let mut transport = Stream::new(Box::new(MemStream::new()), StreamFlags::RDWR);
        transport.open().await.unwrap();
        let mut logger = Stream::new(Box::new(MemStream::new()), StreamFlags::RDWR);
        logger.open().await.unwrap();
        let logger = logger.into_shared();
        let mut xs = TranscriptStream::new(transport, logger.clone());
        xs.set_channel(
            Channel::Write,
            ChannelConfig {
                level: TranscriptLevel::Payload,
                length: 10,
            },
        );
        xs.write(b"0123456789").await.unwrap();
        xs.write(b"back to normal\n").await.unwrap();
        let mut guard = logger.lock().await;
        guard.seek(std::io::SeekFrom::Start(0)).await.unwrap();
        let mut out = Vec::new();
        let mut chunk = [0u8; 256];
        loop {
            let n = guard.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&chunk[..n]);
        }
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "S: (data...)\nS: back to normal\n"
        );
    }
}
