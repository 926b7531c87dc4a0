//! Buffered, timeout-bounded access to the modem's byte stream.
//!
//! Reads are cooperative polls: every attempt takes whatever the stream has
//! available right now and sleeps for a short interval otherwise, so a
//! timeout bounds the total wait of a call.

use std::io;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::trace;

use crate::errors::TransportError;
use crate::serial_port::PortSettings;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);
const CHUNK_SIZE: usize = 1024;

/// An already configured, open byte stream to the modem.
pub trait ByteStream: Send {
    /// Reads whatever is available without blocking. `Ok(0)` means nothing
    /// was pending.
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes all of `data` and flushes it to the device.
    fn write_all_flushed(&mut self, data: &[u8]) -> io::Result<()>;
}

/// Creates [`ByteStream`]s. The platform adapter behind this trait is the
/// only place that knows about line discipline.
pub trait PortOpener: Send + Sync {
    fn open(&self, port: &str, settings: &PortSettings) -> io::Result<Box<dyn ByteStream>>;
}

pub struct SerialStream {
    port: String,
    settings: PortSettings,
    opener: Arc<dyn PortOpener>,
    handle: Option<Box<dyn ByteStream>>,
    /// Bytes read by [`Self::read_line`] that belong to a later line.
    line_buffer: Vec<u8>,
    poll_interval: Duration,
}

impl SerialStream {
    pub fn new(
        port: impl Into<String>,
        settings: PortSettings,
        opener: Arc<dyn PortOpener>,
    ) -> Self {
        Self {
            port: port.into(),
            settings,
            opener,
            handle: None,
            line_buffer: Vec::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    #[must_use]
    pub fn with_poll_interval(self, poll_interval: Duration) -> Self {
        Self {
            poll_interval,
            ..self
        }
    }

    /// Opens the underlying handle. Calling this on an open stream is a no-op.
    pub fn open(&mut self) -> Result<(), TransportError> {
        if self.is_open() {
            return Ok(());
        }

        let handle = self.opener.open(&self.port, &self.settings).map_err(|source| {
            TransportError::Open {
                port: self.port.clone(),
                source,
            }
        })?;
        self.handle = Some(handle);
        self.line_buffer.clear();

        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    pub fn close(&mut self) {
        self.handle = None;
        self.line_buffer.clear();
    }

    /// Writes and flushes `data`, returning the number of bytes written.
    pub fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        let handle = self.handle.as_mut().ok_or(TransportError::NotOpen)?;
        handle.write_all_flushed(data)?;
        trace!(bytes = data.len(), "wrote to serial port");

        Ok(data.len())
    }

    /// Accumulates bytes until `delimiter` appears in them or `timeout`
    /// elapses, and returns everything accumulated.
    ///
    /// A timeout is not an error: the caller sees it as a result without the
    /// delimiter, possibly empty.
    pub fn read_until(
        &mut self,
        delimiter: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let poll_interval = self.poll_interval;
        let handle = self.handle.as_mut().ok_or(TransportError::NotOpen)?;
        let start = Instant::now();
        let mut data = Vec::new();
        let mut chunk = [0u8; CHUNK_SIZE];

        loop {
            let n = read_chunk(handle.as_mut(), &mut chunk)?;
            if n > 0 {
                let searched = data.len().saturating_sub(delimiter.len().saturating_sub(1));
                data.extend_from_slice(&chunk[..n]);
                if contains(&data[searched..], delimiter) {
                    return Ok(data);
                }
            }

            let elapsed = start.elapsed();
            if elapsed >= timeout {
                trace!(bytes = data.len(), "read_until timed out");
                return Ok(data);
            }
            thread::sleep(poll_interval.min(timeout - elapsed));
        }
    }

    /// Returns the next line without its CR/LF terminator.
    ///
    /// Bytes following the newline are kept for the next call. If the
    /// timeout elapses with a partial line buffered, that partial line is
    /// returned; `None` means nothing at all was available.
    pub fn read_line(&mut self, timeout: Duration) -> Result<Option<String>, TransportError> {
        let poll_interval = self.poll_interval;
        let handle = self.handle.as_mut().ok_or(TransportError::NotOpen)?;
        let start = Instant::now();
        let mut chunk = [0u8; CHUNK_SIZE];

        loop {
            if let Some(pos) = self.line_buffer.iter().position(|&b| b == b'\n') {
                let rest = self.line_buffer.split_off(pos + 1);
                let line = std::mem::replace(&mut self.line_buffer, rest);
                return Ok(Some(trim_line(&line)));
            }

            let elapsed = start.elapsed();
            if elapsed >= timeout {
                break;
            }

            let n = read_chunk(handle.as_mut(), &mut chunk)?;
            if n > 0 {
                self.line_buffer.extend_from_slice(&chunk[..n]);
            } else {
                thread::sleep(poll_interval.min(timeout - elapsed));
            }
        }

        if self.line_buffer.is_empty() {
            return Ok(None);
        }
        let line = std::mem::take(&mut self.line_buffer);

        Ok(Some(trim_line(&line)))
    }

    /// Discards everything currently pending on the stream and in the line
    /// buffer, without waiting for more.
    pub fn flush(&mut self) -> Result<(), TransportError> {
        self.line_buffer.clear();
        let Some(handle) = self.handle.as_mut() else {
            return Ok(());
        };

        let mut chunk = [0u8; CHUNK_SIZE];
        let mut discarded = 0;
        loop {
            let n = read_chunk(handle.as_mut(), &mut chunk)?;
            if n == 0 {
                break;
            }
            discarded += n;
        }
        if discarded > 0 {
            trace!(discarded, "flushed stale input");
        }

        Ok(())
    }
}

impl std::fmt::Debug for SerialStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialStream")
            .field("port", &self.port)
            .field("settings", &self.settings)
            .field("open", &self.is_open())
            .field("buffered", &self.line_buffer.len())
            .finish()
    }
}

fn read_chunk(stream: &mut dyn ByteStream, buf: &mut [u8]) -> io::Result<usize> {
    match stream.read_available(buf) {
        Err(e)
            if matches!(
                e.kind(),
                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
            ) =>
        {
            Ok(0)
        }
        other => other,
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() {
        return true;
    }
    haystack.windows(needle.len()).any(|w| w == needle)
}

fn trim_line(line: &[u8]) -> String {
    String::from_utf8_lossy(line)
        .trim_end_matches(['\r', '\n'])
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Hands out one queued chunk per read.
    #[derive(Clone, Default)]
    struct Chunks(Arc<Mutex<VecDeque<Vec<u8>>>>);

    impl Chunks {
        fn push(&self, chunk: &str) {
            self.0.lock().unwrap().push_back(chunk.as_bytes().to_vec());
        }
    }

    impl ByteStream for Chunks {
        fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let Some(chunk) = self.0.lock().unwrap().pop_front() else {
                return Ok(0);
            };
            buf[..chunk.len()].copy_from_slice(&chunk);
            Ok(chunk.len())
        }

        fn write_all_flushed(&mut self, _data: &[u8]) -> io::Result<()> {
            Ok(())
        }
    }

    struct ChunksOpener(Chunks);

    impl PortOpener for ChunksOpener {
        fn open(&self, _port: &str, _settings: &PortSettings) -> io::Result<Box<dyn ByteStream>> {
            Ok(Box::new(self.0.clone()))
        }
    }

    fn open_stream() -> (SerialStream, Chunks) {
        let chunks = Chunks::default();
        let mut stream = SerialStream::new(
            "/dev/null",
            PortSettings::default(),
            Arc::new(ChunksOpener(chunks.clone())),
        )
        .with_poll_interval(Duration::from_millis(1));
        stream.open().unwrap();
        (stream, chunks)
    }

    #[test]
    fn test_not_open_errors() {
        let mut stream = SerialStream::new(
            "/dev/null",
            PortSettings::default(),
            Arc::new(ChunksOpener(Chunks::default())),
        );
        assert!(!stream.is_open());
        assert!(matches!(stream.write(b"AT\r\n"), Err(TransportError::NotOpen)));
        assert!(matches!(
            stream.read_until(b"OK", Duration::from_millis(5)),
            Err(TransportError::NotOpen)
        ));
        // Flushing a closed stream is harmless.
        assert!(stream.flush().is_ok());
    }

    #[test]
    fn test_open_is_idempotent_and_close_resets() {
        let (mut stream, _chunks) = open_stream();
        assert!(stream.open().is_ok());
        assert!(stream.is_open());
        stream.close();
        assert!(!stream.is_open());
    }

    #[test]
    fn test_read_until_finds_delimiter_split_across_chunks() {
        let (mut stream, chunks) = open_stream();
        chunks.push("+CSQ: 20,0\r\nO");
        chunks.push("K\r\n");
        chunks.push("never read");

        let data = stream.read_until(b"OK", Duration::from_secs(1)).unwrap();
        assert_eq!(data, b"+CSQ: 20,0\r\nOK\r\n");
    }

    #[test]
    fn test_read_until_timeout_returns_partial_data() {
        let (mut stream, chunks) = open_stream();
        chunks.push("+CSQ: 20");

        let start = Instant::now();
        let data = stream.read_until(b"OK", Duration::from_millis(30)).unwrap();
        assert_eq!(data, b"+CSQ: 20");
        assert!(start.elapsed() < Duration::from_secs(1));

        let data = stream.read_until(b"OK", Duration::from_millis(10)).unwrap();
        assert!(data.is_empty());
    }

    #[test]
    fn test_read_line_carries_over_between_calls() {
        let (mut stream, chunks) = open_stream();
        chunks.push("RING\r\n+CLIP: \"+123\"");
        chunks.push(",145\r\n+CMTI: ");

        let timeout = Duration::from_millis(20);
        assert_eq!(stream.read_line(timeout).unwrap().as_deref(), Some("RING"));
        assert_eq!(
            stream.read_line(timeout).unwrap().as_deref(),
            Some("+CLIP: \"+123\",145")
        );
        // No newline ever arrives: the partial line is still handed out.
        assert_eq!(stream.read_line(timeout).unwrap().as_deref(), Some("+CMTI: "));
        assert_eq!(stream.read_line(timeout).unwrap(), None);
    }

    #[test]
    fn test_flush_discards_pending_and_buffered_input() {
        let (mut stream, chunks) = open_stream();
        chunks.push("first\r\nsecond");
        let timeout = Duration::from_millis(10);
        assert_eq!(stream.read_line(timeout).unwrap().as_deref(), Some("first"));

        chunks.push("stale OK\r\n");
        stream.flush().unwrap();
        assert_eq!(stream.read_line(timeout).unwrap(), None);
    }
}
