use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

use crate::error::{ModemError, Result};

/// Default per-read deadline once the modem is past bootstrap.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(7);

const CHUNK: usize = 256;

/// Buffered reader over the modem UART with two disciplines: line mode
/// (CR/LF delimited, blank lines skipped) and raw mode (exactly N bytes,
/// entered through [`LineReader::raw_mode`] for the scope of one guard).
///
/// Bytes pulled off the wire but not yet consumed stay in the internal
/// buffer across mode switches, so a raw read that fails mid-transaction
/// never corrupts the line discipline that follows it.
///
/// The underlying transport must return from `read` within a bounded poll
/// interval (the serial port is opened with a short timeout); deadlines are
/// enforced here, on top of that polling.
pub struct LineReader<T> {
    io: T,
    pending: Vec<u8>,
    trim: bool,
    timeout: Duration,
}

impl<T: Read> LineReader<T> {
    pub fn new(io: T, trim: bool) -> Self {
        LineReader {
            io,
            pending: Vec::new(),
            trim,
            timeout: DEFAULT_READ_TIMEOUT,
        }
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Reads one non-empty line, using the default timeout.
    pub fn read_line(&mut self) -> Result<String> {
        self.read_line_by(Instant::now() + self.timeout)
    }

    /// Reads one non-empty line by the given deadline. Blank CR/LF pairs the
    /// modem interleaves between responses are skipped so `OK` is reliably
    /// the terminating line of a transaction.
    pub fn read_line_by(&mut self, deadline: Instant) -> Result<String> {
        loop {
            while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
                let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                let text = String::from_utf8_lossy(&line).into_owned();
                let text = if self.trim {
                    text.trim().to_owned()
                } else {
                    text
                };
                if !text.is_empty() {
                    return Ok(text);
                }
            }
            self.fill(deadline)?;
        }
    }

    /// Switches to raw mode for the scope of the returned guard. Dropping
    /// the guard returns the reader to line mode on every exit path.
    pub fn raw_mode(&mut self) -> RawMode<'_, T> {
        RawMode { inner: self }
    }

    /// Discards buffered input and whatever the modem has already queued.
    /// Used after a hardware reset, where the module emits boot noise.
    pub fn flush_input(&mut self) -> Result<()> {
        self.pending.clear();
        let mut chunk = [0u8; CHUNK];
        loop {
            match self.io.read(&mut chunk) {
                Ok(0) => return Ok(()),
                Ok(_) => continue,
                Err(e) if is_poll_timeout(&e) => return Ok(()),
                Err(e) => return Err(ModemError::SerialGone(e)),
            }
        }
    }

    fn fill(&mut self, deadline: Instant) -> Result<()> {
        let mut chunk = [0u8; CHUNK];
        loop {
            if Instant::now() >= deadline {
                return Err(ModemError::TimedOut);
            }
            match self.io.read(&mut chunk) {
                Ok(0) => {
                    return Err(ModemError::SerialGone(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "serial port closed",
                    )))
                }
                Ok(n) => {
                    self.pending.extend_from_slice(&chunk[..n]);
                    return Ok(());
                }
                Err(e) if is_poll_timeout(&e) => continue,
                Err(e) => return Err(ModemError::SerialGone(e)),
            }
        }
    }
}

impl<T: Read + Write> LineReader<T> {
    /// Writes bytes to the port and drains the host-side buffer.
    pub fn send(&mut self, bytes: &[u8]) -> Result<()> {
        self.io.write_all(bytes).map_err(ModemError::from_io)?;
        self.io.flush().map_err(ModemError::from_io)
    }
}

fn is_poll_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Scoped raw-byte discipline. While this guard is alive the reader hands
/// out exact byte counts instead of lines.
pub struct RawMode<'a, T> {
    inner: &'a mut LineReader<T>,
}

impl<T: Read> RawMode<'_, T> {
    /// Reads exactly `n` bytes by the deadline. On failure, already-received
    /// bytes remain buffered for the line reads that follow.
    pub fn read_exact(&mut self, n: usize, deadline: Instant) -> Result<Vec<u8>> {
        while self.inner.pending.len() < n {
            self.inner.fill(deadline)?;
        }
        Ok(self.inner.pending.drain(..n).collect())
    }
}
