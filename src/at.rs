use std::io::{Read, Write};
use std::time::{Duration, Instant};

use tracing::trace;

use crate::error::{ModemError, Result};
use crate::reader::{LineReader, RawMode};

/// Serialized AT transaction engine.
///
/// One transaction is in flight at a time, always on the thread that owns
/// the port. The invariant maintained by every operation here: after a
/// successful transaction the input stream begins at a fresh line boundary,
/// so the next command never reads a stale half-reply.
pub struct AtLink<T> {
    reader: LineReader<T>,
}

impl<T: Read + Write> AtLink<T> {
    pub fn new(io: T) -> Self {
        AtLink {
            reader: LineReader::new(io, true),
        }
    }

    pub fn set_read_timeout(&mut self, timeout: Duration) {
        self.reader.set_timeout(timeout);
    }

    /// Emits `AT` + `cmd` + CR. No read.
    pub fn send(&mut self, cmd: &str) -> Result<()> {
        trace!(cmd, "modem <-");
        self.reader.send(format!("AT{cmd}\r").as_bytes())
    }

    /// Reads lines until the terminating `OK`, failing on `ERROR`,
    /// `+CME ERROR:<n>` or `+CMS ERROR:<n>`. Non-terminal lines (echoes,
    /// intermediate responses) are skipped.
    pub fn expect_ok(&mut self) -> Result<()> {
        self.expect_ok_by(self.deadline())
    }

    pub fn expect_ok_by(&mut self, deadline: Instant) -> Result<()> {
        loop {
            let line = self.reader.read_line_by(deadline)?;
            trace!(%line, "modem ->");
            if line == "OK" {
                return Ok(());
            }
            if let Some(detail) = failure_detail(&line) {
                return Err(ModemError::unexpected(detail));
            }
        }
    }

    /// Sends a query and returns its single `+<NAME>: ...` response line
    /// verbatim, consuming the trailing `OK`.
    pub fn read_value(&mut self, cmd: &str) -> Result<String> {
        let prefix = response_prefix(cmd);
        self.send(cmd)?;
        let line = self.read_line()?;
        if let Some(detail) = failure_detail(&line) {
            return Err(ModemError::unexpected(detail));
        }
        if line == "OK" {
            return Err(ModemError::unexpected(format!("{cmd} returned no data")));
        }
        if !line.starts_with(&prefix) {
            return Err(ModemError::unexpected(format!(
                "expected {prefix} response, got {line:?}"
            )));
        }
        self.expect_ok()?;
        Ok(line)
    }

    /// As [`AtLink::read_value`], for execute commands whose payload line
    /// carries no prefix (`+CGSN` answers with the bare IMEI digits).
    pub fn read_bare(&mut self, cmd: &str) -> Result<String> {
        self.send(cmd)?;
        let line = self.read_line()?;
        if let Some(detail) = failure_detail(&line) {
            return Err(ModemError::unexpected(detail));
        }
        if line == "OK" {
            return Err(ModemError::unexpected(format!("{cmd} returned no data")));
        }
        self.expect_ok()?;
        Ok(line)
    }

    /// Low-level escape hatch: one line under the default timeout. Used for
    /// multi-line listings and unsolicited result codes.
    pub fn read_line(&mut self) -> Result<String> {
        let line = self.reader.read_line()?;
        trace!(%line, "modem ->");
        Ok(line)
    }

    pub fn read_line_by(&mut self, deadline: Instant) -> Result<String> {
        let line = self.reader.read_line_by(deadline)?;
        trace!(%line, "modem ->");
        Ok(line)
    }

    /// Switches the reader to raw-byte discipline for the scope of the
    /// guard. The SMS prompt is the only place the protocol is not
    /// line-oriented.
    pub fn raw_mode(&mut self) -> RawMode<'_, T> {
        self.reader.raw_mode()
    }

    /// Writes a payload verbatim (no `AT` prefix, no CR).
    pub fn write_payload(&mut self, bytes: &[u8]) -> Result<()> {
        self.reader.send(bytes)
    }

    pub fn flush_input(&mut self) -> Result<()> {
        self.reader.flush_input()
    }

    fn deadline(&self) -> Instant {
        Instant::now() + self.reader.timeout()
    }
}

/// `ERROR` and the verbose `+CME`/`+CMS` variants terminate a transaction
/// as failures; everything else is a response or unsolicited line.
pub(crate) fn failure_detail(line: &str) -> Option<&str> {
    if line == "ERROR"
        || line.starts_with("+CME ERROR:")
        || line.starts_with("+CMS ERROR:")
    {
        Some(line)
    } else {
        None
    }
}

/// Derives the expected response prefix from a command: `+CPIN?` answers
/// with `+CPIN: ...`, `+CSQ` with `+CSQ: ...`.
fn response_prefix(cmd: &str) -> String {
    let name: String = cmd
        .trim_start_matches('+')
        .chars()
        .take_while(char::is_ascii_alphanumeric)
        .collect();
    format!("+{name}:")
}
