use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ModemError>;

/// Errors produced by the modem driver.
///
/// Wire-level anomalies (`TimedOut`, `SerialGone`) are not recoverable
/// in-band: a half-framed AT engine stays desynchronized until the module is
/// power-cycled, so the task wrapper restarts on them instead of retrying.
#[derive(Error, Debug)]
pub enum ModemError {
    /// No data arrived within the read deadline.
    #[error("timed out waiting for modem data")]
    TimedOut,

    /// The modem answered with something the current transaction cannot
    /// accept (`ERROR`, `+CME ERROR`, or a line outside the protocol).
    #[error("unexpected reply from modem: {detail}")]
    UnexpectedReply { detail: String },

    /// The modem refused an SMS submission with `+CMS ERROR: <code>`.
    #[error("SMS rejected with +CMS ERROR: {code}")]
    SmsError { code: u16 },

    /// An AT step of the one-shot initialization sequence failed.
    #[error("modem bootstrap failed at {step}")]
    BootstrapFailed {
        step: &'static str,
        #[source]
        source: Box<ModemError>,
    },

    /// Serial I/O failed for a reason other than a timeout, typically
    /// because the USB device disappeared.
    #[error("serial port gone")]
    SerialGone(#[source] io::Error),
}

impl ModemError {
    pub(crate) fn unexpected(detail: impl Into<String>) -> Self {
        ModemError::UnexpectedReply {
            detail: detail.into(),
        }
    }

    pub(crate) fn at_step(self, step: &'static str) -> Self {
        ModemError::BootstrapFailed {
            step,
            source: Box::new(self),
        }
    }

    /// Classifies an `io::Error` from the serial port: poll timeouts map to
    /// `TimedOut`, everything else means the port itself is gone.
    pub(crate) fn from_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => ModemError::TimedOut,
            _ => ModemError::SerialGone(err),
        }
    }
}
