use std::fmt;
use std::io;

/// Errors returned by the levio server and its event loops.
#[derive(Debug)]
pub enum Error {
    /// An underlying socket or poller syscall failed.
    Io(io::Error),
    /// An address string could not be parsed or bound.
    InvalidAddress(String),
    /// Orderly-shutdown sentinel. Produced when a callback returns
    /// `Action::Shutdown` and consumed by the loop runner; `serve` never
    /// returns it.
    Closing,
    /// A trigger was posted to an event loop that has already closed.
    LoopClosed,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {e}"),
            Error::InvalidAddress(msg) => write!(f, "invalid address: {msg}"),
            Error::Closing => write!(f, "shutting down"),
            Error::LoopClosed => write!(f, "event loop closed"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}
