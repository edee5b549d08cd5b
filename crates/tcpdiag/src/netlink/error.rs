//! Error types for socket diagnostics.
//!
//! Three layers, from the inside out:
//!
//! - [`ReceiveError`]: what went wrong while draining a reply stream.
//! - [`TransportError`]: a failed send or a failed receive for one request.
//! - [`Error`]: everything a caller can see, including opening the socket and
//!   invalid configuration ([`ContractError`]).
//!
//! Decoder skips are not errors; see `sockdiag::SkipReason`.

use std::io;

/// Result type for socket diagnostics operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during socket diagnostics operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The diagnostics socket could not be created or configured.
    #[error("cannot open diagnostics socket: {0}")]
    Open(#[source] io::Error),

    /// The caller asked for something this crate cannot do.
    #[error(transparent)]
    Contract(#[from] ContractError),

    /// A request could not be sent or its replies could not be read.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl Error {
    /// Get the errno value, if the failure carries one.
    pub fn errno(&self) -> Option<i32> {
        match self {
            Self::Open(e) => e.raw_os_error(),
            Self::Transport(e) => e.errno(),
            Self::Contract(_) => None,
        }
    }

    /// Check if this is a permission error (EPERM, EACCES).
    pub fn is_permission_denied(&self) -> bool {
        matches!(self.errno(), Some(libc::EPERM) | Some(libc::EACCES))
    }
}

/// Invalid input from the caller. Fatal to the call, never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContractError {
    /// Only AF_INET and AF_INET6 can be requested.
    #[error("unsupported address family: {0}")]
    UnsupportedFamily(u8),

    /// A state mask of zero would match no sockets at all.
    #[error("state mask selects no TCP states")]
    EmptyStateMask,

    /// The receive buffer is smaller than a kernel dump datagram.
    #[error("receive buffer too small: requested {requested} bytes, need at least {minimum}")]
    BufferTooSmall {
        /// Requested size.
        requested: usize,
        /// Smallest usable size.
        minimum: usize,
    },
}

/// I/O failure for one request/reply exchange.
///
/// Surfaced to the caller without retry; it only affects the address family
/// whose exchange failed.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The request could not be transmitted.
    #[error("failed to send diagnostics request: {0}")]
    Send(#[source] io::Error),

    /// The reply stream could not be read to its end.
    #[error("failed to receive diagnostics reply: {0}")]
    Receive(#[from] ReceiveError),
}

impl TransportError {
    /// Get the errno value, if the failure carries one.
    pub fn errno(&self) -> Option<i32> {
        match self {
            Self::Send(e) => e.raw_os_error(),
            Self::Receive(e) => e.errno(),
        }
    }

    /// Check if this failure happened while sending.
    pub fn is_send(&self) -> bool {
        matches!(self, Self::Send(_))
    }

    /// Check if this failure happened while receiving.
    pub fn is_receive(&self) -> bool {
        matches!(self, Self::Receive(_))
    }
}

/// Failure while draining a reply stream.
#[derive(Debug, thiserror::Error)]
pub enum ReceiveError {
    /// Reading from the socket failed (includes timeouts and interrupts).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The socket returned end-of-file before the stream ended.
    #[error("socket closed before end of dump")]
    Closed,

    /// Kernel answered the request with an error.
    #[error("kernel error: {message} (errno {errno})")]
    Kernel {
        /// The errno value from the kernel (positive).
        errno: i32,
        /// Human-readable error message.
        message: String,
    },

    /// Kernel dropped replies because the receive buffer overflowed.
    #[error("kernel reported message overrun")]
    Overrun,

    /// Message or datagram was truncated.
    #[error("message truncated: expected {expected} bytes, got {actual}")]
    Truncated {
        /// Expected message length.
        expected: usize,
        /// Actual bytes received.
        actual: usize,
    },

    /// Invalid message framing.
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}

impl ReceiveError {
    /// Create a kernel error from the errno in an NLMSG_ERROR.
    ///
    /// The kernel sends it negated; either sign yields a positive errno.
    pub fn from_errno(errno: i32) -> Self {
        let errno = i32::try_from(errno.unsigned_abs()).unwrap_or(i32::MAX);
        let message = io::Error::from_raw_os_error(errno).to_string();
        Self::Kernel { errno, message }
    }

    /// Get the errno value, if any.
    pub fn errno(&self) -> Option<i32> {
        match self {
            Self::Io(e) => e.raw_os_error(),
            Self::Kernel { errno, .. } => Some(*errno),
            _ => None,
        }
    }

    /// Check if the read gave up because of `SO_RCVTIMEO`.
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}
