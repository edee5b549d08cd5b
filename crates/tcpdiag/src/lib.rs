//! TCP connection polling via Linux socket diagnostics.
//!
//! This crate asks the kernel's `NETLINK_SOCK_DIAG` subsystem for a dump of
//! every TCP socket and turns each reply into a [`ConnectionRecord`]: owning
//! UID, inode, local and remote address and port. It is a point-in-time
//! poller; scheduling, inode-to-process correlation and storage belong to the
//! caller, reached through a [`Sink`].
//!
//! Everything is blocking and single-threaded. A [`Poller`] owns its socket
//! exclusively and runs one request at a time.
//!
//! # Example
//!
//! ```no_run
//! use tcpdiag::ConnectionRecord;
//!
//! let report = tcpdiag::poll_once(&mut |record: &ConnectionRecord| {
//!     println!("{:>6} {:>8} {}", record.uid, record.inode, record);
//! })?;
//! println!("{} connections", report.total_emitted());
//! # Ok::<(), tcpdiag::Error>(())
//! ```
//!
//! # Address families
//!
//! IPv4 and IPv6 are requested separately, IPv4 first. IPv6 replies are
//! received and counted but not yet turned into records.
//!
//! # Logging
//!
//! The crate logs through [`tracing`] and never installs a subscriber.

pub mod netlink;
pub mod sockdiag;


pub use netlink::{ContractError, Error, ReceiveError, Result, Transport, TransportError};
pub use sockdiag::{
    AddressFamily, ConnectionRecord, DiagRequest, DiagSocket, FamilyOutcome, PollConfig,
    PollPhase, PollReport, PollSummary, Poller, SkipReason, Sink, StreamEnd, TcpState,
    decode_message, encode_request, poll_once,
};
