//! TCP socket diagnostics over `NETLINK_SOCK_DIAG`.
//!
//! Layered bottom-up:
//!
//! - [`codec`]: the `inet_diag` request/reply wire format.
//! - [`DiagSocket`]: one request/reply exchange at a time over a [`Transport`].
//! - [`Poller`]: a full poll cycle across address families, feeding a [`Sink`].
//!
//! [`Transport`]: crate::netlink::Transport

pub mod codec;
mod poller;
mod record;
mod sink;
mod socket;
mod types;

pub use codec::{DiagRequest, SkipReason, decode_message, encode_request};
pub use poller::{
    FamilyOutcome, PollConfig, PollPhase, PollReport, PollSummary, Poller, poll_once,
};
pub use record::ConnectionRecord;
pub use sink::Sink;
pub use socket::{DEFAULT_RECV_BUFFER, DiagSocket, MIN_RECV_BUFFER, StreamEnd};
pub use types::{AddressFamily, TcpState};
