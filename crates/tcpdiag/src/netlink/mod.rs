//! Netlink plumbing: framing, request building, the socket and its errors.
//!
//! Nothing in here knows about `inet_diag`; that lives in
//! [`crate::sockdiag`].

mod builder;
mod error;
pub mod message;
mod socket;

pub use builder::MessageBuilder;
pub use error::{ContractError, Error, ReceiveError, Result, TransportError};
pub use message::{MessageIter, NLMSG_HDRLEN, NlMsgError, NlMsgHdr, NlMsgType, RawMessage};
pub use socket::{NetlinkTransport, Transport};
