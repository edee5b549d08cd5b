//! `inet_diag` wire format.
//!
//! Requests are `nlmsghdr` + `inet_diag_req_v2`; replies are `nlmsghdr` +
//! `inet_diag_msg` (+ attributes we do not read). All layouts follow
//! linux/inet_diag.h. Ports and addresses in `inet_diag_sockid` are in network
//! byte order; everything else is host order.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::record::ConnectionRecord;
use super::types::{AddressFamily, TcpState};
use crate::netlink::message::{NLM_F_DUMP, NLM_F_REQUEST};
use crate::netlink::{ContractError, MessageBuilder, NLMSG_HDRLEN, NlMsgType, RawMessage};

/// Socket identity (mirrors struct inet_diag_sockid).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct InetDiagSockId {
    /// Source port, big endian.
    pub idiag_sport: [u8; 2],
    /// Destination port, big endian.
    pub idiag_dport: [u8; 2],
    /// Source address; IPv4 uses the first four bytes.
    pub idiag_src: [u8; 16],
    /// Destination address; IPv4 uses the first four bytes.
    pub idiag_dst: [u8; 16],
    /// Interface index.
    pub idiag_if: u32,
    /// Socket cookie.
    pub idiag_cookie: [u32; 2],
}

/// Dump request body (mirrors struct inet_diag_req_v2).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct InetDiagReqV2 {
    pub sdiag_family: u8,
    pub sdiag_protocol: u8,
    pub idiag_ext: u8,
    pub pad: u8,
    pub idiag_states: u32,
    pub id: InetDiagSockId,
}

/// Reply body (mirrors struct inet_diag_msg).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct InetDiagMsg {
    pub idiag_family: u8,
    pub idiag_state: u8,
    pub idiag_timer: u8,
    pub idiag_retrans: u8,
    pub id: InetDiagSockId,
    pub idiag_expires: u32,
    pub idiag_rqueue: u32,
    pub idiag_wqueue: u32,
    pub idiag_uid: u32,
    pub idiag_inode: u32,
}

/// Size of `struct inet_diag_sockid`.
pub const INET_DIAG_SOCKID_LEN: usize = 48;
/// Size of `struct inet_diag_req_v2`.
pub const INET_DIAG_REQ_V2_LEN: usize = 56;
/// Size of `struct inet_diag_msg`.
pub const INET_DIAG_MSG_LEN: usize = 72;
/// Size of a complete encoded request.
pub const REQUEST_LEN: usize = NLMSG_HDRLEN + INET_DIAG_REQ_V2_LEN;

const _: () = assert!(std::mem::size_of::<InetDiagSockId>() == INET_DIAG_SOCKID_LEN);
const _: () = assert!(std::mem::size_of::<InetDiagReqV2>() == INET_DIAG_REQ_V2_LEN);
const _: () = assert!(std::mem::size_of::<InetDiagMsg>() == INET_DIAG_MSG_LEN);

/// Byte offsets inside an `inet_diag_msg` payload.
pub mod offsets {
    pub const FAMILY: usize = 0;
    pub const STATE: usize = 1;
    pub const TIMER: usize = 2;
    pub const RETRANS: usize = 3;
    pub const SPORT: usize = 4;
    pub const DPORT: usize = 6;
    pub const SRC: usize = 8;
    pub const DST: usize = 24;
    pub const IF: usize = 40;
    pub const COOKIE: usize = 44;
    pub const EXPIRES: usize = 52;
    pub const RQUEUE: usize = 56;
    pub const WQUEUE: usize = 60;
    pub const UID: usize = 64;
    pub const INODE: usize = 68;
}

const _: () = assert!(std::mem::offset_of!(InetDiagMsg, idiag_uid) == offsets::UID);
const _: () = assert!(std::mem::offset_of!(InetDiagMsg, idiag_inode) == offsets::INODE);

/// A TCP dump request for one address family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiagRequest {
    family: AddressFamily,
    states: u32,
}

impl DiagRequest {
    /// Request every TCP socket of `family`.
    pub fn new(family: AddressFamily) -> Self {
        Self {
            family,
            states: TcpState::ALL_MASK,
        }
    }

    /// Request every TCP socket of a raw `AF_*` family.
    pub fn for_raw_family(family: u8) -> Result<Self, ContractError> {
        Ok(Self::new(AddressFamily::try_from(family)?))
    }

    /// Restrict the dump to the states in `mask` (see [`TcpState::mask`]).
    pub fn with_states(mut self, mask: u32) -> Result<Self, ContractError> {
        if mask == 0 {
            return Err(ContractError::EmptyStateMask);
        }
        self.states = mask;
        Ok(self)
    }

    /// The family this request asks for.
    pub fn family(&self) -> AddressFamily {
        self.family
    }

    /// The state mask this request asks for.
    pub fn states(&self) -> u32 {
        self.states
    }

    fn body(&self) -> InetDiagReqV2 {
        InetDiagReqV2 {
            sdiag_family: self.family.as_u8(),
            sdiag_protocol: libc::IPPROTO_TCP as u8,
            idiag_ext: 0,
            pad: 0,
            idiag_states: self.states,
            id: InetDiagSockId::default(),
        }
    }

    /// Encode as a complete netlink message carrying sequence number `seq`.
    pub fn encode(&self, seq: u32) -> Vec<u8> {
        let mut builder =
            MessageBuilder::new(NlMsgType::SOCK_DIAG_BY_FAMILY, NLM_F_REQUEST | NLM_F_DUMP);
        builder.append(&self.body());
        builder.set_seq(seq);
        builder.finish()
    }
}

/// Encode an all-states TCP dump request for `family` with sequence number 0.
pub fn encode_request(family: AddressFamily) -> Vec<u8> {
    DiagRequest::new(family).encode(0)
}

/// Why a reply message produced no record.
///
/// These are expected outcomes, not failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// A family we understand but do not extract records for.
    UnsupportedFamily(AddressFamily),
    /// A family value outside IPv4/IPv6.
    UnknownFamily(u8),
    /// Not an inet_diag reply.
    UnexpectedType(u16),
    /// Payload shorter than `inet_diag_msg`.
    Truncated {
        /// Bytes needed.
        expected: usize,
        /// Bytes present.
        actual: usize,
    },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedFamily(family) => write!(f, "unsupported family {}", family),
            Self::UnknownFamily(raw) => write!(f, "unknown family {}", raw),
            Self::UnexpectedType(t) => write!(f, "unexpected message type {}", t),
            Self::Truncated { expected, actual } => {
                write!(f, "truncated reply: expected {} bytes, got {}", expected, actual)
            }
        }
    }
}

/// Decode one reply message into a connection record.
pub fn decode_message(msg: &RawMessage<'_>) -> Result<ConnectionRecord, SkipReason> {
    match msg.msg_type() {
        NlMsgType::SOCK_DIAG_BY_FAMILY | NlMsgType::TCPDIAG_GETSOCK => {}
        other => return Err(SkipReason::UnexpectedType(other)),
    }

    let (diag, _attrs) =
        InetDiagMsg::read_from_prefix(msg.payload).map_err(|_| SkipReason::Truncated {
            expected: INET_DIAG_MSG_LEN,
            actual: msg.payload.len(),
        })?;

    let family = match AddressFamily::from_u8(diag.idiag_family) {
        Some(AddressFamily::Inet) => AddressFamily::Inet,
        Some(other) => return Err(SkipReason::UnsupportedFamily(other)),
        None => return Err(SkipReason::UnknownFamily(diag.idiag_family)),
    };

    Ok(ConnectionRecord {
        uid: diag.idiag_uid,
        inode: diag.idiag_inode,
        family,
        local: IpAddr::V4(ipv4(&diag.id.idiag_src)),
        remote: IpAddr::V4(ipv4(&diag.id.idiag_dst)),
        local_port: u16::from_be_bytes(diag.id.idiag_sport),
        remote_port: u16::from_be_bytes(diag.id.idiag_dport),
        state: TcpState::from_u8(diag.idiag_state),
    })
}

fn ipv4(addr: &[u8; 16]) -> Ipv4Addr {
    Ipv4Addr::new(addr[0], addr[1], addr[2], addr[3])
}
