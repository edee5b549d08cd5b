//! Netlink message header and framing.

use super::error::ReceiveError;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Netlink message header alignment.
pub const NLMSG_ALIGNTO: usize = 4;

/// Align a length to NLMSG_ALIGNTO boundary.
#[inline]
pub const fn nlmsg_align(len: usize) -> usize {
    (len + NLMSG_ALIGNTO - 1) & !(NLMSG_ALIGNTO - 1)
}

/// Size of the netlink message header.
pub const NLMSG_HDRLEN: usize = nlmsg_align(std::mem::size_of::<NlMsgHdr>());

/// Netlink message header (mirrors struct nlmsghdr).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct NlMsgHdr {
    /// Length of message including header.
    pub nlmsg_len: u32,
    /// Message type.
    pub nlmsg_type: u16,
    /// Additional flags.
    pub nlmsg_flags: u16,
    /// Sequence number.
    pub nlmsg_seq: u32,
    /// Sending process port ID.
    pub nlmsg_pid: u32,
}

const _: () = assert!(std::mem::size_of::<NlMsgHdr>() == 16);

impl NlMsgHdr {
    /// Create a new message header.
    pub fn new(msg_type: u16, flags: u16) -> Self {
        Self {
            nlmsg_len: NLMSG_HDRLEN as u32,
            nlmsg_type: msg_type,
            nlmsg_flags: flags,
            nlmsg_seq: 0,
            nlmsg_pid: 0,
        }
    }

    /// Get the payload length (total length minus header).
    pub fn payload_len(&self) -> usize {
        (self.nlmsg_len as usize).saturating_sub(NLMSG_HDRLEN)
    }

    /// Check if this is an error message (or ACK).
    pub fn is_error(&self) -> bool {
        self.nlmsg_type == NlMsgType::ERROR
    }

    /// Check if this is a done message.
    pub fn is_done(&self) -> bool {
        self.nlmsg_type == NlMsgType::DONE
    }

    /// Check if this is a no-op message.
    pub fn is_noop(&self) -> bool {
        self.nlmsg_type == NlMsgType::NOOP
    }

    /// Check if the kernel reported lost data.
    pub fn is_overrun(&self) -> bool {
        self.nlmsg_type == NlMsgType::OVERRUN
    }

    /// Check if this message has the multi flag.
    pub fn is_multi(&self) -> bool {
        self.nlmsg_flags & NLM_F_MULTI != 0
    }

    /// Check if the dump this message belongs to was interrupted
    /// (the socket table changed while the kernel was walking it).
    pub fn is_dump_interrupted(&self) -> bool {
        self.nlmsg_flags & NLM_F_DUMP_INTR != 0
    }

    /// Convert header to bytes.
    pub fn as_bytes(&self) -> &[u8] {
        <Self as IntoBytes>::as_bytes(self)
    }

    /// Parse header from the front of a buffer.
    ///
    /// The header is copied out, so the buffer does not need to be aligned.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ReceiveError> {
        Self::read_from_prefix(data)
            .map(|(h, _)| h)
            .map_err(|_| ReceiveError::Truncated {
                expected: std::mem::size_of::<Self>(),
                actual: data.len(),
            })
    }
}

/// Standard netlink message types, plus the socket diagnostics ones.
pub struct NlMsgType;

impl NlMsgType {
    /// No operation, message must be discarded.
    pub const NOOP: u16 = 1;
    /// Error message or ACK.
    pub const ERROR: u16 = 2;
    /// End of multipart message.
    pub const DONE: u16 = 3;
    /// Data lost, request resend.
    pub const OVERRUN: u16 = 4;

    /// Legacy inet_diag request/reply type (linux/inet_diag.h).
    pub const TCPDIAG_GETSOCK: u16 = 18;
    /// Family-dispatched socket diagnostics (linux/sock_diag.h).
    pub const SOCK_DIAG_BY_FAMILY: u16 = 20;
}

/// Netlink message flags.
pub const NLM_F_REQUEST: u16 = 0x01;
pub const NLM_F_MULTI: u16 = 0x02;
pub const NLM_F_ACK: u16 = 0x04;
pub const NLM_F_DUMP_INTR: u16 = 0x10;

// Modifiers to GET request
pub const NLM_F_ROOT: u16 = 0x100;
pub const NLM_F_MATCH: u16 = 0x200;
pub const NLM_F_DUMP: u16 = NLM_F_ROOT | NLM_F_MATCH;

/// One message inside a received datagram.
///
/// Borrows the receive buffer, so a `RawMessage` cannot outlive the
/// receive loop that produced it.
#[derive(Debug, Clone, Copy)]
pub struct RawMessage<'a> {
    /// The message header.
    pub header: NlMsgHdr,
    /// Bytes following the header, up to `nlmsg_len`.
    pub payload: &'a [u8],
}

impl<'a> RawMessage<'a> {
    /// Parse a single message from the front of `data`.
    pub fn parse(data: &'a [u8]) -> Result<Self, ReceiveError> {
        MessageIter::new(data)
            .next()
            .unwrap_or(Err(ReceiveError::Truncated {
                expected: NLMSG_HDRLEN,
                actual: data.len(),
            }))
    }

    /// Message type from the header.
    pub fn msg_type(&self) -> u16 {
        self.header.nlmsg_type
    }
}

/// Iterator over netlink messages in a buffer.
pub struct MessageIter<'a> {
    data: &'a [u8],
}

impl<'a> MessageIter<'a> {
    /// Create a new message iterator.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }
}

impl<'a> Iterator for MessageIter<'a> {
    type Item = Result<RawMessage<'a>, ReceiveError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.is_empty() {
            return None;
        }
        if self.data.len() < NLMSG_HDRLEN {
            // A cut-off header: the datagram was truncated.
            let actual = self.data.len();
            self.data = &[];
            return Some(Err(ReceiveError::Truncated {
                expected: NLMSG_HDRLEN,
                actual,
            }));
        }

        let header = match NlMsgHdr::from_bytes(self.data) {
            Ok(h) => h,
            Err(e) => {
                self.data = &[];
                return Some(Err(e));
            }
        };

        let msg_len = header.nlmsg_len as usize;
        if msg_len < NLMSG_HDRLEN || msg_len > self.data.len() {
            let remaining = self.data.len();
            // Framing is lost; nothing after this point can be trusted.
            self.data = &[];
            return Some(Err(ReceiveError::InvalidMessage(format!(
                "invalid message length {} with {} bytes remaining",
                msg_len, remaining
            ))));
        }

        let payload = &self.data[NLMSG_HDRLEN..msg_len];
        let aligned_len = nlmsg_align(msg_len);

        // Move to next message
        if aligned_len >= self.data.len() {
            self.data = &[];
        } else {
            self.data = &self.data[aligned_len..];
        }

        Some(Ok(RawMessage { header, payload }))
    }
}

/// Netlink error message payload.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, Immutable, KnownLayout)]
pub struct NlMsgError {
    /// Error code (negative errno or 0 for ACK).
    pub error: i32,
    /// Original message header that caused the error.
    pub msg: NlMsgHdr,
}

impl NlMsgError {
    /// Parse error message from payload.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ReceiveError> {
        Self::read_from_prefix(data)
            .map(|(e, _)| e)
            .map_err(|_| ReceiveError::Truncated {
                expected: std::mem::size_of::<Self>(),
                actual: data.len(),
            })
    }

    /// Check if this is an ACK (no error).
    pub fn is_ack(&self) -> bool {
        self.error == 0
    }
}
