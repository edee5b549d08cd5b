//! Request/reply exchange over a diagnostics socket.

use std::io;
use std::ops::ControlFlow;
use std::os::unix::io::{AsRawFd, RawFd};

use bytes::BytesMut;
use tracing::{debug, trace, warn};

use super::codec::DiagRequest;
use super::poller::PollConfig;
use crate::netlink::{
    ContractError, Error, MessageIter, NetlinkTransport, NlMsgError, NlMsgHdr, NlMsgType,
    RawMessage, ReceiveError, Result, Transport, TransportError,
};

/// Default receive buffer size (32 KiB).
pub const DEFAULT_RECV_BUFFER: usize = 32 * 1024;

/// Smallest receive buffer accepted (8 KiB).
///
/// The kernel fills dump datagrams up to the larger of `NLMSG_GOODSIZE`
/// (at most 8 KiB) and the reader's own buffer, so anything smaller would
/// truncate every full datagram.
pub const MIN_RECV_BUFFER: usize = 8 * 1024;

/// How a reply stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// `NLMSG_DONE` was received.
    Done,
    /// The kernel acknowledged the request without a dump.
    Acked,
    /// The message callback asked to stop.
    Stopped,
}

/// A diagnostics socket with sequence tracking and a reusable receive buffer.
///
/// One request may be in flight at a time: [`send`](Self::send) a request,
/// then read its replies with [`receive_stream`](Self::receive_stream).
/// If a stream is abandoned before its end (the callback stopped it or a
/// read failed), the next [`send`](Self::send) first discards what is left
/// of it, since the kernel refuses a new dump on a socket whose previous
/// dump is unfinished.
pub struct DiagSocket<T: Transport = NetlinkTransport> {
    transport: T,
    seq: u32,
    expected_seq: u32,
    in_flight: bool,
    buf: BytesMut,
    buf_size: usize,
}

impl DiagSocket<NetlinkTransport> {
    /// Open a `NETLINK_SOCK_DIAG` socket with default settings.
    pub fn open() -> Result<Self> {
        Self::open_with(&PollConfig::default())
    }

    /// Open a `NETLINK_SOCK_DIAG` socket configured from `config`.
    pub fn open_with(config: &PollConfig) -> Result<Self> {
        config.validate()?;

        let mut transport = NetlinkTransport::new().map_err(Error::Open)?;
        if let Some(size) = config.socket_receive_buffer {
            transport.set_receive_buffer(size).map_err(Error::Open)?;
        }
        if config.receive_timeout.is_some() {
            transport
                .set_receive_timeout(config.receive_timeout)
                .map_err(Error::Open)?;
        }
        debug!(pid = transport.pid(), "opened sock_diag socket");

        Ok(Self::with_transport(transport).with_buffer_size(config.recv_buffer_size)?)
    }
}

impl<T: Transport> DiagSocket<T> {
    /// Wrap an existing transport.
    pub fn with_transport(transport: T) -> Self {
        Self {
            transport,
            seq: 1,
            expected_seq: 0,
            in_flight: false,
            buf: BytesMut::with_capacity(DEFAULT_RECV_BUFFER),
            buf_size: DEFAULT_RECV_BUFFER,
        }
    }

    /// Set the size of the buffer each datagram is received into.
    pub fn with_buffer_size(mut self, size: usize) -> std::result::Result<Self, ContractError> {
        if size < MIN_RECV_BUFFER {
            return Err(ContractError::BufferTooSmall {
                requested: size,
                minimum: MIN_RECV_BUFFER,
            });
        }
        self.buf_size = size;
        self.buf = BytesMut::with_capacity(size);
        Ok(self)
    }

    /// Get the next sequence number.
    pub fn next_seq(&mut self) -> u32 {
        let seq = self.seq;
        self.seq = self.seq.wrapping_add(1).max(1);
        seq
    }

    /// Local port ID of the underlying transport.
    pub fn pid(&self) -> u32 {
        self.transport.pid()
    }

    /// Receive buffer size.
    pub fn buffer_size(&self) -> usize {
        self.buf_size
    }

    /// Get a reference to the transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Get a mutable reference to the transport.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Consume the socket and return the transport.
    pub fn into_inner(self) -> T {
        self.transport
    }

    /// Check if the last request's reply stream has not been read to its end.
    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    /// Send one complete netlink message.
    ///
    /// The message's sequence number becomes the one replies are matched
    /// against. A message too short to carry a header is sent unmatched.
    ///
    /// An unfinished reply stream from the previous request is drained
    /// first; if that fails, the receive error is returned and nothing is
    /// sent.
    pub fn send(&mut self, msg: &[u8]) -> std::result::Result<(), TransportError> {
        self.drain()?;

        self.expected_seq = NlMsgHdr::from_bytes(msg)
            .map(|h| h.nlmsg_seq)
            .unwrap_or(0);
        self.transport.send(msg).map_err(TransportError::Send)?;
        self.in_flight = true;
        Ok(())
    }

    /// Stamp `request` with the next sequence number and send it.
    ///
    /// Returns the sequence number used.
    pub fn send_request(
        &mut self,
        request: &DiagRequest,
    ) -> std::result::Result<u32, TransportError> {
        let seq = self.next_seq();
        self.send(&request.encode(seq))?;
        Ok(seq)
    }

    /// Read the reply stream of the last request.
    ///
    /// Every reply message belonging to the request is handed to
    /// `on_message`, in arrival order, until the stream ends. Control
    /// messages (`NLMSG_NOOP`, `NLMSG_DONE`, `NLMSG_ERROR`, `NLMSG_OVERRUN`)
    /// are handled here and never reach the callback.
    ///
    /// A datagram larger than the receive buffer fails the stream with
    /// [`ReceiveError::Truncated`].
    pub fn receive_stream<F>(
        &mut self,
        mut on_message: F,
    ) -> std::result::Result<StreamEnd, TransportError>
    where
        F: FnMut(RawMessage<'_>) -> ControlFlow<()>,
    {
        let result = self.read_stream(false, &mut on_message);
        self.settle(&result);
        result
    }

    /// Read and discard the rest of an unfinished reply stream.
    ///
    /// Does nothing when the last stream was read to its end. Truncated
    /// datagrams are tolerated here, since their content is thrown away.
    pub fn drain(&mut self) -> std::result::Result<(), TransportError> {
        if !self.in_flight {
            return Ok(());
        }
        debug!(seq = self.expected_seq, "draining unfinished reply stream");

        loop {
            let result = self.read_stream(true, &mut |_| ControlFlow::Continue(()));
            self.settle(&result);
            match result {
                Ok(_) | Err(TransportError::Receive(ReceiveError::Kernel { .. })) => return Ok(()),
                Err(TransportError::Receive(ReceiveError::Io(e)))
                    if e.kind() == io::ErrorKind::Interrupted =>
                {
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    // Only the kernel ends a stream; stopping early or a failed read leaves it owed.
    fn settle(&mut self, result: &std::result::Result<StreamEnd, TransportError>) {
        if matches!(
            result,
            Ok(StreamEnd::Done | StreamEnd::Acked)
                | Err(TransportError::Receive(ReceiveError::Kernel { .. }))
        ) {
            self.in_flight = false;
        }
    }

    fn read_stream(
        &mut self,
        discard: bool,
        on_message: &mut dyn FnMut(RawMessage<'_>) -> ControlFlow<()>,
    ) -> std::result::Result<StreamEnd, TransportError> {
        let expected = self.expected_seq;
        let mut interrupted = false;

        loop {
            self.buf.clear();
            self.buf.reserve(self.buf_size);

            let len = self
                .transport
                .recv(&mut self.buf)
                .map_err(ReceiveError::Io)?;
            if len == 0 {
                return Err(ReceiveError::Closed.into());
            }
            let received = self.buf.len();
            trace!(len, received, "received datagram");

            if len > received && !discard {
                warn!(len, received, "datagram larger than receive buffer");
                return Err(ReceiveError::Truncated {
                    expected: len,
                    actual: received,
                }
                .into());
            }

            for result in MessageIter::new(&self.buf[..]) {
                let msg = match result {
                    Ok(msg) => msg,
                    // Only the framing of a discarded datagram is lost.
                    Err(_) if discard => break,
                    Err(e) => return Err(e.into()),
                };
                let header = msg.header;

                if expected != 0 && header.nlmsg_seq != expected {
                    trace!(
                        seq = header.nlmsg_seq,
                        expected, "skipping reply to another request"
                    );
                    continue;
                }

                match header.nlmsg_type {
                    NlMsgType::NOOP => continue,
                    NlMsgType::DONE => return Ok(StreamEnd::Done),
                    NlMsgType::ERROR => {
                        let err = NlMsgError::from_bytes(msg.payload)?;
                        if err.is_ack() {
                            return Ok(StreamEnd::Acked);
                        }
                        return Err(ReceiveError::from_errno(err.error).into());
                    }
                    NlMsgType::OVERRUN => return Err(ReceiveError::Overrun.into()),
                    _ => {}
                }

                if header.is_dump_interrupted() && !interrupted {
                    interrupted = true;
                    warn!(seq = expected, "dump interrupted, results may be inconsistent");
                }

                if on_message(msg).is_break() {
                    return Ok(StreamEnd::Stopped);
                }
            }
        }
    }
}

impl AsRawFd for DiagSocket<NetlinkTransport> {
    fn as_raw_fd(&self) -> RawFd {
        self.transport.as_raw_fd()
    }
}
