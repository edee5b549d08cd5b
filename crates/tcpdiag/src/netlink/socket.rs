//! Blocking netlink socket for the socket diagnostics protocol.
//!
//! The [`Transport`] trait is the only place the protocol engine touches the
//! kernel. [`NetlinkTransport`] is the real thing; anything else that can move
//! whole datagrams (a replayed capture, a test script) can stand in for it.

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use bytes::BytesMut;
use netlink_sys::{Socket, protocols};

/// Moves whole netlink datagrams to and from the kernel.
pub trait Transport {
    /// Send one datagram. Must send all of `msg` or fail.
    fn send(&mut self, msg: &[u8]) -> io::Result<()>;

    /// Receive one datagram, appending as much of it as fits in the spare
    /// capacity of `buf`.
    ///
    /// Returns the full length of the datagram, which is larger than the
    /// bytes appended when it did not fit (`MSG_TRUNC` semantics). `Ok(0)`
    /// means the peer is gone.
    fn recv(&mut self, buf: &mut BytesMut) -> io::Result<usize>;

    /// Local port ID, if the transport has one.
    fn pid(&self) -> u32 {
        0
    }
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn send(&mut self, msg: &[u8]) -> io::Result<()> {
        (**self).send(msg)
    }

    fn recv(&mut self, buf: &mut BytesMut) -> io::Result<usize> {
        (**self).recv(buf)
    }

    fn pid(&self) -> u32 {
        (**self).pid()
    }
}

/// Blocking `NETLINK_SOCK_DIAG` socket.
///
/// The descriptor is owned by the inner [`netlink_sys::Socket`] and closed
/// when this value is dropped.
pub struct NetlinkTransport {
    socket: Socket,
    pid: u32,
}

impl NetlinkTransport {
    /// Create and bind a new socket diagnostics socket.
    pub fn new() -> io::Result<Self> {
        let mut socket = Socket::new(protocols::NETLINK_SOCK_DIAG)?;
        // Kernel assigns the port ID.
        let addr = socket.bind_auto()?;
        let pid = addr.port_number();

        Ok(Self { socket, pid })
    }

    /// Set `SO_RCVBUF` on the socket.
    pub fn set_receive_buffer(&mut self, size: usize) -> io::Result<()> {
        self.socket.set_rx_buf_sz(size)
    }

    /// Set `SO_RCVTIMEO` on the socket. `None` blocks forever.
    pub fn set_receive_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        let tv = match timeout {
            Some(d) => libc::timeval {
                tv_sec: d.as_secs() as libc::time_t,
                tv_usec: d.subsec_micros() as libc::suseconds_t,
            },
            None => libc::timeval {
                tv_sec: 0,
                tv_usec: 0,
            },
        };

        // SAFETY: the descriptor is owned by `self.socket` and open for the
        // lifetime of `self`. `tv` is a valid timeval and the length passed
        // matches its size.
        let ret = unsafe {
            libc::setsockopt(
                self.socket.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &tv as *const libc::timeval as *const libc::c_void,
                std::mem::size_of::<libc::timeval>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Transport for NetlinkTransport {
    fn send(&mut self, msg: &[u8]) -> io::Result<()> {
        let sent = self.socket.send(msg, 0)?;
        if sent != msg.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short send: {} of {} bytes", sent, msg.len()),
            ));
        }
        Ok(())
    }

    fn recv(&mut self, buf: &mut BytesMut) -> io::Result<usize> {
        // The kernel reports the real datagram length; netlink-sys only
        // advances `buf` by what was copied.
        self.socket.recv(buf, libc::MSG_TRUNC)
    }

    fn pid(&self) -> u32 {
        self.pid
    }
}

impl AsRawFd for NetlinkTransport {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}
