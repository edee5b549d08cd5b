//! Poll cycles against an in-memory kernel.

use std::net::{IpAddr, Ipv4Addr};
use std::ops::ControlFlow;
use std::sync::mpsc;
use std::thread;

use crate::common::{FakeKernel, FakeSocket};
use tcpdiag::sockdiag::MIN_RECV_BUFFER;
use tcpdiag::{
    AddressFamily, ConnectionRecord, DiagSocket, Error, PollConfig, PollPhase, Poller,
    ReceiveError, SkipReason, StreamEnd, TcpState, TransportError,
};

fn poller(kernel: FakeKernel) -> Poller<FakeKernel> {
    poller_with(kernel, PollConfig::default())
}

fn poller_with(kernel: FakeKernel, config: PollConfig) -> Poller<FakeKernel> {
    Poller::with_socket(DiagSocket::with_transport(kernel), config).unwrap()
}

fn host() -> Vec<FakeSocket> {
    vec![
        FakeSocket::v4("0.0.0.0:22", "0.0.0.0:0")
            .state(TcpState::Listen)
            .inode(1001),
        FakeSocket::v4("10.0.0.5:22", "10.0.0.99:51000")
            .uid(0)
            .inode(1002),
        FakeSocket::v4("10.0.0.5:48210", "93.184.216.34:443")
            .uid(1000)
            .inode(1003),
        FakeSocket::v4("127.0.0.1:5432", "127.0.0.1:40112")
            .state(TcpState::TimeWait)
            .uid(70)
            .inode(0),
        FakeSocket::v6("[::]:80", "[::]:0")
            .state(TcpState::Listen)
            .inode(2001),
        FakeSocket::v6("[2001:db8::1]:443", "[2001:db8::2]:60000")
            .uid(33)
            .inode(2002),
    ]
}

// ============================================================================
// Full poll cycles
// ============================================================================

#[test]
fn test_poll_reports_ipv4_connections() {
    let mut p = poller(FakeKernel::new(host()));
    let (records, report) = p.snapshot();

    assert!(report.is_success());
    assert_eq!(records.len(), 4);
    assert_eq!(report.total_emitted(), 4);
    assert_eq!(report.total_skipped(), 2);

    let inodes: Vec<_> = records.iter().map(|r| r.inode).collect();
    assert_eq!(inodes, vec![1001, 1002, 1003, 0]);

    let outbound = &records[2];
    assert_eq!(outbound.uid, 1000);
    assert_eq!(outbound.local, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)));
    assert_eq!(outbound.local_port, 48210);
    assert_eq!(outbound.remote_addr(), "93.184.216.34:443".parse().unwrap());
    assert!(outbound.is_established());
    assert!(records[0].is_listening());
    assert_eq!(records[3].state, TcpState::TimeWait);
}

#[test]
fn test_families_requested_in_order() {
    let mut p = poller(FakeKernel::new(host()));
    p.poll_once(&mut |_: &ConnectionRecord| {});

    let kernel = p.socket().transport();
    assert_eq!(kernel.requests.len(), 2);
    assert_eq!(kernel.request(0), (libc::AF_INET as u8, TcpState::ALL_MASK));
    assert_eq!(kernel.request(1), (libc::AF_INET6 as u8, TcpState::ALL_MASK));
}

#[test]
fn test_state_mask_reaches_kernel() {
    let config = PollConfig::new().states(TcpState::Listen.mask());
    let mut p = poller_with(FakeKernel::new(host()), config);
    let (records, report) = p.snapshot();

    assert!(report.is_success());
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].inode, 1001);
    assert_eq!(report.outcome(AddressFamily::Inet6).unwrap().skipped, 1);
}

#[test]
fn test_ipv4_only() {
    let config = PollConfig::new().families([AddressFamily::Inet]);
    let mut p = poller_with(FakeKernel::new(host()), config);
    let (records, report) = p.snapshot();

    assert_eq!(report.outcomes().len(), 1);
    assert_eq!(records.len(), 4);
    assert_eq!(p.socket().transport().requests.len(), 1);
}

#[test]
fn test_stream_across_many_datagrams() {
    let sockets: Vec<_> = (0..50u16)
        .map(|i| {
            FakeSocket::v4(&format!("10.1.0.1:{}", 30000 + i), "10.1.0.2:443")
                .inode(u32::from(i))
        })
        .collect();
    let mut p = poller(FakeKernel::new(sockets).per_datagram(3));
    let (records, report) = p.snapshot();

    assert!(report.is_success());
    assert_eq!(records.len(), 50);
    for (i, r) in records.iter().enumerate() {
        assert_eq!(r.inode, i as u32);
        assert_eq!(r.local_port, 30000 + i as u16);
    }
}

#[test]
fn test_empty_table() {
    let mut p = poller(FakeKernel::new(Vec::new()));
    let (records, report) = p.snapshot();
    assert!(records.is_empty());
    assert!(report.is_success());
    assert_eq!(p.phase(), PollPhase::Idle);
}

// ============================================================================
// Failures stay inside their family
// ============================================================================

#[test]
fn test_refused_ipv4_still_polls_ipv6() {
    let mut p = poller(FakeKernel::new(host()).refuse(AddressFamily::Inet));
    let (records, report) = p.snapshot();

    assert!(records.is_empty());
    assert!(!report.is_success());

    let failures: Vec<_> = report.failures().collect();
    assert_eq!(failures.len(), 1);
    let (family, err) = failures[0];
    assert_eq!(family, AddressFamily::Inet);
    assert!(err.is_send());
    assert_eq!(err.errno(), Some(libc::EPERM));

    let v6 = report.outcome(AddressFamily::Inet6).unwrap();
    assert_eq!(v6.result.as_ref().ok(), Some(&StreamEnd::Done));
    assert_eq!(v6.skipped, 2);

    let err = report.into_result().unwrap_err();
    assert!(matches!(err, Error::Transport(TransportError::Send(_))));
    assert!(err.is_permission_denied());
}

#[test]
fn test_read_failure_keeps_earlier_records() {
    let kernel = FakeKernel::new(host())
        .per_datagram(1)
        .break_after(AddressFamily::Inet, 2, libc::ENOBUFS);
    let mut p = poller(kernel);
    let (records, report) = p.snapshot();

    assert_eq!(records.len(), 2);
    let v4 = report.outcome(AddressFamily::Inet).unwrap();
    assert_eq!(v4.emitted, 2);
    match &v4.result {
        Err(TransportError::Receive(ReceiveError::Io(e))) => {
            assert_eq!(e.raw_os_error(), Some(libc::ENOBUFS))
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert!(report.outcome(AddressFamily::Inet6).unwrap().is_success());
}

fn busy_host() -> Vec<FakeSocket> {
    let mut sockets: Vec<_> = (0..400u16)
        .map(|i| {
            FakeSocket::v4(&format!("0.0.0.0:{}", 20000 + i), "0.0.0.0:0")
                .state(TcpState::Listen)
                .inode(u32::from(i) + 1)
        })
        .collect();
    sockets.push(
        FakeSocket::v6("[::1]:8080", "[::]:0")
            .state(TcpState::Listen)
            .inode(9999),
    );
    sockets
}

#[test]
fn test_interrupted_ipv4_dump_does_not_block_ipv6() {
    let kernel = FakeKernel::new(busy_host())
        .per_datagram(30)
        .break_after(AddressFamily::Inet, 1, libc::EINTR);
    let mut p = poller(kernel);
    let (records, report) = p.snapshot();

    assert_eq!(records.len(), 30);
    let v4 = report.outcome(AddressFamily::Inet).unwrap();
    assert_eq!(v4.result.as_ref().err().and_then(|e| e.errno()), Some(libc::EINTR));

    let v6 = report.outcome(AddressFamily::Inet6).unwrap();
    assert_eq!(v6.result.as_ref().ok(), Some(&StreamEnd::Done));
    assert_eq!(v6.skipped, 1);
    assert!(!p.socket().transport().dump_running());
}

#[test]
fn test_oversized_datagram_fails_its_family() {
    let kernel = FakeKernel::new(busy_host()).per_datagram(100);
    let config = PollConfig::new().recv_buffer_size(MIN_RECV_BUFFER);
    let mut p = poller_with(kernel, config);
    let (records, report) = p.snapshot();

    assert!(records.is_empty());
    assert!(!report.is_success());
    let v4 = report.outcome(AddressFamily::Inet).unwrap();
    assert!(matches!(
        v4.result,
        Err(TransportError::Receive(ReceiveError::Truncated { .. }))
    ));
    assert!(report.outcome(AddressFamily::Inet6).unwrap().is_success());
}

#[test]
fn test_small_buffers_rejected() {
    let config = PollConfig::new().recv_buffer_size(1000);
    let err = Poller::with_socket(DiagSocket::with_transport(FakeKernel::new(host())), config)
        .err()
        .unwrap();
    assert!(matches!(err, Error::Contract(_)));
}

#[test]
fn test_failed_family_does_not_poison_next_cycle() {
    let kernel = FakeKernel::new(host()).break_after(AddressFamily::Inet6, 0, libc::EINTR);
    let mut p = poller(kernel);

    let (_, first) = p.snapshot();
    assert!(!first.is_success());
    assert_eq!(p.phase(), PollPhase::Failed(AddressFamily::Inet6));

    // The injected fault fires on every IPv6 dump; IPv4 is unaffected.
    let (records, second) = p.snapshot();
    assert_eq!(records.len(), 4);
    assert!(second.outcome(AddressFamily::Inet).unwrap().is_success());
}

// ============================================================================
// Sinks
// ============================================================================

#[test]
fn test_channel_sink_across_threads() {
    let (tx, rx) = mpsc::channel::<ConnectionRecord>();
    let handle = thread::spawn(move || {
        let mut tx = tx;
        let mut p = poller(FakeKernel::new(host()));
        p.poll_once(&mut tx).total_emitted()
    });

    let received: Vec<ConnectionRecord> = rx.iter().collect();
    let emitted = handle.join().unwrap();
    assert_eq!(emitted, 4);
    assert_eq!(received.len(), 4);
    assert_eq!(received[1].inode, 1002);
}

#[test]
fn test_records_as_json_lines() {
    let mut p = poller(FakeKernel::new(host()));
    let mut lines = Vec::new();
    p.poll_once(&mut |r: &ConnectionRecord| {
        lines.push(serde_json::to_string(r).unwrap());
    });

    assert_eq!(lines.len(), 4);
    let first: serde_json::Value = serde_json::from_str(&lines[0]).unwrap();
    assert_eq!(first["local"], "0.0.0.0");
    assert_eq!(first["local_port"], 22);
    assert_eq!(first["state"], "Listen");
}

// ============================================================================
// Driving DiagSocket directly
// ============================================================================

#[test]
fn test_manual_exchange() {
    let mut sock = DiagSocket::with_transport(FakeKernel::new(host()));
    let request = tcpdiag::DiagRequest::new(AddressFamily::Inet6);
    let seq = sock.send_request(&request).unwrap();
    assert_eq!(seq, 1);

    let mut skips = Vec::new();
    let end = sock
        .receive_stream(|msg| {
            if let Err(reason) = tcpdiag::decode_message(&msg) {
                skips.push(reason);
            }
            ControlFlow::Continue(())
        })
        .unwrap();

    assert_eq!(end, StreamEnd::Done);
    assert_eq!(
        skips,
        vec![SkipReason::UnsupportedFamily(AddressFamily::Inet6); 2]
    );
}

#[test]
fn test_manual_exchange_stop_early() {
    let mut sock = DiagSocket::with_transport(FakeKernel::new(host()));
    sock.send(&tcpdiag::encode_request(AddressFamily::Inet))
        .unwrap();

    let mut first = None;
    let end = sock
        .receive_stream(|msg| {
            first = tcpdiag::decode_message(&msg).ok();
            ControlFlow::Break(())
        })
        .unwrap();

    assert_eq!(end, StreamEnd::Stopped);
    assert_eq!(first.map(|r| r.inode), Some(1001));
}
