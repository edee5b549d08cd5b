//! One-shot TCP connection polling.
//!
//! A poll cycle asks the kernel for a dump of every configured address
//! family, one after the other over the same socket, and hands each decoded
//! IPv4 record to a [`Sink`]. Families are independent: a failure while
//! polling one is recorded in the [`PollReport`] and the next family is
//! still polled.

use std::ops::ControlFlow;
use std::time::Duration;

use tracing::{debug, trace, warn};

use super::codec::{DiagRequest, SkipReason, decode_message};
use super::record::ConnectionRecord;
use super::sink::Sink;
use super::socket::{DEFAULT_RECV_BUFFER, DiagSocket, MIN_RECV_BUFFER, StreamEnd};
use super::types::{AddressFamily, TcpState};
use crate::netlink::{ContractError, NetlinkTransport, Result, Transport, TransportError};

/// Settings for a [`Poller`].
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use tcpdiag::{AddressFamily, PollConfig, TcpState};
///
/// let config = PollConfig::new()
///     .families([AddressFamily::Inet])
///     .states(TcpState::combine(&[TcpState::Established, TcpState::Listen]))
///     .receive_timeout(Duration::from_secs(2));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollConfig {
    /// Families to poll, in order.
    pub families: Vec<AddressFamily>,
    /// TCP state mask sent with every request.
    pub states: u32,
    /// Size of the buffer each reply datagram is read into.
    pub recv_buffer_size: usize,
    /// `SO_RCVBUF` for the socket; kernel default when `None`.
    pub socket_receive_buffer: Option<usize>,
    /// `SO_RCVTIMEO` for the socket; blocks forever when `None`.
    pub receive_timeout: Option<Duration>,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            families: AddressFamily::ALL.to_vec(),
            states: TcpState::ALL_MASK,
            recv_buffer_size: DEFAULT_RECV_BUFFER,
            socket_receive_buffer: None,
            receive_timeout: None,
        }
    }
}

impl PollConfig {
    /// Create the default configuration: IPv4 then IPv6, all states.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the families to poll.
    pub fn families(mut self, families: impl IntoIterator<Item = AddressFamily>) -> Self {
        self.families = families.into_iter().collect();
        self
    }

    /// Set the TCP state mask.
    pub fn states(mut self, mask: u32) -> Self {
        self.states = mask;
        self
    }

    /// Set the receive buffer size.
    pub fn recv_buffer_size(mut self, size: usize) -> Self {
        self.recv_buffer_size = size;
        self
    }

    /// Set `SO_RCVBUF`.
    pub fn socket_receive_buffer(mut self, size: usize) -> Self {
        self.socket_receive_buffer = Some(size);
        self
    }

    /// Set `SO_RCVTIMEO`.
    pub fn receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = Some(timeout);
        self
    }

    /// Check the configuration without touching the kernel.
    pub fn validate(&self) -> std::result::Result<(), ContractError> {
        if self.states == 0 {
            return Err(ContractError::EmptyStateMask);
        }
        if self.recv_buffer_size < MIN_RECV_BUFFER {
            return Err(ContractError::BufferTooSmall {
                requested: self.recv_buffer_size,
                minimum: MIN_RECV_BUFFER,
            });
        }
        Ok(())
    }

    fn requests(&self) -> std::result::Result<Vec<DiagRequest>, ContractError> {
        self.families
            .iter()
            .map(|&family| DiagRequest::new(family).with_states(self.states))
            .collect()
    }
}

/// Where the poller is in its per-family request cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollPhase {
    /// No request in flight.
    Idle,
    /// Sending the dump request for a family.
    Requesting(AddressFamily),
    /// Reading the reply stream for a family.
    Draining(AddressFamily),
    /// The exchange for a family failed.
    Failed(AddressFamily),
}

/// Result of polling one address family.
#[derive(Debug)]
pub struct FamilyOutcome {
    /// The family polled.
    pub family: AddressFamily,
    /// Records handed to the sink.
    pub emitted: usize,
    /// Reply messages that produced no record.
    pub skipped: usize,
    /// How the exchange ended.
    pub result: std::result::Result<StreamEnd, TransportError>,
}

impl FamilyOutcome {
    /// Check if the exchange completed.
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Counts for a fully successful poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    /// Families polled.
    pub families: usize,
    /// Records handed to the sink.
    pub emitted: usize,
    /// Reply messages that produced no record.
    pub skipped: usize,
}

/// Per-family results of one poll cycle, in polling order.
#[derive(Debug, Default)]
pub struct PollReport {
    outcomes: Vec<FamilyOutcome>,
}

impl PollReport {
    /// All outcomes, in polling order.
    pub fn outcomes(&self) -> &[FamilyOutcome] {
        &self.outcomes
    }

    /// Outcome for `family`, if it was polled.
    pub fn outcome(&self, family: AddressFamily) -> Option<&FamilyOutcome> {
        self.outcomes.iter().find(|o| o.family == family)
    }

    /// Check if every family was polled without error.
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(FamilyOutcome::is_success)
    }

    /// Families whose exchange failed, with the error.
    pub fn failures(&self) -> impl Iterator<Item = (AddressFamily, &TransportError)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().err().map(|e| (o.family, e)))
    }

    /// Records emitted across all families.
    pub fn total_emitted(&self) -> usize {
        self.outcomes.iter().map(|o| o.emitted).sum()
    }

    /// Messages skipped across all families.
    pub fn total_skipped(&self) -> usize {
        self.outcomes.iter().map(|o| o.skipped).sum()
    }

    /// Collapse into a summary, or the first family's error.
    pub fn into_result(self) -> Result<PollSummary> {
        let mut summary = PollSummary::default();
        for outcome in self.outcomes {
            outcome.result?;
            summary.families += 1;
            summary.emitted += outcome.emitted;
            summary.skipped += outcome.skipped;
        }
        Ok(summary)
    }
}

/// Polls TCP connections over a dedicated diagnostics socket.
///
/// # Example
///
/// ```no_run
/// use tcpdiag::{PollConfig, Poller};
///
/// let mut poller = Poller::new(PollConfig::default())?;
/// let report = poller.poll_once(&mut |record: &tcpdiag::ConnectionRecord| {
///     println!("{} uid={} inode={}", record, record.uid, record.inode);
/// });
/// for (family, err) in report.failures() {
///     eprintln!("{}: {}", family, err);
/// }
/// # Ok::<(), tcpdiag::Error>(())
/// ```
pub struct Poller<T: Transport = NetlinkTransport> {
    socket: DiagSocket<T>,
    config: PollConfig,
    requests: Vec<DiagRequest>,
    phase: PollPhase,
}

impl Poller<NetlinkTransport> {
    /// Open a diagnostics socket and create a poller for it.
    pub fn new(config: PollConfig) -> Result<Self> {
        let socket = DiagSocket::open_with(&config)?;
        Self::with_socket(socket, config)
    }
}

impl<T: Transport> Poller<T> {
    /// Create a poller over an existing socket.
    pub fn with_socket(socket: DiagSocket<T>, config: PollConfig) -> Result<Self> {
        config.validate()?;
        let requests = config.requests()?;
        let socket = socket.with_buffer_size(config.recv_buffer_size)?;

        Ok(Self {
            socket,
            config,
            requests,
            phase: PollPhase::Idle,
        })
    }

    /// The configuration in use.
    pub fn config(&self) -> &PollConfig {
        &self.config
    }

    /// Phase of the last family processed.
    pub fn phase(&self) -> PollPhase {
        self.phase
    }

    /// Get a reference to the underlying socket.
    pub fn socket(&self) -> &DiagSocket<T> {
        &self.socket
    }

    /// Consume the poller and return its socket.
    pub fn into_socket(self) -> DiagSocket<T> {
        self.socket
    }

    /// Run one poll cycle, emitting every IPv4 connection to `sink`.
    ///
    /// Never fails as a whole; per-family errors are in the report.
    pub fn poll_once<S: Sink + ?Sized>(&mut self, sink: &mut S) -> PollReport {
        let mut report = PollReport::default();

        for i in 0..self.requests.len() {
            let request = self.requests[i];
            report.outcomes.push(self.poll_family(&request, sink));
        }

        report
    }

    /// Run one poll cycle and collect the records.
    pub fn snapshot(&mut self) -> (Vec<ConnectionRecord>, PollReport) {
        let mut records: Vec<ConnectionRecord> = Vec::new();
        let report = self.poll_once(&mut records);
        (records, report)
    }

    fn poll_family<S: Sink + ?Sized>(
        &mut self,
        request: &DiagRequest,
        sink: &mut S,
    ) -> FamilyOutcome {
        let family = request.family();
        let mut outcome = FamilyOutcome {
            family,
            emitted: 0,
            skipped: 0,
            result: Ok(StreamEnd::Done),
        };

        self.phase = PollPhase::Requesting(family);
        match self.socket.send_request(request) {
            Ok(seq) => debug!(%family, seq, states = request.states(), "requested dump"),
            Err(e) => {
                debug!(%family, error = %e, "request failed");
                self.phase = PollPhase::Failed(family);
                outcome.result = Err(e);
                return outcome;
            }
        }

        self.phase = PollPhase::Draining(family);
        let emitted = &mut outcome.emitted;
        let skipped = &mut outcome.skipped;
        let result = self.socket.receive_stream(|msg| {
            match decode_message(&msg) {
                Ok(record) => {
                    sink.emit(&record);
                    *emitted += 1;
                }
                Err(SkipReason::UnknownFamily(raw)) => {
                    warn!(%family, raw_family = raw, "skipping reply with unknown address family");
                    *skipped += 1;
                }
                Err(reason) => {
                    trace!(%family, %reason, "skipping reply");
                    *skipped += 1;
                }
            }
            ControlFlow::Continue(())
        });

        match &result {
            Ok(end) => {
                debug!(
                    %family,
                    emitted = outcome.emitted,
                    skipped = outcome.skipped,
                    ?end,
                    "dump complete"
                );
                self.phase = PollPhase::Idle;
            }
            Err(e) => {
                debug!(%family, error = %e, emitted = outcome.emitted, "dump failed");
                self.phase = PollPhase::Failed(family);
            }
        }
        outcome.result = result;
        outcome
    }
}

/// Open a socket, poll once with the default configuration, and close it.
pub fn poll_once<S: Sink + ?Sized>(sink: &mut S) -> Result<PollReport> {
    let mut poller = Poller::new(PollConfig::default())?;
    Ok(poller.poll_once(sink))
}
