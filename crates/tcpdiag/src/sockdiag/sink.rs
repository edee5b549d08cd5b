//! Where decoded connection records go.

use std::sync::mpsc;

use tracing::debug;

use super::record::ConnectionRecord;

/// Receives each connection record as it is decoded.
///
/// `emit` cannot fail: the poller keeps draining the reply stream whatever
/// the sink does with a record.
pub trait Sink {
    /// Accept one record.
    fn emit(&mut self, record: &ConnectionRecord);
}

impl<F> Sink for F
where
    F: FnMut(&ConnectionRecord),
{
    fn emit(&mut self, record: &ConnectionRecord) {
        self(record)
    }
}

impl Sink for Vec<ConnectionRecord> {
    fn emit(&mut self, record: &ConnectionRecord) {
        self.push(*record);
    }
}

impl Sink for mpsc::Sender<ConnectionRecord> {
    fn emit(&mut self, record: &ConnectionRecord) {
        if self.send(*record).is_err() {
            debug!(inode = record.inode, "record receiver hung up, dropping record");
        }
    }
}
