use std::fmt::Display;
use std::fmt::Formatter;

use serde::Deserialize;
use serde::Serialize;

/// The identity of a log entry: its term and its index within the log.
///
/// `LogId` derives a total order: entries compare first by term, then by index, which is the
/// "at least as up-to-date" comparison used when granting votes (§5.4.1).
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogId {
    pub term: u64,
    pub index: u64,
}

impl Display for LogId {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "{}-{}", self.term, self.index)
    }
}

impl LogId {
    pub fn new(term: u64, index: u64) -> Self {
        LogId { term, index }
    }
}

/// An identifier of a snapshot.
///
/// Two snapshots built over the same `last_log_id` may still differ in bytes, thus every built
/// snapshot gets a fresh id to key chunked transfers by.
pub type SnapshotId = String;

/// The identity of a segment of a snapshot stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotSegmentId {
    pub id: SnapshotId,
    pub offset: u64,
}

impl<D: ToString> From<(D, u64)> for SnapshotSegmentId {
    fn from(v: (D, u64)) -> Self {
        SnapshotSegmentId {
            id: v.0.to_string(),
            offset: v.1,
        }
    }
}

impl Display for SnapshotSegmentId {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "{}+{}", self.id, self.offset)
    }
}

/// A summary of a message, for compact logging.
pub trait MessageSummary {
    /// Return a string of a big message
    fn summary(&self) -> String;
}

#[cfg(test)]
mod tests {
    use super::LogId;

    #[test]
    fn test_log_id_ordering() {
        // A higher term always wins, regardless of index.
        assert!(LogId::new(2, 1) > LogId::new(1, 100));
        // Within a term, a longer log wins.
        assert!(LogId::new(2, 5) > LogId::new(2, 4));
        assert_eq!(LogId::new(3, 7), LogId::new(3, 7));
    }
}
