use std::sync::Arc;

/// Opaque binary block. Shared so that a peek can hand entries to the codec
/// while the retention buffer keeps them.
pub type Payload = Arc<[u8]>;

/// One timestamped payload stored in a topic.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub payload: Payload,
    /// Seconds on the producer's synchronized timeline.
    pub timestamp: f64,
}

impl Entry {
    pub fn new(payload: impl Into<Payload>, timestamp: f64) -> Self {
        Self {
            payload: payload.into(),
            timestamp,
        }
    }
}

/// Splits entries into parallel `(payloads, timestamps)` vectors.
pub fn unzip_entries(entries: Vec<Entry>) -> (Vec<Payload>, Vec<f64>) {
    entries
        .into_iter()
        .map(|entry| (entry.payload, entry.timestamp))
        .unzip()
}
