use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::protocol::MessageKind;

/// What a counter is tagged with: one of the four message kinds, or the
/// stream itself failing to read or write.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CounterKind {
    Message(MessageKind),
    ReceiveStreamRequest,
    SendStreamResponse,
}

impl CounterKind {
    const COUNT: usize = 6;

    fn index(self) -> usize {
        match self {
            Self::Message(MessageKind::RequestHeaders) => 0,
            Self::Message(MessageKind::RequestBody) => 1,
            Self::Message(MessageKind::ResponseHeaders) => 2,
            Self::Message(MessageKind::ResponseBody) => 3,
            Self::ReceiveStreamRequest => 4,
            Self::SendStreamResponse => 5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Message(kind) => kind.as_str(),
            Self::ReceiveStreamRequest => "receive_stream_request",
            Self::SendStreamResponse => "send_stream_response",
        }
    }

    fn all() -> [CounterKind; Self::COUNT] {
        [
            Self::Message(MessageKind::RequestHeaders),
            Self::Message(MessageKind::RequestBody),
            Self::Message(MessageKind::ResponseHeaders),
            Self::Message(MessageKind::ResponseBody),
            Self::ReceiveStreamRequest,
            Self::SendStreamResponse,
        ]
    }
}

impl From<MessageKind> for CounterKind {
    fn from(kind: MessageKind) -> Self {
        Self::Message(kind)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub processed: BTreeMap<String, u64>,
    pub failures: BTreeMap<String, u64>,
}

/// Process-wide counters shared by every connection.
#[derive(Debug, Default)]
pub struct ProcessMetrics {
    processed: [AtomicU64; CounterKind::COUNT],
    failures: [AtomicU64; CounterKind::COUNT],
}

impl ProcessMetrics {
    pub fn record_processed(&self, kind: impl Into<CounterKind>) {
        self.processed[kind.into().index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self, kind: impl Into<CounterKind>) {
        self.failures[kind.into().index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn processed(&self, kind: impl Into<CounterKind>) -> u64 {
        self.processed[kind.into().index()].load(Ordering::Relaxed)
    }

    pub fn failures(&self, kind: impl Into<CounterKind>) -> u64 {
        self.failures[kind.into().index()].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut out = MetricsSnapshot::default();
        for kind in CounterKind::all() {
            out.processed
                .insert(kind.as_str().to_string(), self.processed(kind));
            out.failures
                .insert(kind.as_str().to_string(), self.failures(kind));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_tagged_by_kind() {
        let metrics = ProcessMetrics::default();
        metrics.record_processed(MessageKind::RequestBody);
        metrics.record_processed(MessageKind::RequestBody);
        metrics.record_failure(MessageKind::RequestBody);
        metrics.record_failure(CounterKind::ReceiveStreamRequest);

        assert_eq!(metrics.processed(MessageKind::RequestBody), 2);
        assert_eq!(metrics.failures(MessageKind::ResponseBody), 0);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.processed.len(), 6);
        assert_eq!(snapshot.failures["request_body"], 1);
        assert_eq!(snapshot.failures["receive_stream_request"], 1);
        assert_eq!(snapshot.processed["send_stream_response"], 0);
    }
}
