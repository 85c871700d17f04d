// Log batch
// Ordered in-memory buffer of log events waiting to be appended. The batching
// worker pushes every scanned line here and asks two questions:
// 1. Has the size trigger fired? Lines received since the last flush attempt
//    reached `buffer_lines`.
// 2. What is the next chunk to submit? The head of the batch, cut so one append
//    call stays within the service's per-call event and byte limits.
//
// Events leave the batch only after the service accepted them, so a failed
// append keeps its events at the head for the next attempt.

// Local crates
use crate::log_service::LogEvent;

// External crates
use std::fmt;

/// Maximum number of events in one append call.
pub const MAX_BATCH_EVENTS: usize = 10_000;

/// Maximum encoded size of one append call.
pub const MAX_BATCH_BYTES: usize = 1_048_576;

/// What made the worker flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    /// `buffer_lines` lines arrived since the last attempt.
    BufferFull,
    /// The flush interval elapsed.
    Interval,
    /// Final drain after close.
    Close,
}

impl fmt::Display for FlushReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::BufferFull => "buffer_full",
            Self::Interval => "interval",
            Self::Close => "close",
        })
    }
}

/// Events accepted from the splitter and not yet appended.
#[derive(Debug)]
pub struct LogBatch {
    events: Vec<LogEvent>,
    buffer_lines: usize,
    since_attempt: usize,
}

impl LogBatch {
    /// A batch whose size trigger fires every `buffer_lines` lines (at least one).
    pub fn new(buffer_lines: usize) -> Self {
        Self {
            events: Vec::new(),
            buffer_lines: buffer_lines.max(1),
            since_attempt: 0,
        }
    }

    /// Append `event`; returns `true` when the size trigger fires.
    pub fn push(&mut self, event: LogEvent) -> bool {
        self.events.push(event);
        self.since_attempt += 1;
        self.since_attempt >= self.buffer_lines
    }

    /// Buffered events, including ones kept from a failed flush.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// True when nothing waits to be appended.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Reset the size trigger. Called once per flush, successful or not.
    pub fn begin_attempt(&mut self) {
        self.since_attempt = 0;
    }

    /// Longest prefix of the batch one append call may carry. Never empty
    /// unless the batch is. The splitter keeps every event within
    /// `MAX_EVENT_BYTES`, so one event always fits a call.
    pub fn next_chunk(&self) -> &[LogEvent] {
        let mut bytes = 0;
        let mut count = 0;
        for event in self.events.iter().take(MAX_BATCH_EVENTS) {
            let size = event.encoded_size();
            if count > 0 && bytes + size > MAX_BATCH_BYTES {
                break;
            }
            bytes += size;
            count += 1;
        }
        &self.events[..count]
    }

    /// Drop the first `count` events after the service accepted them.
    pub fn consume(&mut self, count: usize) {
        self.events.drain(..count.min(self.events.len()));
    }
}
