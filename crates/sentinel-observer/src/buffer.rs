//! Bounded per-container log buffer.
//!
//! Single writer (the container's log pump), many readers (anomaly checks,
//! incident context). Readers take snapshot copies; nothing here ever blocks
//! the writer on a reader.

use sentinel_types::LogEntry;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Default retained lines per container.
pub const DEFAULT_LOG_BUFFER_CAPACITY: usize = 2000;

pub struct LogBuffer {
    capacity: usize,
    entries: Mutex<VecDeque<LogEntry>>,
}

impl LogBuffer {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(256))),
        }
    }

    /// Append one line, evicting the oldest first if the buffer is full.
    pub fn push(&self, entry: LogEntry) {
        let mut entries = self.entries.lock().expect("log buffer lock poisoned");
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Copy of the most recent `count` entries, oldest first.
    #[must_use]
    pub fn tail(&self, count: usize) -> Vec<LogEntry> {
        let entries = self.entries.lock().expect("log buffer lock poisoned");
        let skip = entries.len().saturating_sub(count);
        entries.iter().skip(skip).cloned().collect()
    }

    /// The entire buffered history joined with newlines, for incident
    /// context.
    #[must_use]
    pub fn joined(&self) -> String {
        let entries = self.entries.lock().expect("log buffer lock poisoned");
        entries
            .iter()
            .map(|entry| entry.line.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().expect("log buffer lock poisoned").len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_BUFFER_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(n: usize) -> LogEntry {
        LogEntry {
            timestamp: format!("2025-01-01T00:00:{:02}Z", n % 60),
            line: format!("line {n}"),
        }
    }

    #[test]
    fn test_capacity_is_never_exceeded() {
        let buffer = LogBuffer::new(5);
        for n in 0..20 {
            buffer.push(entry(n));
            assert!(buffer.len() <= 5);
        }
        assert_eq!(buffer.len(), 5);
    }

    #[test]
    fn test_eviction_is_oldest_first() {
        let buffer = LogBuffer::new(3);
        for n in 0..5 {
            buffer.push(entry(n));
        }
        let lines: Vec<String> = buffer.tail(10).into_iter().map(|e| e.line).collect();
        assert_eq!(lines, vec!["line 2", "line 3", "line 4"]);
    }

    #[test]
    fn test_tail_returns_most_recent() {
        let buffer = LogBuffer::new(10);
        for n in 0..8 {
            buffer.push(entry(n));
        }
        let lines: Vec<String> = buffer.tail(3).into_iter().map(|e| e.line).collect();
        assert_eq!(lines, vec!["line 5", "line 6", "line 7"]);
    }

    #[test]
    fn test_joined_concatenates_in_order() {
        let buffer = LogBuffer::new(10);
        buffer.push(entry(0));
        buffer.push(entry(1));
        assert_eq!(buffer.joined(), "line 0\nline 1");
        assert!(!buffer.is_empty());
    }
}
