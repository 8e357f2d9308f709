use std::collections::VecDeque;
use std::time::SystemTime;

/// Maximum number of entries kept per keyword.
pub const HISTORY_CAPACITY: usize = 100;

/// One recorded value.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub value: String,
    pub timestamp: SystemTime,
}

/// Bounded ring buffer of past values.
///
/// Timestamps never decrease: an entry stamped earlier than its predecessor
/// (wall clock stepped backwards) takes the predecessor's timestamp.
#[derive(Debug, Clone)]
pub struct History {
    entries: VecDeque<HistoryEntry>,
    capacity: usize,
}

impl Default for History {
    fn default() -> Self {
        Self::with_capacity(HISTORY_CAPACITY)
    }
}

impl History {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, value: impl Into<String>, timestamp: SystemTime) {
        let timestamp = match self.entries.back() {
            Some(last) if last.timestamp > timestamp => last.timestamp,
            _ => timestamp,
        };

        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(HistoryEntry {
            value: value.into(),
            timestamp,
        });
    }

    pub fn last(&self) -> Option<&HistoryEntry> {
        self.entries.back()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter()
    }
}
