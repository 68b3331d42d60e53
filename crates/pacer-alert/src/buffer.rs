use std::collections::VecDeque;
use std::sync::Mutex;

use pacer_core::now_unix_ms;
use serde::Serialize;

use crate::event::{AlertEvent, AlertLevel};
use crate::sink::AlertSink;

pub const DEFAULT_ERROR_BUFFER_CAPACITY: usize = 100;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BufferedAlert {
    pub at_ms: i64,
    pub event: AlertEvent,
}

/// Bounded ring of recent warnings and errors, owned by the host.
///
/// Info-level events are ignored. When full, the oldest entry is evicted.
pub struct ErrorBuffer {
    capacity: usize,
    entries: Mutex<VecDeque<BufferedAlert>>,
}

impl Default for ErrorBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_ERROR_BUFFER_CAPACITY)
    }
}

impl ErrorBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Up to `n` most recent entries, newest first.
    pub fn recent(&self, n: usize) -> Vec<BufferedAlert> {
        match self.entries.lock() {
            Ok(entries) => entries.iter().rev().take(n).cloned().collect(),
            Err(_) => vec![],
        }
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }
}

impl AlertSink for ErrorBuffer {
    fn emit(&self, event: &AlertEvent) {
        if event.level() < AlertLevel::Warn {
            return;
        }
        // A poisoned buffer drops the entry; alerting never takes the caller down.
        if let Ok(mut entries) = self.entries.lock() {
            if entries.len() == self.capacity {
                entries.pop_front();
            }
            entries.push_back(BufferedAlert {
                at_ms: now_unix_ms(),
                event: event.clone(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pacer_core::SessionId;

    fn detector_error(n: usize) -> AlertEvent {
        AlertEvent::DetectorError {
            session: SessionId::from_str("s1"),
            error: format!("timeout {n}"),
        }
    }

    #[test]
    fn keeps_only_the_newest_entries() {
        let buf = ErrorBuffer::new(3);
        for n in 0..5 {
            buf.emit(&detector_error(n));
        }
        assert_eq!(buf.len(), 3);
        let recent = buf.recent(10);
        assert_eq!(recent[0].event, detector_error(4));
        assert_eq!(recent[2].event, detector_error(2));
    }

    #[test]
    fn info_events_are_not_buffered() {
        let buf = ErrorBuffer::default();
        buf.emit(&AlertEvent::Succeeded {
            session: SessionId::from_str("s1"),
            record_id: pacer_core::RecordId(1),
            kind: pacer_core::WorkKind::Lookup,
            attempts: 1,
        });
        assert!(buf.is_empty());
        assert_eq!(buf.capacity(), DEFAULT_ERROR_BUFFER_CAPACITY);
    }

    #[test]
    fn clear_empties_the_ring() {
        let buf = ErrorBuffer::new(2);
        buf.emit(&detector_error(1));
        buf.clear();
        assert!(buf.recent(5).is_empty());
    }
}
