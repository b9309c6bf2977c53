//! Bounded, thread-safe sink for human-readable engine events. Purely
//! advisory: messages carry no control semantics and the host drains them
//! on its own schedule.

use std::collections::VecDeque;
use std::sync::Mutex;

const MAX_QUEUE_LEN: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone)]
pub struct Message {
    pub severity: Severity,
    pub text: String,
}

/// Bounded FIFO. When full, the oldest `Info` message is dropped to make
/// room; `Warn`/`Error` messages are never dropped by `push`.
pub struct MessageQueue {
    inner: Mutex<VecDeque<Message>>,
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, severity: Severity, text: impl Into<String>) {
        let msg = Message {
            severity,
            text: text.into(),
        };
        match severity {
            Severity::Info => tracing::info!("{}", msg.text),
            Severity::Warn => tracing::warn!("{}", msg.text),
            Severity::Error => tracing::error!("{}", msg.text),
        }

        let mut q = self.inner.lock().expect("message queue poisoned");
        if q.len() >= MAX_QUEUE_LEN {
            // Drop the oldest Info message to make room; if none exist, drop
            // the oldest message outright rather than growing unboundedly.
            if let Some(pos) = q.iter().position(|m| m.severity == Severity::Info) {
                q.remove(pos);
            } else {
                q.pop_front();
            }
        }
        q.push_back(msg);
    }

    pub fn info(&self, text: impl Into<String>) {
        self.push(Severity::Info, text);
    }

    pub fn warn(&self, text: impl Into<String>) {
        self.push(Severity::Warn, text);
    }

    pub fn error(&self, text: impl Into<String>) {
        self.push(Severity::Error, text);
    }

    /// Drain and return all pending messages in push order, transferring
    /// ownership to the caller.
    pub fn drain(&self) -> Vec<Message> {
        let mut q = self.inner.lock().expect("message queue poisoned");
        q.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_returns_in_push_order() {
        let q = MessageQueue::new();
        q.info("first");
        q.warn("second");
        q.error("third");

        let drained = q.drain();
        assert_eq!(drained.len(), 3);
        assert_eq!(drained[0].text, "first");
        assert_eq!(drained[1].text, "second");
        assert_eq!(drained[2].text, "third");
    }

    #[test]
    fn drain_empties_the_queue() {
        let q = MessageQueue::new();
        q.info("a");
        let _ = q.drain();
        assert!(q.drain().is_empty());
    }

    #[test]
    fn overflow_drops_oldest_info_not_errors() {
        let q = MessageQueue::new();
        for i in 0..MAX_QUEUE_LEN {
            q.info(format!("info-{i}"));
        }
        q.error("important");

        let drained = q.drain();
        assert_eq!(drained.len(), MAX_QUEUE_LEN);
        assert!(drained.iter().any(|m| m.text == "important"));
        assert!(!drained.iter().any(|m| m.text == "info-0"));
    }
}
