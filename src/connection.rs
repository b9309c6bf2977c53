//! Connection: one assigned byte range driven against one URL at a time
//! (spec.md §3, §4.3). `Engine::step` drives every enabled connection's
//! `advance` concurrently; only the coordinator ever holds `&mut Connection`,
//! so no additional synchronization is needed between connections.

use std::collections::VecDeque;
use std::time::Instant;

use crate::config::Config;
use crate::error::EngineError;
use crate::file_backing::FileBacking;
use crate::message::MessageQueue;
use crate::transport::{new_transport, Transport};
use crate::url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Init,
    Connecting,
    Transferring,
    Done,
    Failed,
}

pub struct Connection {
    pub index: usize,
    pub url: Url,
    /// Position of `url` within the host's URL pool, used to resume
    /// round-robin from the URL that just failed.
    pub url_pool_pos: usize,
    pub range_start: u64,
    pub current_byte: u64,
    pub last_byte: u64,
    /// Ranges absorbed from failed siblings (spec.md §4.7 step 2), queued
    /// at their own original offsets rather than folded into `last_byte`:
    /// a donor's abandoned range almost never sits contiguous with this
    /// connection's own assigned span. Consumed front-to-back once the
    /// active range (`[current_byte, last_byte)`) completes.
    pending_ranges: VecDeque<(u64, u64)>,
    /// Bytes this connection has itself written to the file, across its
    /// own range and every absorbed range — the only thing `bytes_done`
    /// accounting can rely on once a connection's active range can jump to
    /// a disjoint offset mid-download.
    pub bytes_fetched: u64,
    pub last_transfer_time: Instant,
    pub enabled: bool,
    pub supported: bool,
    pub state: ConnState,
    pub retry_count: u32,
    transport: Option<Box<dyn Transport>>,
}

/// Outcome of one bounded `advance` call, reported back to the coordinator.
pub struct AdvanceReport {
    pub bytes_read: u64,
    pub error: Option<EngineError>,
}

impl Connection {
    pub fn new(index: usize, url: Url, url_pool_pos: usize, range_start: u64, last_byte: u64) -> Self {
        Self {
            index,
            url,
            url_pool_pos,
            range_start,
            current_byte: range_start,
            last_byte,
            pending_ranges: VecDeque::new(),
            bytes_fetched: 0,
            last_transfer_time: Instant::now(),
            enabled: true,
            supported: true,
            state: ConnState::Init,
            retry_count: 0,
            transport: None,
        }
    }

    /// True once the active range (`[current_byte, last_byte)`) is
    /// exhausted. A connection can be `is_complete()` yet not actually done
    /// if it still has queued ranges absorbed from a failed sibling — see
    /// `is_fully_done`.
    pub fn is_complete(&self) -> bool {
        self.current_byte >= self.last_byte
    }

    /// True once there is no more work left for this connection at all:
    /// its active range is exhausted and nothing is queued behind it.
    pub fn is_fully_done(&self) -> bool {
        self.is_complete() && self.pending_ranges.is_empty()
    }

    /// Bytes left in the active range only (used to clamp a single read's
    /// budget; does not include anything still queued).
    pub fn remaining(&self) -> u64 {
        self.last_byte.saturating_sub(self.current_byte)
    }

    /// Total bytes still owed by this connection — its active range plus
    /// every range queued behind it — the "outstanding byte count" spec.md
    /// §4.7 uses to pick a redistribution target.
    pub fn outstanding(&self) -> u64 {
        self.remaining()
            + self
                .pending_ranges
                .iter()
                .map(|(start, end)| end - start)
                .sum::<u64>()
    }

    /// Reassign this connection to a different URL and send it back through
    /// CONNECTING (spec.md §4.7 step 2).
    pub fn rotate_to(&mut self, url: Url, pool_pos: usize) {
        self.url = url;
        self.url_pool_pos = pool_pos;
        self.state = ConnState::Connecting;
        self.transport = None;
    }

    /// Queue a failed sibling's abandoned range for this connection to pick
    /// up once its own active range (and anything already queued ahead of
    /// it) completes (spec.md §4.3 "a finished worker may be re-used for
    /// another range"). If this connection had already finished and gone
    /// DONE, wake it back up immediately so `Engine::step` polls it again
    /// on the next step instead of leaving it parked in DONE forever.
    pub fn queue_range(&mut self, range: (u64, u64)) {
        self.pending_ranges.push_back(range);
        if self.state == ConnState::Done {
            self.state = ConnState::Connecting;
            self.transport = None;
        }
    }

    /// If the active range is exhausted, pop the next queued range (if any)
    /// and make it the new active range. Returns `false` when there is
    /// truly nothing left to do (active range exhausted, nothing queued).
    fn advance_to_next_range(&mut self) -> bool {
        if !self.is_complete() {
            return true;
        }
        match self.pending_ranges.pop_front() {
            Some((start, end)) => {
                self.current_byte = start;
                self.last_byte = end;
                self.state = ConnState::Connecting;
                self.transport = None;
                true
            }
            None => false,
        }
    }

    /// Drive this connection through at most one bounded slice of work:
    /// connect if needed, then read up to `max_bytes` (the per-step speed
    /// budget; `u64::MAX` for unlimited) and write into `file` at the
    /// current offset.
    pub async fn advance(
        &mut self,
        config: &Config,
        file: &FileBacking,
        max_bytes: u64,
        messages: &MessageQueue,
    ) -> AdvanceReport {
        if !self.advance_to_next_range() {
            self.state = ConnState::Done;
            return AdvanceReport {
                bytes_read: 0,
                error: None,
            };
        }

        if matches!(self.state, ConnState::Init | ConnState::Connecting) {
            self.state = ConnState::Connecting;
            let mut transport = new_transport(&self.url, config);
            let range_end = if self.last_byte == u64::MAX {
                None
            } else {
                Some(self.last_byte)
            };
            let opened =
                tokio::time::timeout(config.io_timeout, transport.open(self.current_byte, range_end))
                    .await;

            let outcome = match opened {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(e)) => {
                    self.state = ConnState::Failed;
                    return AdvanceReport {
                        bytes_read: 0,
                        error: Some(e),
                    };
                }
                Err(_) => {
                    self.state = ConnState::Failed;
                    return AdvanceReport {
                        bytes_read: 0,
                        error: Some(EngineError::IoTimeout),
                    };
                }
            };

            self.supported = outcome.supported;
            if !outcome.supported {
                messages.warn(format!(
                    "connection {}: peer ignored byte range, collapsing to single connection",
                    self.index
                ));
            }
            self.transport = Some(transport);
            self.state = ConnState::Transferring;
            self.last_transfer_time = Instant::now();
        }

        let budget = max_bytes.min(self.remaining()).min(1 << 20) as usize;
        let budget = budget.max(1);
        let mut buf = vec![0u8; budget];

        let transport = match self.transport.as_mut() {
            Some(t) => t,
            None => {
                self.state = ConnState::Failed;
                return AdvanceReport {
                    bytes_read: 0,
                    error: Some(EngineError::TransportError {
                        status: 0,
                        message: "no transport after connect".to_string(),
                    }),
                };
            }
        };

        let read = tokio::time::timeout(config.io_timeout, transport.read_chunk(&mut buf)).await;
        let n = match read {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                self.state = ConnState::Failed;
                return AdvanceReport {
                    bytes_read: 0,
                    error: Some(e),
                };
            }
            Err(_) => {
                self.state = ConnState::Failed;
                return AdvanceReport {
                    bytes_read: 0,
                    error: Some(EngineError::IoTimeout),
                };
            }
        };

        if n == 0 {
            // Peer closed the stream. An open-ended range (`last_byte ==
            // u64::MAX`: total size unknown, or the peer ignored Range
            // entirely) defines its own upper bound at EOF; otherwise we
            // must have actually reached our assigned upper bound, or this
            // is a premature close.
            if self.last_byte == u64::MAX {
                self.last_byte = self.current_byte;
                self.state = ConnState::Done;
            } else if self.is_complete() {
                if self.is_fully_done() {
                    self.state = ConnState::Done;
                } else {
                    self.advance_to_next_range();
                }
            } else {
                self.state = ConnState::Failed;
                return AdvanceReport {
                    bytes_read: 0,
                    error: Some(EngineError::TransportError {
                        status: 0,
                        message: "connection closed before range was satisfied".to_string(),
                    }),
                };
            }
            return AdvanceReport {
                bytes_read: 0,
                error: None,
            };
        }

        if let Err(e) = file.write_at(&buf[..n], self.current_byte) {
            self.state = ConnState::Failed;
            return AdvanceReport {
                bytes_read: 0,
                error: Some(e),
            };
        }

        self.current_byte += n as u64;
        self.bytes_fetched += n as u64;
        self.last_transfer_time = Instant::now();

        if self.is_fully_done() {
            self.state = ConnState::Done;
        } else if self.is_complete() {
            // active range just finished but a queued range is waiting;
            // reopen immediately so the next step's Connecting poll picks
            // it up rather than sitting DONE for a step.
            self.advance_to_next_range();
        }

        AdvanceReport {
            bytes_read: n as u64,
            error: None,
        }
    }

    pub async fn shutdown(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url() -> Url {
        Url::parse("http://example.com/f").unwrap()
    }

    #[test]
    fn new_connection_starts_in_init() {
        let c = Connection::new(0, url(), 0, 0, 100);
        assert_eq!(c.state, ConnState::Init);
        assert!(!c.is_complete());
        assert_eq!(c.remaining(), 100);
    }

    #[test]
    fn is_complete_when_current_reaches_last() {
        let mut c = Connection::new(0, url(), 0, 0, 100);
        c.current_byte = 100;
        assert!(c.is_complete());
        assert_eq!(c.remaining(), 0);
    }

    #[test]
    fn queue_range_revives_a_done_connection() {
        let mut c = Connection::new(0, url(), 0, 0, 100);
        c.current_byte = 100;
        c.state = ConnState::Done;
        c.queue_range((500, 550));
        assert_eq!(c.state, ConnState::Connecting);
        assert!(!c.is_fully_done());
        assert_eq!(c.outstanding(), 50);
    }

    #[test]
    fn queue_range_on_a_still_active_connection_does_not_touch_state() {
        let mut c = Connection::new(0, url(), 0, 0, 100);
        c.state = ConnState::Transferring;
        c.queue_range((500, 550));
        assert_eq!(c.state, ConnState::Transferring);
        assert_eq!(c.outstanding(), 100 + 50);
    }

    #[test]
    fn advance_to_next_range_picks_up_a_queued_range_in_order() {
        let mut c = Connection::new(0, url(), 0, 0, 100);
        c.current_byte = 100;
        c.queue_range((500, 550));
        c.queue_range((700, 720));
        assert!(c.advance_to_next_range());
        assert_eq!((c.current_byte, c.last_byte), (500, 550));
        c.current_byte = 550;
        assert!(c.advance_to_next_range());
        assert_eq!((c.current_byte, c.last_byte), (700, 720));
        c.current_byte = 720;
        assert!(!c.advance_to_next_range());
        assert!(c.is_fully_done());
    }

    #[test]
    fn rotate_to_resets_state_and_transport() {
        let mut c = Connection::new(0, url(), 0, 0, 100);
        c.state = ConnState::Failed;
        let alt = Url::parse("http://mirror.example.com/f").unwrap();
        c.rotate_to(alt.clone(), 1);
        assert_eq!(c.state, ConnState::Connecting);
        assert_eq!(c.url, alt);
        assert_eq!(c.url_pool_pos, 1);
    }
}
