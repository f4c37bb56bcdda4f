use crate::domain::{Completion, EventKind};
use bytes::Bytes;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// An event already turned into its NDJSON line, waiting for a request.
#[derive(Debug)]
pub struct EncodedEvent {
    /// Absorption order, used to settle flushes.
    pub seq: u64,
    pub kind: EventKind,
    pub line: Bytes,
    pub completion: Completion,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowConfig {
    /// `None` disables coalescing.
    pub time: Option<Duration>,
    pub size: usize,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            time: Some(Duration::from_millis(20)),
            size: 50,
        }
    }
}

/// Micro-batching in front of the compressed stream.
///
/// Writes are corked until the window elapses or `size` events pile up.
/// Events the byte ceiling pushed out of a request sit in `carry` and are
/// always released ahead of anything corked after them.
#[derive(Debug)]
pub struct BatchWindow {
    config: WindowConfig,
    corked: Vec<EncodedEvent>,
    carry: VecDeque<EncodedEvent>,
    deadline: Option<Instant>,
}

impl BatchWindow {
    pub fn new(config: WindowConfig) -> Self {
        Self {
            config,
            corked: Vec::with_capacity(config.size),
            carry: VecDeque::new(),
            deadline: None,
        }
    }

    pub fn set_config(&mut self, config: WindowConfig) {
        self.config = config;
    }

    /// Corks one event. Returns `true` when the window should be released now.
    pub fn cork(&mut self, event: EncodedEvent, now: Instant) -> bool {
        self.corked.push(event);

        let Some(window) = self.config.time else {
            return true;
        };

        if self.deadline.is_none() {
            self.deadline = Some(now + window);
        }

        self.corked.len() >= self.config.size
    }

    /// Puts events back at the head of the line, preserving their order.
    pub fn defer(&mut self, events: VecDeque<EncodedEvent>, now: Instant) {
        if events.is_empty() {
            return;
        }
        for event in events.into_iter().rev() {
            self.carry.push_front(event);
        }
        self.deadline = Some(now);
    }

    /// When the corked events must be released, if any are waiting.
    pub fn deadline(&self) -> Option<Instant> {
        if self.is_empty() { None } else { self.deadline }
    }

    /// Releases everything, deferred events first.
    pub fn take(&mut self) -> VecDeque<EncodedEvent> {
        self.deadline = None;
        let mut batch = std::mem::take(&mut self.carry);
        batch.extend(self.corked.drain(..));
        batch
    }

    pub fn len(&self) -> usize {
        self.corked.len() + self.carry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.corked.is_empty() && self.carry.is_empty()
    }

    pub fn carried(&self) -> usize {
        self.carry.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(seq: u64) -> EncodedEvent {
        let (completion, _receipt) = Completion::channel();
        EncodedEvent {
            seq,
            kind: EventKind::Span,
            line: Bytes::from(format!("{{\"span\":{{\"id\":\"{seq}\"}}}}\n")),
            completion,
        }
    }

    fn seqs(batch: &VecDeque<EncodedEvent>) -> Vec<u64> {
        batch.iter().map(|e| e.seq).collect()
    }

    #[test]
    fn test_releases_on_size() {
        let mut window = BatchWindow::new(WindowConfig {
            time: Some(Duration::from_millis(20)),
            size: 3,
        });
        let now = Instant::now();

        assert!(!window.cork(event(1), now));
        assert!(!window.cork(event(2), now));
        assert!(window.cork(event(3), now));
        assert_eq!(window.deadline(), Some(now + Duration::from_millis(20)));
        assert_eq!(seqs(&window.take()), vec![1, 2, 3]);
        assert!(window.deadline().is_none());
    }

    #[test]
    fn test_deadline_set_by_first_event() {
        let mut window = BatchWindow::new(WindowConfig::default());
        let first = Instant::now();
        window.cork(event(1), first);
        window.cork(event(2), first + Duration::from_millis(5));

        assert_eq!(window.deadline(), Some(first + Duration::from_millis(20)));
    }

    #[test]
    fn test_disabled_window_releases_every_write() {
        let mut window = BatchWindow::new(WindowConfig {
            time: None,
            size: 50,
        });
        assert!(window.cork(event(1), Instant::now()));
    }

    #[test]
    fn test_deferred_events_go_first() {
        let mut window = BatchWindow::new(WindowConfig::default());
        let now = Instant::now();

        window.cork(event(4), now);
        window.defer(VecDeque::from(vec![event(2), event(3)]), now);
        window.defer(VecDeque::from(vec![event(1)]), now);

        assert_eq!(window.carried(), 3);
        assert_eq!(window.deadline(), Some(now));
        assert_eq!(seqs(&window.take()), vec![1, 2, 3, 4]);
        assert!(window.is_empty());
    }
}
