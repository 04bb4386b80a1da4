//! Event queue (C15): a thread-safe FIFO delivering connection-level
//! notifications to the application. Never drops an event; if the caller
//! does not poll, back-pressure must be applied at the network read loop
//! rather than the queue silently discarding state (§4.15).

use crate::stream::Direction;
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    HandshakeComplete { alpn: Vec<u8> },
    StreamOpened { id: u64, direction: Direction },
    StreamData { id: u64, data: Vec<u8>, fin: bool },
    StreamReset { id: u64, error_code: u64 },
    StreamWritable { id: u64 },
    Datagram { data: Vec<u8> },
    PathValidated { local: String, remote: String },
    ConnectionClose { error_code: u64, reason: String },
}

#[derive(Default)]
pub struct EventQueue {
    inner: Mutex<VecDeque<Event>>,
    ready: Condvar,
}

impl EventQueue {
    pub fn new() -> Self {
        Self { inner: Mutex::new(VecDeque::new()), ready: Condvar::new() }
    }

    pub fn push(&self, event: Event) {
        let mut guard = self.inner.lock().unwrap();
        guard.push_back(event);
        self.ready.notify_one();
    }

    /// Non-blocking poll.
    pub fn poll(&self) -> Option<Event> {
        self.inner.lock().unwrap().pop_front()
    }

    /// Blocks until an event is available.
    pub fn recv(&self) -> Event {
        let mut guard = self.inner.lock().unwrap();
        loop {
            if let Some(event) = guard.pop_front() {
                return event;
            }
            guard = self.ready.wait(guard).unwrap();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order_is_preserved() {
        let q = EventQueue::new();
        q.push(Event::StreamWritable { id: 1 });
        q.push(Event::StreamWritable { id: 2 });
        assert_eq!(q.poll(), Some(Event::StreamWritable { id: 1 }));
        assert_eq!(q.poll(), Some(Event::StreamWritable { id: 2 }));
        assert_eq!(q.poll(), None);
    }

    #[test]
    fn recv_blocks_until_pushed() {
        use std::sync::Arc;
        use std::thread;
        let q = Arc::new(EventQueue::new());
        let q2 = q.clone();
        let handle = thread::spawn(move || q2.recv());
        thread::sleep(std::time::Duration::from_millis(10));
        q.push(Event::Datagram { data: vec![1, 2, 3] });
        let event = handle.join().unwrap();
        assert_eq!(event, Event::Datagram { data: vec![1, 2, 3] });
    }
}
