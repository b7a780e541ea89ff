use std::collections::VecDeque;
use std::io;
use std::sync::{Condvar, Mutex};

use crate::peer::{Peer, PeerId};
use crate::wire::Message;

/// Events that drive the control loop.
#[derive(Debug)]
pub enum NetEvent {
    /// A listener accepted a new stream. The peer carries no coordinates
    /// yet; admission happens when its join request arrives.
    IncomingConnection(Peer),
    /// A peer's stream closed or failed.
    PeerDisconnected(PeerId),
    /// A framed message arrived from a peer's read task.
    MessageReceived(PeerId, Message),
    /// The accept loop died.
    ListenFailed(io::Error),
}

/// Multi-producer, single-consumer FIFO of control events. Producers push
/// without blocking; the single consumer blocks in `next` until an event
/// is available. Order is strict arrival order across all producers.
#[derive(Debug)]
pub struct EventQueue {
    state: Mutex<VecDeque<NetEvent>>,
    cond: Condvar,
}

impl EventQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
        }
    }

    pub fn push(&self, event: NetEvent) {
        {
            let mut queue = self.state.lock().unwrap();
            queue.push_back(event);
        }
        self.cond.notify_one();
    }

    /// Blocks until an event is available, then removes and returns it.
    pub fn next(&self) -> NetEvent {
        let mut queue = self.state.lock().unwrap();
        loop {
            if let Some(event) = queue.pop_front() {
                return event;
            }
            queue = self.cond.wait(queue).unwrap();
        }
    }

    /// Current queue depth, for operator visibility.
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::wire::Message;

    fn marker(n: u16) -> NetEvent {
        NetEvent::MessageReceived(PeerId::next(), Message::SiblingRmv { sibling_number: n })
    }

    fn marker_value(event: NetEvent) -> u16 {
        match event {
            NetEvent::MessageReceived(_, Message::SiblingRmv { sibling_number }) => sibling_number,
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn fifo_order_is_preserved() {
        let queue = EventQueue::new();
        for n in 0..100 {
            queue.push(marker(n));
        }
        for n in 0..100 {
            assert_eq!(marker_value(queue.next()), n);
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn next_blocks_until_push() {
        let queue = Arc::new(EventQueue::new());

        let producer = {
            let queue = queue.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                queue.push(marker(7));
            })
        };

        assert_eq!(marker_value(queue.next()), 7);
        producer.join().unwrap();
    }

    #[test]
    fn many_producers_all_delivered() {
        let queue = Arc::new(EventQueue::new());
        let mut handles = Vec::new();

        for p in 0..4u16 {
            let queue = queue.clone();
            handles.push(thread::spawn(move || {
                for n in 0..25u16 {
                    queue.push(marker(p * 25 + n));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let mut seen: Vec<u16> = (0..100).map(|_| marker_value(queue.next())).collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
    }
}
