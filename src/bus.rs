//! Fan-out publish/subscribe channel.
//!
//! Publishing never blocks: each subscriber owns an unbounded receiver and
//! buffers on its own side. Subscribers whose receiver was dropped are pruned
//! on the next publish.

use std::sync::Mutex;

use crossbeam_channel::{unbounded, Receiver, Sender};

/// A broadcast bus for cloneable events.
#[derive(Debug)]
pub struct Bus<T> {
    subscribers: Mutex<Vec<Sender<T>>>,
}

impl<T> Default for Bus<T> {
    fn default() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }
}

impl<T: Clone> Bus<T> {
    /// A bus with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a subscriber that sees every event published from now on.
    pub fn subscribe(&self) -> Receiver<T> {
        let (tx, rx) = unbounded();
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(tx);
        }
        rx
    }

    /// Delivers `event` to every live subscriber. Returns how many got it.
    pub fn publish(&self, event: &T) -> usize {
        let Ok(mut subs) = self.subscribers.lock() else {
            return 0;
        };
        subs.retain(|tx| tx.send(event.clone()).is_ok());
        subs.len()
    }

    /// Number of live subscribers as of the last publish.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_subscriber_receives_and_dropped_ones_are_pruned() {
        let bus: Bus<u32> = Bus::new();
        let a = bus.subscribe();
        let b = bus.subscribe();
        assert_eq!(bus.publish(&1), 2);
        drop(b);
        assert_eq!(bus.publish(&2), 1);
        assert_eq!(a.try_iter().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(bus.subscriber_count(), 1);
    }
}
