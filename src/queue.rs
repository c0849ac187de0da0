//! Sentinel priority queue
//!
//! A single unbounded queue shared by the command producer and every consumer
//! loop. `Shutdown` always sorts to the head, and [`MessageQueue::take`] hands
//! it out without removing it, so each independent consumer observes the same
//! sentinel and can stop on its own.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use crate::command::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("wait for the next message was interrupted")]
    Interrupted,
    #[error("timed out waiting for the next message")]
    TimedOut,
}

/// Heap slot. `BinaryHeap` pops its greatest element, so the ordering is
/// reversed: higher priority first, then earlier emission.
struct Entry {
    seq: u64,
    message: Message,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .message
            .priority_cmp(&self.message)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for Entry {}

pub struct MessageQueue {
    heap: Mutex<BinaryHeap<Entry>>,
    next_seq: AtomicU64,
    available: Notify,
    /// Serializes the peek-then-take sequence across `take()` callers.
    take_lock: tokio::sync::Mutex<()>,
    interrupts: AtomicU64,
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageQueue {
    pub fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            next_seq: AtomicU64::new(0),
            available: Notify::new(),
            take_lock: tokio::sync::Mutex::new(()),
            interrupts: AtomicU64::new(0),
        }
    }

    /// Enqueue a message. Never blocks; callable from any thread.
    pub fn emit(&self, message: Message) -> bool {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        self.heap().push(Entry { seq, message });
        self.available.notify_waiters();
        true
    }

    /// Wait for the next message.
    ///
    /// A `Shutdown` at the head is returned but left in place; commands are
    /// dequeued.
    pub async fn take(&self) -> Result<Message, QueueError> {
        let generation = self.interrupts.load(Ordering::SeqCst);
        let _guard = self.take_lock.lock().await;

        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(message) = self.peek_then_take() {
                return Ok(message);
            }
            if self.interrupts.load(Ordering::SeqCst) != generation {
                return Err(QueueError::Interrupted);
            }

            notified.await;
        }
    }

    pub async fn take_timeout(&self, timeout: Duration) -> Result<Message, QueueError> {
        match tokio::time::timeout(timeout, self.take()).await {
            Ok(result) => result,
            Err(_) => Err(QueueError::TimedOut),
        }
    }

    /// Wake every caller currently waiting in [`take`](Self::take) with
    /// [`QueueError::Interrupted`]. Messages already queued are unaffected.
    pub fn interrupt(&self) {
        self.interrupts.fetch_add(1, Ordering::SeqCst);
        self.available.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.heap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap().is_empty()
    }

    fn peek_then_take(&self) -> Option<Message> {
        if let Some(sentinel) = self.peek_shutdown() {
            return Some(sentinel);
        }

        // A producer may have pushed the sentinel between the peek and this pop.
        let message = self.heap().pop()?.message;
        if message.is_shutdown() {
            self.emit(message.clone());
        }
        Some(message)
    }

    fn peek_shutdown(&self) -> Option<Message> {
        self.heap()
            .peek()
            .filter(|entry| entry.message.is_shutdown())
            .map(|entry| entry.message.clone())
    }

    fn heap(&self) -> MutexGuard<'_, BinaryHeap<Entry>> {
        self.heap.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use crate::command::Command;

    fn command(job: &str) -> Message {
        Message::Command(Command::Status { job_name: Some(job.to_string()) })
    }

    #[tokio::test]
    async fn test_commands_are_delivered_in_emission_order() {
        let queue = MessageQueue::new();
        queue.emit(command("a"));
        queue.emit(command("b"));
        queue.emit(command("c"));

        assert_eq!(queue.take().await.unwrap(), command("a"));
        assert_eq!(queue.take().await.unwrap(), command("b"));
        assert_eq!(queue.take().await.unwrap(), command("c"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_jumps_ahead_and_is_not_consumed() {
        let queue = MessageQueue::new();
        queue.emit(command("a"));
        queue.emit(command("b"));
        queue.emit(Message::Shutdown { save_jobs: true });

        for _ in 0..5 {
            assert_eq!(queue.take().await.unwrap(), Message::Shutdown { save_jobs: true });
        }
        assert_eq!(queue.len(), 3);
    }

    #[tokio::test]
    async fn test_take_waits_for_emit() {
        let queue = Arc::new(MessageQueue::new());
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.take().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.emit(command("late"));

        let received = consumer.await.unwrap().unwrap();
        assert_eq!(received, command("late"));
    }

    #[tokio::test]
    async fn test_every_consumer_observes_shutdown() {
        let queue = Arc::new(MessageQueue::new());
        let mut consumers = Vec::new();

        for _ in 0..4 {
            let queue = queue.clone();
            consumers.push(tokio::spawn(async move {
                let mut handled = 0usize;
                loop {
                    match queue.take().await.unwrap() {
                        Message::Shutdown { .. } => return handled,
                        Message::Command(_) => handled += 1,
                    }
                }
            }));
        }

        for i in 0..20 {
            queue.emit(command(&format!("job{i}")));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.emit(Message::Shutdown { save_jobs: false });

        let mut total = 0;
        for consumer in consumers {
            total += tokio::time::timeout(Duration::from_secs(5), consumer)
                .await
                .expect("consumer did not observe shutdown")
                .unwrap();
        }
        assert_eq!(total, 20);
    }

    #[tokio::test]
    async fn test_interrupt_wakes_waiter() {
        let queue = Arc::new(MessageQueue::new());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.take().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.interrupt();

        assert_eq!(waiter.await.unwrap(), Err(QueueError::Interrupted));
    }

    #[tokio::test]
    async fn test_take_timeout() {
        let queue = MessageQueue::new();
        assert_eq!(
            queue.take_timeout(Duration::from_millis(10)).await,
            Err(QueueError::TimedOut)
        );

        queue.emit(command("a"));
        assert_eq!(queue.take_timeout(Duration::from_millis(10)).await, Ok(command("a")));
    }
}
