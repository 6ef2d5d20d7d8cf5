//! Timed event queue driving the engine dispatcher.
//!
//! The scheduler is a priority queue of `(due time, submission seq)`
//! ordered events carrying values of `T`. One consumer loops on
//! [`EventScheduler::next`]; producers on any task submit via `add_now` /
//! `add` / `add_abs` and wake the sleeping consumer through a
//! [`Notify`]. This serializes all protocol handlers, store mutations,
//! and deferred sends on a single dispatcher task.
//!
//! `next()` returns `None` only when the queue is empty and the *forever*
//! flag is cleared; while the flag is set an idle dispatcher blocks
//! indefinitely waiting for new work. Cancellation succeeds only while an
//! event is still queued.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};

/// Handle to a queued event, usable with [`EventScheduler::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventId(u64);

struct Entry<T> {
    at: Instant,
    seq: u64,
    id: u64,
    value: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.at, self.seq).cmp(&(other.at, other.seq))
    }
}

struct State<T> {
    heap: BinaryHeap<Reverse<Entry<T>>>,
    next_seq: u64,
    next_id: u64,
    forever: bool,
    /// Ids still queued (pending). Absence means dispatched or cancelled.
    live: HashSet<u64>,
    /// Tombstones for cancelled-but-not-yet-popped entries.
    cancelled: HashSet<u64>,
}

/// Cloneable handle to the shared timer queue.
pub struct EventScheduler<T> {
    state: Arc<Mutex<State<T>>>,
    notify: Arc<Notify>,
}

impl<T> Clone for EventScheduler<T> {
    fn clone(&self) -> Self {
        EventScheduler {
            state: Arc::clone(&self.state),
            notify: Arc::clone(&self.notify),
        }
    }
}

impl<T> Default for EventScheduler<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> EventScheduler<T> {
    pub fn new() -> Self {
        EventScheduler {
            state: Arc::new(Mutex::new(State {
                heap: BinaryHeap::new(),
                next_seq: 0,
                next_id: 0,
                forever: true,
                live: HashSet::new(),
                cancelled: HashSet::new(),
            })),
            notify: Arc::new(Notify::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State<T>> {
        self.state.lock().expect("scheduler state poisoned")
    }

    /// Schedule `value` for dispatch at an absolute instant.
    pub fn add_abs(&self, at: Instant, value: T) -> EventId {
        let mut st = self.lock();
        let seq = st.next_seq;
        st.next_seq += 1;
        let id = st.next_id;
        st.next_id += 1;
        st.live.insert(id);
        st.heap.push(Reverse(Entry { at, seq, id, value }));
        drop(st);
        self.notify.notify_one();
        EventId(id)
    }

    /// Schedule `value` for dispatch after `delay`.
    pub fn add(&self, delay: Duration, value: T) -> EventId {
        self.add_abs(Instant::now() + delay, value)
    }

    /// Schedule `value` for dispatch as soon as possible.
    pub fn add_now(&self, value: T) -> EventId {
        self.add_abs(Instant::now(), value)
    }

    /// Cancel a queued event. Returns true iff the event had not yet been
    /// handed to the dispatcher.
    pub fn cancel(&self, event: EventId) -> bool {
        let mut st = self.lock();
        let was_pending = st.live.remove(&event.0);
        if was_pending {
            st.cancelled.insert(event.0);
        }
        drop(st);
        self.notify.notify_one();
        was_pending
    }

    /// Drop every pending event.
    pub fn clear(&self) {
        let mut st = self.lock();
        st.heap.clear();
        st.live.clear();
        st.cancelled.clear();
        drop(st);
        self.notify.notify_one();
    }

    /// Control whether an idle `next()` blocks (true) or returns `None`
    /// (false).
    pub fn set_forever(&self, forever: bool) {
        self.lock().forever = forever;
        self.notify.notify_one();
    }

    /// Convenience alias for `set_forever(false)`.
    pub fn shutdown(&self) {
        self.set_forever(false);
    }

    pub fn is_idle(&self) -> bool {
        self.lock().live.is_empty()
    }

    /// Pop the next event that is already due, without waiting.
    pub fn poll_due(&self) -> Option<T> {
        let mut st = self.lock();
        loop {
            let cancelled = match st.heap.peek() {
                None => return None,
                Some(Reverse(head)) => {
                    if st.cancelled.contains(&head.id) {
                        true
                    } else if head.at <= Instant::now() {
                        false
                    } else {
                        return None;
                    }
                }
            };
            let Reverse(head) = st.heap.pop().expect("peeked entry");
            if cancelled {
                st.cancelled.remove(&head.id);
            } else {
                st.live.remove(&head.id);
                return Some(head.value);
            }
        }
    }

    /// Wait for and return the next due event.
    ///
    /// Returns `None` once the queue is empty and the forever flag is
    /// cleared. Intended for a single consumer; events are delivered in
    /// `(due time, submission order)` order.
    pub async fn next(&self) -> Option<T> {
        enum Action {
            PopCancelled,
            PopDue,
            Sleep(Instant),
            WaitForever,
        }

        loop {
            let wait_until = {
                let mut st = self.lock();
                loop {
                    let action = match st.heap.peek() {
                        None if st.forever => Action::WaitForever,
                        None => return None,
                        Some(Reverse(head)) => {
                            if st.cancelled.contains(&head.id) {
                                Action::PopCancelled
                            } else if head.at <= Instant::now() {
                                Action::PopDue
                            } else {
                                Action::Sleep(head.at)
                            }
                        }
                    };
                    match action {
                        Action::PopCancelled => {
                            let Reverse(head) = st.heap.pop().expect("peeked entry");
                            st.cancelled.remove(&head.id);
                        }
                        Action::PopDue => {
                            let Reverse(head) = st.heap.pop().expect("peeked entry");
                            st.live.remove(&head.id);
                            return Some(head.value);
                        }
                        Action::Sleep(at) => break Some(at),
                        Action::WaitForever => break None,
                    }
                }
            };
            match wait_until {
                Some(at) => {
                    tokio::select! {
                        () = sleep_until(at) => {}
                        () = self.notify.notified() => {}
                    }
                }
                None => self.notify.notified().await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_order_by_time_then_seq() {
        let sched = EventScheduler::new();
        sched.add(Duration::from_secs(2), "late");
        sched.add_now("first");
        sched.add_now("second");
        sched.add(Duration::from_secs(1), "middle");
        sched.shutdown();
        let mut out = Vec::new();
        while let Some(v) = sched.next().await {
            out.push(v);
        }
        assert_eq!(out, vec!["first", "second", "middle", "late"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_dispatch() {
        let sched = EventScheduler::new();
        let kept = sched.add(Duration::from_secs(1), "keep");
        let dropped = sched.add(Duration::from_secs(1), "drop");
        assert!(sched.cancel(dropped));
        sched.shutdown();
        assert_eq!(sched.next().await, Some("keep"));
        assert_eq!(sched.next().await, None);
        // Already dispatched: cancellation fails.
        assert!(!sched.cancel(kept));
        // Double cancellation fails too.
        assert!(!sched.cancel(dropped));
    }

    #[tokio::test(start_paused = true)]
    async fn test_forever_flag_blocks_idle_consumer() {
        let sched: EventScheduler<u32> = EventScheduler::new();
        let consumer = {
            let sched = sched.clone();
            tokio::spawn(async move {
                let mut got = Vec::new();
                while let Some(v) = sched.next().await {
                    got.push(v);
                }
                got
            })
        };
        // Idle but forever: the consumer must not exit on its own.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!consumer.is_finished());
        sched.add_now(7);
        sched.shutdown();
        assert_eq!(consumer.await.unwrap(), vec![7]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_submission_wakes_sleeper() {
        let sched = EventScheduler::new();
        sched.set_forever(false);
        sched.add(Duration::from_secs(60), "scheduled");
        let consumer = {
            let sched = sched.clone();
            tokio::spawn(async move { sched.next().await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        // The sleeper wakes for the earlier event without waiting a minute.
        sched.add_now("urgent");
        assert_eq!(consumer.await.unwrap(), Some("urgent"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_drains_queue() {
        let sched = EventScheduler::new();
        sched.add_now(1);
        sched.add(Duration::from_secs(1), 2);
        sched.clear();
        sched.shutdown();
        assert_eq!(sched.next().await, None);
        assert!(sched.is_idle());
    }
}
