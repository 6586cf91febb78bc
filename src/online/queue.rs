// src/online/queue.rs
//! Bounded device-sample queue with oldest-first drop
//!
//! The device pump must never block on the inference loop. When the queue
//! is full the OLDEST batch is displaced and counted: in a closed feedback
//! loop a stale sample is worth less than a fresh one.

use crate::types::SampleBatch;
use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Notify;

pub struct SampleQueue {
    inner: ArrayQueue<SampleBatch>,
    dropped: AtomicU64,
    closed: AtomicBool,
    notify: Notify,
}

impl SampleQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: ArrayQueue::new(capacity.max(1)),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Non-blocking push from the device pump; displaces the oldest batch
    /// when full
    pub fn push(&self, batch: SampleBatch) {
        if self.inner.force_push(batch).is_some() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
    }

    /// Await the next batch in arrival order; `None` once the queue is
    /// closed and drained
    pub async fn pop(&self) -> Option<SampleBatch> {
        loop {
            if let Some(batch) = self.inner.pop() {
                return Some(batch);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            self.notify.notified().await;
        }
    }

    /// Close the queue; pending batches stay readable
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        // one stored permit plus a broadcast, so a consumer between its
        // empty check and the await still wakes up
        self.notify.notify_one();
        self.notify.notify_waiters();
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
