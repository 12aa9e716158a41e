// src/core/router/queue.rs

//! The bounded request queue with explicit ownership-transfer semantics.
//!
//! On successful enqueue the queue owns the request; a failed enqueue hands
//! the request back to the caller, who releases its resources and applies a
//! back-pressure policy. Blocking pushes use a condition variable bounded by
//! the configured timeout.

use crate::core::metrics;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// What a producer does when the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, strum_macros::Display)]
#[serde(rename_all = "kebab-case")]
pub enum BackpressurePolicy {
    /// Evict the oldest queued request to make room.
    DropOldest,
    /// Reject the new request.
    Reject,
    /// Wait for room, up to the given timeout.
    Block { timeout_ms: u64 },
    /// Admit at most `max_per_sec` requests per second; reject the rest.
    RateLimit { max_per_sec: u32 },
}

/// Point-in-time queue gauges.
#[derive(Debug, Clone, serde::Serialize)]
pub struct QueueMetrics {
    pub capacity: usize,
    pub allocated_count: usize,
    pub push_failure_count: u64,
    pub utilization_percent: f64,
}

struct RateLimiter {
    /// `None` until the first admit; the bucket then starts full.
    allowance: Option<f64>,
    last_refill: Instant,
}

/// A bounded multi-producer/multi-consumer queue.
pub struct RequestQueue<T> {
    capacity: usize,
    inner: Mutex<VecDeque<T>>,
    space_available: Condvar,
    item_available: Condvar,
    push_failures: AtomicU64,
    rate: Mutex<RateLimiter>,
}

impl<T> RequestQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            space_available: Condvar::new(),
            item_available: Condvar::new(),
            push_failures: AtomicU64::new(0),
            rate: Mutex::new(RateLimiter {
                allowance: None,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Attempts to enqueue. On failure the request is handed back in `Err`,
    /// leaving ownership with the caller.
    pub fn push(&self, request: T) -> Result<(), T> {
        let mut queue = self.inner.lock();
        if queue.len() >= self.capacity {
            drop(queue);
            self.record_push_failure();
            return Err(request);
        }
        queue.push_back(request);
        self.item_available.notify_one();
        Ok(())
    }

    /// Enqueues under a back-pressure policy. `Err` returns ownership of the
    /// rejected request (the new one, or under DropOldest never fails unless
    /// the queue has zero capacity).
    pub fn push_with_policy(&self, request: T, policy: BackpressurePolicy) -> Result<(), T> {
        match policy {
            BackpressurePolicy::Reject => self.push(request),
            BackpressurePolicy::DropOldest => {
                let mut queue = self.inner.lock();
                while queue.len() >= self.capacity {
                    queue.pop_front();
                    self.push_failures.fetch_add(1, Ordering::Relaxed);
                    metrics::QUEUE_PUSH_FAILURES_TOTAL.inc();
                }
                queue.push_back(request);
                self.item_available.notify_one();
                Ok(())
            }
            BackpressurePolicy::Block { timeout_ms } => {
                let deadline = Instant::now() + Duration::from_millis(timeout_ms);
                let mut queue = self.inner.lock();
                while queue.len() >= self.capacity {
                    if self
                        .space_available
                        .wait_until(&mut queue, deadline)
                        .timed_out()
                    {
                        drop(queue);
                        self.record_push_failure();
                        return Err(request);
                    }
                }
                queue.push_back(request);
                self.item_available.notify_one();
                Ok(())
            }
            BackpressurePolicy::RateLimit { max_per_sec } => {
                if !self.admit(max_per_sec) {
                    self.record_push_failure();
                    return Err(request);
                }
                self.push(request)
            }
        }
    }

    /// Pops the oldest request, transferring ownership to the caller.
    pub fn pop(&self) -> Option<T> {
        let mut queue = self.inner.lock();
        let request = queue.pop_front();
        if request.is_some() {
            self.space_available.notify_one();
        }
        request
    }

    /// Pops, waiting up to `timeout` for a request to arrive.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut queue = self.inner.lock();
        while queue.is_empty() {
            if self
                .item_available
                .wait_until(&mut queue, deadline)
                .timed_out()
            {
                return None;
            }
        }
        let request = queue.pop_front();
        self.space_available.notify_one();
        request
    }

    fn admit(&self, max_per_sec: u32) -> bool {
        let mut rate = self.rate.lock();
        let elapsed = rate.last_refill.elapsed().as_secs_f64();
        rate.last_refill = Instant::now();
        let current = rate.allowance.unwrap_or(max_per_sec as f64);
        let refilled = (current + elapsed * max_per_sec as f64).min(max_per_sec as f64);
        if refilled < 1.0 {
            rate.allowance = Some(refilled);
            false
        } else {
            rate.allowance = Some(refilled - 1.0);
            true
        }
    }

    fn record_push_failure(&self) {
        self.push_failures.fetch_add(1, Ordering::Relaxed);
        metrics::QUEUE_PUSH_FAILURES_TOTAL.inc();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn metrics(&self) -> QueueMetrics {
        let allocated = self.len();
        QueueMetrics {
            capacity: self.capacity,
            allocated_count: allocated,
            push_failure_count: self.push_failures.load(Ordering::Relaxed),
            utilization_percent: allocated as f64 / self.capacity as f64 * 100.0,
        }
    }
}
