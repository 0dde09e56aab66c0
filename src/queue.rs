//! Bounded byte queues shared between the completion handler and tasks.
//!
//! Tasks wait on `ByteQueue` with a deadline. The completion handler only
//! gets an `IsrQueue`, which never waits. Pushes always go through the
//! non-blocking view, so the writer can announce what it queued while the
//! link lock is held.

use crate::error::{Result, TransportError};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Fixed-capacity FIFO of bytes with blocking producer and consumer.
#[derive(Debug)]
pub struct ByteQueue {
    capacity: usize,
    buf: Mutex<VecDeque<u8>>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl ByteQueue {
    /// Allocate a queue holding at most `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(TransportError::InvalidArgument("queue capacity must be non-zero"));
        }

        let mut buf = VecDeque::new();
        buf.try_reserve_exact(capacity)
            .map_err(|_| TransportError::OutOfMemory)?;

        Ok(ByteQueue {
            capacity,
            buf: Mutex::new(buf),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        })
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.buf.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes that can be pushed without blocking.
    pub fn free(&self) -> usize {
        self.capacity - self.len()
    }

    /// Non-blocking view for interrupt context.
    pub fn isr(&self) -> IsrQueue<'_> {
        IsrQueue { queue: self }
    }

    /// Block until at least one byte of room is free or `deadline` passes.
    ///
    /// Returns false on timeout with the queue still full.
    pub fn wait_for_room(&self, deadline: Option<Instant>) -> bool {
        let mut buf = self.buf.lock();
        while buf.len() == self.capacity {
            if wait(&self.not_full, &mut buf, deadline) && buf.len() == self.capacity {
                return false;
            }
        }
        true
    }

    /// Wait up to `timeout` for at least one byte, then take as many as fit in `out`.
    ///
    /// Returns 0 when the timeout expires with nothing available.
    pub fn recv_timeout(&self, out: &mut [u8], timeout: Option<Duration>) -> usize {
        if out.is_empty() {
            return 0;
        }

        let deadline = deadline_after(timeout);
        let mut buf = self.buf.lock();

        while buf.is_empty() {
            if wait(&self.not_empty, &mut buf, deadline) && buf.is_empty() {
                return 0;
            }
        }

        let n = drain_into(&mut buf, out);
        self.not_full.notify_one();
        n
    }
}

/// Interrupt-side surface of a `ByteQueue`: every call returns immediately.
///
/// The `bool` in each result reports whether a task blocked on the other end
/// was woken, so the caller can request a context switch.
#[derive(Debug, Clone, Copy)]
pub struct IsrQueue<'a> {
    queue: &'a ByteQueue,
}

impl<'a> IsrQueue<'a> {
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn free(&self) -> usize {
        self.queue.free()
    }

    /// Push as much of `data` as fits right now.
    pub fn push(&self, data: &[u8]) -> (usize, bool) {
        let mut buf = self.queue.buf.lock();
        let n = (self.queue.capacity - buf.len()).min(data.len());
        if n == 0 {
            return (0, false);
        }
        buf.extend(&data[..n]);
        (n, self.queue.not_empty.notify_one())
    }

    /// Pop up to `out.len()` bytes that are available right now.
    pub fn pop(&self, out: &mut [u8]) -> (usize, bool) {
        let mut buf = self.queue.buf.lock();
        let n = drain_into(&mut buf, out);
        if n == 0 {
            return (0, false);
        }
        (n, self.queue.not_full.notify_one())
    }
}

pub(crate) fn deadline_after(timeout: Option<Duration>) -> Option<Instant> {
    // A timeout too large to represent is treated as forever.
    timeout.and_then(|t| Instant::now().checked_add(t))
}

/// Block on `cond` until notified or `deadline` passes. Returns true on timeout.
fn wait(cond: &Condvar, guard: &mut MutexGuard<'_, VecDeque<u8>>, deadline: Option<Instant>) -> bool {
    match deadline {
        Some(deadline) => cond.wait_until(guard, deadline).timed_out(),
        None => {
            cond.wait(guard);
            false
        }
    }
}

fn drain_into(buf: &mut VecDeque<u8>, out: &mut [u8]) -> usize {
    let n = buf.len().min(out.len());
    for (slot, byte) in out.iter_mut().zip(buf.drain(..n)) {
        *slot = byte;
    }
    n
}
