// Copyright (C) 2019-2020  Pierre Krieger
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Rendez-vous points between the tasks performing I/O and the code reacting to interrupts.
//!
//! Interrupt handlers are never allowed to sleep or to lock anything that could be held while
//! sleeping. The primitives of this module only ever lock spin locks for a very short amount of
//! time, and can therefore be used from within an interrupt handler.

use crate::{Error, HwAccess};

use alloc::vec::Vec;
use core::{
    fmt,
    future::Future,
    pin::Pin,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};
use futures::{
    future::{self, Either},
    pin_mut,
    task::{AtomicWaker, Context, Poll, Waker},
};
use hashbrown::HashMap;
use spinning_top::Spinlock;

/// List of tasks waiting for a condition to become true.
///
/// Whoever modifies the state that a condition depends on must call [`WaitQueue::wake_all`]
/// afterwards.
pub struct WaitQueue {
    next_id: AtomicU64,
    wakers: Spinlock<HashMap<u64, Waker, fnv::FnvBuildHasher>>,
}

impl WaitQueue {
    /// Builds a new empty queue.
    pub fn new() -> Self {
        WaitQueue {
            next_id: AtomicU64::new(0),
            wakers: Spinlock::new(HashMap::with_capacity_and_hasher(4, Default::default())),
        }
    }

    /// Wakes up all the tasks currently waiting.
    pub fn wake_all(&self) {
        let wakers = {
            let mut wakers = self.wakers.lock();
            wakers.drain().map(|(_, w)| w).collect::<Vec<_>>()
        };

        for waker in wakers {
            waker.wake();
        }
    }

    /// Returns a future that is ready once `cond` returns `Some`.
    ///
    /// `cond` is called again every time the queue is woken up.
    pub fn wait_until<T, F>(&self, cond: F) -> WaitUntil<F>
    where
        F: FnMut() -> Option<T> + Unpin,
    {
        WaitUntil {
            queue: self,
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            cond,
        }
    }

    /// Same as [`WaitQueue::wait_until`], but with a boolean condition.
    pub async fn wait_for(&self, mut cond: impl FnMut() -> bool + Unpin) {
        self.wait_until(move || if cond() { Some(()) } else { None })
            .await
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        WaitQueue::new()
    }
}

impl fmt::Debug for WaitQueue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("WaitQueue")
            .field(&self.wakers.lock().len())
            .finish()
    }
}

/// Future returned by [`WaitQueue::wait_until`].
#[must_use]
pub struct WaitUntil<'a, F> {
    queue: &'a WaitQueue,
    id: u64,
    cond: F,
}

impl<'a, T, F> Future for WaitUntil<'a, F>
where
    F: FnMut() -> Option<T> + Unpin,
{
    type Output = T;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<T> {
        let this = &mut *self;

        if let Some(value) = (this.cond)() {
            this.queue.wakers.lock().remove(&this.id);
            return Poll::Ready(value);
        }

        this.queue
            .wakers
            .lock()
            .insert(this.id, cx.waker().clone());

        // The condition might have changed between the first check and the registration.
        if let Some(value) = (this.cond)() {
            this.queue.wakers.lock().remove(&this.id);
            return Poll::Ready(value);
        }

        Poll::Pending
    }
}

impl<'a, F> Drop for WaitUntil<'a, F> {
    fn drop(&mut self) {
        self.queue.wakers.lock().remove(&self.id);
    }
}

/// Queue of events pushed by an interrupt handler and processed by a single task.
pub struct EventQueue<T> {
    queue: crossbeam_queue::SegQueue<T>,
    waker: AtomicWaker,
}

impl<T> EventQueue<T> {
    /// Builds a new empty queue.
    pub fn new() -> Self {
        EventQueue {
            queue: crossbeam_queue::SegQueue::new(),
            waker: AtomicWaker::new(),
        }
    }

    /// Pushes an event and wakes up the task processing them. Never blocks.
    pub fn push(&self, event: T) {
        self.queue.push(event);
        self.waker.wake();
    }

    /// Pops the next event, if any.
    pub fn try_pop(&self) -> Option<T> {
        self.queue.pop()
    }

    /// Waits until an event is available and returns it.
    pub async fn next(&self) -> T {
        future::poll_fn(|cx| self.poll_next(cx)).await
    }

    /// Polls for the next event.
    pub fn poll_next(&self, cx: &mut Context) -> Poll<T> {
        if let Some(event) = self.queue.pop() {
            return Poll::Ready(event);
        }

        self.waker.register(cx.waker());

        if let Some(event) = self.queue.pop() {
            return Poll::Ready(event);
        }

        Poll::Pending
    }
}

impl<T> Default for EventQueue<T> {
    fn default() -> Self {
        EventQueue::new()
    }
}

impl<T> fmt::Debug for EventQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("EventQueue").field(&self.queue.len()).finish()
    }
}

/// Runs `fut` to completion, unless `duration` elapses first, in which case
/// [`Error::Timeout`] is returned.
pub async fn timeout<A, F>(access: &A, duration: Duration, fut: F) -> Result<F::Output, Error>
where
    A: HwAccess,
    F: Future,
{
    let delay = access.delay(duration);
    pin_mut!(fut);
    pin_mut!(delay);
    match future::select(fut, delay).await {
        Either::Left((out, _)) => Ok(out),
        Either::Right(((), _)) => Err(Error::Timeout),
    }
}
