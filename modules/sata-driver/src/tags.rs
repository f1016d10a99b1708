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

//! Tags identifying the queued commands.
//!
//! A tag is taken from the [`TagPool`] before a command is issued, and each tag has a
//! [`TagSlot`] through which the completion is reported to the issuer.

use crate::request::RING_LEN;

use core::{
    fmt,
    sync::atomic::{AtomicU8, Ordering},
};
use futures::task::{AtomicWaker, Context, Poll};
use smallvec::SmallVec;

/// List of free tags.
pub struct TagPool {
    depth: u8,
    free: SmallVec<[u8; RING_LEN]>,
}

impl TagPool {
    /// Builds a pool of `depth` tags, all free. `depth` is clamped between 1 and 32.
    pub fn new(depth: u8) -> Self {
        let mut pool = TagPool {
            depth: 0,
            free: SmallVec::new(),
        };
        pool.reset(depth);
        pool
    }

    /// Forgets about all the tags and rebuilds the pool with a new depth.
    pub fn reset(&mut self, depth: u8) {
        self.depth = depth.max(1).min(RING_LEN as u8);
        self.free.clear();
        // Tags are popped from the end.
        self.free.extend((0..self.depth).rev());
    }

    /// Total number of tags.
    pub fn depth(&self) -> u8 {
        self.depth
    }

    /// Number of tags that have been taken and not released.
    pub fn in_use(&self) -> usize {
        usize::from(self.depth) - self.free.len()
    }

    /// Takes a free tag, if any.
    pub fn take(&mut self) -> Option<u8> {
        self.free.pop()
    }

    /// Puts back a tag returned by `take`.
    pub fn release(&mut self, tag: u8) {
        // Tags taken before a `reset` are silently discarded.
        if tag >= self.depth || self.free.contains(&tag) {
            log::warn!("release of unknown tag {}", tag);
            return;
        }
        self.free.push(tag);
    }
}

impl fmt::Debug for TagPool {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TagPool")
            .field("depth", &self.depth)
            .field("in_use", &self.in_use())
            .finish()
    }
}

const IDLE: u8 = 0;
const PENDING: u8 = 1;
const DONE: u8 = 2;
const FAILED: u8 = 3;
const ABANDONED: u8 = 4;

/// Outcome of a command, as seen by its issuer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Outcome {
    Done,
    Failed,
}

/// Completion state of one tag.
#[derive(Default)]
pub struct TagSlot {
    status: AtomicU8,
    waker: AtomicWaker,
}

impl TagSlot {
    /// Marks the command as issued.
    pub fn issue(&self) {
        self.status.store(PENDING, Ordering::SeqCst);
    }

    /// Reports the outcome of the command to the issuer.
    ///
    /// Returns true if the issuer has given up waiting, in which case the caller is
    /// responsible for releasing the tag.
    pub fn complete(&self, outcome: Outcome) -> bool {
        let new = match outcome {
            Outcome::Done => DONE,
            Outcome::Failed => FAILED,
        };

        match self
            .status
            .compare_exchange(PENDING, new, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => {
                self.waker.wake();
                false
            }
            Err(ABANDONED) => {
                self.status.store(IDLE, Ordering::SeqCst);
                true
            }
            Err(_) => false,
        }
    }

    /// Called by the issuer when it gives up waiting.
    ///
    /// Returns the outcome if the command has finished in the meantime, in which case the
    /// issuer still owns the tag.
    pub fn abandon(&self) -> Option<Outcome> {
        match self
            .status
            .compare_exchange(PENDING, ABANDONED, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => None,
            Err(DONE) => Some(Outcome::Done),
            Err(_) => Some(Outcome::Failed),
        }
    }

    /// Returns true if the issuer has given up on the command.
    pub fn is_abandoned(&self) -> bool {
        self.status.load(Ordering::SeqCst) == ABANDONED
    }

    /// Checks whether the command has finished. Registers the waker of `cx` otherwise.
    pub fn poll_outcome(&self, cx: &mut Context) -> Poll<Outcome> {
        if let Some(outcome) = self.outcome() {
            return Poll::Ready(outcome);
        }
        self.waker.register(cx.waker());
        match self.outcome() {
            Some(outcome) => Poll::Ready(outcome),
            None => Poll::Pending,
        }
    }

    /// Called by the issuer after it has received the outcome.
    pub fn finish(&self) {
        self.status.store(IDLE, Ordering::SeqCst);
    }

    fn outcome(&self) -> Option<Outcome> {
        match self.status.load(Ordering::SeqCst) {
            DONE => Some(Outcome::Done),
            FAILED => Some(Outcome::Failed),
            _ => None,
        }
    }
}

impl fmt::Debug for TagSlot {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("TagSlot")
            .field(&self.status.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{Outcome, TagPool, TagSlot};

    #[test]
    fn pool_depth_bounds() {
        assert_eq!(TagPool::new(0).depth(), 1);
        assert_eq!(TagPool::new(200).depth(), 32);
    }

    #[test]
    fn release_out_of_order() {
        let mut pool = TagPool::new(3);
        let a = pool.take().unwrap();
        let b = pool.take().unwrap();
        let c = pool.take().unwrap();
        assert_eq!((a, b, c), (0, 1, 2));
        assert!(pool.take().is_none());
        assert_eq!(pool.in_use(), 3);

        pool.release(b);
        pool.release(a);
        assert_eq!(pool.in_use(), 1);
        let mut again = [pool.take().unwrap(), pool.take().unwrap()];
        again.sort();
        assert_eq!(again, [a, b]);
    }

    #[test]
    fn stale_release_ignored() {
        let mut pool = TagPool::new(8);
        let _ = pool.take();
        pool.reset(2);
        pool.release(5);
        pool.release(0);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn abandoned_tag_returned_by_completion() {
        let slot = TagSlot::default();
        slot.issue();
        assert_eq!(slot.abandon(), None);
        assert!(slot.is_abandoned());
        assert!(slot.complete(Outcome::Done));
        assert!(!slot.is_abandoned());
    }

    #[test]
    fn completion_before_abandon() {
        let slot = TagSlot::default();
        slot.issue();
        assert!(!slot.complete(Outcome::Failed));
        assert_eq!(slot.abandon(), Some(Outcome::Failed));
    }
}
