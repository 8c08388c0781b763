//! Concurrency-limited pool with priority-ordered waiters.
//!
//! Items are either available or checked out, never both. A checkout with no
//! available item suspends; a checkin hands the item straight to the waiter
//! with the lowest priority value, ties broken by arrival order.

use std::{
   cmp::{Ordering, Reverse},
   collections::{BinaryHeap, VecDeque},
   sync::Arc,
};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::{Result, error::Error};

/// Lower values are served first.
pub type Priority = i32;

struct Waiter<T> {
   key: Reverse<(Priority, u64)>,
   tx:  oneshot::Sender<T>,
}

impl<T> PartialEq for Waiter<T> {
   fn eq(&self, other: &Self) -> bool {
      self.key == other.key
   }
}

impl<T> Eq for Waiter<T> {}

impl<T> PartialOrd for Waiter<T> {
   fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
      Some(self.cmp(other))
   }
}

impl<T> Ord for Waiter<T> {
   fn cmp(&self, other: &Self) -> Ordering {
      self.key.cmp(&other.key)
   }
}

struct PoolState<T> {
   available:   VecDeque<T>,
   waiters:     BinaryHeap<Waiter<T>>,
   registered:  usize,
   checked_out: usize,
   next_seq:    u64,
   closed:      bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
   pub registered:  usize,
   pub available:   usize,
   pub checked_out: usize,
   pub waiting:     usize,
}

pub struct PriorityPool<T> {
   inner: Arc<Mutex<PoolState<T>>>,
}

impl<T> Clone for PriorityPool<T> {
   fn clone(&self) -> Self {
      Self { inner: Arc::clone(&self.inner) }
   }
}

impl<T> Default for PriorityPool<T> {
   fn default() -> Self {
      Self::new()
   }
}

impl<T> std::fmt::Debug for PriorityPool<T> {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("PriorityPool")
         .field("stats", &self.stats())
         .finish()
   }
}

impl<T> PriorityPool<T> {
   pub fn new() -> Self {
      Self {
         inner: Arc::new(Mutex::new(PoolState {
            available:   VecDeque::new(),
            waiters:     BinaryHeap::new(),
            registered:  0,
            checked_out: 0,
            next_seq:    0,
            closed:      false,
         })),
      }
   }

   /// Registers a new item and makes it available. Returns the item back if
   /// the pool is closed.
   pub fn add(&self, item: T) -> std::result::Result<(), T> {
      let mut state = self.inner.lock();
      if state.closed {
         return Err(item);
      }
      state.registered += 1;
      state.checked_out += 1;
      Self::release(&mut state, item);
      Ok(())
   }

   /// Returns a checked-out item, handing it to the best waiter if any.
   pub fn checkin(&self, item: T) {
      let mut state = self.inner.lock();
      if state.closed {
         state.checked_out = state.checked_out.saturating_sub(1);
         state.registered = state.registered.saturating_sub(1);
         return;
      }
      Self::release(&mut state, item);
   }

   fn release(state: &mut PoolState<T>, mut item: T) {
      while let Some(waiter) = state.waiters.pop() {
         match waiter.tx.send(item) {
            Ok(()) => return,
            // the waiter gave up; try the next one
            Err(back) => item = back,
         }
      }
      state.checked_out -= 1;
      state.available.push_back(item);
   }

   /// Takes an item, waiting behind higher-priority callers if none is free.
   pub async fn checkout(&self, priority: Priority) -> Result<T> {
      let rx = {
         let mut state = self.inner.lock();
         if state.closed {
            return Err(Error::PoolClosed);
         }
         if let Some(item) = state.available.pop_front() {
            state.checked_out += 1;
            return Ok(item);
         }
         let (tx, rx) = oneshot::channel();
         let seq = state.next_seq;
         state.next_seq += 1;
         state.waiters.push(Waiter { key: Reverse((priority, seq)), tx });
         rx
      };

      let mut guard = WaitGuard { pool: self, rx: Some(rx) };
      let Some(rx) = guard.rx.as_mut() else {
         return Err(Error::PoolClosed);
      };
      let received = rx.await;
      guard.rx = None;
      received.map_err(|_| Error::PoolClosed)
   }

   /// Forgets a checked-out item that will not come back. Closes the pool
   /// when nothing is left.
   pub fn retire(&self) {
      let mut state = self.inner.lock();
      state.checked_out = state.checked_out.saturating_sub(1);
      state.registered = state.registered.saturating_sub(1);
      if state.registered == 0 && !state.closed {
         tracing::warn!("worker pool lost its last item, closing");
         state.closed = true;
         state.waiters.clear();
      }
   }

   /// Unregisters every available item for which `keep` returns false and
   /// hands them back. Closes the pool when nothing is left.
   pub fn retain(&self, mut keep: impl FnMut(&T) -> bool) -> Vec<T> {
      let mut state = self.inner.lock();
      let mut removed = Vec::new();
      let mut kept = VecDeque::with_capacity(state.available.len());
      for item in state.available.drain(..) {
         if keep(&item) {
            kept.push_back(item);
         } else {
            removed.push(item);
         }
      }
      state.available = kept;
      state.registered -= removed.len();
      if state.registered == 0 && !state.closed {
         tracing::warn!("worker pool lost its last item, closing");
         state.closed = true;
         state.waiters.clear();
      }
      removed
   }

   /// Closes the pool: waiters fail, later checkouts fail, and the available
   /// items are handed back for disposal.
   pub fn close(&self) -> Vec<T> {
      let mut state = self.inner.lock();
      state.closed = true;
      state.waiters.clear();
      let drained: Vec<T> = state.available.drain(..).collect();
      state.registered -= drained.len();
      drained
   }

   pub fn is_closed(&self) -> bool {
      self.inner.lock().closed
   }

   pub fn stats(&self) -> PoolStats {
      let state = self.inner.lock();
      PoolStats {
         registered:  state.registered,
         available:   state.available.len(),
         checked_out: state.checked_out,
         waiting:     state.waiters.iter().filter(|w| !w.tx.is_closed()).count(),
      }
   }
}

/// Puts back an item that was delivered to a checkout that was dropped
/// before it could observe it.
struct WaitGuard<'a, T> {
   pool: &'a PriorityPool<T>,
   rx:   Option<oneshot::Receiver<T>>,
}

impl<T> Drop for WaitGuard<'_, T> {
   fn drop(&mut self) {
      if let Some(mut rx) = self.rx.take() {
         rx.close();
         if let Ok(item) = rx.try_recv() {
            self.pool.checkin(item);
         }
      }
   }
}
