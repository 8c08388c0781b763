//! One live session with a remote host: a pool of workers plus the optional
//! watch channel.

use std::{
   future::Future,
   ops::Deref,
   sync::{
      Arc,
      atomic::{AtomicBool, Ordering},
   },
};

use parking_lot::Mutex;
use tokio::{sync::mpsc, task::JoinHandle};

use crate::{
   Result,
   cache::MetadataCache,
   channel::ChannelOpener,
   error::ChannelError,
   pool::{PoolStats, Priority, PriorityPool},
   watch::{ChangeListener, WatchChannel},
   wire::ServerInfo,
   worker::{ChannelFault, ChannelKind, FaultSender, Worker},
};

type WatchSlot = Arc<Mutex<Option<Arc<WatchChannel>>>>;

/// A checked-out worker. Dropping the lease returns the worker to the pool if
/// it is idle and open; otherwise the worker is closed and retired.
pub struct WorkerLease {
   worker: Arc<Worker>,
   pool:   PriorityPool<Arc<Worker>>,
}

impl Deref for WorkerLease {
   type Target = Worker;

   fn deref(&self) -> &Worker {
      &self.worker
   }
}

impl WorkerLease {
   /// A shared handle to the leased worker, for futures that must own it.
   pub fn handle(&self) -> Arc<Worker> {
      Arc::clone(&self.worker)
   }
}

impl Drop for WorkerLease {
   fn drop(&mut self) {
      if !self.worker.is_closed() && self.worker.is_idle() {
         self.pool.checkin(Arc::clone(&self.worker));
      } else {
         // Closed, or abandoned mid-request with a response still due.
         self.worker.close();
         self.pool.retire();
      }
   }
}

pub struct Connection {
   label:       String,
   server_info: ServerInfo,
   pool:        PriorityPool<Arc<Worker>>,
   watcher:     WatchSlot,
   tasks:       Mutex<Vec<JoinHandle<()>>>,
   closed:      AtomicBool,
}

impl std::fmt::Debug for Connection {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("Connection")
         .field("label", &self.label)
         .field("home", &self.server_info.home)
         .field("pool", &self.pool.stats())
         .field("watcher", &self.watcher.lock().is_some())
         .finish()
   }
}

impl Connection {
   /// Opens the primary worker, then fetches server info while the watch
   /// channel comes up. Secondary workers are opened in the background.
   pub async fn connect(
      opener: Arc<dyn ChannelOpener>,
      secondary_workers: usize,
      meta: Arc<MetadataCache>,
      listener: Arc<dyn ChangeListener>,
   ) -> Result<Self> {
      let label = opener.describe();
      tracing::info!(remote = %label, "opening workers");

      let (faults, fault_rx) = mpsc::unbounded_channel();
      let primary = Worker::start(opener.open_worker().await?, Some(faults.clone()));

      let open_watcher = async {
         match opener.open_watcher().await {
            Ok(channel) => {
               Some(Arc::new(WatchChannel::start(channel, meta, listener, Some(faults.clone()))))
            },
            Err(err) => {
               tracing::warn!(remote = %label, "watcher unavailable, changes will not be pushed: {err}");
               None
            },
         }
      };
      let (info, watcher) = tokio::join!(primary.get_server_info(), open_watcher);
      let server_info = match info {
         Ok(info) => info,
         Err(err) => {
            if let Some(watcher) = watcher {
               watcher.close();
            }
            return Err(err);
         },
      };
      tracing::info!(remote = %label, home = %server_info.home, "connected");

      let pool = PriorityPool::new();
      let _ = pool.add(Arc::new(primary));
      let watcher: WatchSlot = Arc::new(Mutex::new(watcher));

      let secondaries = tokio::spawn(open_secondaries(
         Arc::clone(&opener),
         pool.clone(),
         secondary_workers,
         faults,
      ));
      let fault_task = tokio::spawn(handle_faults(fault_rx, pool.clone(), Arc::clone(&watcher)));

      Ok(Self {
         label,
         server_info,
         pool,
         watcher,
         tasks: Mutex::new(vec![secondaries, fault_task]),
         closed: AtomicBool::new(false),
      })
   }

   pub const fn server_info(&self) -> &ServerInfo {
      &self.server_info
   }

   pub fn label(&self) -> &str {
      &self.label
   }

   pub fn pool_stats(&self) -> PoolStats {
      self.pool.stats()
   }

   pub fn has_watcher(&self) -> bool {
      self.watcher.lock().as_ref().is_some_and(|w| !w.is_closed())
   }

   pub fn is_closed(&self) -> bool {
      self.closed.load(Ordering::Acquire) || self.pool.is_closed()
   }

   /// Checks out a live worker, retiring dead ones found on the way.
   pub async fn lease(&self, priority: Priority) -> Result<WorkerLease> {
      if self.closed.load(Ordering::Acquire) {
         return Err(ChannelError::Closed.into());
      }
      loop {
         let worker = self.pool.checkout(priority).await?;
         if worker.is_closed() {
            tracing::debug!(worker = worker.id(), "retiring closed worker");
            self.pool.retire();
            continue;
         }
         return Ok(WorkerLease { worker, pool: self.pool.clone() });
      }
   }

   /// Runs `f` with exclusive use of one worker. The worker goes back to the
   /// pool however `f` ends.
   pub async fn with_worker<F, Fut, R>(&self, priority: Priority, f: F) -> Result<R>
   where
      F: FnOnce(Arc<Worker>) -> Fut,
      Fut: Future<Output = Result<R>>,
   {
      let lease = self.lease(priority).await?;
      let result = f(lease.handle()).await;
      drop(lease);
      result
   }

   fn watch_channel(&self) -> Option<Arc<WatchChannel>> {
      self.watcher.lock().clone().filter(|w| !w.is_closed())
   }

   /// Registers a watch. Returns false when no watch channel is available.
   pub async fn add_watch(
      &self,
      id: u64,
      path: &str,
      recursive: bool,
      excludes: &[String],
   ) -> Result<bool> {
      let Some(watcher) = self.watch_channel() else {
         return Ok(false);
      };
      watcher.add_watch(id, path, recursive, excludes).await?;
      Ok(true)
   }

   pub async fn remove_watch(&self, id: u64) -> Result<bool> {
      let Some(watcher) = self.watch_channel() else {
         return Ok(false);
      };
      watcher.remove_watch(id).await?;
      Ok(true)
   }

   /// Closes every worker and the watch channel. Waiting callers fail.
   pub fn close(&self) {
      if self.closed.swap(true, Ordering::AcqRel) {
         return;
      }
      tracing::debug!(remote = %self.label, "closing connection");
      for task in self.tasks.lock().drain(..) {
         task.abort();
      }
      for worker in self.pool.close() {
         worker.close();
      }
      if let Some(watcher) = self.watcher.lock().take() {
         watcher.close();
      }
   }
}

impl Drop for Connection {
   fn drop(&mut self) {
      self.close();
   }
}

async fn open_secondaries(
   opener: Arc<dyn ChannelOpener>,
   pool: PriorityPool<Arc<Worker>>,
   count: usize,
   faults: FaultSender,
) {
   let opens = (0..count).map(|_| opener.open_worker());
   let mut opened = 0;
   for result in futures::future::join_all(opens).await {
      match result {
         Ok(channel) => {
            let worker = Arc::new(Worker::start(channel, Some(faults.clone())));
            if let Err(worker) = pool.add(worker) {
               worker.close();
               return;
            }
            opened += 1;
         },
         Err(err) => tracing::debug!("secondary worker failed to open: {err}"),
      }
   }
   tracing::debug!(opened, requested = count, "secondary workers ready");
}

async fn handle_faults(
   mut faults: mpsc::UnboundedReceiver<ChannelFault>,
   pool: PriorityPool<Arc<Worker>>,
   watcher: WatchSlot,
) {
   while let Some(fault) = faults.recv().await {
      match fault.kind {
         ChannelKind::Watcher => {
            let mut slot = watcher.lock();
            if slot.as_ref().is_some_and(|w| w.id() == fault.id) {
               tracing::warn!("watch channel lost: {}", fault.error);
               *slot = None;
            }
         },
         ChannelKind::Worker => {
            let dead = pool.retain(|worker| !worker.is_closed());
            tracing::debug!(worker = fault.id, retired = dead.len(), "worker fault: {}", fault.error);
         },
      }
   }
}
