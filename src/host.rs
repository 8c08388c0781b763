//! Cache-aware filesystem client for one remote host.
//!
//! `Host` is what callers talk to. It connects lazily, answers stat and
//! listing lookups from the metadata cache when it can, reads files through
//! the encrypted content cache with conditional reads, prefers diff writes
//! when a cached copy of the old content exists, and keeps both caches
//! coherent with its own mutations.

use std::{
   collections::HashMap,
   io,
   sync::{
      Arc,
      atomic::{AtomicU64, Ordering},
   },
};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
   Result,
   cache::{CachedFile, ContentCache, GcReport, GcSchedule, Listing, MetadataCache, gc, join_path},
   channel::ChannelOpener,
   config::Config,
   connection::Connection,
   diff::DiffOptions,
   error::{Error, ProtocolError, RemoteError},
   pool::Priority,
   watch::{ChangeListener, WatchRegistry},
   wire::{ErrorCode, LsResponse, ServerInfo, Stat},
   worker::ReadOutcome,
};

/// Runs blocking cache I/O off the async executor.
async fn blocking<T, F>(f: F) -> Result<T>
where
   T: Send + 'static,
   F: FnOnce() -> T + Send + 'static,
{
   tokio::task::spawn_blocking(f)
      .await
      .map_err(|e| Error::Io(io::Error::other(e)))
}

#[derive(Debug, Clone)]
struct WatchSpec {
   path:      String,
   recursive: bool,
   excludes:  Vec<String>,
}

pub struct Host {
   opener:            Arc<dyn ChannelOpener>,
   secondary_workers: usize,
   diff_options:      DiffOptions,
   gc_schedule:       GcSchedule,

   meta:    Arc<MetadataCache>,
   content: Arc<ContentCache>,

   registry:      Arc<WatchRegistry>,
   watches:       Mutex<HashMap<u64, WatchSpec>>,
   next_watch_id: AtomicU64,

   connection: tokio::sync::Mutex<Option<Arc<Connection>>>,
   gc_token:   CancellationToken,
   gc_task:    Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Host {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("Host")
         .field("remote", &self.opener.describe())
         .field("content", &self.content)
         .field("watches", &self.watches.lock().len())
         .finish()
   }
}

impl Host {
   /// Creates a host whose content cache lives in the per-host directory
   /// under `config.cache_dir`. Nothing is opened until first use.
   pub fn new(opener: Arc<dyn ChannelOpener>, config: &Config) -> Self {
      let cache_dir = config.host_cache_dir(&opener.describe());
      Self {
         opener,
         secondary_workers: config.secondary_workers,
         diff_options: config.diff_options(),
         gc_schedule: config.gc_schedule(),
         meta: Arc::new(MetadataCache::new(config.metadata_ttl())),
         content: Arc::new(ContentCache::new(cache_dir, config.max_segment_len)),
         registry: Arc::new(WatchRegistry::new()),
         watches: Mutex::new(HashMap::new()),
         next_watch_id: AtomicU64::new(1),
         connection: tokio::sync::Mutex::new(None),
         gc_token: CancellationToken::new(),
         gc_task: Mutex::new(None),
      }
   }

   pub fn content_cache(&self) -> &ContentCache {
      &self.content
   }

   pub fn metadata_cache(&self) -> &MetadataCache {
      &self.meta
   }

   /// Returns the live connection, establishing (or re-establishing) it if
   /// needed.
   pub async fn connect(&self) -> Result<Arc<Connection>> {
      let mut slot = self.connection.lock().await;
      if let Some(conn) = slot.as_ref().filter(|conn| !conn.is_closed()) {
         return Ok(Arc::clone(conn));
      }
      if let Some(stale) = slot.take() {
         tracing::info!(remote = %stale.label(), "connection lost, reconnecting");
         stale.close();
         self.meta.clear();
      }

      let listener: Arc<dyn ChangeListener> = self.registry.clone();
      let conn = Arc::new(
         Connection::connect(
            Arc::clone(&self.opener),
            self.secondary_workers,
            Arc::clone(&self.meta),
            listener,
         )
         .await?,
      );

      let info = conn.server_info().clone();
      let content = Arc::clone(&self.content);
      let keyed = blocking(move || content.set_key(&info.cache_key, info.new_cache_key)).await?;
      if let Err(err) = keyed {
         tracing::warn!("content cache disabled for this session: {err}");
      }

      let specs: Vec<(u64, WatchSpec)> =
         self.watches.lock().iter().map(|(id, spec)| (*id, spec.clone())).collect();
      for (id, spec) in specs {
         match conn
            .add_watch(id, &spec.path, spec.recursive, &spec.excludes)
            .await
         {
            Ok(true) => tracing::debug!(id, path = %spec.path, "watch re-added"),
            Ok(false) => {},
            Err(err) => tracing::warn!(id, path = %spec.path, "failed to re-add watch: {err}"),
         }
      }

      self.start_gc();
      *slot = Some(Arc::clone(&conn));
      Ok(conn)
   }

   fn start_gc(&self) {
      let mut task = self.gc_task.lock();
      if task.is_none() {
         *task = Some(gc::spawn_gc(
            self.content.root().to_path_buf(),
            self.gc_schedule,
            self.gc_token.child_token(),
         ));
      }
   }

   /// Sweeps the content cache now, outside the regular schedule.
   pub async fn run_gc(&self) -> Result<GcReport> {
      let root = self.content.root().to_path_buf();
      let retention = self.gc_schedule.retention;
      Ok(blocking(move || gc::sweep(&root, retention, std::time::SystemTime::now())).await??)
   }

   pub async fn server_info(&self) -> Result<ServerInfo> {
      Ok(self.connect().await?.server_info().clone())
   }

   async fn cache_ls(&self, conn: &Connection, priority: Priority, path: &str) -> Result<LsResponse> {
      let response = conn
         .with_worker(priority, |worker| async move { worker.ls(path).await })
         .await?;
      self.meta.set_stat(path, response.stat);
      for (dir, listing) in response.dirs.iter() {
         self.meta.set_listing(&join_path(path, dir), listing);
      }
      Ok(response)
   }

   pub async fn stat(&self, priority: Priority, path: &str) -> Result<Stat> {
      let conn = self.connect().await?;
      if let Some(stat) = self.meta.get_stat(path) {
         return Ok(stat);
      }
      Ok(self.cache_ls(&conn, priority, path).await?.stat)
   }

   pub async fn ls(&self, priority: Priority, path: &str) -> Result<Listing> {
      let conn = self.connect().await?;
      if let Some(listing) = self.meta.get_listing(path) {
         return Ok(listing);
      }
      let response = self.cache_ls(&conn, priority, path).await?;
      if !response.stat.kind.is_dir() {
         return Err(
            RemoteError::new(ErrorCode::Enotdir.code(), format!("{path} is not a directory")).into(),
         );
      }
      let entries = response
         .dirs
         .iter()
         .find(|(dir, _)| dir.as_str() == ".")
         .map(|(_, listing)| listing.iter().map(|(name, stat)| (name.clone(), stat.kind)).collect())
         .unwrap_or_default();
      Ok(Arc::new(entries))
   }

   /// Reads a file, offering the hash of any cached copy so unchanged files
   /// are not transferred again.
   pub async fn read_file(&self, priority: Priority, path: &str) -> Result<Bytes> {
      let conn = self.connect().await?;

      let content = Arc::clone(&self.content);
      let remote = path.to_owned();
      let cached = blocking(move || {
         content
            .get_file(&remote, true)
            .and_then(|found| Some((found.hash()?, found.contents?)))
      })
      .await?;
      let offered = cached.as_ref().map(|(hash, _)| hash.as_str());

      let outcome = conn
         .with_worker(priority, |worker| async move { worker.read_file(path, offered).await })
         .await?;

      match (outcome, cached) {
         (ReadOutcome::HashMatch, Some((_, contents))) => {
            tracing::debug!(path, "cached copy is current");
            let content = Arc::clone(&self.content);
            let remote = path.to_owned();
            blocking(move || content.touch(&remote)).await?;
            Ok(contents)
         },
         (ReadOutcome::Contents(bytes), _) => {
            let content = Arc::clone(&self.content);
            let remote = path.to_owned();
            let data = bytes.clone();
            blocking(move || content.set_file(&remote, &data)).await?;
            Ok(bytes)
         },
         (ReadOutcome::HashMatch, None) => Err(ProtocolError::UnexpectedHashMatch.into()),
      }
   }

   /// Writes a file. When overwriting a file whose previous content is
   /// cached, a diff is tried first; any failure falls back to sending the
   /// whole file.
   pub async fn write_file(
      &self,
      priority: Priority,
      path: &str,
      data: Bytes,
      create: bool,
      overwrite: bool,
   ) -> Result<()> {
      let conn = self.connect().await?;

      let mut sent_diff = false;
      if overwrite {
         let content = Arc::clone(&self.content);
         let remote = path.to_owned();
         let original = blocking(move || content.get_file(&remote, true).and_then(|f| f.contents))
            .await?;
         if let Some(original) = original {
            let options = self.diff_options;
            let updated = &data;
            let diffed = conn
               .with_worker(priority, |worker| async move {
                  worker
                     .write_file_diff(path, &original, updated, &options)
                     .await
               })
               .await;
            match diffed {
               Ok(()) => sent_diff = true,
               Err(err) => tracing::debug!(path, "sending whole file instead of diff: {err}"),
            }
         }
      }

      if !sent_diff {
         let payload = data.clone();
         conn
            .with_worker(priority, |worker| async move {
               worker.write_file(path, payload, create, overwrite).await
            })
            .await?;
      }

      self.meta.invalidate_entry(path);
      let content = Arc::clone(&self.content);
      let remote = path.to_owned();
      blocking(move || content.set_file(&remote, &data)).await?;
      Ok(())
   }

   pub async fn rename(&self, priority: Priority, from: &str, to: &str, overwrite: bool) -> Result<()> {
      let conn = self.connect().await?;
      conn
         .with_worker(priority, |worker| async move { worker.rename(from, to, overwrite).await })
         .await?;

      self.meta.invalidate_entry(from);
      self.meta.invalidate_entry(to);
      self.meta.clear_listing(from);
      self.meta.clear_listing(to);
      let content = Arc::clone(&self.content);
      let (from, to) = (from.to_owned(), to.to_owned());
      blocking(move || {
         content.remove(&from);
         content.remove(&to);
      })
      .await
   }

   pub async fn delete(&self, priority: Priority, path: &str) -> Result<()> {
      let conn = self.connect().await?;
      conn
         .with_worker(priority, |worker| async move { worker.delete(path).await })
         .await?;

      self.meta.invalidate_entry(path);
      self.meta.clear_listing(path);
      let content = Arc::clone(&self.content);
      let remote = path.to_owned();
      blocking(move || content.remove(&remote)).await
   }

   pub async fn mkdir(&self, priority: Priority, path: &str) -> Result<()> {
      let conn = self.connect().await?;
      conn
         .with_worker(priority, |worker| async move { worker.mkdir(path).await })
         .await?;
      self.meta.invalidate_entry(path);
      Ok(())
   }

   pub async fn expand_path(&self, priority: Priority, path: &str) -> Result<String> {
      let conn = self.connect().await?;
      conn
         .with_worker(priority, |worker| async move { worker.expand_path(path).await })
         .await
   }

   /// Registers a watch and returns its id. Changes are delivered to
   /// `listener` after the metadata cache has been invalidated. The watch
   /// survives reconnects.
   pub async fn add_watch(
      &self,
      path: &str,
      recursive: bool,
      excludes: Vec<String>,
      listener: Arc<dyn ChangeListener>,
   ) -> Result<u64> {
      let conn = self.connect().await?;
      let id = self.next_watch_id.fetch_add(1, Ordering::Relaxed);
      self.registry.insert(id, listener);
      let spec = WatchSpec { path: path.to_owned(), recursive, excludes };
      let registered = conn
         .add_watch(id, &spec.path, spec.recursive, &spec.excludes)
         .await;
      self.watches.lock().insert(id, spec);
      if !registered? {
         tracing::warn!(id, path, "no watch channel; changes will not be reported until reconnect");
      }
      Ok(id)
   }

   pub async fn remove_watch(&self, id: u64) -> Result<()> {
      self.watches.lock().remove(&id);
      self.registry.remove(id);
      let conn = self.connect().await?;
      conn.remove_watch(id).await?;
      Ok(())
   }

   /// Looks up the cached copy of `path` without contacting the remote.
   pub async fn cached_file(&self, path: &str) -> Result<Option<CachedFile>> {
      let content = Arc::clone(&self.content);
      let remote = path.to_owned();
      blocking(move || content.get_file(&remote, true)).await
   }

   /// Closes the connection and stops GC.
   pub async fn close(&self) {
      self.gc_token.cancel();
      if let Some(task) = self.gc_task.lock().take() {
         task.abort();
      }
      if let Some(conn) = self.connection.lock().await.take() {
         conn.close();
      }
   }
}

impl Drop for Host {
   fn drop(&mut self) {
      self.gc_token.cancel();
   }
}
