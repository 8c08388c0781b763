//! Push-only watch channel.
//!
//! The client registers watches with fire-and-forget requests; the remote
//! pushes change notices, warnings and errors whenever it likes. Every
//! change invalidates the metadata cache before it is forwarded.

use std::{collections::HashMap, sync::Arc};

use parking_lot::RwLock;

use crate::{
   cache::MetadataCache,
   channel::Channel,
   error::{ChannelError, ProtocolError},
   wire::{
      AddWatchArgs, ChangeKind, ChangeNotice, ErrorBody, Parcel, ParcelType, RemoveWatchArgs,
      Request,
   },
   worker::{ChannelCore, ChannelKind, FaultSender, ParcelHandler},
};

/// Receives `(watch id, path, change kind)` triples.
pub trait ChangeListener: Send + Sync {
   fn on_change(&self, watch_id: u64, path: &str, kind: ChangeKind);
}

impl<F> ChangeListener for F
where
   F: Fn(u64, &str, ChangeKind) + Send + Sync,
{
   fn on_change(&self, watch_id: u64, path: &str, kind: ChangeKind) {
      self(watch_id, path, kind);
   }
}

/// Routes changes to the listener registered for their watch id.
#[derive(Default)]
pub struct WatchRegistry {
   listeners: RwLock<HashMap<u64, Arc<dyn ChangeListener>>>,
}

impl std::fmt::Debug for WatchRegistry {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("WatchRegistry")
         .field("watches", &self.listeners.read().len())
         .finish()
   }
}

impl WatchRegistry {
   pub fn new() -> Self {
      Self::default()
   }

   pub fn insert(&self, id: u64, listener: Arc<dyn ChangeListener>) {
      self.listeners.write().insert(id, listener);
   }

   pub fn remove(&self, id: u64) -> bool {
      self.listeners.write().remove(&id).is_some()
   }

   pub fn len(&self) -> usize {
      self.listeners.read().len()
   }

   pub fn is_empty(&self) -> bool {
      self.listeners.read().is_empty()
   }
}

impl ChangeListener for WatchRegistry {
   fn on_change(&self, watch_id: u64, path: &str, kind: ChangeKind) {
      let listener = self.listeners.read().get(&watch_id).cloned();
      match listener {
         Some(listener) => listener.on_change(watch_id, path, kind),
         None => tracing::debug!(watch_id, path, "change for unknown watch"),
      }
   }
}

/// Parcel handler for the watcher: push parcels only, never a response cycle.
pub struct PushHandler {
   meta:     Arc<MetadataCache>,
   listener: Arc<dyn ChangeListener>,
}

impl PushHandler {
   pub fn new(meta: Arc<MetadataCache>, listener: Arc<dyn ChangeListener>) -> Self {
      Self { meta, listener }
   }

   fn dispatch(&self, notice: ChangeNotice) {
      for (watch_id, changes) in notice {
         for (path, kind) in changes {
            self.meta.invalidate_entry(&path);
            self.listener.on_change(watch_id, &path, kind);
         }
      }
   }
}

impl ParcelHandler for PushHandler {
   fn on_parcel(&self, parcel: Parcel) -> Result<(), ProtocolError> {
      match parcel.kind {
         ParcelType::ChangeNotice => match parcel.decode::<ChangeNotice>("change notice") {
            Ok(notice) => self.dispatch(notice),
            Err(err) => tracing::warn!("dropping undecodable change notice: {err}"),
         },
         ParcelType::Warning => {
            tracing::warn!("watcher warning: {}", String::from_utf8_lossy(&parcel.body));
         },
         ParcelType::Error => match parcel.decode::<ErrorBody>("watcher error") {
            Ok(body) => tracing::error!(code = body.code, "watcher error: {}", body.error),
            Err(err) => tracing::error!("watcher error with unreadable body: {err}"),
         },
         ParcelType::Header | ParcelType::Body | ParcelType::EndOfBody => {
            return Err(ProtocolError::UnexpectedParcel(parcel.kind));
         },
      }
      Ok(())
   }

   fn on_close(&self, reason: &ChannelError) {
      tracing::debug!("watch channel stopped: {reason}");
   }
}

/// The push-only watch channel. Dropping it closes the channel.
pub struct WatchChannel {
   core: Arc<ChannelCore<PushHandler>>,
}

impl std::fmt::Debug for WatchChannel {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("WatchChannel")
         .field("id", &self.core.id())
         .field("closed", &self.core.is_closed())
         .finish()
   }
}

impl WatchChannel {
   pub fn start(
      channel: Channel,
      meta: Arc<MetadataCache>,
      listener: Arc<dyn ChangeListener>,
      faults: Option<FaultSender>,
   ) -> Self {
      let handler = PushHandler::new(meta, listener);
      Self { core: ChannelCore::start(channel, ChannelKind::Watcher, handler, faults) }
   }

   pub fn id(&self) -> u64 {
      self.core.id()
   }

   pub async fn add_watch(
      &self,
      id: u64,
      path: &str,
      recursive: bool,
      excludes: &[String],
   ) -> Result<(), ChannelError> {
      let request = Request::AddWatch(AddWatchArgs {
         id,
         path: path.to_owned(),
         recursive,
         excludes: excludes.to_vec(),
      });
      self.core.send(&request).await
   }

   pub async fn remove_watch(&self, id: u64) -> Result<(), ChannelError> {
      self
         .core
         .send(&Request::RemoveWatch(RemoveWatchArgs { id }))
         .await
   }

   pub fn is_closed(&self) -> bool {
      self.core.is_closed()
   }

   pub fn close(&self) {
      self.core.close();
   }
}

impl Drop for WatchChannel {
   fn drop(&mut self) {
      self.core.close();
   }
}
