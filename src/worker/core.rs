//! Shared plumbing for every worker channel: a reader task decoding parcels,
//! a serialized writer for request frames, stderr draining and once-only
//! close.

use std::sync::{
   Arc,
   atomic::{AtomicBool, AtomicU64, Ordering},
};

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::{
   io::{AsyncBufReadExt, BufReader},
   process::Child,
   sync::mpsc,
};
use tokio_util::{
   codec::{FramedRead, FramedWrite},
   sync::CancellationToken,
};

use crate::{
   channel::{BoxedReader, BoxedWriter, Channel},
   error::{ChannelError, Error, ProtocolError},
   wire::{Parcel, ParcelCodec, Request, RequestCodec},
};

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Which flavour of handler sits on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
   Worker,
   Watcher,
}

/// Raised once per channel when it fails without being asked to close.
#[derive(Debug, Clone)]
pub struct ChannelFault {
   pub id:    u64,
   pub kind:  ChannelKind,
   pub error: ChannelError,
}

pub type FaultSender = mpsc::UnboundedSender<ChannelFault>;

/// Consumes parcels decoded from a channel.
pub trait ParcelHandler: Send + Sync + 'static {
   /// Handles one parcel. An error is a protocol violation and tears the
   /// channel down.
   fn on_parcel(&self, parcel: Parcel) -> Result<(), ProtocolError>;

   /// Called exactly once when the channel stops, whatever the reason.
   fn on_close(&self, reason: &ChannelError);
}

pub struct ChannelCore<H> {
   id:      u64,
   label:   String,
   kind:    ChannelKind,
   handler: H,
   writer:  tokio::sync::Mutex<FramedWrite<BoxedWriter, RequestCodec>>,
   closing: AtomicBool,
   cancel:  CancellationToken,
   faults:  Option<FaultSender>,
   child:   Mutex<Option<Child>>,
}

impl<H: ParcelHandler> ChannelCore<H> {
   /// Takes ownership of the channel and starts its reader (and stderr) tasks.
   pub fn start(
      channel: Channel,
      kind: ChannelKind,
      handler: H,
      faults: Option<FaultSender>,
   ) -> Arc<Self> {
      let Channel { label, reader, writer, stderr, child } = channel;
      let id = NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed);
      let core = Arc::new(Self {
         id,
         label,
         kind,
         handler,
         writer: tokio::sync::Mutex::new(FramedWrite::new(writer, RequestCodec)),
         closing: AtomicBool::new(false),
         cancel: CancellationToken::new(),
         faults,
         child: Mutex::new(child),
      });

      if let Some(stderr) = stderr {
         tokio::spawn(drain_stderr(core.label.clone(), id, stderr, core.cancel.clone()));
      }
      tokio::spawn(Arc::clone(&core).read_loop(reader));
      core
   }

   pub const fn id(&self) -> u64 {
      self.id
   }

   pub fn label(&self) -> &str {
      &self.label
   }

   pub const fn handler(&self) -> &H {
      &self.handler
   }

   pub fn is_closed(&self) -> bool {
      self.closing.load(Ordering::Acquire)
   }

   async fn read_loop(self: Arc<Self>, reader: BoxedReader) {
      let mut parcels = FramedRead::new(reader, ParcelCodec);
      loop {
         let next = tokio::select! {
            () = self.cancel.cancelled() => break,
            next = parcels.next() => next,
         };
         match next {
            Some(Ok(parcel)) => {
               if let Err(violation) = self.handler.on_parcel(parcel) {
                  self.fail(ChannelError::Violation(violation));
                  break;
               }
            },
            Some(Err(err)) => {
               self.fail(classify(err));
               break;
            },
            None => {
               self.fail(ChannelError::UnexpectedEnd);
               break;
            },
         }
      }
   }

   /// Writes one request frame.
   pub async fn send(&self, request: &Request) -> Result<(), ChannelError> {
      if self.is_closed() {
         return Err(ChannelError::Closed);
      }
      let mut writer = self.writer.lock().await;
      if let Err(err) = writer.send(request).await {
         let err = classify(err);
         self.fail(err.clone());
         return Err(err);
      }
      Ok(())
   }

   /// Tears the channel down because of a fault. Only the first call has any
   /// effect; it reaches the handler and the fault signal.
   pub fn fail(&self, error: ChannelError) {
      if self.closing.swap(true, Ordering::AcqRel) {
         return;
      }
      tracing::warn!(channel = self.id, label = %self.label, "worker channel failed: {error}");
      self.shutdown(&error);
      if let Some(faults) = &self.faults {
         let _ = faults.send(ChannelFault { id: self.id, kind: self.kind, error });
      }
   }

   /// Closes the channel on request. Pending calls fail with
   /// [`ChannelError::Closed`]; no fault is raised.
   pub fn close(&self) {
      if self.closing.swap(true, Ordering::AcqRel) {
         return;
      }
      tracing::debug!(channel = self.id, label = %self.label, "closing worker channel");
      self.shutdown(&ChannelError::Closed);
   }

   fn shutdown(&self, reason: &ChannelError) {
      self.handler.on_close(reason);
      self.cancel.cancel();
      if let Some(mut child) = self.child.lock().take() {
         if let Err(err) = child.start_kill() {
            tracing::debug!(channel = self.id, "failed to kill worker process: {err}");
         }
      }
   }
}

fn classify(err: Error) -> ChannelError {
   match err {
      Error::Protocol(violation) => ChannelError::Violation(violation),
      Error::Channel(channel) => channel,
      Error::Io(io) => ChannelError::Transport(io.to_string()),
      other => ChannelError::Transport(other.to_string()),
   }
}

async fn drain_stderr(label: String, id: u64, stderr: BoxedReader, cancel: CancellationToken) {
   let mut reader = BufReader::new(stderr);
   let mut line = Vec::new();
   loop {
      line.clear();
      let read = tokio::select! {
         () = cancel.cancelled() => break,
         read = reader.read_until(b'\n', &mut line) => read,
      };
      match read {
         Ok(0) => break,
         Ok(_) => {
            let text = String::from_utf8_lossy(&line);
            let text = text.trim();
            if !text.is_empty() {
               tracing::warn!(channel = id, label = %label, "stderr: {text}");
            }
         },
         Err(err) => {
            tracing::debug!(channel = id, "stderr read failed: {err}");
            break;
         },
      }
   }
}
