//! Request/response workers.
//!
//! A [`Worker`] owns one channel and runs exactly one request at a time
//! through an explicit state machine: idle, awaiting a response, or closed.
//! Closing is terminal.

mod core;

use std::{sync::Arc, time::Instant};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tokio::sync::oneshot;

pub use self::core::{ChannelCore, ChannelFault, ChannelKind, FaultSender, ParcelHandler};
use crate::{
   Result,
   channel::Channel,
   diff::{self, DiffOptions},
   error::{ChannelError, Error, ProtocolError, RemoteError},
   wire::{
      EmptyResponse, ErrorBody, ExpandPathResponse, LengthProbe, LsResponse, Opcode, Parcel,
      ParcelType, PathArgs, ReadArgs, ReadHeader, RenameArgs, Request, ServerInfo, WriteArgs,
      WriteDiffArgs,
   },
};

/// Header and concatenated body of one completed response cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
   pub header: Bytes,
   pub body:   Bytes,
}

/// Result of a (possibly conditional) file read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
   /// The remote content hashes to the offered value; no bytes were sent.
   HashMatch,
   Contents(Bytes),
}

struct Pending {
   opcode:   Opcode,
   started:  Instant,
   header:   Option<Bytes>,
   expected: u64,
   body:     BytesMut,
   reply:    oneshot::Sender<Result<RawResponse>>,
}

impl Pending {
   fn finish(self, result: Result<RawResponse>) {
      // The caller may have given up; nothing to do then.
      let _ = self.reply.send(result);
   }
}

enum State {
   Idle,
   Awaiting(Pending),
   Closed(ChannelError),
}

/// Parcel handler enforcing the HEADER, BODY*, ENDOFBODY | ERROR contract.
pub struct ResponseHandler {
   state: Mutex<State>,
}

impl ResponseHandler {
   const fn new() -> Self {
      Self { state: Mutex::new(State::Idle) }
   }

   fn complete(state: &mut State, result: Result<RawResponse>) {
      if let State::Awaiting(pending) = std::mem::replace(state, State::Idle) {
         pending.finish(result);
      }
   }
}

impl ParcelHandler for ResponseHandler {
   fn on_parcel(&self, parcel: Parcel) -> Result<(), ProtocolError> {
      let mut state = self.state.lock();

      match parcel.kind {
         ParcelType::Warning => {
            tracing::warn!("worker warning: {}", String::from_utf8_lossy(&parcel.body));
            return Ok(());
         },
         ParcelType::ChangeNotice => {
            return Err(ProtocolError::UnexpectedParcel(parcel.kind));
         },
         _ => {},
      }

      let State::Awaiting(pending) = &mut *state else {
         return Err(ProtocolError::UnexpectedParcel(parcel.kind));
      };

      match parcel.kind {
         ParcelType::Error => {
            let body: ErrorBody = parcel.decode("error body")?;
            tracing::debug!(
               opcode = ?pending.opcode,
               code = body.code,
               "request failed after {:?}",
               pending.started.elapsed()
            );
            Self::complete(&mut state, Err(RemoteError::new(body.code, body.error).into()));
         },
         ParcelType::Header => {
            if pending.header.is_some() {
               return Err(ProtocolError::OutOfOrder("second header in one response"));
            }
            let probe: LengthProbe = parcel.decode("response header")?;
            tracing::debug!(
               opcode = ?pending.opcode,
               length = ?probe.length,
               "header after {:?}",
               pending.started.elapsed()
            );
            match probe.length {
               None | Some(0) => {
                  let raw = RawResponse { header: parcel.body, body: Bytes::new() };
                  Self::complete(&mut state, Ok(raw));
               },
               Some(len) => {
                  pending.expected = len;
                  pending.body.reserve(len.min(64 * 1024 * 1024) as usize);
                  pending.header = Some(parcel.body);
               },
            }
         },
         ParcelType::Body => {
            if pending.header.is_none() {
               return Err(ProtocolError::OutOfOrder("body before header"));
            }
            pending.body.extend_from_slice(&parcel.body);
         },
         ParcelType::EndOfBody => {
            let Some(header) = pending.header.take() else {
               return Err(ProtocolError::OutOfOrder("end of body before header"));
            };
            let body = std::mem::take(&mut pending.body).freeze();
            if body.len() as u64 != pending.expected {
               tracing::warn!(
                  opcode = ?pending.opcode,
                  "header said {} bytes, body was {} bytes",
                  pending.expected,
                  body.len()
               );
            }
            Self::complete(&mut state, Ok(RawResponse { header, body }));
         },
         ParcelType::Warning | ParcelType::ChangeNotice => {},
      }
      Ok(())
   }

   fn on_close(&self, reason: &ChannelError) {
      let mut state = self.state.lock();
      if let State::Awaiting(pending) = std::mem::replace(&mut *state, State::Closed(reason.clone()))
      {
         pending.finish(Err(reason.clone().into()));
      }
   }
}

/// One serial request/response channel to the remote worker.
///
/// Dropping a `Worker` closes its channel.
pub struct Worker {
   core: Arc<ChannelCore<ResponseHandler>>,
}

impl std::fmt::Debug for Worker {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("Worker")
         .field("id", &self.core.id())
         .field("label", &self.core.label())
         .field("closed", &self.core.is_closed())
         .finish()
   }
}

impl Worker {
   /// Starts a worker on an opened channel. Faults are reported on `faults`.
   pub fn start(channel: Channel, faults: Option<FaultSender>) -> Self {
      let core = ChannelCore::start(channel, ChannelKind::Worker, ResponseHandler::new(), faults);
      Self { core }
   }

   pub fn id(&self) -> u64 {
      self.core.id()
   }

   pub fn is_closed(&self) -> bool {
      self.core.is_closed()
   }

   /// Whether no request is in flight and the channel is open.
   pub fn is_idle(&self) -> bool {
      matches!(*self.core.handler().state.lock(), State::Idle)
   }

   pub fn close(&self) {
      self.core.close();
   }

   /// Sends `request` and waits for its response cycle.
   pub async fn call(&self, request: Request) -> Result<RawResponse> {
      let rx = {
         let mut state = self.core.handler().state.lock();
         match &*state {
            State::Closed(reason) => return Err(reason.clone().into()),
            State::Awaiting(_) => return Err(ProtocolError::RequestInFlight.into()),
            State::Idle => {},
         }
         let (tx, rx) = oneshot::channel();
         *state = State::Awaiting(Pending {
            opcode:   request.opcode(),
            started:  Instant::now(),
            header:   None,
            expected: 0,
            body:     BytesMut::new(),
            reply:    tx,
         });
         rx
      };

      self.core.send(&request).await?;
      rx.await.map_err(|_| ChannelError::Closed)?
   }

   /// Decodes a header into its typed shape. A mismatch is a protocol
   /// violation and closes the channel.
   fn decode<T: DeserializeOwned>(&self, header: &Bytes, what: &'static str) -> Result<T> {
      rmp_serde::from_slice(header).map_err(|e| {
         self.violation(ProtocolError::Decode { what, reason: e.to_string() })
      })
   }

   fn violation(&self, err: ProtocolError) -> Error {
      self.core.fail(ChannelError::Violation(err.clone()));
      err.into()
   }

   async fn call_empty(&self, request: Request, what: &'static str) -> Result<()> {
      let raw = self.call(request).await?;
      let EmptyResponse {} = self.decode(&raw.header, what)?;
      Ok(())
   }

   /// Fetches home directory and cache key. `home` always ends with `/`.
   pub async fn get_server_info(&self) -> Result<ServerInfo> {
      let raw = self.call(Request::GetServerInfo).await?;
      let info: ServerInfo = self.decode(&raw.header, "server info")?;
      Ok(info.normalized())
   }

   pub async fn expand_path(&self, path: &str) -> Result<String> {
      let raw = self.call(Request::ExpandPath(PathArgs::new(path))).await?;
      let response: ExpandPathResponse = self.decode(&raw.header, "expand path")?;
      Ok(response.path)
   }

   pub async fn ls(&self, path: &str) -> Result<LsResponse> {
      let raw = self.call(Request::Ls(PathArgs::new(path))).await?;
      self.decode(&raw.header, "listing")
   }

   /// Reads a file. With `cached_hash` the remote may answer
   /// [`ReadOutcome::HashMatch`] instead of sending the bytes.
   pub async fn read_file(&self, path: &str, cached_hash: Option<&str>) -> Result<ReadOutcome> {
      let request = Request::FileRead(ReadArgs {
         path:        path.to_owned(),
         cached_hash: cached_hash.map(str::to_owned),
      });
      let raw = self.call(request).await?;
      let header: ReadHeader = self.decode(&raw.header, "read header")?;
      if header.hash_match {
         if cached_hash.is_none() {
            return Err(self.violation(ProtocolError::UnexpectedHashMatch));
         }
         return Ok(ReadOutcome::HashMatch);
      }
      Ok(ReadOutcome::Contents(raw.body))
   }

   pub async fn write_file(
      &self,
      path: &str,
      data: Bytes,
      create: bool,
      overwrite: bool,
   ) -> Result<()> {
      let request =
         Request::FileWrite(WriteArgs { path: path.to_owned(), data, create, overwrite });
      self.call_empty(request, "write header").await
   }

   /// Writes `updated` as a diff against `original`, which must be what the
   /// remote currently holds. Fails before sending anything when the diff is
   /// not worth it.
   pub async fn write_file_diff(
      &self,
      path: &str,
      original: &[u8],
      updated: &[u8],
      options: &DiffOptions,
   ) -> Result<()> {
      let diff = diff::build_diff(original, updated, options)?;
      let request = Request::FileWriteDiff(WriteDiffArgs {
         path:        path.to_owned(),
         hash_before: diff::md5_hex(original),
         hash_after:  diff::md5_hex(updated),
         diff,
      });
      self.call_empty(request, "diff write header").await
   }

   pub async fn rename(&self, from: &str, to: &str, overwrite: bool) -> Result<()> {
      let request =
         Request::Rename(RenameArgs { from: from.to_owned(), to: to.to_owned(), overwrite });
      self.call_empty(request, "rename header").await
   }

   pub async fn delete(&self, path: &str) -> Result<()> {
      self
         .call_empty(Request::Delete(PathArgs::new(path)), "delete header")
         .await
   }

   pub async fn mkdir(&self, path: &str) -> Result<()> {
      self
         .call_empty(Request::Mkdir(PathArgs::new(path)), "mkdir header")
         .await
   }
}

impl Drop for Worker {
   fn drop(&mut self) {
      self.core.close();
   }
}
