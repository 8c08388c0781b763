#![allow(dead_code)]

//! An in-process stand-in for the remote worker. It speaks the wire protocol
//! over `tokio::io::duplex` pipes and serves a temporary directory.

use std::{
   collections::HashMap,
   fs,
   io,
   os::unix::fs::MetadataExt,
   path::{Path, PathBuf},
   sync::{
      Arc,
      atomic::{AtomicUsize, Ordering},
   },
   time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use ponyfs::{
   channel::{Channel, ChannelOpener},
   config::Config,
   diff,
   error::{ChannelError, DiffError},
   wire::{
      ChangeKind, ChangeNotice, EmptyResponse, ErrorBody, ErrorCode, ExpandPathResponse, FileType,
      LsResponse, OrderedMap, Parcel, ParcelCodec, ParcelType, ReadHeader, Request, RequestCodec,
      Stat,
   },
};
use serde::Serialize;
use tempfile::TempDir;
use tokio::{io::DuplexStream, sync::mpsc};
use tokio_util::{
   codec::{FramedRead, FramedWrite},
   sync::CancellationToken,
};

pub const DEFAULT_CHUNK: usize = 200 * 1024;

#[derive(Default)]
pub struct Counters {
   pub requests:       AtomicUsize,
   pub body_parcels:   AtomicUsize,
   pub hash_matches:   AtomicUsize,
   pub diff_writes:    AtomicUsize,
   pub full_writes:    AtomicUsize,
   pub ls_calls:       AtomicUsize,
   pub workers_opened: AtomicUsize,
}

impl Counters {
   pub fn get(counter: &AtomicUsize) -> usize {
      counter.load(Ordering::SeqCst)
   }
}

struct RemoteState {
   root:         PathBuf,
   chunk_size:   AtomicUsize,
   worker_limit: AtomicUsize,
   fail_watcher: Mutex<bool>,
   counters:     Counters,
   watches:      Mutex<HashMap<u64, String>>,
   watcher_tx:   Mutex<Option<mpsc::UnboundedSender<Parcel>>>,
   cancel:       Mutex<CancellationToken>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum KeyWire {
   Str(String),
   Bin(Bytes),
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InfoWire {
   home:          String,
   cache_key:     KeyWire,
   new_cache_key: bool,
}

fn header<T: Serialize>(value: &T) -> Parcel {
   Parcel::new(ParcelType::Header, rmp_serde::to_vec_named(value).unwrap())
}

fn error(code: ErrorCode, message: impl Into<String>) -> Vec<Parcel> {
   let body = ErrorBody { code: code.code(), error: message.into() };
   vec![Parcel::new(ParcelType::Error, rmp_serde::to_vec_named(&body).unwrap())]
}

fn io_error(err: &io::Error) -> Vec<Parcel> {
   let code = match err.kind() {
      io::ErrorKind::NotFound => ErrorCode::Enoent,
      io::ErrorKind::AlreadyExists => ErrorCode::Eexist,
      io::ErrorKind::PermissionDenied => ErrorCode::Eacces,
      _ => ErrorCode::Eio,
   };
   error(code, err.to_string())
}

fn stat_of(path: &Path) -> io::Result<Stat> {
   let link = fs::symlink_metadata(path)?;
   let meta = fs::metadata(path).unwrap_or_else(|_| link.clone());
   let mut kind = if meta.is_dir() {
      FileType::DIRECTORY
   } else if meta.is_file() {
      FileType::FILE
   } else {
      FileType::UNKNOWN
   };
   if link.file_type().is_symlink() {
      kind = kind.with(FileType::SYMLINK);
   }
   Ok(Stat { kind, ctime: meta.ctime(), mtime: meta.mtime(), size: meta.len() })
}

impl RemoteState {
   fn handle(&self, request: Request) -> Vec<Parcel> {
      match request {
         Request::GetServerInfo => self.server_info(),
         Request::ExpandPath(args) => {
            let path = match args.path.strip_prefix('~') {
               Some(rest) => format!("{}{rest}", self.root.display()),
               None => args.path,
            };
            let target = Path::new(&path);
            if !target.exists() {
               error(ErrorCode::Enoent, "Path not found")
            } else if !target.is_dir() {
               error(ErrorCode::Enotdir, "Not a directory")
            } else {
               vec![header(&ExpandPathResponse { path })]
            }
         },
         Request::Ls(args) => {
            self.counters.ls_calls.fetch_add(1, Ordering::SeqCst);
            self.ls(Path::new(&args.path))
         },
         Request::FileRead(args) => self.read(Path::new(&args.path), args.cached_hash.as_deref()),
         Request::FileWrite(args) => {
            let path = Path::new(&args.path);
            let exists = path.exists();
            if exists && !args.overwrite {
               return error(ErrorCode::Eexist, "file exists");
            }
            if !exists && !args.create {
               return error(ErrorCode::Enoent, "file does not exist");
            }
            self.counters.full_writes.fetch_add(1, Ordering::SeqCst);
            match fs::write(path, &args.data) {
               Ok(()) => vec![header(&EmptyResponse {})],
               Err(err) => io_error(&err),
            }
         },
         Request::FileWriteDiff(args) => {
            let path = Path::new(&args.path);
            let original = match fs::read(path) {
               Ok(original) => original,
               Err(err) => return io_error(&err),
            };
            match diff::apply_checked(&original, &args.diff, &args.hash_before, &args.hash_after) {
               Ok(updated) => {
                  self.counters.diff_writes.fetch_add(1, Ordering::SeqCst);
                  match fs::write(path, updated) {
                     Ok(()) => vec![header(&EmptyResponse {})],
                     Err(err) => io_error(&err),
                  }
               },
               Err(err @ DiffError::HashMismatch { which: "before", .. }) => {
                  error(ErrorCode::Eio, err.to_string())
               },
               Err(err) => error(ErrorCode::Einval, err.to_string()),
            }
         },
         Request::Mkdir(args) => match fs::create_dir(&args.path) {
            Ok(()) => vec![header(&EmptyResponse {})],
            Err(err) => io_error(&err),
         },
         Request::Delete(args) => {
            let path = Path::new(&args.path);
            let removed = if path.is_dir() { fs::remove_dir_all(path) } else { fs::remove_file(path) };
            match removed {
               Ok(()) => vec![header(&EmptyResponse {})],
               Err(err) => io_error(&err),
            }
         },
         Request::Rename(args) => {
            if Path::new(&args.to).exists() && !args.overwrite {
               return error(ErrorCode::Eexist, "destination exists");
            }
            match fs::rename(&args.from, &args.to) {
               Ok(()) => vec![header(&EmptyResponse {})],
               Err(err) => io_error(&err),
            }
         },
         Request::AddWatch(_) | Request::RemoveWatch(_) => Vec::new(),
      }
   }

   fn server_info(&self) -> Vec<Parcel> {
      let dir = self.root.join(".pony-ssh");
      let key_file = dir.join("cache.key");
      let (cache_key, new_cache_key) = match fs::read_to_string(&key_file) {
         Ok(key) if key.len() >= 64 => (KeyWire::Str(key[..64].to_owned()), false),
         _ => {
            let key: String = (0..32).map(|_| format!("{:02x}", rand::random::<u8>())).collect();
            fs::create_dir_all(&dir).unwrap();
            fs::write(&key_file, &key).unwrap();
            (KeyWire::Bin(Bytes::from(key.into_bytes())), true)
         },
      };
      // no trailing slash: the client adds it
      let home = self.root.display().to_string();
      vec![header(&InfoWire { home, cache_key, new_cache_key })]
   }

   fn ls(&self, path: &Path) -> Vec<Parcel> {
      let stat = match stat_of(path) {
         Ok(stat) => stat,
         Err(err) => return io_error(&err),
      };
      let mut dirs = OrderedMap::new();
      if stat.kind.is_dir() {
         let mut names: Vec<String> = match fs::read_dir(path) {
            Ok(entries) => entries
               .filter_map(Result::ok)
               .map(|e| e.file_name().to_string_lossy().into_owned())
               .collect(),
            Err(err) => return io_error(&err),
         };
         names.sort();
         let listing = names
            .into_iter()
            .filter_map(|name| stat_of(&path.join(&name)).ok().map(|stat| (name, stat)))
            .collect();
         dirs.0.push((".".to_string(), listing));
      }
      vec![header(&LsResponse { stat, dirs })]
   }

   fn read(&self, path: &Path, cached_hash: Option<&str>) -> Vec<Parcel> {
      let data = match fs::read(path) {
         Ok(data) => data,
         Err(err) => return io_error(&err),
      };
      if cached_hash == Some(diff::md5_hex(&data).as_str()) {
         self.counters.hash_matches.fetch_add(1, Ordering::SeqCst);
         return vec![header(&ReadHeader { length: None, hash_match: true })];
      }
      let mut parcels = vec![header(&ReadHeader { length: Some(data.len() as u64), hash_match: false })];
      if data.is_empty() {
         return parcels;
      }
      let chunk = self.chunk_size.load(Ordering::SeqCst).max(1);
      for piece in data.chunks(chunk) {
         self.counters.body_parcels.fetch_add(1, Ordering::SeqCst);
         parcels.push(Parcel::new(ParcelType::Body, piece.to_vec()));
      }
      parcels.push(Parcel::empty(ParcelType::EndOfBody));
      parcels
   }
}

async fn serve_worker(stream: DuplexStream, state: Arc<RemoteState>, cancel: CancellationToken) {
   let (read, write) = tokio::io::split(stream);
   let mut requests = FramedRead::new(read, RequestCodec);
   let mut parcels = FramedWrite::new(write, ParcelCodec);
   loop {
      let frame = tokio::select! {
         () = cancel.cancelled() => return,
         frame = requests.next() => frame,
      };
      let Some(Ok(frame)) = frame else {
         return;
      };
      state.counters.requests.fetch_add(1, Ordering::SeqCst);
      let replies = match frame.into_request() {
         Ok(request) => state.handle(request),
         Err(err) => error(ErrorCode::Einval, err.to_string()),
      };
      for parcel in replies {
         if parcels.send(parcel).await.is_err() {
            return;
         }
      }
   }
}

async fn serve_watcher(stream: DuplexStream, state: Arc<RemoteState>, cancel: CancellationToken) {
   let (read, write) = tokio::io::split(stream);
   let mut requests = FramedRead::new(read, RequestCodec);
   let mut parcels = FramedWrite::new(write, ParcelCodec);
   let (tx, mut rx) = mpsc::unbounded_channel();
   *state.watcher_tx.lock() = Some(tx);
   loop {
      tokio::select! {
         () = cancel.cancelled() => return,
         frame = requests.next() => {
            let Some(Ok(frame)) = frame else {
               return;
            };
            match frame.into_request() {
               Ok(Request::AddWatch(args)) => {
                  state.watches.lock().insert(args.id, args.path);
               },
               Ok(Request::RemoveWatch(args)) => {
                  state.watches.lock().remove(&args.id);
               },
               _ => {
                  let warning = Parcel::new(ParcelType::Warning, &b"unsupported on watcher"[..]);
                  if parcels.send(warning).await.is_err() {
                     return;
                  }
               },
            }
         },
         parcel = rx.recv() => {
            let Some(parcel) = parcel else {
               return;
            };
            if parcels.send(parcel).await.is_err() {
               return;
            }
         },
      }
   }
}

/// Opens channels to the fake remote.
pub struct FakeOpener {
   state: Arc<RemoteState>,
}

#[async_trait]
impl ChannelOpener for FakeOpener {
   async fn open_worker(&self) -> Result<Channel, ChannelError> {
      let opened = self.state.counters.workers_opened.fetch_add(1, Ordering::SeqCst);
      if opened >= self.state.worker_limit.load(Ordering::SeqCst) {
         return Err(ChannelError::Open("worker limit reached".into()));
      }
      let (client, server) = tokio::io::duplex(64 * 1024);
      let cancel = self.state.cancel.lock().clone();
      tokio::spawn(serve_worker(server, Arc::clone(&self.state), cancel));
      let (read, write) = tokio::io::split(client);
      Ok(Channel::new("fake-worker", read, write))
   }

   async fn open_watcher(&self) -> Result<Channel, ChannelError> {
      if *self.state.fail_watcher.lock() {
         return Err(ChannelError::Open("watcher disabled".into()));
      }
      let (client, server) = tokio::io::duplex(64 * 1024);
      let cancel = self.state.cancel.lock().clone();
      tokio::spawn(serve_watcher(server, Arc::clone(&self.state), cancel));
      let (read, write) = tokio::io::split(client);
      Ok(Channel::new("fake-watcher", read, write))
   }

   fn describe(&self) -> String {
      "fake-remote".to_string()
   }
}

/// A temporary remote home directory plus the fake worker serving it.
pub struct FakeRemote {
   dir:   TempDir,
   state: Arc<RemoteState>,
}

impl FakeRemote {
   pub fn new() -> Self {
      let dir = TempDir::new().unwrap();
      let root = dir.path().canonicalize().unwrap();
      let state = Arc::new(RemoteState {
         root,
         chunk_size: AtomicUsize::new(DEFAULT_CHUNK),
         worker_limit: AtomicUsize::new(usize::MAX),
         fail_watcher: Mutex::new(false),
         counters: Counters::default(),
         watches: Mutex::new(HashMap::new()),
         watcher_tx: Mutex::new(None),
         cancel: Mutex::new(CancellationToken::new()),
      });
      Self { dir, state }
   }

   pub fn opener(&self) -> Arc<FakeOpener> {
      Arc::new(FakeOpener { state: Arc::clone(&self.state) })
   }

   pub fn root(&self) -> &Path {
      &self.state.root
   }

   /// Absolute remote path of `rel`.
   pub fn path(&self, rel: &str) -> String {
      self.state.root.join(rel).display().to_string()
   }

   pub fn write(&self, rel: &str, data: &[u8]) {
      let path = self.state.root.join(rel);
      if let Some(parent) = path.parent() {
         fs::create_dir_all(parent).unwrap();
      }
      fs::write(path, data).unwrap();
   }

   pub fn read(&self, rel: &str) -> Vec<u8> {
      fs::read(self.state.root.join(rel)).unwrap()
   }

   pub fn mkdir(&self, rel: &str) {
      fs::create_dir_all(self.state.root.join(rel)).unwrap();
   }

   pub fn counters(&self) -> &Counters {
      &self.state.counters
   }

   pub fn set_chunk_size(&self, size: usize) {
      self.state.chunk_size.store(size, Ordering::SeqCst);
   }

   pub fn set_worker_limit(&self, limit: usize) {
      self.state.worker_limit.store(limit, Ordering::SeqCst);
   }

   pub fn set_fail_watcher(&self, fail: bool) {
      *self.state.fail_watcher.lock() = fail;
   }

   /// Forgets the cache key so the next server info issues a new one.
   pub fn rotate_cache_key(&self) {
      let _ = fs::remove_file(self.state.root.join(".pony-ssh/cache.key"));
   }

   /// Drops every open channel, as if the SSH session died.
   pub fn disconnect_all(&self) {
      let mut cancel = self.state.cancel.lock();
      cancel.cancel();
      *cancel = CancellationToken::new();
      *self.state.watcher_tx.lock() = None;
      self.state.watches.lock().clear();
   }

   pub fn watch_ids(&self) -> Vec<u64> {
      let mut ids: Vec<u64> = self.state.watches.lock().keys().copied().collect();
      ids.sort_unstable();
      ids
   }

   /// Waits until the watcher has registered watch `id`.
   pub async fn wait_for_watch(&self, id: u64) {
      for _ in 0..200 {
         if self.state.watches.lock().contains_key(&id) {
            return;
         }
         tokio::time::sleep(Duration::from_millis(10)).await;
      }
      panic!("watch {id} never registered");
   }

   /// Pushes a change notice for `path` to every watch whose root contains
   /// it. Returns how many watches were notified.
   pub fn notify(&self, path: &str, kind: ChangeKind) -> usize {
      let matching: Vec<u64> = self
         .state
         .watches
         .lock()
         .iter()
         .filter(|(_, root)| path.starts_with(root.as_str()))
         .map(|(id, _)| *id)
         .collect();
      if matching.is_empty() {
         return 0;
      }
      let notice: ChangeNotice = matching
         .iter()
         .map(|id| (*id, [(path.to_string(), kind)].into_iter().collect()))
         .collect();
      let body = rmp_serde::to_vec(&notice).unwrap();
      let Some(tx) = self.state.watcher_tx.lock().clone() else {
         return 0;
      };
      if tx.send(Parcel::new(ParcelType::ChangeNotice, body)).is_err() {
         return 0;
      }
      matching.len()
   }

   /// Sends a raw parcel on the watch channel.
   pub fn push(&self, parcel: Parcel) -> bool {
      self
         .state
         .watcher_tx
         .lock()
         .as_ref()
         .is_some_and(|tx| tx.send(parcel).is_ok())
   }

   pub fn temp_dir(&self) -> &TempDir {
      &self.dir
   }
}

/// Config pointing at `cache_dir`, with GC pushed far into the future.
pub fn test_config(cache_dir: &Path) -> Config {
   Config {
      cache_dir: cache_dir.to_path_buf(),
      secondary_workers: 2,
      gc_initial_delay_secs: 3600,
      worker_command: Some("unused".into()),
      ..Config::default()
   }
}

/// Polls `check` until it holds or a second passes.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
   for _ in 0..100 {
      if check() {
         return true;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
   }
   check()
}
