use std::{io, path::PathBuf};

use thiserror::Error;

use crate::wire::{ErrorCode, ParcelType};

/// Main error type for the ponyfs client.
///
/// This enum represents everything that can go wrong between a caller and a
/// remote worker: wire-level protocol violations, channel faults, coded errors
/// reported by the remote, local cache faults and configuration problems.
#[derive(Debug, Error)]
pub enum Error {
   /// I/O error occurred during local file or process operations.
   #[error("io error: {0}")]
   Io(#[from] io::Error),

   /// The remote worker broke the wire protocol, or a caller misused a worker.
   #[error("protocol error: {0}")]
   Protocol(#[from] ProtocolError),

   /// The worker channel failed or was closed.
   #[error("channel error: {0}")]
   Channel(#[from] ChannelError),

   /// The remote worker reported a coded error for the request.
   #[error("remote error: {0}")]
   Remote(#[from] RemoteError),

   /// Error occurred in the local content cache.
   #[error("cache error: {0}")]
   Cache(#[from] CacheError),

   /// Configuration-related error occurred.
   #[error("config error: {0}")]
   Config(#[from] ConfigError),

   /// Building or applying a write diff failed.
   #[error("diff error: {0}")]
   Diff(#[from] DiffError),

   /// Msgpack serialization of a request failed.
   #[error("msgpack encode error: {0}")]
   Encode(#[from] rmp_serde::encode::Error),

   /// JSON serialization error occurred.
   #[error("json error: {0}")]
   Json(#[from] serde_json::Error),

   /// The worker pool was closed, or lost all of its workers.
   #[error("worker pool closed")]
   PoolClosed,
}

impl Error {
   /// Returns the filesystem-level classification of this error, if any.
   pub fn fs_kind(&self) -> Option<FsErrorKind> {
      match self {
         Self::Remote(remote) => Some(remote.kind()),
         _ => None,
      }
   }

   /// Process exit code for the CLI: the remote errno when there is one,
   /// `78` for configuration problems, `1` otherwise.
   pub fn exit_code(&self) -> i32 {
      match self {
         Self::Remote(remote) if (1..=125).contains(&remote.code) => remote.code as i32,
         Self::Config(_) => 78,
         _ => 1,
      }
   }
}

/// Wire-level protocol violations.
///
/// Any of these received from the remote is fatal to the channel; the
/// `RequestInFlight` variant is reported to the misbehaving caller only.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
   /// First byte of a parcel is not a known parcel type.
   #[error("invalid parcel type: {0:#04x}")]
   InvalidParcelType(u8),

   /// The parcel length prefix uses a marker that is not an unsigned integer.
   #[error("invalid length marker: {0:#04x}")]
   InvalidLengthMarker(u8),

   /// A parcel declared a body larger than the decoder accepts.
   #[error("parcel of {0} bytes exceeds limit")]
   ParcelTooLarge(u64),

   /// A request frame was shorter than its declared length or was not a valid
   /// `[opcode, args]` pair.
   #[error("malformed frame: {0}")]
   MalformedFrame(String),

   /// Opcode byte is not part of the protocol.
   #[error("unknown opcode: {0:#04x}")]
   UnknownOpcode(u8),

   /// A response-cycle parcel arrived while no request was pending.
   #[error("received {0:?} parcel without a request waiting")]
   UnexpectedParcel(ParcelType),

   /// Parcels arrived out of order within a response cycle.
   #[error("{0}")]
   OutOfOrder(&'static str),

   /// A header or error body could not be decoded into the expected shape.
   #[error("failed to decode {what}: {reason}")]
   Decode { what: &'static str, reason: String },

   /// A second call was issued while the first was still in flight.
   #[error("request already in flight on this worker")]
   RequestInFlight,

   /// The remote answered a conditional read with a hash match although the
   /// client never offered a hash.
   #[error("hash match reported without a cached hash")]
   UnexpectedHashMatch,
}

/// Channel-level faults. Cloneable so a single fault can be delivered to the
/// pending call and to the fault signal.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
   /// The worker has been closed and accepts no more requests.
   #[error("worker channel closed")]
   Closed,

   /// The remote side closed its output without the client asking for it.
   #[error("unexpected end of worker channel")]
   UnexpectedEnd,

   /// Reading from or writing to the channel failed.
   #[error("transport failure: {0}")]
   Transport(String),

   /// The channel was torn down because of a protocol violation.
   #[error("protocol violation: {0}")]
   Violation(ProtocolError),

   /// Opening a channel failed.
   #[error("failed to open channel: {0}")]
   Open(String),
}

impl From<io::Error> for ChannelError {
   fn from(e: io::Error) -> Self {
      Self::Transport(e.to_string())
   }
}

/// Filesystem-level classification of a remote error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsErrorKind {
   NoPermissions,
   FileNotFound,
   FileExists,
   Unavailable,
   FileNotADirectory,
   FileIsADirectory,
   /// No clear filesystem mapping; see the raw code.
   Other,
}

/// A coded error returned by the remote worker in an ERROR parcel.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message} (code {code})")]
pub struct RemoteError {
   pub code:    i64,
   pub message: String,
}

impl RemoteError {
   pub fn new(code: i64, message: impl Into<String>) -> Self {
      Self { code, message: message.into() }
   }

   /// Known error code, if the remote used one from the protocol table.
   pub fn error_code(&self) -> Option<ErrorCode> {
      ErrorCode::from_code(self.code)
   }

   pub fn kind(&self) -> FsErrorKind {
      match self.error_code() {
         Some(ErrorCode::Eperm | ErrorCode::Eacces | ErrorCode::Erofs) => {
            FsErrorKind::NoPermissions
         },
         Some(ErrorCode::Enoent) => FsErrorKind::FileNotFound,
         Some(ErrorCode::Eexist) => FsErrorKind::FileExists,
         Some(ErrorCode::Eagain | ErrorCode::Ebusy | ErrorCode::Enodev) => {
            FsErrorKind::Unavailable
         },
         Some(ErrorCode::Enotdir) => FsErrorKind::FileNotADirectory,
         Some(ErrorCode::Eisdir) => FsErrorKind::FileIsADirectory,
         _ => FsErrorKind::Other,
      }
   }
}

/// Errors that can occur in the encrypted on-disk content cache.
///
/// All of these are soft at the host level: a faulty entry degrades to a cache
/// miss, but corrupted plaintext is never handed back to a caller.
#[derive(Debug, Error)]
pub enum CacheError {
   /// The cache key supplied by the server is not 32 bytes of hex.
   #[error("invalid cache key: {0}")]
   InvalidKey(String),

   /// The cached blob is shorter than its header.
   #[error("truncated cache entry: {path}", path = _0.display())]
   Truncated(PathBuf),

   /// Decryption failed or the decrypted length disagrees with the header.
   #[error("corrupt cache entry {}: {reason}", .path.display())]
   Corrupt { path: PathBuf, reason: String },

   /// Failed to remove the content cache after a key rotation.
   #[error("failed to purge content cache: {0}")]
   Purge(#[source] io::Error),

   /// Failed to read a cached blob.
   #[error("failed to read cache entry: {0}")]
   Read(#[source] io::Error),

   /// Failed to write a cached blob.
   #[error("failed to write cache entry: {0}")]
   Write(#[source] io::Error),
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
   /// Config file or environment could not be parsed.
   #[error("invalid config: {0}")]
   Invalid(String),

   /// No worker command is configured for the CLI.
   #[error("no worker command configured; set worker_command or PONYFS_WORKER_COMMAND")]
   MissingWorkerCommand,
}

/// Errors produced while building or replaying a write diff.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DiffError {
   /// The diff would be about as large as the file itself.
   #[error("diff of {approx} bytes is not smaller than the {target} byte target")]
   TooLarge { approx: usize, target: usize },

   /// An action refers past the end of the original content.
   #[error("diff action at offset {offset} overruns original of {len} bytes")]
   OutOfBounds { offset: usize, len: usize },

   /// A hash did not match the declared value.
   #[error("{which} hash mismatch: expected {expected}, got {actual}")]
   HashMismatch { which: &'static str, expected: String, actual: String },
}

/// Standard result type using [`enum@Error`] as the default error type
pub type Result<T, E = Error> = std::result::Result<T, E>;
