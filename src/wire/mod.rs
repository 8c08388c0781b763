//! Wire protocol shared with the remote worker.
//!
//! Requests travel as a msgpack `[opcode, args]` pair behind a msgpack integer
//! length prefix. Responses travel as parcels: a one-byte type, a msgpack uint
//! length and an opaque body.

pub mod codec;
pub mod message;

use serde::{Deserialize, Serialize};

pub use self::{
   codec::{Parcel, ParcelCodec, RequestCodec, RequestFrame},
   message::*,
};
use crate::error::ProtocolError;

/// Request frames shorter than this are zero-padded.
pub const MIN_FRAME_LEN: usize = 16;

/// Largest parcel body the decoder accepts.
pub const MAX_PARCEL_LEN: u64 = 512 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
   Ls            = 0x01,
   GetServerInfo = 0x02,
   FileRead      = 0x03,
   FileWrite     = 0x04,
   Mkdir         = 0x05,
   Delete        = 0x06,
   Rename        = 0x07,
   ExpandPath    = 0x08,
   FileWriteDiff = 0x09,
   AddWatch      = 0x10,
   RemoveWatch   = 0x11,
}

impl Opcode {
   pub const ALL: [Self; 11] = [
      Self::Ls,
      Self::GetServerInfo,
      Self::FileRead,
      Self::FileWrite,
      Self::Mkdir,
      Self::Delete,
      Self::Rename,
      Self::ExpandPath,
      Self::FileWriteDiff,
      Self::AddWatch,
      Self::RemoveWatch,
   ];

   pub const fn as_u8(self) -> u8 {
      self as u8
   }

   pub fn from_u8(byte: u8) -> Result<Self, ProtocolError> {
      Self::ALL
         .into_iter()
         .find(|op| op.as_u8() == byte)
         .ok_or(ProtocolError::UnknownOpcode(byte))
   }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ParcelType {
   Header       = 0x01,
   Body         = 0x02,
   Error        = 0x03,
   EndOfBody    = 0x04,
   Warning      = 0x05,
   ChangeNotice = 0x06,
}

impl ParcelType {
   pub const fn as_u8(self) -> u8 {
      self as u8
   }

   pub fn from_u8(byte: u8) -> Result<Self, ProtocolError> {
      Ok(match byte {
         0x01 => Self::Header,
         0x02 => Self::Body,
         0x03 => Self::Error,
         0x04 => Self::EndOfBody,
         0x05 => Self::Warning,
         0x06 => Self::ChangeNotice,
         other => return Err(ProtocolError::InvalidParcelType(other)),
      })
   }

   /// Parcels that belong to a request/response cycle.
   pub const fn is_response(self) -> bool {
      matches!(self, Self::Header | Self::Body | Self::EndOfBody | Self::Error)
   }
}

/// POSIX-style error codes carried in ERROR parcels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
   Ok,
   Eperm,
   Enoent,
   Eio,
   Ebadf,
   Eagain,
   Eacces,
   Ebusy,
   Eexist,
   Exdev,
   Enodev,
   Enotdir,
   Eisdir,
   Einval,
   Erofs,
   Erange,
   Enosys,
   Enodata,
}

impl ErrorCode {
   pub const fn code(self) -> i64 {
      match self {
         Self::Ok => 0,
         Self::Eperm => 1,
         Self::Enoent => 2,
         Self::Eio => 5,
         Self::Ebadf => 9,
         Self::Eagain => 11,
         Self::Eacces => 13,
         Self::Ebusy => 16,
         Self::Eexist => 17,
         Self::Exdev => 18,
         Self::Enodev => 19,
         Self::Enotdir => 20,
         Self::Eisdir => 21,
         Self::Einval => 22,
         Self::Erofs => 30,
         Self::Erange => 34,
         Self::Enosys => 38,
         Self::Enodata => 61,
      }
   }

   pub const fn from_code(code: i64) -> Option<Self> {
      Some(match code {
         0 => Self::Ok,
         1 => Self::Eperm,
         2 => Self::Enoent,
         5 => Self::Eio,
         9 => Self::Ebadf,
         11 => Self::Eagain,
         13 => Self::Eacces,
         16 => Self::Ebusy,
         17 => Self::Eexist,
         18 => Self::Exdev,
         19 => Self::Enodev,
         20 => Self::Enotdir,
         21 => Self::Eisdir,
         22 => Self::Einval,
         30 => Self::Erofs,
         34 => Self::Erange,
         38 => Self::Enosys,
         61 => Self::Enodata,
         _ => return None,
      })
   }
}

/// Action tags in a FILE_WRITE_DIFF action list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DiffAction {
   Unchanged = 0,
   Inserted  = 1,
   Removed   = 2,
}

impl DiffAction {
   pub const fn from_u8(byte: u8) -> Option<Self> {
      match byte {
         0 => Some(Self::Unchanged),
         1 => Some(Self::Inserted),
         2 => Some(Self::Removed),
         _ => None,
      }
   }
}

/// Entry type as reported in a stat tuple. Symlink is a flag on top of the
/// file or directory bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileType(u32);

impl FileType {
   pub const UNKNOWN: Self = Self(0);
   pub const FILE: Self = Self(0x01);
   pub const DIRECTORY: Self = Self(0x02);
   pub const SYMLINK: Self = Self(0x10);

   pub const fn from_bits(bits: u32) -> Self {
      Self(bits)
   }

   pub const fn bits(self) -> u32 {
      self.0
   }

   pub const fn is_file(self) -> bool {
      self.0 & Self::FILE.0 != 0
   }

   pub const fn is_dir(self) -> bool {
      self.0 & Self::DIRECTORY.0 != 0
   }

   pub const fn is_symlink(self) -> bool {
      self.0 & Self::SYMLINK.0 != 0
   }

   pub const fn with(self, other: Self) -> Self {
      Self(self.0 | other.0)
   }
}

/// Kind of change reported in a CHANGE_NOTICE parcel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ChangeKind {
   Changed = 1,
   Created = 2,
   Deleted = 3,
}

impl TryFrom<u8> for ChangeKind {
   type Error = String;

   fn try_from(value: u8) -> Result<Self, Self::Error> {
      match value {
         1 => Ok(Self::Changed),
         2 => Ok(Self::Created),
         3 => Ok(Self::Deleted),
         other => Err(format!("unknown change kind {other}")),
      }
   }
}

impl From<ChangeKind> for u8 {
   fn from(kind: ChangeKind) -> Self {
      kind as Self
   }
}
