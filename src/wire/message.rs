//! Typed request and response bodies, one per opcode.
//!
//! Every struct rejects unknown fields so a worker speaking a different
//! dialect of the protocol is caught at decode time rather than silently
//! misread.

use std::{fmt, marker::PhantomData};

use bytes::Bytes;
use serde::{
   Deserialize, Deserializer, Serialize, Serializer,
   de::{self, MapAccess, SeqAccess, Visitor},
   ser::{SerializeMap, SerializeSeq},
};

use super::{ChangeKind, DiffAction, FileType, Opcode, codec::RequestFrame};
use crate::error::ProtocolError;

/// A msgpack map decoded in wire order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderedMap<K, V>(pub Vec<(K, V)>);

impl<K, V> Default for OrderedMap<K, V> {
   fn default() -> Self {
      Self(Vec::new())
   }
}

impl<K, V> OrderedMap<K, V> {
   pub const fn new() -> Self {
      Self(Vec::new())
   }

   pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
      self.0.iter().map(|(k, v)| (k, v))
   }

   pub fn len(&self) -> usize {
      self.0.len()
   }

   pub fn is_empty(&self) -> bool {
      self.0.is_empty()
   }
}

impl<K, V> FromIterator<(K, V)> for OrderedMap<K, V> {
   fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
      Self(iter.into_iter().collect())
   }
}

impl<K, V> IntoIterator for OrderedMap<K, V> {
   type IntoIter = std::vec::IntoIter<(K, V)>;
   type Item = (K, V);

   fn into_iter(self) -> Self::IntoIter {
      self.0.into_iter()
   }
}

impl<K: Serialize, V: Serialize> Serialize for OrderedMap<K, V> {
   fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
      let mut map = serializer.serialize_map(Some(self.0.len()))?;
      for (k, v) in &self.0 {
         map.serialize_entry(k, v)?;
      }
      map.end()
   }
}

impl<'de, K: Deserialize<'de>, V: Deserialize<'de>> Deserialize<'de> for OrderedMap<K, V> {
   fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
      struct OrderedVisitor<K, V>(PhantomData<(K, V)>);

      impl<'de, K: Deserialize<'de>, V: Deserialize<'de>> Visitor<'de> for OrderedVisitor<K, V> {
         type Value = OrderedMap<K, V>;

         fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a map")
         }

         fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
            let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(0).min(4096));
            while let Some(entry) = access.next_entry()? {
               entries.push(entry);
            }
            Ok(OrderedMap(entries))
         }
      }

      deserializer.deserialize_map(OrderedVisitor(PhantomData))
   }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EmptyArgs {}

/// Arguments for LS, MKDIR, DELETE and EXPAND_PATH.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PathArgs {
   pub path: String,
}

impl PathArgs {
   pub fn new(path: impl Into<String>) -> Self {
      Self { path: path.into() }
   }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ReadArgs {
   pub path:        String,
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub cached_hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WriteArgs {
   pub path:      String,
   pub data:      Bytes,
   pub create:    bool,
   pub overwrite: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RenameArgs {
   pub from:      String,
   pub to:        String,
   pub overwrite: bool,
}

/// One step of a write diff, replayed against the original content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffOp {
   /// Copy this many bytes from the original.
   Unchanged(u64),
   /// Emit these bytes.
   Inserted(Bytes),
   /// Skip this many bytes of the original.
   Removed(u64),
}

impl DiffOp {
   pub const fn action(&self) -> DiffAction {
      match self {
         Self::Unchanged(_) => DiffAction::Unchanged,
         Self::Inserted(_) => DiffAction::Inserted,
         Self::Removed(_) => DiffAction::Removed,
      }
   }
}

/// Encodes bytes as a string with one Latin-1 character per byte.
pub fn latin1_encode(bytes: &[u8]) -> String {
   bytes.iter().map(|&b| char::from(b)).collect()
}

/// Inverse of [`latin1_encode`]. Fails on characters above U+00FF.
pub fn latin1_decode(text: &str) -> Option<Vec<u8>> {
   text.chars().map(|c| u8::try_from(u32::from(c)).ok()).collect()
}

/// Flat `[action, data, action, data, ...]` list.
mod diff_actions {
   use super::*;

   pub fn serialize<S: Serializer>(ops: &[DiffOp], serializer: S) -> Result<S::Ok, S::Error> {
      let mut seq = serializer.serialize_seq(Some(ops.len() * 2))?;
      for op in ops {
         seq.serialize_element(&(op.action() as u8))?;
         match op {
            DiffOp::Unchanged(n) | DiffOp::Removed(n) => seq.serialize_element(n)?,
            DiffOp::Inserted(bytes) => seq.serialize_element(&latin1_encode(bytes))?,
         }
      }
      seq.end()
   }

   /// Inserted data as either a Latin-1 string or raw binary.
   struct InsertedData(Bytes);

   impl<'de> Deserialize<'de> for InsertedData {
      fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
         struct DataVisitor;

         impl Visitor<'_> for DataVisitor {
            type Value = InsertedData;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
               f.write_str("a latin-1 string or bytes")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
               latin1_decode(v)
                  .map(|b| InsertedData(Bytes::from(b)))
                  .ok_or_else(|| E::custom("inserted text is not latin-1"))
            }

            fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
               Ok(InsertedData(Bytes::copy_from_slice(v)))
            }
         }

         deserializer.deserialize_any(DataVisitor)
      }
   }

   pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<DiffOp>, D::Error> {
      struct ActionsVisitor;

      impl<'de> Visitor<'de> for ActionsVisitor {
         type Value = Vec<DiffOp>;

         fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a flat list of diff actions")
         }

         fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
            let mut ops = Vec::new();
            while let Some(tag) = seq.next_element::<u8>()? {
               let action = DiffAction::from_u8(tag)
                  .ok_or_else(|| de::Error::custom(format!("unknown diff action {tag}")))?;
               let op = match action {
                  DiffAction::Inserted => {
                     let InsertedData(bytes) = seq
                        .next_element()?
                        .ok_or_else(|| de::Error::custom("diff action without data"))?;
                     DiffOp::Inserted(bytes)
                  },
                  DiffAction::Unchanged | DiffAction::Removed => {
                     let n: u64 = seq
                        .next_element()?
                        .ok_or_else(|| de::Error::custom("diff action without data"))?;
                     if action == DiffAction::Unchanged {
                        DiffOp::Unchanged(n)
                     } else {
                        DiffOp::Removed(n)
                     }
                  },
               };
               ops.push(op);
            }
            Ok(ops)
         }
      }

      deserializer.deserialize_seq(ActionsVisitor)
   }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct WriteDiffArgs {
   pub path:        String,
   pub hash_before: String,
   pub hash_after:  String,
   #[serde(with = "diff_actions")]
   pub diff:        Vec<DiffOp>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AddWatchArgs {
   pub id:        u64,
   pub path:      String,
   pub recursive: bool,
   pub excludes:  Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemoveWatchArgs {
   pub id: u64,
}

/// A request to the remote worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
   Ls(PathArgs),
   GetServerInfo,
   FileRead(ReadArgs),
   FileWrite(WriteArgs),
   Mkdir(PathArgs),
   Delete(PathArgs),
   Rename(RenameArgs),
   ExpandPath(PathArgs),
   FileWriteDiff(WriteDiffArgs),
   AddWatch(AddWatchArgs),
   RemoveWatch(RemoveWatchArgs),
}

impl Request {
   pub const fn opcode(&self) -> Opcode {
      match self {
         Self::Ls(_) => Opcode::Ls,
         Self::GetServerInfo => Opcode::GetServerInfo,
         Self::FileRead(_) => Opcode::FileRead,
         Self::FileWrite(_) => Opcode::FileWrite,
         Self::Mkdir(_) => Opcode::Mkdir,
         Self::Delete(_) => Opcode::Delete,
         Self::Rename(_) => Opcode::Rename,
         Self::ExpandPath(_) => Opcode::ExpandPath,
         Self::FileWriteDiff(_) => Opcode::FileWriteDiff,
         Self::AddWatch(_) => Opcode::AddWatch,
         Self::RemoveWatch(_) => Opcode::RemoveWatch,
      }
   }

   /// Whether the remote answers this request. Watch requests are
   /// fire-and-forget.
   pub const fn expects_response(&self) -> bool {
      !matches!(self, Self::AddWatch(_) | Self::RemoveWatch(_))
   }

   /// Encodes the `[opcode, args]` pair, args as a string-keyed map.
   pub fn to_msgpack(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
      fn pack<T: Serialize>(op: Opcode, args: &T) -> Result<Vec<u8>, rmp_serde::encode::Error> {
         rmp_serde::to_vec_named(&(op.as_u8(), args))
      }

      let op = self.opcode();
      match self {
         Self::Ls(a) | Self::Mkdir(a) | Self::Delete(a) | Self::ExpandPath(a) => pack(op, a),
         Self::GetServerInfo => pack(op, &EmptyArgs {}),
         Self::FileRead(a) => pack(op, a),
         Self::FileWrite(a) => pack(op, a),
         Self::Rename(a) => pack(op, a),
         Self::FileWriteDiff(a) => pack(op, a),
         Self::AddWatch(a) => pack(op, a),
         Self::RemoveWatch(a) => pack(op, a),
      }
   }

   pub fn from_frame(frame: &RequestFrame) -> Result<Self, ProtocolError> {
      Ok(match frame.opcode {
         Opcode::Ls => Self::Ls(frame.args()?),
         Opcode::GetServerInfo => {
            let EmptyArgs {} = frame.args()?;
            Self::GetServerInfo
         },
         Opcode::FileRead => Self::FileRead(frame.args()?),
         Opcode::FileWrite => Self::FileWrite(frame.args()?),
         Opcode::Mkdir => Self::Mkdir(frame.args()?),
         Opcode::Delete => Self::Delete(frame.args()?),
         Opcode::Rename => Self::Rename(frame.args()?),
         Opcode::ExpandPath => Self::ExpandPath(frame.args()?),
         Opcode::FileWriteDiff => Self::FileWriteDiff(frame.args()?),
         Opcode::AddWatch => Self::AddWatch(frame.args()?),
         Opcode::RemoveWatch => Self::RemoveWatch(frame.args()?),
      })
   }
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

/// Entry metadata as carried in LS responses: `[type, ctime, mtime, size]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "StatTuple", into = "StatTuple")]
pub struct Stat {
   pub kind:  FileType,
   pub ctime: i64,
   pub mtime: i64,
   pub size:  u64,
}

#[derive(Serialize, Deserialize)]
struct StatTuple(FileType, i64, i64, u64);

impl From<StatTuple> for Stat {
   fn from(StatTuple(kind, ctime, mtime, size): StatTuple) -> Self {
      Self { kind, ctime, mtime, size }
   }
}

impl From<Stat> for StatTuple {
   fn from(stat: Stat) -> Self {
      Self(stat.kind, stat.ctime, stat.mtime, stat.size)
   }
}

/// Children of one directory, in the order the remote listed them.
pub type RawListing = OrderedMap<String, Stat>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LsResponse {
   pub stat: Stat,
   /// Listings keyed by directory relative to the requested path (`.` is the
   /// path itself). Absent when the path is not a directory.
   #[serde(default, skip_serializing_if = "OrderedMap::is_empty")]
   pub dirs: OrderedMap<String, RawListing>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ServerInfo {
   pub home:          String,
   #[serde(deserialize_with = "str_or_bin")]
   pub cache_key:     String,
   pub new_cache_key: bool,
}

impl ServerInfo {
   /// Ensures `home` ends with a slash.
   pub fn normalized(mut self) -> Self {
      if !self.home.ends_with('/') {
         self.home.push('/');
      }
      self
   }
}

/// The cache key arrives as a str when read back from the key file and as a
/// bin when freshly generated.
fn str_or_bin<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
   struct KeyVisitor;

   impl Visitor<'_> for KeyVisitor {
      type Value = String;

      fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
         f.write_str("a string or binary cache key")
      }

      fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
         Ok(v.to_owned())
      }

      fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
         String::from_utf8(v.to_vec()).map_err(E::custom)
      }
   }

   deserializer.deserialize_any(KeyVisitor)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExpandPathResponse {
   pub path: String,
}

/// FILE_READ header: either a body length or a hash match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ReadHeader {
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub length:     Option<u64>,
   #[serde(default, skip_serializing_if = "std::ops::Not::not")]
   pub hash_match: bool,
}

/// Header of requests that return nothing but success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EmptyResponse {}

/// Body of an ERROR parcel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
   pub code:  i64,
   #[serde(default)]
   pub error: String,
}

/// The one header field the response state machine looks at.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct LengthProbe {
   #[serde(default)]
   pub length: Option<u64>,
}

/// Body of a CHANGE_NOTICE parcel: watch id → path → change kind.
pub type ChangeNotice = OrderedMap<u64, OrderedMap<String, ChangeKind>>;

#[cfg(test)]
mod tests {
   use super::*;
   use crate::wire::codec::Parcel;
   use crate::wire::ParcelType;

   #[test]
   fn requests_encode_args_as_maps() {
      let bytes = Request::Rename(RenameArgs {
         from:      "a".into(),
         to:        "b".into(),
         overwrite: false,
      })
      .to_msgpack()
      .unwrap();
      // [7, {from, to, overwrite}]
      assert_eq!(&bytes[..3], &[0x92, 0x07, 0x83]);
   }

   #[test]
   fn read_without_hash_omits_the_key() {
      let bytes = Request::FileRead(ReadArgs { path: "f".into(), cached_hash: None })
         .to_msgpack()
         .unwrap();
      assert_eq!(&bytes[..3], &[0x92, 0x03, 0x81]);
   }

   #[test]
   fn diff_inserts_travel_as_latin1_strings() {
      let args = WriteDiffArgs {
         path:        "f".into(),
         hash_before: "0".repeat(32),
         hash_after:  "1".repeat(32),
         diff:        vec![
            DiffOp::Unchanged(3),
            DiffOp::Inserted(Bytes::from_static(&[0x41, 0xe9, 0xff])),
            DiffOp::Removed(2),
         ],
      };
      let bytes = rmp_serde::to_vec_named(&args).unwrap();
      let decoded: WriteDiffArgs = rmp_serde::from_slice(&bytes).unwrap();
      assert_eq!(decoded, args);

      let latin = latin1_encode(&[0x41, 0xe9, 0xff]);
      assert_eq!(latin, "A\u{e9}\u{ff}");
      assert_eq!(latin1_decode(&latin).unwrap(), vec![0x41, 0xe9, 0xff]);
      assert_eq!(latin1_decode("\u{100}"), None);
   }

   #[test]
   fn unknown_header_fields_are_rejected() {
      #[derive(Serialize)]
      struct Extra {
         path:  &'static str,
         bogus: u8,
      }
      let body = rmp_serde::to_vec_named(&Extra { path: "/x", bogus: 1 }).unwrap();
      let parcel = Parcel::new(ParcelType::Header, body);
      assert!(parcel.decode::<ExpandPathResponse>("expand header").is_err());
   }

   #[test]
   fn cache_key_accepts_bin_and_str() {
      #[derive(Serialize)]
      #[serde(rename_all = "camelCase")]
      struct BinInfo<'a> {
         home:          &'a str,
         #[serde(with = "serde_bytes_like")]
         cache_key:     &'a [u8],
         new_cache_key: bool,
      }
      mod serde_bytes_like {
         pub fn serialize<S: serde::Serializer>(v: &&[u8], s: S) -> Result<S::Ok, S::Error> {
            s.serialize_bytes(v)
         }
      }

      let key = "ab".repeat(32);
      let bin = rmp_serde::to_vec_named(&BinInfo {
         home:          "/home/pony",
         cache_key:     key.as_bytes(),
         new_cache_key: true,
      })
      .unwrap();
      let info: ServerInfo = rmp_serde::from_slice(&bin).unwrap();
      assert_eq!(info.cache_key, key);

      let str_form = rmp_serde::to_vec_named(&ServerInfo {
         home:          "/home/pony".into(),
         cache_key:     key.clone(),
         new_cache_key: false,
      })
      .unwrap();
      let info: ServerInfo = rmp_serde::from_slice(&str_form).unwrap();
      assert_eq!(info.normalized().home, "/home/pony/");
   }

   #[test]
   fn listings_keep_wire_order() {
      let listing: RawListing = ["zeta", "alpha", "mid"]
         .into_iter()
         .map(|n| {
            (n.to_owned(), Stat { kind: FileType::FILE, ctime: 1, mtime: 2, size: 3 })
         })
         .collect();
      let response = LsResponse {
         stat: Stat { kind: FileType::DIRECTORY, ctime: 0, mtime: 0, size: 0 },
         dirs: [(".".to_owned(), listing)].into_iter().collect(),
      };
      let bytes = rmp_serde::to_vec_named(&response).unwrap();
      let decoded: LsResponse = rmp_serde::from_slice(&bytes).unwrap();
      let names: Vec<_> = decoded.dirs.0[0].1.iter().map(|(n, _)| n.as_str()).collect();
      assert_eq!(names, ["zeta", "alpha", "mid"]);
   }

   #[test]
   fn change_notice_decodes_integer_watch_ids() {
      let mut inner = OrderedMap::new();
      inner.0.push(("~/a.txt".to_owned(), ChangeKind::Created));
      let notice: ChangeNotice = [(7u64, inner)].into_iter().collect();
      let bytes = rmp_serde::to_vec_named(&notice).unwrap();
      let decoded: ChangeNotice = rmp_serde::from_slice(&bytes).unwrap();
      assert_eq!(decoded, notice);
   }
}
