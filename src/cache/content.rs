//! Encrypted on-disk copies of remote files.
//!
//! Each entry is a 24 byte header (plaintext length as big-endian u64, then
//! a random 16 byte IV) followed by the AES-256-CBC ciphertext of the file,
//! keyed by the server-issued cache key. Entries live under `files/` at a
//! sanitized mirror of the remote path.

use std::{
   fs::{self, File},
   io::{self, Read, Write},
   path::{Path, PathBuf},
   time::SystemTime,
};

use aes::Aes256;
use bytes::Bytes;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use parking_lot::RwLock;
use rand::{RngCore, rngs::OsRng};

use super::sanitize::cache_relative_path;
use crate::{diff::md5_hex, error::CacheError};

type Encryptor = cbc::Encryptor<Aes256>;
type Decryptor = cbc::Decryptor<Aes256>;

pub const KEY_LEN: usize = 32;
pub const IV_LEN: usize = 16;
pub const HEADER_LEN: usize = 8 + IV_LEN;

/// A cache entry as found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedFile {
   pub path:     PathBuf,
   /// Plaintext length recorded in the header.
   pub length:   u64,
   /// IV the entry was encrypted with.
   pub iv:       [u8; IV_LEN],
   /// Decrypted contents, when requested.
   pub contents: Option<Bytes>,
}

impl CachedFile {
   /// MD5 hex digest of the contents, as offered to the remote for a
   /// conditional read.
   pub fn hash(&self) -> Option<String> {
      self.contents.as_deref().map(md5_hex)
   }
}

pub struct ContentCache {
   root:            PathBuf,
   max_segment_len: usize,
   key:             RwLock<Option<[u8; KEY_LEN]>>,
}

impl std::fmt::Debug for ContentCache {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("ContentCache")
         .field("root", &self.root)
         .field("keyed", &self.key.read().is_some())
         .finish()
   }
}

impl ContentCache {
   /// Creates a cache rooted at `base`. Entries go to `base/files`.
   pub fn new(base: impl AsRef<Path>, max_segment_len: usize) -> Self {
      Self {
         root: base.as_ref().join("files"),
         max_segment_len,
         key: RwLock::new(None),
      }
   }

   /// Directory holding every entry; what GC sweeps.
   pub fn root(&self) -> &Path {
      &self.root
   }

   pub fn has_key(&self) -> bool {
      self.key.read().is_some()
   }

   /// Installs the session key. A new key means every existing entry is
   /// unreadable, so the whole store is purged first.
   pub fn set_key(&self, hex_key: &str, is_new: bool) -> Result<(), CacheError> {
      let mut key = [0u8; KEY_LEN];
      hex::decode_to_slice(hex_key.trim(), &mut key)
         .map_err(|e| CacheError::InvalidKey(e.to_string()))?;

      let mut slot = self.key.write();
      if is_new {
         // nothing is cached until the purge has succeeded
         *slot = None;
         tracing::info!(root = %self.root.display(), "cache key rotated, purging content cache");
         match fs::remove_dir_all(&self.root) {
            Ok(()) => {},
            Err(e) if e.kind() == io::ErrorKind::NotFound => {},
            Err(e) => return Err(CacheError::Purge(e)),
         }
      }
      *slot = Some(key);
      Ok(())
   }

   pub fn entry_path(&self, remote: &str) -> PathBuf {
      self
         .root
         .join(cache_relative_path(remote, self.max_segment_len))
   }

   /// Stores `data` for `remote`. Failures are logged, never returned.
   pub fn set_file(&self, remote: &str, data: &[u8]) {
      if let Err(err) = self.try_set_file(remote, data) {
         tracing::warn!("failed to cache file {remote}: {err}");
      }
   }

   pub fn try_set_file(&self, remote: &str, data: &[u8]) -> Result<(), CacheError> {
      let Some(key) = *self.key.read() else {
         return Ok(());
      };
      let dest = self.entry_path(remote);
      if dest == self.root {
         return Ok(());
      }
      let Some(parent) = dest.parent() else {
         return Ok(());
      };
      fs::create_dir_all(parent).map_err(CacheError::Write)?;

      let mut iv = [0u8; IV_LEN];
      OsRng.fill_bytes(&mut iv);
      let ciphertext = Encryptor::new_from_slices(&key, &iv)
         .map_err(|e| CacheError::InvalidKey(e.to_string()))?
         .encrypt_padded_vec_mut::<Pkcs7>(data);

      let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(CacheError::Write)?;
      tmp.write_all(&(data.len() as u64).to_be_bytes())
         .map_err(CacheError::Write)?;
      tmp.write_all(&iv).map_err(CacheError::Write)?;
      tmp.write_all(&ciphertext).map_err(CacheError::Write)?;
      tmp.persist(&dest).map_err(|e| CacheError::Write(e.error))?;
      Ok(())
   }

   /// Looks up `remote`. Returns `None` when nothing usable is cached; an
   /// absent entry is silent, anything else is logged, and a corrupt entry
   /// is removed.
   pub fn get_file(&self, remote: &str, read_contents: bool) -> Option<CachedFile> {
      match self.try_get_file(remote, read_contents) {
         Ok(found) => found,
         Err(CacheError::Read(err)) if err.kind() == io::ErrorKind::NotFound => None,
         Err(err @ (CacheError::Corrupt { .. } | CacheError::Truncated(_))) => {
            tracing::warn!("discarding cached copy of {remote}: {err}");
            self.remove(remote);
            None
         },
         Err(err) => {
            tracing::warn!("failed to read cached copy of {remote}: {err}");
            None
         },
      }
   }

   pub fn try_get_file(
      &self,
      remote: &str,
      read_contents: bool,
   ) -> Result<Option<CachedFile>, CacheError> {
      let Some(key) = *self.key.read() else {
         return Ok(None);
      };
      let path = self.entry_path(remote);
      let mut file = File::open(&path).map_err(CacheError::Read)?;

      let mut header = [0u8; HEADER_LEN];
      if let Err(err) = file.read_exact(&mut header) {
         return Err(if err.kind() == io::ErrorKind::UnexpectedEof {
            CacheError::Truncated(path)
         } else {
            CacheError::Read(err)
         });
      }
      let (len_bytes, iv_bytes) = header.split_at(8);
      let mut len_buf = [0u8; 8];
      len_buf.copy_from_slice(len_bytes);
      let length = u64::from_be_bytes(len_buf);
      let mut iv = [0u8; IV_LEN];
      iv.copy_from_slice(iv_bytes);

      if !read_contents {
         return Ok(Some(CachedFile { path, length, iv, contents: None }));
      }

      let mut ciphertext = Vec::new();
      file.read_to_end(&mut ciphertext).map_err(CacheError::Read)?;
      let plaintext = Decryptor::new_from_slices(&key, &iv)
         .map_err(|e| CacheError::InvalidKey(e.to_string()))?
         .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
         .map_err(|_| CacheError::Corrupt { path: path.clone(), reason: "bad padding".into() })?;

      if plaintext.len() as u64 != length {
         return Err(CacheError::Corrupt {
            reason: format!("header says {length} bytes, decrypted {}", plaintext.len()),
            path,
         });
      }
      Ok(Some(CachedFile { path, length, iv, contents: Some(Bytes::from(plaintext)) }))
   }

   /// Bumps the entry's mtime so GC keeps it.
   pub fn touch(&self, remote: &str) {
      let path = self.entry_path(remote);
      let now = filetime::FileTime::from_system_time(SystemTime::now());
      if let Err(err) = filetime::set_file_mtime(&path, now) {
         if err.kind() != io::ErrorKind::NotFound {
            tracing::debug!("failed to touch {}: {err}", path.display());
         }
      }
   }

   /// Drops the cached copy of `remote`, if any.
   pub fn remove(&self, remote: &str) {
      let path = self.entry_path(remote);
      match fs::remove_file(&path) {
         Ok(()) => {},
         Err(err) if err.kind() == io::ErrorKind::NotFound => {},
         // a directory means the remote path now names a directory tree
         Err(_) if path.is_dir() => {
            if let Err(err) = fs::remove_dir_all(&path) {
               tracing::debug!("failed to drop cache dir {}: {err}", path.display());
            }
         },
         Err(err) => tracing::debug!("failed to drop cache entry {}: {err}", path.display()),
      }
   }
}

#[cfg(test)]
mod tests {
   use tempfile::TempDir;

   use super::*;

   const KEY: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

   fn keyed(dir: &TempDir) -> ContentCache {
      let cache = ContentCache::new(dir.path(), 100);
      cache.set_key(KEY, false).unwrap();
      cache
   }

   #[test]
   fn stored_files_are_encrypted_and_round_trip() {
      let dir = TempDir::new().unwrap();
      let cache = keyed(&dir);
      cache.set_file("/home/pony/notes.txt", b"plain text contents");

      let raw = fs::read(cache.entry_path("/home/pony/notes.txt")).unwrap();
      assert_eq!(&raw[..8], &19u64.to_be_bytes());
      assert!(!raw.windows(5).any(|w| w == b"plain"));

      let found = cache.get_file("/home/pony/notes.txt", true).unwrap();
      assert_eq!(found.length, 19);
      assert_eq!(found.contents.as_deref(), Some(&b"plain text contents"[..]));
      assert_eq!(found.hash().unwrap(), md5_hex(b"plain text contents"));
   }

   #[test]
   fn header_only_lookup_skips_decryption() {
      let dir = TempDir::new().unwrap();
      let cache = keyed(&dir);
      cache.set_file("a/b", b"12345");
      let found = cache.get_file("a/b", false).unwrap();
      assert_eq!(found.length, 5);
      assert!(found.contents.is_none());
      let raw = fs::read(cache.entry_path("a/b")).unwrap();
      assert_eq!(&found.iv[..], &raw[8..HEADER_LEN]);

      // every write draws a fresh IV
      cache.set_file("a/b", b"12345");
      let again = cache.get_file("a/b", false).unwrap();
      assert_ne!(again.iv, found.iv);
      assert_eq!(cache.get_file("a/b", true).unwrap().iv, again.iv);
   }

   #[test]
   fn absent_entries_are_not_errors() {
      let dir = TempDir::new().unwrap();
      let cache = keyed(&dir);
      assert!(cache.get_file("missing", true).is_none());
      assert!(matches!(cache.try_get_file("missing", true), Err(CacheError::Read(_))));
   }

   #[test]
   fn nothing_is_cached_without_a_key() {
      let dir = TempDir::new().unwrap();
      let cache = ContentCache::new(dir.path(), 100);
      cache.set_file("a", b"data");
      assert!(!cache.entry_path("a").exists());
      assert!(cache.get_file("a", true).is_none());
   }

   #[test]
   fn corrupt_entries_are_discarded() {
      let dir = TempDir::new().unwrap();
      let cache = keyed(&dir);
      cache.set_file("f", b"0123456789abcdef-more");
      let path = cache.entry_path("f");

      let mut raw = fs::read(&path).unwrap();
      raw[..8].copy_from_slice(&3u64.to_be_bytes());
      fs::write(&path, &raw).unwrap();
      assert!(matches!(cache.try_get_file("f", true), Err(CacheError::Corrupt { .. })));
      assert!(cache.get_file("f", true).is_none());
      assert!(!path.exists());

      fs::write(&path, b"short").unwrap();
      assert!(matches!(cache.try_get_file("f", true), Err(CacheError::Truncated(_))));
   }

   #[test]
   fn wrong_key_never_yields_plaintext() {
      let dir = TempDir::new().unwrap();
      let cache = keyed(&dir);
      cache.set_file("f", b"secret secret secret");
      let other = ContentCache::new(dir.path(), 100);
      other.set_key(&"ff".repeat(32), false).unwrap();
      match other.try_get_file("f", true) {
         Err(CacheError::Corrupt { .. }) => {},
         Ok(Some(found)) => assert_ne!(found.contents.as_deref(), Some(&b"secret secret secret"[..])),
         other => panic!("unexpected {other:?}"),
      }
   }

   #[test]
   fn new_key_purges_previous_entries() {
      let dir = TempDir::new().unwrap();
      let cache = keyed(&dir);
      cache.set_file("x/y", b"old");
      assert!(cache.entry_path("x/y").exists());

      cache.set_key(KEY, true).unwrap();
      assert!(!cache.root().exists());
      assert!(cache.get_file("x/y", true).is_none());
   }

   #[test]
   fn invalid_keys_are_rejected() {
      let dir = TempDir::new().unwrap();
      let cache = ContentCache::new(dir.path(), 100);
      assert!(matches!(cache.set_key("abc", false), Err(CacheError::InvalidKey(_))));
      assert!(!cache.has_key());
   }
}
