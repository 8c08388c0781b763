//! Short-lived stat and listing cache keyed by normalized remote path.

use std::{sync::Arc, time::Duration};

use crate::wire::{FileType, RawListing, Stat};

/// Directory entries in the order the remote listed them.
pub type Listing = Arc<Vec<(String, FileType)>>;

/// Strips empty segments and rejoins with `/`. `"/a//b/"` becomes `"a/b"`.
pub fn normalize_path(path: &str) -> String {
   path
      .split('/')
      .filter(|segment| !segment.is_empty())
      .collect::<Vec<_>>()
      .join("/")
}

/// Joins a child name onto a remote path, posix style. `.` refers to `base`.
pub fn join_path(base: &str, child: &str) -> String {
   if child.is_empty() || child == "." {
      return base.to_owned();
   }
   let child = child.strip_prefix("./").unwrap_or(child);
   if base.is_empty() {
      child.to_owned()
   } else if base.ends_with('/') {
      format!("{base}{child}")
   } else {
      format!("{base}/{child}")
   }
}

/// Normalized parent of `path`; the parent of a top-level entry is `""`.
pub fn parent_path(path: &str) -> String {
   let normalized = normalize_path(path);
   match normalized.rsplit_once('/') {
      Some((parent, _)) => parent.to_owned(),
      None => String::new(),
   }
}

pub struct MetadataCache {
   stats:    moka::sync::Cache<String, Stat>,
   listings: moka::sync::Cache<String, Listing>,
}

impl std::fmt::Debug for MetadataCache {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("MetadataCache")
         .field("stats", &self.stats.entry_count())
         .field("listings", &self.listings.entry_count())
         .finish()
   }
}

impl MetadataCache {
   pub fn new(ttl: Duration) -> Self {
      Self {
         stats:    moka::sync::Cache::builder()
            .max_capacity(200_000)
            .time_to_live(ttl)
            .build(),
         listings: moka::sync::Cache::builder()
            .max_capacity(20_000)
            .time_to_live(ttl)
            .build(),
      }
   }

   pub fn get_stat(&self, path: &str) -> Option<Stat> {
      self.stats.get(&normalize_path(path))
   }

   pub fn set_stat(&self, path: &str, stat: Stat) {
      self.stats.insert(normalize_path(path), stat);
   }

   pub fn clear_stat(&self, path: &str) {
      self.stats.invalidate(&normalize_path(path));
   }

   pub fn get_listing(&self, path: &str) -> Option<Listing> {
      self.listings.get(&normalize_path(path))
   }

   /// Caches a listing and a stat for every child in it.
   pub fn set_listing(&self, path: &str, raw: &RawListing) {
      let mut entries = Vec::with_capacity(raw.len());
      for (name, stat) in raw.iter() {
         entries.push((name.clone(), stat.kind));
         self.set_stat(&join_path(path, name), *stat);
      }
      self
         .listings
         .insert(normalize_path(path), Arc::new(entries));
   }

   pub fn clear_listing(&self, path: &str) {
      self.listings.invalidate(&normalize_path(path));
   }

   /// Drops the stat of `path` and the listing of its parent.
   pub fn invalidate_entry(&self, path: &str) {
      self.clear_stat(path);
      self.clear_listing(&parent_path(path));
   }

   pub fn clear(&self) {
      self.stats.invalidate_all();
      self.listings.invalidate_all();
   }
}
