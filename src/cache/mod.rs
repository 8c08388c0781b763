//! Local caches: short-TTL metadata and the encrypted content store.

pub mod content;
pub mod gc;
pub mod meta;
pub mod sanitize;

pub use self::{
   content::{CachedFile, ContentCache},
   gc::{GcReport, GcSchedule},
   meta::{Listing, MetadataCache, join_path, normalize_path, parent_path},
};
