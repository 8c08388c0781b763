//! Maps remote path segments onto names every local filesystem accepts.
//!
//! A segment is kept as-is when it is already safe. Otherwise unsafe
//! characters become `-`, the result is cut to the configured length and
//! `-<md5 of the original segment>` is appended. A safe segment that happens
//! to end in `-<32 hex digits>` is treated as altered too, so an untouched name
//! can never collide with a hashed one.

use std::path::PathBuf;

use md5::{Digest, Md5};

pub const DEFAULT_MAX_SEGMENT_LEN: usize = 100;

const UNSAFE: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

fn is_unsafe(c: char) -> bool {
   UNSAFE.contains(&c) || c.is_control()
}

fn looks_hashed(segment: &str) -> bool {
   let bytes = segment.as_bytes();
   bytes.len() >= 33 && {
      let (head, tail) = bytes.split_at(bytes.len() - 32);
      head.last() == Some(&b'-') && tail.iter().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
   }
}

pub fn sanitize_segment(segment: &str, max_len: usize) -> String {
   let all_dots = !segment.is_empty() && segment.chars().all(|c| c == '.');
   let clean: String = if all_dots {
      "-".repeat(segment.chars().count().min(max_len))
   } else {
      segment
         .chars()
         .map(|c| if is_unsafe(c) { '-' } else { c })
         .take(max_len)
         .collect()
   };

   if clean == segment && !looks_hashed(segment) {
      return clean;
   }
   let digest = Md5::digest(segment.as_bytes());
   format!("{clean}-{}", hex::encode(digest))
}

/// Relative cache location of a remote path. Empty segments are dropped.
pub fn cache_relative_path(remote: &str, max_len: usize) -> PathBuf {
   remote
      .split('/')
      .filter(|segment| !segment.is_empty())
      .map(|segment| sanitize_segment(segment, max_len))
      .collect()
}
