//! Byte-level write diffs.
//!
//! A diff is a list of [`DiffOp`]s replayed against the content the remote
//! already holds. Building one is abandoned when its encoded size would not
//! undercut simply sending the new file.

use std::time::{Duration, Instant};

use md5::{Digest, Md5};
use similar::{Algorithm, DiffTag, capture_diff_slices_deadline};

use crate::{error::DiffError, wire::DiffOp};

/// Rough msgpack cost of one action: tag plus a length of up to four bytes.
const ACTION_COST: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiffOptions {
   /// Wall-clock budget for the diff algorithm; past it the diff gets coarser.
   pub deadline:   Duration,
   /// Abandon when the approximate diff size exceeds this fraction of the new
   /// content size.
   pub size_ratio: f64,
}

impl Default for DiffOptions {
   fn default() -> Self {
      Self { deadline: Duration::from_millis(500), size_ratio: 1.0 }
   }
}

pub fn md5_hex(data: &[u8]) -> String {
   hex::encode(Md5::digest(data))
}

/// Collects actions, merging neighbours of the same kind, and keeps a
/// running estimate of their encoded size.
#[derive(Debug, Default)]
struct DiffBuilder {
   ops:  Vec<DiffOp>,
   size: usize,
}

impl DiffBuilder {
   fn push(&mut self, op: DiffOp) {
      if let Some(last) = self.ops.last_mut() {
         match (last, &op) {
            (DiffOp::Unchanged(n), DiffOp::Unchanged(m)) | (DiffOp::Removed(n), DiffOp::Removed(m)) => {
               *n += m;
               return;
            },
            (DiffOp::Inserted(prev), DiffOp::Inserted(more)) => {
               let mut joined = Vec::with_capacity(prev.len() + more.len());
               joined.extend_from_slice(prev);
               joined.extend_from_slice(more);
               *prev = joined.into();
               self.size += more.len();
               return;
            },
            _ => {},
         }
      }
      self.size += match &op {
         DiffOp::Inserted(bytes) => ACTION_COST + bytes.len(),
         _ => ACTION_COST,
      };
      self.ops.push(op);
   }
}

/// Computes the actions turning `original` into `updated`.
pub fn build_diff(
   original: &[u8],
   updated: &[u8],
   options: &DiffOptions,
) -> Result<Vec<DiffOp>, DiffError> {
   let target = if options.size_ratio.is_finite() {
      (updated.len() as f64 * options.size_ratio) as usize
   } else {
      usize::MAX
   };
   let deadline = Instant::now() + options.deadline;
   let raw = capture_diff_slices_deadline(Algorithm::Myers, original, updated, Some(deadline));

   let mut diff = DiffBuilder { ops: Vec::with_capacity(raw.len()), size: 0 };
   for op in &raw {
      let (tag, old, new) = op.as_tag_tuple();
      match tag {
         DiffTag::Equal => diff.push(DiffOp::Unchanged(old.len() as u64)),
         DiffTag::Delete => diff.push(DiffOp::Removed(old.len() as u64)),
         DiffTag::Insert => diff.push(DiffOp::Inserted(updated[new].to_vec().into())),
         DiffTag::Replace => {
            diff.push(DiffOp::Removed(old.len() as u64));
            diff.push(DiffOp::Inserted(updated[new].to_vec().into()));
         },
      }

      if diff.size > target {
         return Err(DiffError::TooLarge { approx: diff.size, target });
      }
   }
   Ok(diff.ops)
}

/// Replays `ops` against `original`.
pub fn apply_diff(original: &[u8], ops: &[DiffOp]) -> Result<Vec<u8>, DiffError> {
   let mut out = Vec::with_capacity(original.len());
   let mut cursor = 0usize;
   for op in ops {
      match op {
         DiffOp::Unchanged(n) | DiffOp::Removed(n) => {
            let end = cursor
               .checked_add(*n as usize)
               .filter(|end| *end <= original.len())
               .ok_or(DiffError::OutOfBounds { offset: cursor, len: original.len() })?;
            if matches!(op, DiffOp::Unchanged(_)) {
               out.extend_from_slice(&original[cursor..end]);
            }
            cursor = end;
         },
         DiffOp::Inserted(bytes) => out.extend_from_slice(bytes),
      }
   }
   Ok(out)
}

/// Replays `ops` only if `original` hashes to `hash_before`, and returns the
/// result only if it hashes to `hash_after`.
pub fn apply_checked(
   original: &[u8],
   ops: &[DiffOp],
   hash_before: &str,
   hash_after: &str,
) -> Result<Vec<u8>, DiffError> {
   let actual = md5_hex(original);
   if actual != hash_before {
      return Err(DiffError::HashMismatch {
         which: "before",
         expected: hash_before.to_owned(),
         actual,
      });
   }
   let updated = apply_diff(original, ops)?;
   let actual = md5_hex(&updated);
   if actual != hash_after {
      return Err(DiffError::HashMismatch {
         which: "after",
         expected: hash_after.to_owned(),
         actual,
      });
   }
   Ok(updated)
}

#[cfg(test)]
mod tests {
   use bytes::Bytes;
   use proptest::prelude::*;

   use super::*;

   fn approx_size(ops: &[DiffOp]) -> usize {
      ops.iter()
         .map(|op| match op {
            DiffOp::Inserted(bytes) => ACTION_COST + bytes.len(),
            _ => ACTION_COST,
         })
         .sum()
   }

   #[test]
   fn md5_matches_known_digest() {
      assert_eq!(md5_hex(b""), "d41d8cd98f00b204e9800998ecf8427e");
      assert_eq!(md5_hex(b"hello"), "5d41402abc4b2a76b9719d911017c592");
   }

   #[test]
   fn small_edit_yields_compact_diff() {
      let original = b"The quick brown fox jumps over the lazy dog. ".repeat(20);
      let mut updated = original.clone();
      updated[100] = b'X';
      let ops = build_diff(&original, &updated, &DiffOptions::default()).unwrap();
      assert!(approx_size(&ops) < 32);
      assert_eq!(apply_diff(&original, &ops).unwrap(), updated);
   }

   #[test]
   fn rewrite_is_abandoned() {
      let err = build_diff(b"aaaaaaaaaa", b"bbbbbbbbbb", &DiffOptions::default()).unwrap_err();
      assert!(matches!(err, DiffError::TooLarge { .. }));
   }

   #[test]
   fn adjacent_actions_are_merged() {
      let mut diff = DiffBuilder::default();
      diff.push(DiffOp::Unchanged(2));
      diff.push(DiffOp::Unchanged(3));
      diff.push(DiffOp::Inserted(Bytes::from_static(b"ab")));
      diff.push(DiffOp::Inserted(Bytes::from_static(b"c")));
      assert_eq!(diff.ops, vec![DiffOp::Unchanged(5), DiffOp::Inserted(Bytes::from_static(b"abc"))]);
      assert_eq!(diff.size, approx_size(&diff.ops));
   }

   #[test]
   fn line_ending_rewrite_tracks_size_incrementally() {
      let original = b"row\r\n".repeat(1_000);
      let updated = b"row\n".repeat(1_000);
      let options = DiffOptions { deadline: Duration::from_secs(30), size_ratio: f64::INFINITY };
      let ops = build_diff(&original, &updated, &options).unwrap();
      assert!(ops.len() > 1_000);
      assert_eq!(apply_diff(&original, &ops).unwrap(), updated);

      let limit = DiffOptions { size_ratio: 1.0, ..options };
      let DiffError::TooLarge { approx, target } = build_diff(&original, &updated, &limit).unwrap_err()
      else {
         panic!("expected the rewrite to be abandoned");
      };
      assert!(approx > target);
      assert_eq!(target, updated.len());
   }

   #[test]
   fn stale_original_is_rejected_before_applying() {
      let ops = vec![DiffOp::Unchanged(3)];
      let err = apply_checked(b"abc", &ops, &md5_hex(b"abd"), &md5_hex(b"abc")).unwrap_err();
      assert!(matches!(err, DiffError::HashMismatch { which: "before", .. }));
   }

   #[test]
   fn wrong_after_hash_is_rejected() {
      let ops = vec![DiffOp::Unchanged(3)];
      let err = apply_checked(b"abc", &ops, &md5_hex(b"abc"), &md5_hex(b"xyz")).unwrap_err();
      assert!(matches!(err, DiffError::HashMismatch { which: "after", .. }));
   }

   #[test]
   fn overrunning_actions_are_rejected() {
      let err = apply_diff(b"ab", &[DiffOp::Unchanged(1), DiffOp::Removed(5)]).unwrap_err();
      assert_eq!(err, DiffError::OutOfBounds { offset: 1, len: 2 });
   }

   proptest! {
      #[test]
      fn diffs_reproduce_their_target(
         original in proptest::collection::vec(any::<u8>(), 0..256),
         edits in proptest::collection::vec((any::<prop::sample::Index>(), any::<u8>()), 0..8),
      ) {
         let mut updated = original.clone();
         for (idx, byte) in edits {
            if updated.is_empty() {
               updated.push(byte);
            } else {
               let i = idx.index(updated.len());
               updated[i] = byte;
            }
         }
         let options = DiffOptions { size_ratio: f64::INFINITY, ..DiffOptions::default() };
         let ops = build_diff(&original, &updated, &options).unwrap();
         let replayed = apply_checked(&original, &ops, &md5_hex(&original), &md5_hex(&updated)).unwrap();
         prop_assert_eq!(replayed, updated);
      }
   }
}
