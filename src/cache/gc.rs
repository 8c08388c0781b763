//! Age-based garbage collection of the content cache.

use std::{
   collections::HashSet,
   fs, io,
   path::{Path, PathBuf},
   time::{Duration, Instant, SystemTime},
};

use serde::{Deserialize, Serialize};
use tokio::{task::JoinHandle, time};
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcReport {
   pub files_removed: usize,
   pub dirs_removed:  usize,
   pub bytes_freed:   u64,
   pub errors:        usize,
   pub duration_ms:   u64,
}

#[derive(Debug, Clone, Copy)]
pub struct GcSchedule {
   pub retention:     Duration,
   pub initial_delay: Duration,
   pub interval:      Duration,
}

/// Deletes every file under `root` whose mtime is older than `retention`
/// relative to `now`, then removes directories that the sweep left empty,
/// deepest first. `root` itself is kept.
pub fn sweep(root: &Path, retention: Duration, now: SystemTime) -> io::Result<GcReport> {
   let start = Instant::now();
   let mut report = GcReport::default();
   if !root.exists() {
      return Ok(report);
   }

   let cutoff = now.checked_sub(retention).unwrap_or(SystemTime::UNIX_EPOCH);
   let mut emptied: HashSet<PathBuf> = HashSet::new();

   for entry in WalkDir::new(root).min_depth(1).contents_first(true) {
      let entry = match entry {
         Ok(entry) => entry,
         Err(err) => {
            tracing::debug!("gc walk error: {err}");
            report.errors += 1;
            continue;
         },
      };
      let path = entry.path();

      if entry.file_type().is_dir() {
         if !emptied.contains(path) {
            continue;
         }
         let is_empty = fs::read_dir(path).map(|mut it| it.next().is_none()).unwrap_or(false);
         if is_empty && fs::remove_dir(path).is_ok() {
            report.dirs_removed += 1;
            if let Some(parent) = path.parent() {
               emptied.insert(parent.to_path_buf());
            }
         }
         continue;
      }

      let Ok(meta) = entry.metadata() else {
         report.errors += 1;
         continue;
      };
      let modified = meta.modified().unwrap_or(now);
      if modified >= cutoff {
         continue;
      }
      match fs::remove_file(path) {
         Ok(()) => {
            report.files_removed += 1;
            report.bytes_freed += meta.len();
            if let Some(parent) = path.parent() {
               emptied.insert(parent.to_path_buf());
            }
         },
         Err(err) => {
            tracing::debug!("gc failed to remove {}: {err}", path.display());
            report.errors += 1;
         },
      }
   }

   report.duration_ms = start.elapsed().as_millis() as u64;
   Ok(report)
}

/// Runs [`sweep`] once after `initial_delay`, then every `interval`, until
/// `token` is cancelled.
pub fn spawn_gc(root: PathBuf, schedule: GcSchedule, token: CancellationToken) -> JoinHandle<()> {
   tokio::spawn(async move {
      let mut delay = schedule.initial_delay;
      loop {
         tokio::select! {
            () = token.cancelled() => break,
            () = time::sleep(delay) => {
               let root = root.clone();
               let retention = schedule.retention;
               let swept = tokio::task::spawn_blocking(move || {
                  sweep(&root, retention, SystemTime::now())
               })
               .await;
               match swept {
                  Ok(Ok(report)) => tracing::info!(
                     files = report.files_removed,
                     dirs = report.dirs_removed,
                     bytes = report.bytes_freed,
                     "content cache gc finished in {}ms",
                     report.duration_ms
                  ),
                  Ok(Err(err)) => tracing::warn!("content cache gc failed: {err}"),
                  Err(err) => tracing::warn!("content cache gc task failed: {err}"),
               }
            }
         }
         delay = schedule.interval;
      }
   })
}
