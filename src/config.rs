//! Configuration for cache locations, worker pool sizing and cache tuning.

use std::{
   fs,
   path::{Path, PathBuf},
   time::Duration,
};

use directories::BaseDirs;
use figment::{
   Figment,
   providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::{
   cache::GcSchedule,
   diff::{DiffOptions, md5_hex},
   error::ConfigError,
};

/// Client configuration loaded from the config file and `PONYFS_*`
/// environment variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
   /// Root of the per-host content caches.
   pub cache_dir: PathBuf,

   pub metadata_ttl_ms:   u64,
   pub secondary_workers: usize,

   pub cache_retention_days:  u64,
   pub gc_initial_delay_secs: u64,
   pub gc_interval_secs:      u64,
   pub max_segment_len:       usize,

   pub diff_deadline_ms: u64,
   pub diff_size_ratio:  f64,

   /// Shell command that starts a worker on the remote host, e.g.
   /// `ssh devbox python3 ~/.pony-ssh/worker.zip`.
   pub worker_command: Option<String>,
   /// Argument appended to `worker_command` to start the watcher instead.
   pub watcher_arg:    String,
}

impl Default for Config {
   fn default() -> Self {
      Self {
         cache_dir:             default_cache_dir(),
         metadata_ttl_ms:       10_000,
         secondary_workers:     4,
         cache_retention_days:  30,
         gc_initial_delay_secs: 60,
         gc_interval_secs:      3600,
         max_segment_len:       100,
         diff_deadline_ms:      500,
         diff_size_ratio:       1.0,
         worker_command:        None,
         watcher_arg:           "watcher".to_string(),
      }
   }
}

impl Config {
   /// Loads the global config file (creating it with defaults if missing)
   /// and applies environment overrides. Falls back to defaults on parse
   /// errors.
   pub fn load() -> Self {
      let path = config_file_path();
      if let Some(missing) = path.as_ref().filter(|p| !p.exists()) {
         Self::create_default_config(missing);
      }
      Self::load_from(path.as_deref())
         .inspect_err(|e| tracing::warn!("failed to parse config: {e}"))
         .unwrap_or_default()
   }

   /// Layers defaults, the TOML file at `path` (if any) and `PONYFS_*`
   /// environment variables.
   pub fn load_from(path: Option<&Path>) -> Result<Self, ConfigError> {
      let mut figment = Figment::from(Serialized::defaults(Self::default()));
      if let Some(path) = path {
         figment = figment.merge(Toml::file(path));
      }
      figment
         .merge(Env::prefixed("PONYFS_").lowercase(true))
         .extract()
         .map_err(|e| ConfigError::Invalid(e.to_string()))
   }

   fn create_default_config(path: &Path) {
      if let Some(parent) = path.parent() {
         let _ = fs::create_dir_all(parent);
      }
      if let Ok(toml) = toml::to_string_pretty(&Self::default()) {
         let _ = fs::write(path, toml);
      }
   }

   pub const fn metadata_ttl(&self) -> Duration {
      Duration::from_millis(self.metadata_ttl_ms)
   }

   pub const fn gc_schedule(&self) -> GcSchedule {
      GcSchedule {
         retention:     Duration::from_secs(self.cache_retention_days * 24 * 60 * 60),
         initial_delay: Duration::from_secs(self.gc_initial_delay_secs),
         interval:      Duration::from_secs(self.gc_interval_secs),
      }
   }

   pub fn diff_options(&self) -> DiffOptions {
      DiffOptions {
         deadline:   Duration::from_millis(self.diff_deadline_ms),
         size_ratio: if self.diff_size_ratio > 0.0 { self.diff_size_ratio } else { 1.0 },
      }
   }

   /// Content cache directory for one remote host. A name that had to be
   /// rewritten gets the MD5 of the original appended, so distinct hosts
   /// never share a directory.
   pub fn host_cache_dir(&self, host: &str) -> PathBuf {
      let name: String = host
         .chars()
         .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '@') { c } else { '-' })
         .take(self.max_segment_len)
         .collect();
      if name == host && !name.chars().all(|c| c == '.') {
         return self.cache_dir.join(name);
      }
      self.cache_dir.join(format!("{name}-{}", md5_hex(host.as_bytes())))
   }

   pub fn worker_command(&self) -> Result<&str, ConfigError> {
      self
         .worker_command
         .as_deref()
         .filter(|c| !c.trim().is_empty())
         .ok_or(ConfigError::MissingWorkerCommand)
   }
}

/// `<config dir>/ponyfs/config.toml`, if a config directory can be found.
pub fn config_file_path() -> Option<PathBuf> {
   BaseDirs::new().map(|d| d.config_dir().join("ponyfs").join("config.toml"))
}

fn default_cache_dir() -> PathBuf {
   BaseDirs::new()
      .map(|d| d.cache_dir().join("ponyfs"))
      .or_else(|| {
         std::env::var("HOME")
            .ok()
            .map(|home| PathBuf::from(home).join(".cache").join("ponyfs"))
      })
      .unwrap_or_else(|| std::env::temp_dir().join("ponyfs"))
}
