//! `ponyfs info`: connection and cache status.

use console::style;
use serde::Serialize;

use crate::{Result, cmd, config::Config};

#[derive(Serialize)]
struct InfoJson {
   remote:        String,
   home:          String,
   new_cache_key: bool,
   cache_dir:     String,
   workers:       usize,
   watcher:       bool,
}

pub async fn execute(config: &Config, json: bool) -> Result<()> {
   let host = cmd::open_host(config)?;
   let conn = host.connect().await?;
   let info = conn.server_info();
   let report = InfoJson {
      remote:        conn.label().to_owned(),
      home:          info.home.clone(),
      new_cache_key: info.new_cache_key,
      cache_dir:     host.content_cache().root().display().to_string(),
      workers:       conn.pool_stats().registered,
      watcher:       conn.has_watcher(),
   };
   host.close().await;

   if json {
      println!("{}", serde_json::to_string_pretty(&report)?);
      return Ok(());
   }
   println!("{} {}", style("●").green(), style(&report.remote).bold());
   println!("  home:      {}", report.home);
   println!("  cache:     {}", style(&report.cache_dir).dim());
   println!("  workers:   {}", report.workers);
   println!(
      "  watcher:   {}",
      if report.watcher { style("up").green() } else { style("unavailable").yellow() }
   );
   if report.new_cache_key {
      println!("  {}", style("cache key was rotated; local cache purged").yellow());
   }
   Ok(())
}
