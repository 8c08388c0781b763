//! `ponyfs gc`: sweep the local content cache now.

use console::style;

use crate::{Result, cmd, config::Config};

pub async fn execute(config: &Config, json: bool) -> Result<()> {
   let host = cmd::open_host(config)?;
   let report = host.run_gc().await?;
   if json {
      println!("{}", serde_json::to_string_pretty(&report)?);
      return Ok(());
   }
   println!(
      "{} removed {} files and {} directories ({} bytes) in {}ms",
      style("gc").bold(),
      report.files_removed,
      report.dirs_removed,
      report.bytes_freed,
      report.duration_ms
   );
   if report.errors > 0 {
      println!("{}", style(format!("{} entries could not be removed", report.errors)).yellow());
   }
   Ok(())
}
