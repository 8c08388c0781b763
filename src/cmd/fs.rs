//! File commands: `ls`, `stat`, `cat`, `put`, `rm`, `mkdir`, `mv`.

use std::{
   io::{Read, Write},
   path::PathBuf,
};

use bytes::Bytes;
use console::style;
use serde::Serialize;

use crate::{
   Result,
   cmd::{self, INTERACTIVE},
   config::Config,
   host::Host,
   wire::{FileType, Stat},
};

#[derive(Serialize)]
struct StatJson<'a> {
   path:  &'a str,
   kind:  &'static str,
   ctime: i64,
   mtime: i64,
   size:  u64,
}

const fn kind_name(kind: FileType) -> &'static str {
   if kind.is_symlink() {
      "symlink"
   } else if kind.is_dir() {
      "directory"
   } else if kind.is_file() {
      "file"
   } else {
      "unknown"
   }
}

async fn with_host<T>(
   config: &Config,
   path: &str,
   f: impl AsyncFnOnce(&Host, String) -> Result<T>,
) -> Result<T> {
   let host = cmd::open_host(config)?;
   let path = cmd::resolve(&host, path).await?;
   let result = f(&host, path).await;
   host.close().await;
   result
}

pub async fn ls(config: &Config, path: String, json: bool) -> Result<()> {
   with_host(config, &path, async |host, path| {
      let listing = host.ls(INTERACTIVE, &path).await?;
      if json {
         let entries: Vec<_> = listing
            .iter()
            .map(|(name, kind)| serde_json::json!({ "name": name, "kind": kind_name(*kind) }))
            .collect();
         println!("{}", serde_json::to_string_pretty(&entries)?);
         return Ok(());
      }
      for (name, kind) in listing.iter() {
         if kind.is_dir() {
            println!("{}/", style(name).blue().bold());
         } else if kind.is_symlink() {
            println!("{}", style(name).cyan());
         } else {
            println!("{name}");
         }
      }
      Ok(())
   })
   .await
}

pub async fn stat(config: &Config, path: String, json: bool) -> Result<()> {
   with_host(config, &path, async |host, path| {
      let Stat { kind, ctime, mtime, size } = host.stat(INTERACTIVE, &path).await?;
      let report = StatJson { path: &path, kind: kind_name(kind), ctime, mtime, size };
      if json {
         println!("{}", serde_json::to_string_pretty(&report)?);
      } else {
         println!("{}", style(report.path).bold());
         println!("  kind:  {}", report.kind);
         println!("  size:  {}", report.size);
         println!("  mtime: {}", report.mtime);
         println!("  ctime: {}", report.ctime);
      }
      Ok(())
   })
   .await
}

pub async fn cat(config: &Config, path: String) -> Result<()> {
   with_host(config, &path, async |host, path| {
      let data = host.read_file(INTERACTIVE, &path).await?;
      let mut out = std::io::stdout().lock();
      out.write_all(&data)?;
      out.flush()?;
      Ok(())
   })
   .await
}

/// Uploads `source` (or stdin when absent) to `path`.
pub async fn put(
   config: &Config,
   path: String,
   source: Option<PathBuf>,
   create: bool,
   overwrite: bool,
) -> Result<()> {
   let data = match source {
      Some(source) => std::fs::read(source)?,
      None => {
         let mut buf = Vec::new();
         std::io::stdin().read_to_end(&mut buf)?;
         buf
      },
   };
   let len = data.len();
   with_host(config, &path, async |host, path| {
      host
         .write_file(INTERACTIVE, &path, Bytes::from(data), create, overwrite)
         .await?;
      eprintln!("{} {len} bytes to {path}", style("wrote").green());
      Ok(())
   })
   .await
}

pub async fn rm(config: &Config, path: String) -> Result<()> {
   with_host(config, &path, async |host, path| host.delete(INTERACTIVE, &path).await).await
}

pub async fn mkdir(config: &Config, path: String) -> Result<()> {
   with_host(config, &path, async |host, path| host.mkdir(INTERACTIVE, &path).await).await
}

pub async fn mv(config: &Config, from: String, to: String, overwrite: bool) -> Result<()> {
   with_host(config, &from, async |host, from| {
      let to = cmd::resolve(host, &to).await?;
      host.rename(INTERACTIVE, &from, &to, overwrite).await
   })
   .await
}
