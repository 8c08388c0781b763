//! `ponyfs watch`: print change notices until interrupted.

use std::sync::Arc;

use console::style;

use crate::{Result, cmd, config::Config, wire::ChangeKind};

pub async fn execute(
   config: &Config,
   path: String,
   recursive: bool,
   excludes: Vec<String>,
) -> Result<()> {
   let host = cmd::open_host(config)?;
   let path = cmd::resolve(&host, &path).await?;

   let printer = |_: u64, changed: &str, kind: ChangeKind| {
      let tag = match kind {
         ChangeKind::Created => style("created").green(),
         ChangeKind::Changed => style("changed").yellow(),
         ChangeKind::Deleted => style("deleted").red(),
      };
      println!("{tag:>8} {changed}");
   };
   let id = host
      .add_watch(&path, recursive, excludes, Arc::new(printer))
      .await?;
   eprintln!("{}", style(format!("watching {path} (ctrl-c to stop)")).dim());

   tokio::signal::ctrl_c().await?;
   host.remove_watch(id).await?;
   host.close().await;
   Ok(())
}
