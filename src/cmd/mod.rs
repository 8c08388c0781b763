//! CLI command implementations for ponyfs.
//!
//! Each module corresponds to a group of subcommands; all of them talk to
//! the remote through a [`Host`] built from the loaded configuration.

pub mod fs;
pub mod gc;
pub mod info;
pub mod watch;

use std::sync::Arc;

use crate::{Result, channel::CommandOpener, config::Config, host::Host, pool::Priority};

/// Interactive commands jump ahead of background work.
pub const INTERACTIVE: Priority = 0;

/// Builds a host that spawns workers with the configured command.
pub fn open_host(config: &Config) -> Result<Host> {
   let command = config.worker_command()?;
   let opener = Arc::new(CommandOpener::new(command, config.watcher_arg.clone()));
   Ok(Host::new(opener, config))
}

/// Expands `~` against the remote home directory; other paths are used as
/// given. The target does not have to exist yet.
pub async fn resolve(host: &Host, path: &str) -> Result<String> {
   let rest = match path.strip_prefix('~') {
      Some(rest) if rest.is_empty() || rest.starts_with('/') => rest,
      _ => return Ok(path.to_owned()),
   };
   let info = host.server_info().await?;
   let home = info.home.trim_end_matches('/');
   Ok(format!("{home}{rest}"))
}
