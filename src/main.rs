use std::path::PathBuf;

use clap::{Parser, Subcommand};
use ponyfs::{Result, cmd, config::Config};
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Command-line arguments for the ponyfs client
#[derive(Parser)]
#[command(name = "ponyfs")]
#[command(about = "Remote filesystem over an SSH-spawned worker")]
#[command(version)]
struct Cli {
   /// Shell command that starts the remote worker (overrides the config file)
   #[arg(long, short = 'w', env = "PONYFS_WORKER_COMMAND", global = true)]
   worker: Option<String>,

   #[arg(long, global = true, help = "Print machine-readable JSON")]
   json: bool,

   #[command(subcommand)]
   command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
   #[command(about = "Connect and show server info")]
   Info,

   #[command(about = "List a remote directory")]
   Ls {
      #[arg(default_value = "~")]
      path: String,
   },

   #[command(about = "Show metadata of a remote path")]
   Stat { path: String },

   #[command(about = "Print a remote file")]
   Cat { path: String },

   #[command(about = "Upload a local file (or stdin) to a remote path")]
   Put {
      path: String,

      #[arg(help = "Local file to upload (default: stdin)")]
      source: Option<PathBuf>,

      #[arg(long, help = "Fail if the remote file does not exist")]
      no_create: bool,

      #[arg(long, help = "Fail if the remote file already exists")]
      no_overwrite: bool,
   },

   #[command(about = "Delete a remote file or directory")]
   Rm { path: String },

   #[command(about = "Create a remote directory")]
   Mkdir { path: String },

   #[command(about = "Rename a remote path")]
   Mv {
      from: String,
      to: String,

      #[arg(long, short = 'f', help = "Replace the destination if it exists")]
      force: bool,
   },

   #[command(about = "Print remote changes under a path until interrupted")]
   Watch {
      path: String,

      #[arg(long, short = 'r')]
      recursive: bool,

      #[arg(long = "exclude", short = 'x', help = "Path to ignore (repeatable)")]
      excludes: Vec<String>,
   },

   #[command(about = "Remove stale entries from the local content cache")]
   Gc,
}

#[tokio::main]
async fn main() {
   tracing_subscriber::fmt()
      .with_env_filter(EnvFilter::from_default_env().add_directive(Level::WARN.into()))
      .with_writer(std::io::stderr)
      .init();

   let cli = Cli::parse();
   if let Err(err) = run(cli).await {
      eprintln!("{err}");
      std::process::exit(err.exit_code());
   }
}

async fn run(cli: Cli) -> Result<()> {
   let mut config = Config::load();
   if cli.worker.is_some() {
      config.worker_command = cli.worker;
   }
   let json = cli.json;

   match cli.command {
      Cmd::Info => cmd::info::execute(&config, json).await,
      Cmd::Ls { path } => cmd::fs::ls(&config, path, json).await,
      Cmd::Stat { path } => cmd::fs::stat(&config, path, json).await,
      Cmd::Cat { path } => cmd::fs::cat(&config, path).await,
      Cmd::Put { path, source, no_create, no_overwrite } => {
         cmd::fs::put(&config, path, source, !no_create, !no_overwrite).await
      },
      Cmd::Rm { path } => cmd::fs::rm(&config, path).await,
      Cmd::Mkdir { path } => cmd::fs::mkdir(&config, path).await,
      Cmd::Mv { from, to, force } => cmd::fs::mv(&config, from, to, force).await,
      Cmd::Watch { path, recursive, excludes } => {
         cmd::watch::execute(&config, path, recursive, excludes).await
      },
      Cmd::Gc => cmd::gc::execute(&config, json).await,
   }
}
