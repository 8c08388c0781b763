//! Byte channels to remote worker processes and the collaborator that opens
//! them.

use std::{pin::Pin, process::Stdio};

use async_trait::async_trait;
use tokio::{
   io::{AsyncRead, AsyncWrite},
   process::{Child, Command},
};

use crate::error::ChannelError;

pub type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;
pub type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// One bidirectional byte stream to a worker process, plus its optional
/// stderr and process handle.
pub struct Channel {
   pub label:  String,
   pub reader: BoxedReader,
   pub writer: BoxedWriter,
   pub stderr: Option<BoxedReader>,
   pub child:  Option<Child>,
}

impl Channel {
   pub fn new(
      label: impl Into<String>,
      reader: impl AsyncRead + Send + 'static,
      writer: impl AsyncWrite + Send + 'static,
   ) -> Self {
      Self {
         label:  label.into(),
         reader: Box::pin(reader),
         writer: Box::pin(writer),
         stderr: None,
         child:  None,
      }
   }

   pub fn with_stderr(mut self, stderr: impl AsyncRead + Send + 'static) -> Self {
      self.stderr = Some(Box::pin(stderr));
      self
   }

   pub fn with_child(mut self, child: Child) -> Self {
      self.child = Some(child);
      self
   }
}

impl std::fmt::Debug for Channel {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("Channel")
         .field("label", &self.label)
         .field("stderr", &self.stderr.is_some())
         .field("child", &self.child.as_ref().and_then(Child::id))
         .finish()
   }
}

/// Opens exec channels on the remote host. Session establishment and
/// authentication live behind this trait.
#[async_trait]
pub trait ChannelOpener: Send + Sync {
   /// Opens a request/response worker.
   async fn open_worker(&self) -> Result<Channel, ChannelError>;

   /// Opens a push-only watcher.
   async fn open_watcher(&self) -> Result<Channel, ChannelError>;

   /// Human-readable name of the remote, used in logs and errors.
   fn describe(&self) -> String {
      "remote".to_string()
   }
}

/// Spawns the worker through a local shell command, e.g.
/// `ssh host python3 ~/.pony-ssh/worker.zip`.
#[derive(Debug, Clone)]
pub struct CommandOpener {
   command:     String,
   watcher_arg: String,
}

impl CommandOpener {
   pub fn new(command: impl Into<String>, watcher_arg: impl Into<String>) -> Self {
      Self { command: command.into(), watcher_arg: watcher_arg.into() }
   }

   fn spawn(&self, command_line: &str, label: &str) -> Result<Channel, ChannelError> {
      let mut child = Command::new("sh")
         .arg("-c")
         .arg(command_line)
         .stdin(Stdio::piped())
         .stdout(Stdio::piped())
         .stderr(Stdio::piped())
         .kill_on_drop(true)
         .spawn()
         .map_err(|e| ChannelError::Open(format!("{command_line}: {e}")))?;

      let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
         return Err(ChannelError::Open(format!("{command_line}: stdio not captured")));
      };
      let stderr = child.stderr.take();

      tracing::debug!(pid = ?child.id(), "spawned {label}: {command_line}");
      let mut channel = Channel::new(label, stdout, stdin);
      if let Some(stderr) = stderr {
         channel = channel.with_stderr(stderr);
      }
      Ok(channel.with_child(child))
   }
}

#[async_trait]
impl ChannelOpener for CommandOpener {
   async fn open_worker(&self) -> Result<Channel, ChannelError> {
      self.spawn(&self.command, "worker")
   }

   async fn open_watcher(&self) -> Result<Channel, ChannelError> {
      let command_line = format!("{} {}", self.command, self.watcher_arg);
      self.spawn(&command_line, "watcher")
   }

   fn describe(&self) -> String {
      self.command.clone()
   }
}
