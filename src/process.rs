//! Convenience constructor wiring a [`Connection`](crate::Connection) to a
//! spawned child process's stdio.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio as StdStdio;
use std::sync::Arc;

use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use crate::builder::ConnectionBuilder;
use crate::connection::Connection;
use crate::error::ConnectionError;

/// Spawns a plugin process and hands its stdout/stdin to a fresh
/// `Connection`. The caller owns the returned [`Child`] and is responsible
/// for its lifetime (killing it on drop, awaiting its exit status); the
/// connection itself never reaps the process — that lifecycle management
/// stays with the embedder.
#[derive(Clone, Debug)]
pub struct ChildProcessLauncher {
    binary: PathBuf,
    args: Vec<OsString>,
    current_dir: Option<PathBuf>,
    env: BTreeMap<OsString, OsString>,
    mirror_stderr: bool,
}

impl ChildProcessLauncher {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            args: Vec::new(),
            current_dir: None,
            env: BTreeMap::new(),
            mirror_stderr: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// When enabled, the child's stderr is inherited by this process instead
    /// of being piped and discarded. Useful for surfacing a misbehaving
    /// plugin's diagnostics while developing against it.
    pub fn mirror_stderr(mut self, enable: bool) -> Self {
        self.mirror_stderr = enable;
        self
    }

    /// Spawns the process and builds a connection over its stdio. The
    /// connection is returned unstarted — call `connect()` on it once the
    /// embedder is ready to perform the handshake.
    pub fn spawn(
        self,
        builder: ConnectionBuilder,
    ) -> Result<(Arc<Connection<ChildStdout, ChildStdin>>, Child), ConnectionError> {
        let mut command = Command::new(&self.binary);
        command
            .stdin(StdStdio::piped())
            .stdout(StdStdio::piped())
            .stderr(if self.mirror_stderr { StdStdio::inherit() } else { StdStdio::piped() })
            .args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        if let Some(dir) = &self.current_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(ConnectionError::Io)?;
        let stdout = child.stdout.take().expect("stdout piped by this launcher");
        let stdin = child.stdin.take().expect("stdin piped by this launcher");
        let connection = builder.build(stdout, stdin);
        Ok((connection, child))
    }
}
