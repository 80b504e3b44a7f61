//! Remote-access sessions for the vcdrive driver.
//!
//! Two protocol variants share one narrow contract: open a transient session
//! against a live machine, run a command or move a byte stream, and close.
//! Sessions are opened per call and never pooled; a session that goes out of
//! scope releases its connection on every exit path.

// Standard library
use std::path::Path;

// External crates
use thiserror::Error;

pub mod ssh;
pub mod transfer;
pub mod winrm;

#[cfg(any(test, feature = "test-helpers"))]
pub mod local;

pub use ssh::SshSession;
pub use transfer::{transfer, Direction};
pub use winrm::WinRmSession;

/// Captured outcome of one remote command. Immutable once produced.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub return_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.return_code == 0
    }
}

/// Protocol-level failures, mapped by callers into the public taxonomy.
///
/// The same primitive surfaces differently depending on what drove it: a
/// failed `put` during an upload becomes an upload error, a failed session
/// open under `run` becomes an SSH or WinRM error.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("connection to {addr} failed: {reason}")]
    Connect { addr: String, reason: String },

    #[error("authentication as '{username}' failed: {reason}")]
    Auth { username: String, reason: String },

    #[error("remote path '{0}' does not exist")]
    MissingRemote(String),

    #[error("{0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type SessionResult<T> = std::result::Result<T, SessionError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
}

#[derive(Debug, Clone)]
pub struct RemoteStat {
    pub kind: EntryKind,
}

#[derive(Debug, Clone)]
pub struct RemoteDirEntry {
    pub name: String,
    pub kind: EntryKind,
}

/// The contract both protocol variants implement.
///
/// `run`/`put`/`get` are the collaborator surface the driver needs; the
/// listing primitives exist so a remote directory tree can be walked when
/// building a download manifest.
pub trait RemoteSession {
    /// Run one command to completion and capture exit status and output.
    fn run(&mut self, command: &str) -> SessionResult<CommandOutput>;

    /// Copy a local regular file to a remote path. The remote parent
    /// directory must already exist.
    fn put(&mut self, local: &Path, remote: &str) -> SessionResult<()>;

    /// Copy a remote regular file to a local path.
    fn get(&mut self, remote: &str, local: &Path) -> SessionResult<()>;

    /// Classify a remote path, or `None` when nothing exists there.
    fn stat(&mut self, remote: &str) -> SessionResult<Option<RemoteStat>>;

    /// List the entries of a remote directory.
    fn read_dir(&mut self, remote: &str) -> SessionResult<Vec<RemoteDirEntry>>;

    /// Create a remote directory and any missing ancestors.
    fn make_dirs(&mut self, remote: &str) -> SessionResult<()>;
}
