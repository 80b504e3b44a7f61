//! A `RemoteSession` over a local directory root.
//!
//! Stands in for a live machine in tests: remote paths resolve under the
//! root, commands run through `sh -c` with the root as working directory.

// Standard library
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Command;

// Internal imports
use crate::{
    CommandOutput, EntryKind, RemoteDirEntry, RemoteSession, RemoteStat, SessionError,
    SessionResult,
};

pub struct LocalSession {
    root: PathBuf,
}

impl LocalSession {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, remote: &str) -> PathBuf {
        let trimmed = remote.trim_start_matches("./");
        if trimmed.is_empty() || trimmed == "." {
            self.root.clone()
        } else {
            self.root.join(trimmed)
        }
    }
}

impl RemoteSession for LocalSession {
    fn run(&mut self, command: &str) -> SessionResult<CommandOutput> {
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.root)
            .output()?;
        Ok(CommandOutput {
            return_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn put(&mut self, local: &Path, remote: &str) -> SessionResult<()> {
        fs::metadata(local)?;
        let dest = self.resolve(remote);
        match fs::copy(local, &dest) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(SessionError::MissingRemote(remote.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn get(&mut self, remote: &str, local: &Path) -> SessionResult<()> {
        let source = self.resolve(remote);
        if !source.exists() {
            return Err(SessionError::MissingRemote(remote.to_string()));
        }
        fs::copy(source, local)?;
        Ok(())
    }

    fn stat(&mut self, remote: &str) -> SessionResult<Option<RemoteStat>> {
        match fs::metadata(self.resolve(remote)) {
            Ok(meta) => Ok(Some(RemoteStat {
                kind: if meta.is_dir() {
                    EntryKind::Dir
                } else {
                    EntryKind::File
                },
            })),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn read_dir(&mut self, remote: &str) -> SessionResult<Vec<RemoteDirEntry>> {
        let dir = self.resolve(remote);
        if !dir.exists() {
            return Err(SessionError::MissingRemote(remote.to_string()));
        }
        let mut entries = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let kind = if entry.file_type()?.is_dir() {
                EntryKind::Dir
            } else {
                EntryKind::File
            };
            entries.push(RemoteDirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                kind,
            });
        }
        Ok(entries)
    }

    fn make_dirs(&mut self, remote: &str) -> SessionResult<()> {
        fs::create_dir_all(self.resolve(remote))?;
        Ok(())
    }
}
