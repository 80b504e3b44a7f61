//! Tree transfers: expand one upload/download request into a per-file
//! manifest and drive the session's file primitives entry by entry.
//!
//! A single-file request produces exactly one entry; a directory request
//! walks the source side recursively and reproduces relative paths under the
//! destination root. Directories are created as needed, never transferred.
//! The first failing entry aborts the call; entries already moved stay put.

// Standard library
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

// External crates
use tracing::debug;
use walkdir::WalkDir;

// Internal imports
use crate::{EntryKind, RemoteSession, SessionError, SessionResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Upload,
    Download,
}

/// Moves a file or directory tree between the local side and the remote
/// session. Returns the transferred paths relative to the walked root;
/// the length of this list is the caller's primary observable.
pub fn transfer(
    session: &mut dyn RemoteSession,
    local: &Path,
    remote: &str,
    direction: Direction,
) -> SessionResult<Vec<PathBuf>> {
    let manifest = match direction {
        Direction::Upload => upload(session, local, remote),
        Direction::Download => download(session, local, remote),
    }?;
    debug!(
        "transferred {} file(s) between '{}' and '{}'",
        manifest.len(),
        local.display(),
        remote
    );
    Ok(manifest)
}

fn upload(
    session: &mut dyn RemoteSession,
    local: &Path,
    remote: &str,
) -> SessionResult<Vec<PathBuf>> {
    let metadata = fs::metadata(local)?;

    if metadata.is_file() {
        let name = local_file_name(local)?;
        let dest = match session.stat(remote)? {
            Some(stat) if stat.kind == EntryKind::Dir => join_remote(remote, &name),
            _ => remote.to_string(),
        };
        session.put(local, &dest)?;
        return Ok(vec![PathBuf::from(name)]);
    }

    // A directory only lands inside an existing remote directory; the
    // relative tree below it is created on demand.
    let root = match session.stat(remote)? {
        Some(stat) if stat.kind == EntryKind::Dir => join_remote(remote, &local_file_name(local)?),
        Some(_) => {
            return Err(SessionError::Protocol(format!(
                "destination '{}' is not a directory",
                remote
            )))
        }
        None => return Err(SessionError::MissingRemote(remote.to_string())),
    };

    let mut manifest = Vec::new();
    let mut created: HashSet<String> = HashSet::new();
    for entry in WalkDir::new(local) {
        let entry = entry.map_err(|e| {
            SessionError::Protocol(format!("walk of '{}' failed: {}", local.display(), e))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry.path().strip_prefix(local).map_err(|_| {
            SessionError::Protocol(format!(
                "walk escaped its root at '{}'",
                entry.path().display()
            ))
        })?;
        let dest = join_remote(&root, &relative_remote(rel));
        let parent = parent_remote(&dest);
        if created.insert(parent.clone()) {
            session.make_dirs(&parent)?;
        }
        session.put(entry.path(), &dest)?;
        manifest.push(rel.to_path_buf());
    }
    Ok(manifest)
}

fn download(
    session: &mut dyn RemoteSession,
    local: &Path,
    remote: &str,
) -> SessionResult<Vec<PathBuf>> {
    let stat = session
        .stat(remote)?
        .ok_or_else(|| SessionError::MissingRemote(remote.to_string()))?;
    let remote_name = remote_file_name(remote);

    match stat.kind {
        EntryKind::File => {
            let dest = if local.is_dir() {
                local.join(&remote_name)
            } else {
                local.to_path_buf()
            };
            session.get(remote, &dest)?;
            Ok(vec![PathBuf::from(remote_name)])
        }
        EntryKind::Dir => {
            let root = if local.is_dir() {
                local.join(&remote_name)
            } else {
                local.to_path_buf()
            };
            let mut manifest = Vec::new();
            walk_remote(session, remote, Path::new(""), &root, &mut manifest)?;
            Ok(manifest)
        }
    }
}

fn walk_remote(
    session: &mut dyn RemoteSession,
    remote_dir: &str,
    rel: &Path,
    local_root: &Path,
    manifest: &mut Vec<PathBuf>,
) -> SessionResult<()> {
    for entry in session.read_dir(remote_dir)? {
        let child_remote = join_remote(remote_dir, &entry.name);
        let child_rel = rel.join(&entry.name);
        match entry.kind {
            EntryKind::Dir => {
                walk_remote(session, &child_remote, &child_rel, local_root, manifest)?
            }
            EntryKind::File => {
                let dest = local_root.join(&child_rel);
                if let Some(parent) = dest.parent() {
                    if !parent.as_os_str().is_empty() {
                        fs::create_dir_all(parent)?;
                    }
                }
                session.get(&child_remote, &dest)?;
                manifest.push(child_rel);
            }
        }
    }
    Ok(())
}

fn local_file_name(path: &Path) -> SessionResult<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| {
            SessionError::Protocol(format!("source path '{}' has no file name", path.display()))
        })
}

fn join_remote(base: &str, name: &str) -> String {
    if base.is_empty() || base == "." {
        return name.to_string();
    }
    format!("{}/{}", base.trim_end_matches('/'), name)
}

fn parent_remote(path: &str) -> String {
    match path.trim_end_matches('/').rsplit_once('/') {
        Some(("", _)) => "/".to_string(),
        Some((parent, _)) => parent.to_string(),
        None => ".".to_string(),
    }
}

fn remote_file_name(remote: &str) -> String {
    remote
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(remote)
        .to_string()
}

fn relative_remote(rel: &Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalSession;
    use anyhow::Result;
    use tempfile::TempDir;

    /// Builds the canonical fixture tree:
    /// `file-0` plus `dir-0/{file-1, dir-1/{file-2, dir-2/file-3}}`.
    struct TransferFixture {
        local: TempDir,
        remote_root: TempDir,
    }

    impl TransferFixture {
        fn new() -> Result<Self> {
            let local = TempDir::new()?;
            fs::write(local.path().join("file-0"), b"zero")?;
            let nested = local.path().join("dir-0").join("dir-1").join("dir-2");
            fs::create_dir_all(&nested)?;
            fs::write(local.path().join("dir-0").join("file-1"), b"one")?;
            fs::write(
                local.path().join("dir-0").join("dir-1").join("file-2"),
                b"two",
            )?;
            fs::write(nested.join("file-3"), b"three")?;
            Ok(Self {
                local,
                remote_root: TempDir::new()?,
            })
        }

        fn session(&self) -> LocalSession {
            LocalSession::new(self.remote_root.path())
        }
    }

    #[test]
    fn single_file_upload_yields_one_entry() -> Result<()> {
        let fixture = TransferFixture::new()?;
        let mut session = fixture.session();

        let manifest = transfer(
            &mut session,
            &fixture.local.path().join("file-0"),
            "file-0",
            Direction::Upload,
        )?;
        assert_eq!(manifest.len(), 1);
        assert_eq!(
            fs::read(fixture.remote_root.path().join("file-0"))?,
            b"zero"
        );
        Ok(())
    }

    #[test]
    fn upload_into_a_directory_appends_the_basename() -> Result<()> {
        let fixture = TransferFixture::new()?;
        let mut session = fixture.session();

        let manifest = transfer(
            &mut session,
            &fixture.local.path().join("file-0"),
            ".",
            Direction::Upload,
        )?;
        assert_eq!(manifest.len(), 1);
        assert!(fixture.remote_root.path().join("file-0").is_file());
        Ok(())
    }

    #[test]
    fn directory_upload_reproduces_the_tree() -> Result<()> {
        let fixture = TransferFixture::new()?;
        let mut session = fixture.session();

        let manifest = transfer(
            &mut session,
            &fixture.local.path().join("dir-0"),
            ".",
            Direction::Upload,
        )?;
        assert_eq!(manifest.len(), 3);
        let root = fixture.remote_root.path().join("dir-0");
        assert!(root.join("file-1").is_file());
        assert!(root.join("dir-1").join("file-2").is_file());
        assert!(root.join("dir-1").join("dir-2").join("file-3").is_file());
        Ok(())
    }

    #[test]
    fn upload_to_a_missing_remote_directory_fails() -> Result<()> {
        let fixture = TransferFixture::new()?;
        let mut session = fixture.session();

        let err = transfer(
            &mut session,
            &fixture.local.path().join("dir-0"),
            "wrong-path",
            Direction::Upload,
        )
        .unwrap_err();
        assert!(matches!(err, SessionError::MissingRemote(_)));
        Ok(())
    }

    #[test]
    fn download_round_trip_counts_match() -> Result<()> {
        let fixture = TransferFixture::new()?;
        let mut session = fixture.session();

        transfer(
            &mut session,
            &fixture.local.path().join("dir-0"),
            ".",
            Direction::Upload,
        )?;

        let target = TempDir::new()?;
        let manifest = transfer(
            &mut session,
            &target.path().join("dir-0"),
            "dir-0",
            Direction::Download,
        )?;
        assert_eq!(manifest.len(), 3);
        assert_eq!(
            fs::read(
                target
                    .path()
                    .join("dir-0")
                    .join("dir-1")
                    .join("dir-2")
                    .join("file-3")
            )?,
            b"three"
        );
        Ok(())
    }

    #[test]
    fn download_into_a_directory_appends_the_basename() -> Result<()> {
        let fixture = TransferFixture::new()?;
        let mut session = fixture.session();
        transfer(
            &mut session,
            &fixture.local.path().join("dir-0"),
            ".",
            Direction::Upload,
        )?;

        let target = TempDir::new()?;
        let manifest = transfer(&mut session, target.path(), "dir-0", Direction::Download)?;
        assert_eq!(manifest.len(), 3);
        assert!(target.path().join("dir-0").join("file-1").is_file());
        Ok(())
    }

    #[test]
    fn download_of_a_missing_remote_file_fails() -> Result<()> {
        let fixture = TransferFixture::new()?;
        let mut session = fixture.session();

        let err = transfer(
            &mut session,
            &fixture.local.path().join("file-0"),
            "wrong-path",
            Direction::Download,
        )
        .unwrap_err();
        assert!(matches!(err, SessionError::MissingRemote(_)));
        Ok(())
    }

    #[test]
    fn single_remote_file_download_yields_one_entry() -> Result<()> {
        let fixture = TransferFixture::new()?;
        let mut session = fixture.session();
        transfer(
            &mut session,
            &fixture.local.path().join("file-0"),
            "file-0",
            Direction::Upload,
        )?;

        let target = TempDir::new()?;
        let manifest = transfer(
            &mut session,
            &target.path().join("file-0"),
            "file-0",
            Direction::Download,
        )?;
        assert_eq!(manifest.len(), 1);
        assert_eq!(fs::read(target.path().join("file-0"))?, b"zero");
        Ok(())
    }

    #[test]
    fn join_remote_handles_roots_and_dots() {
        assert_eq!(join_remote(".", "file-0"), "file-0");
        assert_eq!(join_remote("dir", "file"), "dir/file");
        assert_eq!(join_remote("dir/", "file"), "dir/file");
        assert_eq!(join_remote("/", "file"), "/file");
    }

    #[test]
    fn parent_remote_handles_all_shapes() {
        assert_eq!(parent_remote("a/b/c"), "a/b");
        assert_eq!(parent_remote("/a"), "/");
        assert_eq!(parent_remote("a"), ".");
    }
}
