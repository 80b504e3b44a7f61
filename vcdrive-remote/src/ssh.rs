//! Shell-style sessions over SSH, file primitives over SFTP.

// Standard library
use std::fs;
use std::io::{self, Read};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

// External crates
use ssh2::{ErrorCode, Session, Sftp};
use tracing::debug;
use vcdrive_core::Credentials;

// Internal imports
use crate::{
    CommandOutput, EntryKind, RemoteDirEntry, RemoteSession, RemoteStat, SessionError,
    SessionResult,
};

// SFTP status code for a missing path (SSH_FX_NO_SUCH_FILE).
const SFTP_NO_SUCH_FILE: ErrorCode = ErrorCode::SFTP(2);

pub struct SshSession {
    session: Session,
    host: String,
}

impl SshSession {
    /// Opens a session: TCP connect with a bound, handshake, password auth.
    ///
    /// The handshake and auth run under the connect timeout; once the session
    /// is up the timeout is lifted so long-running commands are not cut off.
    pub fn open(
        host: &str,
        port: u16,
        credentials: &Credentials,
        connect_timeout: Duration,
    ) -> SessionResult<Self> {
        let addr = format!("{}:{}", host, port);
        let sock_addr = addr
            .to_socket_addrs()
            .map_err(|e| SessionError::Connect {
                addr: addr.clone(),
                reason: e.to_string(),
            })?
            .next()
            .ok_or_else(|| SessionError::Connect {
                addr: addr.clone(),
                reason: "address resolved to nothing".to_string(),
            })?;

        let tcp = TcpStream::connect_timeout(&sock_addr, connect_timeout).map_err(|e| {
            SessionError::Connect {
                addr: addr.clone(),
                reason: e.to_string(),
            }
        })?;

        let mut session = Session::new().map_err(|e| SessionError::Connect {
            addr: addr.clone(),
            reason: e.to_string(),
        })?;
        session.set_timeout(connect_timeout.as_millis() as u32);
        session.set_tcp_stream(tcp);
        session.handshake().map_err(|e| SessionError::Connect {
            addr: addr.clone(),
            reason: format!("handshake failed: {}", e),
        })?;

        session
            .userauth_password(&credentials.username, &credentials.password)
            .map_err(|e| SessionError::Auth {
                username: credentials.username.clone(),
                reason: e.to_string(),
            })?;
        if !session.authenticated() {
            return Err(SessionError::Auth {
                username: credentials.username.clone(),
                reason: "not authenticated after password attempt".to_string(),
            });
        }

        // Commands run until completion or failure; only setup is bounded.
        session.set_timeout(0);

        debug!("SSH session established with {}", addr);
        Ok(Self {
            session,
            host: host.to_string(),
        })
    }

    fn sftp(&self) -> SessionResult<Sftp> {
        self.session
            .sftp()
            .map_err(|e| SessionError::Protocol(format!("sftp subsystem failed: {}", e)))
    }
}

impl RemoteSession for SshSession {
    fn run(&mut self, command: &str) -> SessionResult<CommandOutput> {
        let mut channel = self
            .session
            .channel_session()
            .map_err(|e| SessionError::Protocol(format!("channel open failed: {}", e)))?;
        channel
            .exec(command)
            .map_err(|e| SessionError::Protocol(format!("exec failed: {}", e)))?;

        let mut stdout = String::new();
        channel.read_to_string(&mut stdout)?;
        let mut stderr = String::new();
        channel.stderr().read_to_string(&mut stderr)?;

        channel
            .wait_close()
            .map_err(|e| SessionError::Protocol(format!("channel close failed: {}", e)))?;
        let return_code = channel
            .exit_status()
            .map_err(|e| SessionError::Protocol(format!("exit status unavailable: {}", e)))?;

        debug!(
            "SSH command on {} exited with {}: {}",
            self.host, return_code, command
        );
        Ok(CommandOutput {
            return_code,
            stdout,
            stderr,
        })
    }

    fn put(&mut self, local: &Path, remote: &str) -> SessionResult<()> {
        let sftp = self.sftp()?;
        let mut source = fs::File::open(local)?;
        let mut target = sftp.create(Path::new(remote)).map_err(|e| {
            if e.code() == SFTP_NO_SUCH_FILE {
                SessionError::MissingRemote(remote.to_string())
            } else {
                SessionError::Protocol(format!("create '{}' failed: {}", remote, e))
            }
        })?;
        io::copy(&mut source, &mut target)?;
        Ok(())
    }

    fn get(&mut self, remote: &str, local: &Path) -> SessionResult<()> {
        let sftp = self.sftp()?;
        let mut source = sftp.open(Path::new(remote)).map_err(|e| {
            if e.code() == SFTP_NO_SUCH_FILE {
                SessionError::MissingRemote(remote.to_string())
            } else {
                SessionError::Protocol(format!("open '{}' failed: {}", remote, e))
            }
        })?;
        let mut target = fs::File::create(local)?;
        io::copy(&mut source, &mut target)?;
        Ok(())
    }

    fn stat(&mut self, remote: &str) -> SessionResult<Option<RemoteStat>> {
        let sftp = self.sftp()?;
        match sftp.stat(Path::new(remote)) {
            Ok(stat) => Ok(Some(RemoteStat {
                kind: if stat.is_dir() {
                    EntryKind::Dir
                } else {
                    EntryKind::File
                },
            })),
            Err(e) if e.code() == SFTP_NO_SUCH_FILE => Ok(None),
            Err(e) => Err(SessionError::Protocol(format!(
                "stat '{}' failed: {}",
                remote, e
            ))),
        }
    }

    fn read_dir(&mut self, remote: &str) -> SessionResult<Vec<RemoteDirEntry>> {
        let sftp = self.sftp()?;
        let entries = sftp.readdir(Path::new(remote)).map_err(|e| {
            if e.code() == SFTP_NO_SUCH_FILE {
                SessionError::MissingRemote(remote.to_string())
            } else {
                SessionError::Protocol(format!("readdir '{}' failed: {}", remote, e))
            }
        })?;
        Ok(entries
            .into_iter()
            .filter_map(|(path, stat)| {
                let name = path.file_name()?.to_string_lossy().into_owned();
                Some(RemoteDirEntry {
                    name,
                    kind: if stat.is_dir() {
                        EntryKind::Dir
                    } else {
                        EntryKind::File
                    },
                })
            })
            .collect())
    }

    fn make_dirs(&mut self, remote: &str) -> SessionResult<()> {
        let sftp = self.sftp()?;
        let mut acc = if remote.starts_with('/') {
            String::from("/")
        } else {
            String::new()
        };
        for part in remote.split('/').filter(|p| !p.is_empty() && *p != ".") {
            if !acc.is_empty() && !acc.ends_with('/') {
                acc.push('/');
            }
            acc.push_str(part);
            let path = Path::new(&acc);
            if sftp.stat(path).is_ok() {
                continue;
            }
            if let Err(e) = sftp.mkdir(path, 0o755) {
                // A concurrent creator may have won; only missing is fatal.
                if sftp.stat(path).is_err() {
                    return Err(SessionError::Protocol(format!(
                        "mkdir '{}' failed: {}",
                        acc, e
                    )));
                }
            }
        }
        Ok(())
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        let _ = self
            .session
            .disconnect(None, "vcdrive session complete", None);
    }
}
