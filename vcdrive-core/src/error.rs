use std::fmt::{self, Display, Formatter};
use thiserror::Error;

/// Every failure names the operation and the identity (machine name, path,
/// host) it failed against, so callers never have to guess which of their
/// handles went wrong.
#[derive(Error, Debug)]
pub enum DriverError {
    NotFound { name: String },
    Ambiguous { name: String, count: usize },
    Creation { name: String, reason: String },
    Destruction { name: String, reason: String },
    Upload { path: String, reason: String },
    Download { path: String, reason: String },
    Ssh { host: String, reason: String },
    WinRm { host: String, reason: String },
    IpTimeout { name: String, waited_secs: u64 },
    Config(String),
    Platform(String),
    Io(#[from] std::io::Error),
}

impl Display for DriverError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            DriverError::NotFound { name } => {
                write!(f, "No virtual machine named '{}' was found", name)
            }
            DriverError::Ambiguous { name, count } => {
                write!(
                    f,
                    "Found {} virtual machines named '{}', expected exactly one",
                    count, name
                )
            }
            DriverError::Creation { name, reason } => {
                write!(f, "Failed to create virtual machine '{}': {}", name, reason)
            }
            DriverError::Destruction { name, reason } => {
                write!(f, "Failed to destroy virtual machine '{}': {}", name, reason)
            }
            DriverError::Upload { path, reason } => {
                write!(f, "Upload of '{}' failed: {}", path, reason)
            }
            DriverError::Download { path, reason } => {
                write!(f, "Download of '{}' failed: {}", path, reason)
            }
            DriverError::Ssh { host, reason } => {
                write!(f, "SSH command on {} failed: {}", host, reason)
            }
            DriverError::WinRm { host, reason } => {
                write!(f, "WinRM command on {} failed: {}", host, reason)
            }
            DriverError::IpTimeout { name, waited_secs } => {
                write!(
                    f,
                    "Virtual machine '{}' reported no IPv4 address within {}s",
                    name, waited_secs
                )
            }
            DriverError::Config(s) => write!(f, "Configuration error: {}", s),
            DriverError::Platform(s) => write!(f, "Control plane error: {}", s),
            DriverError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

pub type Result<T> = std::result::Result<T, DriverError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_names_the_machine() {
        let err = DriverError::NotFound {
            name: "ci-worker-3".into(),
        };
        assert!(err.to_string().contains("ci-worker-3"));
    }

    #[test]
    fn ambiguous_reports_the_count() {
        let err = DriverError::Ambiguous {
            name: "db".into(),
            count: 4,
        };
        let msg = err.to_string();
        assert!(msg.contains("db"));
        assert!(msg.contains('4'));
    }

    #[test]
    fn transfer_errors_name_the_path() {
        let up = DriverError::Upload {
            path: "dist/app.tar".into(),
            reason: "no such remote directory".into(),
        };
        assert!(up.to_string().contains("dist/app.tar"));
        let down = DriverError::Download {
            path: "/var/log/syslog".into(),
            reason: "missing".into(),
        };
        assert!(down.to_string().contains("/var/log/syslog"));
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: DriverError = io.into();
        assert!(matches!(err, DriverError::Io(_)));
    }
}
