//! The virtual machine handle and its idempotent lifecycle.
//!
//! A handle carries the identity needed to resolve or recreate one named
//! machine, plus at most one resolved reference. The reference is present
//! exactly when the handle believes the machine exists on the platform, and
//! every lifecycle operation preserves that invariant even when the desired
//! end state already holds. The platform stays the source of truth: `find`
//! always re-queries, and `create` copes with a rival creator winning the
//! race.

// Standard library
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

// External crates
use tracing::{debug, info, warn};
use vcdrive_config::TimeoutConfig;
use vcdrive_core::{Credentials, DriverError, Result};
use vcdrive_remote::{transfer, CommandOutput, Direction, RemoteSession, SshSession, WinRmSession};

// Internal imports
use crate::plane::{ControlPlane, MachineRef};

const SSH_PORT: u16 = 22;
const WINRM_PORT: u16 = 5985;

/// Static identity of a machine: what it is called, where it lives, what it
/// is cloned from, and how to log into it.
#[derive(Debug, Clone)]
pub struct MachineSpec {
    pub name: String,
    pub folder: Option<String>,
    pub template: Option<String>,
    pub ssh: Option<Credentials>,
    pub winrm: Option<Credentials>,
    pub timeouts: TimeoutConfig,
}

impl MachineSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            folder: None,
            template: None,
            ssh: None,
            winrm: None,
            timeouts: TimeoutConfig::default(),
        }
    }

    pub fn with_folder(mut self, folder: impl Into<String>) -> Self {
        self.folder = Some(folder.into());
        self
    }

    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = Some(template.into());
        self
    }

    pub fn with_ssh(mut self, credentials: Credentials) -> Self {
        self.ssh = Some(credentials);
        self
    }

    pub fn with_winrm(mut self, credentials: Credentials) -> Self {
        self.winrm = Some(credentials);
        self
    }

    pub fn with_timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }
}

pub struct VirtualMachine {
    plane: Arc<dyn ControlPlane>,
    spec: MachineSpec,
    resolved: Option<MachineRef>,
}

// The control-plane handle has no useful Debug form; show identity and
// resolution status instead.
impl std::fmt::Debug for VirtualMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualMachine")
            .field("name", &self.spec.name)
            .field("folder", &self.spec.folder)
            .field("resolved", &self.resolved)
            .finish()
    }
}

impl VirtualMachine {
    pub fn new(plane: Arc<dyn ControlPlane>, spec: MachineSpec) -> Self {
        Self {
            plane,
            spec,
            resolved: None,
        }
    }

    /// Wraps an already-live platform object in a resolved handle.
    /// Used by folder sweeps and inventory listings.
    pub(crate) fn adopted(
        plane: Arc<dyn ControlPlane>,
        folder: Option<&str>,
        reference: MachineRef,
    ) -> Self {
        let mut spec = MachineSpec::new(reference.name.clone());
        spec.folder = folder.map(str::to_string);
        Self {
            plane,
            spec,
            resolved: Some(reference),
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn folder(&self) -> Option<&str> {
        self.spec.folder.as_deref()
    }

    /// Whether the handle currently holds a resolved reference.
    pub fn is_resolved(&self) -> bool {
        self.resolved.is_some()
    }

    pub fn reference(&self) -> Option<&MachineRef> {
        self.resolved.as_ref()
    }

    /// Resolves the handle against the live inventory.
    ///
    /// Always re-queries, even when already resolved, so a machine destroyed
    /// out-of-band is detected instead of trusted from cache. Zero matches
    /// clears the handle and fails; more than one clears the handle and
    /// fails, because a name expected to be unique is not.
    pub fn find(&mut self) -> Result<()> {
        let mut matches = self
            .plane
            .find_machines(&self.spec.name, self.spec.folder.as_deref())?;
        match matches.len() {
            0 => {
                self.resolved = None;
                Err(DriverError::NotFound {
                    name: self.spec.name.clone(),
                })
            }
            1 => {
                let reference = matches.remove(0);
                debug!("resolved '{}' to {}", self.spec.name, reference);
                self.resolved = Some(reference);
                Ok(())
            }
            count => {
                self.resolved = None;
                Err(DriverError::Ambiguous {
                    name: self.spec.name.clone(),
                    count,
                })
            }
        }
    }

    /// Clones the machine from its template.
    ///
    /// A no-op when already resolved; the platform is not contacted again.
    /// When the platform rejects the clone, one re-resolution is attempted:
    /// exactly one match means a rival creator won the race and the handle
    /// adopts that machine instead of failing.
    pub fn create(&mut self) -> Result<()> {
        if self.resolved.is_some() {
            debug!("'{}' is already resolved, create is a no-op", self.spec.name);
            return Ok(());
        }
        let template = self.spec.template.as_deref().ok_or_else(|| {
            DriverError::Creation {
                name: self.spec.name.clone(),
                reason: "no template configured".to_string(),
            }
        })?;

        match self
            .plane
            .clone_from_template(template, &self.spec.name, self.spec.folder.as_deref())
        {
            Ok(reference) => {
                info!("created '{}' as {}", self.spec.name, reference);
                self.resolved = Some(reference);
                Ok(())
            }
            Err(error) => {
                if let Ok(mut matches) = self
                    .plane
                    .find_machines(&self.spec.name, self.spec.folder.as_deref())
                {
                    if matches.len() == 1 {
                        let reference = matches.remove(0);
                        warn!(
                            "'{}' already exists as {}, adopting it",
                            self.spec.name, reference
                        );
                        self.resolved = Some(reference);
                        return Ok(());
                    }
                }
                Err(DriverError::Creation {
                    name: self.spec.name.clone(),
                    reason: error.to_string(),
                })
            }
        }
    }

    /// Deletes the machine behind the handle.
    ///
    /// A no-op when unresolved. On platform failure the reference is kept,
    /// so the handle never claims a machine is gone that might not be.
    pub fn destroy(&mut self) -> Result<()> {
        let Some(reference) = self.resolved.as_ref() else {
            debug!("'{}' is not resolved, destroy is a no-op", self.spec.name);
            return Ok(());
        };
        match self.plane.delete_machine(reference) {
            Ok(()) => {
                info!("destroyed '{}'", self.spec.name);
                self.resolved = None;
                Ok(())
            }
            Err(error) => Err(DriverError::Destruction {
                name: self.spec.name.clone(),
                reason: error.to_string(),
            }),
        }
    }

    /// Waits for the machine to publish an IPv4 address.
    ///
    /// Requires a resolved handle. Polls until the platform reports a
    /// dotted-quad-parseable address or the configured bound elapses;
    /// non-IPv4 reports are skipped while the guest settles.
    pub fn ip(&self) -> Result<String> {
        let Some(reference) = self.resolved.as_ref() else {
            return Err(DriverError::NotFound {
                name: self.spec.name.clone(),
            });
        };
        let waited_secs = self.spec.timeouts.ip_wait_secs;
        let deadline = Instant::now() + Duration::from_secs(waited_secs);
        loop {
            if let Some(address) = self.plane.machine_ip(reference)? {
                if address.parse::<Ipv4Addr>().is_ok() {
                    debug!("'{}' reported address {}", self.spec.name, address);
                    return Ok(address);
                }
            }
            if Instant::now() >= deadline {
                return Err(DriverError::IpTimeout {
                    name: self.spec.name.clone(),
                    waited_secs,
                });
            }
            thread::sleep(Duration::from_secs(self.spec.timeouts.ip_poll_secs));
        }
    }

    /// Runs one command over SSH and returns its captured result.
    /// A non-zero exit or any session failure is an error.
    pub fn ssh(&self, command: &str) -> Result<CommandOutput> {
        let credentials = self.spec.ssh.as_ref().ok_or_else(|| DriverError::Ssh {
            host: self.spec.name.clone(),
            reason: "no SSH credentials configured".to_string(),
        })?;
        let host = self.ip()?;
        let mut session = SshSession::open(
            &host,
            SSH_PORT,
            credentials,
            Duration::from_secs(self.spec.timeouts.connect_secs),
        )
        .map_err(|e| DriverError::Ssh {
            host: host.clone(),
            reason: e.to_string(),
        })?;
        let output = session.run(command).map_err(|e| DriverError::Ssh {
            host: host.clone(),
            reason: e.to_string(),
        })?;
        command_result(&host, command, output, false)
    }

    /// Runs one command over WinRM; same contract as [`Self::ssh`].
    pub fn winrm(&self, command: &str) -> Result<CommandOutput> {
        let credentials = self.spec.winrm.as_ref().ok_or_else(|| DriverError::WinRm {
            host: self.spec.name.clone(),
            reason: "no WinRM credentials configured".to_string(),
        })?;
        let host = self.ip()?;
        let mut session = WinRmSession::open(
            &host,
            WINRM_PORT,
            credentials,
            Duration::from_secs(self.spec.timeouts.connect_secs),
        )
        .map_err(|e| DriverError::WinRm {
            host: host.clone(),
            reason: e.to_string(),
        })?;
        let output = session.run(command).map_err(|e| DriverError::WinRm {
            host: host.clone(),
            reason: e.to_string(),
        })?;
        command_result(&host, command, output, true)
    }

    /// Uploads a file or directory tree; returns the transferred relative
    /// paths. Any single entry failing fails the whole call; completed
    /// entries are not rolled back.
    pub fn upload(&self, local: &Path, remote: &str) -> Result<Vec<PathBuf>> {
        let mut session = self.transfer_session()?;
        transfer(session.as_mut(), local, remote, Direction::Upload).map_err(|e| {
            DriverError::Upload {
                path: local.display().to_string(),
                reason: e.to_string(),
            }
        })
    }

    /// Downloads a file or directory tree; same contract as [`Self::upload`].
    pub fn download(&self, local: &Path, remote: &str) -> Result<Vec<PathBuf>> {
        let mut session = self.transfer_session()?;
        transfer(session.as_mut(), local, remote, Direction::Download).map_err(|e| {
            DriverError::Download {
                path: remote.to_string(),
                reason: e.to_string(),
            }
        })
    }

    /// Transfers ride the shell session when SSH credentials are present,
    /// the remote-management session otherwise.
    fn transfer_session(&self) -> Result<Box<dyn RemoteSession>> {
        let host = self.ip()?;
        let connect = Duration::from_secs(self.spec.timeouts.connect_secs);
        if let Some(credentials) = self.spec.ssh.as_ref() {
            let session = SshSession::open(&host, SSH_PORT, credentials, connect).map_err(|e| {
                DriverError::Ssh {
                    host: host.clone(),
                    reason: e.to_string(),
                }
            })?;
            return Ok(Box::new(session));
        }
        if let Some(credentials) = self.spec.winrm.as_ref() {
            let session =
                WinRmSession::open(&host, WINRM_PORT, credentials, connect).map_err(|e| {
                    DriverError::WinRm {
                        host: host.clone(),
                        reason: e.to_string(),
                    }
                })?;
            return Ok(Box::new(session));
        }
        Err(DriverError::Config(format!(
            "machine '{}' has no remote credentials for transfers",
            self.spec.name
        )))
    }
}

/// Lists every machine visible to the session as read-only resolved views.
pub fn list_virtual_machines(plane: &Arc<dyn ControlPlane>) -> Result<Vec<VirtualMachine>> {
    Ok(plane
        .list_machines()?
        .into_iter()
        .map(|reference| VirtualMachine::adopted(plane.clone(), None, reference))
        .collect())
}

fn command_result(
    host: &str,
    command: &str,
    output: CommandOutput,
    winrm: bool,
) -> Result<CommandOutput> {
    if output.success() {
        return Ok(output);
    }
    let reason = format!(
        "'{}' exited with {}: {}",
        command,
        output.return_code,
        output.stderr.trim()
    );
    if winrm {
        Err(DriverError::WinRm {
            host: host.to_string(),
            reason,
        })
    } else {
        Err(DriverError::Ssh {
            host: host.to_string(),
            reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::InMemoryPlane;
    use vcdrive_core::DriverError;

    fn fast_timeouts() -> TimeoutConfig {
        TimeoutConfig {
            connect_secs: 1,
            ip_wait_secs: 0,
            ip_poll_secs: 0,
        }
    }

    fn machine_on(plane: &Arc<InMemoryPlane>, name: &str) -> VirtualMachine {
        let spec = MachineSpec::new(name)
            .with_template("base-template")
            .with_folder("integration")
            .with_timeouts(fast_timeouts());
        VirtualMachine::new(plane.clone() as Arc<dyn ControlPlane>, spec)
    }

    fn plane_with_fixtures() -> Arc<InMemoryPlane> {
        let plane = Arc::new(InMemoryPlane::new());
        plane.add_template("base-template");
        plane.add_folder("integration");
        plane
    }

    #[test]
    fn find_with_no_matches_fails_both_times() {
        let plane = plane_with_fixtures();
        let mut vm = machine_on(&plane, "absent");

        for _ in 0..2 {
            let err = vm.find().unwrap_err();
            assert!(matches!(err, DriverError::NotFound { .. }));
            assert!(!vm.is_resolved());
        }
    }

    #[test]
    fn create_twice_keeps_one_machine_and_one_clone_call() {
        let plane = plane_with_fixtures();
        let mut vm = machine_on(&plane, "worker");

        vm.create().unwrap();
        let first = vm.reference().unwrap().clone();
        vm.create().unwrap();
        assert_eq!(vm.reference(), Some(&first));
        assert_eq!(plane.clone_calls(), 1);
        assert_eq!(plane.machine_count(), 1);
    }

    #[test]
    fn destroy_twice_is_idempotent() {
        let plane = plane_with_fixtures();
        let mut vm = machine_on(&plane, "worker");

        vm.create().unwrap();
        vm.destroy().unwrap();
        assert!(!vm.is_resolved());
        vm.destroy().unwrap();
        assert!(!vm.is_resolved());
        assert_eq!(plane.machine_count(), 0);
    }

    #[test]
    fn find_detects_out_of_band_destruction() {
        let plane = plane_with_fixtures();
        let mut vm = machine_on(&plane, "worker");

        vm.create().unwrap();
        vm.find().unwrap();

        // Another actor removes the machine behind the handle's back.
        plane.remove_by_name("worker");
        let err = vm.find().unwrap_err();
        assert!(matches!(err, DriverError::NotFound { .. }));
        assert!(!vm.is_resolved());
    }

    #[test]
    fn duplicate_names_resolve_to_ambiguous() {
        let plane = plane_with_fixtures();
        plane.set_reject_duplicate_names(false);
        plane.seed_machine("twin", Some("integration"));
        plane.seed_machine("twin", Some("integration"));

        let mut vm = machine_on(&plane, "twin");
        let err = vm.find().unwrap_err();
        assert!(matches!(err, DriverError::Ambiguous { count: 2, .. }));
        assert!(!vm.is_resolved());
    }

    #[test]
    fn losing_a_create_race_adopts_the_existing_machine() {
        let plane = plane_with_fixtures();
        let mut winner = machine_on(&plane, "contested");
        let mut loser = machine_on(&plane, "contested");

        winner.create().unwrap();
        loser.create().unwrap();

        assert!(loser.is_resolved());
        assert_eq!(loser.reference(), winner.reference());
        assert_eq!(plane.clone_calls(), 1);
    }

    #[test]
    fn create_without_a_template_fails() {
        let plane = plane_with_fixtures();
        let spec = MachineSpec::new("untemplated").with_timeouts(fast_timeouts());
        let mut vm = VirtualMachine::new(plane.clone() as Arc<dyn ControlPlane>, spec);

        let err = vm.create().unwrap_err();
        assert!(matches!(err, DriverError::Creation { .. }));
        assert!(!vm.is_resolved());
    }

    #[test]
    fn create_with_an_unknown_template_names_the_machine() {
        let plane = plane_with_fixtures();
        let spec = MachineSpec::new("worker")
            .with_template("ghost-template")
            .with_timeouts(fast_timeouts());
        let mut vm = VirtualMachine::new(plane.clone() as Arc<dyn ControlPlane>, spec);

        let err = vm.create().unwrap_err();
        assert!(matches!(err, DriverError::Creation { .. }));
        assert!(err.to_string().contains("worker"));
    }

    #[test]
    fn failed_destroy_keeps_the_handle_resolved() {
        let plane = plane_with_fixtures();
        let mut vm = machine_on(&plane, "stubborn");

        vm.create().unwrap();
        plane.fail_delete_of("stubborn");
        let err = vm.destroy().unwrap_err();
        assert!(matches!(err, DriverError::Destruction { .. }));
        assert!(vm.is_resolved());

        // Once the platform recovers, destroy goes through.
        plane.clear_delete_failures();
        vm.destroy().unwrap();
        assert!(!vm.is_resolved());
    }

    #[test]
    fn ip_returns_a_dotted_quad_after_create() {
        let plane = plane_with_fixtures();
        let mut vm = machine_on(&plane, "worker");

        vm.create().unwrap();
        let address = vm.ip().unwrap();
        assert!(address.parse::<std::net::Ipv4Addr>().is_ok());
    }

    #[test]
    fn ip_waits_out_slow_guests() {
        let plane = plane_with_fixtures();
        plane.set_ip_ready_after(3);
        let spec = MachineSpec::new("slow-boot")
            .with_template("base-template")
            .with_folder("integration")
            .with_timeouts(TimeoutConfig {
                connect_secs: 1,
                ip_wait_secs: 5,
                ip_poll_secs: 0,
            });
        let mut vm = VirtualMachine::new(plane.clone() as Arc<dyn ControlPlane>, spec);

        vm.create().unwrap();
        let address = vm.ip().unwrap();
        assert!(address.parse::<std::net::Ipv4Addr>().is_ok());
        assert!(plane.ip_polls("slow-boot") >= 3);
    }

    #[test]
    fn ip_times_out_when_no_address_appears() {
        let plane = plane_with_fixtures();
        let mut vm = machine_on(&plane, "headless");

        vm.create().unwrap();
        plane.clear_ip("headless");
        let err = vm.ip().unwrap_err();
        assert!(matches!(err, DriverError::IpTimeout { .. }));
    }

    #[test]
    fn ip_requires_a_resolved_handle() {
        let plane = plane_with_fixtures();
        let vm = machine_on(&plane, "unresolved");

        let err = vm.ip().unwrap_err();
        assert!(matches!(err, DriverError::NotFound { .. }));
    }

    #[test]
    fn ssh_without_credentials_fails_up_front() {
        let plane = plane_with_fixtures();
        let mut vm = machine_on(&plane, "worker");
        vm.create().unwrap();

        let err = vm.ssh("ls").unwrap_err();
        assert!(matches!(err, DriverError::Ssh { .. }));
        assert!(err.to_string().contains("credentials"));
    }

    #[test]
    fn list_virtual_machines_sees_every_machine() {
        let plane = plane_with_fixtures();
        machine_on(&plane, "one").create().unwrap();
        machine_on(&plane, "two").create().unwrap();

        let all =
            list_virtual_machines(&(plane.clone() as Arc<dyn ControlPlane>)).unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(VirtualMachine::is_resolved));
    }

    #[test]
    fn nonzero_exit_maps_to_a_protocol_error() {
        let output = CommandOutput {
            return_code: 127,
            stdout: String::new(),
            stderr: "command not found".to_string(),
        };
        let err = command_result("10.0.0.5", "wrong-command", output, false).unwrap_err();
        match err {
            DriverError::Ssh { host, reason } => {
                assert_eq!(host, "10.0.0.5");
                assert!(reason.contains("127"));
                assert!(reason.contains("command not found"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }
}
