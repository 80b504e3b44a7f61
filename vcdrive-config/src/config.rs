// Standard library
use std::env;

// External crates
use serde::{Deserialize, Serialize};
use vcdrive_core::Credentials;

/// Top-level configuration for the driver.
///
/// Loaded from YAML (see [`crate::loader::ConfigLoader`]) and passed
/// explicitly into the control-plane and session constructors. Nothing in
/// the driver reads configuration from ambient globals.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DriverConfig {
    pub vcenter: VcenterConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub ssh: Option<Credentials>,
    #[serde(default)]
    pub winrm: Option<Credentials>,
}

/// Connection settings for the vCenter control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VcenterConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Accept self-signed certificates on the control plane endpoint.
    #[serde(default)]
    pub insecure: bool,
    #[serde(default)]
    pub datacenter: Option<String>,
}

fn default_port() -> u16 {
    443
}

impl Default for VcenterConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_port(),
            username: String::new(),
            password: String::new(),
            insecure: false,
            datacenter: None,
        }
    }
}

/// Bounds for the blocking waits the driver performs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeoutConfig {
    /// TCP/session establishment bound for remote sessions.
    #[serde(default = "default_connect_secs")]
    pub connect_secs: u64,
    /// Total time to wait for a machine to report an IPv4 address.
    #[serde(default = "default_ip_wait_secs")]
    pub ip_wait_secs: u64,
    /// Interval between address polls.
    #[serde(default = "default_ip_poll_secs")]
    pub ip_poll_secs: u64,
}

fn default_connect_secs() -> u64 {
    30
}

fn default_ip_wait_secs() -> u64 {
    180
}

fn default_ip_poll_secs() -> u64 {
    2
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: default_connect_secs(),
            ip_wait_secs: default_ip_wait_secs(),
            ip_poll_secs: default_ip_poll_secs(),
        }
    }
}

impl DriverConfig {
    /// Applies `VCDRIVE_*` environment variables on top of the loaded values.
    ///
    /// Credential variables update an existing pair in place, or introduce a
    /// new pair when none was configured in the file.
    pub fn apply_env_overrides(mut self) -> Self {
        if let Ok(host) = env::var("VCDRIVE_HOST") {
            self.vcenter.host = host;
        }
        if let Ok(port) = env::var("VCDRIVE_PORT") {
            if let Ok(port) = port.parse() {
                self.vcenter.port = port;
            }
        }
        if let Ok(username) = env::var("VCDRIVE_USERNAME") {
            self.vcenter.username = username;
        }
        if let Ok(password) = env::var("VCDRIVE_PASSWORD") {
            self.vcenter.password = password;
        }
        override_credentials(
            &mut self.ssh,
            "VCDRIVE_SSH_USERNAME",
            "VCDRIVE_SSH_PASSWORD",
        );
        override_credentials(
            &mut self.winrm,
            "VCDRIVE_WINRM_USERNAME",
            "VCDRIVE_WINRM_PASSWORD",
        );
        self
    }
}

fn override_credentials(slot: &mut Option<Credentials>, user_var: &str, pass_var: &str) {
    let username = env::var(user_var).ok();
    let password = env::var(pass_var).ok();
    if username.is_none() && password.is_none() {
        return;
    }
    let pair = slot.get_or_insert_with(|| Credentials::new("", ""));
    if let Some(username) = username {
        pair.username = username;
    }
    if let Some(password) = password {
        pair.password = password;
    }
}
