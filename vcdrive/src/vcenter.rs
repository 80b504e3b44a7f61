//! Control-plane client for the vCenter Automation REST API.
//!
//! Holds one authenticated session for the process lifetime: connect once,
//! send the session token on every call, release the session on drop.

// Standard library
use std::time::Duration;

// External crates
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};
use vcdrive_config::{TimeoutConfig, VcenterConfig};
use vcdrive_core::{DriverError, Result};

// Internal imports
use crate::plane::{ControlPlane, MachineRef};

const SESSION_HEADER: &str = "vmware-api-session-id";

#[derive(Debug, Deserialize)]
struct VmSummary {
    vm: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct FolderSummary {
    folder: String,
}

#[derive(Debug, Deserialize)]
struct GuestIdentity {
    ip_address: Option<String>,
}

pub struct VcenterPlane {
    client: reqwest::blocking::Client,
    base: String,
    session_token: String,
}

impl VcenterPlane {
    /// Opens an authenticated API session against the configured endpoint.
    pub fn connect(config: &VcenterConfig, timeouts: &TimeoutConfig) -> Result<Self> {
        let base = format!("https://{}:{}", config.host, config.port);

        let mut builder = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(timeouts.connect_secs))
            .timeout(Duration::from_secs(timeouts.connect_secs * 2));
        if config.insecure {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let client = builder
            .build()
            .map_err(|e| DriverError::Platform(format!("HTTP client setup failed: {}", e)))?;

        let response = client
            .post(format!("{}/api/session", base))
            .basic_auth(&config.username, Some(&config.password))
            .send()
            .map_err(|e| DriverError::Platform(format!("connection to {} failed: {}", base, e)))?;
        if !response.status().is_success() {
            return Err(DriverError::Platform(format!(
                "session create on {} failed with {}",
                base,
                response.status()
            )));
        }
        let session_token: String = response
            .json()
            .map_err(|e| DriverError::Platform(format!("malformed session token: {}", e)))?;

        info!("Connected to vCenter at {}", base);
        Ok(Self {
            client,
            base,
            session_token,
        })
    }

    fn get(&self, path: &str, query: &[(&str, &str)]) -> Result<reqwest::blocking::Response> {
        self.client
            .get(format!("{}{}", self.base, path))
            .header(SESSION_HEADER, &self.session_token)
            .query(query)
            .send()
            .map_err(|e| DriverError::Platform(format!("GET {} failed: {}", path, e)))
    }

    fn expect_success(path: &str, response: reqwest::blocking::Response) -> Result<reqwest::blocking::Response> {
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(DriverError::Platform(format!(
                "{} failed with {}",
                path,
                response.status()
            )))
        }
    }

    /// Resolves a folder name to its identifier; missing folders surface as
    /// platform errors naming the folder.
    fn folder_id(&self, folder: &str) -> Result<String> {
        let response = self.get("/api/vcenter/folder", &[("names", folder)])?;
        let response = Self::expect_success("/api/vcenter/folder", response)?;
        let folders: Vec<FolderSummary> = response
            .json()
            .map_err(|e| DriverError::Platform(format!("malformed folder list: {}", e)))?;
        folders
            .into_iter()
            .next()
            .map(|f| f.folder)
            .ok_or_else(|| DriverError::Platform(format!("folder '{}' not found", folder)))
    }

    fn vm_query(&self, query: &[(&str, &str)]) -> Result<Vec<MachineRef>> {
        let response = self.get("/api/vcenter/vm", query)?;
        let response = Self::expect_success("/api/vcenter/vm", response)?;
        let summaries: Vec<VmSummary> = response
            .json()
            .map_err(|e| DriverError::Platform(format!("malformed machine list: {}", e)))?;
        Ok(summaries
            .into_iter()
            .map(|s| MachineRef {
                id: s.vm,
                name: s.name,
            })
            .collect())
    }
}

impl ControlPlane for VcenterPlane {
    fn find_machines(&self, name: &str, folder: Option<&str>) -> Result<Vec<MachineRef>> {
        match folder {
            Some(folder) => {
                let folder_id = self.folder_id(folder)?;
                self.vm_query(&[("names", name), ("folders", folder_id.as_str())])
            }
            None => self.vm_query(&[("names", name)]),
        }
    }

    fn machines_in_folder(&self, folder: &str) -> Result<Vec<MachineRef>> {
        let folder_id = self.folder_id(folder)?;
        self.vm_query(&[("folders", folder_id.as_str())])
    }

    fn list_machines(&self) -> Result<Vec<MachineRef>> {
        self.vm_query(&[])
    }

    fn clone_from_template(
        &self,
        template: &str,
        name: &str,
        folder: Option<&str>,
    ) -> Result<MachineRef> {
        let sources = self.vm_query(&[("names", template)])?;
        if sources.len() != 1 {
            return Err(DriverError::Platform(format!(
                "template '{}' matched {} machines, expected exactly one",
                template,
                sources.len()
            )));
        }
        let source = &sources[0];

        let mut placement = json!({});
        if let Some(folder) = folder {
            placement = json!({ "folder": self.folder_id(folder)? });
        }
        let body = json!({
            "source": source.id,
            "name": name,
            "placement": placement,
        });

        let response = self
            .client
            .post(format!("{}/api/vcenter/vm", self.base))
            .header(SESSION_HEADER, &self.session_token)
            .query(&[("action", "clone")])
            .json(&body)
            .send()
            .map_err(|e| DriverError::Platform(format!("clone request failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(DriverError::Platform(format!(
                "clone of '{}' from '{}' failed with {}",
                name,
                template,
                response.status()
            )));
        }
        let id: String = response
            .json()
            .map_err(|e| DriverError::Platform(format!("malformed clone response: {}", e)))?;

        debug!("cloned '{}' from '{}' as {}", name, template, id);
        Ok(MachineRef {
            id,
            name: name.to_string(),
        })
    }

    fn delete_machine(&self, machine: &MachineRef) -> Result<()> {
        let response = self
            .client
            .delete(format!("{}/api/vcenter/vm/{}", self.base, machine.id))
            .header(SESSION_HEADER, &self.session_token)
            .send()
            .map_err(|e| DriverError::Platform(format!("delete request failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(DriverError::Platform(format!(
                "delete of {} failed with {}",
                machine,
                response.status()
            )));
        }
        debug!("deleted {}", machine);
        Ok(())
    }

    fn machine_ip(&self, machine: &MachineRef) -> Result<Option<String>> {
        let response = self.get(
            &format!("/api/vcenter/vm/{}/guest/identity", machine.id),
            &[],
        )?;
        // Guest tools report nothing until the machine settles.
        if response.status() == StatusCode::NOT_FOUND
            || response.status() == StatusCode::SERVICE_UNAVAILABLE
        {
            return Ok(None);
        }
        let response = Self::expect_success("guest/identity", response)?;
        let identity: GuestIdentity = response
            .json()
            .map_err(|e| DriverError::Platform(format!("malformed guest identity: {}", e)))?;
        Ok(identity.ip_address)
    }
}

impl Drop for VcenterPlane {
    fn drop(&mut self) {
        let _ = self
            .client
            .delete(format!("{}/api/session", self.base))
            .header(SESSION_HEADER, &self.session_token)
            .send();
    }
}
