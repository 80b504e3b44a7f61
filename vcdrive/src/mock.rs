//! An in-process control plane for tests.
//!
//! Keeps the whole inventory behind one mutex so racing callers observe a
//! single source of truth, exactly like the real platform. Knobs cover the
//! behaviors the driver has to cope with: duplicate-name policy, delete
//! failures, and guests that take a few polls to publish an address.

// Standard library
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

// External crates
use vcdrive_core::{DriverError, Result};

// Internal imports
use crate::plane::{ControlPlane, MachineRef};

#[derive(Debug, Clone)]
struct Record {
    id: String,
    name: String,
    folder: Option<String>,
}

#[derive(Default)]
struct State {
    machines: Vec<Record>,
    templates: HashSet<String>,
    folders: HashSet<String>,
    reject_duplicate_names: bool,
    fail_delete: HashSet<String>,
    addresses: HashMap<String, String>,
    address_polls: HashMap<String, u64>,
    address_ready_after: u64,
    clone_calls: u64,
    next_id: u64,
}

pub struct InMemoryPlane {
    state: Mutex<State>,
}

impl Default for InMemoryPlane {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryPlane {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                reject_duplicate_names: true,
                ..Default::default()
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_template(&self, name: &str) {
        self.lock().templates.insert(name.to_string());
    }

    pub fn add_folder(&self, name: &str) {
        self.lock().folders.insert(name.to_string());
    }

    pub fn set_reject_duplicate_names(&self, reject: bool) {
        self.lock().reject_duplicate_names = reject;
    }

    /// Delete calls against this machine fail until cleared.
    pub fn fail_delete_of(&self, name: &str) {
        self.lock().fail_delete.insert(name.to_string());
    }

    pub fn clear_delete_failures(&self) {
        self.lock().fail_delete.clear();
    }

    /// Number of address polls a guest stays silent for.
    pub fn set_ip_ready_after(&self, polls: u64) {
        self.lock().address_ready_after = polls;
    }

    /// Drops a machine's address entirely, so polling never succeeds.
    pub fn clear_ip(&self, name: &str) {
        self.lock().addresses.remove(name);
    }

    pub fn ip_polls(&self, name: &str) -> u64 {
        self.lock().address_polls.get(name).copied().unwrap_or(0)
    }

    pub fn clone_calls(&self) -> u64 {
        self.lock().clone_calls
    }

    pub fn machine_count(&self) -> usize {
        self.lock().machines.len()
    }

    /// Places a machine into the inventory directly, bypassing the
    /// duplicate-name policy. Used to model out-of-band creators.
    pub fn seed_machine(&self, name: &str, folder: Option<&str>) -> MachineRef {
        let mut state = self.lock();
        let record = Self::insert(&mut state, name, folder);
        MachineRef {
            id: record.id,
            name: record.name,
        }
    }

    /// Removes a machine from the inventory directly, modeling an
    /// out-of-band destroyer.
    pub fn remove_by_name(&self, name: &str) {
        let mut state = self.lock();
        state.machines.retain(|record| record.name != name);
        state.addresses.remove(name);
    }

    fn insert(state: &mut State, name: &str, folder: Option<&str>) -> Record {
        state.next_id += 1;
        let record = Record {
            id: format!("vm-{}", state.next_id),
            name: name.to_string(),
            folder: folder.map(str::to_string),
        };
        state
            .addresses
            .insert(name.to_string(), format!("10.0.0.{}", state.next_id));
        state.machines.push(record.clone());
        record
    }
}

impl ControlPlane for InMemoryPlane {
    fn find_machines(&self, name: &str, folder: Option<&str>) -> Result<Vec<MachineRef>> {
        let state = self.lock();
        Ok(state
            .machines
            .iter()
            .filter(|record| record.name == name)
            .filter(|record| folder.is_none() || record.folder.as_deref() == folder)
            .map(|record| MachineRef {
                id: record.id.clone(),
                name: record.name.clone(),
            })
            .collect())
    }

    fn machines_in_folder(&self, folder: &str) -> Result<Vec<MachineRef>> {
        let state = self.lock();
        Ok(state
            .machines
            .iter()
            .filter(|record| record.folder.as_deref() == Some(folder))
            .map(|record| MachineRef {
                id: record.id.clone(),
                name: record.name.clone(),
            })
            .collect())
    }

    fn list_machines(&self) -> Result<Vec<MachineRef>> {
        let state = self.lock();
        Ok(state
            .machines
            .iter()
            .map(|record| MachineRef {
                id: record.id.clone(),
                name: record.name.clone(),
            })
            .collect())
    }

    fn clone_from_template(
        &self,
        template: &str,
        name: &str,
        folder: Option<&str>,
    ) -> Result<MachineRef> {
        let mut state = self.lock();
        if !state.templates.contains(template) {
            return Err(DriverError::Platform(format!(
                "template '{}' not found",
                template
            )));
        }
        if let Some(folder) = folder {
            if !state.folders.contains(folder) {
                return Err(DriverError::Platform(format!(
                    "folder '{}' not found",
                    folder
                )));
            }
        }
        if state.reject_duplicate_names
            && state.machines.iter().any(|record| record.name == name)
        {
            return Err(DriverError::Platform(format!(
                "machine '{}' already exists",
                name
            )));
        }
        state.clone_calls += 1;
        let record = Self::insert(&mut state, name, folder);
        Ok(MachineRef {
            id: record.id,
            name: record.name,
        })
    }

    fn delete_machine(&self, machine: &MachineRef) -> Result<()> {
        let mut state = self.lock();
        if state.fail_delete.contains(&machine.name) {
            return Err(DriverError::Platform(format!(
                "delete of '{}' refused",
                machine.name
            )));
        }
        let before = state.machines.len();
        state.machines.retain(|record| record.id != machine.id);
        if state.machines.len() == before {
            return Err(DriverError::Platform(format!(
                "no machine with id '{}'",
                machine.id
            )));
        }
        state.addresses.remove(&machine.name);
        Ok(())
    }

    fn machine_ip(&self, machine: &MachineRef) -> Result<Option<String>> {
        let mut state = self.lock();
        if !state.machines.iter().any(|record| record.id == machine.id) {
            return Err(DriverError::Platform(format!(
                "no machine with id '{}'",
                machine.id
            )));
        }
        let polls = state
            .address_polls
            .entry(machine.name.clone())
            .and_modify(|count| *count += 1)
            .or_insert(1);
        let polls = *polls;
        if polls > state.address_ready_after {
            Ok(state.addresses.get(&machine.name).cloned())
        } else {
            Ok(None)
        }
    }
}
