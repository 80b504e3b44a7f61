//! The control-plane seam.
//!
//! The driver borrows a connected, process-wide control-plane session and
//! only ever needs this narrow query/mutate surface from it. Query results
//! come back in platform order; classifying zero/one/many is the handle's
//! job, and nothing here ever silently picks among duplicates.

use std::fmt;

use vcdrive_core::Result;

/// A resolved reference to one live machine object, distinct from its name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineRef {
    pub id: String,
    pub name: String,
}

impl fmt::Display for MachineRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

pub trait ControlPlane: Send + Sync {
    /// Every machine with the given name, optionally scoped to a folder.
    fn find_machines(&self, name: &str, folder: Option<&str>) -> Result<Vec<MachineRef>>;

    /// Every machine located in the given folder, regardless of name.
    fn machines_in_folder(&self, folder: &str) -> Result<Vec<MachineRef>>;

    /// Every machine visible to the session.
    fn list_machines(&self) -> Result<Vec<MachineRef>>;

    /// Clone a new machine from a template, optionally into a folder.
    fn clone_from_template(
        &self,
        template: &str,
        name: &str,
        folder: Option<&str>,
    ) -> Result<MachineRef>;

    /// Delete the machine behind a reference.
    fn delete_machine(&self, machine: &MachineRef) -> Result<()>;

    /// The machine's reported address, or `None` while the guest has not
    /// published one yet.
    fn machine_ip(&self, machine: &MachineRef) -> Result<Option<String>>;
}
