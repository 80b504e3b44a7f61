//! Folder-wide destruction: every machine in a folder, regardless of name.

// Standard library
use std::sync::Arc;

// External crates
use tracing::info;
use vcdrive_core::Result;

// Internal imports
use crate::machine::VirtualMachine;
use crate::plane::ControlPlane;
use crate::scope::{teardown, TeardownFailure};

/// Outcome of a folder sweep. `machines` is every handle the sweep
/// attempted; check `is_resolved()` to see which are confirmed gone.
#[derive(Debug, Default)]
pub struct SweepReport {
    pub machines: Vec<VirtualMachine>,
    pub failures: Vec<TeardownFailure>,
}

/// Destroys every machine found in the folder, best-effort, and returns the
/// attempted handles plus whatever failed. Only the folder query itself can
/// fail the call.
pub fn destroy_virtual_machines(
    plane: &Arc<dyn ControlPlane>,
    folder: &str,
) -> Result<SweepReport> {
    let found = plane.machines_in_folder(folder)?;
    info!("sweeping {} machine(s) from folder '{}'", found.len(), folder);

    let mut machines: Vec<VirtualMachine> = found
        .into_iter()
        .map(|reference| VirtualMachine::adopted(plane.clone(), Some(folder), reference))
        .collect();
    let report = teardown(&mut machines);

    Ok(SweepReport {
        machines,
        failures: report.failures,
    })
}
