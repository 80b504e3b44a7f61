//! Idempotent VM lifecycle driver for a vCenter control plane.
//!
//! The [`machine::VirtualMachine`] handle resolves a named machine against
//! the live inventory and exposes find/create/destroy semantics that are
//! safe to repeat and safe to race. Once a machine is up, commands run over
//! SSH or WinRM and files move in either direction, single or whole trees.
//! [`scope::with_virtual_machines`] provisions a group with guaranteed
//! teardown, and [`folder::destroy_virtual_machines`] sweeps a folder clean.
//!
//! The control plane is reached through the narrow [`plane::ControlPlane`]
//! trait; [`vcenter::VcenterPlane`] is the production implementation.

pub mod folder;
pub mod machine;
pub mod plane;
pub mod scope;
pub mod vcenter;

// When the `test-helpers` feature is enabled, include the in-process
// control plane.
#[cfg(any(test, feature = "test-helpers"))]
pub mod mock;

// Re-export the caller-facing surface for convenience
pub use folder::{destroy_virtual_machines, SweepReport};
pub use machine::{list_virtual_machines, MachineSpec, VirtualMachine};
pub use plane::{ControlPlane, MachineRef};
pub use scope::{with_virtual_machines, TeardownFailure, TeardownReport};
pub use vcenter::VcenterPlane;
pub use vcdrive_config::{DriverConfig, TimeoutConfig, VcenterConfig};
pub use vcdrive_core::{Credentials, DriverError, Result};
pub use vcdrive_remote::CommandOutput;
