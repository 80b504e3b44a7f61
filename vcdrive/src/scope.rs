//! Scoped group provisioning: create a set of machines, run a workload,
//! guarantee a teardown attempt for every machine on the way out.

// External crates
use tracing::warn;
use vcdrive_core::{DriverError, Result};

// Internal imports
use crate::machine::VirtualMachine;

/// One machine that could not be destroyed during teardown.
#[derive(Debug)]
pub struct TeardownFailure {
    pub name: String,
    pub error: DriverError,
}

/// Outcome of a best-effort teardown pass. Empty failures means every
/// machine is confirmed gone.
#[derive(Debug, Default)]
pub struct TeardownReport {
    pub failures: Vec<TeardownFailure>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Provisions every machine in order, runs the body, then destroys every
/// machine, always, even when provisioning or the body failed.
///
/// Teardown is best-effort: one machine failing to destroy never stops the
/// attempt on the rest, and those failures are reported alongside the body's
/// outcome rather than raised, so exit can never mask the real error.
pub fn with_virtual_machines<T, F>(
    machines: &mut [VirtualMachine],
    body: F,
) -> (Result<T>, TeardownReport)
where
    F: FnOnce(&mut [VirtualMachine]) -> Result<T>,
{
    let outcome = match provision(machines) {
        Ok(()) => body(machines),
        Err(error) => Err(error),
    };
    let report = teardown(machines);
    (outcome, report)
}

fn provision(machines: &mut [VirtualMachine]) -> Result<()> {
    for machine in machines.iter_mut() {
        machine.create()?;
    }
    Ok(())
}

/// Destroys every machine in the slice, swallowing and collecting
/// per-machine failures.
pub(crate) fn teardown(machines: &mut [VirtualMachine]) -> TeardownReport {
    let mut failures = Vec::new();
    for machine in machines.iter_mut() {
        if let Err(error) = machine.destroy() {
            warn!("teardown of '{}' failed: {}", machine.name(), error);
            failures.push(TeardownFailure {
                name: machine.name().to_string(),
                error,
            });
        }
    }
    TeardownReport { failures }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::MachineSpec;
    use crate::mock::InMemoryPlane;
    use crate::plane::ControlPlane;
    use std::sync::Arc;
    use vcdrive_config::TimeoutConfig;

    fn plane_with_fixtures() -> Arc<InMemoryPlane> {
        let plane = Arc::new(InMemoryPlane::new());
        plane.add_template("base-template");
        plane.add_folder("integration");
        plane
    }

    fn machine_on(plane: &Arc<InMemoryPlane>, name: &str) -> VirtualMachine {
        let spec = MachineSpec::new(name)
            .with_template("base-template")
            .with_folder("integration")
            .with_timeouts(TimeoutConfig {
                connect_secs: 1,
                ip_wait_secs: 0,
                ip_poll_secs: 0,
            });
        VirtualMachine::new(plane.clone() as Arc<dyn ControlPlane>, spec)
    }

    #[test]
    fn scope_tears_down_after_a_successful_body() {
        let plane = plane_with_fixtures();
        let mut machines = vec![machine_on(&plane, "a"), machine_on(&plane, "b")];

        let (outcome, report) = with_virtual_machines(&mut machines, |machines| {
            assert!(machines.iter().all(VirtualMachine::is_resolved));
            Ok(())
        });

        outcome.unwrap();
        assert!(report.is_clean());
        assert!(machines.iter().all(|m| !m.is_resolved()));
        assert_eq!(plane.machine_count(), 0);
    }

    #[test]
    fn scope_tears_down_after_a_failing_body() {
        let plane = plane_with_fixtures();
        let mut machines = vec![machine_on(&plane, "a"), machine_on(&plane, "b")];

        let (outcome, report) = with_virtual_machines(&mut machines, |_| -> Result<()> {
            Err(DriverError::Platform("workload blew up".to_string()))
        });

        assert!(outcome.is_err());
        assert!(report.is_clean());
        assert!(machines.iter().all(|m| !m.is_resolved()));
        assert_eq!(plane.machine_count(), 0);
    }

    #[test]
    fn a_failed_creation_skips_the_body_but_still_tears_down() {
        let plane = plane_with_fixtures();
        let broken = VirtualMachine::new(
            plane.clone() as Arc<dyn ControlPlane>,
            MachineSpec::new("broken").with_template("ghost-template"),
        );
        let mut machines = vec![machine_on(&plane, "a"), broken];

        let mut body_ran = false;
        let (outcome, report) = with_virtual_machines(&mut machines, |_| {
            body_ran = true;
            Ok(())
        });

        assert!(matches!(outcome, Err(DriverError::Creation { .. })));
        assert!(!body_ran);
        assert!(report.is_clean());
        // The machine that did come up was still torn down.
        assert_eq!(plane.machine_count(), 0);
    }

    #[test]
    fn teardown_failures_are_reported_not_raised() {
        let plane = plane_with_fixtures();
        let mut machines = vec![machine_on(&plane, "a"), machine_on(&plane, "b")];
        plane.fail_delete_of("a");

        let (outcome, report) = with_virtual_machines(&mut machines, |_| Ok(()));

        outcome.unwrap();
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].name, "a");
        // "b" was still attempted and destroyed.
        assert!(!machines[1].is_resolved());
        assert!(machines[0].is_resolved());
        assert_eq!(plane.machine_count(), 1);
    }
}
