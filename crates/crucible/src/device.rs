//! Injectable device capability/occupancy collaborator.
//!
//! The split-degree policy needs nothing from the device beyond "how many
//! compute units can run threadgroups concurrently" and "can it execute
//! simdgroup matrix ops at all", so the dispatcher takes this trait
//! instead of a Metal handle and the policy is testable on any host.

/// Capability and occupancy view of the executing device.
pub trait OccupancyProvider {
    /// Number of parallel execution units (GPU cores) available.
    fn execution_units(&self) -> u32;

    /// Whether the device supports the simdgroup matrix-multiply path
    /// the attention kernels are built on.
    fn supports_simdgroup_mma(&self) -> bool;
}

/// Fixed device profile, used for tests and for callers that already
/// know the hardware they target.
#[derive(Clone, Copy, Debug)]
pub struct DeviceProfile {
    pub execution_units: u32,
    pub simdgroup_mma: bool,
}

impl DeviceProfile {
    /// Conservative default for Apple M-series parts when the core count
    /// is not known: 10 cores, MMA available.
    pub const fn apple_baseline() -> Self {
        Self {
            execution_units: 10,
            simdgroup_mma: true,
        }
    }
}

impl OccupancyProvider for DeviceProfile {
    fn execution_units(&self) -> u32 {
        self.execution_units
    }

    fn supports_simdgroup_mma(&self) -> bool {
        self.simdgroup_mma
    }
}
