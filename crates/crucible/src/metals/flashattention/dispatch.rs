//! Launch-shaping policy: grouped-query broadcast factor and the
//! occupancy-driven split-parallel degree.
//!
//! The policy is pure arithmetic over an [`OccupancyProvider`] so it can
//! be exercised on any host; environment overrides are resolved here so
//! the planner sees exactly one final answer.

use crucible_env::EnvVar;

use crate::{device::OccupancyProvider, error::CrucibleError};

/// Split degrees the kernel is launched with. Larger fan-out buys
/// nothing once the base grid already covers the device.
pub const SPLIT_DEGREES: [u32; 2] = [4, 2];

/// Threadgroups in the unsplit grid: one per query tile per head per
/// batch element.
#[must_use]
pub fn work_units(seq_len_q: u32, tile_width: u32, n_heads: u32, batch: u32) -> u32 {
    seq_len_q.div_ceil(tile_width) * n_heads * batch
}

/// Occupancy heuristic: take the largest split whose fanned-out grid
/// still undershoots twice the device capacity, otherwise leave the
/// launch whole. Small grids on wide devices split the key axis; a grid
/// that already saturates the device does not pay the combine cost.
#[must_use]
pub fn split_degree(work_units: u32, capacity: u32) -> u32 {
    if work_units == 0 {
        return 1;
    }
    for degree in SPLIT_DEGREES {
        if degree * work_units < 2 * capacity {
            return degree;
        }
    }
    1
}

/// Grouped-query broadcast factor: query heads per key/value head.
pub fn group_size(n_heads_q: u32, n_heads_kv: u32) -> Result<u32, CrucibleError> {
    if n_heads_kv == 0 || !n_heads_q.is_multiple_of(n_heads_kv) {
        return Err(CrucibleError::OperationNotSupported(format!(
            "query head count {n_heads_q} is not a multiple of key/value head count {n_heads_kv}"
        )));
    }
    Ok(n_heads_q / n_heads_kv)
}

/// Final split degree for a launch: heuristic, then environment
/// overrides, then clamped so every split owns at least one key block.
pub fn resolved_split_degree(
    work_units: u32,
    n_kv_blocks: u32,
    occupancy: &dyn OccupancyProvider,
) -> Result<u32, CrucibleError> {
    let degree = if crucible_env::is_set(EnvVar::DisableFaSplit) {
        1
    } else {
        match crucible_env::FA_SPLIT.get() {
            Ok(Some(forced)) => {
                if forced != 1 && !SPLIT_DEGREES.contains(&forced) {
                    return Err(CrucibleError::OperationFailed(format!(
                        "{} must be 1, 2 or 4, got {forced}",
                        crucible_env::FA_SPLIT.key()
                    )));
                }
                forced
            }
            Ok(None) => split_degree(work_units, occupancy.execution_units()),
            Err(err) => return Err(CrucibleError::OperationFailed(err.to_string())),
        }
    };
    Ok(degree.min(n_kv_blocks.max(1)))
}
