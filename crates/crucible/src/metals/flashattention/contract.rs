//! Accumulator-precision contract between the caller, the environment,
//! and the specialization registry.
//!
//! Resolution order: `CRUCIBLE_ACCUM_DTYPE` wins over the caller's
//! request, and the default is the wide accumulator. A reduced-precision
//! request against a head shape that only builds the wide path is
//! downgraded with a once-per-process warning rather than failed, since
//! the result is still correct.

use std::sync::OnceLock;

use crate::{
    error::CrucibleError,
    metals::flashattention::variants::{AccumPrecision, HeadDims, registry_row},
};

fn parse_accum_dtype(raw: &str) -> Result<AccumPrecision, CrucibleError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "f16" | "half" => Ok(AccumPrecision::F16),
        "f32" | "float" => Ok(AccumPrecision::F32),
        other => Err(CrucibleError::OperationFailed(format!(
            "{} must be 'f16' or 'f32', got '{other}'",
            crucible_env::ACCUM_DTYPE.key()
        ))),
    }
}

fn warn_downgrade_once(dims: HeadDims) {
    static WARNED: OnceLock<()> = OnceLock::new();
    WARNED.get_or_init(|| {
        tracing::warn!(
            ?dims,
            "f16 accumulation requested but not built for this head shape; using f32"
        );
    });
}

/// Resolve the accumulator precision for a launch against `dims`.
pub fn resolve_accum_precision(
    dims: HeadDims,
    requested: Option<AccumPrecision>,
) -> Result<AccumPrecision, CrucibleError> {
    let from_env = match crucible_env::ACCUM_DTYPE.get() {
        Ok(Some(raw)) => Some(parse_accum_dtype(&raw)?),
        Ok(None) => None,
        Err(err) => return Err(CrucibleError::OperationFailed(err.to_string())),
    };
    let wanted = from_env.or(requested).unwrap_or(AccumPrecision::F32);
    if matches!(wanted, AccumPrecision::F16) && !registry_row(dims).f16_accum {
        warn_downgrade_once(dims);
        return Ok(AccumPrecision::F32);
    }
    Ok(wanted)
}
