use crate::types::Dtype;

/// Error taxonomy for the attention subsystem.
///
/// Configuration problems (unsupported head-dimension combinations,
/// malformed overrides) surface as `OperationNotSupported` before any
/// kernel is touched; `MissingCapability` is the deterministic outcome
/// for a device that cannot execute the simdgroup-MMA path.
#[derive(Debug, thiserror::Error)]
pub enum CrucibleError {
    #[error("Device not found")]
    DeviceNotFound,
    #[error("Command queue creation failed")]
    CommandQueueCreationFailed,
    #[error("Command buffer creation failed")]
    CommandBufferCreationFailed,
    #[error("Compute encoder creation failed")]
    ComputeEncoderCreationFailed,
    #[error("Buffer creation failed with size {0}")]
    BufferCreationFailed(usize),
    #[error("Library compilation failed: {0}")]
    LibraryCompilationFailed(String),
    #[error("Function creation failed: {0}")]
    FunctionCreationFailed(String),
    #[error("Pipeline creation failed: {0}")]
    PipelineCreationFailed(String),
    #[error("Operation not supported: {0}")]
    OperationNotSupported(String),
    #[error("Operation failed: {0}")]
    OperationFailed(String),
    #[error("Missing device capability: {0}")]
    MissingCapability(String),
    #[error("Unsupported dtype {dtype:?} for {operation}")]
    UnsupportedDtype { operation: &'static str, dtype: Dtype },
    #[error("Input not found: {0}")]
    InputNotFound(String),
}
