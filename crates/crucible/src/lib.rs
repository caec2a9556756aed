//! Fused attention kernels for Apple-silicon GPUs: runtime-generated
//! Metal source, a compile-time specialization registry, streaming
//! softmax, grouped-query broadcast, ALiBi, logit soft-capping, and
//! occupancy-driven split-parallel dispatch.
//!
//! Planning (`metals::flashattention::compile`) is platform-free;
//! execution requires macOS and a device with simdgroup matrix support.

pub mod device;
pub mod error;
#[cfg(target_os = "macos")]
pub mod metal_rt;
pub mod metals;
pub mod types;

pub use device::{DeviceProfile, OccupancyProvider};
pub use error::CrucibleError;
pub use types::{Buffer, DispatchConfig, Dtype, GridSize, TensorArg, ThreadgroupSize};
