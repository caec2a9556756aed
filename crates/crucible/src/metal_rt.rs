//! Thin Metal runtime: device/queue ownership, buffer allocation, a
//! pipeline cache keyed by generated-source cache key, and a blocking
//! encode-and-run helper. Compiled only on macOS; every other platform
//! plans launches but cannot execute them.

use objc2::{rc::Retained, runtime::ProtocolObject};
use objc2_foundation::NSString;
use objc2_metal::{
    MTLBuffer, MTLCommandBuffer, MTLCommandEncoder, MTLCommandQueue, MTLCompileOptions,
    MTLComputeCommandEncoder, MTLComputePipelineState, MTLCreateSystemDefaultDevice, MTLDevice,
    MTLGPUFamily, MTLLanguageVersion, MTLLibrary, MTLResourceOptions, MTLSize,
};
use rustc_hash::FxHashMap;

use crate::{
    device::{DeviceProfile, OccupancyProvider},
    error::CrucibleError,
    types::{GridSize, ThreadgroupSize},
};

#[derive(Clone, Debug)]
pub struct MetalBuffer(pub Retained<ProtocolObject<dyn MTLBuffer>>);

unsafe impl Send for MetalBuffer {}
unsafe impl Sync for MetalBuffer {}

impl std::ops::Deref for MetalBuffer {
    type Target = ProtocolObject<dyn MTLBuffer>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl MetalBuffer {
    pub fn length(&self) -> usize {
        self.0.length()
    }

    pub fn contents(&self) -> *mut std::ffi::c_void {
        self.0.contents().as_ptr()
    }

    /// Read buffer contents into a `Vec<T>`.
    /// # Safety contract
    /// T must be plain old data and the buffer must hold `count` values.
    pub fn read_to_vec<T: Clone>(&self, count: usize) -> Vec<T> {
        unsafe {
            let ptr = self.contents() as *const T;
            std::slice::from_raw_parts(ptr, count).to_vec()
        }
    }

    /// Copy a slice into the buffer.
    pub fn copy_from_slice<T: Copy>(&self, data: &[T]) {
        unsafe {
            let ptr = self.contents() as *mut T;
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr, data.len());
        }
    }
}

#[derive(Clone, Debug)]
pub struct MetalPipeline(pub Retained<ProtocolObject<dyn MTLComputePipelineState>>);

unsafe impl Send for MetalPipeline {}
unsafe impl Sync for MetalPipeline {}

/// Compute command encoder wrapper used by the launch path.
pub struct ComputeCommandEncoder(Retained<ProtocolObject<dyn MTLComputeCommandEncoder>>);

impl ComputeCommandEncoder {
    pub fn set_compute_pipeline_state(&self, pipeline: &MetalPipeline) {
        self.0.setComputePipelineState(&pipeline.0);
    }

    pub fn set_buffer(&self, index: u32, buffer: &MetalBuffer, offset: usize) {
        unsafe {
            self.0.setBuffer_offset_atIndex(Some(&*buffer.0), offset, index as usize);
        }
    }

    pub fn set_bytes<T>(&self, index: u32, data: &T) {
        let ptr = std::ptr::NonNull::from(data).cast();
        unsafe {
            self.0.setBytes_length_atIndex(ptr, std::mem::size_of::<T>(), index as usize);
        }
    }

    pub fn set_threadgroup_memory_length(&self, index: u32, length: usize) {
        self.0.setThreadgroupMemoryLength_atIndex(length, index as usize);
    }

    pub fn dispatch_threadgroups(&self, grid: GridSize, group: ThreadgroupSize) {
        let grid = MTLSize {
            width: grid.width,
            height: grid.height,
            depth: grid.depth,
        };
        let group = MTLSize {
            width: group.width,
            height: group.height,
            depth: group.depth,
        };
        self.0.dispatchThreadgroups_threadsPerThreadgroup(grid, group);
    }
}

/// Owns the device and queue and caches compiled pipelines per
/// generated-source cache key.
pub struct MetalContext {
    device: Retained<ProtocolObject<dyn MTLDevice>>,
    queue: Retained<ProtocolObject<dyn MTLCommandQueue>>,
    pipelines: FxHashMap<String, MetalPipeline>,
    profile: DeviceProfile,
}

unsafe impl Send for MetalContext {}

impl MetalContext {
    pub fn new() -> Result<Self, CrucibleError> {
        let device = MTLCreateSystemDefaultDevice().ok_or(CrucibleError::DeviceNotFound)?;
        let queue = device.newCommandQueue().ok_or(CrucibleError::CommandQueueCreationFailed)?;
        let simdgroup_mma = device.supportsFamily(MTLGPUFamily::Apple7);
        Ok(Self {
            device,
            queue,
            pipelines: FxHashMap::default(),
            profile: DeviceProfile {
                execution_units: DeviceProfile::apple_baseline().execution_units,
                simdgroup_mma,
            },
        })
    }

    pub fn new_buffer(&self, length: usize) -> Result<MetalBuffer, CrucibleError> {
        self.device
            .newBufferWithLength_options(length.max(4), MTLResourceOptions::StorageModeShared)
            .map(MetalBuffer)
            .ok_or(CrucibleError::BufferCreationFailed(length))
    }

    pub fn new_buffer_from_slice<T: Copy>(&self, data: &[T]) -> Result<MetalBuffer, CrucibleError> {
        let buffer = self.new_buffer(std::mem::size_of_val(data))?;
        buffer.copy_from_slice(data);
        Ok(buffer)
    }

    /// Compiled pipeline for `source`, cached under `key`.
    pub fn pipeline(&mut self, key: &str, source: &str, function: &str) -> Result<MetalPipeline, CrucibleError> {
        if let Some(pipeline) = self.pipelines.get(key) {
            return Ok(pipeline.clone());
        }
        let ns_source = NSString::from_str(source);
        let options = MTLCompileOptions::new();
        options.setLanguageVersion(MTLLanguageVersion::Version3_1);
        let library = self
            .device
            .newLibraryWithSource_options_error(&ns_source, Some(&options))
            .map_err(|err| CrucibleError::LibraryCompilationFailed(format!("{err:?}")))?;
        let ns_function = NSString::from_str(function);
        let metal_fn = library
            .newFunctionWithName(&ns_function)
            .ok_or_else(|| CrucibleError::FunctionCreationFailed(function.to_string()))?;
        let pipeline = self
            .device
            .newComputePipelineStateWithFunction_error(&metal_fn)
            .map(MetalPipeline)
            .map_err(|err| CrucibleError::PipelineCreationFailed(format!("{err:?}")))?;
        self.pipelines.insert(key.to_string(), pipeline.clone());
        Ok(pipeline)
    }

    /// Encode one compute pass via `binder`, commit, and wait.
    pub fn run<F>(&mut self, binder: F) -> Result<(), CrucibleError>
    where
        F: FnOnce(&ComputeCommandEncoder),
    {
        let command_buffer = self
            .queue
            .commandBuffer()
            .ok_or(CrucibleError::CommandBufferCreationFailed)?;
        let encoder = command_buffer
            .computeCommandEncoder()
            .ok_or(CrucibleError::ComputeEncoderCreationFailed)?;
        binder(&ComputeCommandEncoder(encoder.clone()));
        encoder.endEncoding();
        command_buffer.commit();
        command_buffer.waitUntilCompleted();
        Ok(())
    }
}

impl OccupancyProvider for MetalContext {
    fn execution_units(&self) -> u32 {
        self.profile.execution_units
    }

    fn supports_simdgroup_mma(&self) -> bool {
        self.profile.simdgroup_mma
    }
}
