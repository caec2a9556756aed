//! Dispatch configuration for compute kernels.
//!
//! Pure-Rust grid/threadgroup geometry, converted to `MTLSize` only at
//! the encoder boundary so the planning layer stays platform-free.

/// Size of the compute grid (number of threadgroups).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GridSize {
    pub width: usize,
    pub height: usize,
    pub depth: usize,
}

impl GridSize {
    pub const fn new(width: usize, height: usize, depth: usize) -> Self {
        Self { width, height, depth }
    }

    /// Total threadgroups launched.
    pub const fn count(self) -> usize {
        self.width * self.height * self.depth
    }
}

/// Threads per threadgroup.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ThreadgroupSize {
    pub width: usize,
    pub height: usize,
    pub depth: usize,
}

impl ThreadgroupSize {
    pub const fn new(width: usize, height: usize, depth: usize) -> Self {
        Self { width, height, depth }
    }

    /// Create a 1D threadgroup.
    pub const fn d1(width: usize) -> Self {
        Self {
            width,
            height: 1,
            depth: 1,
        }
    }
}

/// Grid plus threadgroup geometry for one kernel launch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchConfig {
    pub grid: GridSize,
    pub group: ThreadgroupSize,
}

impl DispatchConfig {
    pub const fn new(grid: GridSize, group: ThreadgroupSize) -> Self {
        Self { grid, group }
    }
}
