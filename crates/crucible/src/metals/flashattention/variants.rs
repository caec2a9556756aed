//! Compile-time specialization matrix for the fused attention kernels.
//!
//! Each kernel instance is specialized on (head_size_k, head_size_v,
//! query-tile width, accumulator precision, soft-cap mode). The set of
//! buildable combinations is a finite, explicit table; anything outside
//! it is rejected before a launch is planned, and the whole table is
//! walked during const evaluation so a bad row cannot survive a build.

use crate::{
    error::CrucibleError,
    metals::flashattention::tiling::{kv_block_len, vkq_stride},
};

/// Supported (head_size_k, head_size_v) pairings. Symmetric dimensions
/// cover the common attention shapes; the two asymmetric entries are the
/// multi-head-latent shapes where keys carry rotary extra channels
/// (192/128) or a compressed latent (576/512).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum HeadDims {
    D64,
    D80,
    D96,
    D112,
    D128,
    D256,
    D192V128,
    D576V512,
}

impl HeadDims {
    pub const ALL: [HeadDims; 8] = [
        HeadDims::D64,
        HeadDims::D80,
        HeadDims::D96,
        HeadDims::D112,
        HeadDims::D128,
        HeadDims::D256,
        HeadDims::D192V128,
        HeadDims::D576V512,
    ];

    /// Key-side head dimension.
    #[must_use]
    pub const fn k(self) -> u32 {
        match self {
            HeadDims::D64 => 64,
            HeadDims::D80 => 80,
            HeadDims::D96 => 96,
            HeadDims::D112 => 112,
            HeadDims::D128 => 128,
            HeadDims::D256 => 256,
            HeadDims::D192V128 => 192,
            HeadDims::D576V512 => 576,
        }
    }

    /// Value-side head dimension.
    #[must_use]
    pub const fn v(self) -> u32 {
        match self {
            HeadDims::D192V128 => 128,
            HeadDims::D576V512 => 512,
            other => other.k(),
        }
    }

    /// Resolve runtime tensor shapes to a registry entry.
    pub fn from_sizes(head_size_k: u32, head_size_v: u32) -> Result<Self, CrucibleError> {
        let mut i = 0;
        while i < Self::ALL.len() {
            let dims = Self::ALL[i];
            if dims.k() == head_size_k && dims.v() == head_size_v {
                return Ok(dims);
            }
            i += 1;
        }
        Err(CrucibleError::OperationNotSupported(format!(
            "no precompiled attention kernel for head_size_k={head_size_k} head_size_v={head_size_v}"
        )))
    }
}

/// Accumulator precision for score and output accumulation.
///
/// `F32` is the wide path; `F16` is the paired-value path that halves
/// on-chip accumulator footprint at the cost of rounding inside the
/// online-softmax update.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum AccumPrecision {
    F32,
    F16,
}

impl AccumPrecision {
    pub const fn as_str(self) -> &'static str {
        match self {
            AccumPrecision::F32 => "f32",
            AccumPrecision::F16 => "f16",
        }
    }

    /// Bytes per accumulator element; the score tile is sized with this.
    #[must_use]
    pub const fn size_bytes(self) -> usize {
        match self {
            AccumPrecision::F32 => 4,
            AccumPrecision::F16 => 2,
        }
    }
}

/// Whether the logit soft-cap branch is compiled in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum SoftcapMode {
    Off,
    Capped,
}

/// One registry row: the envelope of buildable specializations for a
/// head-dimension pairing.
#[derive(Clone, Copy, Debug)]
pub struct RegistryRow {
    pub dims: HeadDims,
    pub max_tile_width: u32,
    pub f16_accum: bool,
    pub softcap: bool,
}

/// The exhaustive specialization envelope. Soft-cap models ship only
/// 128/256-wide heads, so the capped branch exists only there; the
/// reduced-precision accumulator is restricted to the symmetric shapes
/// narrow enough to keep its headroom acceptable. The 128-wide row caps
/// its tile at 32 columns: a wider tile cannot hold both the staged
/// query and the full-width score tile inside threadgroup memory.
pub const REGISTRY: [RegistryRow; 8] = [
    RegistryRow { dims: HeadDims::D64, max_tile_width: 64, f16_accum: true, softcap: false },
    RegistryRow { dims: HeadDims::D80, max_tile_width: 64, f16_accum: true, softcap: false },
    RegistryRow { dims: HeadDims::D96, max_tile_width: 64, f16_accum: true, softcap: false },
    RegistryRow { dims: HeadDims::D112, max_tile_width: 64, f16_accum: true, softcap: false },
    RegistryRow { dims: HeadDims::D128, max_tile_width: 32, f16_accum: true, softcap: true },
    RegistryRow { dims: HeadDims::D256, max_tile_width: 32, f16_accum: false, softcap: true },
    RegistryRow { dims: HeadDims::D192V128, max_tile_width: 32, f16_accum: false, softcap: false },
    RegistryRow { dims: HeadDims::D576V512, max_tile_width: 16, f16_accum: false, softcap: false },
];

pub(crate) const fn registry_row(dims: HeadDims) -> RegistryRow {
    let mut i = 0;
    while i < REGISTRY.len() {
        if REGISTRY[i].dims as u32 == dims as u32 {
            return REGISTRY[i];
        }
        i += 1;
    }
    panic!("head dims missing from registry");
}

/// Query-tile widths a kernel can be specialized on.
pub const TILE_WIDTHS: [u32; 4] = [8, 16, 32, 64];

/// Fully-specified kernel specialization.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct FlashVariant {
    pub dims: HeadDims,
    pub tile_width: u32,
    pub precision: AccumPrecision,
    pub softcap: SoftcapMode,
}

impl FlashVariant {
    /// Cooperating simdgroups per threadgroup: four query rows per
    /// simdgroup, capped at eight simdgroups.
    #[must_use]
    pub const fn simdgroups(self) -> u32 {
        let g = self.tile_width / 4;
        if g < 2 {
            2
        } else if g > 8 {
            8
        } else {
            g
        }
    }

    #[must_use]
    pub const fn threads_per_tg(self) -> u32 {
        self.simdgroups() * 32
    }

    /// Key-block length consumed per inner loop iteration.
    #[must_use]
    pub const fn kv_block(self) -> u32 {
        kv_block_len(self.dims.k())
    }

    /// Column stride splitting the value head dimension across
    /// simdgroups during weighted accumulation.
    #[must_use]
    pub const fn vkq_stride(self) -> u32 {
        vkq_stride(self.dims.v(), self.simdgroups())
    }

    /// Stable key used for the generated-source and pipeline caches.
    #[must_use]
    pub fn cache_key(self) -> String {
        let cap = match self.softcap {
            SoftcapMode::Off => "nocap",
            SoftcapMode::Capped => "cap",
        };
        format!(
            "dk{}_dv{}_c{}_{}_{}",
            self.dims.k(),
            self.dims.v(),
            self.tile_width,
            self.precision.as_str(),
            cap
        )
    }

    /// Check the specialization against the registry envelope.
    pub fn validate(self) -> Result<(), CrucibleError> {
        let row = registry_row(self.dims);
        if !TILE_WIDTHS.contains(&self.tile_width) {
            return Err(CrucibleError::OperationNotSupported(format!(
                "FlashVariant invalid tile_width {} (expected one of {TILE_WIDTHS:?})",
                self.tile_width
            )));
        }
        if self.tile_width > row.max_tile_width {
            return Err(CrucibleError::OperationNotSupported(format!(
                "FlashVariant tile_width {} exceeds {} for head dims {:?}",
                self.tile_width, row.max_tile_width, self.dims
            )));
        }
        if matches!(self.precision, AccumPrecision::F16) && !row.f16_accum {
            return Err(CrucibleError::OperationNotSupported(format!(
                "FlashVariant f16 accumulation is not built for head dims {:?}",
                self.dims
            )));
        }
        if matches!(self.softcap, SoftcapMode::Capped) && !row.softcap {
            return Err(CrucibleError::OperationNotSupported(format!(
                "FlashVariant logit soft-cap is not built for head dims {:?}",
                self.dims
            )));
        }
        Ok(())
    }

    /// Enumerate every buildable specialization.
    pub fn enumerate_supported() -> Vec<FlashVariant> {
        let mut out = Vec::new();
        for row in REGISTRY {
            for tile_width in TILE_WIDTHS {
                if tile_width > row.max_tile_width {
                    continue;
                }
                for precision in [AccumPrecision::F32, AccumPrecision::F16] {
                    if matches!(precision, AccumPrecision::F16) && !row.f16_accum {
                        continue;
                    }
                    for softcap in [SoftcapMode::Off, SoftcapMode::Capped] {
                        if matches!(softcap, SoftcapMode::Capped) && !row.softcap {
                            continue;
                        }
                        out.push(FlashVariant {
                            dims: row.dims,
                            tile_width,
                            precision,
                            softcap,
                        });
                    }
                }
            }
        }
        out
    }

    /// Pick the query-tile width for a given query length: the widest
    /// enumerated tile not wasting more than a full tile of padding.
    #[must_use]
    pub fn tile_width_for(dims: HeadDims, seq_len_q: u32) -> u32 {
        let row = registry_row(dims);
        let mut best = TILE_WIDTHS[0];
        for tile_width in TILE_WIDTHS {
            if tile_width > row.max_tile_width {
                break;
            }
            if tile_width <= seq_len_q.next_power_of_two().max(TILE_WIDTHS[0]) {
                best = tile_width;
            }
        }
        best
    }
}

// Every registry row must yield valid tiling for its widest and
// narrowest specialization; a bad row panics during const evaluation.
const _: () = {
    let mut i = 0;
    while i < REGISTRY.len() {
        let row = REGISTRY[i];
        let widest = FlashVariant {
            dims: row.dims,
            tile_width: row.max_tile_width,
            precision: AccumPrecision::F32,
            softcap: SoftcapMode::Off,
        };
        let narrowest = FlashVariant {
            dims: row.dims,
            tile_width: TILE_WIDTHS[0],
            precision: AccumPrecision::F32,
            softcap: SoftcapMode::Off,
        };
        assert!(widest.vkq_stride() >= 8);
        assert!(narrowest.vkq_stride() >= 8);
        assert!(widest.kv_block() >= 32);
        assert!(row.dims.k() % 8 == 0 && row.dims.v() % 8 == 0);
        i += 1;
    }
};
