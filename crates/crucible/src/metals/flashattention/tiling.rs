//! Compile-time tiling arithmetic for the fused attention kernels.
//!
//! Everything here is `const fn` and gets evaluated while building the
//! variant registry, so an invalid (head_dim, simdgroups) pairing is a
//! build failure, not a runtime branch. The stride computed here is
//! used by both the accumulation stage and the output write, and the
//! two must agree exactly.

/// Edge length of one hardware simdgroup matrix tile (8x8 fragments).
pub const MMA_TILE: u32 = 8;

/// Longest key block any variant may process per inner iteration.
///
/// Shared K/V staging memory is sized against this, and every supported
/// head_size_k must not exceed it.
pub const MAX_KV_TILE: u32 = 576;

/// Power-of-two slab width splitting the value/output head dimension
/// across the cooperating simdgroups.
///
/// The width is the smallest power of two that covers `head_dim` with at
/// most one slab per simdgroup, which is equivalently the largest slab
/// count: as many busy simdgroups as possible without exceeding their
/// number. Always a multiple of [`MMA_TILE`], so slabs decompose into
/// whole 8x8 fragments; the last slab may be ragged and is bounds-checked
/// per fragment column. Invalid combinations panic, which aborts const
/// evaluation of the registry and therefore the build.
#[must_use]
pub const fn vkq_stride(head_dim: u32, simdgroups: u32) -> u32 {
    assert!(simdgroups > 0, "vkq_stride: simdgroup count must be non-zero");
    assert!(
        head_dim % MMA_TILE == 0,
        "vkq_stride: head_dim must be a multiple of the MMA tile"
    );
    assert!(
        head_dim >= simdgroups * MMA_TILE,
        "vkq_stride: not enough head columns to occupy every simdgroup"
    );
    head_dim.div_ceil(simdgroups).next_power_of_two()
}

/// Key-block length processed per inner iteration for a given key head
/// dimension. Wider heads get shorter blocks so the staged K/V tiles and
/// the score tile stay inside threadgroup memory.
#[must_use]
pub const fn kv_block_len(head_size_k: u32) -> u32 {
    assert!(head_size_k <= MAX_KV_TILE, "head_size_k exceeds the key-tile bound");
    if head_size_k <= 128 { 64 } else { 32 }
}
