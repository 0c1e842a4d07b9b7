//! Page-aligned region allocation for facility implementations

use super::RegionHandle;
use crate::{EngineError, Result};
use std::alloc::{self, Layout};
use std::ptr::NonNull;

/// Alignment of every region handed to a segment pool
pub const REGION_ALIGN: usize = 4096;

fn region_layout(len: usize) -> Result<Layout> {
    Layout::from_size_align(len.max(1), REGION_ALIGN)
        .map_err(|e| EngineError::facility_with_source(format!("invalid region size {}", len), e))
}

/// Allocate a zeroed region of `len` bytes aligned to a page
pub fn allocate_region(len: usize) -> Result<RegionHandle> {
    let layout = region_layout(len)?;
    // SAFETY: layout has a non-zero size.
    let ptr = unsafe { alloc::alloc_zeroed(layout) };
    let ptr = NonNull::new(ptr)
        .ok_or_else(|| EngineError::facility(format!("allocation of {} bytes failed", len)))?;
    // SAFETY: ptr points to `len` freshly allocated bytes released by `free_region`.
    Ok(unsafe { RegionHandle::from_raw_parts(ptr, len) })
}

/// Release a region produced by [`allocate_region`]
pub fn free_region(region: RegionHandle) {
    if let Ok(layout) = region_layout(region.len()) {
        // SAFETY: the region came from `allocate_region` with this layout.
        unsafe { alloc::dealloc(region.as_ptr(), layout) }
    }
}
