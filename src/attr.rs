//! Attribute bitmask carried through the external interface, and the small
//! descriptor types built on top of it.
//!
//! The numeric values below are an ABI the driver depends on and must not
//! be renumbered once frozen.

use bitflags::bitflags;
use std::ptr::NonNull;

bitflags! {
    /// Per-allocation attribute flags, stored across `finals`, `struct_finals`,
    /// `no_scan`, `no_interior`, and `appendable` bitmaps in a `Pool`.
    pub struct Attr: u32 {
        const NONE         = 0;
        const FINALIZE      = 1;
        const NO_SCAN       = 2;
        const APPENDABLE    = 4;
        const NO_INTERIOR   = 8;
        const STRUCT_FINAL  = 64;
    }
}

/// Identifies a code segment for `has_finalizer_in_segment`. Opaque to this
/// crate: the runtime defines what a segment means (e.g. a loaded module or
/// dynamic library range); the core only threads the value through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment(pub usize);

/// Descriptor returned by `get_info` for an (possibly interior) pointer.
///
/// `base == None` means "not an owned allocation" (the C-side `base == null`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlkInfo {
    pub base: Option<NonNull<u8>>,
    pub size: usize,
    pub attr: Attr,
}

impl BlkInfo {
    /// The empty descriptor returned for pointers outside any owned
    /// allocation.
    pub const fn none() -> Self {
        BlkInfo { base: None, size: 0, attr: Attr::NONE }
    }

    pub fn is_none(&self) -> bool {
        self.base.is_none()
    }
}

impl Default for BlkInfo {
    fn default() -> Self {
        BlkInfo::none()
    }
}
