//! The seam between the loader and the runtime hosting it.
//!
//! The loader itself never issues a syscall directly. Everything it needs
//! from the outside — virtual memory primitives, the runtime heap that backs
//! per-thread TLS blocks, the reserved segment register, the runtime's own
//! image bounds, and the replacement addresses for redirected imports — comes
//! through the [`LoaderEngine`] trait object owned by the context.

pub mod linux;
#[cfg(test)]
pub(crate) mod testing;

use std::{
    fs::File,
    io,
    path::{Path, PathBuf},
    ptr::NonNull,
};

bitflags::bitflags! {
    /// Page protection for a mapping, in OS-neutral form.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct Prot: u32 {
        const READ = 1;
        const WRITE = 2;
        const EXEC = 4;
    }
}

/// One mapping request against a [`VmPrimitives`] backend.
///
/// With `file` set this maps file pages; without it this is an anonymous
/// mapping (used for whole-range reservations). `hint` is the preferred
/// address, honored strictly only when `fixed` is set.
pub struct MapRequest<'f> {
    pub file: Option<&'f File>,
    pub size: usize,
    pub offset: u64,
    pub hint: *mut u8,
    pub prot: Prot,
    /// Writes must not reach the file.
    pub cow: bool,
    /// Part of a module image; the tracked backend records these ranges.
    pub image: bool,
    pub fixed: bool,
}

/// The virtual-memory primitives the loader consumes.
///
/// Two implementations exist per platform: a raw one that is safe to use
/// before the runtime heap is initialized, and a tracked one that also keeps
/// the runtime's address-space bookkeeping current. A region mapped through
/// one backend must be unmapped through the same backend.
pub trait VmPrimitives {
    fn open(&self, path: &Path) -> io::Result<File>;
    fn file_size(&self, file: &File) -> io::Result<u64>;
    fn map(&self, req: MapRequest<'_>) -> io::Result<NonNull<u8>>;
    fn unmap(&self, base: *mut u8, size: usize) -> io::Result<()>;
    fn protect(&self, base: *mut u8, size: usize, prot: Prot) -> io::Result<()>;
    fn file_exists(&self, path: &Path) -> bool;
    fn has_elf_so_header(&self, path: &Path) -> bool;
}

/// The runtime's own image, already mapped by the platform loader.
#[derive(Clone, Debug)]
pub struct RuntimeImage {
    pub base: usize,
    pub size: usize,
    pub name: std::string::String,
    pub path: PathBuf,
}

/// Replacement addresses for the allocator imports of loaded libraries.
/// These point into the runtime's own heap implementation.
#[derive(Clone, Copy, Debug)]
pub struct AllocatorRedirects {
    pub malloc: usize,
    pub calloc: usize,
    pub realloc: usize,
    pub free: usize,
}

/// Returns the base of the segment register the runtime reserves for its
/// private TLS on the calling thread, or null before TLS install.
pub type SegBaseFn = fn() -> *mut u8;

/// Runtime-specific implementation functions for the private loader.
pub trait LoaderEngine {
    /// Raw VM primitives, usable before the runtime heap exists.
    fn os_vm(&self) -> &dyn VmPrimitives;

    /// Tracked VM primitives; these also update the runtime's address-space
    /// bookkeeping and require the heap.
    fn tracked_vm(&self) -> &dyn VmPrimitives;

    /// Whether the runtime heap is up. Selects the backend for new work;
    /// regions already mapped keep their original backend.
    fn heap_ready(&self) -> bool;

    fn vm(&self) -> &dyn VmPrimitives {
        if self.heap_ready() {
            self.tracked_vm()
        } else {
            self.os_vm()
        }
    }

    /// Allocate a per-thread TLS block from the runtime heap. The block
    /// must come back page-aligned; the copied TCB sits on its last page.
    fn tls_block_alloc(&self, size: usize) -> Option<NonNull<u8>>;
    fn tls_block_free(&self, block: NonNull<u8>, size: usize);

    /// Accessor for the private TLS segment base of the calling thread.
    fn seg_base(&self) -> SegBaseFn;

    fn runtime_image(&self) -> RuntimeImage;

    fn heap_redirects(&self) -> AllocatorRedirects;

    /// Record a module segment in the runtime's module-area bookkeeping.
    fn add_module_area(&self, _start: usize, _end: usize) {}
    fn remove_module_area(&self, _start: usize, _end: usize) {}
}
