//! Welcome to the private loader.
//!
//! This crate is the shared-library loader of an in-process instrumentation
//! runtime. The runtime lives inside the application it instruments, and it
//! needs its own support libraries (the client library, runtime helpers,
//! possibly a private copy of libc) loaded *without* touching the
//! application's loader state: no entries in the platform link map, no use of
//! the application's symbol scopes, no sharing of its thread-local storage,
//! and no disturbance of `errno` or the `dl*` error slots. So we parallel the
//! platform dynamic linker with our own: parse the ELF file, map its
//! segments, chase its dependencies, fix up its relocations, and run its
//! constructors — all against private state.
//!
//! # How a library gets loaded
//!
//! 1. Resolve the name to a file through an ordered search list (client
//!    directories, the working directory, `LD_LIBRARY_PATH`, a fixed set of
//!    system directories).
//! 2. Map the file once, read-only, to parse the header and program headers.
//! 3. Reserve the module's whole preferred range, then place each `PT_LOAD`
//!    inside it: map the file pages, zero the bss tail, set the final
//!    protection, and fence unused holes off as no-access.
//! 4. Walk `PT_DYNAMIC` for the string/symbol/hash tables, relocation
//!    tables, `DT_NEEDED` entries, init/fini slots, and the TLS template.
//! 5. Recursively load every `DT_NEEDED` dependency that is not already
//!    registered (deduplicated by basename).
//! 6. Insert the module into the registry and apply its relocations.
//!
//! Because dependencies finish loading before their dependents are inserted,
//! the registry ends up in dependency order: walking it forward visits a
//! module only after everything it needs. Initializers run in that order;
//! finalizers run in the reverse.
//!
//! # Symbol binding
//!
//! Relocation-time symbol lookup consults, in order: the redirection table
//! (a fixed name → replacement list that routes the allocator quartet into
//! the runtime heap and `__tls_get_addr` into our private resolver), then
//! every registered module's hash table in load order, and finally — for
//! weak references only — the zero address. The runtime's own image sits in
//! the registry as a pseudo-module: it is never remapped, relocated, or
//! initialized, but its exports participate in resolution.
//!
//! # Private TLS
//!
//! Loaded libraries may carry `PT_TLS` segments, and their code will access
//! them at negative offsets from a thread pointer. The application owns the
//! real thread pointer, so we build our own: each TLS-bearing module gets a
//! fixed negative offset assigned once all modules are loaded, and every
//! thread gets a private block whose last page is a verbatim copy of the
//! application's TCB page with the self-pointers rewritten. The runtime
//! installs the resulting thread pointer into its reserved segment register;
//! `__tls_get_addr` is redirected to resolve against this layout.
//!
//! # Timing
//!
//! The loader runs early. The runtime heap may not exist yet (a raw VM
//! backend covers that window), the private TLS is not installed until after
//! layout, and application threads are already running. Initializers are
//! therefore deferred: a guard notices the missing thread pointer and the
//! first thread to finish TLS install runs them.

// Nothing arch-specific should export directly.
pub(crate) mod arch;

mod error;
pub use error::*;

pub mod context;
pub mod engines;
pub mod library;
pub mod paths;
pub mod redirect;
pub mod symbol;
pub mod tls;

pub use context::runtime::{
    init_epilogue, init_prologue, library_address, library_bounds, load_library, loader_exit,
    map_and_relocate, redirect_sym, thread_exit, thread_init_epilogue, thread_init_prologue,
    tls_exit, tls_init,
};

pub(crate) const SMALL_VEC_SIZE: usize = 8;
pub(crate) const SMALL_STRING_SIZE: usize = 32;

pub(crate) type Vec<T, const N: usize> = tinyvec::TinyVec<[T; N]>;

pub(crate) const PAGE_SIZE: usize = 0x1000;

pub(crate) const fn align_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

pub(crate) const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Tunables the runtime decides before the loader comes up.
#[derive(Clone, Debug)]
pub struct LoaderOptions {
    /// Size of each thread's private TLS block. Rounded up to a page
    /// multiple; the static TLS footprint of all loaded modules plus the
    /// copied TCB must fit inside it.
    pub max_static_tls_size: usize,
    /// Directories searched before everything else when locating a library.
    pub client_lib_dirs: std::vec::Vec<std::path::PathBuf>,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            max_static_tls_size: PAGE_SIZE,
            client_lib_dirs: vec![],
        }
    }
}
