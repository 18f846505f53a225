//! Private thread-local storage.
//!
//! On x86 Linux, TLS is reached through a segment register: the thread
//! pointer sits at `[%seg:0x0]` and points at the TCB (libc's `struct
//! pthread`), with every module's static TLS block placed at a fixed
//! *negative* offset below it. The application owns the real thread pointer,
//! so the loader builds a parallel world for the runtime's segment register:
//! each TLS-bearing private module is assigned a negative offset once all
//! modules are loaded, and each thread gets a private block laid out to the
//! same rules.
//!
//! The block's last page is a verbatim copy of the page holding the
//! application's TCB. The private libc initializes its TCB at the end of a
//! page, so copying that page and rewriting the `tcb`/`self` self-pointers
//! hands it a structure it believes it built. Below the TCB, the first
//! `APP_LIBC_TLS_SIZE` bytes stay reserved so the application libc's own
//! static TLS accesses keep landing on copied state, and the modules'
//! blocks follow at their computed offsets.
//!
//! There is no DTV, so `__tls_get_addr` cannot be allowed to run inside the
//! private libraries; it is redirected here and answered from the offset
//! table. Dynamic TLS (modules loaded after layout) is not supported.

use std::ptr::{self, NonNull};

use parking_lot::RwLock;
use stable_vec::StableVec;
use tracing::{debug, error, trace};

use crate::{
    align_down, align_up,
    arch::TcbHead,
    context::ModuleId,
    engines::{LoaderEngine, SegBaseFn},
    library::TlsTemplate,
    PrivloadError, PrivloadErrorKind, PAGE_SIZE,
};

/// Most TLS-bearing modules one process may load. Any library with a
/// `__thread` variable counts against this.
pub const MAX_TLS_MODULES: usize = 64;

/// Bytes reserved directly below the thread pointer for the application
/// libc's static TLS.
pub(crate) const APP_LIBC_TLS_SIZE: usize = 0x100;

/// The argument `__tls_get_addr` receives.
#[repr(C)]
pub struct TlsIndex {
    pub ti_module: usize,
    pub ti_offset: usize,
}

struct TlsModule {
    id: ModuleId,
    template: TlsTemplate,
    /// Offset below the thread pointer, valid after layout.
    off: usize,
}

/// Process-wide static-TLS accounting: which modules carry TLS, their
/// assigned module ids, and — once laid out — their offsets.
pub struct TlsInfo {
    mods: StableVec<TlsModule>,
    max_align: usize,
    /// Total static footprint after layout.
    offset: usize,
}

impl Default for TlsInfo {
    fn default() -> Self {
        Self::new()
    }
}

impl TlsInfo {
    pub fn new() -> Self {
        Self {
            mods: StableVec::new(),
            max_align: 1,
            offset: 0,
        }
    }

    /// Number of registered TLS-bearing modules.
    pub fn num_mods(&self) -> usize {
        self.mods.num_elements()
    }

    /// Total static-TLS footprint after layout.
    pub fn static_footprint(&self) -> usize {
        self.offset
    }

    /// Register a module's TLS template; the returned index is its TLS
    /// module id, the value written by `DTPMOD` relocations.
    pub fn register(
        &mut self,
        id: ModuleId,
        template: TlsTemplate,
    ) -> Result<usize, PrivloadError> {
        if self.mods.num_elements() >= MAX_TLS_MODULES {
            error!("too many modules with TLS variables");
            return Err(PrivloadErrorKind::TooManyTlsMods {
                max: MAX_TLS_MODULES,
            }
            .into());
        }
        if template.align > self.max_align {
            self.max_align = template.align;
        }
        let modid = self.mods.push(TlsModule {
            id,
            template,
            off: 0,
        });
        debug!("TLS module {} registered as id {}", id, modid);
        Ok(modid)
    }

    /// Assign every registered module its offset below the thread pointer.
    ///
    /// The blocks grow downward starting past the reserved application-libc
    /// prefix. `first_byte` is the padding that keeps the template's first
    /// byte at its link-time alignment even though we address blocks from
    /// their high end.
    pub fn compute_layout(&mut self) -> usize {
        let mut offset = APP_LIBC_TLS_SIZE;
        for i in 0..self.mods.next_push_index() {
            let Some(m) = self.mods.get_mut(i) else {
                continue;
            };
            let first_byte = m.template.first_byte.wrapping_neg() & (m.template.align - 1);
            offset = first_byte
                + align_up(offset + m.template.block_size + first_byte, m.template.align);
            m.off = offset;
        }
        self.offset = offset;
        offset
    }

    pub fn offset_of(&self, modid: usize) -> Option<usize> {
        self.mods.get(modid).map(|m| m.off)
    }

    /// The registry module registered under a TLS module id.
    pub fn module_of(&self, modid: usize) -> Option<ModuleId> {
        self.mods.get(modid).map(|m| m.id)
    }

    fn offsets(&self) -> Vec<usize> {
        (0..self.mods.next_push_index())
            .filter_map(|i| self.mods.get(i).map(|m| m.off))
            .collect()
    }

    /// Publish the laid-out offsets so the redirected `__tls_get_addr` can
    /// answer without touching loader state.
    pub fn publish(&self, seg_base: SegBaseFn) {
        *RESOLVER.write() = Some(TlsResolver {
            offs: self.offsets(),
            seg_base,
        });
    }

    /// Build the private TLS block for the calling thread and return the new
    /// thread pointer. `app_tp` is the application's current thread pointer;
    /// a null one means the thread has no TLS yet and gets none from us.
    pub fn install(
        &self,
        app_tp: *mut u8,
        block_size: usize,
        engine: &dyn LoaderEngine,
    ) -> Result<*mut u8, PrivloadError> {
        if app_tp.is_null() {
            debug!("thread has no application thread pointer, skipping TLS install");
            return Ok(ptr::null_mut());
        }
        // libc builds its TCB at the end of a page-aligned allocation, so
        // the distance from the thread pointer to the end of its page is the
        // TCB size.
        let tcb_size = align_up(app_tp as usize, PAGE_SIZE) - app_tp as usize;
        if self.offset + tcb_size > block_size {
            error!(
                "static TLS footprint {:#x} + TCB {:#x} exceeds block size {:#x}",
                self.offset, tcb_size, block_size
            );
            return Err(PrivloadErrorKind::ResourceExhausted {
                what: "fitting static TLS into the per-thread block".into(),
            }
            .into());
        }
        let block = engine.tls_block_alloc(block_size).ok_or_else(|| {
            PrivloadErrorKind::ResourceExhausted {
                what: "allocating a thread TLS block".into(),
            }
        })?;
        let block = block.as_ptr();
        debug!("allocated TLS block of {:#x} at {:p}", block_size, block);
        let tp = unsafe { block.add(block_size - tcb_size) };
        debug!("thread pointer adjusted to {:p}", tp);

        unsafe {
            // Copy the whole TCB page rather than initialize one: the
            // private libraries share the application's libc state until a
            // private libc takes over, and the copied fields keep both
            // views coherent. Only the self-pointers move.
            ptr::copy_nonoverlapping(
                align_down(app_tp as usize, PAGE_SIZE) as *const u8,
                align_down(tp as usize, PAGE_SIZE) as *mut u8,
                PAGE_SIZE,
            );
            let tcb = tp.cast::<TcbHead>();
            (*tcb).tcb = tp.cast();
            (*tcb).self_ptr = tp.cast();
        }

        for i in 0..self.mods.next_push_index() {
            let Some(m) = self.mods.get(i) else { continue };
            unsafe {
                let dest = tp.sub(m.off);
                ptr::copy_nonoverlapping(
                    m.template.image as *const u8,
                    dest,
                    m.template.image_size,
                );
                // block_size is the in-memory size, image_size the on-file
                // size; the difference is the zero-initialized tail.
                ptr::write_bytes(
                    dest.add(m.template.image_size),
                    0,
                    m.template.block_size - m.template.image_size,
                );
            }
        }
        Ok(tp)
    }
}

/// Release a thread's private TLS block given its thread pointer.
pub(crate) fn teardown(tp: *mut u8, block_size: usize, engine: &dyn LoaderEngine) {
    if tp.is_null() {
        return;
    }
    let block = (align_up(tp as usize, PAGE_SIZE) - block_size) as *mut u8;
    if let Some(block) = NonNull::new(block) {
        engine.tls_block_free(block, block_size);
    }
}

struct TlsResolver {
    offs: Vec<usize>,
    seg_base: SegBaseFn,
}

static RESOLVER: RwLock<Option<TlsResolver>> = RwLock::new(None);

/// The replacement bound to `__tls_get_addr` imports of private libraries.
///
/// # Safety
/// `ti` must point to a valid TLS index pair, and the calling thread must
/// have a private TLS block installed behind the published segment base.
pub(crate) unsafe extern "C" fn tls_get_addr(ti: *const TlsIndex) -> *mut u8 {
    let ti = &*ti;
    trace!(
        "__tls_get_addr: module: {}, offset: {}",
        ti.ti_module,
        ti.ti_offset
    );
    let guard = RESOLVER.read();
    let Some(resolver) = guard.as_ref() else {
        error!("__tls_get_addr called before TLS layout");
        return ptr::null_mut();
    };
    debug_assert!(ti.ti_module < resolver.offs.len());
    let Some(off) = resolver.offs.get(ti.ti_module) else {
        error!("__tls_get_addr: module id {} out of range", ti.ti_module);
        return ptr::null_mut();
    };
    (resolver.seg_base)().sub(*off).add(ti.ti_offset)
}
