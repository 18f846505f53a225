//! Loader lifecycle and the process-global entry points.
//!
//! The hosting runtime drives the loader through a fixed sequence: the init
//! prologue builds the search paths and registers the runtime's own image,
//! libraries are loaded, the init epilogue lays out static TLS, and the
//! first thread to come up with a private thread pointer runs every
//! module's constructors. Initializers cannot run earlier — they may touch
//! TLS — so `call_entry` quietly defers until a thread pointer exists.
//!
//! The free functions at the bottom wrap one process-wide [`Context`]
//! behind a reentrant lock. Reentrancy matters twice over: dependency
//! loading recurses, and the foreign code run by initializers may call
//! back into the loader. State borrows are never held across calls into
//! foreign code.

use std::{cell::RefCell, ffi::c_char, path::Path, sync::OnceLock};

use parking_lot::ReentrantMutex;
use tracing::{debug, error, trace};

use super::{Context, ModuleId};
use crate::{
    engines::LoaderEngine, library::PrivateModule, paths::SearchPaths, tls, LoaderOptions,
    PrivloadError, PrivloadErrorKind,
};

/// Why a module's entry points are being invoked.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryReason {
    ProcessInit,
    ProcessExit,
}

/// A library init/fini routine. The platform loader hands every one
/// `(argc, argv, envp)`; so do we.
pub type LibFunc = extern "C" fn(libc::c_int, *mut *mut c_char, *mut *mut c_char);

extern "C" {
    static mut environ: *mut *mut c_char;
}

fn call_lib_func(func: LibFunc) {
    let mut dummy_argv = [c"dummy".as_ptr() as *mut c_char, std::ptr::null_mut()];
    unsafe { func(1, dummy_argv.as_mut_ptr(), environ) };
}

fn entry_functions(module: &PrivateModule, reason: EntryReason) -> Vec<LibFunc> {
    let (single, array) = match reason {
        EntryReason::ProcessInit => (module.dynamic.init, module.dynamic.init_array),
        EntryReason::ProcessExit => (module.dynamic.fini, module.dynamic.fini_array),
    };
    let mut funcs = Vec::new();
    if let Some(addr) = single {
        funcs.push(unsafe { core::mem::transmute::<usize, LibFunc>(addr) });
    }
    if let Some((addr, bytes)) = array {
        let slots =
            unsafe { core::slice::from_raw_parts(addr as *const usize, bytes / core::mem::size_of::<usize>()) };
        for slot in slots {
            funcs.push(unsafe { core::mem::transmute::<usize, LibFunc>(*slot) });
        }
    }
    funcs
}

impl Context {
    /// Build the search paths and register the runtime's own image as an
    /// externally loaded pseudo-module, so its exports resolve and its
    /// dependencies dedup against it.
    pub fn init_prologue(&mut self) -> Result<(), PrivloadError> {
        self.search_paths = SearchPaths::discover(self.opts.client_lib_dirs.clone());
        let image = self.engine.runtime_image();
        debug!(
            "registering runtime image {} at {:#x}",
            image.name, image.base
        );
        let module = PrivateModule::new_external(image.name, image.path, image.base, image.size)?;
        let id = self.insert_module(module, &[]);
        self.runtime_module = Some(id);
        Ok(())
    }

    /// Lay out static TLS across everything loaded so far and publish the
    /// offsets to the `__tls_get_addr` replacement.
    pub fn init_epilogue(&mut self) -> Result<(), PrivloadError> {
        let footprint = self.tls.compute_layout();
        debug!(
            "static TLS footprint {:#x} across {} modules",
            footprint,
            self.tls.num_mods()
        );
        if footprint > self.opts.max_static_tls_size {
            error!(
                "static TLS footprint {:#x} exceeds the configured block size {:#x}",
                footprint, self.opts.max_static_tls_size
            );
            return Err(PrivloadErrorKind::ResourceExhausted {
                what: "laying out static TLS".into(),
            }
            .into());
        }
        self.tls.publish(self.engine.seg_base());
        Ok(())
    }

    /// One module's entry calls for `reason`, empty for the runtime's own
    /// image: its initializers already ran under the platform loader.
    fn module_entry_calls(&self, id: ModuleId, reason: EntryReason) -> Vec<LibFunc> {
        let Ok(module) = self.get_module(id) else {
            return vec![];
        };
        if module.externally_loaded {
            return vec![];
        }
        entry_functions(module, reason)
    }

    /// Invoke one module's entry points. Returns without doing anything
    /// while no private thread pointer exists; the first thread prologue
    /// picks the deferred work up.
    pub fn call_entry(&self, id: ModuleId, reason: EntryReason) -> Result<(), PrivloadError> {
        if (self.engine.seg_base())().is_null() {
            trace!("TLS not installed yet; deferring entry invocation");
            return Ok(());
        }
        self.get_module(id)?;
        for func in self.module_entry_calls(id, reason) {
            call_lib_func(func);
        }
        Ok(())
    }

    /// The constructor calls a process-init pass must make, in registry
    /// order (dependencies first). Empty when already initialized or while
    /// TLS is not ready; otherwise marks the pass done.
    pub fn take_process_init_calls(&mut self) -> Vec<LibFunc> {
        if self.process_init_done {
            return vec![];
        }
        if (self.engine.seg_base())().is_null() {
            trace!("TLS not installed yet; deferring initializers");
            return vec![];
        }
        self.process_init_done = true;
        let mut funcs = Vec::new();
        for id in self.load_order().collect::<Vec<_>>() {
            funcs.extend(self.module_entry_calls(id, EntryReason::ProcessInit));
        }
        funcs
    }

    /// The finalizer calls for process exit, in reverse registry order
    /// (dependents first).
    pub fn take_process_exit_calls(&mut self) -> Vec<LibFunc> {
        let mut funcs = Vec::new();
        for id in self.load_order().rev().collect::<Vec<_>>() {
            funcs.extend(self.module_entry_calls(id, EntryReason::ProcessExit));
        }
        funcs
    }

    /// First-thread hook: runs every deferred initializer once TLS is up.
    pub fn thread_init_prologue(&mut self) {
        for func in self.take_process_init_calls() {
            call_lib_func(func);
        }
    }

    /// Run finalizers and drop all parsed state. Mapped images are left to
    /// die with the process, matching the platform loader.
    pub fn exit(&mut self) {
        for func in self.take_process_exit_calls() {
            call_lib_func(func);
        }
        self.release_modules();
    }

    pub(crate) fn release_modules(&mut self) {
        let ids: Vec<ModuleId> = self.load_order().collect();
        for id in ids {
            self.remove_module(id);
        }
        self.runtime_module = None;
    }

    /// Build the calling thread's private TLS block.
    pub fn tls_install(&self, app_tp: *mut u8) -> Result<*mut u8, PrivloadError> {
        self.tls
            .install(app_tp, self.opts.max_static_tls_size, self.engine.as_ref())
    }

    /// Release the calling thread's private TLS block.
    pub fn tls_uninstall(&self, tp: *mut u8) {
        tls::teardown(tp, self.opts.max_static_tls_size, self.engine.as_ref());
    }
}

static LOADER: OnceLock<ReentrantMutex<RefCell<Context>>> = OnceLock::new();

fn with_loader<R>(f: impl FnOnce(&mut Context) -> R) -> Result<R, PrivloadError> {
    let lock = LOADER
        .get()
        .ok_or(PrivloadErrorKind::NotInitialized)?;
    let guard = lock.lock();
    let mut ctx = guard.borrow_mut();
    Ok(f(&mut ctx))
}

/// Bring the process-wide loader up over `engine` and register the
/// runtime's own image. Call once, before any other entry point.
pub fn init_prologue(
    engine: Box<dyn LoaderEngine + Send>,
    opts: LoaderOptions,
) -> Result<(), PrivloadError> {
    let ctx = Context::new(engine, opts);
    if LOADER.set(ReentrantMutex::new(RefCell::new(ctx))).is_err() {
        return Err(PrivloadErrorKind::AlreadyInitialized.into());
    }
    with_loader(|ctx| ctx.init_prologue())?
}

/// Lay out static TLS once every startup library is loaded.
pub fn init_epilogue() -> Result<(), PrivloadError> {
    with_loader(|ctx| ctx.init_epilogue())?
}

/// Load a library and its dependency closure; returns the mapped bounds.
pub fn load_library(name: &str) -> Result<(usize, usize), PrivloadError> {
    with_loader(|ctx| {
        let id = ctx.load_library(name)?;
        let module = ctx.get_module(id)?;
        Ok((module.base_addr(), module.size()))
    })?
}

/// Map a library from an explicit path and fix it up; returns the bounds.
pub fn map_and_relocate(path: &Path) -> Result<(usize, usize), PrivloadError> {
    with_loader(|ctx| ctx.map_and_relocate(path))?
}

/// First-thread hook: run deferred initializers now that TLS exists.
/// Initializers execute with the loader lock held but no state borrowed,
/// so they may call back into the loader.
pub fn thread_init_prologue() -> Result<(), PrivloadError> {
    let lock = LOADER
        .get()
        .ok_or(PrivloadErrorKind::NotInitialized)?;
    let guard = lock.lock();
    let funcs = guard.borrow_mut().take_process_init_calls();
    for func in funcs {
        call_lib_func(func);
    }
    Ok(())
}

pub fn thread_init_epilogue() {}

pub fn thread_exit() {}

/// Run finalizers (reverse registry order) and release loader state.
pub fn loader_exit() -> Result<(), PrivloadError> {
    let lock = LOADER
        .get()
        .ok_or(PrivloadErrorKind::NotInitialized)?;
    let guard = lock.lock();
    let funcs = guard.borrow_mut().take_process_exit_calls();
    for func in funcs {
        call_lib_func(func);
    }
    guard.borrow_mut().release_modules();
    Ok(())
}

/// Address of `name` in the module mapped at `base`.
pub fn library_address(base: usize, name: &str) -> Result<usize, PrivloadError> {
    with_loader(|ctx| ctx.library_address(base, name))?
}

/// Bounds of the module containing `base`.
pub fn library_bounds(base: usize) -> Result<(usize, usize), PrivloadError> {
    with_loader(|ctx| {
        ctx.library_bounds(base)
            .ok_or_else(|| PrivloadErrorKind::UnknownBase { addr: base }.into())
    })?
}

/// Build the calling thread's private TLS block from the application's
/// thread pointer; the caller installs the result into the reserved
/// segment register.
pub fn tls_init(app_tp: *mut u8) -> Result<*mut u8, PrivloadError> {
    with_loader(|ctx| ctx.tls_install(app_tp))?
}

/// Release the calling thread's private TLS block.
pub fn tls_exit(tp: *mut u8) -> Result<(), PrivloadError> {
    with_loader(|ctx| ctx.tls_uninstall(tp))
}

/// The replacement address for a redirected import, if the name is listed.
pub fn redirect_sym(name: &str) -> Option<usize> {
    with_loader(|ctx| ctx.redirect_sym(name)).ok().flatten()
}

#[cfg(test)]
mod test {
    use std::ffi::c_char;

    use parking_lot::Mutex;

    use super::*;
    use crate::{engines::testing::TestEngine, library::PrivateModule, LoaderOptions};

    static CALLS: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());

    macro_rules! entry_fn {
        ($name:ident, $tag:literal) => {
            extern "C" fn $name(
                _argc: libc::c_int,
                _argv: *mut *mut c_char,
                _envp: *mut *mut c_char,
            ) {
                CALLS.lock().push($tag);
            }
        };
    }

    entry_fn!(init_d, "init:d");
    entry_fn!(init_b, "init:b");
    entry_fn!(init_c, "init:c");
    entry_fn!(init_a, "init:a");
    entry_fn!(init_a2, "init_array:a");
    entry_fn!(fini_d, "fini:d");
    entry_fn!(fini_a, "fini:a");

    // Separate log for the single-module tests so they cannot interleave
    // with the diamond pass.
    static ONE_CALLS: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());

    extern "C" fn one_init(_argc: libc::c_int, _argv: *mut *mut c_char, _envp: *mut *mut c_char) {
        ONE_CALLS.lock().push("init");
    }

    extern "C" fn one_fini(_argc: libc::c_int, _argv: *mut *mut c_char, _envp: *mut *mut c_char) {
        ONE_CALLS.lock().push("fini");
    }

    fn ready_seg_base() -> *mut u8 {
        0x1000 as *mut u8
    }

    fn ctx_with_seg_base(seg_base: crate::engines::SegBaseFn) -> Context {
        Context::new(
            Box::new(TestEngine {
                seg_base,
                ..Default::default()
            }),
            LoaderOptions::default(),
        )
    }

    fn module_with(
        name: &str,
        base: usize,
        init: Option<usize>,
        init_array: Option<&'static [usize]>,
        fini: Option<usize>,
    ) -> PrivateModule {
        let mut m = PrivateModule::for_test(name, base, 0x1000);
        m.dynamic.init = init;
        m.dynamic.init_array = init_array
            .map(|a| (a.as_ptr() as usize, a.len() * core::mem::size_of::<usize>()));
        m.dynamic.fini = fini;
        m
    }

    // The diamond: A needs B and C, both need D. Constructors must run
    // dependencies-first, destructors in the reverse.
    #[test]
    fn diamond_init_runs_dependencies_first_and_fini_reverses() {
        let mut ctx = ctx_with_seg_base(ready_seg_base);
        let init_array_a: &'static [usize] = Box::leak(Box::new([init_a2 as usize]));

        let d = ctx.insert_module(
            module_with("libd.so", 0x10000, Some(init_d as usize), None, Some(fini_d as usize)),
            &[],
        );
        let b = ctx.insert_module(
            module_with("libb.so", 0x20000, Some(init_b as usize), None, None),
            &[d],
        );
        let c = ctx.insert_module(
            module_with("libc2.so", 0x30000, Some(init_c as usize), None, None),
            &[d],
        );
        let _a = ctx.insert_module(
            module_with(
                "liba.so",
                0x40000,
                Some(init_a as usize),
                Some(init_array_a),
                Some(fini_a as usize),
            ),
            &[b, c],
        );

        CALLS.lock().clear();
        ctx.thread_init_prologue();
        // A second thread reaching the prologue must not re-run anything.
        ctx.thread_init_prologue();
        assert_eq!(
            CALLS.lock().as_slice(),
            &["init:d", "init:b", "init:c", "init:a", "init_array:a"]
        );

        CALLS.lock().clear();
        ctx.exit();
        assert_eq!(CALLS.lock().as_slice(), &["fini:a", "fini:d"]);
        assert_eq!(ctx.load_order().count(), 0);
    }

    #[test]
    fn call_entry_drives_one_module_and_honors_the_guards() {
        ONE_CALLS.lock().clear();

        // No thread pointer yet: the invocation defers benignly.
        let mut deferred = ctx_with_seg_base(|| std::ptr::null_mut());
        let id = deferred.insert_module(
            module_with("libone.so", 0x70000, Some(one_init as usize), None, Some(one_fini as usize)),
            &[],
        );
        deferred.call_entry(id, EntryReason::ProcessInit).unwrap();
        assert!(ONE_CALLS.lock().is_empty());

        // TLS up: init and fini run for exactly this module.
        let mut ctx = ctx_with_seg_base(ready_seg_base);
        let id = ctx.insert_module(
            module_with("libone.so", 0x70000, Some(one_init as usize), None, Some(one_fini as usize)),
            &[],
        );
        ctx.call_entry(id, EntryReason::ProcessInit).unwrap();
        ctx.call_entry(id, EntryReason::ProcessExit).unwrap();
        assert_eq!(ONE_CALLS.lock().as_slice(), &["init", "fini"]);

        // The runtime's own image stays suppressed.
        let mut external = module_with("librt2.so", 0x80000, Some(one_init as usize), None, None);
        external.externally_loaded = true;
        let ext = ctx.insert_module(external, &[]);
        ctx.call_entry(ext, EntryReason::ProcessInit).unwrap();
        assert_eq!(ONE_CALLS.lock().as_slice(), &["init", "fini"]);
    }

    #[test]
    fn initializers_defer_until_tls_is_ready() {
        let mut ctx = ctx_with_seg_base(|| std::ptr::null_mut());
        ctx.insert_module(
            module_with("libx.so", 0x50000, Some(init_d as usize), None, None),
            &[],
        );
        assert!(ctx.take_process_init_calls().is_empty());
        // The pass stays pending, not consumed.
        assert!(!ctx.process_init_done);
    }

    #[test]
    fn runtime_image_entries_are_suppressed() {
        let mut ctx = ctx_with_seg_base(ready_seg_base);
        let mut runtime = module_with("libruntime.so", 0x60000, Some(init_d as usize), None, None);
        runtime.externally_loaded = true;
        ctx.insert_module(runtime, &[]);
        assert!(ctx.take_process_init_calls().is_empty());
    }
}
