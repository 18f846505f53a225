//! Management of the module registry and global loader state.

use std::{collections::HashMap, fmt::Display};

use petgraph::stable_graph::{NodeIndex, StableDiGraph};

use crate::{
    engines::LoaderEngine,
    library::PrivateModule,
    paths::SearchPaths,
    redirect::RedirectTable,
    tls::TlsInfo,
    LoaderOptions, PrivloadError, PrivloadErrorKind,
};

mod deps;
mod load;
pub(crate) mod relocate;
pub mod runtime;
mod syms;

/// Identifies a module in the registry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ModuleId(pub(crate) NodeIndex);

impl Display for ModuleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.index())
    }
}

impl ModuleId {
    #[cfg(test)]
    pub(crate) fn for_test(raw: usize) -> Self {
        Self(NodeIndex::new(raw))
    }
}

/// Addresses captured out of a privately loaded libc, used at shutdown to
/// flush its streams against the right descriptors.
#[derive(Clone, Copy, Debug, Default)]
pub struct LibcStdio {
    pub stdout: Option<usize>,
    pub stdin: Option<usize>,
    pub stderr: Option<usize>,
}

/// The private loader's state: the module registry, the search list, the
/// redirection table, and the TLS accounting. One per process, built in the
/// init prologue and driven through the lifecycle calls.
pub struct Context {
    // Implementation callbacks into the hosting runtime.
    pub(crate) engine: Box<dyn LoaderEngine + Send>,
    pub(crate) opts: LoaderOptions,

    // All modules live in this graph; edges point from a dependent to the
    // modules it needs. Load order is tracked separately since graph indices
    // say nothing about insertion order.
    pub(crate) module_deps: StableDiGraph<PrivateModule, ()>,
    load_order: Vec<ModuleId>,
    module_names: HashMap<String, ModuleId>,

    pub(crate) search_paths: SearchPaths,
    pub(crate) redirects: RedirectTable,
    pub(crate) tls: TlsInfo,
    pub(crate) runtime_module: Option<ModuleId>,
    pub(crate) libc_stdio: LibcStdio,
    pub(crate) process_init_done: bool,
}

impl Context {
    /// Construct the loader state over the given engine. No modules are
    /// registered until [`Context::init_prologue`] runs.
    pub fn new(engine: Box<dyn LoaderEngine + Send>, mut opts: LoaderOptions) -> Self {
        opts.max_static_tls_size = crate::align_up(opts.max_static_tls_size.max(1), crate::PAGE_SIZE);
        let redirects = RedirectTable::new(engine.heap_redirects());
        Self {
            engine,
            opts,
            module_deps: StableDiGraph::new(),
            load_order: Vec::new(),
            module_names: HashMap::new(),
            search_paths: SearchPaths::default(),
            redirects,
            tls: TlsInfo::new(),
            runtime_module: None,
            libc_stdio: LibcStdio::default(),
            process_init_done: false,
        }
    }

    /// Get a reference to a module back by ID.
    pub fn get_module(&self, id: ModuleId) -> Result<&PrivateModule, PrivloadError> {
        if !self.module_deps.contains_node(id.0) {
            return Err(PrivloadErrorKind::InvalidModuleId { id }.into());
        }
        Ok(&self.module_deps[id.0])
    }

    /// Get a mut reference to a module back by ID.
    pub fn get_module_mut(&mut self, id: ModuleId) -> Result<&mut PrivateModule, PrivloadError> {
        if !self.module_deps.contains_node(id.0) {
            return Err(PrivloadErrorKind::InvalidModuleId { id }.into());
        }
        Ok(&mut self.module_deps[id.0])
    }

    /// Lookup a module by its canonical base filename.
    pub fn lookup_module(&self, name: &str) -> Option<ModuleId> {
        self.module_names.get(name).copied()
    }

    /// Lookup the module whose mapped image contains `addr`.
    pub fn module_containing(&self, addr: usize) -> Option<ModuleId> {
        self.load_order
            .iter()
            .copied()
            .find(|id| self.module_deps[id.0].contains(addr))
    }

    /// Modules in load order: every module appears after its dependencies,
    /// with the runtime's own image first.
    pub fn load_order(&self) -> impl DoubleEndedIterator<Item = ModuleId> + '_ {
        self.load_order.iter().copied()
    }

    pub fn modules(&self) -> impl Iterator<Item = &PrivateModule> {
        self.load_order.iter().map(|id| &self.module_deps[id.0])
    }

    /// Insert a fully populated module. Its dependencies must already be
    /// registered; the new module lands at the end of the load order.
    pub(crate) fn insert_module(
        &mut self,
        module: PrivateModule,
        deps: &[ModuleId],
    ) -> ModuleId {
        let name = module.name.clone();
        let id = ModuleId(self.module_deps.add_node(module));
        self.module_deps[id.0].idx = Some(id);
        for dep in deps {
            self.module_deps.add_edge(id.0, dep.0, ());
        }
        self.load_order.push(id);
        self.module_names.insert(name, id);
        id
    }

    /// Drop a module from the registry. The caller is responsible for
    /// having unmapped it first.
    pub(crate) fn remove_module(&mut self, id: ModuleId) -> Option<PrivateModule> {
        let module = self.module_deps.remove_node(id.0)?;
        self.load_order.retain(|m| *m != id);
        self.module_names.remove(&module.name);
        Some(module)
    }

    /// Direct dependencies of a module, in edge order.
    pub fn dependencies(&self, id: ModuleId) -> impl Iterator<Item = ModuleId> + '_ {
        self.module_deps
            .neighbors_directed(id.0, petgraph::Direction::Outgoing)
            .map(ModuleId)
    }

    /// Pointers into a private libc's stdio, captured during relocation.
    pub fn libc_stdio(&self) -> LibcStdio {
        self.libc_stdio
    }

    /// The runtime's own pseudo-module, once the init prologue registered it.
    pub fn runtime_module(&self) -> Option<ModuleId> {
        self.runtime_module
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::engines::testing::TestEngine;

    pub(crate) fn test_context() -> Context {
        Context::new(Box::new(TestEngine::default()), LoaderOptions::default())
    }

    #[test]
    fn registry_lookup_by_name_and_address() {
        let mut ctx = test_context();
        let a = ctx.insert_module(PrivateModule::for_test("liba.so", 0x10000, 0x2000), &[]);
        let b = ctx.insert_module(PrivateModule::for_test("libb.so", 0x20000, 0x1000), &[a]);

        assert_eq!(ctx.lookup_module("liba.so"), Some(a));
        assert_eq!(ctx.lookup_module("libb.so"), Some(b));
        assert_eq!(ctx.lookup_module("libc.so"), None);

        assert_eq!(ctx.module_containing(0x10000), Some(a));
        assert_eq!(ctx.module_containing(0x11fff), Some(a));
        assert_eq!(ctx.module_containing(0x20000), Some(b));
        assert_eq!(ctx.module_containing(0x12000), None);

        assert_eq!(ctx.dependencies(b).collect::<Vec<_>>(), vec![a]);
    }

    #[test]
    fn load_order_is_preserved_and_reversible() {
        let mut ctx = test_context();
        let d = ctx.insert_module(PrivateModule::for_test("libd.so", 0x1000, 0x1000), &[]);
        let b = ctx.insert_module(PrivateModule::for_test("libb.so", 0x2000, 0x1000), &[d]);
        let c = ctx.insert_module(PrivateModule::for_test("libc2.so", 0x3000, 0x1000), &[d]);
        let a = ctx.insert_module(PrivateModule::for_test("liba.so", 0x4000, 0x1000), &[b, c]);

        let fwd: Vec<_> = ctx.load_order().collect();
        assert_eq!(fwd, vec![d, b, c, a]);
        let rev: Vec<_> = ctx.load_order().rev().collect();
        assert_eq!(rev, vec![a, c, b, d]);
    }

    #[test]
    fn removal_unregisters_everywhere() {
        let mut ctx = test_context();
        let a = ctx.insert_module(PrivateModule::for_test("liba.so", 0x10000, 0x1000), &[]);
        let removed = ctx.remove_module(a).unwrap();
        assert_eq!(removed.name, "liba.so");
        assert_eq!(ctx.lookup_module("liba.so"), None);
        assert_eq!(ctx.module_containing(0x10000), None);
        assert_eq!(ctx.load_order().count(), 0);
    }
}
