use tracing::trace;

use super::{Context, ModuleId};
use crate::{
    symbol::{LookupFlags, ResolvedSymbol},
    PrivloadError, PrivloadErrorKind,
};

impl Context {
    /// Search every registered module, in load order, for a defined symbol.
    /// `requester` is excluded when `SKIP_SELF` is set (copy relocations
    /// must bind to the other definition).
    pub fn resolve_symbol(
        &self,
        name: &str,
        requester: ModuleId,
        flags: LookupFlags,
    ) -> Result<ResolvedSymbol<'_>, PrivloadError> {
        for id in self.load_order() {
            if flags.contains(LookupFlags::SKIP_SELF) && id == requester {
                continue;
            }
            let module = &self.module_deps[id.0];
            if let Some(sym) = module.lookup_symbol(name)? {
                trace!("'{}' bound to {}", name, module);
                return Ok(sym);
            }
        }
        Err(PrivloadErrorKind::UnresolvedSymbol {
            symname: name.into(),
            sourcelib: self
                .get_module(requester)
                .map(|m| m.name.as_str().into())
                .unwrap_or_default(),
        }
        .into())
    }

    /// The replacement address for a redirected import name, if any.
    pub fn redirect_sym(&self, name: &str) -> Option<usize> {
        self.redirects.lookup(name)
    }

    /// Address of `name` inside the module mapped at `base`. For the
    /// runtime's own externally loaded image the platform resolver answers
    /// instead, since the platform loader already knows that image.
    pub fn library_address(&self, base: usize, name: &str) -> Result<usize, PrivloadError> {
        let id = self
            .module_containing(base)
            .ok_or(PrivloadErrorKind::UnknownBase { addr: base })?;
        let module = self.get_module(id)?;
        if module.externally_loaded {
            let cname = std::ffi::CString::new(name).map_err(|_| {
                PrivloadError::new(PrivloadErrorKind::UnresolvedSymbol {
                    symname: name.into(),
                    sourcelib: module.name.as_str().into(),
                })
            })?;
            let addr = unsafe { libc::dlsym(libc::RTLD_DEFAULT, cname.as_ptr()) };
            return Ok(addr as usize);
        }
        module
            .lookup_symbol(name)?
            .map(|sym| sym.reloc_value())
            .ok_or_else(|| {
                PrivloadErrorKind::UnresolvedSymbol {
                    symname: name.into(),
                    sourcelib: module.name.as_str().into(),
                }
                .into()
            })
    }

    /// The mapped bounds of the module containing `base`.
    pub fn library_bounds(&self, base: usize) -> Option<(usize, usize)> {
        let id = self.module_containing(base)?;
        let module = self.module_deps.node_weight(id.0)?;
        Some((module.base_addr(), module.base_addr() + module.size()))
    }
}
