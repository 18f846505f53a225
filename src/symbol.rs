//! Definitions for symbols in the private loader.

use crate::library::PrivateModule;

/// A resolved symbol: the ELF symbol data plus a reference to the registered
/// module that defines it. A `None` symbol is the weak-zero binding.
pub struct ResolvedSymbol<'lib> {
    sym: Option<elf::symbol::Symbol>,
    pub(crate) module: &'lib PrivateModule,
}

impl<'lib> ResolvedSymbol<'lib> {
    pub(crate) fn new(sym: elf::symbol::Symbol, module: &'lib PrivateModule) -> Self {
        Self {
            sym: Some(sym),
            module,
        }
    }

    /// Returns the address of the symbol in the defining module's image:
    /// the symbol value adjusted by that module's load delta.
    pub fn reloc_value(&self) -> usize {
        match &self.sym {
            Some(sym) => self.module.laddr(sym.st_value) as usize,
            None => 0,
        }
    }

    /// Returns the raw symbol value (unadjusted).
    pub fn raw_value(&self) -> u64 {
        self.sym.as_ref().map_or(0, |v| v.st_value)
    }

    /// Returns the symbol's size.
    pub fn size(&self) -> u64 {
        self.sym.as_ref().map_or(0, |v| v.st_size)
    }

    /// The module defining this symbol.
    pub fn module(&self) -> &'lib PrivateModule {
        self.module
    }
}

bitflags::bitflags! {
    #[derive(Copy, Clone, Default)]
    /// Options for use during symbol lookup.
    pub struct LookupFlags : u32 {
        /// Don't consult the redirection table first.
        const SKIP_REDIRECT = 1;
        /// Don't consider definitions in the requesting module itself.
        const SKIP_SELF = 2;
    }
}
