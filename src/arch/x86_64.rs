use core::ffi::c_void;

use elf::{
    abi::STB_WEAK, endian::NativeEndian, file::Class, string_table::StringTable,
    symbol::SymbolTable,
};
use tracing::{error, trace};

use crate::{
    context::{relocate::EitherRel, Context},
    library::PrivateModule,
    symbol::LookupFlags,
    PrivloadError, PrivloadErrorKind,
};

pub(crate) const ELF_CLASS: Class = Class::ELF64;
pub(crate) const ELF_CLASS_IDENT: u8 = elf::abi::ELFCLASS64;
pub(crate) const ELF_MACHINE: u16 = elf::abi::EM_X86_64;

pub use elf::abi::{
    R_X86_64_64 as REL_SYMBOLIC, R_X86_64_COPY as REL_COPY, R_X86_64_DTPMOD64 as REL_TLS_MODID,
    R_X86_64_DTPOFF64 as REL_TLS_OFFSET, R_X86_64_GLOB_DAT as REL_GOT,
    R_X86_64_IRELATIVE as REL_IRELATIVE, R_X86_64_JUMP_SLOT as REL_JUMP,
    R_X86_64_RELATIVE as REL_RELATIVE,
};

/// The leading words of the thread control block, as libc lays it out. The
/// thread pointer points here; `tcb` and `self_ptr` must point back at it.
#[repr(C)]
pub(crate) struct TcbHead {
    pub tcb: *mut c_void,
    pub dtv: *mut c_void,
    pub self_ptr: *mut c_void,
}

impl Context {
    pub(crate) fn do_reloc(
        &self,
        lib: &PrivateModule,
        rel: EitherRel,
        strings: Option<&StringTable<'_>>,
        syms: Option<&SymbolTable<'_, NativeEndian>>,
    ) -> Result<(), PrivloadError> {
        let target = lib.laddr(rel.offset()) as *mut usize;
        // A REL entry keeps its addend in place at the target.
        let addend = rel
            .addend()
            .unwrap_or_else(|| unsafe { target.read() as i64 });

        // Lookup the symbol name if the relocation references one.
        let symbol = if rel.sym() != 0 {
            let (Some(strings), Some(syms)) = (strings, syms) else {
                return Err(PrivloadErrorKind::MissingSection {
                    name: "dynamic symbol tables".into(),
                }
                .into());
            };
            let sym = syms.get(rel.sym() as usize)?;
            let name = strings.get(sym.st_name as usize)?;
            Some((name, sym))
        } else {
            None
        };
        let is_weak = symbol
            .as_ref()
            .map(|(_, sym)| sym.st_bind() == STB_WEAK)
            .unwrap_or(false);

        match rel.r_type() {
            REL_RELATIVE => unsafe {
                // B + A: rebase a link-time address to the image.
                *target = lib.laddr(addend as u64) as usize;
            },
            REL_SYMBOLIC | REL_GOT | REL_JUMP => {
                // S + A.
                let value = self.bind_import(lib, &symbol, is_weak, LookupFlags::empty())?;
                unsafe { *target = value.wrapping_add_signed(addend as isize) };
            }
            REL_COPY => {
                // The target gets the bytes of the definition from some
                // other module; redirection makes no sense here.
                let (name, sym) = symbol.as_ref().ok_or_else(missing_symbol_data)?;
                let src = self.resolve_symbol(
                    name,
                    lib.id(),
                    LookupFlags::SKIP_REDIRECT | LookupFlags::SKIP_SELF,
                )?;
                unsafe {
                    core::ptr::copy_nonoverlapping(
                        src.reloc_value() as *const u8,
                        target as *mut u8,
                        sym.st_size as usize,
                    )
                };
            }
            REL_TLS_MODID => {
                // The TLS module id of the defining module.
                let modid = match &symbol {
                    None => lib.tls_modid,
                    Some((name, _)) => {
                        match self.resolve_symbol(name, lib.id(), LookupFlags::SKIP_REDIRECT) {
                            Ok(def) => def.module().tls_modid,
                            Err(_) if is_weak => {
                                unsafe { *target = 0 };
                                return Ok(());
                            }
                            Err(e) => return Err(e),
                        }
                    }
                };
                let modid = modid.ok_or_else(|| PrivloadErrorKind::NoTlsInfo {
                    library: lib.name.as_str().into(),
                })?;
                unsafe { *target = modid };
            }
            REL_TLS_OFFSET => {
                // S + A within the module's TLS block, unadjusted; paired
                // with the module id through the `__tls_get_addr` path.
                let value = match &symbol {
                    None => 0,
                    Some((name, _)) => {
                        match self.resolve_symbol(name, lib.id(), LookupFlags::SKIP_REDIRECT) {
                            Ok(def) => def.raw_value() as usize,
                            Err(_) if is_weak => 0,
                            Err(e) => return Err(e),
                        }
                    }
                };
                unsafe { *target = value.wrapping_add_signed(addend as isize) };
            }
            REL_IRELATIVE => {
                // The word holds a resolver function; its return value is
                // the real target.
                let resolver: extern "C" fn() -> usize =
                    unsafe { core::mem::transmute(lib.laddr(addend as u64)) };
                unsafe { *target = resolver() };
            }
            other => {
                error!("{}: unsupported relocation: {}", lib, other);
                return Err(PrivloadErrorKind::UnsupportedReloc {
                    library: lib.name.as_str().into(),
                    reloc: other.to_string().as_str().into(),
                }
                .into());
            }
        }

        Ok(())
    }

    /// Bind an imported name: the redirection table first, then every
    /// registered module, then zero for weak references.
    fn bind_import(
        &self,
        lib: &PrivateModule,
        symbol: &Option<(&str, elf::symbol::Symbol)>,
        is_weak: bool,
        flags: LookupFlags,
    ) -> Result<usize, PrivloadError> {
        let Some((name, _)) = symbol else {
            return Err(missing_symbol_data());
        };
        if !flags.contains(LookupFlags::SKIP_REDIRECT) {
            if let Some(addr) = self.redirect_sym(name) {
                trace!("{}: import {} redirected", lib, name);
                return Ok(addr);
            }
        }
        match self.resolve_symbol(name, lib.id(), flags) {
            Ok(sym) => Ok(sym.reloc_value()),
            Err(_) if is_weak => Ok(0),
            Err(e) => {
                error!("{}: needed symbol {} not found", lib, name);
                Err(e)
            }
        }
    }
}

fn missing_symbol_data() -> PrivloadError {
    PrivloadErrorKind::MissingSection {
        name: "symbol data".into(),
    }
    .into()
}
