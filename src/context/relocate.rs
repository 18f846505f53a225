use elf::{
    endian::NativeEndian,
    parse::{ParseAt, ParsingIterator},
    relocation::{Rel, Rela},
    string_table::StringTable,
    symbol::SymbolTable,
};
use tracing::debug;

use super::{Context, LibcStdio, ModuleId};
use crate::{
    arch::ELF_CLASS,
    library::{PrivateModule, RelocState, RelocTable},
    PrivloadError, PrivloadErrorKind,
};

// A relocation is either a REL type or a RELA type. The only difference is
// that the RELA type carries an explicit addend; a REL entry's addend is the
// word already stored at the target.
#[derive(Debug)]
pub(crate) enum EitherRel {
    Rel(Rel),
    Rela(Rela),
}

impl EitherRel {
    pub fn r_type(&self) -> u32 {
        match self {
            EitherRel::Rel(r) => r.r_type,
            EitherRel::Rela(r) => r.r_type,
        }
    }

    pub fn addend(&self) -> Option<i64> {
        match self {
            EitherRel::Rel(_) => None,
            EitherRel::Rela(r) => Some(r.r_addend),
        }
    }

    pub fn offset(&self) -> u64 {
        match self {
            EitherRel::Rel(r) => r.r_offset,
            EitherRel::Rela(r) => r.r_offset,
        }
    }

    pub fn sym(&self) -> u32 {
        match self {
            EitherRel::Rel(r) => r.r_sym,
            EitherRel::Rela(r) => r.r_sym,
        }
    }
}

impl Context {
    pub(crate) fn get_parsing_iter<P: ParseAt>(
        &self,
        start: usize,
        ent: usize,
        sz: usize,
    ) -> Option<ParsingIterator<'_, NativeEndian, P>> {
        P::validate_entsize(ELF_CLASS, ent).ok()?;
        let iter = ParsingIterator::new(NativeEndian, ELF_CLASS, unsafe {
            core::slice::from_raw_parts(start as *const u8, sz)
        });
        Some(iter)
    }

    fn process_rel_table(
        &self,
        lib: &PrivateModule,
        table: RelocTable,
        name: &str,
        strings: Option<&StringTable<'_>>,
        syms: Option<&SymbolTable<'_, NativeEndian>>,
    ) -> Result<(), PrivloadError> {
        debug!(
            "{}: processing {} relocations (num = {})",
            lib,
            name,
            table.size / table.entsize
        );
        let section_fail = || PrivloadErrorKind::RelocationSectionFail {
            secname: name.into(),
            library: lib.name.as_str().into(),
        };
        if table.explicit_addend {
            let rels = self
                .get_parsing_iter::<Rela>(table.addr, table.entsize, table.size)
                .ok_or_else(section_fail)?;
            PrivloadError::collect(
                section_fail(),
                rels.map(|rela| self.do_reloc(lib, EitherRel::Rela(rela), strings, syms)),
            )?;
        } else {
            let rels = self
                .get_parsing_iter::<Rel>(table.addr, table.entsize, table.size)
                .ok_or_else(section_fail)?;
            PrivloadError::collect(
                section_fail(),
                rels.map(|rel| self.do_reloc(lib, EitherRel::Rel(rel), strings, syms)),
            )?;
        }
        Ok(())
    }

    fn relocate_single(&self, id: ModuleId) -> Result<(), PrivloadError> {
        let lib = self.get_module(id)?;
        debug!("{}: relocating library", lib);

        // Modules with only relative relocations carry no symbol tables;
        // the views stay optional and symbol-referencing entries fail then.
        let strings = lib.string_table().ok();
        let syms = lib.symbol_table().ok();

        if let Some(table) = lib.dynamic.rela {
            self.process_rel_table(lib, table, "RELA", strings.as_ref(), syms.as_ref())?;
        }
        if let Some(table) = lib.dynamic.rel {
            self.process_rel_table(lib, table, "REL", strings.as_ref(), syms.as_ref())?;
        }
        if let Some(table) = lib.dynamic.jmprel {
            self.process_rel_table(lib, table, "JMPREL", strings.as_ref(), syms.as_ref())?;
        }
        Ok(())
    }

    /// Apply a module's relocations. Requires every dependency to already
    /// sit in the registry. Idempotent: an already relocated module is left
    /// alone, and one that previously failed refuses to be patched twice.
    pub(crate) fn relocate_module(&mut self, id: ModuleId) -> Result<(), PrivloadError> {
        match self.get_module(id)?.reloc_state {
            RelocState::Relocated => return Ok(()),
            RelocState::PartialRelocation => {
                return Err(PrivloadErrorKind::RelocationFail {
                    library: self.get_module(id)?.name.as_str().into(),
                }
                .into())
            }
            RelocState::Unrelocated => {}
        }

        // TLS-bearing modules get their module id before any relocation can
        // reference it.
        let template = {
            let module = self.get_module(id)?;
            match (module.tls_template, module.tls_modid) {
                (Some(t), None) => Some(t),
                _ => None,
            }
        };
        if let Some(template) = template {
            let modid = self.tls.register(id, template)?;
            self.get_module_mut(id)?.tls_modid = Some(modid);
        }

        self.get_module_mut(id)?.reloc_state = RelocState::PartialRelocation;
        let res = self.relocate_single(id);
        let name = {
            let module = self.get_module_mut(id)?;
            if res.is_ok() {
                module.reloc_state = RelocState::Relocated;
            }
            module.name.clone()
        };
        res.map_err(|e| {
            PrivloadError::new_collect(
                PrivloadErrorKind::RelocationFail {
                    library: name.as_str().into(),
                },
                vec![e],
            )
        })?;

        self.capture_libc_stdio(id);
        Ok(())
    }

    /// A privately loaded libc owns stream state the runtime must flush at
    /// shutdown against the right descriptors; capture the stream pointers
    /// while the module is at hand.
    fn capture_libc_stdio(&mut self, id: ModuleId) {
        let stdio = {
            let Ok(lib) = self.get_module(id) else {
                return;
            };
            if !lib.name.starts_with("libc.so") {
                return;
            }
            let find = |name: &str| {
                lib.lookup_symbol(name)
                    .ok()
                    .flatten()
                    .map(|sym| sym.reloc_value())
            };
            LibcStdio {
                stdout: find("stdout"),
                stdin: find("stdin"),
                stderr: find("stderr"),
            }
        };
        debug!("captured private libc stdio: {:?}", stdio);
        self.libc_stdio = stdio;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        arch::{REL_GOT, REL_JUMP, REL_RELATIVE, REL_SYMBOLIC, REL_TLS_MODID, REL_TLS_OFFSET},
        context::test::test_context,
        library::PrivateModule,
    };

    const STRTAB_OFF: usize = 0x200;
    const SYMTAB_OFF: usize = 0x300;
    const HASH_OFF: usize = 0x400;
    const RELA_OFF: usize = 0x500;

    // Builds an image holding a string table, a symbol table ("malloc"
    // undefined, "answer" defined at 0x40, "weak_missing" undefined weak,
    // "stdout" defined at 0x60, "nosuch" undefined strong) and a SysV hash
    // chain covering all of them.
    fn build_image() -> Box<[u8]> {
        let mut image = vec![0u8; 0x1000].into_boxed_slice();
        let strtab = b"\0malloc\0answer\0weak_missing\0stdout\0nosuch\0";
        image[STRTAB_OFF..STRTAB_OFF + strtab.len()].copy_from_slice(strtab);

        let mut sym = |idx: usize, st_name: u32, st_info: u8, st_shndx: u16, st_value: u64,
                       st_size: u64| {
            let at = SYMTAB_OFF + idx * 24;
            image[at..at + 4].copy_from_slice(&st_name.to_ne_bytes());
            image[at + 4] = st_info;
            image[at + 6..at + 8].copy_from_slice(&st_shndx.to_ne_bytes());
            image[at + 8..at + 16].copy_from_slice(&st_value.to_ne_bytes());
            image[at + 16..at + 24].copy_from_slice(&st_size.to_ne_bytes());
        };
        sym(1, 1, 0x12, 0, 0, 0); // malloc, undefined
        sym(2, 8, 0x11, 1, 0x40, 8); // answer, defined
        sym(3, 15, 0x20, 0, 0, 0); // weak_missing, weak undefined
        sym(4, 28, 0x11, 1, 0x60, 8); // stdout, defined
        sym(5, 35, 0x12, 0, 0, 0); // nosuch, strong undefined

        // SysV hash: one bucket, chain 2 -> 1 -> 3 -> 4 -> 5.
        let words: [u32; 9] = [1, 6, 2, 0, 3, 1, 4, 5, 0];
        for (i, w) in words.iter().enumerate() {
            let at = HASH_OFF + i * 4;
            image[at..at + 4].copy_from_slice(&w.to_ne_bytes());
        }
        image
    }

    fn module_over(image: &[u8], name: &str) -> PrivateModule {
        let base = image.as_ptr() as usize;
        let mut module = PrivateModule::for_test(name, base, image.len());
        module.dynamic.strtab = Some(base + STRTAB_OFF);
        module.dynamic.symtab = Some(base + SYMTAB_OFF);
        module.dynamic.sysv_hash = Some(base + HASH_OFF);
        module
    }

    fn rela(offset: usize, sym: u32, r_type: u32, addend: i64) -> EitherRel {
        EitherRel::Rela(Rela {
            r_offset: offset as u64,
            r_sym: sym,
            r_type,
            r_addend: addend,
        })
    }

    fn word_at(image: &[u8], off: usize) -> usize {
        usize::from_ne_bytes(
            image[off..off + core::mem::size_of::<usize>()]
                .try_into()
                .unwrap(),
        )
    }

    #[test]
    fn relative_adds_the_load_delta() {
        let image = build_image();
        let mut ctx = test_context();
        let id = ctx.insert_module(module_over(&image, "libt.so"), &[]);
        let lib = ctx.get_module(id).unwrap();
        ctx.do_reloc(lib, rela(0x100, 0, REL_RELATIVE, 0x40), None, None)
            .unwrap();
        assert_eq!(word_at(&image, 0x100), image.as_ptr() as usize + 0x40);
    }

    #[test]
    fn redirected_import_binds_to_the_replacement() {
        let image = build_image();
        let mut ctx = test_context();
        let redirected_malloc = ctx.redirect_sym("malloc").unwrap();
        let id = ctx.insert_module(module_over(&image, "libt.so"), &[]);
        let lib = ctx.get_module(id).unwrap();
        let strings = lib.string_table().unwrap();
        let syms = lib.symbol_table().unwrap();
        ctx.do_reloc(
            lib,
            rela(0x108, 1, REL_GOT, 0),
            Some(&strings),
            Some(&syms),
        )
        .unwrap();
        assert_eq!(word_at(&image, 0x108), redirected_malloc);
    }

    #[test]
    fn defined_symbols_resolve_through_the_registry() {
        let image = build_image();
        let mut ctx = test_context();
        let id = ctx.insert_module(module_over(&image, "libt.so"), &[]);
        let lib = ctx.get_module(id).unwrap();
        let strings = lib.string_table().unwrap();
        let syms = lib.symbol_table().unwrap();
        let base = image.as_ptr() as usize;

        ctx.do_reloc(
            lib,
            rela(0x110, 2, REL_JUMP, 0),
            Some(&strings),
            Some(&syms),
        )
        .unwrap();
        assert_eq!(word_at(&image, 0x110), base + 0x40);

        ctx.do_reloc(
            lib,
            rela(0x118, 2, REL_SYMBOLIC, 4),
            Some(&strings),
            Some(&syms),
        )
        .unwrap();
        assert_eq!(word_at(&image, 0x118), base + 0x44);
    }

    #[test]
    fn weak_unresolved_references_bind_to_zero() {
        let image = build_image();
        let mut ctx = test_context();
        let id = ctx.insert_module(module_over(&image, "libt.so"), &[]);
        let lib = ctx.get_module(id).unwrap();
        let strings = lib.string_table().unwrap();
        let syms = lib.symbol_table().unwrap();
        // Preload the slot to prove it really gets written.
        unsafe { ((image.as_ptr() as usize + 0x120) as *mut usize).write(0x55aa) };
        ctx.do_reloc(
            lib,
            rela(0x120, 3, REL_GOT, 0),
            Some(&strings),
            Some(&syms),
        )
        .unwrap();
        assert_eq!(word_at(&image, 0x120), 0);
    }

    #[test]
    fn strong_unresolved_references_fail() {
        let image = build_image();
        let mut ctx = test_context();
        let id = ctx.insert_module(module_over(&image, "libt.so"), &[]);
        let lib = ctx.get_module(id).unwrap();
        let strings = lib.string_table().unwrap();
        let syms = lib.symbol_table().unwrap();
        let err = ctx
            .do_reloc(
                lib,
                rela(0x128, 5, REL_GOT, 0),
                Some(&strings),
                Some(&syms),
            )
            .unwrap_err();
        assert!(matches!(
            err.kind,
            PrivloadErrorKind::UnresolvedSymbol { .. }
        ));
    }

    #[test]
    fn tls_relocations_write_module_and_offset() {
        let image = build_image();
        let mut ctx = test_context();
        let id = ctx.insert_module(module_over(&image, "libt.so"), &[]);
        ctx.get_module_mut(id).unwrap().tls_modid = Some(3);
        let lib = ctx.get_module(id).unwrap();
        let strings = lib.string_table().unwrap();
        let syms = lib.symbol_table().unwrap();

        ctx.do_reloc(lib, rela(0x130, 0, REL_TLS_MODID, 0), None, None)
            .unwrap();
        assert_eq!(word_at(&image, 0x130), 3);

        ctx.do_reloc(
            lib,
            rela(0x138, 2, REL_TLS_OFFSET, 8),
            Some(&strings),
            Some(&syms),
        )
        .unwrap();
        // DTPOFF is the unadjusted offset within the module's block.
        assert_eq!(word_at(&image, 0x138), 0x48);
    }

    #[test]
    fn unsupported_relocations_are_reported() {
        let image = build_image();
        let mut ctx = test_context();
        let id = ctx.insert_module(module_over(&image, "libt.so"), &[]);
        let lib = ctx.get_module(id).unwrap();
        let err = ctx
            .do_reloc(lib, rela(0x140, 0, 0xff, 0), None, None)
            .unwrap_err();
        assert!(matches!(
            err.kind,
            PrivloadErrorKind::UnsupportedReloc { .. }
        ));
    }

    #[test]
    fn relocate_module_walks_the_rela_table_and_marks_state() {
        let mut image = build_image();
        let base = image.as_ptr() as usize;
        // Two entries: a RELATIVE and a redirected GLOB_DAT.
        let mut entry = |i: usize, r_offset: u64, r_sym: u32, r_type: u32, addend: i64| {
            let at = RELA_OFF + i * 24;
            let info = ((r_sym as u64) << 32) | r_type as u64;
            image[at..at + 8].copy_from_slice(&r_offset.to_ne_bytes());
            image[at + 8..at + 16].copy_from_slice(&info.to_ne_bytes());
            image[at + 16..at + 24].copy_from_slice(&addend.to_ne_bytes());
        };
        entry(0, 0x150, 0, REL_RELATIVE, 0x10);
        entry(1, 0x158, 1, REL_GOT, 0);

        let mut ctx = test_context();
        let mut module = module_over(&image, "libc.so.6");
        module.dynamic.rela = Some(RelocTable {
            addr: base + RELA_OFF,
            size: 48,
            entsize: 24,
            explicit_addend: true,
        });
        let id = ctx.insert_module(module, &[]);
        ctx.relocate_module(id).unwrap();

        assert_eq!(word_at(&image, 0x150), base + 0x10);
        assert_eq!(word_at(&image, 0x158), ctx.redirect_sym("malloc").unwrap());
        // A libc module also had its stream pointers captured.
        assert_eq!(ctx.libc_stdio().stdout, Some(base + 0x60));
        // Second call is a no-op.
        ctx.relocate_module(id).unwrap();
    }
}
