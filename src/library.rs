//! Definitions for loaded private modules.

use std::{fmt::Display, path::PathBuf};

use elf::{
    abi::{
        DT_FINI, DT_FINI_ARRAY, DT_FINI_ARRAYSZ, DT_GNU_HASH, DT_HASH, DT_INIT, DT_INIT_ARRAY,
        DT_INIT_ARRAYSZ, DT_JMPREL, DT_NEEDED, DT_NULL, DT_PLTREL, DT_PLTRELSZ, DT_REL, DT_RELA,
        DT_RELAENT, DT_RELASZ, DT_RELENT, DT_RELSZ, DT_SONAME, DT_STRTAB, DT_SYMTAB, ET_DYN,
        PT_DYNAMIC, PT_LOAD, PT_TLS, SHN_UNDEF,
    },
    dynamic::Dyn,
    endian::NativeEndian,
    hash::{GnuHashTable, SysVHashTable},
    parse::{ParseAt, ParsingIterator},
    string_table::StringTable,
    symbol::SymbolTable,
};

use crate::{
    align_down,
    arch::{ELF_CLASS, ELF_CLASS_IDENT, ELF_MACHINE},
    engines::Prot,
    symbol::ResolvedSymbol,
    HeaderError, PrivloadError, PrivloadErrorKind,
};

/// Which VM backend mapped a module. Unmapping must go through the same
/// backend the mapping came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MapBackend {
    Raw,
    Tracked,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RelocState {
    Unrelocated,
    PartialRelocation,
    Relocated,
}

/// One mapped span of a module image, page-aligned.
#[derive(Clone, Copy, Debug)]
pub struct SegmentSpan {
    pub start: usize,
    pub end: usize,
    pub prot: Prot,
}

/// The TLS template a module carries in its `PT_TLS` segment.
#[derive(Clone, Copy, Debug)]
pub struct TlsTemplate {
    /// Image address of the initialized portion.
    pub image: usize,
    /// Bytes initialized from the file.
    pub image_size: usize,
    /// Bytes the block occupies in memory (the tail past `image_size` is
    /// zero-filled per thread).
    pub block_size: usize,
    pub align: usize,
    /// Low bits of the template's link-time address, folded into the offset
    /// computation so the first byte keeps its intended alignment.
    pub first_byte: usize,
}

/// One relocation table described by the dynamic section.
#[derive(Clone, Copy, Debug)]
pub(crate) struct RelocTable {
    pub addr: usize,
    pub size: usize,
    pub entsize: usize,
    pub explicit_addend: bool,
}

/// The view of a module's dynamic section, held as image addresses.
///
/// The typed `elf` views (string table, symbol table, hash table) are
/// constructed on demand from these; nothing here borrows the image.
#[derive(Debug, Default)]
pub(crate) struct ParsedDynamic {
    pub strtab: Option<usize>,
    pub symtab: Option<usize>,
    pub gnu_hash: Option<usize>,
    pub sysv_hash: Option<usize>,
    pub rel: Option<RelocTable>,
    pub rela: Option<RelocTable>,
    pub jmprel: Option<RelocTable>,
    pub init: Option<usize>,
    pub fini: Option<usize>,
    pub init_array: Option<(usize, usize)>,
    pub fini_array: Option<(usize, usize)>,
    pub soname: Option<String>,
    pub needed: std::vec::Vec<String>,
}

/// A shared library loaded by (or, for the runtime's own image, known to)
/// the private loader.
pub struct PrivateModule {
    /// Canonical base filename, the deduplication key.
    pub name: String,
    pub path: PathBuf,
    pub(crate) idx: Option<crate::context::ModuleId>,
    base: usize,
    size: usize,
    load_delta: isize,
    /// Mapped by the platform loader, not by us: never remapped, relocated,
    /// or initialized, but its exports resolve.
    pub externally_loaded: bool,
    pub(crate) backend: MapBackend,
    pub(crate) segments: std::vec::Vec<SegmentSpan>,
    pub(crate) dynamic: ParsedDynamic,
    pub(crate) tls_template: Option<TlsTemplate>,
    pub(crate) tls_modid: Option<usize>,
    pub(crate) reloc_state: RelocState,
}

impl Display for PrivateModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{:#x}]", self.name, self.base)
    }
}

/// Validates the start of an ELF shared object: magic, the class this build
/// targets, `ET_DYN`, and the machine.
pub(crate) fn is_elf_so_header(bytes: &[u8]) -> Result<(), HeaderError> {
    if bytes.len() < 20 {
        return Err(HeaderError::Truncated);
    }
    if bytes[0..4] != [0x7f, b'E', b'L', b'F'] {
        return Err(HeaderError::BadMagic);
    }
    let class = bytes[4];
    if class != ELF_CLASS_IDENT {
        return Err(HeaderError::ClassMismatch {
            expect: ELF_CLASS,
            got: class,
        });
    }
    let e_type = u16::from_ne_bytes([bytes[16], bytes[17]]);
    if e_type != ET_DYN {
        return Err(HeaderError::ELFTypeMismatch {
            expect: ET_DYN,
            got: e_type,
        });
    }
    let e_machine = u16::from_ne_bytes([bytes[18], bytes[19]]);
    if e_machine != ELF_MACHINE {
        return Err(HeaderError::MachineMismatch {
            expect: ELF_MACHINE,
            got: e_machine,
        });
    }
    Ok(())
}

impl PrivateModule {
    /// Wrap a freshly mapped image. `segments` comes from the mapper; the
    /// dynamic section is parsed out of the live image here, so the module is
    /// fully populated before anyone can see it.
    pub(crate) fn new_mapped(
        name: String,
        path: PathBuf,
        base: usize,
        size: usize,
        load_delta: isize,
        segments: std::vec::Vec<SegmentSpan>,
        backend: MapBackend,
    ) -> Result<Self, PrivloadError> {
        let (dynamic, tls_template) = parse_image(base, size, load_delta)?;
        Ok(Self {
            name,
            path,
            idx: None,
            base,
            size,
            load_delta,
            externally_loaded: false,
            backend,
            segments,
            dynamic,
            tls_template,
            tls_modid: None,
            reloc_state: RelocState::Unrelocated,
        })
    }

    /// Wrap an image the platform loader already mapped and relocated —
    /// the runtime's own. Its segment spans and load delta are recovered
    /// from the in-memory program headers.
    pub(crate) fn new_external(
        name: String,
        path: PathBuf,
        base: usize,
        size: usize,
    ) -> Result<Self, PrivloadError> {
        if base == 0 || size < 64 {
            return Err(PrivloadErrorKind::NotElf {
                path: path.to_string_lossy().as_ref().into(),
                hdr_err: HeaderError::Truncated,
            }
            .into());
        }
        let load_delta = external_load_delta(base, size)?;
        let (dynamic, tls_template) = parse_image(base, size, load_delta)?;
        let segments = external_segments(base, size, load_delta)?;
        Ok(Self {
            name,
            path,
            idx: None,
            base,
            size,
            load_delta,
            externally_loaded: true,
            backend: MapBackend::Raw,
            segments,
            dynamic,
            tls_template,
            tls_modid: None,
            reloc_state: RelocState::Relocated,
        })
    }

    /// The module's registry ID. Only valid after insertion.
    pub fn id(&self) -> crate::context::ModuleId {
        self.idx.unwrap()
    }

    pub fn base_addr(&self) -> usize {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn load_delta(&self) -> isize {
        self.load_delta
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.base + self.size
    }

    /// Translate a link-time address from this module into its image.
    pub(crate) fn laddr(&self, vaddr: u64) -> *mut u8 {
        (vaddr as usize).wrapping_add_signed(self.load_delta) as *mut u8
    }

    /// Image bytes from `addr` to the end of the module. Table sizes are not
    /// recorded in the dynamic section, so views over these are bounded by
    /// the image instead; lookups never run past what the hash table or the
    /// terminating NUL admits.
    fn tail_slice(&self, addr: usize) -> Result<&[u8], PrivloadError> {
        let end = self.base + self.size;
        if addr < self.base || addr >= end {
            return Err(PrivloadErrorKind::MissingSection {
                name: "dynamic table address".into(),
            }
            .into());
        }
        Ok(unsafe { core::slice::from_raw_parts(addr as *const u8, end - addr) })
    }

    pub(crate) fn string_table(&self) -> Result<StringTable<'_>, PrivloadError> {
        let addr = self
            .dynamic
            .strtab
            .ok_or_else(|| PrivloadErrorKind::MissingSection {
                name: "DT_STRTAB".into(),
            })?;
        Ok(StringTable::new(self.tail_slice(addr)?))
    }

    pub(crate) fn symbol_table(&self) -> Result<SymbolTable<'_, NativeEndian>, PrivloadError> {
        let addr = self
            .dynamic
            .symtab
            .ok_or_else(|| PrivloadErrorKind::MissingSection {
                name: "DT_SYMTAB".into(),
            })?;
        Ok(SymbolTable::new(
            NativeEndian,
            ELF_CLASS,
            self.tail_slice(addr)?,
        ))
    }

    /// Find a defined symbol by name through the module's hash table.
    /// `Ok(None)` when the module simply doesn't define the name.
    pub(crate) fn lookup_symbol(&self, name: &str) -> Result<Option<ResolvedSymbol<'_>>, PrivloadError> {
        let (Some(_), Some(_)) = (self.dynamic.symtab, self.dynamic.strtab) else {
            return Ok(None);
        };
        let symtab = self.symbol_table()?;
        let strtab = self.string_table()?;
        let found = if let Some(gnu) = self.dynamic.gnu_hash {
            GnuHashTable::new(NativeEndian, ELF_CLASS, self.tail_slice(gnu)?)?
                .find(name.as_bytes(), &symtab, &strtab)?
        } else if let Some(sysv) = self.dynamic.sysv_hash {
            SysVHashTable::new(NativeEndian, ELF_CLASS, self.tail_slice(sysv)?)?
                .find(name.as_bytes(), &symtab, &strtab)?
        } else {
            None
        };
        Ok(found.and_then(|(_, sym)| {
            if sym.st_shndx == SHN_UNDEF {
                None
            } else {
                Some(ResolvedSymbol::new(sym, self))
            }
        }))
    }

    #[cfg(test)]
    pub(crate) fn for_test(name: &str, base: usize, size: usize) -> Self {
        Self {
            name: name.to_owned(),
            path: PathBuf::from(name),
            idx: None,
            base,
            size,
            load_delta: base as isize,
            externally_loaded: false,
            backend: MapBackend::Raw,
            segments: vec![],
            dynamic: ParsedDynamic::default(),
            tls_template: None,
            tls_modid: None,
            reloc_state: RelocState::Unrelocated,
        }
    }
}

fn parsing_iter<P: ParseAt>(addr: usize, len: usize) -> ParsingIterator<'static, NativeEndian, P> {
    ParsingIterator::new(NativeEndian, ELF_CLASS, unsafe {
        core::slice::from_raw_parts(addr as *const u8, len)
    })
}

/// Translate a `d_ptr` from a dynamic entry into an image address. Privately
/// loaded images hold link-time addresses (below the load base); the platform
/// loader rewrites them to absolute addresses in images it loaded, so values
/// already inside the image pass through.
fn dyn_image_addr(d_ptr: u64, base: usize, load_delta: isize) -> usize {
    let v = d_ptr as usize;
    if v < base {
        v.wrapping_add_signed(load_delta)
    } else {
        v
    }
}

/// Walk the mapped image's program headers and dynamic section into a
/// [`ParsedDynamic`] plus the TLS template, if any.
pub(crate) fn parse_image(
    base: usize,
    size: usize,
    load_delta: isize,
) -> Result<(ParsedDynamic, Option<TlsTemplate>), PrivloadError> {
    let image = unsafe { core::slice::from_raw_parts(base as *const u8, size) };
    let elf = elf::ElfBytes::<NativeEndian>::minimal_parse(image)?;
    let segments = elf
        .segments()
        .ok_or_else(|| PrivloadErrorKind::MissingSection {
            name: "program headers".into(),
        })?;

    let mut dyn_seg = None;
    let mut tls_template = None;
    for phdr in segments.iter() {
        match phdr.p_type {
            PT_DYNAMIC => dyn_seg = Some(phdr),
            PT_TLS => {
                let align = (phdr.p_align as usize).max(1);
                tls_template = Some(TlsTemplate {
                    image: (phdr.p_vaddr as usize).wrapping_add_signed(load_delta),
                    image_size: phdr.p_filesz as usize,
                    block_size: phdr.p_memsz as usize,
                    align,
                    first_byte: phdr.p_vaddr as usize & (align - 1),
                });
            }
            _ => {}
        }
    }
    let dyn_seg = dyn_seg.ok_or_else(|| PrivloadErrorKind::MissingSection {
        name: "PT_DYNAMIC".into(),
    })?;

    let dyn_addr = dyn_image_addr(dyn_seg.p_vaddr, base, load_delta);
    let mut out = ParsedDynamic::default();
    let mut rel = (None, None, None);
    let mut rela = (None, None, None);
    let mut jmprel = (None, None, None);
    let mut init_array = (None, None);
    let mut fini_array = (None, None);
    let mut soname_off = None;
    let mut needed_offs = std::vec::Vec::new();

    let addr = |d: &Dyn| dyn_image_addr(d.d_ptr(), base, load_delta);
    for d in parsing_iter::<Dyn>(dyn_addr, dyn_seg.p_memsz as usize) {
        match d.d_tag {
            DT_NULL => break,
            DT_NEEDED => needed_offs.push(d.d_val() as usize),
            DT_STRTAB => out.strtab = Some(addr(&d)),
            DT_SYMTAB => out.symtab = Some(addr(&d)),
            DT_HASH => out.sysv_hash = Some(addr(&d)),
            DT_GNU_HASH => out.gnu_hash = Some(addr(&d)),
            DT_REL => rel.0 = Some(addr(&d)),
            DT_RELSZ => rel.1 = Some(d.d_val() as usize),
            DT_RELENT => rel.2 = Some(d.d_val() as usize),
            DT_RELA => rela.0 = Some(addr(&d)),
            DT_RELASZ => rela.1 = Some(d.d_val() as usize),
            DT_RELAENT => rela.2 = Some(d.d_val() as usize),
            DT_JMPREL => jmprel.0 = Some(addr(&d)),
            DT_PLTRELSZ => jmprel.1 = Some(d.d_val() as usize),
            DT_PLTREL => jmprel.2 = Some(d.d_val() as i64),
            DT_INIT => out.init = Some(addr(&d)),
            DT_FINI => out.fini = Some(addr(&d)),
            DT_INIT_ARRAY => init_array.0 = Some(addr(&d)),
            DT_INIT_ARRAYSZ => init_array.1 = Some(d.d_val() as usize),
            DT_FINI_ARRAY => fini_array.0 = Some(addr(&d)),
            DT_FINI_ARRAYSZ => fini_array.1 = Some(d.d_val() as usize),
            DT_SONAME => soname_off = Some(d.d_val() as usize),
            _ => {}
        }
    }

    if let (Some(a), Some(sz), Some(ent)) = rel {
        out.rel = Some(RelocTable {
            addr: a,
            size: sz,
            entsize: ent,
            explicit_addend: false,
        });
    }
    if let (Some(a), Some(sz), Some(ent)) = rela {
        out.rela = Some(RelocTable {
            addr: a,
            size: sz,
            entsize: ent,
            explicit_addend: true,
        });
    }
    if let (Some(a), Some(sz), Some(kind)) = jmprel {
        // DT_PLTREL carries a relocation kind, not an entry size: two words
        // for REL, three for RELA.
        let (words, explicit_addend) = match kind {
            DT_REL => (2, false),
            DT_RELA => (3, true),
            _ => {
                return Err(PrivloadErrorKind::UnsupportedReloc {
                    library: "".into(),
                    reloc: "unknown DT_PLTREL kind".into(),
                }
                .into())
            }
        };
        out.jmprel = Some(RelocTable {
            addr: a,
            size: sz,
            entsize: words * core::mem::size_of::<usize>(),
            explicit_addend,
        });
    }
    if let (Some(a), Some(sz)) = init_array {
        out.init_array = Some((a, sz));
    }
    if let (Some(a), Some(sz)) = fini_array {
        out.fini_array = Some((a, sz));
    }

    if let Some(strtab) = out.strtab {
        let strings = StringTable::new(unsafe {
            core::slice::from_raw_parts(strtab as *const u8, (base + size).saturating_sub(strtab))
        });
        for off in needed_offs {
            let name = strings.get(off)?;
            out.needed.push(name.to_owned());
        }
        if let Some(off) = soname_off {
            out.soname = Some(strings.get(off)?.to_owned());
        }
    } else if !needed_offs.is_empty() {
        return Err(PrivloadErrorKind::MissingSection {
            name: "DT_STRTAB".into(),
        }
        .into());
    }

    Ok((out, tls_template))
}

/// Load delta of an image the platform loader placed: actual base minus the
/// smallest page-aligned `PT_LOAD` address.
fn external_load_delta(base: usize, size: usize) -> Result<isize, PrivloadError> {
    let image = unsafe { core::slice::from_raw_parts(base as *const u8, size) };
    let elf = elf::ElfBytes::<NativeEndian>::minimal_parse(image)?;
    let min_vaddr = elf
        .segments()
        .ok_or_else(|| PrivloadErrorKind::MissingSection {
            name: "program headers".into(),
        })?
        .iter()
        .filter(|p| p.p_type == PT_LOAD)
        .map(|p| align_down(p.p_vaddr as usize, crate::PAGE_SIZE))
        .min()
        .ok_or_else(|| PrivloadErrorKind::MissingSection {
            name: "PT_LOAD".into(),
        })?;
    Ok(base as isize - min_vaddr as isize)
}

fn external_segments(
    base: usize,
    size: usize,
    load_delta: isize,
) -> Result<std::vec::Vec<SegmentSpan>, PrivloadError> {
    let image = unsafe { core::slice::from_raw_parts(base as *const u8, size) };
    let elf = elf::ElfBytes::<NativeEndian>::minimal_parse(image)?;
    let mut spans = std::vec::Vec::new();
    for phdr in elf
        .segments()
        .ok_or_else(|| PrivloadErrorKind::MissingSection {
            name: "program headers".into(),
        })?
        .iter()
        .filter(|p| p.p_type == PT_LOAD)
    {
        let start =
            align_down(phdr.p_vaddr as usize, crate::PAGE_SIZE).wrapping_add_signed(load_delta);
        let end = crate::align_up((phdr.p_vaddr + phdr.p_memsz) as usize, crate::PAGE_SIZE)
            .wrapping_add_signed(load_delta);
        spans.push(SegmentSpan {
            start,
            end,
            prot: prot_from_phdr(phdr.p_flags),
        });
    }
    Ok(spans)
}

pub(crate) fn prot_from_phdr(p_flags: u32) -> Prot {
    let mut prot = Prot::empty();
    if p_flags & elf::abi::PF_R != 0 {
        prot |= Prot::READ;
    }
    if p_flags & elf::abi::PF_W != 0 {
        prot |= Prot::WRITE;
    }
    if p_flags & elf::abi::PF_X != 0 {
        prot |= Prot::EXEC;
    }
    prot
}
