//! Mapping library files and driving the load pipeline.

use std::{
    path::{Path, PathBuf},
    ptr,
};

use elf::{abi::PT_LOAD, endian::NativeEndian};
use humansize::{format_size, BINARY};
use tracing::{debug, trace, warn};

use super::{Context, ModuleId};
use crate::{
    align_down, align_up,
    engines::{MapRequest, Prot, VmPrimitives},
    library::{self, MapBackend, PrivateModule, SegmentSpan},
    PrivloadError, PrivloadErrorKind, PAGE_SIZE,
};

/// A mapped-but-not-yet-registered library image.
#[derive(Debug)]
pub(crate) struct MappedImage {
    pub base: usize,
    pub size: usize,
    pub load_delta: isize,
    pub segments: Vec<SegmentSpan>,
    pub backend: MapBackend,
}

impl Context {
    /// Load a library by name: resolve it across the search paths, map it,
    /// load its dependency closure, and relocate it. Returns the existing
    /// entry if a module with the same basename is already registered.
    pub fn load_library(&mut self, name: &str) -> Result<ModuleId, PrivloadError> {
        if let Some(id) = self.lookup_module(name) {
            trace!("{}: already loaded", name);
            return Ok(id);
        }
        let path = self.search_paths.locate(name, self.engine.vm())?;
        self.load_from(name, path)
    }

    /// Load a library from an explicit path, bypassing the search list.
    /// The basename still deduplicates.
    pub fn load_library_from(&mut self, path: &Path) -> Result<ModuleId, PrivloadError> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| PrivloadErrorKind::NotFound {
                name: path.to_string_lossy().as_ref().into(),
            })?
            .to_owned();
        if let Some(id) = self.lookup_module(&name) {
            trace!("{}: already loaded", name);
            return Ok(id);
        }
        self.load_from(&name, path.to_owned())
    }

    fn load_from(&mut self, name: &str, path: PathBuf) -> Result<ModuleId, PrivloadError> {
        debug!("loading {} from {}", name, path.display());
        let wrap = |e: PrivloadError| {
            PrivloadError::new_collect(
                PrivloadErrorKind::LibraryLoadFail {
                    library: name.into(),
                },
                vec![e],
            )
        };

        let mapped = self.map_image(&path, name).map_err(wrap)?;
        let module = match PrivateModule::new_mapped(
            name.to_owned(),
            path,
            mapped.base,
            mapped.size,
            mapped.load_delta,
            mapped.segments,
            mapped.backend,
        ) {
            Ok(module) => module,
            Err(e) => {
                self.unmap_range(mapped.base, mapped.size, mapped.backend);
                return Err(wrap(e));
            }
        };

        trace!(
            "{}: soname {:?}, {} dependencies",
            name,
            module.dynamic.soname,
            module.dynamic.needed.len()
        );

        // The dependency closure completes before this module becomes
        // visible, so the registry stays in dependency order and relocation
        // can resolve against every needed module.
        let needed = module.dynamic.needed.clone();
        let deps = match self.load_dependencies(&needed, name) {
            Ok(deps) => deps,
            Err(e) => {
                self.unmap_image(&module);
                return Err(wrap(e));
            }
        };

        let id = self.insert_module(module, &deps);
        if let Err(e) = self.relocate_module(id) {
            let _ = self.unload_module(id);
            return Err(wrap(e));
        }
        self.add_areas(id);
        Ok(id)
    }

    /// Map a library image and fix it up, returning the mapped bounds.
    ///
    /// The name mirrors what the operation means to callers; fixing up a
    /// module requires its dependency closure in the registry, so this
    /// drives the same pipeline as [`Context::load_library_from`] and
    /// reports where the image landed.
    pub fn map_and_relocate(&mut self, path: &Path) -> Result<(usize, usize), PrivloadError> {
        let id = self.load_library_from(path)?;
        let module = self.get_module(id)?;
        Ok((module.base_addr(), module.size()))
    }

    /// Load the dependencies of an already registered module and relocate
    /// it. Used for modules inserted out of band (the runtime's own image);
    /// ordinary loads run this pipeline internally.
    pub fn process_imports(&mut self, id: ModuleId) -> Result<(), PrivloadError> {
        let (needed, name, external) = {
            let module = self.get_module(id)?;
            (
                module.dynamic.needed.clone(),
                module.name.clone(),
                module.externally_loaded,
            )
        };
        let deps = self.load_dependencies(&needed, &name)?;
        for dep in deps {
            self.module_deps.add_edge(id.0, dep.0, ());
        }
        if !external {
            self.relocate_module(id)?;
        }
        Ok(())
    }

    /// Map a shared object per its program headers: reserve the whole
    /// preferred range, then place each `PT_LOAD` inside it.
    pub(crate) fn map_image(
        &self,
        path: &Path,
        name: &str,
    ) -> Result<MappedImage, PrivloadError> {
        let (vm, backend) = if self.engine.heap_ready() {
            (self.engine.tracked_vm(), MapBackend::Tracked)
        } else {
            (self.engine.os_vm(), MapBackend::Raw)
        };
        let map_failed = |reason: String| -> PrivloadError {
            PrivloadErrorKind::MapFailed {
                library: name.into(),
                reason: reason.as_str().into(),
            }
            .into()
        };

        let file = vm.open(path).map_err(|e| map_failed(e.to_string()))?;
        let file_size = vm
            .file_size(&file)
            .map_err(|e| map_failed(e.to_string()))? as usize;

        // Map the whole file once, read-only, for parsing.
        let file_map = vm
            .map(MapRequest {
                file: Some(&file),
                size: file_size,
                offset: 0,
                hint: ptr::null_mut(),
                prot: Prot::READ,
                cow: true,
                image: false,
                fixed: false,
            })
            .map_err(|e| map_failed(e.to_string()))?;

        let res = place_image(vm, &file, file_map.as_ptr(), file_size, path, name);
        if let Err(e) = vm.unmap(file_map.as_ptr(), file_size) {
            warn!("{}: failed to drop parse mapping: {}", name, e);
        }
        res.map(|(base, size, load_delta, segments)| MappedImage {
            base,
            size,
            load_delta,
            segments,
            backend,
        })
    }

    /// Unmap a module's reserved range through the backend that mapped it.
    pub(crate) fn unmap_image(&self, module: &PrivateModule) {
        if module.externally_loaded {
            return;
        }
        self.unmap_range(module.base_addr(), module.size(), module.backend);
    }

    fn unmap_range(&self, base: usize, size: usize, backend: MapBackend) {
        let vm: &dyn VmPrimitives = match backend {
            MapBackend::Raw => self.engine.os_vm(),
            MapBackend::Tracked => self.engine.tracked_vm(),
        };
        if let Err(e) = vm.unmap(base as *mut u8, size) {
            warn!("failed to unmap image at {:#x}: {}", base, e);
        }
    }

    /// Record the module's segments in the runtime's area bookkeeping.
    pub fn add_areas(&self, id: ModuleId) {
        if let Ok(module) = self.get_module(id) {
            for span in &module.segments {
                self.engine.add_module_area(span.start, span.end);
            }
        }
    }

    pub fn remove_areas(&self, id: ModuleId) {
        if let Ok(module) = self.get_module(id) {
            for span in &module.segments {
                self.engine.remove_module_area(span.start, span.end);
            }
        }
    }

    /// Tear a module down: drop its areas and registry entry, then unmap it.
    pub fn unload_module(&mut self, id: ModuleId) -> Result<(), PrivloadError> {
        self.remove_areas(id);
        let module = self
            .remove_module(id)
            .ok_or(PrivloadErrorKind::InvalidModuleId { id })?;
        self.unmap_image(&module);
        Ok(())
    }

    /// Dependencies of an unloaded module stay resident; nothing reference
    /// counts them.
    pub fn unload_imports(&mut self, _id: ModuleId) -> bool {
        true
    }
}

fn place_image(
    vm: &dyn VmPrimitives,
    file: &std::fs::File,
    file_map: *mut u8,
    file_size: usize,
    path: &Path,
    name: &str,
) -> Result<(usize, usize, isize, Vec<SegmentSpan>), PrivloadError> {
    let map_failed = |reason: String| -> PrivloadError {
        PrivloadErrorKind::MapFailed {
            library: name.into(),
            reason: reason.as_str().into(),
        }
        .into()
    };
    let bytes = unsafe { core::slice::from_raw_parts(file_map, file_size) };
    library::is_elf_so_header(bytes).map_err(|hdr_err| PrivloadErrorKind::NotElf {
        path: path.to_string_lossy().as_ref().into(),
        hdr_err,
    })?;
    let elf = elf::ElfBytes::<NativeEndian>::minimal_parse(bytes)?;
    let phdrs = elf
        .segments()
        .ok_or_else(|| PrivloadErrorKind::MissingSection {
            name: "program headers".into(),
        })?;

    // The preferred range: minimum page-aligned vaddr to maximum page-aligned
    // vaddr + memsz across the load segments.
    let mut map_min = usize::MAX;
    let mut map_max = 0usize;
    for phdr in phdrs.iter().filter(|p| p.p_type == PT_LOAD) {
        map_min = map_min.min(align_down(phdr.p_vaddr as usize, PAGE_SIZE));
        map_max = map_max.max(align_up((phdr.p_vaddr + phdr.p_memsz) as usize, PAGE_SIZE));
    }
    if map_min == usize::MAX {
        return Err(PrivloadErrorKind::MissingSection {
            name: "PT_LOAD".into(),
        }
        .into());
    }
    let map_size = map_max - map_min;

    // Reserve the whole range, non-fixed; the segments are carved out of it.
    let lib_base = vm
        .map(MapRequest {
            file: None,
            size: map_size,
            offset: 0,
            hint: map_min as *mut u8,
            prot: Prot::READ | Prot::WRITE,
            cow: true,
            image: true,
            fixed: false,
        })
        .map_err(|e| map_failed(e.to_string()))?;
    let base = lib_base.as_ptr() as usize;
    if map_min != 0 && base != map_min {
        debug!("{}: module not loaded at preferred address", name);
    }
    let load_delta = base as isize - map_min as isize;

    match place_segments(vm, file, phdrs, base, load_delta, name) {
        Ok(spans) => {
            debug!(
                "{}: mapped {} at {:#x}",
                name,
                format_size(map_size, BINARY),
                base
            );
            debug!(
                "for debugger: add-symbol-file {} {:#x}",
                path.display(),
                base
            );
            Ok((base, map_size, load_delta, spans))
        }
        Err(e) => {
            if let Err(e2) = vm.unmap(base as *mut u8, map_size) {
                warn!("{}: failed to release reservation: {}", name, e2);
            }
            Err(e)
        }
    }
}

fn place_segments(
    vm: &dyn VmPrimitives,
    file: &std::fs::File,
    phdrs: elf::segment::SegmentTable<'_, NativeEndian>,
    base: usize,
    load_delta: isize,
    name: &str,
) -> Result<Vec<SegmentSpan>, PrivloadError> {
    let map_failed = |reason: String| -> PrivloadError {
        PrivloadErrorKind::MapFailed {
            library: name.into(),
            reason: reason.as_str().into(),
        }
        .into()
    };
    let mut spans = Vec::new();
    let mut last_end = base;
    for phdr in phdrs.iter().filter(|p| p.p_type == PT_LOAD) {
        let seg_base =
            align_down(phdr.p_vaddr as usize, PAGE_SIZE).wrapping_add_signed(load_delta);
        let seg_end = align_up((phdr.p_vaddr + phdr.p_filesz) as usize, PAGE_SIZE)
            .wrapping_add_signed(load_delta);
        if seg_base != last_end {
            // A hole between load segments: keep it reserved, fence it off.
            vm.protect(last_end as *mut u8, seg_base - last_end, Prot::empty())
                .map_err(|e| map_failed(e.to_string()))?;
        }
        let seg_prot = library::prot_from_phdr(phdr.p_flags);
        let pg_offs = align_down(phdr.p_offset as usize, PAGE_SIZE);
        // The reservation cannot be overlaid in place, so the pages are
        // unmapped and the file mapped fixed into the gap. Between the two
        // calls an unrelated allocation in this address space could take the
        // range; the window is known and tolerated because loading happens
        // while the runtime controls all threads.
        vm.unmap(seg_base as *mut u8, seg_end - seg_base)
            .map_err(|e| map_failed(e.to_string()))?;
        vm.map(MapRequest {
            file: Some(file),
            size: seg_end - seg_base,
            offset: pg_offs as u64,
            hint: seg_base as *mut u8,
            prot: seg_prot | Prot::WRITE,
            cow: true,
            image: true,
            fixed: true,
        })
        .map_err(|e| map_failed(e.to_string()))?;

        // Zero the slack between the file-backed bytes and the end of the
        // file-backed pages; pages past them come zeroed from the
        // reservation.
        let file_end = ((phdr.p_vaddr + phdr.p_filesz) as usize).wrapping_add_signed(load_delta);
        if seg_end > file_end {
            unsafe { ptr::write_bytes(file_end as *mut u8, 0, seg_end - file_end) };
        }
        let mem_end = align_up((phdr.p_vaddr + phdr.p_memsz) as usize, PAGE_SIZE)
            .wrapping_add_signed(load_delta);
        vm.protect(seg_base as *mut u8, mem_end - seg_base, seg_prot)
            .map_err(|e| map_failed(e.to_string()))?;
        spans.push(SegmentSpan {
            start: seg_base,
            end: mem_end,
            prot: seg_prot,
        });
        last_end = mem_end;
    }
    Ok(spans)
}

#[cfg(test)]
mod test {
    use std::{fs, path::PathBuf};

    use super::*;
    use crate::context::test::test_context;

    struct Fixture {
        bytes: Vec<u8>,
    }

    impl Fixture {
        fn new(size: usize) -> Self {
            Self {
                bytes: vec![0u8; size],
            }
        }

        fn put(&mut self, off: usize, data: &[u8]) -> &mut Self {
            self.bytes[off..off + data.len()].copy_from_slice(data);
            self
        }

        fn put_u16(&mut self, off: usize, v: u16) -> &mut Self {
            self.put(off, &v.to_ne_bytes())
        }

        fn put_u32(&mut self, off: usize, v: u32) -> &mut Self {
            self.put(off, &v.to_ne_bytes())
        }

        fn put_u64(&mut self, off: usize, v: u64) -> &mut Self {
            self.put(off, &v.to_ne_bytes())
        }

        fn ehdr(&mut self, phnum: u16) -> &mut Self {
            self.put(0, &[0x7f, b'E', b'L', b'F'])
                .put(4, &[crate::arch::ELF_CLASS_IDENT, 1, 1])
                .put_u16(16, elf::abi::ET_DYN)
                .put_u16(18, crate::arch::ELF_MACHINE)
                .put_u32(20, 1)
                .put_u64(32, 64)
                .put_u16(52, 64)
                .put_u16(54, 56)
                .put_u16(56, phnum)
        }

        fn phdr(
            &mut self,
            idx: usize,
            p_type: u32,
            flags: u32,
            offset: u64,
            vaddr: u64,
            filesz: u64,
            memsz: u64,
            align: u64,
        ) -> &mut Self {
            let at = 64 + idx * 56;
            self.put_u32(at, p_type)
                .put_u32(at + 4, flags)
                .put_u64(at + 8, offset)
                .put_u64(at + 16, vaddr)
                .put_u64(at + 24, vaddr)
                .put_u64(at + 32, filesz)
                .put_u64(at + 40, memsz)
                .put_u64(at + 48, align)
        }

        fn dyn_entry(&mut self, off: usize, tag: i64, val: u64) -> &mut Self {
            self.put_u64(off, tag as u64).put_u64(off + 8, val)
        }

        fn write_to(&self, name: &str) -> PathBuf {
            let dir = std::env::temp_dir().join(format!("privload-load-{}", std::process::id()));
            fs::create_dir_all(&dir).unwrap();
            let path = dir.join(name);
            fs::write(&path, &self.bytes).unwrap();
            path
        }
    }

    // A two-segment shared object with a page-sized hole between text and
    // data, a short dynamic section, and a soname.
    fn two_segment_so(name: &str, extra_dyn: impl FnOnce(&mut Fixture)) -> PathBuf {
        let mut fx = Fixture::new(0x1200);
        fx.ehdr(3)
            .phdr(0, elf::abi::PT_LOAD, elf::abi::PF_R, 0, 0, 0x1000, 0x1000, 0x1000)
            .phdr(
                1,
                elf::abi::PT_LOAD,
                elf::abi::PF_R | elf::abi::PF_W,
                0x1000,
                0x2000,
                0x200,
                0x900,
                0x1000,
            )
            .phdr(2, elf::abi::PT_DYNAMIC, elf::abi::PF_R, 0xe00, 0xe00, 0x60, 0x60, 8);
        // String table at 0xd00: "\0libfix.so\0libnope-absent-xyz.so\0"
        fx.put(0xd00, b"\0libfix.so\0libnope-absent-xyz.so\0");
        fx.dyn_entry(0xe00, elf::abi::DT_STRTAB, 0xd00)
            .dyn_entry(0xe10, elf::abi::DT_SONAME, 1);
        extra_dyn(&mut fx);
        // Recognizable payload in both segments.
        fx.put(0x500, &[0x5a]).put(0x1100, &[0xa5]);
        fx.write_to(name)
    }

    #[test]
    fn maps_two_segments_with_hole_and_bss() {
        let path = two_segment_so("basic.so", |fx| {
            fx.dyn_entry(0xe20, elf::abi::DT_NULL, 0);
        });
        let ctx = test_context();
        let mapped = ctx.map_image(&path, "basic.so").unwrap();
        assert_eq!(mapped.size, 0x3000);
        assert_eq!(mapped.segments.len(), 2);
        unsafe {
            let base = mapped.base as *const u8;
            // Text payload mapped at its vaddr.
            assert_eq!(base.add(0x500).read(), 0x5a);
            // Data payload: vaddr 0x2000 maps file offset 0x1000.
            assert_eq!(base.add(0x2100).read(), 0xa5);
            // The bss tail reads zero.
            assert_eq!(base.add(0x2300).read(), 0);
            assert_eq!(base.add(0x28ff).read(), 0);
        }
        ctx.unmap_range(mapped.base, mapped.size, mapped.backend);
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn load_registers_and_unload_unregisters() {
        let path = two_segment_so("roundtrip.so", |fx| {
            fx.dyn_entry(0xe20, elf::abi::DT_NULL, 0);
        });
        let mut ctx = test_context();
        let id = ctx.load_library_from(&path).unwrap();
        let module = ctx.get_module(id).unwrap();
        assert_eq!(module.name, "roundtrip.so");
        assert_eq!(module.dynamic.soname.as_deref(), Some("libfix.so"));
        let base = module.base_addr();
        assert_eq!(ctx.module_containing(base + 0x100), Some(id));

        // Same basename resolves to the same entry.
        let again = ctx.load_library_from(&path).unwrap();
        assert_eq!(again, id);
        assert_eq!(ctx.load_order().count(), 1);

        ctx.unload_module(id).unwrap();
        assert_eq!(ctx.module_containing(base + 0x100), None);
        assert_eq!(ctx.load_order().count(), 0);
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn map_and_relocate_reports_the_registered_bounds() {
        let path = two_segment_so("bounds.so", |fx| {
            fx.dyn_entry(0xe20, elf::abi::DT_NULL, 0);
        });
        let mut ctx = test_context();
        let (base, size) = ctx.map_and_relocate(&path).unwrap();
        assert_eq!(size, 0x3000);
        let id = ctx.lookup_module("bounds.so").unwrap();
        let module = ctx.get_module(id).unwrap();
        assert_eq!((module.base_addr(), module.size()), (base, size));
        ctx.unload_module(id).unwrap();
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn missing_dependency_aborts_and_leaves_registry_clean() {
        let path = two_segment_so("needy.so", |fx| {
            // Offset 11 in the string table names a library that exists
            // nowhere on the search path.
            fx.dyn_entry(0xe20, elf::abi::DT_NEEDED, 11)
                .dyn_entry(0xe30, elf::abi::DT_NULL, 0);
        });
        let mut ctx = test_context();
        let err = ctx.load_library_from(&path).unwrap_err();
        assert!(matches!(
            err.kind,
            PrivloadErrorKind::LibraryLoadFail { .. }
        ));
        assert_eq!(ctx.load_order().count(), 0);
        assert_eq!(ctx.lookup_module("needy.so"), None);
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn rejects_files_without_elf_header() {
        let path = std::env::temp_dir().join(format!("privload-load-{}-junk", std::process::id()));
        fs::write(&path, b"not an object at all").unwrap();
        let ctx = test_context();
        let err = ctx.map_image(&path, "junk").unwrap_err();
        assert!(matches!(err.kind, PrivloadErrorKind::NotElf { .. }));
        fs::remove_file(path).unwrap();
    }
}
