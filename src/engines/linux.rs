//! The two Linux VM backends.

use std::{
    fs::File,
    io::{self, Read},
    os::unix::io::AsRawFd,
    path::Path,
    ptr::NonNull,
};

use parking_lot::Mutex;
use tracing::trace;

use super::{MapRequest, Prot, VmPrimitives};
use crate::library;

fn prot_to_os(prot: Prot) -> libc::c_int {
    let mut os = libc::PROT_NONE;
    if prot.contains(Prot::READ) {
        os |= libc::PROT_READ;
    }
    if prot.contains(Prot::WRITE) {
        os |= libc::PROT_WRITE;
    }
    if prot.contains(Prot::EXEC) {
        os |= libc::PROT_EXEC;
    }
    os
}

fn mmap(req: &MapRequest<'_>) -> io::Result<NonNull<u8>> {
    let mut flags = if req.cow || req.file.is_none() {
        libc::MAP_PRIVATE
    } else {
        libc::MAP_SHARED
    };
    if req.file.is_none() {
        flags |= libc::MAP_ANONYMOUS;
    }
    if req.fixed {
        flags |= libc::MAP_FIXED;
    }
    let fd = req.file.map_or(-1, |f| f.as_raw_fd());
    let ptr = unsafe {
        libc::mmap(
            req.hint.cast(),
            req.size,
            prot_to_os(req.prot),
            flags,
            fd,
            req.offset as libc::off_t,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    NonNull::new(ptr.cast()).ok_or_else(|| io::Error::other("mapped at null"))
}

fn munmap(base: *mut u8, size: usize) -> io::Result<()> {
    if unsafe { libc::munmap(base.cast(), size) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn mprotect(base: *mut u8, size: usize, prot: Prot) -> io::Result<()> {
    if unsafe { libc::mprotect(base.cast(), size, prot_to_os(prot)) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn probe_elf_so(path: &Path) -> bool {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(_) => return false,
    };
    let mut ident = [0u8; 64];
    let n = match file.read(&mut ident) {
        Ok(n) => n,
        Err(_) => return false,
    };
    library::is_elf_so_header(&ident[..n]).is_ok()
}

/// Raw primitives: straight syscalls, no bookkeeping. The only backend that
/// may run before the runtime heap is initialized.
#[derive(Default)]
pub struct OsPrimitives;

impl VmPrimitives for OsPrimitives {
    fn open(&self, path: &Path) -> io::Result<File> {
        File::open(path)
    }

    fn file_size(&self, file: &File) -> io::Result<u64> {
        Ok(file.metadata()?.len())
    }

    fn map(&self, req: MapRequest<'_>) -> io::Result<NonNull<u8>> {
        mmap(&req)
    }

    fn unmap(&self, base: *mut u8, size: usize) -> io::Result<()> {
        munmap(base, size)
    }

    fn protect(&self, base: *mut u8, size: usize, prot: Prot) -> io::Result<()> {
        mprotect(base, size, prot)
    }

    fn file_exists(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn has_elf_so_header(&self, path: &Path) -> bool {
        probe_elf_so(path)
    }
}

/// Tracked primitives: same syscalls, plus a record of every image range so
/// the runtime's address-space queries stay accurate once the heap is up.
#[derive(Default)]
pub struct TrackedPrimitives {
    areas: Mutex<Vec<(usize, usize)>>,
}

impl TrackedPrimitives {
    /// Image ranges currently mapped through this backend.
    pub fn image_areas(&self) -> Vec<(usize, usize)> {
        self.areas.lock().clone()
    }
}

impl VmPrimitives for TrackedPrimitives {
    fn open(&self, path: &Path) -> io::Result<File> {
        File::open(path)
    }

    fn file_size(&self, file: &File) -> io::Result<u64> {
        Ok(file.metadata()?.len())
    }

    fn map(&self, req: MapRequest<'_>) -> io::Result<NonNull<u8>> {
        let image = req.image;
        let size = req.size;
        let ptr = mmap(&req)?;
        if image {
            let start = ptr.as_ptr() as usize;
            trace!("tracking image range {:#x}-{:#x}", start, start + size);
            self.areas.lock().push((start, start + size));
        }
        Ok(ptr)
    }

    fn unmap(&self, base: *mut u8, size: usize) -> io::Result<()> {
        let start = base as usize;
        let end = start + size;
        // Trim or drop any tracked range the unmap covers.
        let mut areas = self.areas.lock();
        areas.retain_mut(|(s, e)| {
            if start <= *s && end >= *e {
                return false;
            }
            if start > *s && start < *e {
                *e = start;
            } else if end > *s && end < *e {
                *s = end;
            }
            true
        });
        drop(areas);
        munmap(base, size)
    }

    fn protect(&self, base: *mut u8, size: usize, prot: Prot) -> io::Result<()> {
        mprotect(base, size, prot)
    }

    fn file_exists(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn has_elf_so_header(&self, path: &Path) -> bool {
        probe_elf_so(path)
    }
}
