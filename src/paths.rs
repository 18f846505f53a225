//! Locating library files on disk.
//!
//! The search order is fixed: directories the runtime registered for its
//! client libraries, then the working directory, then `LD_LIBRARY_PATH`,
//! then a hand-crafted list of system library directories. `DT_RPATH` and
//! `DT_RUNPATH` are not honored, and the dynamic linker cache is not
//! consulted; a library reachable only through those will not resolve.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::{engines::VmPrimitives, PrivloadError, PrivloadErrorKind};

const LIBRARY_PATH_VAR: &str = "LD_LIBRARY_PATH";

#[cfg(target_pointer_width = "64")]
const SYSTEM_LIB_PATHS: &[&str] = &[
    "/lib/tls/i686/cmov",
    "/usr/lib",
    "/lib",
    "/lib64/tls/i686/cmov",
    "/usr/lib64",
    "/lib64",
];

#[cfg(target_pointer_width = "32")]
const SYSTEM_LIB_PATHS: &[&str] = &[
    "/lib/tls/i686/cmov",
    "/usr/lib",
    "/lib",
    "/lib32/tls/i686/cmov",
    "/usr/lib32",
    "/lib32",
];

/// The ordered list of directories the loader searches, first hit wins.
#[derive(Debug, Default)]
pub struct SearchPaths {
    client_dirs: Vec<PathBuf>,
    ld_library_path: Vec<PathBuf>,
}

impl SearchPaths {
    /// Build the search list from the registered client directories and the
    /// process environment.
    pub fn discover(client_dirs: Vec<PathBuf>) -> Self {
        let ld_library_path = std::env::var(LIBRARY_PATH_VAR)
            .map(|v| parse_path_list(&v))
            .unwrap_or_default();
        Self {
            client_dirs,
            ld_library_path,
        }
    }

    pub fn from_parts(client_dirs: Vec<PathBuf>, ld_library_path: Vec<PathBuf>) -> Self {
        Self {
            client_dirs,
            ld_library_path,
        }
    }

    /// Every candidate directory, in search order.
    fn candidates(&self) -> impl Iterator<Item = &Path> {
        self.client_dirs
            .iter()
            .map(PathBuf::as_path)
            .chain(std::iter::once(Path::new(".")))
            .chain(self.ld_library_path.iter().map(PathBuf::as_path))
            .chain(SYSTEM_LIB_PATHS.iter().map(Path::new))
    }

    /// Find `name` across the search list. A candidate counts only if it is
    /// a regular file carrying a valid ELF shared-object header.
    pub fn locate(
        &self,
        name: &str,
        probe: &dyn VmPrimitives,
    ) -> Result<PathBuf, PrivloadError> {
        for dir in self.candidates() {
            let candidate = dir.join(name);
            debug!("looking for {}", candidate.display());
            if probe.file_exists(&candidate) && probe.has_elf_so_header(&candidate) {
                return Ok(candidate);
            }
        }
        Err(PrivloadErrorKind::NotFound { name: name.into() }.into())
    }
}

fn parse_path_list(list: &str) -> Vec<PathBuf> {
    list.split(':')
        .filter(|p| !p.is_empty())
        .map(PathBuf::from)
        .collect()
}

#[cfg(test)]
mod test {
    use std::fs;

    use super::*;
    use crate::engines::linux::OsPrimitives;

    fn fixture_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "privload-paths-{}-{}",
            tag,
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write_fake_so(dir: &Path, name: &str) {
        let mut bytes = vec![0u8; 128];
        bytes[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
        bytes[4] = crate::arch::ELF_CLASS_IDENT;
        bytes[16..18].copy_from_slice(&elf::abi::ET_DYN.to_ne_bytes());
        bytes[18..20].copy_from_slice(&crate::arch::ELF_MACHINE.to_ne_bytes());
        fs::write(dir.join(name), bytes).unwrap();
    }

    #[test]
    fn parses_colon_separated_lists() {
        let parsed = parse_path_list("/a:/b::/c");
        assert_eq!(
            parsed,
            vec![
                PathBuf::from("/a"),
                PathBuf::from("/b"),
                PathBuf::from("/c")
            ]
        );
    }

    #[test]
    fn earlier_directory_wins() {
        let a = fixture_dir("a");
        let b = fixture_dir("b");
        write_fake_so(&a, "libdup.so");
        write_fake_so(&b, "libdup.so");
        let paths = SearchPaths::from_parts(vec![], vec![a.clone(), b.clone()]);
        let found = paths.locate("libdup.so", &OsPrimitives).unwrap();
        assert_eq!(found, a.join("libdup.so"));
        fs::remove_dir_all(a).unwrap();
        fs::remove_dir_all(b).unwrap();
    }

    #[test]
    fn client_dirs_come_before_ld_library_path() {
        let client = fixture_dir("client");
        let ld = fixture_dir("ld");
        write_fake_so(&client, "libpref.so");
        write_fake_so(&ld, "libpref.so");
        let paths = SearchPaths::from_parts(vec![client.clone()], vec![ld.clone()]);
        let found = paths.locate("libpref.so", &OsPrimitives).unwrap();
        assert_eq!(found, client.join("libpref.so"));
        fs::remove_dir_all(client).unwrap();
        fs::remove_dir_all(ld).unwrap();
    }

    #[test]
    fn non_elf_candidates_are_skipped() {
        let a = fixture_dir("notelf");
        let b = fixture_dir("elf");
        fs::write(a.join("libskip.so"), b"definitely not an object").unwrap();
        write_fake_so(&b, "libskip.so");
        let paths = SearchPaths::from_parts(vec![], vec![a.clone(), b.clone()]);
        let found = paths.locate("libskip.so", &OsPrimitives).unwrap();
        assert_eq!(found, b.join("libskip.so"));
        fs::remove_dir_all(a).unwrap();
        fs::remove_dir_all(b).unwrap();
    }

    #[test]
    fn missing_library_reports_not_found() {
        let paths = SearchPaths::from_parts(vec![], vec![]);
        let err = paths
            .locate("libnope-definitely-absent.so", &OsPrimitives)
            .unwrap_err();
        assert!(matches!(err.kind, PrivloadErrorKind::NotFound { .. }));
    }
}
