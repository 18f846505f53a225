//! Import redirection.
//!
//! Some imports of privately loaded libraries must never bind to their usual
//! definitions: the allocator has to come from the runtime's own heap (the
//! private libraries may outlive, or run before, the application's), and
//! `__tls_get_addr` has to resolve against the private TLS layout since no
//! DTV exists for it. The table here is consulted before any module's symbol
//! tables; a listed name always binds to the replacement.

use crate::{engines::AllocatorRedirects, tls};

struct RedirectImport {
    name: &'static str,
    addr: usize,
}

/// The fixed name → replacement list used during relocation.
pub struct RedirectTable {
    entries: Vec<RedirectImport>,
}

impl RedirectTable {
    pub(crate) fn new(heap: AllocatorRedirects) -> Self {
        let entries = vec![
            RedirectImport {
                name: "calloc",
                addr: heap.calloc,
            },
            RedirectImport {
                name: "malloc",
                addr: heap.malloc,
            },
            RedirectImport {
                name: "free",
                addr: heap.free,
            },
            RedirectImport {
                name: "realloc",
                addr: heap.realloc,
            },
            RedirectImport {
                name: "__tls_get_addr",
                addr: tls::tls_get_addr as usize,
            },
        ];
        Self { entries }
    }

    /// The replacement address for `name`, if the name is redirected.
    pub fn lookup(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .find(|imp| imp.name == name)
            .map(|imp| imp.addr)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn table() -> RedirectTable {
        RedirectTable::new(AllocatorRedirects {
            malloc: 0x1000,
            calloc: 0x2000,
            realloc: 0x3000,
            free: 0x4000,
        })
    }

    #[test]
    fn listed_names_bind_to_replacements() {
        let t = table();
        assert_eq!(t.lookup("malloc"), Some(0x1000));
        assert_eq!(t.lookup("calloc"), Some(0x2000));
        assert_eq!(t.lookup("realloc"), Some(0x3000));
        assert_eq!(t.lookup("free"), Some(0x4000));
        assert_eq!(t.lookup("__tls_get_addr"), Some(tls::tls_get_addr as usize));
    }

    #[test]
    fn unlisted_names_pass_through() {
        assert_eq!(table().lookup("memcpy"), None);
    }
}
