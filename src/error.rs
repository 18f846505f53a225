//! Definitions for errors for the private loader.
use elf::file::Class;
use itertools::{Either, Itertools};
use miette::Diagnostic;
use smallstr::SmallString;
use thiserror::Error;

use crate::Vec;

type String = SmallString<[u8; SMALL_STRING_SIZE]>;

use crate::{context::ModuleId, SMALL_STRING_SIZE, SMALL_VEC_SIZE};

#[derive(Debug, Error, Diagnostic, Default)]
#[error("{kind}")]
pub struct PrivloadError {
    pub kind: PrivloadErrorKind,
    #[related]
    pub related: std::vec::Vec<PrivloadError>,
}

impl PrivloadError {
    pub fn new_collect(kind: PrivloadErrorKind, related: std::vec::Vec<PrivloadError>) -> Self {
        Self { kind, related }
    }

    pub fn new(kind: PrivloadErrorKind) -> Self {
        Self {
            kind,
            related: vec![],
        }
    }

    pub fn collect<I, T: Default>(
        parent_kind: PrivloadErrorKind,
        it: I,
    ) -> Result<Vec<T, SMALL_VEC_SIZE>, PrivloadError>
    where
        I: IntoIterator<Item = Result<T, PrivloadError>>,
    {
        // Collect errors and values, and then if there any errors, build a new error from them.
        let (vals, errs): (Vec<T, SMALL_VEC_SIZE>, Vec<PrivloadError, SMALL_VEC_SIZE>) =
            it.into_iter().partition_map(|item| match item {
                Ok(o) => Either::Left(o),
                Err(e) => Either::Right(e),
            });

        if errs.is_empty() {
            Ok(vals)
        } else {
            let mut serrs = std::vec::Vec::new();
            for e in errs {
                serrs.push(e);
            }
            Err(PrivloadError {
                kind: parent_kind,
                related: serrs,
            })
        }
    }
}

impl From<PrivloadErrorKind> for PrivloadError {
    fn from(value: PrivloadErrorKind) -> Self {
        Self {
            kind: value,
            related: vec![],
        }
    }
}

#[derive(Debug, Error, Diagnostic, Default)]
pub enum PrivloadErrorKind {
    #[default]
    #[error("unknown")]
    Unknown,
    #[error("loader is not initialized")]
    NotInitialized,
    #[error("loader is already initialized")]
    AlreadyInitialized,
    #[error("library not found: {name}")]
    NotFound { name: String },
    #[error("{path} is not an ELF shared object")]
    NotElf {
        path: String,
        #[source]
        #[diagnostic_source]
        hdr_err: HeaderError,
    },
    #[error("failed to map {library}: {reason}")]
    MapFailed { library: String, reason: String },
    #[error("failed to load library {library}")]
    LibraryLoadFail { library: String },
    #[error("failed to enumerate dependencies for {library}")]
    DepEnumerationFail { library: String },
    #[error("failed to resolve symbol '{symname}' for '{sourcelib}'")]
    UnresolvedSymbol { symname: String, sourcelib: String },
    #[error("library {library} requested relocation that is unsupported: {reloc}")]
    UnsupportedReloc { library: String, reloc: String },
    #[error("failed to process relocation table '{secname}' for library '{library}'")]
    RelocationSectionFail { secname: String, library: String },
    #[error("library '{library}' failed to relocate")]
    RelocationFail { library: String },
    #[error("dynamic object is missing a required segment or table '{name}'")]
    MissingSection { name: String },
    #[error("parse failed: {err}")]
    ParseError {
        #[from]
        err: elf::ParseError,
    },
    #[error("library {library} has no TLS segment for request")]
    NoTlsInfo { library: String },
    #[error("too many TLS-bearing modules (limit {max})")]
    TooManyTlsMods { max: usize },
    #[error("out of resources while {what}")]
    ResourceExhausted { what: String },
    #[error("invalid module ID '{id}'")]
    InvalidModuleId { id: ModuleId },
    #[error("no registered module contains address {addr:#x}")]
    UnknownBase { addr: usize },
}

#[derive(Debug, Error, Diagnostic)]
pub enum HeaderError {
    #[error("bad ELF magic")]
    BadMagic,
    #[error("class mismatch: expected {expect:?}, got {got:#x}")]
    ClassMismatch { expect: Class, got: u8 },
    #[error("ELF type mismatch: expected {expect}, got {got}")]
    ELFTypeMismatch { expect: u16, got: u16 },
    #[error("machine mismatch: expected {expect}, got {got}")]
    MachineMismatch { expect: u16, got: u16 },
    #[error("file too short for an ELF header")]
    Truncated,
}

impl From<elf::ParseError> for PrivloadError {
    fn from(value: elf::ParseError) -> Self {
        Self {
            kind: PrivloadErrorKind::ParseError { err: value },
            related: vec![],
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn collect_keeps_values_when_clean() {
        let it = (0..4usize).map(Ok);
        let vals = PrivloadError::collect(PrivloadErrorKind::Unknown, it).unwrap();
        assert_eq!(&vals[..], &[0, 1, 2, 3]);
    }

    #[test]
    fn collect_aggregates_failures() {
        let it = vec![
            Ok(1usize),
            Err(PrivloadError::new(PrivloadErrorKind::NotFound {
                name: "libnope.so".into(),
            })),
            Err(PrivloadError::new(PrivloadErrorKind::NotFound {
                name: "libnada.so".into(),
            })),
        ];
        let err = PrivloadError::collect(
            PrivloadErrorKind::LibraryLoadFail {
                library: "libapp.so".into(),
            },
            it,
        )
        .unwrap_err();
        assert_eq!(err.related.len(), 2);
        assert!(matches!(
            err.kind,
            PrivloadErrorKind::LibraryLoadFail { .. }
        ));
    }
}
