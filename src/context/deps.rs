use tracing::trace;

use super::{Context, ModuleId};
use crate::{PrivloadError, PrivloadErrorKind, Vec, SMALL_VEC_SIZE};

impl Context {
    /// Load every `DT_NEEDED` entry of a module, depth first. Names already
    /// in the registry resolve to their existing entries; the rest go
    /// through the search paths and the full load pipeline. All failures
    /// are collected under one error so a broken closure reports every
    /// missing leaf at once.
    pub(crate) fn load_dependencies(
        &mut self,
        needed: &[String],
        dependent: &str,
    ) -> Result<Vec<ModuleId, SMALL_VEC_SIZE>, PrivloadError> {
        trace!("{}: enumerating dependencies", dependent);
        PrivloadError::collect(
            PrivloadErrorKind::DepEnumerationFail {
                library: dependent.into(),
            },
            needed.iter().map(|name| {
                trace!("{}: needs {}", dependent, name);
                self.load_library(name)
            }),
        )
    }
}
