//! Data structures that must be filled with the input and the parameters for the footprint scan

use crate::common::{absolute_path, LookupError};
use crate::system::UnixSystem;
use std::path::{Path, PathBuf};

/// Program used to list the native dependencies of a binary
pub const DEFAULT_INSPECTOR: &str = "ldd";
/// Program used to produce stripped copies of native binaries
pub const DEFAULT_STRIPPER: &str = "strip";

#[derive(Clone, Debug)]
pub struct LookupTarget {
    /// Files and directories to inventory
    pub roots: Vec<PathBuf>,
    /// Mono runtime binary, walked as an additional root once any assembly was found
    pub runtime: Option<PathBuf>,
}

#[derive(Clone, Debug)]
pub struct LookupParameters {
    /// Collect debug symbol files (.mdb, .pdb)
    pub include_debug: bool,
    /// Link inspector invoked on every candidate native file
    pub inspector: PathBuf,
    /// Program producing stripped copies of native files for measurement; None to report
    /// the size on disk
    pub stripper: Option<PathBuf>,
}

/// Complete specification of a scan
#[derive(Clone, Debug)]
pub struct LookupQuery {
    pub system: UnixSystem,
    pub target: LookupTarget,
    pub parameters: LookupParameters,
}

impl LookupQuery {
    /// autodetects the settings with sensible defaults for the current host
    ///
    /// The runtime binary is the `mono` found on the PATH, if any.
    pub fn deduce_from_roots<P: AsRef<Path>>(roots: &[P]) -> Result<Self, LookupError> {
        let mut query = Self::with_system(roots, UnixSystem::current())?;
        query.target.runtime = which::which("mono").ok();
        Ok(query)
    }

    /// settings for the given roots on the given system; no runtime binary is assumed
    pub fn with_system<P: AsRef<Path>>(
        roots: &[P],
        system: UnixSystem,
    ) -> Result<Self, LookupError> {
        if roots.is_empty() {
            return Err(LookupError::ContextDeductionError(
                "At least one file or directory must be given".to_owned(),
            ));
        }
        let roots = roots
            .iter()
            .map(absolute_path)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            system,
            target: LookupTarget {
                roots,
                runtime: None,
            },
            parameters: LookupParameters {
                include_debug: false,
                inspector: PathBuf::from(DEFAULT_INSPECTOR),
                stripper: None,
            },
        })
    }
}
