use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LookupError {
    #[error("Malformed CLI metadata: {0}")]
    MetadataError(String),

    #[error("Configuration file parse error: {0}")]
    ParseError(String),

    #[error("Lookup context building error: {0}")]
    ContextDeductionError(String),

    #[error("Environment variable {0} is not set")]
    MissingEnvironment(String),

    #[error("Cyclic include of linker configuration {0:?}")]
    CyclicInclude(PathBuf),

    #[error("Dependency {dependency:?} reported for {dependent:?} does not exist")]
    InconsistentEnvironment {
        dependent: PathBuf,
        dependency: PathBuf,
    },

    #[error("Could not resolve assembly {identity} referenced by {referenced_by:?}")]
    UnresolvedAssembly {
        identity: String,
        referenced_by: PathBuf,
    },

    #[error("{0:?} is not a CLI assembly")]
    NotAnAssembly(PathBuf),

    #[error(transparent)]
    XmlError(#[from] roxmltree::Error),
    #[error(transparent)]
    PatternError(#[from] glob::PatternError),
    #[error(transparent)]
    RegexError(#[from] regex::Error),
    #[error(transparent)]
    IOError(#[from] std::io::Error),
}

/// Absolute version of a path, without resolving symlinks
///
/// `libfoo.so -> libfoo.so.1` stays `libfoo.so`, as the dynamic linker reports it.
pub fn absolute_path<P: AsRef<Path>>(p: P) -> Result<PathBuf, LookupError> {
    Ok(std::path::absolute(p.as_ref())?)
}

/// True if the file name starts with a dot
pub(crate) fn is_hidden<P: AsRef<Path>>(p: P) -> bool {
    p.as_ref()
        .file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('.'))
        .unwrap_or(false)
}
