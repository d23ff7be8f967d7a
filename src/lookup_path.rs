use crate::common::LookupError;
use crate::query::LookupQuery;
use crate::system::{FileSystemCache, LIBRARY_PATH_VAR};
use fs_err as fs;
use std::path::{Path, PathBuf};

/// Directory to be searched for native libraries, and where it came from
#[derive(Eq, PartialEq, Debug, Clone)]
pub enum LookupPathEntry {
    /// Entry of LD_LIBRARY_PATH (or of the list given in its place)
    LibraryPath(PathBuf),
    /// Directory listed in the dynamic linker configuration
    LinkerConfig {
        dir: PathBuf,
        /// configuration file the directory was read from
        source: PathBuf,
    },
}

impl LookupPathEntry {
    pub fn get_path(&self) -> &Path {
        match self {
            Self::LibraryPath(p) => p,
            Self::LinkerConfig { dir, .. } => dir,
        }
    }
}

/// Full location of a native library found during lookup
#[derive(Debug)]
pub struct LookupResult {
    pub location: LookupPathEntry,
    pub fullpath: PathBuf,
}

/// Sorted list of directories to be looked up when searching for a native library
///
/// The order is the one the dynamic linker uses: LD_LIBRARY_PATH first, then the directories
/// from ld.so.conf. The first match wins; duplicate entries are harmless.
pub struct LookupPath {
    pub entries: Vec<LookupPathEntry>,
    fs_cache: std::cell::RefCell<FileSystemCache>,
}

impl LookupPath {
    pub fn new(entries: Vec<LookupPathEntry>) -> Self {
        Self {
            entries,
            fs_cache: std::cell::RefCell::new(FileSystemCache::new()),
        }
    }

    /// Build the search path for the system described in the query
    ///
    /// Fails if LD_LIBRARY_PATH was not set and no replacement was given.
    pub fn deduce(query: &LookupQuery) -> Result<Self, LookupError> {
        let library_path = query
            .system
            .library_path
            .as_ref()
            .ok_or_else(|| LookupError::MissingEnvironment(LIBRARY_PATH_VAR.to_owned()))?;
        let mut entries: Vec<LookupPathEntry> = library_path
            .iter()
            .map(|p| LookupPathEntry::LibraryPath(p.clone()))
            .collect();

        if query.system.linker_config.is_file() {
            entries.extend(parse_linker_config(&query.system.linker_config)?);
        } else {
            tracing::warn!(
                "linker configuration {:?} not found, using the library path only",
                query.system.linker_config
            );
        }

        Ok(Self::new(entries))
    }

    // linearize the lookup path into a single vector of directories
    pub fn search_path(&self) -> Vec<PathBuf> {
        self.entries
            .iter()
            .map(|e| e.get_path().to_path_buf())
            .collect()
    }

    /// File names tried, in order, for a native module name
    pub fn candidate_names(module: &str) -> [String; 4] {
        [
            module.to_owned(),
            format!("{}.so", module),
            format!("lib{}", module),
            format!("lib{}.so", module),
        ]
    }

    /// looks for a native library by module name
    ///
    /// Directories are the outer loop and name variants the inner one: an earlier directory
    /// wins even if a later one has a "better" candidate.
    pub fn search_library(&self, module: &str) -> Result<Option<LookupResult>, LookupError> {
        if module.is_empty() {
            return Ok(None);
        }
        let candidates = Self::candidate_names(module);
        for e in &self.entries {
            for candidate in &candidates {
                if let Some(fullpath) = self
                    .fs_cache
                    .borrow_mut()
                    .test_file_in_folder(candidate, e.get_path())?
                {
                    return Ok(Some(LookupResult {
                        location: e.clone(),
                        fullpath,
                    }));
                }
            }
        }
        Ok(None)
    }
}

/// Read the directories listed in a dynamic linker configuration file
///
/// `include` lines name a glob pattern (relative to the including file), every match is
/// parsed in turn. Everything after a `#` is a comment.
pub fn parse_linker_config<P: AsRef<Path>>(
    config: P,
) -> Result<Vec<LookupPathEntry>, LookupError> {
    let mut entries = Vec::new();
    let mut active = Vec::new();
    parse_linker_config_into(config.as_ref(), &mut active, &mut entries)?;
    Ok(entries)
}

fn parse_linker_config_into(
    config: &Path,
    active: &mut Vec<PathBuf>,
    entries: &mut Vec<LookupPathEntry>,
) -> Result<(), LookupError> {
    // the same file may be included twice side by side, but never by itself
    let identity = fs::canonicalize(config)?;
    if active.contains(&identity) {
        return Err(LookupError::CyclicInclude(config.to_owned()));
    }
    active.push(identity);

    let content = fs::read_to_string(config)?;
    for line in content.lines() {
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        if let Some(pattern) = line.strip_prefix("include ") {
            let pattern = pattern.trim();
            let pattern_path = match config.parent() {
                Some(parent) => parent.join(pattern),
                None => PathBuf::from(pattern),
            };
            let mut included: Vec<PathBuf> = glob::glob(&pattern_path.to_string_lossy())?
                .filter_map(Result::ok)
                .filter(|p| p.is_file())
                .collect();
            included.sort();
            for file in included {
                parse_linker_config_into(&file, active, entries)?;
            }
        } else {
            entries.push(LookupPathEntry::LinkerConfig {
                dir: PathBuf::from(line),
                source: config.to_owned(),
            });
        }
    }

    active.pop();
    Ok(())
}
