use crate::common::LookupError;
use fs_err as fs;
use std::collections::{HashMap, HashSet};
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Environment variable holding the colon-delimited library search path
pub const LIBRARY_PATH_VAR: &str = "LD_LIBRARY_PATH";
/// Environment variable holding extra assembly probing directories
pub const MONO_PATH_VAR: &str = "MONO_PATH";
/// Dynamic linker configuration, relative to the system root
pub const LINKER_CONFIG: &str = "etc/ld.so.conf";
/// System-wide library map, relative to the system root
pub const GLOBAL_DLLMAP_CONFIG: &str = "etc/mono/config";

/// Description of the Unix system the application is deployed on
///
/// If we inspect the running host, everything comes from the environment and the usual
/// locations under `/`. An image of another system can be described with `from_root`, in which
/// case the environment of the current process is ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnixSystem {
    /// Entries of LD_LIBRARY_PATH; None if the variable is not set
    pub library_path: Option<Vec<PathBuf>>,
    /// ld.so.conf, parsed recursively for further search directories
    pub linker_config: PathBuf,
    /// Mono's global configuration, holding the system-wide dllmap entries
    pub global_dllmap: PathBuf,
    /// Entries of MONO_PATH
    pub mono_path: Vec<PathBuf>,
    /// Installation prefix of the Mono runtime (e.g. /usr), if known
    pub mono_prefix: Option<PathBuf>,
}

impl UnixSystem {
    /// Collect information about the host operating system
    pub fn current() -> Self {
        let library_path = std::env::var_os(LIBRARY_PATH_VAR).map(|v| split_path_list(&v));
        let mono_path = std::env::var_os(MONO_PATH_VAR)
            .map(|v| split_path_list(&v))
            .unwrap_or_default();
        let root = Path::new("/");
        Self {
            library_path,
            linker_config: root.join(LINKER_CONFIG),
            global_dllmap: root.join(GLOBAL_DLLMAP_CONFIG),
            mono_path,
            mono_prefix: which::which("mono")
                .ok()
                .and_then(|runtime| Self::prefix_of_runtime(&runtime)),
        }
    }

    /// Collect information about the system image at the given path
    ///
    /// LD_LIBRARY_PATH is considered set but empty: only ld.so.conf contributes directories.
    pub fn from_root<P: AsRef<Path>>(root_path: P) -> Self {
        let root = root_path.as_ref();
        let usr = root.join("usr");
        Self {
            library_path: Some(Vec::new()),
            linker_config: root.join(LINKER_CONFIG),
            global_dllmap: root.join(GLOBAL_DLLMAP_CONFIG),
            mono_path: Vec::new(),
            mono_prefix: if usr.join("lib/mono").is_dir() {
                Some(usr)
            } else {
                None
            },
        }
    }

    /// `/usr/bin/mono` is installed under the prefix `/usr`
    pub fn prefix_of_runtime<P: AsRef<Path>>(runtime: P) -> Option<PathBuf> {
        let bin_dir = runtime.as_ref().parent()?;
        if bin_dir.file_name()? == "bin" {
            bin_dir.parent().map(Path::to_path_buf)
        } else {
            None
        }
    }

    /// Directories holding the framework assemblies of the Mono installation
    pub fn framework_dirs(&self) -> Vec<PathBuf> {
        self.mono_prefix
            .as_ref()
            .map(|prefix| {
                let lib = prefix.join("lib/mono/4.5");
                vec![lib.clone(), lib.join("Facades")]
            })
            .unwrap_or_default()
    }

    /// Root of the global assembly cache of the Mono installation
    pub fn gac_dir(&self) -> Option<PathBuf> {
        self.mono_prefix.as_ref().map(|p| p.join("lib/mono/gac"))
    }
}

/// Split a colon-delimited path list, dropping empty entries
pub fn split_path_list(value: &std::ffi::OsStr) -> Vec<PathBuf> {
    std::env::split_paths(value)
        .filter(|p| !p.as_os_str().is_empty())
        .collect()
}

/// Caches the content of already scanned directories, to avoid repeated filesystem access
pub(crate) struct FileSystemCache {
    files_in_dirs: HashMap<PathBuf, HashSet<OsString>>,
}

impl FileSystemCache {
    pub(crate) fn new() -> Self {
        Self {
            files_in_dirs: HashMap::new(),
        }
    }

    /// Full path of `filename` inside `folder`, if it is a file (or a link to one)
    pub(crate) fn test_file_in_folder<P: AsRef<Path>, Q: AsRef<Path>>(
        &mut self,
        filename: P,
        folder: Q,
    ) -> Result<Option<PathBuf>, LookupError> {
        let filename = filename.as_ref();
        let folder = folder.as_ref();
        // names with a directory part (absolute dllmap targets, subdir/lib.so) can't be listed
        if filename.components().count() != 1 {
            let candidate = folder.join(filename);
            return Ok(if candidate.is_file() {
                Some(candidate)
            } else {
                None
            });
        }
        self.scan_folder(folder)?;
        let dir = self.files_in_dirs.get(folder).ok_or_else(|| {
            LookupError::ContextDeductionError(format!("Could not scan directory {:?}", folder))
        })?;
        Ok(if dir.contains(filename.as_os_str()) {
            Some(folder.join(filename))
        } else {
            None
        })
    }

    pub(crate) fn scan_folder<P: AsRef<Path>>(&mut self, folder: P) -> Result<(), LookupError> {
        if let std::collections::hash_map::Entry::Vacant(e) =
            self.files_in_dirs.entry(folder.as_ref().to_owned())
        {
            // a search path entry that doesn't exist simply contributes nothing
            let files: HashSet<OsString> = match fs::read_dir(folder.as_ref()) {
                Ok(entries) => entries
                    .filter_map(|entry| entry.ok())
                    .filter(|entry| entry.path().is_file())
                    .map(|entry| entry.file_name())
                    .collect(),
                Err(err) => {
                    tracing::debug!("skipping unreadable search directory: {}", err);
                    HashSet::new()
                }
            };
            e.insert(files);
        }
        Ok(())
    }
}
