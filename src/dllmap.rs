//! Redirection of native module names through Mono's dllmap configuration
//!
//! An assembly `Foo.dll` may ship a `Foo.dll.config` next to it:
//!
//! ```xml
//! <configuration>
//!   <dllmap dll="sqlite3" target="libsqlite3.so.0" os="!windows"/>
//! </configuration>
//! ```
//!
//! The system-wide configuration of the runtime holds entries of the same form.

use crate::common::LookupError;
use fs_err as fs;
use multimap::MultiMap;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// `os` attribute values that select an entry on this platform
const MATCHING_OS: [&str; 3] = ["", "linux", "!windows"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DllMapEntry {
    pub os: String,
    pub target: String,
}

impl DllMapEntry {
    fn applies_here(&self) -> bool {
        MATCHING_OS.contains(&self.os.as_str())
    }
}

/// The dllmap entries of one configuration file, grouped by module name in document order
#[derive(Debug, Default)]
pub struct DllMap {
    entries: MultiMap<String, DllMapEntry>,
}

impl DllMap {
    pub fn parse(content: &str) -> Result<Self, LookupError> {
        let doc = roxmltree::Document::parse(content)?;
        let root = doc.root_element();
        let mut entries = MultiMap::new();
        if root.has_tag_name("configuration") {
            for n in root.children().filter(|n| n.has_tag_name("dllmap")) {
                entries.insert(
                    n.attribute("dll").unwrap_or("").to_owned(),
                    DllMapEntry {
                        os: n.attribute("os").unwrap_or("").to_owned(),
                        target: n.attribute("target").unwrap_or("").to_owned(),
                    },
                );
            }
        }
        Ok(Self { entries })
    }

    pub fn from_file<P: AsRef<Path>>(p: P) -> Result<Self, LookupError> {
        let content = fs::read_to_string(p.as_ref())?;
        Self::parse(&content).map_err(|e| {
            LookupError::ParseError(format!("{}: {}", p.as_ref().display(), e))
        })
    }

    /// Target of the first entry for `module` that applies to this platform
    pub fn lookup(&self, module: &str) -> Option<&str> {
        self.entries
            .get_vec(module)?
            .iter()
            .find(|e| e.applies_here())
            .map(|e| e.target.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.iter_all().map(|(_, v)| v.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Applies the per-assembly and the global library maps to module names
///
/// Configuration files are read at most once per run.
pub struct DllMapResolver {
    global_config: PathBuf,
    cache: HashMap<PathBuf, Option<DllMap>>,
}

impl DllMapResolver {
    pub fn new<P: AsRef<Path>>(global_config: P) -> Self {
        Self {
            global_config: global_config.as_ref().to_owned(),
            cache: HashMap::new(),
        }
    }

    /// Configuration file accompanying an assembly
    pub fn assembly_config_path<P: AsRef<Path>>(assembly: P) -> PathBuf {
        let mut p = assembly.as_ref().as_os_str().to_owned();
        p.push(".config");
        PathBuf::from(p)
    }

    fn map_for(&mut self, config: &Path) -> Result<Option<&DllMap>, LookupError> {
        if !self.cache.contains_key(config) {
            let map = if config.is_file() {
                let map = DllMap::from_file(config)?;
                tracing::debug!("read {} dllmap entries from {:?}", map.len(), config);
                Some(map)
            } else {
                None
            };
            self.cache.insert(config.to_owned(), map);
        }
        Ok(self.cache.get(config).and_then(Option::as_ref))
    }

    /// Name the runtime would actually load for `module` declared in `assembly`
    ///
    /// The global map is only consulted if the assembly's own map left the name unchanged.
    pub fn resolve<P: AsRef<Path>>(
        &mut self,
        assembly: P,
        module: &str,
    ) -> Result<String, LookupError> {
        let local_config = Self::assembly_config_path(assembly);
        let mut resolved = self
            .map_for(&local_config)?
            .and_then(|m| m.lookup(module))
            .unwrap_or(module)
            .to_owned();
        if resolved == module {
            let global_config = self.global_config.clone();
            if let Some(target) = self.map_for(&global_config)?.and_then(|m| m.lookup(module)) {
                resolved = target.to_owned();
            }
        }
        if resolved != module {
            tracing::debug!("dllmap: {} => {}", module, resolved);
        }
        Ok(resolved)
    }
}
