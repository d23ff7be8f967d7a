use crate::common::LookupError;
use crate::system::{FileSystemCache, UnixSystem};
use indexmap::IndexSet;
use serde::Serialize;
use sha1::{Digest, Sha1};
use std::cell::RefCell;
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub struct AssemblyVersion {
    pub major: u16,
    pub minor: u16,
    pub build: u16,
    pub revision: u16,
}

impl AssemblyVersion {
    pub fn new(major: u16, minor: u16, build: u16, revision: u16) -> Self {
        Self {
            major,
            minor,
            build,
            revision,
        }
    }
}

impl fmt::Display for AssemblyVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.major, self.minor, self.build, self.revision
        )
    }
}

/// Strong identity of an assembly: what a reference names, and what an image declares
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AssemblyIdentity {
    pub name: String,
    pub version: AssemblyVersion,
    /// None for the neutral culture
    pub culture: Option<String>,
    pub public_key_token: Option<[u8; 8]>,
}

impl AssemblyIdentity {
    /// Token of a full public key: the last 8 bytes of its SHA-1, reversed
    pub fn token_from_public_key(key: &[u8]) -> [u8; 8] {
        let digest = Sha1::digest(key);
        let mut token = [0u8; 8];
        for (dst, src) in token.iter_mut().zip(digest.iter().rev()) {
            *dst = *src;
        }
        token
    }

    /// Lowercase hex token, or "null" for unsigned assemblies
    pub fn token_string(&self) -> String {
        match self.public_key_token {
            Some(token) => token.iter().map(|b| format!("{:02x}", b)).collect(),
            None => "null".to_owned(),
        }
    }

    pub fn culture_name(&self) -> &str {
        self.culture.as_deref().unwrap_or("neutral")
    }

    /// `Name, Version=a.b.c.d, Culture=neutral, PublicKeyToken=null`
    pub fn full_name(&self) -> String {
        format!(
            "{}, Version={}, Culture={}, PublicKeyToken={}",
            self.name,
            self.version,
            self.culture_name(),
            self.token_string()
        )
    }

    /// Relative location in the global assembly cache, e.g.
    /// `System/4.0.0.0__b77a5c561934e089/System.dll`; None for unsigned assemblies
    pub fn gac_path(&self) -> Option<PathBuf> {
        self.public_key_token?;
        let version_dir = format!(
            "{}_{}_{}",
            self.version,
            self.culture.as_deref().unwrap_or(""),
            self.token_string()
        );
        Some(
            PathBuf::from(&self.name)
                .join(version_dir)
                .join(format!("{}.dll", self.name)),
        )
    }
}

impl fmt::Display for AssemblyIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full_name())
    }
}

/// What the inventory needs to know of a managed image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssemblyImage {
    pub identity: AssemblyIdentity,
    /// Module name of each P/Invoke method, with repetitions
    pub pinvoke_modules: Vec<String>,
    /// Referenced assemblies, in declaration order
    pub references: Vec<AssemblyIdentity>,
}

impl AssemblyImage {
    /// Distinct native module names, in order of first declaration
    pub fn declared_modules(&self) -> IndexSet<&str> {
        self.pinvoke_modules.iter().map(String::as_str).collect()
    }
}

/// A loaded assembly
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssemblyRecord {
    pub full_name: String,
    pub location: PathBuf,
    /// Distinct native module names its P/Invoke methods bind to, as declared
    pub native_modules: IndexSet<String>,
}

impl AssemblyRecord {
    pub fn new(image: &AssemblyImage, location: PathBuf) -> Self {
        Self {
            full_name: image.identity.full_name(),
            location,
            native_modules: image
                .declared_modules()
                .into_iter()
                .map(str::to_owned)
                .collect(),
        }
    }
}

/// Reads the interop declarations and references of a managed image
pub trait InteropExtractor {
    /// `Ok(None)` if the file is not a CLI assembly at all
    fn extract(&self, path: &Path) -> Result<Option<AssemblyImage>, LookupError>;
}

/// Maps a referenced identity to the file the runtime would load
pub trait AssemblyResolver {
    fn resolve(
        &self,
        identity: &AssemblyIdentity,
        referenced_by: &Path,
    ) -> Result<PathBuf, LookupError>;
}

/// Resolves references by probing the locations Mono loads assemblies from
///
/// Order: the directory of the referencing assembly (and its culture subdirectory),
/// MONO_PATH, the global assembly cache, then the framework directories.
pub struct ProbingResolver {
    mono_path: Vec<PathBuf>,
    gac: Option<PathBuf>,
    framework_dirs: Vec<PathBuf>,
    fs_cache: RefCell<FileSystemCache>,
}

impl ProbingResolver {
    pub fn new(system: &UnixSystem) -> Self {
        Self {
            mono_path: system.mono_path.clone(),
            gac: system.gac_dir(),
            framework_dirs: system.framework_dirs(),
            fs_cache: RefCell::new(FileSystemCache::new()),
        }
    }

    /// Candidate files, most preferred first
    pub fn candidates(&self, identity: &AssemblyIdentity, referenced_by: &Path) -> Vec<PathBuf> {
        let file_names = [
            format!("{}.dll", identity.name),
            format!("{}.exe", identity.name),
        ];
        let mut app_dirs: Vec<PathBuf> = Vec::new();
        if let Some(dir) = referenced_by.parent() {
            if let Some(culture) = &identity.culture {
                app_dirs.push(dir.join(culture));
            }
            app_dirs.push(dir.to_owned());
        }
        app_dirs.extend(self.mono_path.iter().cloned());

        let mut candidates: Vec<PathBuf> = app_dirs
            .iter()
            .flat_map(|d| file_names.iter().map(move |n| d.join(n)))
            .collect();
        if let (Some(gac), Some(relative)) = (&self.gac, identity.gac_path()) {
            candidates.push(gac.join(relative));
        }
        candidates.extend(
            self.framework_dirs
                .iter()
                .map(|d| d.join(&file_names[0])),
        );
        candidates
    }
}

impl AssemblyResolver for ProbingResolver {
    fn resolve(
        &self,
        identity: &AssemblyIdentity,
        referenced_by: &Path,
    ) -> Result<PathBuf, LookupError> {
        for candidate in self.candidates(identity, referenced_by) {
            let (Some(dir), Some(name)) = (candidate.parent(), candidate.file_name()) else {
                continue;
            };
            if let Some(found) = self.fs_cache.borrow_mut().test_file_in_folder(name, dir)? {
                tracing::debug!("{} resolved to {:?}", identity, found);
                return Ok(found);
            }
        }
        Err(LookupError::UnresolvedAssembly {
            identity: identity.full_name(),
            referenced_by: referenced_by.to_owned(),
        })
    }
}
