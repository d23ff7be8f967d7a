use crate::common::LookupError;
use crate::inventory::Inventory;
use fs_err as fs;
use regex::RegexSet;
use std::path::Path;

/// Files to leave out of the manifest, as regular expressions matched against their paths
///
/// One expression per line; blank lines and lines starting with `#` are ignored.
#[derive(Debug, Clone)]
pub struct Blacklist {
    patterns: RegexSet,
}

impl Blacklist {
    pub fn parse(content: &str) -> Result<Self, LookupError> {
        let patterns = content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'));
        Ok(Self {
            patterns: RegexSet::new(patterns)?,
        })
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, LookupError> {
        Self::parse(&fs::read_to_string(path.as_ref())?)
    }

    pub fn is_blacklisted<P: AsRef<Path>>(&self, path: P) -> bool {
        self.patterns.is_match(&path.as_ref().to_string_lossy())
    }

    /// Drop every blacklisted file from the inventory
    pub fn apply(&self, inventory: &mut Inventory) {
        inventory.retain(|p| {
            let listed = self.is_blacklisted(p);
            if listed {
                tracing::debug!("blacklisted: {:?}", p);
            }
            !listed
        });
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}
