use crate::assembly::AssemblyRecord;
use indexmap::{IndexMap, IndexSet};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};

/// The four disjoint groups a discovered file may belong to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Managed,
    Native,
    Debug,
    Misc,
}

impl Category {
    pub const ALL: [Category; 4] = [
        Category::Managed,
        Category::Native,
        Category::Debug,
        Category::Misc,
    ];
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Category::Managed => "Managed",
            Category::Native => "Native",
            Category::Debug => "Debug",
            Category::Misc => "Misc",
        })
    }
}

/// Result of a footprint scan: every classified file, in order of discovery, and the
/// assemblies that were loaded
#[derive(Debug, Clone, Default, Serialize)]
pub struct Inventory {
    pub managed: IndexSet<PathBuf>,
    pub native: IndexSet<PathBuf>,
    pub debug: IndexSet<PathBuf>,
    pub misc: IndexSet<PathBuf>,
    /// loaded assemblies, by full name
    pub assemblies: IndexMap<String, AssemblyRecord>,
}

impl Inventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn files(&self, category: Category) -> &IndexSet<PathBuf> {
        match category {
            Category::Managed => &self.managed,
            Category::Native => &self.native,
            Category::Debug => &self.debug,
            Category::Misc => &self.misc,
        }
    }

    fn files_mut(&mut self, category: Category) -> &mut IndexSet<PathBuf> {
        match category {
            Category::Managed => &mut self.managed,
            Category::Native => &mut self.native,
            Category::Debug => &mut self.debug,
            Category::Misc => &mut self.misc,
        }
    }

    /// Category the file was first classified in
    pub fn category_of<P: AsRef<Path>>(&self, path: P) -> Option<Category> {
        Category::ALL
            .into_iter()
            .find(|&c| self.files(c).contains(path.as_ref()))
    }

    /// Classify a file; false if it already belongs to any category
    pub fn add<P: AsRef<Path>>(&mut self, category: Category, path: P) -> bool {
        let path = path.as_ref();
        match self.category_of(path) {
            Some(existing) => {
                if existing != category {
                    tracing::warn!(
                        "{:?} is already classified as {}, not adding it to {}",
                        path,
                        existing,
                        category
                    );
                }
                false
            }
            None => self.files_mut(category).insert(path.to_owned()),
        }
    }

    pub fn has_assembly(&self, full_name: &str) -> bool {
        self.assemblies.contains_key(full_name)
    }

    pub fn assembly_at<P: AsRef<Path>>(&self, location: P) -> Option<&AssemblyRecord> {
        self.assemblies
            .values()
            .find(|a| a.location == location.as_ref())
    }

    /// Register a loaded assembly; its location joins the managed list
    pub fn insert_assembly(&mut self, record: AssemblyRecord) {
        self.add(Category::Managed, &record.location);
        self.assemblies.insert(record.full_name.clone(), record);
    }

    /// Keep only the files for which `keep` holds, in every category
    pub fn retain<F: FnMut(&Path) -> bool>(&mut self, mut keep: F) {
        for category in Category::ALL {
            self.files_mut(category).retain(|p| keep(p));
        }
    }

    pub fn len(&self) -> usize {
        Category::ALL.iter().map(|&c| self.files(c).len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
