//! Sized manifest of an inventory, as printed at the end of a scan

use crate::common::LookupError;
use crate::inventory::{Category, Inventory};
use fs_err as fs;
use serde::Serialize;
use std::fmt::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

const BYTES_PER_MB: f64 = 1_048_576.0;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestEntry {
    pub path: PathBuf,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestSection {
    pub category: Category,
    /// largest first
    pub entries: Vec<ManifestEntry>,
    pub total: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Manifest {
    pub sections: Vec<ManifestSection>,
    pub total: u64,
}

/// Size of a file, or of a copy stripped of debug information if a stripper is given
///
/// Stripped copies go to `scratch`. If stripping fails for any reason, the size of the file
/// itself is reported.
pub fn measured_size(
    path: &Path,
    stripper: Option<&Path>,
    scratch: &Path,
) -> Result<u64, LookupError> {
    if let Some(stripper) = stripper {
        let file_name = path.file_name().unwrap_or(path.as_os_str());
        let stripped = scratch.join(file_name);
        let status = Command::new(stripper)
            .arg("--strip-debug")
            .arg("-o")
            .arg(&stripped)
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        match status {
            Ok(s) if s.success() => {
                if let Ok(metadata) = fs::metadata(&stripped) {
                    if let Err(e) = fs::remove_file(&stripped) {
                        tracing::debug!("could not remove stripped copy: {}", e);
                    }
                    return Ok(metadata.len());
                }
            }
            Ok(s) => tracing::debug!("could not strip {:?}: {}", path, s),
            Err(e) => tracing::warn!("could not run {:?}: {}", stripper, e),
        }
    }
    Ok(fs::metadata(path)?.len())
}

pub fn megabytes(bytes: u64) -> String {
    format!("{:.3}", bytes as f64 / BYTES_PER_MB)
}

impl Manifest {
    /// Measure every file of the inventory
    ///
    /// The debug section is only present if requested. Only native files are stripped.
    pub fn build(
        inventory: &Inventory,
        include_debug: bool,
        stripper: Option<&Path>,
    ) -> Result<Self, LookupError> {
        let scratch = tempfile::tempdir()?;
        let mut sections = Vec::new();
        for category in Category::ALL {
            if category == Category::Debug && !include_debug {
                continue;
            }
            let stripper = stripper.filter(|_| category == Category::Native);
            let mut entries = inventory
                .files(category)
                .iter()
                .map(|p| {
                    Ok(ManifestEntry {
                        size: measured_size(p, stripper, scratch.path())?,
                        path: p.clone(),
                    })
                })
                .collect::<Result<Vec<_>, LookupError>>()?;
            // stable: equal sizes keep the order of discovery
            entries.sort_by(|a, b| b.size.cmp(&a.size));
            sections.push(ManifestSection {
                category,
                total: entries.iter().map(|e| e.size).sum(),
                entries,
            });
        }
        Ok(Self {
            total: sections.iter().map(|s| s.total).sum(),
            sections,
        })
    }

    /// Human readable manifest: one block per category, then the totals
    pub fn render(&self) -> String {
        let width = self
            .sections
            .iter()
            .flat_map(|s| s.entries.iter().map(|e| e.size))
            .chain(std::iter::once(self.total))
            .map(|size| size.to_string().len())
            .max()
            .unwrap_or(1);

        let mut out = String::new();
        for section in &self.sections {
            let _ = writeln!(out, "{} files:", section.category);
            for entry in &section.entries {
                let _ = writeln!(
                    out,
                    "  {:>width$}  {}",
                    entry.size,
                    entry.path.display(),
                    width = width
                );
            }
            out.push('\n');
        }

        out.push_str("Summary:\n");
        let totals = self
            .sections
            .iter()
            .map(|s| (s.category.to_string(), s.total))
            .chain(std::iter::once(("Total".to_owned(), self.total)));
        for (label, bytes) in totals {
            let _ = writeln!(
                out,
                "  {:<8} {:>width$} bytes  {:>10} MB",
                format!("{}:", label),
                bytes,
                megabytes(bytes),
                width = width
            );
        }
        out
    }

    pub fn section(&self, category: Category) -> Option<&ManifestSection> {
        self.sections.iter().find(|s| s.category == category)
    }
}
