//! Invocation of the external link inspector (ldd) and parsing of its report

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Lists the native dependencies of a binary
///
/// `None` means the file can't be inspected this way: it is not a dynamically linked binary,
/// or the tool itself could not be run.
pub trait LinkInspector {
    fn inspect(&self, file: &Path) -> Option<String>;
}

/// Runs an ldd-compatible program and captures its standard output
#[derive(Debug, Clone)]
pub struct LddInspector {
    program: PathBuf,
}

impl LddInspector {
    pub fn new<P: AsRef<Path>>(program: P) -> Self {
        Self {
            program: program.as_ref().to_owned(),
        }
    }
}

impl Default for LddInspector {
    fn default() -> Self {
        Self::new(crate::query::DEFAULT_INSPECTOR)
    }
}

impl LinkInspector for LddInspector {
    fn inspect(&self, file: &Path) -> Option<String> {
        let output = Command::new(&self.program)
            .arg(file)
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output();
        match output {
            Ok(output) if output.status.success() => {
                Some(String::from_utf8_lossy(&output.stdout).into_owned())
            }
            Ok(output) => {
                tracing::trace!("{:?} rejected {:?} ({})", self.program, file, output.status);
                None
            }
            Err(e) => {
                tracing::warn!("could not run {:?} on {:?}: {}", self.program, file, e);
                None
            }
        }
    }
}

/// Extract the dependency path from one line of ldd output
///
/// ```text
///     libm.so.6 => /lib/x86_64-linux-gnu/libm.so.6 (0x00007f...)   -> /lib/x86_64-linux-gnu/libm.so.6
///     /lib64/ld-linux-x86-64.so.2 (0x00007f...)                   -> /lib64/ld-linux-x86-64.so.2
///     linux-vdso.so.1 (0x00007ffd...)                             -> linux-vdso.so.1
///     libfoo.so => not found                                      -> (none)
/// ```
///
/// The result may still be relative (virtual objects); deciding what to do with it is up to
/// the caller.
pub fn parse_ldd_line(line: &str) -> Option<&str> {
    let (before_address, _) = line.split_once('(')?;
    let path = match before_address.split_once(" => ") {
        Some((_, resolved)) => resolved,
        None => before_address,
    };
    let path = path.trim();
    if path.is_empty() {
        None
    } else {
        Some(path)
    }
}

/// Dependency paths listed in a full ldd report, in order
pub fn parse_ldd_output(output: &str) -> Vec<PathBuf> {
    output
        .lines()
        .filter_map(parse_ldd_line)
        .map(PathBuf::from)
        .collect()
}
