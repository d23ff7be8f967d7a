use crate::assembly::{
    AssemblyIdentity, AssemblyImage, AssemblyRecord, AssemblyResolver, InteropExtractor,
    ProbingResolver,
};
use crate::common::{absolute_path, is_hidden, LookupError};
use crate::dllmap::DllMapResolver;
use crate::inventory::{Category, Inventory};
use crate::ldd::{parse_ldd_output, LddInspector, LinkInspector};
use crate::lookup_path::LookupPath;
use crate::pe::PeInteropExtractor;
use crate::query::LookupQuery;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Dependencies of a native file still to be registered, and the file that reported them
type LinkFrame = (PathBuf, std::vec::IntoIter<PathBuf>);

/// Computes the deployment footprint of the roots in a query
///
/// Owns everything a scan accumulates: the classified files, the loaded assemblies and the
/// set of files already handed to the link inspector. One runner performs one scan.
pub struct Runner {
    query: LookupQuery,
    lookup_path: LookupPath,
    dllmap: DllMapResolver,
    inspector: Box<dyn LinkInspector>,
    extractor: Box<dyn InteropExtractor>,
    resolver: Box<dyn AssemblyResolver>,
    inventory: Inventory,
    visited: HashSet<PathBuf>,
}

impl Runner {
    pub fn new(query: &LookupQuery) -> Result<Self, LookupError> {
        let lookup_path = LookupPath::deduce(query)?;
        Ok(Self::with_lookup_path(query, lookup_path))
    }

    pub fn with_lookup_path(query: &LookupQuery, lookup_path: LookupPath) -> Self {
        Self {
            lookup_path,
            dllmap: DllMapResolver::new(&query.system.global_dllmap),
            inspector: Box::new(LddInspector::new(&query.parameters.inspector)),
            extractor: Box::new(PeInteropExtractor),
            resolver: Box::new(ProbingResolver::new(&query.system)),
            query: query.clone(),
            inventory: Inventory::new(),
            visited: HashSet::new(),
        }
    }

    pub fn with_inspector(mut self, inspector: Box<dyn LinkInspector>) -> Self {
        self.inspector = inspector;
        self
    }

    pub fn with_extractor(mut self, extractor: Box<dyn InteropExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn with_resolver(mut self, resolver: Box<dyn AssemblyResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn run(mut self) -> Result<Inventory, LookupError> {
        tracing::debug!("search path: {:?}", self.lookup_path.search_path());
        for root in self.query.target.roots.clone() {
            tracing::info!("scanning {:?}", root);
            self.walk(&root)?;
        }

        if !self.inventory.assemblies.is_empty() {
            if let Some(runtime) = self.query.target.runtime.clone() {
                tracing::info!("adding runtime {:?}", runtime);
                self.walk(&absolute_path(runtime)?)?;
            }
        }
        Ok(self.inventory)
    }

    /// Process a root: a single file, or every file below a directory
    ///
    /// Subdirectories come before the files next to them; hidden entries are skipped.
    pub fn walk(&mut self, root: &Path) -> Result<(), LookupError> {
        if !root.exists() {
            tracing::warn!("{:?} does not exist, skipping it", root);
            return Ok(());
        }
        if !root.is_dir() {
            return self.process_file(root);
        }

        let walker = WalkDir::new(root)
            .sort_by(|a, b| {
                b.file_type()
                    .is_dir()
                    .cmp(&a.file_type().is_dir())
                    .then_with(|| a.file_name().cmp(b.file_name()))
            })
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_hidden(e.file_name()));
        for entry in walker {
            let entry = entry.map_err(std::io::Error::from)?;
            // symlinks to files count, symlinks to directories are not followed
            if !entry.file_type().is_dir() && entry.path().is_file() {
                self.process_file(entry.path())?;
            }
        }
        Ok(())
    }

    /// Classify one file by its extension
    fn process_file(&mut self, path: &Path) -> Result<(), LookupError> {
        if is_hidden(path) {
            return Ok(());
        }
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        match extension.as_deref() {
            Some("dll") | Some("exe") => {
                if !self.load_assembly(path)? {
                    tracing::debug!("{:?} is not a managed assembly", path);
                    self.classify_native_or_misc(path)?;
                }
            }
            Some("mdb") => {
                if self.query.parameters.include_debug {
                    self.inventory.add(Category::Debug, path);
                }
            }
            // portable pdb files are also debug symbols, but otherwise an ordinary file
            Some("pdb") if self.query.parameters.include_debug => {
                self.inventory.add(Category::Debug, path);
            }
            Some("la") | Some("a") => {}
            _ => self.classify_native_or_misc(path)?,
        }
        Ok(())
    }

    fn classify_native_or_misc(&mut self, path: &Path) -> Result<(), LookupError> {
        if !self.visit(path)? {
            self.inventory.add(Category::Misc, path);
        }
        Ok(())
    }

    /// Load a managed assembly and everything it references
    ///
    /// Returns false if the file is not an assembly.
    pub fn load_assembly(&mut self, path: &Path) -> Result<bool, LookupError> {
        if self.inventory.assembly_at(path).is_some() {
            return Ok(true);
        }
        let Some(image) = self.extractor.extract(path)? else {
            return Ok(false);
        };
        // a second copy of a loaded assembly is still part of the footprint
        self.inventory.add(Category::Managed, path);
        self.load_closure(path.to_owned(), image)?;
        Ok(true)
    }

    /// Register an image, then every assembly reachable through its references, depth first
    fn load_closure(&mut self, location: PathBuf, image: AssemblyImage) -> Result<(), LookupError> {
        let mut references: Vec<(AssemblyIdentity, PathBuf)> = Vec::new();
        let mut next = Some((location, image));
        loop {
            if let Some((location, image)) = next.take() {
                if self.register_assembly(&location, &image)? {
                    references.extend(
                        image
                            .references
                            .into_iter()
                            .rev()
                            .map(|r| (r, location.clone())),
                    );
                }
            }

            let Some((identity, referenced_by)) = references.pop() else {
                return Ok(());
            };
            if self.inventory.has_assembly(&identity.full_name()) {
                continue;
            }
            let resolved = absolute_path(self.resolver.resolve(&identity, &referenced_by)?)?;
            if self.inventory.assembly_at(&resolved).is_some() {
                continue;
            }
            match self.extractor.extract(&resolved)? {
                Some(image) => next = Some((resolved, image)),
                None => return Err(LookupError::NotAnAssembly(resolved)),
            }
        }
    }

    /// Record an assembly and walk the native libraries its P/Invoke methods bind to
    ///
    /// False if an assembly with the same identity was already loaded.
    fn register_assembly(
        &mut self,
        location: &Path,
        image: &AssemblyImage,
    ) -> Result<bool, LookupError> {
        let record = AssemblyRecord::new(image, location.to_owned());
        if self.inventory.has_assembly(&record.full_name) {
            tracing::debug!("{} is already loaded", record.full_name);
            return Ok(false);
        }
        tracing::info!("loading {} from {:?}", record.full_name, location);
        self.inventory.insert_assembly(record);

        for module in image.declared_modules() {
            match self.locate_native_library(location, module)? {
                Some(library) => self.register_native(&library, location)?,
                None => tracing::debug!("{} (used by {:?}) not found", module, location),
            }
        }
        Ok(true)
    }

    /// File the runtime would load for a module named in a P/Invoke declaration of `assembly`
    pub fn locate_native_library(
        &mut self,
        assembly: &Path,
        module: &str,
    ) -> Result<Option<PathBuf>, LookupError> {
        let resolved = self.dllmap.resolve(assembly, module)?;
        let resolved_path = Path::new(&resolved);
        if resolved_path.is_absolute() {
            return Ok(resolved_path.is_file().then(|| resolved_path.to_owned()));
        }
        match self.lookup_path.search_library(&resolved)? {
            Some(found) => {
                tracing::debug!("{} found in {:?}", resolved, found.location);
                Ok(Some(absolute_path(found.fullpath)?))
            }
            None => Ok(None),
        }
    }

    /// Walk the link graph of a file given as input
    ///
    /// True if the file is a native binary. A file is handed to the link inspector only once;
    /// later visits report whether it ended up among the native files.
    pub fn visit(&mut self, file: &Path) -> Result<bool, LookupError> {
        if self.visited.contains(file) {
            return Ok(self.inventory.native.contains(file));
        }
        let Some(dependencies) = self.inspect(file) else {
            return Ok(false);
        };
        self.inventory.add(Category::Native, file);
        self.walk_link_graph(vec![(file.to_owned(), dependencies.into_iter())])?;
        Ok(true)
    }

    /// Add a library to the native files and walk its dependencies
    fn register_native(&mut self, library: &Path, dependent: &Path) -> Result<(), LookupError> {
        self.walk_link_graph(vec![(dependent.to_owned(), vec![library.to_owned()].into_iter())])
    }

    fn inspect(&mut self, file: &Path) -> Option<Vec<PathBuf>> {
        self.visited.insert(file.to_owned());
        let report = self.inspector.inspect(file)?;
        Some(parse_ldd_output(&report))
    }

    /// Register dependencies depth first: a newly found library is inspected, and its own
    /// dependencies registered, before the next sibling
    fn walk_link_graph(&mut self, mut stack: Vec<LinkFrame>) -> Result<(), LookupError> {
        loop {
            let Some((dependent, dependencies)) = stack.last_mut() else {
                return Ok(());
            };
            let Some(dependency) = dependencies.next() else {
                stack.pop();
                continue;
            };
            let dependent = dependent.clone();
            if !self.admit_native(&dependency, &dependent)? {
                continue;
            }
            if self.visited.contains(&dependency) {
                continue;
            }
            if let Some(next) = self.inspect(&dependency) {
                stack.push((dependency, next.into_iter()));
            }
        }
    }

    /// Add a reported dependency to the native files; false if it is rejected
    ///
    /// Relative or empty paths (virtual objects) and already known files are rejected.
    /// An absolute path that does not exist is an error: the system doesn't match what the
    /// link inspector sees.
    fn admit_native(&mut self, dependency: &Path, dependent: &Path) -> Result<bool, LookupError> {
        if !dependency.is_absolute() {
            tracing::trace!("ignoring {:?} reported for {:?}", dependency, dependent);
            return Ok(false);
        }
        if !dependency.exists() {
            return Err(LookupError::InconsistentEnvironment {
                dependent: dependent.to_owned(),
                dependency: dependency.to_owned(),
            });
        }
        Ok(self.inventory.add(Category::Native, dependency))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::assembly::AssemblyVersion;
    use crate::lookup_path::LookupPathEntry;
    use crate::system::UnixSystem;
    use fs_err as fs;
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::rc::Rc;

    #[derive(Default)]
    pub(crate) struct FakeInspector {
        pub reports: HashMap<PathBuf, String>,
        pub calls: Rc<RefCell<Vec<PathBuf>>>,
    }

    impl LinkInspector for FakeInspector {
        fn inspect(&self, file: &Path) -> Option<String> {
            self.calls.borrow_mut().push(file.to_owned());
            self.reports.get(file).cloned()
        }
    }

    #[derive(Default)]
    pub(crate) struct FakeExtractor {
        pub images: HashMap<PathBuf, AssemblyImage>,
    }

    impl InteropExtractor for FakeExtractor {
        fn extract(&self, path: &Path) -> Result<Option<AssemblyImage>, LookupError> {
            Ok(self.images.get(path).cloned())
        }
    }

    #[derive(Default)]
    struct FakeResolver {
        locations: HashMap<String, PathBuf>,
    }

    impl AssemblyResolver for FakeResolver {
        fn resolve(
            &self,
            identity: &AssemblyIdentity,
            referenced_by: &Path,
        ) -> Result<PathBuf, LookupError> {
            self.locations
                .get(&identity.name)
                .cloned()
                .ok_or_else(|| LookupError::UnresolvedAssembly {
                    identity: identity.full_name(),
                    referenced_by: referenced_by.to_owned(),
                })
        }
    }

    fn identity(name: &str) -> AssemblyIdentity {
        AssemblyIdentity {
            name: name.to_owned(),
            version: AssemblyVersion::new(1, 0, 0, 0),
            culture: None,
            public_key_token: None,
        }
    }

    pub(crate) fn image(name: &str, modules: &[&str], references: &[&str]) -> AssemblyImage {
        AssemblyImage {
            identity: identity(name),
            pinvoke_modules: modules.iter().map(|m| m.to_string()).collect(),
            references: references.iter().map(|r| identity(r)).collect(),
        }
    }

    /// Application directory with one assembly binding to `m`, its debug file and a data
    /// file, plus a library directory where `libm.so` depends on `libc.so.6`, which depends on
    /// the static `ld.so`
    struct Fixture {
        tmp: tempfile::TempDir,
        app: PathBuf,
        lib: PathBuf,
        framework: PathBuf,
        inspector: FakeInspector,
        extractor: FakeExtractor,
        resolver: FakeResolver,
    }

    impl Fixture {
        fn new() -> Result<Self, LookupError> {
            let tmp = tempfile::tempdir()?;
            let app = tmp.path().join("app");
            let lib = tmp.path().join("lib");
            let framework = tmp.path().join("framework");
            for d in [&app, &lib, &framework] {
                fs::create_dir_all(d)?;
            }
            fs::write(app.join("App.exe"), b"MZ")?;
            fs::write(app.join("App.exe.mdb"), b"debug")?;
            fs::write(app.join("data.bin"), b"")?;
            fs::write(app.join(".hidden"), b"")?;
            fs::write(lib.join("libm.so"), b"\x7fELF m")?;
            fs::write(lib.join("libc.so.6"), b"\x7fELF c")?;
            fs::write(lib.join("ld.so"), b"\x7fELF ld")?;
            fs::write(framework.join("mscorlib.dll"), b"MZ")?;

            let mut inspector = FakeInspector::default();
            inspector.reports.insert(
                lib.join("libm.so"),
                format!(
                    "\tlinux-vdso.so.1 (0x00007ffc)\n\tlibc.so.6 => {} (0x00007f3c)\n",
                    lib.join("libc.so.6").display()
                ),
            );
            inspector.reports.insert(
                lib.join("libc.so.6"),
                format!("\t{} (0x00007f3d)\n", lib.join("ld.so").display()),
            );

            let mut extractor = FakeExtractor::default();
            extractor
                .images
                .insert(app.join("App.exe"), image("App", &["m", "m"], &["mscorlib"]));
            extractor.images.insert(
                framework.join("mscorlib.dll"),
                image("mscorlib", &["libc.so.6", "__Internal"], &[]),
            );

            let mut resolver = FakeResolver::default();
            resolver
                .locations
                .insert("mscorlib".to_owned(), framework.join("mscorlib.dll"));

            Ok(Self {
                tmp,
                app,
                lib,
                framework,
                inspector,
                extractor,
                resolver,
            })
        }

        fn query<P: AsRef<Path>>(&self, roots: &[P]) -> Result<LookupQuery, LookupError> {
            LookupQuery::with_system(roots, UnixSystem::from_root(self.tmp.path()))
        }

        /// Runner using the fakes; the fixture keeps the files alive
        fn runner(&mut self, query: &LookupQuery) -> Runner {
            let lookup_path =
                LookupPath::new(vec![LookupPathEntry::LibraryPath(self.lib.clone())]);
            Runner::with_lookup_path(query, lookup_path)
                .with_inspector(Box::new(std::mem::take(&mut self.inspector)))
                .with_extractor(Box::new(std::mem::take(&mut self.extractor)))
                .with_resolver(Box::new(std::mem::take(&mut self.resolver)))
        }
    }

    #[test]
    fn application_closure() -> Result<(), LookupError> {
        let mut fixture = Fixture::new()?;
        let (app, lib, framework) = (
            fixture.app.clone(),
            fixture.lib.clone(),
            fixture.framework.clone(),
        );
        let calls = fixture.inspector.calls.clone();
        let query = fixture.query(&[&app])?;
        let inventory = fixture.runner(&query).run()?;

        assert_eq!(
            inventory.managed.iter().cloned().collect::<Vec<_>>(),
            vec![app.join("App.exe"), framework.join("mscorlib.dll")]
        );
        assert_eq!(
            inventory.native.iter().cloned().collect::<Vec<_>>(),
            vec![lib.join("libm.so"), lib.join("libc.so.6"), lib.join("ld.so")]
        );
        assert_eq!(
            inventory.misc.iter().cloned().collect::<Vec<_>>(),
            vec![app.join("data.bin")]
        );
        assert!(inventory.debug.is_empty());
        assert_eq!(inventory.assemblies.len(), 2);
        assert_eq!(
            inventory.assemblies[0].native_modules.iter().collect::<Vec<_>>(),
            vec!["m"]
        );
        assert_eq!(
            *calls.borrow(),
            vec![
                lib.join("libm.so"),
                lib.join("libc.so.6"),
                lib.join("ld.so"),
                app.join("data.bin")
            ]
        );
        Ok(())
    }

    #[test]
    fn debug_files_on_request() -> Result<(), LookupError> {
        let mut fixture = Fixture::new()?;
        let app = fixture.app.clone();
        let mut query = fixture.query(&[&app])?;
        query.parameters.include_debug = true;
        let inventory = fixture.runner(&query).run()?;
        assert_eq!(
            inventory.debug.iter().cloned().collect::<Vec<_>>(),
            vec![app.join("App.exe.mdb")]
        );
        Ok(())
    }

    #[test]
    fn pdb_is_misc_without_debug() -> Result<(), LookupError> {
        let mut fixture = Fixture::new()?;
        let app = fixture.app.clone();
        fs::write(app.join("App.pdb"), b"BSJB")?;
        let query = fixture.query(&[&app])?;
        let inventory = fixture.runner(&query).run()?;
        assert!(inventory.debug.is_empty());
        assert_eq!(inventory.category_of(app.join("App.pdb")), Some(Category::Misc));
        assert_eq!(inventory.category_of(app.join("App.exe.mdb")), None);

        let mut fixture = Fixture::new()?;
        let app = fixture.app.clone();
        fs::write(app.join("App.pdb"), b"BSJB")?;
        let mut query = fixture.query(&[&app])?;
        query.parameters.include_debug = true;
        let inventory = fixture.runner(&query).run()?;
        assert_eq!(
            inventory.debug.iter().cloned().collect::<Vec<_>>(),
            vec![app.join("App.exe.mdb"), app.join("App.pdb")]
        );
        Ok(())
    }

    #[test]
    fn each_file_inspected_once() -> Result<(), LookupError> {
        let mut fixture = Fixture::new()?;
        let (app, lib) = (fixture.app.clone(), fixture.lib.clone());
        let calls = fixture.inspector.calls.clone();
        // the library directory is a root too, and the application is given twice
        let query = fixture.query(&[&app, &lib, &app.join("App.exe")])?;
        let inventory = fixture.runner(&query).run()?;

        let mut inspected = calls.borrow().clone();
        let count = inspected.len();
        inspected.sort();
        inspected.dedup();
        assert_eq!(inspected.len(), count);
        assert_eq!(inventory.native.len(), 3);
        assert_eq!(inventory.managed.len(), 2);
        assert_eq!(inventory.assemblies.len(), 2);
        // walked as roots, already known as native
        assert!(inventory.misc.iter().all(|p| !p.starts_with(&lib)));
        Ok(())
    }

    #[test]
    fn missing_dependency_is_fatal() -> Result<(), LookupError> {
        let mut fixture = Fixture::new()?;
        let lib = fixture.lib.clone();
        fixture.inspector.reports.insert(
            lib.join("ld.so"),
            "\tlibz.so.1 => /nonexistent/libz.so.1 (0x00007f3e)\n".to_owned(),
        );
        let app = fixture.app.clone();
        let query = fixture.query(&[&app])?;
        match fixture.runner(&query).run() {
            Err(LookupError::InconsistentEnvironment {
                dependent,
                dependency,
            }) => {
                assert_eq!(dependent, lib.join("ld.so"));
                assert_eq!(dependency, PathBuf::from("/nonexistent/libz.so.1"));
            }
            other => panic!("unexpected result {:?}", other.map(|i| i.len())),
        }
        Ok(())
    }

    #[test]
    fn unresolved_reference_is_fatal() -> Result<(), LookupError> {
        let mut fixture = Fixture::new()?;
        fixture.resolver.locations.clear();
        let app = fixture.app.clone();
        let query = fixture.query(&[&app])?;
        assert!(matches!(
            fixture.runner(&query).run(),
            Err(LookupError::UnresolvedAssembly { .. })
        ));
        Ok(())
    }

    #[test]
    fn runtime_only_with_assemblies() -> Result<(), LookupError> {
        let mut fixture = Fixture::new()?;
        let runtime = fixture.tmp.path().join("mono");
        fs::write(&runtime, b"\x7fELF mono")?;
        let (app, lib) = (fixture.app.clone(), fixture.lib.clone());
        fixture.inspector.reports.insert(
            runtime.clone(),
            format!("\tlibm.so => {} (0x1)\n", lib.join("libm.so").display()),
        );
        let calls = fixture.inspector.calls.clone();
        let mut query = fixture.query(&[&app])?;
        query.target.runtime = Some(runtime.clone());
        let inventory = fixture.runner(&query).run()?;
        assert_eq!(inventory.native.last(), Some(&runtime));
        assert!(calls.borrow().contains(&runtime));

        let mut fixture = Fixture::new()?;
        let calls = fixture.inspector.calls.clone();
        let mut query = fixture.query(&[&fixture.app.join("data.bin")])?;
        query.target.runtime = Some(runtime.clone());
        let inventory = fixture.runner(&query).run()?;
        assert!(inventory.assemblies.is_empty());
        assert!(!calls.borrow().contains(&runtime));
        Ok(())
    }

    #[test]
    fn unknown_files_are_misc() -> Result<(), LookupError> {
        let mut fixture = Fixture::new()?;
        let app = fixture.app.clone();
        fs::write(app.join("Plain.dll"), b"")?;
        fs::write(app.join("libstatic.a"), b"!<arch>")?;
        let query = fixture.query(&[&app])?;
        let inventory = fixture.runner(&query).run()?;
        // not an assembly and not linked: misc, not native
        assert!(inventory.misc.contains(&app.join("Plain.dll")));
        assert!(inventory.misc.contains(&app.join("data.bin")));
        assert_eq!(inventory.category_of(app.join("libstatic.a")), None);
        assert_eq!(inventory.category_of(app.join(".hidden")), None);
        Ok(())
    }

    #[test]
    fn dllmap_redirects_module() -> Result<(), LookupError> {
        let mut fixture = Fixture::new()?;
        let (app, lib) = (fixture.app.clone(), fixture.lib.clone());
        fs::write(
            app.join("App.exe.config"),
            r#"<configuration><dllmap dll="mathlib" target="libm.so"/></configuration>"#,
        )?;
        fixture
            .extractor
            .images
            .insert(app.join("App.exe"), image("App", &["mathlib"], &[]));
        let query = fixture.query(&[&app.join("App.exe")])?;
        let inventory = fixture.runner(&query).run()?;
        assert_eq!(inventory.native.first(), Some(&lib.join("libm.so")));
        Ok(())
    }
}
