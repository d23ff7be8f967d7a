use anyhow::Context;
use clap::{ArgAction, Parser};
use footprint_runner::assembly::AssemblyRecord;
use footprint_runner::blacklist::Blacklist;
use footprint_runner::query::{LookupQuery, DEFAULT_INSPECTOR, DEFAULT_STRIPPER};
use footprint_runner::system::{split_path_list, UnixSystem};
use footprint_runner::Manifest;
use fs_err as fs;
use serde::Serialize;
use std::ffi::OsString;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fprun")]
#[command(
    author,
    version,
    about = "Deployment footprint of Mono applications: assemblies, native libraries and everything else"
)]
struct Cli {
    /// Files and directories to inventory
    #[arg(required = true)]
    roots: Vec<PathBuf>,

    /// Runtime binary added to the inventory when assemblies are found (default: mono on the PATH)
    #[arg(long)]
    runtime: Option<PathBuf>,

    /// Include debug symbol files (.mdb, .pdb)
    #[arg(short, long)]
    debug: bool,

    /// Report the size of native files as if stripped of debug information
    #[arg(short, long)]
    strip: bool,

    /// Program used to strip native files
    #[arg(long, default_value = DEFAULT_STRIPPER)]
    stripper: PathBuf,

    /// Program listing the shared library dependencies of a binary
    #[arg(long, default_value = DEFAULT_INSPECTOR)]
    inspector: PathBuf,

    /// File of regular expressions; matching paths are left out of the manifest
    #[arg(short, long)]
    blacklist: Option<PathBuf>,

    /// Colon-separated library search path, instead of LD_LIBRARY_PATH
    #[arg(long)]
    library_path: Option<OsString>,

    /// Dynamic linker configuration (default: /etc/ld.so.conf)
    #[arg(long)]
    ld_conf: Option<PathBuf>,

    /// Mono configuration holding the global dllmap entries (default: /etc/mono/config)
    #[arg(long)]
    global_config: Option<PathBuf>,

    /// Root of the system image the application is deployed on
    #[arg(long)]
    sysroot: Option<PathBuf>,

    /// Path for output in JSON format
    #[arg(short = 'j', long)]
    output_json_path: Option<PathBuf>,

    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

#[derive(Serialize)]
struct JsonReport<'a> {
    manifest: &'a Manifest,
    assemblies: Vec<&'a AssemblyRecord>,
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn build_query(cli: &Cli) -> anyhow::Result<LookupQuery> {
    let mut query = LookupQuery::deduce_from_roots(&cli.roots)?;

    // overrides (must be last)
    if let Some(sysroot) = &cli.sysroot {
        query.system = UnixSystem::from_root(sysroot);
        // the host's mono is not part of the image
        let image_runtime = sysroot.join("usr/bin/mono");
        query.target.runtime = image_runtime.is_file().then_some(image_runtime);
    }
    if let Some(library_path) = &cli.library_path {
        query.system.library_path = Some(split_path_list(library_path));
    }
    if let Some(ld_conf) = &cli.ld_conf {
        query.system.linker_config = ld_conf.clone();
    }
    if let Some(global_config) = &cli.global_config {
        query.system.global_dllmap = global_config.clone();
    }
    if cli.runtime.is_some() {
        query.target.runtime = cli.runtime.clone();
    }
    query.parameters.include_debug = cli.debug;
    query.parameters.inspector = cli.inspector.clone();
    query.parameters.stripper = cli.strip.then(|| cli.stripper.clone());
    Ok(query)
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let query = build_query(&cli)?;
    tracing::debug!("{:?}", query);

    let mut inventory = footprint_runner::lookup(&query).context("Footprint scan failed")?;

    if let Some(blacklist_path) = &cli.blacklist {
        let blacklist = Blacklist::from_file(blacklist_path)
            .with_context(|| format!("couldn't read blacklist {}", blacklist_path.display()))?;
        blacklist.apply(&mut inventory);
    }

    let manifest = Manifest::build(
        &inventory,
        query.parameters.include_debug,
        query.parameters.stripper.as_deref(),
    )?;
    print!("{}", manifest.render());

    if let Some(json_output_path) = &cli.output_json_path {
        let report = JsonReport {
            manifest: &manifest,
            assemblies: inventory.assemblies.values().collect(),
        };
        let js = serde_json::to_string_pretty(&report).context("Error serializing")?;
        let shown = json_output_path.display();
        fs::write(json_output_path, js).with_context(|| format!("couldn't write to {}", shown))?;
        tracing::info!("successfully wrote to {}", shown);
    }

    Ok(())
}
