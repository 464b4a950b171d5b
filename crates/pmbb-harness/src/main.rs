#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use pmbb_harness::{FilePlacement, validate_topology_fixture};
use std::env;
use std::fs;
use std::path::Path;

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let cmd = args.first().map(String::as_str);

    match cmd {
        Some("check-fixtures") => {
            let dir = Path::new(args.get(1).map_or("conformance/fixtures", String::as_str));
            check_fixtures(dir)
        }
        Some("--help" | "-h" | "help") | None => {
            print_usage();
            Ok(())
        }
        Some(other) => {
            print_usage();
            bail!("unknown command: {other}")
        }
    }
}

fn check_fixtures(dir: &Path) -> Result<()> {
    let mut paths: Vec<_> = fs::read_dir(dir)
        .with_context(|| format!("failed to read {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
        .collect();
    paths.sort();
    if paths.is_empty() {
        bail!("no fixtures under {}", dir.display());
    }

    for path in &paths {
        let fixture = validate_topology_fixture(path)
            .with_context(|| format!("fixture {}", path.display()))?;
        let placed = match &fixture.file {
            FilePlacement::Namespace(name) => name.as_str(),
            FilePlacement::Region => "region only",
            FilePlacement::Nowhere => "not pmem",
        };
        println!(
            "{}: {} namespace(s), file on {placed}",
            path.display(),
            fixture.namespaces.len()
        );
    }
    Ok(())
}

fn print_usage() {
    println!("pmbb-harness: topology fixture checks");
    println!();
    println!("USAGE:");
    println!("  pmbb-harness check-fixtures [dir]");
    println!();
    println!("Materializes every JSON fixture under [dir] (default conformance/fixtures)");
    println!("into a temporary sysfs tree and checks the data file resolves as placed.");
}
