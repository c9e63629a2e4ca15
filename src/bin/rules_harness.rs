use std::env;
use std::path::PathBuf;

use anyhow::{anyhow, bail, Result};
use kestrel_rules::harness::{compare_golden, load_fixture, run_fixture, write_report};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();
    if let Err(err) = run_cli() {
        eprintln!("[rules-harness] error: {err:?}");
        std::process::exit(1);
    }
}

fn run_cli() -> Result<()> {
    let opts = parse_args()?;
    let fixture = load_fixture(&opts.fixture)?;
    let report = run_fixture(&fixture)?;
    for mismatch in &report.mismatches {
        tracing::warn!("{mismatch}");
    }

    if let Some(path) = &opts.write_output {
        write_report(&report, path)?;
        println!("[rules-harness] wrote {}", path.display());
    }

    if let Some(path) = &opts.check_golden {
        let differences = compare_golden(&report, path)?;
        if !differences.is_empty() {
            bail!(
                "{} differs from golden {} (use --write-output to refresh):\n{}",
                opts.fixture.display(),
                path.display(),
                differences.join("\n")
            );
        }
        println!("[rules-harness] matched golden {}", path.display());
    } else if opts.write_output.is_none() {
        serde_json::to_writer_pretty(std::io::stdout(), &report)?;
        println!();
    }

    if !report.mismatches.is_empty() {
        bail!("{} expectation(s) failed in {}", report.mismatches.len(), opts.fixture.display());
    }
    Ok(())
}

struct CliOptions {
    fixture: PathBuf,
    write_output: Option<PathBuf>,
    check_golden: Option<PathBuf>,
}

fn parse_args() -> Result<CliOptions> {
    let mut fixture = None;
    let mut write_output = None;
    let mut check_golden = None;
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--fixture" | "-f" => fixture = args.next().map(PathBuf::from),
            "--write-output" | "-o" => write_output = args.next().map(PathBuf::from),
            "--golden" | "-g" => check_golden = args.next().map(PathBuf::from),
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            other if !other.starts_with('-') && fixture.is_none() => fixture = Some(PathBuf::from(other)),
            other => return Err(anyhow!("unknown argument '{other}'")),
        }
    }
    let Some(fixture) = fixture else { return Err(anyhow!("--fixture <path> is required")) };
    Ok(CliOptions { fixture, write_output, check_golden })
}

fn print_help() {
    println!("Usage: rules_harness [--fixture] <path> [--golden <path>] [--write-output <path>]");
    println!("  -f, --fixture        Path to a rules fixture JSON file");
    println!("  -g, --golden         Optional golden report to compare against");
    println!("  -o, --write-output   Optional path to write the actual report JSON");
}
