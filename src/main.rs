use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, ArgGroup, Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use msu_extrapolate::config::{
    compile_name_filter, compile_package_filter, Config, DEFAULT_NAME_FILTER,
    DEFAULT_OUTPUT_DIR,
};
use msu_extrapolate::container::SevenZip;
use msu_extrapolate::manifest::{ExpressManifest, UpdateManifest};
use msu_extrapolate::records::{BatchSummary, FileOutcome};
use msu_extrapolate::{delta, psf, util, Extrapolator};

#[derive(Parser)]
#[command(
    name = "msu-extrapolate",
    version,
    about = "Rebuild patched Windows binaries from update packages"
)]
struct Cli {
    /// More logging (-v debug, -vv trace); RUST_LOG overrides
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
    /// Keep temporary extraction directories
    #[arg(short, long)]
    keep: bool,
    /// Output directory
    #[arg(short = 'o', long = "out", default_value = DEFAULT_OUTPUT_DIR)]
    out: PathBuf,
    /// 7-Zip executable used to open cabinets
    #[arg(long, env = "MSU_SEVEN_ZIP", default_value = "7z")]
    seven_zip: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply an entire update package (or a directory of them)
    Msu {
        /// MSU/CAB file, or a directory to search for them
        input: PathBuf,
        /// Root directory of base files the deltas apply to
        base_files_dir: Option<PathBuf>,
        /// Which files to rebuild (regex on the file name)
        #[arg(short, long)]
        name: Option<String>,
        /// Which packages to pick up from a directory (regex on the file name)
        #[arg(short = 't', long)]
        filter: Option<String>,
        /// Files to pull out of flat and diff cabinets; repeatable
        #[arg(short, long = "glob")]
        globs: Vec<String>,
        /// Process packages whose KB already appears in the output directory
        #[arg(short, long)]
        force: bool,
        /// Packages processed at once
        #[arg(short, long, default_value_t = 4)]
        jobs: usize,
        /// Compute hashes without writing anything
        #[arg(long)]
        dry_run: bool,
    },
    /// Apply raw patch files to a file or to nothing
    #[command(group(ArgGroup::new("source").required(true).args(["file", "null"])))]
    #[command(group(ArgGroup::new("sink").required(true).args(["output", "dry_run"])))]
    Patch {
        /// File to patch (forward or reverse)
        #[arg(short = 'i', long)]
        file: Option<PathBuf>,
        /// Patch an empty buffer
        #[arg(short, long)]
        null: bool,
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Don't write the result, only report its hash
        #[arg(short, long)]
        dry_run: bool,
        /// Allow PA19 deltas
        #[arg(short, long)]
        legacy: bool,
        /// Patches to apply, in order
        #[arg(required = true)]
        patches: Vec<PathBuf>,
    },
    /// Carve delta files out of an Express PSF blob
    Psf {
        psf_file: PathBuf,
        /// The express.psf.cix.xml describing the blob
        psf_xml: PathBuf,
        /// Which files to extract (regex on the file name)
        regex: Option<String>,
    },
    /// Print a parsed update or Express manifest as JSON
    Inspect {
        xml: PathBuf,
        /// Parse as express.psf.cix.xml
        #[arg(long)]
        express: bool,
    },
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("msu_extrapolate={level}").into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn print_batch(summary: &BatchSummary) {
    for package in &summary.skipped {
        println!("skipped  {}: already extracted", package.display());
    }
    for done in &summary.completed {
        println!(
            "\n{}{}",
            done.msu.display(),
            done.kb
                .as_deref()
                .map(|kb| format!(" ({kb})"))
                .unwrap_or_default()
        );
        for outcome in &done.outcomes {
            println!("  {outcome}");
        }
    }
    for (package, reason) in &summary.aborted {
        println!("aborted  {}: {reason}", package.display());
    }

    let built = summary
        .completed
        .iter()
        .map(|s| {
            s.count(|o| {
                matches!(
                    o,
                    FileOutcome::Built { .. } | FileOutcome::BaseSynthesized { .. }
                )
            })
        })
        .sum::<usize>();
    let failed = summary
        .completed
        .iter()
        .map(|s| s.count(FileOutcome::is_failure))
        .sum::<usize>();
    println!("\nPackages processed: {}", summary.completed.len());
    println!("  Packages skipped: {}", summary.skipped.len());
    println!("  Packages aborted: {}", summary.aborted.len());
    println!("  Files built: {built}");
    println!("  Files failed: {failed}");
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Msu {
            input,
            base_files_dir,
            name,
            filter,
            globs,
            force,
            jobs,
            dry_run,
        } => {
            let mut config = Config::new(&cli.out)?;
            config.base_files_dir = base_files_dir;
            if let Some(name) = name {
                config.name_filter = compile_name_filter(&name)?;
            }
            if let Some(filter) = filter {
                config.package_filter = compile_package_filter(&filter)?;
            }
            if !globs.is_empty() {
                config.extract_globs = globs;
            }
            config.keep_temp_files = cli.keep;
            config.force = force;
            config.dry_run = dry_run;
            config.jobs = jobs;

            if !input.exists() {
                bail!("{} does not exist", input.display());
            }

            let extrapolator = Extrapolator::new(
                config,
                Arc::new(SevenZip::new(cli.seven_zip)),
                delta::default_engine(),
            );
            let start = Instant::now();
            let summary = tokio::task::spawn_blocking(move || extrapolator.process_batch(&input))
                .await
                .context("Extrapolation worker panicked")??;
            print_batch(&summary);
            println!("  Time elapsed: {:.3}s", start.elapsed().as_secs_f64());

            if summary.has_failures() {
                bail!("some packages or files failed");
            }
        }
        Commands::Patch {
            file,
            null,
            output,
            dry_run,
            legacy,
            patches,
        } => {
            let rebuilt = tokio::task::spawn_blocking(move || -> Result<_> {
                let input = match file {
                    Some(file) if !null => Some(
                        util::read_file(&file)
                            .with_context(|| format!("Failed to read {}", file.display()))?,
                    ),
                    _ => None,
                };
                let engine = delta::default_engine();
                let rebuilt =
                    delta::reconstruct(engine.as_ref(), input.as_deref(), &patches, legacy)?;
                if let (Some(output), false) = (&output, dry_run) {
                    std::fs::write(output, &rebuilt.data)
                        .with_context(|| format!("Failed to write {}", output.display()))?;
                }
                Ok((patches.len(), rebuilt))
            })
            .await
            .context("Patch worker panicked")??;

            let (count, rebuilt) = rebuilt;
            println!(
                "Applied {count} patch{} successfully",
                if count > 1 { "es" } else { "" }
            );
            println!("Final hash: {}", rebuilt.sha256);
        }
        Commands::Psf {
            psf_file,
            psf_xml,
            regex,
        } => {
            let name_filter =
                compile_name_filter(regex.as_deref().unwrap_or(DEFAULT_NAME_FILTER))?;
            let manifest = ExpressManifest::parse(&psf_xml)?;
            let records =
                psf::extract_matching(&psf_file, &manifest.entries, &name_filter, &cli.out)?;
            for record in &records {
                println!("{} -> {}", record.entry.file_name, record.path.display());
            }
            println!(
                "\nExtracted {} of {} files",
                records.len(),
                manifest.entries.len()
            );
        }
        Commands::Inspect { xml, express } => {
            let json = if express {
                serde_json::to_string_pretty(&ExpressManifest::parse(&xml)?)?
            } else {
                serde_json::to_string_pretty(&UpdateManifest::parse(&xml)?)?
            };
            println!("{json}");
        }
    }

    Ok(())
}
