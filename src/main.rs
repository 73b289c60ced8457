use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

use dirpatch::{codec, Applier, CancelFlag, Config, Patch, PatchStats};

#[derive(Parser)]
#[command(name = "dirpatch", about = "Binary delta creator and applier for directory trees")]
struct Cli {
    /// Log more detail (RUST_LOG overrides)
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a patch by comparing old and new directories
    Create {
        /// Path to the old (original) directory
        #[arg(long)]
        old: PathBuf,
        /// Path to the new (updated) directory
        #[arg(long)]
        new: PathBuf,
        /// Output path for the patch file
        #[arg(long, short)]
        output: PathBuf,
        /// Bytes per comparison block
        #[arg(long, default_value_t = 4096)]
        block_size: usize,
        /// Worker threads
        #[arg(long)]
        jobs: Option<usize>,
    },
    /// Apply a patch, replacing the target directory with the new tree
    Apply {
        /// Path to the target directory to replace
        #[arg(long)]
        target: PathBuf,
        /// Path to the patch file
        #[arg(long, short)]
        patch: PathBuf,
        /// Old tree the patch was created against (defaults to the target)
        #[arg(long)]
        old: Option<PathBuf>,
        /// Worker threads
        #[arg(long)]
        jobs: Option<usize>,
        /// Abandon the run if it has not finished after this many seconds
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Print what a patch contains without applying it
    Inspect {
        /// Path to the patch file
        #[arg(long, short)]
        patch: PathBuf,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "dirpatch=debug" } else { "dirpatch=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn config_for(block_size: usize, jobs: Option<usize>) -> Config {
    let mut config = Config::with_block_size(block_size);
    if let Some(jobs) = jobs {
        config.jobs = jobs;
    }
    config
}

fn read_patch(path: &Path) -> anyhow::Result<Patch> {
    let file = File::open(path).with_context(|| format!("Failed to open patch file: {}", path.display()))?;
    codec::decode(BufReader::with_capacity(256 * 1024, file))
        .with_context(|| format!("Failed to read patch file: {}", path.display()))
}

fn print_stats(stats: &PatchStats) {
    println!("  Paths deleted: {}", stats.deleted_paths);
    println!("  Paths added: {}", stats.extra_paths);
    println!("  Files modified: {}", stats.files_modified);
    println!("  Data operations: {} ({} bytes)", stats.data_ops, stats.literal_bytes);
    println!("  Block ranges: {} ({} bytes reused)", stats.block_ranges, stats.reused_bytes);
    println!("  Symlinks: {}", stats.symlinks);
    if stats.unsupported > 0 {
        println!("  Skipped (unsupported kind): {}", stats.unsupported);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Create {
            old,
            new,
            output,
            block_size,
            jobs,
        } => {
            println!("Creating patch...");
            println!("  Old: {}", old.display());
            println!("  New: {}", new.display());
            println!("  Output: {}", output.display());

            let config = config_for(block_size, jobs);
            let start = Instant::now();
            let patch = tokio::task::spawn_blocking(move || dirpatch::diff(&old, &new, &config))
                .await?
                .context("Failed to diff directories")?;

            let file = File::create(&output)
                .with_context(|| format!("Failed to create output file: {}", output.display()))?;
            codec::encode(&patch, BufWriter::with_capacity(256 * 1024, file))
                .with_context(|| format!("Failed to write patch: {}", output.display()))?;
            let elapsed = start.elapsed();

            println!("\nPatch created successfully!");
            print_stats(&patch.stats());
            println!("  Time elapsed: {:.3}s", elapsed.as_secs_f64());
        }
        Commands::Apply {
            target,
            patch,
            old,
            jobs,
            timeout,
        } => {
            println!("Applying patch...");
            println!("  Target: {}", target.display());
            println!("  Patch: {}", patch.display());

            let start = Instant::now();
            let patch = read_patch(&patch)?;
            let old = old.unwrap_or_else(|| target.clone());
            let config = config_for(patch.block_size, jobs);

            let cancel = CancelFlag::new();
            let mut applier = Applier::new(config).with_cancel_flag(cancel.clone());
            let mut handle =
                tokio::task::spawn_blocking(move || applier.apply(&patch, &old, &target));

            let result = match timeout {
                Some(secs) => match tokio::time::timeout(Duration::from_secs(secs), &mut handle).await {
                    Ok(joined) => joined?,
                    Err(_) => {
                        cancel.cancel();
                        // Wait for the run to discard its staging directory.
                        match handle.await? {
                            Err(dirpatch::Error::Cancelled) => {
                                bail!("Apply did not finish within {secs}s; target left untouched")
                            }
                            finished => finished,
                        }
                    }
                },
                None => handle.await?,
            };
            let summary = result.context("Failed to apply patch")?;
            let elapsed = start.elapsed();

            println!("\nPatch applied successfully!");
            println!("  Directories: {}", summary.dirs_created);
            println!("  Files added: {}", summary.files_added);
            println!("  Files modified: {}", summary.files_modified);
            println!("  Entries carried over: {}", summary.entries_carried);
            println!("  Symlinks created: {}", summary.symlinks_created);
            println!("  Paths deleted: {}", summary.paths_deleted);
            println!("  Time elapsed: {:.3}s", elapsed.as_secs_f64());
        }
        Commands::Inspect { patch: path } => {
            let patch = read_patch(&path)?;
            println!("Patch: {}", path.display());
            println!("  Block size: {}", patch.block_size);
            print_stats(&patch.stats());
            for skipped in &patch.unsupported {
                println!("    skipped: {skipped}");
            }
        }
    }

    Ok(())
}
