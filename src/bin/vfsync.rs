//! vfsync CLI - differential sync of directory trees.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use vfsync::session::{source_list, sync_round};
use vfsync::{
    block_checksums, compare_contents, filter_synced, generate_checksums, patch, resolve, roll,
    ChecksumTree, ConflictResolver, ConnectionId, ContentHash, DiffSegment, DiffStats, DiskFs,
    SyncConfig, SyncError, SyncId, SyncSession,
};

/// vfsync - rsync-style sync of virtual filesystem trees
#[derive(Parser)]
#[command(name = "vfsync")]
#[command(version)]
#[command(about = "rsync-style differential sync of directory trees")]
#[command(long_about = None)]
struct Cli {
    /// Directory holding vfsync.toml (default: current directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the configured block size
    #[arg(short, long, global = true)]
    block_size: Option<usize>,

    /// Show debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the checksum tree of paths under a directory as JSON
    Checksums {
        /// Directory acting as the filesystem root
        #[arg(required = true)]
        dir: PathBuf,

        /// Virtual paths to checksum (default: everything under /)
        paths: Vec<String>,

        /// Write the tree here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Check a saved checksum tree against a directory
    Compare {
        /// Directory acting as the filesystem root
        #[arg(required = true)]
        dir: PathBuf,

        /// Checksum tree produced by `checksums`
        #[arg(required = true)]
        tree: PathBuf,
    },

    /// Diff a file against the blocks of an older version
    Diff {
        /// Older version (what the receiver has)
        #[arg(required = true)]
        basis: PathBuf,

        /// Newer version
        #[arg(required = true)]
        source: PathBuf,

        /// Output diff file (default: <source>.diff.json)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Rebuild a file from an older version and a diff
    Patch {
        /// Older version
        #[arg(required = true)]
        basis: PathBuf,

        /// Diff produced by `diff`
        #[arg(required = true)]
        diff: PathBuf,

        /// Output file (default: overwrite basis)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print the root that covers a burst of changed paths
    Resolve {
        /// Changed paths
        #[arg(required = true)]
        paths: Vec<String>,

        /// Paths already synced; print what is left instead
        #[arg(long, num_args = 1..)]
        synced: Vec<String>,
    },

    /// Manage conflicted copies
    Conflict {
        #[command(subcommand)]
        action: ConflictAction,
    },

    /// Run one sync round from a client directory to a server directory
    Sync {
        /// Client directory
        #[arg(required = true)]
        client: PathBuf,

        /// Server directory
        #[arg(required = true)]
        server: PathBuf,

        /// Virtual root to sync
        #[arg(short, long, default_value = "/")]
        root: String,
    },
}

#[derive(Subcommand)]
enum ConflictAction {
    /// Preserve a file as a conflicted copy
    Mark {
        /// Directory acting as the filesystem root
        dir: PathBuf,
        /// Virtual path of the file
        path: String,
    },
    /// Report whether a file is a conflicted copy
    Check {
        /// Directory acting as the filesystem root
        dir: PathBuf,
        /// Virtual path of the file
        path: String,
    },
    /// Clear the conflict marker
    Clear {
        /// Directory acting as the filesystem root
        dir: PathBuf,
        /// Virtual path of the file
        path: String,
    },
}

/// Single-file diff as written by `diff` and read by `patch`.
#[derive(Debug, Serialize, Deserialize)]
struct FileDiff {
    block_size: usize,
    digest: ContentHash,
    segments: Vec<DiffSegment>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn load_config(cli: &Cli) -> Result<SyncConfig, SyncError> {
    let dir = cli.config.clone().unwrap_or_else(|| PathBuf::from("."));
    let mut config = SyncConfig::load(&dir)?;
    if let Some(block_size) = cli.block_size {
        config.block_size = block_size;
    }
    config.validate()?;
    Ok(config)
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(&cli)?;
    debug!(?config, "effective config");

    match cli.command {
        Commands::Checksums { dir, paths, output } => run_checksums(&dir, paths, output, &config),
        Commands::Compare { dir, tree } => run_compare(&dir, &tree, &config),
        Commands::Diff {
            basis,
            source,
            output,
        } => run_diff(&basis, &source, output, &config),
        Commands::Patch {
            basis,
            diff,
            output,
        } => run_patch(&basis, &diff, output, &config),
        Commands::Resolve { paths, synced } => {
            if synced.is_empty() {
                println!("{}", resolve(&paths));
            } else {
                for path in filter_synced(&paths, &synced) {
                    println!("{path}");
                }
            }
            Ok(())
        }
        Commands::Conflict { action } => run_conflict(action, &config),
        Commands::Sync {
            client,
            server,
            root,
        } => run_sync(&client, &server, &root, &config),
    }
}

fn run_checksums(
    dir: &Path,
    paths: Vec<String>,
    output: Option<PathBuf>,
    config: &SyncConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let fs = DiskFs::new(dir);
    let paths = if paths.is_empty() {
        source_list(&fs, "/")?.src_list
    } else {
        paths
    };

    let tree = generate_checksums(&fs, &paths, config.block_size)?;
    let json = serde_json::to_string_pretty(&tree)?;
    match output {
        Some(output) => {
            std::fs::write(&output, json)?;
            println!("Wrote checksum tree: {} ({} paths)", output.display(), tree.len());
        }
        None => println!("{json}"),
    }
    Ok(())
}

fn run_compare(dir: &Path, tree: &Path, config: &SyncConfig) -> Result<(), Box<dyn std::error::Error>> {
    let fs = DiskFs::new(dir);
    let tree: ChecksumTree = serde_json::from_slice(&std::fs::read(tree)?)?;

    if compare_contents(&fs, &tree, config.block_size)? {
        println!("identical ({} paths)", tree.len());
        Ok(())
    } else {
        Err(format!("{} differs from the checksum tree", dir.display()).into())
    }
}

fn run_diff(
    basis: &Path,
    source: &Path,
    output: Option<PathBuf>,
    config: &SyncConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let output = output.unwrap_or_else(|| {
        let mut p = source.to_path_buf();
        p.set_extension("diff.json");
        p
    });

    let checksums = block_checksums(&std::fs::read(basis)?, config.block_size);
    let data = std::fs::read(source)?;
    let segments = roll(&data, &checksums, config.block_size)?;
    let stats = DiffStats::from_segments(&segments, data.len() as u64);

    let diff = FileDiff {
        block_size: config.block_size,
        digest: ContentHash::compute(&data),
        segments,
    };
    std::fs::write(&output, serde_json::to_vec(&diff)?)?;

    println!(
        "Generated diff: {} ({} blocks reused, {} literal bytes, {:.1}% matched)",
        output.display(),
        stats.blocks_reused,
        stats.literal_bytes,
        stats.ratio * 100.0
    );
    Ok(())
}

fn run_patch(
    basis: &Path,
    diff: &Path,
    output: Option<PathBuf>,
    config: &SyncConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let output = output.unwrap_or_else(|| basis.to_path_buf());
    let diff: FileDiff = serde_json::from_slice(&std::fs::read(diff)?)?;

    let data = patch(&std::fs::read(basis)?, &diff.segments, diff.block_size)?;
    let actual = ContentHash::compute(&data);
    if config.verify_digest && actual != diff.digest {
        return Err(SyncError::DigestMismatch {
            expected: diff.digest.to_string(),
            actual: actual.to_string(),
        }
        .into());
    }

    std::fs::write(&output, &data)?;
    println!("Patched {} ({} bytes)", output.display(), data.len());
    Ok(())
}

fn run_conflict(action: ConflictAction, config: &SyncConfig) -> Result<(), Box<dyn std::error::Error>> {
    let resolver = ConflictResolver::new(config.max_rename_attempts);
    match action {
        ConflictAction::Mark { dir, path } => {
            let copy = resolver.mark_conflicted(&DiskFs::new(dir), &path)?;
            println!("{copy}");
        }
        ConflictAction::Check { dir, path } => {
            let conflicted = resolver.is_conflicted(&DiskFs::new(dir), &path)?;
            println!("{}", if conflicted { "conflicted" } else { "clean" });
        }
        ConflictAction::Clear { dir, path } => {
            resolver.remove_conflict(&DiskFs::new(dir), &path)?;
            println!("cleared {path}");
        }
    }
    Ok(())
}

fn run_sync(
    client: &Path,
    server: &Path,
    root: &str,
    config: &SyncConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let client_fs = DiskFs::new(client);
    let server_fs = DiskFs::new(server);
    let session = SyncSession::new(SyncId(1), ConnectionId(1), "local", config.clone());

    info!(client = %client.display(), server = %server.display(), %root, "syncing");
    let mut result = sync_round(&client_fs, &session, &server_fs, root)?;

    // Paths whose server copy was preserved go again, now against no base.
    if !result.conflicted.is_empty() {
        info!(paths = result.conflicted.len(), "re-sending conflicted paths");
        let retry = sync_round(&client_fs, &session, &server_fs, root)?;
        result.synced.extend(retry.synced);
        result.conflicted = retry.conflicted;
    }

    println!(
        "Synced {} ({} paths, {} conflicted)",
        result.path,
        result.synced.len(),
        result.conflicted.len()
    );
    for path in &result.conflicted {
        println!("  conflict: {path}");
    }
    Ok(())
}
