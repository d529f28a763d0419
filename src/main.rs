use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::{Parser, Subcommand};

use git_source_sync::{
    ChangeNotifier, GitSourceFetcher, NoopNotifier, SourceDescriptor, SourcePaths,
};

#[derive(Parser)]
#[command(
    name = "git-source-sync",
    about = "Keep local clones of git sources in sync and report branch changes"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one synchronization cycle
    Sync {
        /// Source descriptor (JSON)
        #[arg(long)]
        source: PathBuf,
        /// Cache root (defaults to the system cache directory)
        #[arg(long)]
        base_dir: Option<PathBuf>,
        /// Commit expected on the remote; skips the fetch when already local
        #[arg(long)]
        hint: Option<String>,
        /// Always fetch
        #[arg(long)]
        force: bool,
    },

    /// Synchronize on a fixed interval until interrupted
    Watch {
        /// Source descriptor (JSON)
        #[arg(long)]
        source: PathBuf,
        #[arg(long)]
        base_dir: Option<PathBuf>,
        /// Seconds between cycles
        #[arg(long, default_value_t = 60)]
        interval: u64,
    },

    /// Print a bundle of the tracked branch as JSON
    Bundle {
        /// Source descriptor (JSON)
        #[arg(long)]
        source: PathBuf,
        #[arg(long)]
        base_dir: Option<PathBuf>,
        /// Build a diff bundle against this commit
        #[arg(long)]
        base: Option<String>,
    },

    /// Print a source's identity and clone path
    SourceId {
        /// Source descriptor (JSON)
        #[arg(long)]
        source: PathBuf,
        #[arg(long)]
        base_dir: Option<PathBuf>,
    },
}

/// Prints every branch transition to stdout.
struct PrintNotifier;

#[async_trait]
impl ChangeNotifier for PrintNotifier {
    async fn on_update(&self, old_revision: Option<String>, new_revision: String) {
        println!(
            "{} -> {}",
            old_revision.as_deref().unwrap_or("(none)"),
            new_revision
        );
    }
}

fn main() {
    env_logger::init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Sync {
            source,
            base_dir,
            hint,
            force,
        } => cmd_sync(&source, base_dir, hint.as_deref(), force),
        Commands::Watch {
            source,
            base_dir,
            interval,
        } => cmd_watch(&source, base_dir, interval),
        Commands::Bundle {
            source,
            base_dir,
            base,
        } => cmd_bundle(&source, base_dir, base.as_deref()),
        Commands::SourceId { source, base_dir } => cmd_source_id(&source, base_dir),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn paths(base_dir: Option<PathBuf>) -> SourcePaths {
    base_dir.map(SourcePaths::new).unwrap_or_default()
}

fn runtime() -> std::io::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| std::io::Error::other(format!("failed to start tokio runtime: {e}")))
}

fn cmd_sync(
    source: &Path,
    base_dir: Option<PathBuf>,
    hint: Option<&str>,
    force: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let descriptor = SourceDescriptor::from_json_file(source)?;
    let fetcher = GitSourceFetcher::new(paths(base_dir), descriptor, Arc::new(PrintNotifier));

    runtime()?.block_on(fetcher.synchronize(hint, force))?;
    Ok(())
}

fn cmd_watch(
    source: &Path,
    base_dir: Option<PathBuf>,
    interval: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let descriptor = SourceDescriptor::from_json_file(source)?;
    let fetcher = GitSourceFetcher::new(paths(base_dir), descriptor, Arc::new(PrintNotifier));

    let (stop_tx, mut stop_rx) = tokio::sync::watch::channel(false);
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(true);
    })?;

    let interval = Duration::from_secs(interval.max(1));
    runtime()?.block_on(async move {
        let mut force = true;
        loop {
            fetcher.synchronize(None, force).await?;
            force = false;

            tokio::select! {
                _ = stop_rx.changed() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        log::info!("stopped watching {}", fetcher.source().url);
        Ok::<(), git_source_sync::FetchError>(())
    })?;
    Ok(())
}

fn cmd_bundle(
    source: &Path,
    base_dir: Option<PathBuf>,
    base: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let descriptor = SourceDescriptor::from_json_file(source)?;
    let fetcher = GitSourceFetcher::new(paths(base_dir), descriptor, Arc::new(NoopNotifier));

    let bundle = runtime()?.block_on(fetcher.make_bundle(base))?;
    println!("{}", serde_json::to_string_pretty(&bundle)?);
    Ok(())
}

fn cmd_source_id(
    source: &Path,
    base_dir: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let descriptor = SourceDescriptor::from_json_file(source)?;
    let cache = paths(base_dir);
    let fetcher = GitSourceFetcher::new(cache.clone(), descriptor, Arc::new(NoopNotifier));

    println!("Source:     {}", fetcher.source().url);
    println!("Branch:     {}", fetcher.source().branch);
    println!("Id:         {}", fetcher.source_id());
    println!("Cache root: {}", cache.root().display());
    println!("Clone path: {}", fetcher.clone_path().display());
    Ok(())
}
