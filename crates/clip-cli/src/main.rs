//! The `clip` command line: create, extract, mount, and store archives.
//!
//! Exit codes: 0 success, 1 user error, 2 invalid or corrupt archive,
//! 3 backend or mount failure.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;

use clip_format::{ClipArchiver, FormatError};
use clip_storage::{
    open_backend, ContentCache, ContentCacheConfig, RemoteArchiver, S3Location, S3StorageClient,
    StorageError,
};
use clip_vfs::{ClipVfs, MountOptions, VfsError};

const EXIT_USER: i32 = 1;
const EXIT_CORRUPT: i32 = 2;
const EXIT_BACKEND: i32 = 3;

#[derive(Debug, Parser)]
#[command(name = "clip", about = "Immutable content-addressed archives", version)]
struct Cli {
    /// Enable debug logging.
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create an archive from a directory.
    Create {
        /// Source directory to archive.
        #[arg(long)]
        input: PathBuf,
        /// Output archive file.
        #[arg(long)]
        output: PathBuf,
    },
    /// Extract an archive into a directory.
    Extract {
        /// Archive file to extract.
        #[arg(long)]
        input: PathBuf,
        /// Destination directory.
        #[arg(long)]
        output: PathBuf,
    },
    /// Mount an archive as a read-only filesystem.
    Mount {
        /// Archive path or s3://bucket/key URI.
        #[arg(long)]
        archive: String,
        /// Directory to mount at (created if absent).
        #[arg(long)]
        mountpoint: PathBuf,
        /// Content cache directory. Defaults to a temp path for remote
        /// archives.
        #[arg(long)]
        cache: Option<PathBuf>,
    },
    /// Upload an existing archive to S3.
    StoreS3 {
        /// Local archive file to upload.
        #[arg(long)]
        archive: PathBuf,
        /// Destination bucket.
        #[arg(long)]
        bucket: String,
        /// Object key; defaults to the archive's file name.
        #[arg(long)]
        key: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli: Cli = Cli::parse();
    init_tracing(cli.verbose);

    let code: i32 = match run(cli).await {
        Ok(()) => 0,
        Err((code, message)) => {
            eprintln!("error: {}", message);
            code
        }
    };
    std::process::exit(code);
}

fn init_tracing(verbose: bool) {
    let fallback: &str = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(fallback));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(cli: Cli) -> Result<(), (i32, String)> {
    match cli.command {
        Command::Create { input, output } => {
            info!(input = %input.display(), "creating archive");
            ClipArchiver::new()
                .create(&input, &output)
                .map_err(format_failure)?;
            info!(output = %output.display(), "archive created");
            Ok(())
        }
        Command::Extract { input, output } => {
            info!(input = %input.display(), "extracting archive");
            ClipArchiver::new()
                .extract(&input, &output)
                .map_err(format_failure)?;
            info!(output = %output.display(), "archive extracted");
            Ok(())
        }
        Command::Mount {
            archive,
            mountpoint,
            cache,
        } => mount(archive, mountpoint, cache, cli.verbose).await,
        Command::StoreS3 {
            archive,
            bucket,
            key,
        } => {
            let key: String = match key {
                Some(key) => key,
                None => archive
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .ok_or((EXIT_USER, format!("invalid archive path: {}", archive.display())))?,
            };

            let region: Option<String> = std::env::var("AWS_REGION").ok();
            let client: S3StorageClient = S3StorageClient::new(region)
                .await
                .map_err(storage_failure)?;
            RemoteArchiver::new(Arc::new(client), bucket)
                .create(&archive, &key)
                .await
                .map_err(storage_failure)?;
            info!(key, "archive stored");
            Ok(())
        }
    }
}

async fn mount(
    archive: String,
    mountpoint: PathBuf,
    cache_dir: Option<PathBuf>,
    verbose: bool,
) -> Result<(), (i32, String)> {
    // Remote archives stream through the block cache; local mounts only use
    // a cache when one is asked for.
    let cache_dir: Option<PathBuf> = cache_dir.or_else(|| {
        S3Location::parse(&archive).map(|_| std::env::temp_dir().join("clip-cache"))
    });
    let cache: Option<Arc<ContentCache>> = match cache_dir {
        Some(dir) => Some(Arc::new(
            ContentCache::open(ContentCacheConfig::new(dir)).map_err(storage_failure)?,
        )),
        None => None,
    };

    let backend = open_backend(&archive, cache.clone())
        .await
        .map_err(storage_failure)?;
    let vfs: ClipVfs = ClipVfs::new(
        backend,
        cache,
        MountOptions::default().with_verbose(verbose),
    )
    .map_err(mount_failure)?;

    info!(archive, mountpoint = %mountpoint.display(), "mounting archive");
    tokio::task::spawn_blocking(move || clip_vfs::mount(vfs, &mountpoint))
        .await
        .map_err(|e| (EXIT_BACKEND, e.to_string()))?
        .map_err(mount_failure)
}

fn format_failure(err: FormatError) -> (i32, String) {
    let code: i32 = match &err {
        FormatError::CorruptArchive { .. } => EXIT_CORRUPT,
        FormatError::UnsupportedNodeType { .. } | FormatError::Io { .. } => EXIT_USER,
        FormatError::Path(_) => EXIT_USER,
    };
    (code, err.to_string())
}

fn storage_failure(err: StorageError) -> (i32, String) {
    let code: i32 = match &err {
        StorageError::Format(inner) => return format_failure_ref(inner, err.to_string()),
        StorageError::Backend { .. }
        | StorageError::Network { .. }
        | StorageError::Timeout { .. }
        | StorageError::NotFound { .. }
        | StorageError::Io { .. } => EXIT_BACKEND,
    };
    (code, err.to_string())
}

fn format_failure_ref(err: &FormatError, message: String) -> (i32, String) {
    let code: i32 = match err {
        FormatError::CorruptArchive { .. } => EXIT_CORRUPT,
        _ => EXIT_USER,
    };
    (code, message)
}

fn mount_failure(err: VfsError) -> (i32, String) {
    match err {
        VfsError::Storage(inner) => storage_failure(inner),
        VfsError::MountFailed(message) => (EXIT_BACKEND, format!("mount failed: {}", message)),
    }
}
