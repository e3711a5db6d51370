//! rootstock CLI.
//!
//! Thin driver over the core pipelines: `create`, `delete`, `clean`.
//! Diagnostics go to standard error; any failure exits 1.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use rootstock::bundler::DirectoryBundler;
use rootstock::config::Config;
use rootstock::creator::{CreateSpec, Creator};
use rootstock::deleter::Deleter;
use rootstock::driver::{CopyDriver, VolumeDriver};
use rootstock::gc::GarbageCollector;
use rootstock::image::{parse_image_url, LayerPuller};
use rootstock::locksmith::FileLocksmith;
use rootstock::mappings::IdMapping;
use rootstock::store::{DependencyStore, StoreLayout, VolumeStore};

#[derive(Parser)]
#[command(
    name = "rootstock",
    version,
    about = "Materializes OCI/Docker images into per-instance root filesystems"
)]
struct Cli {
    /// Store directory holding volumes, bundles, and locks.
    #[arg(
        long,
        global = true,
        default_value = "/var/lib/rootstock",
        env = "ROOTSTOCK_STORE"
    )]
    store: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a bundle from a local or remote image.
    Create {
        /// Image to build the bundle from: a docker:// URL or an
        /// absolute directory path.
        #[arg(long)]
        image: String,

        /// UID mapping as HOST:NAMESPACE:SIZE; repeatable.
        #[arg(long = "uid-mapping")]
        uid_mappings: Vec<IdMapping>,

        /// GID mapping as HOST:NAMESPACE:SIZE; repeatable.
        #[arg(long = "gid-mapping")]
        gid_mappings: Vec<IdMapping>,

        /// Disk limit in bytes; 0 means unlimited.
        #[arg(long = "disk-limit-size-bytes", default_value_t = 0)]
        disk_limit: u64,

        /// Registry contacted without TLS verification; repeatable.
        #[arg(long = "insecure-registry")]
        insecure_registries: Vec<String>,

        /// Bundle id.
        id: String,
    },

    /// Destroy a bundle.
    Delete {
        /// Bundle id.
        id: String,
    },

    /// Remove volumes no bundle or kept image references.
    Clean {
        /// Image whose layer chain must survive the sweep; repeatable.
        #[arg(long = "keep-image")]
        keep_images: Vec<String>,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr),
        )
        .init();

    // Usage errors exit 1, like every other failure; help and version
    // stay on the success path.
    let cli = Cli::try_parse().unwrap_or_else(|err| {
        let _ = err.print();
        std::process::exit(if err.use_stderr() { 1 } else { 0 });
    });

    if let Err(err) = run(cli).await {
        eprintln!("{err:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let layout = StoreLayout::new(cli.store.clone());
    layout.init()?;

    let driver: Arc<dyn VolumeDriver> = Arc::new(CopyDriver);
    let volume_store = Arc::new(VolumeStore::new(layout.clone()));
    let locksmith = Arc::new(FileLocksmith::new(layout.locks_dir()));
    let dependency_store = Arc::new(DependencyStore::new(layout.dependencies_dir()));

    match cli.command {
        Command::Create {
            image,
            uid_mappings,
            gid_mappings,
            disk_limit,
            insecure_registries,
            id,
        } => {
            let config = Config::new(cli.store, insecure_registries);
            let puller = Arc::new(LayerPuller::new(
                volume_store,
                driver.clone(),
                config.trusted_registries,
            ));
            let bundler = Arc::new(DirectoryBundler::new(layout, driver));
            let creator = Creator::new(bundler, puller, locksmith, dependency_store);

            let bundle = creator
                .create(CreateSpec {
                    id,
                    image,
                    uid_mappings,
                    gid_mappings,
                    disk_limit,
                })
                .await?;

            println!("{}", bundle.path.display());
        }

        Command::Delete { id } => {
            let bundler = Arc::new(DirectoryBundler::new(layout, driver));
            let deleter = Deleter::new(bundler, locksmith, dependency_store);
            deleter.delete(&id).await?;
        }

        Command::Clean { keep_images } => {
            let keep = keep_images
                .iter()
                .map(|raw| parse_image_url(raw))
                .collect::<Result<Vec<_>, _>>()?;

            let collector = GarbageCollector::new(volume_store, dependency_store, locksmith);
            collector.collect(&keep).await?;
        }
    }

    Ok(())
}
