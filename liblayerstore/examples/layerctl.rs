//! Maintenance tool around the lazy layer store.
//!
//! Drives the store against plain directory layers, which is enough
//! to pull, mount, inspect and push lazy chains without a container
//! runtime in the loop.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use liblazy_fs::fetch::{AccessMonitor, FetchAgent, HttpFetchAgent, HttpMonitor};
use liblayerstore::layout::{CONTENT_DIR, INDEX_DIR, OVERRIDE_DIR};
use liblayerstore::union::OverlayUnion;
use liblayerstore::upload::HttpBlobStore;
use liblayerstore::{LayerDriver, LazyLayerStore, StoreLayout, chain};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "layerctl", about = "lazy layer store maintenance")]
struct Cli {
    /// Layer storage home.
    #[arg(long, default_value = "/var/lib/lazylayer/layers")]
    home: PathBuf,

    /// Store root holding private caches and staging areas.
    #[arg(long)]
    store_root: Option<PathBuf>,

    /// Fetch agent endpoint.
    #[arg(long, default_value = liblazy_fs::fetch::DEFAULT_AGENT)]
    agent: String,

    /// Access monitor endpoint.
    #[arg(long)]
    monitor: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Mount a layer's chain and hold it until interrupted.
    Acquire { id: String },
    /// Create a layer, extending the parent's chain when it is lazy.
    Create {
        id: String,
        #[arg(long)]
        parent: Option<String>,
        #[arg(long)]
        writable: bool,
    },
    /// Remove a layer's storage.
    Remove { id: String },
    /// Apply a pulled layer archive.
    Apply { id: String, archive: PathBuf },
    /// Run the export transform and write the push archive.
    Export { id: String, out: PathBuf },
    /// Set up an empty chain root for `image`, ready to receive a
    /// placeholder tree under its index directory.
    MarkRoot { id: String, image: String },
    /// Report whether a layer belongs to a lazy chain.
    IsLazy { id: String },
}

/// Plain directory layers, no container runtime underneath.
struct DirDriver {
    home: PathBuf,
}

#[async_trait]
impl LayerDriver for DirDriver {
    async fn create(&self, id: &str, _parent: Option<&str>) -> liblayerstore::Result<()> {
        fs::create_dir_all(self.home.join(id).join(CONTENT_DIR))?;
        Ok(())
    }

    async fn create_writable(&self, id: &str, parent: Option<&str>) -> liblayerstore::Result<()> {
        self.create(id, parent).await
    }

    async fn remove(&self, id: &str) -> liblayerstore::Result<()> {
        fs::remove_dir_all(self.home.join(id))?;
        Ok(())
    }

    async fn apply(&self, id: &str, archive: &Path) -> liblayerstore::Result<u64> {
        let target = self.home.join(id).join(CONTENT_DIR);
        fs::create_dir_all(&target)?;
        let mut reader = tar::Archive::new(File::open(archive)?);
        reader.set_preserve_permissions(true);
        reader.unpack(&target)?;

        let mut total = 0;
        for entry in walkdir::WalkDir::new(&target) {
            let entry = entry.map_err(std::io::Error::from)?;
            if entry.file_type().is_file() {
                total += entry.metadata().map(|meta| meta.len()).unwrap_or(0);
            }
        }
        Ok(total)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let layout = StoreLayout::new(cli.store_root.clone())?;
    let agent: Arc<dyn FetchAgent> = Arc::new(HttpFetchAgent::new(cli.agent.clone()));
    let monitor = cli
        .monitor
        .clone()
        .map(|base| Arc::new(HttpMonitor::new(base)) as Arc<dyn AccessMonitor>);
    let store = LazyLayerStore::new(
        cli.home.clone(),
        layout,
        Arc::new(DirDriver {
            home: cli.home.clone(),
        }),
        agent,
        monitor,
        Arc::new(HttpBlobStore::new(cli.agent.clone())),
        Arc::new(OverlayUnion),
    )?;

    match cli.command {
        Command::Acquire { id } => {
            let mountpoint = store.acquire(&id).await?;
            println!("serving {} at {}", id, mountpoint.display());
            tokio::signal::ctrl_c().await?;
            store.release(&id).await?;
        }
        Command::Create {
            id,
            parent,
            writable,
        } => {
            if writable {
                store.create_writable(&id, parent.as_deref()).await?;
            } else {
                store.create(&id, parent.as_deref()).await?;
            }
            println!("created {id}");
        }
        Command::Remove { id } => {
            store.remove(&id).await?;
            println!("removed {id}");
        }
        Command::Apply { id, archive } => {
            let size = store.apply_layer(&id, &archive).await?;
            println!("applied {id}, {size} bytes");
            if store.is_lazy(&id) {
                println!("{id} is now a chain root");
            }
        }
        Command::Export { id, out } => {
            let mut archive = store.export_transform(&id).await?;
            let mut out_file = File::create(&out)?;
            let bytes = std::io::copy(&mut archive, &mut out_file)?;
            println!("wrote {} ({bytes} bytes)", out.display());
        }
        Command::MarkRoot { id, image } => {
            let layer_dir = cli.home.join(&id);
            let index_dir = layer_dir.join(INDEX_DIR);
            fs::create_dir_all(&index_dir)?;
            fs::create_dir_all(layer_dir.join(CONTENT_DIR))?;
            fs::create_dir_all(layer_dir.join(OVERRIDE_DIR))?;
            chain::write_image_name(&index_dir, &image)?;
            chain::mark_chain_root(&layer_dir)?;
            println!("chain root ready, index at {}", index_dir.display());
        }
        Command::IsLazy { id } => {
            println!("{}", store.is_lazy(&id));
        }
    }
    Ok(())
}
