// Example binary mounting one lazy layer: a placeholder index plus an
// override directory, materializing content into a private cache through
// the local fetch agent.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use liblazy_fs::fetch::{self, HttpFetchAgent, HttpMonitor};
use liblazy_fs::lazyfs::{LazyFs, Materializer};
use liblazy_fs::server::{mount_lazyfs, serve_until_signal};

#[derive(Parser, Debug)]
#[command(author, version, about = "Mount a lazy layer tree")]
struct Args {
    /// Mount point path
    #[arg(long)]
    mountpoint: PathBuf,
    /// Placeholder index tree
    #[arg(long)]
    index: PathBuf,
    /// Writable override directory
    #[arg(long)]
    overridedir: PathBuf,
    /// Private cache directory for this image
    #[arg(long)]
    cache: PathBuf,
    /// Fetch agent address
    #[arg(long, default_value = fetch::DEFAULT_AGENT)]
    agent: String,
    /// Monitor address for access events (disabled when absent)
    #[arg(long)]
    monitor: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    let agent = Arc::new(HttpFetchAgent::new(args.agent));
    let monitor = args
        .monitor
        .map(|addr| Arc::new(HttpMonitor::new(addr)) as Arc<dyn liblazy_fs::fetch::AccessMonitor>);
    let materializer = Materializer::new(args.cache, agent, monitor);
    let fs = LazyFs::new(args.index, args.overridedir, materializer)?;

    let handle = mount_lazyfs(fs, args.mountpoint.as_os_str()).await?;
    serve_until_signal(handle, &args.mountpoint).await?;
    Ok(())
}
