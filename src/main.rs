// src/main.rs

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use remote_file_cache::prelude::*;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum DomainArg {
    None,
    Metadata,
    Listing,
    Manifest,
    Archive,
    Tile,
}

impl From<DomainArg> for ContentDomain {
    fn from(arg: DomainArg) -> Self {
        match arg {
            DomainArg::None => ContentDomain::None,
            DomainArg::Metadata => ContentDomain::MetadataDocument,
            DomainArg::Listing => ContentDomain::ListingDocument,
            DomainArg::Manifest => ContentDomain::VersionedManifest,
            DomainArg::Archive => ContentDomain::LargeArchive,
            DomainArg::Tile => ContentDomain::MapTile,
        }
    }
}

/// Fetch a file through the local disk cache.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    url: String,

    /// PEM bundle with extra root certificates.
    #[arg(long)]
    cert: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = DomainArg::None)]
    domain: DomainArg,

    /// Sub-folder of the cache directory to store the file in.
    #[arg(long)]
    prefix: Option<String>,

    /// Overrides the cache directory from the config file.
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// JSON file with a cache configuration.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Form data to POST instead of a GET.
    #[arg(long)]
    post: Option<String>,

    /// JSON to PUT instead of a GET. Takes precedence over --post.
    #[arg(long)]
    put: Option<String>,

    /// Polling interval in milliseconds.
    #[arg(long, default_value_t = 250)]
    poll_ms: u64,
}

fn load_config(args: &Args) -> Result<CacheConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
        }
        None => CacheConfig::default(),
    };
    if let Some(dir) = &args.cache_dir {
        config.cache_dir = Some(dir.clone());
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;
    let cache = CacheOrchestrator::init_with_http(config).await?;

    let mut request = CacheRequest::new(args.url.clone(), args.domain.into());
    request.cert = args.cert.clone();
    request.folder_prefix = args.prefix.clone();
    request.post_body = args.post.clone().map(String::into_bytes);
    request.put_body = args.put.clone().map(String::into_bytes);

    let response = loop {
        let response = cache.request(&request).await;
        if response.status.is_terminal() {
            break response;
        }
        if response.progress >= 0 {
            info!(progress = response.progress, "Downloading");
        }
        tokio::time::sleep(Duration::from_millis(args.poll_ms)).await;
    };

    cache.shutdown().await;

    match response.status {
        CacheStatus::Available => {
            let path = response.disk_path.context("available without a path")?;
            println!("{}", path.display());
            Ok(())
        }
        _ => bail!("{:?}: {}", response.error_class, response.human_error),
    }
}
