use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use eyre::Result;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use rsync_mirror::backend::store::ObjectStoreBackend;
use rsync_mirror::config::Config;
use rsync_mirror::mirror;

/// Mirror an rsync daemon module into an object store.
#[derive(Debug, Parser)]
#[command(name = "rsync-mirror", version, about)]
struct Args {
    /// JSON configuration file; when given it wins over every other flag.
    #[arg(long)]
    config_file: Option<PathBuf>,

    /// Access key of the object store.
    #[arg(long = "s3.accesskey", default_value = "")]
    s3_access_key: String,

    /// Secret key of the object store.
    #[arg(long = "s3.secretkey", default_value = "")]
    s3_secret_key: String,

    /// Endpoint of the object store.
    #[arg(long = "s3.endpoint", default_value = "http://localhost:9000")]
    s3_endpoint: String,

    /// Destination bucket.
    #[arg(long = "s3.bucket", default_value = "test-bucket")]
    s3_bucket: String,

    /// Key prefix the tree is mirrored under.
    #[arg(long = "s3.prefix", default_value = "ubuntu")]
    s3_prefix: String,

    /// Remote endpoint, rsync://HOST[:PORT]/MODULE[/PATH].
    #[arg(
        long = "rsync.endpoint",
        default_value = "rsync://rsync.mirrors.ustc.edu.cn/ubuntu"
    )]
    rsync_endpoint: String,

    #[arg(long, default_value = "info")]
    log_level: String,

    /// Patterns excluded from the transfer.
    #[arg(long)]
    exclude: Vec<String>,

    /// Keep going when the server reports errors while enumerating.
    #[arg(long)]
    continue_on_remote_errors: bool,

    /// Liveness port for external monitoring.
    #[arg(long)]
    diagnostics_port: Option<u16>,
}

impl Args {
    fn into_config(self) -> Result<Config> {
        if let Some(path) = &self.config_file {
            return Config::from_file(path);
        }
        Ok(Config {
            s3_access_key: self.s3_access_key,
            s3_secret_key: self.s3_secret_key,
            s3_endpoint: self.s3_endpoint,
            s3_bucket: self.s3_bucket,
            s3_prefix: self.s3_prefix,
            rsync_endpoint: self.rsync_endpoint,
            log_level: self.log_level,
            exclude: self.exclude,
            continue_on_remote_errors: self.continue_on_remote_errors,
            diagnostics_port: self.diagnostics_port,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cfg = Args::parse().into_config()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.log_level)),
        )
        .init();

    if let Some(port) = cfg.diagnostics_port {
        tokio::spawn(serve_diagnostics(port));
    }

    let backend = Arc::new(ObjectStoreBackend::s3(&cfg)?);
    mirror::run(&cfg, backend).await?;
    Ok(())
}

/// One-line liveness answer per connection.
async fn serve_diagnostics(port: u16) {
    let listener = match TcpListener::bind(("127.0.0.1", port)).await {
        Ok(listener) => listener,
        Err(e) => {
            warn!(port, error = %e, "diagnostics listener failed to start");
            return;
        }
    };
    info!(port, "diagnostics listener ready");
    loop {
        match listener.accept().await {
            Ok((mut socket, _)) => {
                let _ = socket.write_all(b"ok\n").await;
            }
            Err(e) => {
                warn!(error = %e, "diagnostics accept failed");
            }
        }
    }
}
