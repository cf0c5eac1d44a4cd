use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use tablehub_server::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let addr = SocketAddr::new(args.host, args.port);
    let database_url = args.database_url.clone().unwrap_or_else(default_database_path);
    let config = Config {
        cors_origins: args
            .cors_origins
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        debug: args.debug,
        max_sync_batch_size: args.max_sync_batch_size,
    };

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let actual = listener.local_addr()?;
    tracing::info!(addr = %actual, "tablehub server listening");

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    tablehub_server::serve_listener(listener, &database_url, config, shutdown).await?;
    Ok(())
}

/// Falls back to `<data-dir>/tablehub/tablehub.db` when neither `--database-url`
/// nor `DATABASE_URL` is set.
fn default_database_path() -> String {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tablehub")
        .join("tablehub.db")
        .to_string_lossy()
        .into_owned()
}

#[derive(Parser, Debug)]
#[command(name = "tablehub-server")]
#[command(about = "TableHub sync API server", long_about = None)]
struct Args {
    /// Host/interface to bind.
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    host: IpAddr,

    /// Port to bind.
    #[arg(long, env = "PORT", default_value_t = 8000)]
    port: u16,

    /// SQLite file path, or a `postgresql://` URL for the networked backend.
    /// Defaults to `<data-dir>/tablehub/tablehub.db` when unset.
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Comma-separated list of origins allowed to call this API.
    #[arg(
        long,
        env = "CORS_ORIGINS",
        default_value = "http://localhost:3000,http://localhost:5173,http://localhost:8080"
    )]
    cors_origins: String,

    /// Expose /api/debug/* endpoints.
    #[arg(long, env = "DEBUG", default_value_t = false)]
    debug: bool,

    /// Reject a sync push batch larger than this many operations.
    #[arg(long, env = "MAX_SYNC_BATCH_SIZE", default_value_t = 100)]
    max_sync_batch_size: usize,
}
