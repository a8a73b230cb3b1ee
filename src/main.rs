use clap::Parser;
use miette::Result;
use provisioner::{jwks, settings, storage, web};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    name = "provisioner",
    version,
    about = "Device registration, claiming and access token service"
)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // logging
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();

    // load settings
    let settings = settings::Settings::load(&cli.config)?;
    tracing::info!(?settings, "Loaded configuration");

    // init storage (database)
    let store = storage::init(&settings.database).await?;

    // signing key; a missing or malformed key is fatal
    let jwks_mgr = jwks::JwksManager::new(&settings.keys)?;
    tracing::info!(kid = ?jwks_mgr.key_id(), "Loaded token signing key");

    // start web server
    web::serve(settings, store, jwks_mgr).await?;
    Ok(())
}
