use anyhow::Result;
use clap::Parser;
use config::Config;
use log::info;
use rtmp_relay::error::ConfigError;
use rtmp_relay::registry::StreamRegistry;
use rtmp_relay::server::MediaServer;
use rtmp_relay::settings::Settings;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
struct Args {
    /// Path to the YAML config file. Overridden per-key by `APP_`-prefixed
    /// environment variables.
    #[arg(long, default_value = "config.yaml")]
    config: String,
}

fn load_settings(path: &str) -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(config::File::with_name(path).required(false))
        .add_source(config::Environment::with_prefix("APP"))
        .build()?;
    Ok(builder.try_deserialize()?)
}

#[tokio::main]
async fn main() -> Result<()> {
    pretty_env_logger::init();

    let args = Args::parse();
    let settings = load_settings(&args.config)?;

    let registry = StreamRegistry::new(settings.persistence_path.clone());
    let cancel = CancellationToken::new();

    let server = MediaServer::new(settings.listen_rtmp.clone(), registry, cancel.clone());
    let server_handle = tokio::spawn(server.run());

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    cancel.cancel();

    server_handle.await??;
    info!("server closed");
    Ok(())
}
