use std::{future::IntoFuture, net::SocketAddr, path::Path, sync::Arc};

use clap::Parser;
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use tokio::net::TcpListener;
use tollgate::{
    adapters::{AppState, MemoryStore, RedisStore, build_router},
    config::{GatewayConfig, GatewayConfigValidator, StoreBackend, load_config},
    ports::kv_store::KeyValueStore,
    tracing_setup,
    utils::GracefulShutdown,
};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(short, long, default_value = "config.toml")]
    config: String,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        #[clap(short, long, default_value = "config.toml")]
        config: String,
    },
    /// Initialize a new configuration file
    Init {
        /// Output path for the new config file
        #[clap(short, long, default_value = "config.toml")]
        config: String,
    },
    /// Start the gateway server (default)
    Serve {
        /// Configuration file to use
        #[clap(short, long, default_value = "config.toml")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();
    match args.command {
        Some(Commands::Validate { config }) => validate_config_command(&config).await,
        Some(Commands::Init { config }) => init_config_command(&config).await,
        Some(Commands::Serve { config }) => serve(&config).await,
        None => serve(&args.config).await,
    }
}

async fn serve(config_path: &str) -> Result<()> {
    let config = load_config(config_path)
        .await
        .with_context(|| format!("Failed to load config from {config_path}"))?;

    tracing_setup::init_tracing_with_config(&config.logging.level, config.logging.json, true)?;

    if let Err(e) =
        rustls::crypto::CryptoProvider::install_default(rustls::crypto::aws_lc_rs::default_provider())
    {
        tracing::warn!(
            "CryptoProvider::install_default for aws-lc-rs reported an error: {:?}. \
            A provider was probably installed already.",
            e
        );
    }

    GatewayConfigValidator::validate(&config)
        .map_err(|e| eyre!("Invalid configuration in {config_path}: {e}"))?;

    let store = open_store(&config).await?;
    let shutdown = Arc::new(GracefulShutdown::new());
    let state = AppState::assemble(&config, store, shutdown.token()).await?;
    let app = build_router(state);

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;
    tracing::info!(
        "Tollgate gateway listening on {}",
        listener.local_addr().context("Listener has no local address")?
    );

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = shutdown.run_signal_handler().await {
                tracing::error!("Signal handler failed: {}", e);
            }
        });
    }

    let stop = shutdown.token();
    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { stop.cancelled().await })
    .into_future();

    let drain = shutdown.drain_timeout();
    let deadline = {
        let shutdown = shutdown.clone();
        async move {
            let reason = shutdown.wait_for_shutdown_signal().await;
            tracing::info!("Shutdown ({:?}), draining connections for up to {:?}", reason, drain);
            tokio::time::sleep(drain).await;
        }
    };

    tokio::select! {
        result = server => result.context("Server error")?,
        _ = deadline => tracing::warn!(
            "Connections still open after {:?}, exiting without waiting for them",
            drain
        ),
    }

    tracing::info!("Graceful shutdown completed");
    Ok(())
}

async fn open_store(config: &GatewayConfig) -> Result<Arc<dyn KeyValueStore>> {
    match config.store.backend {
        StoreBackend::Redis => {
            let store = RedisStore::connect(&config.store.url)
                .await
                .context("Failed to connect to the key-value store")?;
            Ok(Arc::new(store))
        }
        StoreBackend::Memory => {
            tracing::warn!(
                "Using the in-process store: services and analytics are lost on exit"
            );
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

/// Validate configuration file and exit
async fn validate_config_command(config_path: &str) -> Result<()> {
    println!("🔍 Validating configuration file: {config_path}");

    if !Path::new(config_path).exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' not found");
        std::process::exit(1);
    }

    let config = match load_config(config_path).await {
        Ok(config) => {
            println!("✅ Configuration parsing: OK");
            config
        }
        Err(e) => {
            eprintln!("❌ Configuration parsing failed:");
            eprintln!("   {e}");
            std::process::exit(1);
        }
    };

    match GatewayConfigValidator::validate(&config) {
        Ok(()) => {
            println!("✅ Configuration validation: OK");
            println!();
            println!("📋 Configuration Summary:");
            println!("   • Listen Address: {}", config.listen_addr);
            println!("   • Store: {:?}", config.store.backend);
            println!("   • Request Timeout: {}", config.proxy.request_timeout);
            println!("   • Host Conflicts: {:?}", config.registry.host_conflicts);
            println!("   • Management Auth: {}", config.auth.enabled);
            println!();
            println!("🎉 Configuration is valid and ready to use!");
            Ok(())
        }
        Err(e) => {
            eprintln!("❌ Configuration validation failed:");
            eprintln!("{e}");
            println!();
            println!("💡 Common fixes:");
            println!("   • Verify listen address format (e.g., '127.0.0.1:8080')");
            println!("   • Redis URLs start with redis:// or rediss://");
            println!("   • Durations use humantime units (e.g., '30s', '500ms')");
            println!("   • Add at least one [auth.tokens] entry or set auth.enabled = false");
            std::process::exit(1);
        }
    }
}

/// Initialize a new configuration file
async fn init_config_command(config_path: &str) -> Result<()> {
    let path = Path::new(config_path);
    if path.exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' already exists");
        std::process::exit(1);
    }

    let default_config = r#"# Tollgate gateway configuration

# The address to listen on
listen_addr = "0.0.0.0:8080"

# Where services and analytics are kept
[store]
backend = "redis"        # or "memory" for a throwaway single-node setup
url = "redis://127.0.0.1:6379/0"

[proxy]
request_timeout = "30s"  # REST exchanges only; event streams are unbounded
preserve_host = true     # false sends the backend's own authority as Host
public_scheme = "https"  # used to absolutize relative redirects
event_stream_buffer = 16
# client_ip_header = "cf-connecting-ip"
# country_header = "cf-ipcountry"

[telemetry]
write_timeout = "5s"

[live]
subscriber_capacity = 30
control_capacity = 5
publish_capacity = 30

[registry]
host_conflicts = "first_match"  # or "reject"
id_length = 15

[auth]
enabled = true
cookie_name = "session-token"

[auth.tokens]
# "<token>" = "<principal>"
"change-me" = "admin"

[logging]
level = "info"
json = true
"#;

    tokio::fs::write(path, default_config)
        .await
        .context("Failed to write config file")?;
    println!("✅ Created default configuration at: {config_path}");
    println!("   Run 'tollgate serve --config {config_path}' to start the server");
    Ok(())
}
