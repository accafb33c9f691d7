use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use std::sync::Arc;
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::{
    fmt::time::LocalTime, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};
use voipuser::{
    config::Config,
    event::CallerInfo,
    transport::{LoopbackTransport, SessionState},
    version, VoipUserBuilder,
};

#[derive(Parser, Debug)]
#[command(
    author,
    version = version::get_short_version(),
    about = "VoIP call session agent",
    long_about = version::get_version_info()
)]
struct Cli {
    /// Path to the configuration file
    #[clap(
        long,
        global = true,
        help = "Path to the configuration file (TOML format)"
    )]
    conf: Option<String>,
    #[clap(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate configuration and exit
    CheckConfig,
    /// Run a scripted inbound call over the in-process loopback transport
    Demo {
        #[clap(long, default_value = "alice")]
        caller: String,
        #[clap(long, default_value = "example.com")]
        host: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let cli = Cli::parse();

    let config = if let Some(ref path) = cli.conf {
        println!("Loading config from: {}", path);
        Config::load(path)?
    } else {
        println!("Loading default config");
        Config::default()
    };

    let mut env_filter = EnvFilter::from_default_env();
    if let Some(Ok(level)) = config
        .log_level
        .as_ref()
        .map(|level| level.parse::<LevelFilter>())
    {
        env_filter = env_filter.add_directive(level.into());
    }

    let mut guard_holder = None;
    if let Some(ref log_file) = config.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)?;
        let (non_blocking, guard) = tracing_appender::non_blocking(file);
        guard_holder = Some(guard);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_timer(LocalTime::rfc_3339())
                    .with_ansi(false)
                    .with_writer(non_blocking),
            )
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_timer(LocalTime::rfc_3339()))
            .try_init()?;
    }
    let _ = guard_holder; // keep the guard alive

    match cli.command {
        Some(Commands::CheckConfig) => match config.voip.validate() {
            Ok(_) => {
                println!("Configuration is valid.");
                Ok(())
            }
            Err(err) => {
                eprintln!("Configuration validation failed: {}", err);
                std::process::exit(1);
            }
        },
        Some(Commands::Demo { caller, host }) => run_demo(config, caller, host).await,
        None => run_demo(config, "alice".to_string(), "example.com".to_string()).await,
    }
}

async fn run_demo(config: Config, caller: String, host: String) -> Result<()> {
    info!(useragent = %version::get_useragent(), "starting demo");
    let transport = Arc::new(LoopbackTransport::new());
    let ua = VoipUserBuilder::new()
        .with_config(Some(config.voip))
        .with_transport(transport.clone())
        .build()?;

    let mut events = ua.subscribe();
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => println!("{} {}", Utc::now().to_rfc3339(), json),
                Err(e) => warn!("failed to encode event: {}", e),
            }
        }
    });

    ua.init().await?;
    transport.emit_connected().await?;
    ua.register().await?;
    transport.accept_request().await?;

    let session = transport
        .incoming_call(CallerInfo::new(caller, host))
        .await?;
    info!(caller = %ua.caller_info()?.display_name(), "answering");
    ua.accept_call().await?;
    transport
        .set_session_state(&session, SessionState::Established)
        .await?;

    ua.end_call().await?;
    transport
        .set_session_state(&session, SessionState::Terminated)
        .await?;

    ua.unregister().await?;
    transport.accept_request().await?;
    ua.close().await?;

    info!(commands = ?transport.commands(), "demo finished");
    drop(ua);
    printer.await.ok();
    Ok(())
}
