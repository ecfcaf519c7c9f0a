//! fitcall - Lightweight CLI client for FitLink training-session video calls
//!
//! Joins a session's signaling channel and negotiates a peer-to-peer media
//! connection with the other participant.

mod api;
mod call;
mod config;
mod signaling;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::call::session::CallParams;
use crate::config::Config;

#[derive(Parser)]
#[command(name = "fitcall")]
#[command(about = "Lightweight CLI client for FitLink training-session video calls", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Store the server URL and bearer token
    Login {
        /// FitLink API base URL (e.g. https://api.fitlink.example)
        #[arg(long)]
        server: String,

        /// Bearer token issued by the platform
        #[arg(long)]
        token: String,
    },

    /// Clear stored credentials
    Logout,

    /// Show the logged-in profile (verifies auth works)
    Whoami,

    /// List upcoming training sessions
    Sessions {
        /// Maximum number of sessions to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Join a training session call
    Call {
        /// Session id (from `sessions` output)
        session_id: String,
    },

    /// Test microphone capture: record 3 seconds and show levels
    #[cfg(feature = "audio")]
    MicTest,

    /// Test camera capture: record 3 seconds and report frame rate
    #[cfg(feature = "video-capture")]
    CamTest {
        /// V4L2 device path (defaults to the configured camera)
        #[arg(long)]
        device: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match cli.command {
        Commands::Login { server, token } => {
            let mut config = Config::load()?;
            config.server_url = Some(server);
            config.auth_token = Some(token);
            config.user_id = None;
            config.save()?;
            // Verify the credentials and cache the profile id.
            api::whoami().await?;
            println!("Logged in.");
        }
        Commands::Logout => {
            let mut config = Config::load()?;
            config.auth_token = None;
            config.user_id = None;
            config.save()?;
            println!("Logged out.");
        }
        Commands::Whoami => {
            api::whoami().await?;
        }
        Commands::Sessions { limit } => {
            api::list_sessions(limit).await?;
        }
        Commands::Call { session_id } => {
            join_call(&session_id).await?;
        }
        #[cfg(feature = "audio")]
        Commands::MicTest => {
            call::audio::mic_test()?;
        }
        #[cfg(feature = "video-capture")]
        Commands::CamTest { device } => {
            let config = Config::load()?;
            let device = device.or(config.camera_device);
            call::camera::cam_test(device.as_deref()).await?;
        }
    }

    Ok(())
}

/// Resolve the session, decide the role, run the call.
async fn join_call(session_id: &str) -> Result<()> {
    let mut config = Config::load()?;
    let client = api::FitClient::from_config(&config)?;

    let user_id = match config.user_id.clone() {
        Some(id) => id,
        None => {
            let me = client.me().await?;
            config.user_id = Some(me.id.clone());
            config.save()?;
            me.id
        }
    };

    let session = api::sessions::get_session(&client, session_id).await?;
    let role = session.role_for(&user_id);
    tracing::info!(
        "Session {} (trainer {}), joining as {}",
        session.id,
        session.trainer.name(),
        role
    );

    let params = CallParams {
        server_url: config.server_url()?.to_string(),
        token: config.auth_token()?.to_string(),
        session_id: session.id.clone(),
        role,
        ice_servers: config.ice_servers_or_default(),
        capture: config.capture_settings(),
    };
    call::session::run_call(params).await
}
