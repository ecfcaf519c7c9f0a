//! FitLink REST API — thin authenticated client plus the command-level
//! helpers the CLI calls.

pub mod client;
pub mod sessions;

use anyhow::Result;

pub use client::FitClient;

use crate::config::Config;

/// Show the logged-in profile and cache its id (the role decision at call
/// time reads it from config).
pub async fn whoami() -> Result<()> {
    let client = FitClient::new()?;
    let me = client.me().await?;
    println!("{} ({})", me.name(), me.id);

    let mut config = Config::load()?;
    if config.user_id.as_deref() != Some(me.id.as_str()) {
        config.user_id = Some(me.id.clone());
        config.save()?;
    }
    Ok(())
}

/// List upcoming training sessions.
pub async fn list_sessions(limit: usize) -> Result<()> {
    let client = FitClient::new()?;
    let sessions = sessions::list_upcoming(&client, limit).await?;

    if sessions.is_empty() {
        println!("No upcoming sessions.");
        return Ok(());
    }
    for s in &sessions {
        let when = s
            .scheduled_at
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "unscheduled".into());
        println!(
            "{}  {}  trainer: {}  [{}]  {}",
            s.id,
            when,
            s.trainer.name(),
            s.status.as_deref().unwrap_or("?"),
            s.title.as_deref().unwrap_or(""),
        );
    }
    Ok(())
}
