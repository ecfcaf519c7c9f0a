//! Configuration and credential storage.

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crate::call::media::CaptureSettings;

/// Application configuration, persisted as TOML under the platform config
/// directory.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// FitLink API base URL (e.g. https://api.fitlink.example).
    pub server_url: Option<String>,
    /// Bearer token issued by the platform (from `fitcall login`).
    pub auth_token: Option<String>,
    /// Cached profile id of the logged-in user; decides the call role.
    pub user_id: Option<String>,
    /// ICE servers for the peer connection (STUN/TURN URLs).
    #[serde(default)]
    pub ice_servers: Vec<String>,
    /// V4L2 camera device path (default /dev/video0).
    pub camera_device: Option<String>,
    /// V4L2 loopback device exposing the desktop, for screen share.
    pub screen_device: Option<String>,
    /// Capture geometry; defaults to 320x240 @ 15fps.
    pub capture_width: Option<u32>,
    pub capture_height: Option<u32>,
    pub capture_fps: Option<u32>,
}

impl Config {
    /// Get config directory path
    fn config_dir() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "fitcall", "fitcall")
            .context("Could not determine config directory")?;
        Ok(proj_dirs.config_dir().to_path_buf())
    }

    /// Get config file path
    fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from disk
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;

        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        toml::from_str(&content).context("Failed to parse config file")
    }

    /// Save configuration to disk
    pub fn save(&self) -> Result<()> {
        let dir = Self::config_dir()?;
        fs::create_dir_all(&dir).context("Failed to create config directory")?;
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(Self::config_path()?, content).context("Failed to write config file")
    }

    pub fn server_url(&self) -> Result<&str> {
        self.server_url
            .as_deref()
            .context("No server configured. Run `fitcall login` first.")
    }

    pub fn auth_token(&self) -> Result<&str> {
        self.auth_token
            .as_deref()
            .context("No credentials stored. Run `fitcall login` first.")
    }

    /// ICE servers from config, or a public STUN default.
    pub fn ice_servers_or_default(&self) -> Vec<String> {
        if self.ice_servers.is_empty() {
            vec!["stun:stun.l.google.com:19302".to_string()]
        } else {
            self.ice_servers.clone()
        }
    }

    /// Capture settings with defaults filled in.
    pub fn capture_settings(&self) -> CaptureSettings {
        let defaults = CaptureSettings::default();
        CaptureSettings {
            camera_device: self.camera_device.clone(),
            screen_device: self.screen_device.clone(),
            width: self.capture_width.unwrap_or(defaults.width),
            height: self.capture_height.unwrap_or(defaults.height),
            fps: self.capture_fps.unwrap_or(defaults.fps),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_round_trip() {
        let config = Config::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert!(parsed.server_url.is_none());
        assert!(parsed.ice_servers.is_empty());
    }

    #[test]
    fn test_ice_servers_default() {
        let config = Config::default();
        let servers = config.ice_servers_or_default();
        assert_eq!(servers.len(), 1);
        assert!(servers[0].starts_with("stun:"));

        let config = Config {
            ice_servers: vec!["turn:relay.fitlink.example:3478".into()],
            ..Default::default()
        };
        assert_eq!(config.ice_servers_or_default(), config.ice_servers);
    }

    #[test]
    fn test_capture_settings_merge() {
        let config = Config {
            capture_width: Some(640),
            ..Default::default()
        };
        let settings = config.capture_settings();
        assert_eq!(settings.width, 640);
        assert_eq!(settings.height, 240); // default preserved
        assert_eq!(settings.fps, 15);
    }
}
