//! Authenticated HTTP client for the FitLink API.
//!
//! Wraps reqwest::Client with bearer-token injection from config. The REST
//! resources themselves stay opaque; only the handful of fields the call
//! client needs are deserialized.

use anyhow::{ensure, Context, Result};
use serde::de::DeserializeOwned;

use crate::api::sessions::Profile;
use crate::config::Config;

pub struct FitClient {
    http: reqwest::Client,
    base: String,
    token: String,
}

impl FitClient {
    /// Load config and build a client.
    pub fn new() -> Result<Self> {
        let config = Config::load()?;
        Self::from_config(&config)
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let base = config.server_url()?.trim_end_matches('/').to_string();
        let token = config.auth_token()?.to_string();
        Ok(Self {
            http: reqwest::Client::new(),
            base,
            token,
        })
    }

    pub(crate) async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base, path);
        let resp = self
            .http
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .with_context(|| format!("GET {} failed", path))?;
        ensure!(
            resp.status().is_success(),
            "GET {} returned {}",
            path,
            resp.status()
        );
        resp.json::<T>()
            .await
            .with_context(|| format!("Failed to decode response from {}", path))
    }

    /// The logged-in user's profile.
    pub async fn me(&self) -> Result<Profile> {
        self.get_json("/api/v1/me").await
    }
}
