//! Application configuration management.
//!
//! This module handles loading configuration from environment variables.
//! It uses the `envy` crate to automatically deserialize environment variables into a type-safe struct.

use std::path::PathBuf;

use serde::Deserialize;

use crate::store::DOCUMENT_NAME;

/// Application configuration loaded from environment variables.
///
/// # Environment Variables
///
/// - `SERVER_PORT` (optional): HTTP server port, defaults to 3000
/// - `DATA_DIR` (optional): directory holding the key document, defaults to `data`
/// - `HISTORY_RETENTION` (optional): maximum superseded secrets kept per key; unbounded if unset
/// - `ROTATION_WEBHOOK_URL` (optional): endpoint notified after every rotation
/// - `ROTATION_WEBHOOK_SECRET` (required with the URL): HMAC key for webhook signatures
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_port")]
    pub server_port: u16,

    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub history_retention: Option<usize>,

    #[serde(default)]
    pub rotation_webhook_url: Option<String>,

    #[serde(default)]
    pub rotation_webhook_secret: Option<String>,
}

/// Default port if SERVER_PORT environment variable is not set.
fn default_port() -> u16 {
    3000
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// This method first attempts to load a `.env` file (which is optional),
    /// then reads environment variables and deserializes them into a Config struct.
    ///
    /// # Errors
    ///
    /// Returns an error if environment variable values cannot be parsed into expected types.
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();

        envy::from_env::<Config>()
    }

    /// Full path of the key document.
    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join(DOCUMENT_NAME)
    }
}
