//! Server configuration.

mod logging;

pub use logging::{init_tracing, LogFormat, LogLevel, LoggingConfig};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Startup options passed by the host as a JSON argv argument.
///
/// Every field is optional on the wire; absent fields take the
/// defaults below.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerOptions {
    /// Whether `http(s)://` sources may be fetched.
    pub allow_remote_source_loading: bool,
    /// Directory for the persistent database file. In-memory when absent.
    pub global_storage_path: Option<PathBuf>,
    /// Loadable GDX reader extension. May also arrive as the first
    /// positional argv argument, kept for host compatibility.
    pub gdx_extension_path: Option<PathBuf>,
    /// Logging configuration.
    pub logging: LoggingConfig,
}

impl ServerOptions {
    /// Parse the options JSON argument.
    pub fn from_json(raw: &str) -> Result<Self> {
        let options: Self = serde_json::from_str(raw)
            .map_err(|e| anyhow::anyhow!("Failed to parse options JSON: {}", e))?;
        options.validate()?;
        Ok(options)
    }

    /// Validate all fields, reporting every problem at once.
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if let Some(path) = &self.global_storage_path {
            if path.as_os_str().is_empty() {
                errors.push("globalStoragePath must not be empty".to_string());
            }
        }
        if let Some(path) = &self.gdx_extension_path {
            if path.as_os_str().is_empty() {
                errors.push("gdxExtensionPath must not be empty".to_string());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            anyhow::bail!("Options validation failed:\n  - {}", errors.join("\n  - "));
        }
    }
}
