//! Service configuration, loaded from TOML with environment overrides.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::consts::*;
use crate::error::Result;
use crate::ERR;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
   /// Id of the crypto backend every signature is checked with.
   pub backend: String,
   /// Random bytes in a server-generated negotiation id.
   pub negotiation_id_bytes: usize,
   /// `tracing_subscriber::EnvFilter` directives.
   pub log_filter: String,
   pub snapshot_path: Option<PathBuf>,
   pub poll: PollConfig,
}

impl Default for Config {
   fn default() -> Self {
      return Config {
         backend: ED25519_BACKEND.to_string(),
         negotiation_id_bytes: NEGOTIATION_ID_BYTES,
         log_filter: String::from("info"),
         snapshot_path: None,
         poll: PollConfig::default(),
      };
   }
}

/// Client-side polling used while waiting for a negotiation to close.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
   pub tick_ms: u64,
   pub timeout_ms: u64,
}

impl Default for PollConfig {
   fn default() -> Self {
      return PollConfig { tick_ms: POLL_TICK_MS, timeout_ms: POLL_TIMEOUT_MS };
   }
}

impl Config {
   /// Read a config file. Missing keys take their defaults.
   pub fn load(path: &Path) -> Result<Config> {
      let contents = fs::read_to_string(path)
         .map_err(|err| ERR!(Storage, "failed to read {}: {err}", path.display()))?;
      return Config::from_toml_str(&contents);
   }

   pub fn from_toml_str(contents: &str) -> Result<Config> {
      let config: Config = toml::from_str(contents)
         .map_err(|err| ERR!(Invalid, "failed to parse config: {err}"))?;
      if config.negotiation_id_bytes == 0 {
         return Err(ERR!(Invalid, "negotiation_id_bytes must be positive"));
      }
      return Ok(config);
   }

   /// Apply `MIXNET_BACKEND`, `MIXNET_LOG` and `MIXNET_SNAPSHOT`.
   pub fn apply_env_overrides(&mut self) {
      self.apply_overrides(|key| std::env::var(key).ok());
   }

   fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
      if let Some(backend) = lookup("MIXNET_BACKEND") {
         self.backend = backend;
      }
      if let Some(filter) = lookup("MIXNET_LOG") {
         self.log_filter = filter;
      }
      if let Some(path) = lookup("MIXNET_SNAPSHOT") {
         self.snapshot_path = Some(PathBuf::from(path));
      }
   }
}
