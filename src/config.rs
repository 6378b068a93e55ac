//! TOML configuration for the assistant.
//!
//! Looked up at `~/.posso-voice/config.toml` unless a path is given. Every
//! key is optional; a missing default file means all defaults.

use anyhow::Context;
use directories::UserDirs;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::voice::capture::DEFAULT_FRAME_SIZE;
use crate::voice::codec::INPUT_SAMPLE_RATE;
use crate::voice::gemini_live::{DEFAULT_MODEL, DEFAULT_VOICE, GEMINI_LIVE_WS_URL};

/// Environment variables consulted, in order, when `api_key` is unset.
pub const API_KEY_ENV_VARS: [&str; 2] = ["GEMINI_API_KEY", "GOOGLE_API_KEY"];

/// Sales line that receives prepared enquiries.
pub const DEFAULT_WHATSAPP_NUMBER: &str = "447867597844";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct Config {
    /// Where this config was read from (not serialized).
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Gemini API key. Falls back to `GEMINI_API_KEY`, then `GOOGLE_API_KEY`.
    pub api_key: Option<String>,

    /// Native-audio Live model.
    pub model: String,

    /// Prebuilt voice for synthesized speech.
    pub voice: String,

    /// Live API WebSocket endpoint.
    pub endpoint: String,

    /// Seconds to wait for `setupComplete` after connecting.
    pub setup_timeout_secs: u64,

    pub audio: AudioConfig,

    pub handoff: HandoffConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct AudioConfig {
    /// Rate of microphone audio sent upstream.
    pub input_sample_rate: u32,
    /// Samples per outbound frame.
    pub frame_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct HandoffConfig {
    /// WhatsApp number in international format.
    pub whatsapp_number: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_path: PathBuf::new(),
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            voice: DEFAULT_VOICE.to_string(),
            endpoint: GEMINI_LIVE_WS_URL.to_string(),
            setup_timeout_secs: 15,
            audio: AudioConfig::default(),
            handoff: HandoffConfig::default(),
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_sample_rate: INPUT_SAMPLE_RATE,
            frame_size: DEFAULT_FRAME_SIZE,
        }
    }
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            whatsapp_number: DEFAULT_WHATSAPP_NUMBER.to_string(),
        }
    }
}

impl Config {
    /// `~/.posso-voice/config.toml`
    pub fn default_path() -> anyhow::Result<PathBuf> {
        let home = UserDirs::new()
            .map(|u| u.home_dir().to_path_buf())
            .ok_or_else(|| anyhow::anyhow!("Could not find home directory"))?;
        Ok(home.join(".posso-voice").join("config.toml"))
    }

    /// Load from `path`, or from the default location when `None`.
    ///
    /// An explicit path must exist; a missing default file yields defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::load_from(path),
            None => {
                let path = Self::default_path()?;
                if path.exists() {
                    Self::load_from(&path)
                } else {
                    tracing::debug!(path = %path.display(), "No config file, using defaults");
                    Ok(Self {
                        config_path: path,
                        ..Self::default()
                    })
                }
            }
        }
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let mut config: Config =
            toml::from_str(&contents).map_err(|e| anyhow::anyhow!("Failed to parse config: {e}"))?;
        config.config_path = path.to_path_buf();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.audio.input_sample_rate == 0 {
            anyhow::bail!("audio.input_sample_rate must be positive");
        }
        if self.audio.frame_size == 0 {
            anyhow::bail!("audio.frame_size must be positive");
        }
        if self.model.trim().is_empty() {
            anyhow::bail!("model must not be empty");
        }
        if !self.handoff.whatsapp_number.chars().any(|c| c.is_ascii_digit()) {
            anyhow::bail!("handoff.whatsapp_number must contain digits");
        }
        Ok(())
    }

    /// The API key from the file or the environment.
    pub fn api_key(&self) -> Option<String> {
        self.api_key_with(|name| std::env::var(name).ok())
    }

    fn api_key_with(&self, lookup: impl Fn(&str) -> Option<String>) -> Option<String> {
        self.api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| {
                API_KEY_ENV_VARS
                    .iter()
                    .find_map(|name| lookup(name).filter(|k| !k.trim().is_empty()))
            })
    }

    pub fn setup_timeout(&self) -> Duration {
        Duration::from_secs(self.setup_timeout_secs)
    }

    /// Copy safe to print.
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        if config.api_key.is_some() {
            config.api_key = Some("***".into());
        }
        config
    }

    /// JSON schema of the config file.
    pub fn json_schema() -> anyhow::Result<String> {
        let schema = schemars::schema_for!(Config);
        serde_json::to_string_pretty(&schema).map_err(|e| anyhow::anyhow!("Failed to render schema: {e}"))
    }
}
