use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::audio::{FRAME_SIZE, INPUT_SAMPLE_RATE, OUTPUT_SAMPLE_RATE};
use crate::error::{LiveError, Result};

pub const DEFAULT_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash-native-audio-preview-09-2025";
pub const DEFAULT_VOICE: &str = "Zephyr";
pub const DEFAULT_SYSTEM_INSTRUCTION: &str =
    "You are a friendly and helpful science tutor. Keep your answers concise and conversational.";

/// Environment variables checked, in order, for the API key
const API_KEY_VARS: [&str; 2] = ["GEMINI_API_KEY", "API_KEY"];

/// Everything a live session needs to open and run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LiveConfig {
    pub endpoint: String,
    /// Never written to disk
    #[serde(skip)]
    pub api_key: String,
    pub model: String,
    pub voice: String,
    pub system_instruction: String,
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub frame_size: usize,
    pub input_device: Option<String>,
    pub output_device: Option<String>,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_key: String::new(),
            model: DEFAULT_MODEL.to_string(),
            voice: DEFAULT_VOICE.to_string(),
            system_instruction: DEFAULT_SYSTEM_INSTRUCTION.to_string(),
            input_sample_rate: INPUT_SAMPLE_RATE,
            output_sample_rate: OUTPUT_SAMPLE_RATE,
            frame_size: FRAME_SIZE,
            input_device: None,
            output_device: None,
        }
    }
}

impl LiveConfig {
    /// Load the saved config (or defaults) and pick up the API key from the environment
    pub fn load() -> Self {
        let mut config = load_config(&config_path()).unwrap_or_default();
        config.api_key = API_KEY_VARS
            .iter()
            .find_map(|var| std::env::var(var).ok().filter(|v| !v.is_empty()))
            .unwrap_or_default();
        config
    }

    /// Persist everything but the API key
    pub fn save(&self) -> Result<()> {
        save_config(self, &config_path())
    }

    /// Fully-qualified model resource name
    pub fn model_resource(&self) -> String {
        if self.model.starts_with("models/") {
            self.model.clone()
        } else {
            format!("models/{}", self.model)
        }
    }

    /// Endpoint with the API key attached
    pub fn connect_url(&self) -> Result<String> {
        if self.endpoint.is_empty() {
            return Err(LiveError::Config("endpoint is empty".to_string()));
        }
        if self.api_key.is_empty() {
            return Ok(self.endpoint.clone());
        }
        let sep = if self.endpoint.contains('?') { '&' } else { '?' };
        Ok(format!("{}{}key={}", self.endpoint, sep, self.api_key))
    }
}

/// Path to the config file
fn config_path() -> PathBuf {
    let config_dir = dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("studyhub");
    fs::create_dir_all(&config_dir).ok();
    config_dir.join("live.json")
}

/// Load the config from its file
fn load_config(path: &Path) -> Option<LiveConfig> {
    if path.exists() {
        let content = fs::read_to_string(path).ok()?;
        match serde_json::from_str(&content) {
            Ok(config) => Some(config),
            Err(e) => {
                tracing::warn!("Ignoring unreadable config {}: {}", path.display(), e);
                None
            }
        }
    } else {
        None
    }
}

/// Save the config to its file
fn save_config(config: &LiveConfig, path: &Path) -> Result<()> {
    let content = serde_json::to_string_pretty(config)
        .map_err(|e| LiveError::Config(e.to_string()))?;
    fs::write(path, content)
        .map_err(|e| LiveError::Config(e.to_string()))?;
    Ok(())
}
