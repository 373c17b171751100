//! # Configuration Management
//!
//! Loads application configuration from multiple sources:
//! - TOML configuration file (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Special environment variables (HOST, PORT, GEMINI_API_KEY)
//! 2. Environment variables (APP_SERVER_HOST, APP_SERVER_PORT, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)

use crate::audio::codec::AudioFormat;
use crate::live::protocol::SessionSetup;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub live: LiveConfig,
    pub audio: AudioConfig,
    pub performance: PerformanceConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Remote speech service settings.
///
/// ## Fields:
/// - `endpoint`: WebSocket URL of the bidirectional streaming endpoint
/// - `api_key`: appended to the endpoint as `?key=`; never echoed by the API
/// - `model`: speech model identifier sent in the session setup
/// - `voice_name`: synthesized voice identifier
/// - `system_instruction`: prompt that frames the assistant's behaviour
/// - `connect_timeout_ms`: how long to wait for the setup acknowledgement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveConfig {
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    pub voice_name: String,
    pub system_instruction: String,
    pub connect_timeout_ms: u64,
}

/// Audio pipeline settings.
///
/// ## Defaults:
/// - Capture: 16kHz mono, 4096-sample frames (~256ms per frame)
/// - Playback: 24kHz mono, which is what the speech service synthesizes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub channels: u16,
    pub capture_frame_size: usize,
}

/// Performance tuning configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    /// Maximum number of live calls bridged at once
    pub max_concurrent_calls: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            live: LiveConfig {
                endpoint: "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent".to_string(),
                api_key: String::new(),
                model: "models/gemini-2.5-flash-native-audio-preview-09-2025".to_string(),
                voice_name: "Zephyr".to_string(),
                system_instruction: "You are a friendly, concise voice assistant. Keep answers short and conversational.".to_string(),
                connect_timeout_ms: 10_000,
            },
            audio: AudioConfig {
                input_sample_rate: 16000,
                output_sample_rate: 24000,
                channels: 1,
                capture_frame_size: 4096,
            },
            performance: PerformanceConfig {
                max_concurrent_calls: 10,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER_PORT=3000`: Override server port
    /// - `HOST=0.0.0.0` / `PORT=3000`: Special cases for deployment platforms
    /// - `GEMINI_API_KEY=...`: Speech service credential
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("_"));

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        // The service credential rarely follows the APP_ convention
        if let Ok(key) = env::var("GEMINI_API_KEY") {
            settings = settings.set_override("live.api_key", key)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0
    /// - Sample rates and channel count are non-zero
    /// - Capture frame size is a power of two in 256..=16384, the range
    ///   audio hosts accept for processing taps
    /// - A voice is selected and at least one call is allowed
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.audio.input_sample_rate == 0 || self.audio.output_sample_rate == 0 {
            return Err(anyhow::anyhow!("Sample rates must be greater than 0"));
        }

        if self.audio.channels == 0 {
            return Err(anyhow::anyhow!("Channel count must be greater than 0"));
        }

        let frame = self.audio.capture_frame_size;
        if !frame.is_power_of_two() || !(256..=16384).contains(&frame) {
            return Err(anyhow::anyhow!(
                "Capture frame size must be a power of two between 256 and 16384, got {}",
                frame
            ));
        }

        if self.live.voice_name.trim().is_empty() {
            return Err(anyhow::anyhow!("Voice name cannot be empty"));
        }

        if self.performance.max_concurrent_calls == 0 {
            return Err(anyhow::anyhow!("Max concurrent calls must be greater than 0"));
        }

        Ok(())
    }

    /// Update configuration from a JSON string (runtime config updates).
    ///
    /// Only the fields present in the JSON are touched, e.g.
    /// `{"live": {"voice_name": "Puck"}}` changes just the voice.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(server) = partial_config.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                self.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                self.server.port = u16::try_from(port)
                    .map_err(|_| anyhow::anyhow!("Server port out of range: {}", port))?;
            }
        }

        if let Some(live) = partial_config.get("live") {
            if let Some(model) = live.get("model").and_then(|v| v.as_str()) {
                self.live.model = model.to_string();
            }
            if let Some(voice) = live.get("voice_name").and_then(|v| v.as_str()) {
                self.live.voice_name = voice.to_string();
            }
            if let Some(prompt) = live.get("system_instruction").and_then(|v| v.as_str()) {
                self.live.system_instruction = prompt.to_string();
            }
            if let Some(timeout) = live.get("connect_timeout_ms").and_then(|v| v.as_u64()) {
                self.live.connect_timeout_ms = timeout;
            }
        }

        if let Some(audio) = partial_config.get("audio") {
            if let Some(frame) = audio.get("capture_frame_size").and_then(|v| v.as_u64()) {
                self.audio.capture_frame_size = frame as usize;
            }
        }

        if let Some(performance) = partial_config.get("performance") {
            if let Some(calls) = performance.get("max_concurrent_calls").and_then(|v| v.as_u64()) {
                self.performance.max_concurrent_calls = calls as usize;
            }
        }

        self.validate()?;
        Ok(())
    }

    /// Session setup derived from the live and audio sections.
    pub fn session_setup(&self) -> SessionSetup {
        SessionSetup {
            model: self.live.model.clone(),
            voice_name: self.live.voice_name.clone(),
            system_instruction: self.live.system_instruction.clone(),
            input_sample_rate: self.audio.input_sample_rate,
            transcribe_input: true,
            transcribe_output: true,
        }
    }

    /// Format of the audio captured from the microphone.
    pub fn input_format(&self) -> AudioFormat {
        AudioFormat::new(self.audio.input_sample_rate, self.audio.channels)
    }

    /// Format of the synthesized audio received from the service.
    pub fn output_format(&self) -> AudioFormat {
        AudioFormat::new(self.audio.output_sample_rate, self.audio.channels)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.live.connect_timeout_ms)
    }

    /// Endpoint URL with the API key attached, if one is configured.
    pub fn service_url(&self) -> String {
        if self.live.api_key.is_empty() {
            self.live.endpoint.clone()
        } else {
            format!("{}?key={}", self.live.endpoint, self.live.api_key)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.audio.input_sample_rate, 16000);
        assert_eq!(config.audio.output_sample_rate, 24000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.capture_frame_size = 4000;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.live.voice_name = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"live": {"voice_name": "Puck"}, "server": {"port": 9090}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.live.voice_name, "Puck");
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.host, "127.0.0.1");
    }

    #[test]
    fn test_config_update_rejects_invalid_frame_size() {
        let mut config = AppConfig::default();
        let json = r#"{"audio": {"capture_frame_size": 1000}}"#;
        assert!(config.update_from_json(json).is_err());
    }

    #[test]
    fn test_service_url_appends_key() {
        let mut config = AppConfig::default();
        assert!(!config.service_url().contains("key="));
        config.live.api_key = "secret".to_string();
        assert!(config.service_url().ends_with("?key=secret"));
    }

    #[test]
    fn test_session_setup_uses_live_settings() {
        let config = AppConfig::default();
        let setup = config.session_setup();
        assert_eq!(setup.voice_name, "Zephyr");
        assert_eq!(setup.input_sample_rate, 16000);
        assert!(setup.transcribe_input && setup.transcribe_output);
    }
}
