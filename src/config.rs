//! # Configuration Management
//!
//! Loads the service configuration from layered sources:
//! - Default values (built into the code)
//! - TOML configuration file (config.toml)
//! - Environment variables (with APP__ prefix)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` (deployment platforms)
//! 2. Environment variables (`APP__SERVER__PORT`, `APP__UPSTREAM__STREAM_URL`, ...)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! Field names contain underscores, so nested keys are separated by a double
//! underscore: `APP__TRANSCRIPT__AGENT_DISPLAY_NAME=Riley`.

use crate::audio::enhance::EnhancementConfig;
use crate::call::session::SessionSettings;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Main application configuration.
///
/// A snapshot is taken when a monitoring socket connects, so runtime updates
/// apply to calls opened after the update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub enhancement: EnhancementConfig,
    pub transcript: TranscriptConfig,
    pub playback: PlaybackConfig,
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
    /// Monitoring sockets beyond this limit are refused with 503
    pub max_concurrent_calls: usize,
}

/// Call stream connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// WebSocket URL of the call stream; `{call_id}` is substituted per call
    pub stream_url: String,
    /// Seconds between keepalive pings
    pub keepalive_interval_secs: u64,
    /// The call fails if no status event arrives within this many seconds
    pub status_timeout_secs: u64,
}

/// Transcript ordering and display settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptConfig {
    /// How many intervals an agent final may wait for the caller's final
    pub pending_final_attempts: u32,
    pub pending_final_interval_ms: u64,
    pub agent_display_name: String,
    /// Used when the monitoring client does not pass `display_name`
    pub default_caller_name: String,
}

/// Playback defaults for new monitoring sessions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlaybackConfig {
    pub mute_caller_on_start: bool,
    pub mute_agent_on_start: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
                max_concurrent_calls: 50,
            },
            upstream: UpstreamConfig {
                stream_url: "ws://127.0.0.1:9000/calls/{call_id}/stream".to_string(),
                keepalive_interval_secs: 25,
                status_timeout_secs: 60,
            },
            enhancement: EnhancementConfig::default(),
            transcript: TranscriptConfig {
                pending_final_attempts: 10,
                pending_final_interval_ms: 250,
                agent_display_name: "Agent".to_string(),
                default_caller_name: "Caller".to_string(),
            },
            playback: PlaybackConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP__SERVER__PORT=3000`: Override server port
    /// - `APP__UPSTREAM__STATUS_TIMEOUT_SECS=30`: Fail silent calls sooner
    /// - `HOST=0.0.0.0`: Special case for deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("APP").prefix_separator("__").separator("__"));

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config: AppConfig = settings.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.server.max_concurrent_calls == 0 {
            return Err(anyhow::anyhow!("Max concurrent calls must be greater than 0"));
        }

        if !self.upstream.stream_url.starts_with("ws://") && !self.upstream.stream_url.starts_with("wss://") {
            return Err(anyhow::anyhow!("Upstream stream_url must be a ws:// or wss:// URL"));
        }

        if self.upstream.keepalive_interval_secs == 0 {
            return Err(anyhow::anyhow!("Keepalive interval must be greater than 0"));
        }

        if self.upstream.status_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Status timeout must be greater than 0"));
        }

        if self.transcript.pending_final_attempts == 0 || self.transcript.pending_final_interval_ms == 0 {
            return Err(anyhow::anyhow!("Pending final attempts and interval must be greater than 0"));
        }

        self.enhancement
            .validate()
            .map_err(|e| anyhow::anyhow!("Invalid enhancement settings: {}", e))?;

        Ok(())
    }

    /// Settings for a new call session.
    pub fn session_settings(&self, caller_name: Option<&str>) -> SessionSettings {
        let caller_name = caller_name
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .unwrap_or(&self.transcript.default_caller_name);
        SessionSettings {
            caller_name: caller_name.to_string(),
            agent_name: self.transcript.agent_display_name.clone(),
            status_timeout: Duration::from_secs(self.upstream.status_timeout_secs),
            pending_final_attempts: self.transcript.pending_final_attempts,
            pending_final_interval: Duration::from_millis(self.transcript.pending_final_interval_ms),
        }
    }

    /// Update configuration from a JSON string (used for runtime config updates).
    ///
    /// Only the fields present in the JSON are changed, e.g.
    /// `{"transcript": {"agent_display_name": "Riley"}}`. The updated
    /// configuration is validated before it is kept.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;
        let mut updated = self.clone();

        if let Some(server) = partial_config.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                updated.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                updated.server.port = u16::try_from(port).map_err(|_| anyhow::anyhow!("Server port out of range"))?;
            }
            if let Some(calls) = server.get("max_concurrent_calls").and_then(|v| v.as_u64()) {
                updated.server.max_concurrent_calls = calls as usize;
            }
        }

        if let Some(upstream) = partial_config.get("upstream") {
            if let Some(url) = upstream.get("stream_url").and_then(|v| v.as_str()) {
                updated.upstream.stream_url = url.to_string();
            }
            if let Some(secs) = upstream.get("keepalive_interval_secs").and_then(|v| v.as_u64()) {
                updated.upstream.keepalive_interval_secs = secs;
            }
            if let Some(secs) = upstream.get("status_timeout_secs").and_then(|v| v.as_u64()) {
                updated.upstream.status_timeout_secs = secs;
            }
        }

        if let Some(enhancement) = partial_config.get("enhancement") {
            updated.enhancement = merge_section(&updated.enhancement, enhancement)?;
        }

        if let Some(transcript) = partial_config.get("transcript") {
            if let Some(attempts) = transcript.get("pending_final_attempts").and_then(|v| v.as_u64()) {
                updated.transcript.pending_final_attempts = attempts.min(u32::MAX as u64) as u32;
            }
            if let Some(ms) = transcript.get("pending_final_interval_ms").and_then(|v| v.as_u64()) {
                updated.transcript.pending_final_interval_ms = ms;
            }
            if let Some(name) = transcript.get("agent_display_name").and_then(|v| v.as_str()) {
                updated.transcript.agent_display_name = name.to_string();
            }
            if let Some(name) = transcript.get("default_caller_name").and_then(|v| v.as_str()) {
                updated.transcript.default_caller_name = name.to_string();
            }
        }

        if let Some(playback) = partial_config.get("playback") {
            if let Some(muted) = playback.get("mute_caller_on_start").and_then(|v| v.as_bool()) {
                updated.playback.mute_caller_on_start = muted;
            }
            if let Some(muted) = playback.get("mute_agent_on_start").and_then(|v| v.as_bool()) {
                updated.playback.mute_agent_on_start = muted;
            }
        }

        updated.validate()?;
        *self = updated;
        Ok(())
    }
}

/// Overlay the keys of a JSON object onto a serializable section.
fn merge_section<T>(current: &T, patch: &serde_json::Value) -> Result<T>
where
    T: Serialize + serde::de::DeserializeOwned,
{
    let mut value = serde_json::to_value(current)?;
    if let (Some(target), Some(patch)) = (value.as_object_mut(), patch.as_object()) {
        for (key, v) in patch {
            if target.contains_key(key) {
                target.insert(key.clone(), v.clone());
            }
        }
    }
    Ok(serde_json::from_value(value)?)
}
