//! Configuration management

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crate::cache;
use crate::engine::{BufferingConfig, RendererPreference};
use crate::transport::HttpConfig;

/// Language choices the playback core reads from the user's settings
pub trait PlaybackPreferences: Send + Sync {
    fn preferred_audio_language(&self) -> String;
    fn preferred_subtitle_language(&self) -> String;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    // Language preferences (two-letter codes)
    #[serde(default = "default_language")]
    pub audio_language: String,
    #[serde(default = "default_language")]
    pub subtitle_language: String,
    // Buffering targets
    #[serde(default = "default_min_buffer")]
    pub min_buffer_ms: u64,
    #[serde(default = "default_max_buffer")]
    pub max_buffer_ms: u64,
    #[serde(default = "default_playback_buffer")]
    pub buffer_for_playback_ms: u64,
    #[serde(default = "default_rebuffer")]
    pub buffer_for_rebuffer_ms: u64,
    #[serde(default = "default_live_offset")]
    pub live_target_offset_ms: u64,
    // Media cache for movies and series
    #[serde(default = "default_cache_mb")]
    pub media_cache_mb: u64,
    #[serde(default)]
    pub media_cache_dir: Option<PathBuf>,
    // Network
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    // Hardware acceleration
    #[serde(default = "default_true")]
    pub hw_accel: bool,
}

fn default_language() -> String { "tr".to_string() }
fn default_min_buffer() -> u64 { 3000 }
fn default_max_buffer() -> u64 { 30000 }
fn default_playback_buffer() -> u64 { 1000 }
fn default_rebuffer() -> u64 { 2000 }
fn default_live_offset() -> u64 { 5000 }
fn default_cache_mb() -> u64 { 200 }
fn default_user_agent() -> String { "XtremePlayback/1.0".to_string() }
fn default_true() -> bool { true }

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            audio_language: default_language(),
            subtitle_language: default_language(),
            min_buffer_ms: 3000,
            max_buffer_ms: 30000,
            buffer_for_playback_ms: 1000,
            buffer_for_rebuffer_ms: 2000,
            live_target_offset_ms: 5000,
            media_cache_mb: 200,
            media_cache_dir: None,
            user_agent: default_user_agent(),
            hw_accel: true,
        }
    }
}

impl AppConfig {
    pub fn config_dir() -> PathBuf {
        let mut path = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push("xtreme_playback");
        fs::create_dir_all(&path).ok();
        path
    }

    fn config_path() -> PathBuf {
        Self::config_dir().join("config.json")
    }

    pub fn load() -> Self {
        let path = Self::config_path();

        if path.exists() {
            if let Ok(content) = fs::read_to_string(&path) {
                match serde_json::from_str(&content) {
                    Ok(config) => return config,
                    Err(e) => log::warn!("Ignoring unreadable config {}: {}", path.display(), e),
                }
            }
        }

        Self::default()
    }

    pub fn save(&self) {
        let path = Self::config_path();
        if let Ok(content) = serde_json::to_string_pretty(self) {
            if let Err(e) = fs::write(&path, content) {
                log::warn!("Could not save config to {}: {}", path.display(), e);
            }
        }
    }

    pub fn buffering(&self) -> BufferingConfig {
        BufferingConfig {
            min_buffer_ms: self.min_buffer_ms,
            max_buffer_ms: self.max_buffer_ms,
            buffer_for_playback_ms: self.buffer_for_playback_ms,
            buffer_for_rebuffer_ms: self.buffer_for_rebuffer_ms,
            prioritize_time_over_size: true,
        }
    }

    pub fn renderers(&self) -> RendererPreference {
        RendererPreference { prefer_hardware: self.hw_accel, decoder_fallback: true }
    }

    pub fn http(&self) -> HttpConfig {
        HttpConfig {
            user_agent: self.user_agent.clone(),
            ..HttpConfig::default()
        }
    }

    pub fn cache_capacity_bytes(&self) -> u64 {
        self.media_cache_mb.saturating_mul(1024 * 1024)
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.media_cache_dir.clone().unwrap_or_else(cache::default_dir)
    }
}

impl PlaybackPreferences for AppConfig {
    fn preferred_audio_language(&self) -> String {
        self.audio_language.clone()
    }

    fn preferred_subtitle_language(&self) -> String {
        self.subtitle_language.clone()
    }
}
