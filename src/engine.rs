//! The seam to the media framework that demuxes, decodes and renders.
//!
//! A session configures an engine through [`EngineConfig`], drives it through
//! [`PlayerEngine`] and listens to it through the [`EngineEvent`] channel it
//! handed over at creation.

use std::fmt;
use std::sync::mpsc::Sender;
use std::sync::Arc;

use crate::errors::{EngineError, PlaybackFailure};
use crate::tracks::{MappedTrackInfo, SubtitleAttachment, TrackSelectionParameters};
use crate::transport::DataSource;

/// Buffering targets. Time thresholds win over size thresholds when
/// `prioritize_time_over_size` is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferingConfig {
    pub min_buffer_ms: u64,
    pub max_buffer_ms: u64,
    /// Media that must be buffered before playback starts
    pub buffer_for_playback_ms: u64,
    /// Media that must be buffered before playback resumes after a stall
    pub buffer_for_rebuffer_ms: u64,
    pub prioritize_time_over_size: bool,
}

impl Default for BufferingConfig {
    fn default() -> Self {
        Self {
            min_buffer_ms: 3000,
            max_buffer_ms: 30000,
            buffer_for_playback_ms: 1000,
            buffer_for_rebuffer_ms: 2000,
            prioritize_time_over_size: true,
        }
    }
}

impl BufferingConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.buffer_for_playback_ms > self.min_buffer_ms {
            return Err(EngineError::InvalidConfig(format!(
                "playback start threshold {}ms exceeds min buffer {}ms",
                self.buffer_for_playback_ms, self.min_buffer_ms
            )));
        }
        if self.buffer_for_rebuffer_ms > self.min_buffer_ms {
            return Err(EngineError::InvalidConfig(format!(
                "rebuffer threshold {}ms exceeds min buffer {}ms",
                self.buffer_for_rebuffer_ms, self.min_buffer_ms
            )));
        }
        if self.min_buffer_ms > self.max_buffer_ms {
            return Err(EngineError::InvalidConfig(format!(
                "min buffer {}ms exceeds max buffer {}ms",
                self.min_buffer_ms, self.max_buffer_ms
            )));
        }
        Ok(())
    }
}

/// Decoder choice: hardware first, software as fallback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RendererPreference {
    pub prefer_hardware: bool,
    pub decoder_fallback: bool,
}

impl Default for RendererPreference {
    fn default() -> Self {
        Self { prefer_hardware: true, decoder_fallback: true }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioUsage {
    Media,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioContentType {
    Movie,
    Music,
    Speech,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioAttributes {
    pub usage: AudioUsage,
    pub content_type: AudioContentType,
    /// Manage audio focus on the caller's behalf
    pub handle_audio_focus: bool,
    /// Pause when headphones are unplugged
    pub handle_becoming_noisy: bool,
}

impl Default for AudioAttributes {
    fn default() -> Self {
        Self {
            usage: AudioUsage::Media,
            content_type: AudioContentType::Movie,
            handle_audio_focus: true,
            handle_becoming_noisy: true,
        }
    }
}

/// Everything an engine needs at construction
#[derive(Clone)]
pub struct EngineConfig {
    pub buffering: BufferingConfig,
    pub renderers: RendererPreference,
    pub audio: AudioAttributes,
    /// Every byte the engine reads must come from here
    pub data_source: Arc<dyn DataSource>,
    /// Distance behind the live edge to play at; `None` for on-demand items
    pub live_target_offset_ms: Option<u64>,
    pub track_parameters: TrackSelectionParameters,
}

impl fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineConfig")
            .field("buffering", &self.buffering)
            .field("renderers", &self.renderers)
            .field("audio", &self.audio)
            .field("live_target_offset_ms", &self.live_target_offset_ms)
            .field("track_parameters", &self.track_parameters)
            .finish_non_exhaustive()
    }
}

/// What the engine plays: a URI plus any side-loaded subtitles
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaItem {
    pub uri: String,
    pub subtitles: Vec<SubtitleAttachment>,
}

impl MediaItem {
    pub fn new(uri: &str) -> Self {
        Self { uri: uri.to_string(), subtitles: Vec::new() }
    }

    pub fn with_subtitles(mut self, subtitles: Vec<SubtitleAttachment>) -> Self {
        self.subtitles = subtitles;
        self
    }
}

/// Notifications from the engine's callback thread
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Buffering,
    /// Enough media buffered and decodable to play
    Ready,
    Ended,
    IsPlayingChanged(bool),
    TracksChanged,
    Error(PlaybackFailure),
    /// The engine has let go of its resources; no events follow
    Released,
}

/// One media framework player instance
pub trait PlayerEngine: Send {
    fn set_media_item(&mut self, item: MediaItem);
    fn current_media_item(&self) -> Option<MediaItem>;
    fn prepare(&mut self) -> Result<(), EngineError>;
    fn play(&mut self);
    fn pause(&mut self);
    fn seek_to(&mut self, position_ms: u64);
    fn position_ms(&self) -> u64;
    /// `None` while unknown, and for live streams
    fn duration_ms(&self) -> Option<u64>;
    fn is_playing(&self) -> bool;
    /// `None` until the engine has mapped the media's tracks
    fn mapped_track_info(&self) -> Option<MappedTrackInfo>;
    fn set_track_parameters(&mut self, params: &TrackSelectionParameters);
    fn release(&mut self);
}

/// Builds engines. The sender is how the engine reports back.
pub trait EngineFactory: Send + Sync {
    fn create(&self, config: EngineConfig, events: Sender<EngineEvent>) -> Result<Box<dyn PlayerEngine>, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_buffering_is_valid() {
        let config = BufferingConfig::default();
        assert_eq!(config.min_buffer_ms, 3000);
        assert_eq!(config.max_buffer_ms, 30000);
        assert_eq!(config.buffer_for_playback_ms, 1000);
        assert_eq!(config.buffer_for_rebuffer_ms, 2000);
        assert!(config.prioritize_time_over_size);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_inconsistent_buffering_is_rejected() {
        let config = BufferingConfig { buffer_for_playback_ms: 5000, ..BufferingConfig::default() };
        assert!(matches!(config.validate(), Err(EngineError::InvalidConfig(_))));

        let config = BufferingConfig { min_buffer_ms: 40000, ..BufferingConfig::default() };
        assert!(config.validate().is_err());
    }
}
