//! Track enumeration and selection policy
//!
//! The engine exposes its current track mapping as renderers, each holding
//! groups of formats. Descriptors handed to the UI carry an opaque locator
//! into that mapping which is only meaningful for the session that made it.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TrackType {
    Video,
    Audio,
    Text,
}

/// How well the engine can output a format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatSupport {
    Handled,
    ExceedsCapabilities,
    UnsupportedSubtype,
    Unsupported,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrackFormat {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub bitrate: Option<u32>,
    pub language: Option<String>,
    pub label: Option<String>,
    pub support: FormatSupport,
}

impl TrackFormat {
    pub fn video(width: u32, height: u32) -> Self {
        Self {
            width: Some(width),
            height: Some(height),
            bitrate: None,
            language: None,
            label: None,
            support: FormatSupport::Handled,
        }
    }

    pub fn audio(language: Option<&str>) -> Self {
        Self {
            width: None,
            height: None,
            bitrate: None,
            language: language.map(str::to_string),
            label: None,
            support: FormatSupport::Handled,
        }
    }

    pub fn text(language: Option<&str>, label: Option<&str>) -> Self {
        Self {
            label: label.map(str::to_string),
            ..Self::audio(language)
        }
    }

    pub fn with_support(mut self, support: FormatSupport) -> Self {
        self.support = support;
        self
    }

    fn display_label(&self, track_type: TrackType) -> String {
        let language = self.language.as_deref().unwrap_or("und");
        match track_type {
            TrackType::Video => format!("{}x{}", self.width.unwrap_or(0), self.height.unwrap_or(0)),
            TrackType::Audio => language.to_string(),
            TrackType::Text => format!("{} ({})", language, self.label.as_deref().unwrap_or("Unknown")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct TrackGroup {
    pub formats: Vec<TrackFormat>,
}

/// Tracks one decoder pipeline can play
#[derive(Debug, Clone, PartialEq)]
pub struct RendererTracks {
    pub track_type: TrackType,
    pub groups: Vec<TrackGroup>,
}

/// Snapshot of the engine's track mapping
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MappedTrackInfo {
    pub renderers: Vec<RendererTracks>,
}

/// Identity of a playback session, used to scope track locators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl SessionId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        SessionId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Opaque handle to one track inside one session's mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackLocator {
    session: SessionId,
    renderer: usize,
    group: usize,
    track: usize,
}

impl TrackLocator {
    pub(crate) fn session(&self) -> SessionId {
        self.session
    }

    pub(crate) fn to_override(self) -> TrackOverride {
        TrackOverride { renderer: self.renderer, group: self.group, track: self.track }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackDescriptor {
    pub track_type: TrackType,
    pub label: String,
    locator: TrackLocator,
}

impl TrackDescriptor {
    pub fn locator(&self) -> TrackLocator {
        self.locator
    }
}

/// Forced selection of one track, addressed inside the engine's mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackOverride {
    pub renderer: usize,
    pub group: usize,
    pub track: usize,
}

/// Constraints and overrides the engine applies when picking tracks
#[derive(Debug, Clone, PartialEq)]
pub struct TrackSelectionParameters {
    pub preferred_audio_language: Option<String>,
    pub preferred_text_language: Option<String>,
    pub max_video_width: u32,
    pub max_video_height: u32,
    pub max_video_bitrate: u32,
    pub select_undetermined_text_language: bool,
    disabled: BTreeSet<TrackType>,
    overrides: BTreeMap<TrackType, TrackOverride>,
}

impl TrackSelectionParameters {
    /// Session defaults: preferred languages from the user's settings, no cap on
    /// video size or bitrate, subtitles enabled and allowed to be untagged.
    pub fn defaults(audio_language: &str, text_language: &str) -> Self {
        Self {
            preferred_audio_language: non_empty(audio_language),
            preferred_text_language: non_empty(text_language),
            max_video_width: u32::MAX,
            max_video_height: u32::MAX,
            max_video_bitrate: u32::MAX,
            select_undetermined_text_language: true,
            disabled: BTreeSet::new(),
            overrides: BTreeMap::new(),
        }
    }

    /// Replace whatever was forced for this type; re-enables the type
    pub fn set_override(&mut self, track_type: TrackType, track: TrackOverride) {
        self.disabled.remove(&track_type);
        self.overrides.insert(track_type, track);
    }

    /// Remove every track of this type from output
    pub fn disable(&mut self, track_type: TrackType) {
        self.overrides.remove(&track_type);
        self.disabled.insert(track_type);
    }

    pub fn is_disabled(&self, track_type: TrackType) -> bool {
        self.disabled.contains(&track_type)
    }

    pub fn override_for(&self, track_type: TrackType) -> Option<TrackOverride> {
        self.overrides.get(&track_type).copied()
    }
}

fn non_empty(code: &str) -> Option<String> {
    let code = code.trim();
    (!code.is_empty()).then(|| code.to_ascii_lowercase())
}

/// Every playable track of a type, in renderer/group/track order
pub fn list_tracks(info: &MappedTrackInfo, track_type: TrackType, session: SessionId) -> Vec<TrackDescriptor> {
    let mut tracks = Vec::new();
    for (renderer, tracks_of_renderer) in info.renderers.iter().enumerate() {
        if tracks_of_renderer.track_type != track_type {
            continue;
        }
        for (group, track_group) in tracks_of_renderer.groups.iter().enumerate() {
            for (track, format) in track_group.formats.iter().enumerate() {
                if format.support != FormatSupport::Handled {
                    continue;
                }
                tracks.push(TrackDescriptor {
                    track_type,
                    label: format.display_label(track_type),
                    locator: TrackLocator { session, renderer, group, track },
                });
            }
        }
    }
    tracks
}

/// Three-letter spelling for two-letter codes, as used in many stream labels
pub fn language_alias(code: &str) -> Option<&'static str> {
    match code {
        "tr" => Some("tur"),
        "ru" => Some("rus"),
        "en" => Some("eng"),
        "de" => Some("ger"),
        "fr" => Some("fre"),
        "es" => Some("spa"),
        "ar" => Some("ara"),
        _ => None,
    }
}

/// Pick the subtitle to turn on when playback becomes ready: first label that
/// contains the preferred code, then the first that contains its alias.
pub fn auto_select_subtitle<'a>(tracks: &'a [TrackDescriptor], preferred: &str) -> Option<&'a TrackDescriptor> {
    let preferred = preferred.trim().to_lowercase();
    if preferred.is_empty() {
        return None;
    }
    let find = |needle: &str| {
        tracks
            .iter()
            .filter(|t| t.track_type == TrackType::Text)
            .find(|t| t.label.to_lowercase().contains(needle))
    };
    find(preferred.as_str()).or_else(|| language_alias(&preferred).and_then(find))
}

/// A subtitle file supplied by the user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubtitleAttachment {
    pub uri: String,
    pub mime_type: String,
    pub language: String,
    /// Selected by default once attached
    pub default: bool,
}

impl SubtitleAttachment {
    pub const SUBRIP: &'static str = "application/x-subrip";

    pub fn subrip(uri: &str, language: &str) -> Self {
        Self {
            uri: uri.to_string(),
            mime_type: Self::SUBRIP.to_string(),
            language: language.to_string(),
            default: true,
        }
    }
}

/// Web search link for finding subtitles for a title
pub fn subtitle_search_url(title: &str, language: &str) -> String {
    let language_name = match language {
        "tr" => "Turkish",
        "ru" => "Russian",
        _ => "English",
    };
    format!(
        "https://www.google.com/search?q={}",
        urlencoding::encode(&format!("{} {} subtitle srt", title, language_name))
    )
}
