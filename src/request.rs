//! Playback requests and stream URL resolution
//!
//! A request either carries a direct URI (playlist entries, demo streams) or
//! the Xtream Codes credentials needed to build the server's stream path.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::RequestError;

/// Content category; decides the URL template and whether resume/cache apply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    #[default]
    Live,
    Vod,
    Series,
}

impl ContentKind {
    /// Parse the stream type string used by the catalog ("live", "vod", "series").
    /// Anything unrecognised is treated as live, which is what the server path
    /// convention falls back to as well.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "vod" | "movie" => ContentKind::Vod,
            "series" => ContentKind::Series,
            _ => ContentKind::Live,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ContentKind::Live => "live",
            ContentKind::Vod => "vod",
            ContentKind::Series => "series",
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, ContentKind::Live)
    }
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything needed to start playing one item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybackRequest {
    pub server: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub direct_uri: Option<String>,
    pub content_id: Option<i64>,
    #[serde(default)]
    pub kind: ContentKind,
    #[serde(default = "default_extension")]
    pub extension: String,
    #[serde(default = "default_category")]
    pub category_id: String,
    #[serde(default)]
    pub next_episode_id: Option<i64>,
    // Display metadata, only used for favorites
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub icon: String,
}

fn default_extension() -> String { "mp4".to_string() }
fn default_category() -> String { "0".to_string() }

impl Default for PlaybackRequest {
    fn default() -> Self {
        Self {
            server: None,
            username: None,
            password: None,
            direct_uri: None,
            content_id: None,
            kind: ContentKind::Live,
            extension: default_extension(),
            category_id: default_category(),
            next_episode_id: None,
            name: String::new(),
            icon: String::new(),
        }
    }
}

impl PlaybackRequest {
    /// Request for an item on an Xtream Codes server
    pub fn xtream(server: &str, username: &str, password: &str, content_id: i64, kind: ContentKind) -> Self {
        Self {
            server: Some(server.to_string()),
            username: Some(username.to_string()),
            password: Some(password.to_string()),
            content_id: Some(content_id),
            kind,
            ..Self::default()
        }
    }

    /// Request that plays a URI as-is
    pub fn direct(uri: &str) -> Self {
        Self {
            direct_uri: Some(uri.to_string()),
            ..Self::default()
        }
    }

    pub fn with_extension(mut self, extension: &str) -> Self {
        self.extension = extension.to_string();
        self
    }

    pub fn with_category(mut self, category_id: &str) -> Self {
        self.category_id = category_id.to_string();
        self
    }

    pub fn with_next_episode(mut self, next_episode_id: i64) -> Self {
        self.next_episode_id = Some(next_episode_id);
        self
    }

    pub fn with_display(mut self, name: &str, icon: &str) -> Self {
        self.name = name.to_string();
        self.icon = icon.to_string();
        self
    }

    /// Check that the request can be turned into a source
    pub fn validate(&self) -> Result<(), RequestError> {
        if self.direct_uri.as_deref().is_some_and(|uri| !uri.trim().is_empty()) {
            return Ok(());
        }
        if is_blank(&self.server) {
            return Err(RequestError::InvalidRequest { missing: "server" });
        }
        if is_blank(&self.username) {
            return Err(RequestError::InvalidRequest { missing: "username" });
        }
        match self.content_id {
            Some(id) if id >= 0 => Ok(()),
            _ => Err(RequestError::InvalidRequest { missing: "content id" }),
        }
    }

    /// Request for the episode after this one, if the catalog told us about it
    pub fn next_episode(&self) -> Option<PlaybackRequest> {
        let next_id = self.next_episode_id?;
        if self.direct_uri.is_some() {
            return None;
        }
        Some(PlaybackRequest {
            content_id: Some(next_id),
            next_episode_id: None,
            name: String::new(),
            icon: String::new(),
            ..self.clone()
        })
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, |v| v.trim().is_empty())
}

/// Final playable URI for a session
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResolvedSource(String);

impl ResolvedSource {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResolvedSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Build the playable URI for a request. No network access.
pub fn resolve(request: &PlaybackRequest) -> Result<ResolvedSource, RequestError> {
    request.validate()?;

    if let Some(uri) = request.direct_uri.as_deref().filter(|u| !u.trim().is_empty()) {
        return Ok(ResolvedSource(uri.to_string()));
    }

    // validate() guarantees these are present
    let server = request.server.as_deref().unwrap_or_default().trim().trim_end_matches('/');
    let username = urlencoding::encode(request.username.as_deref().unwrap_or_default());
    let password = urlencoding::encode(request.password.as_deref().unwrap_or_default());
    let id = request.content_id.unwrap_or_default();
    let extension = match request.extension.trim().trim_start_matches('.') {
        "" => "mp4",
        ext => ext,
    };

    let uri = match request.kind {
        ContentKind::Vod => format!("{}/movie/{}/{}/{}.{}", server, username, password, id, extension),
        ContentKind::Series => format!("{}/series/{}/{}/{}.{}", server, username, password, id, extension),
        ContentKind::Live => format!("{}/live/{}/{}/{}.m3u8", server, username, password, id),
    };
    Ok(ResolvedSource(uri))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_uri_passes_through() {
        let request = PlaybackRequest::direct("http://cdn.test/demo/big buck.mp4?token=a&b=c");
        let source = resolve(&request).unwrap();
        assert_eq!(source.as_str(), "http://cdn.test/demo/big buck.mp4?token=a&b=c");
    }

    #[test]
    fn test_vod_template() {
        let request = PlaybackRequest::xtream("http://x.test", "u", "p", 42, ContentKind::Vod)
            .with_extension("mkv");
        assert_eq!(resolve(&request).unwrap().as_str(), "http://x.test/movie/u/p/42.mkv");
    }

    #[test]
    fn test_series_template_strips_trailing_slash() {
        let request = PlaybackRequest::xtream("http://x.test:8080/", "u", "p", 7, ContentKind::Series);
        assert_eq!(resolve(&request).unwrap().as_str(), "http://x.test:8080/series/u/p/7.mp4");
    }

    #[test]
    fn test_live_template_ignores_extension() {
        let request = PlaybackRequest::xtream("http://x.test", "u", "p", 1001, ContentKind::Live)
            .with_extension("ts");
        assert_eq!(resolve(&request).unwrap().as_str(), "http://x.test/live/u/p/1001.m3u8");
    }

    #[test]
    fn test_credentials_are_percent_encoded() {
        let request = PlaybackRequest::xtream("http://x.test", "a b", "p@ss/w?rd", 5, ContentKind::Vod);
        assert_eq!(
            resolve(&request).unwrap().as_str(),
            "http://x.test/movie/a%20b/p%40ss%2Fw%3Frd/5.mp4"
        );
    }

    #[test]
    fn test_missing_fields_rejected() {
        let mut request = PlaybackRequest::xtream("http://x.test", "u", "p", 5, ContentKind::Vod);
        request.username = Some("  ".to_string());
        assert_eq!(
            resolve(&request),
            Err(RequestError::InvalidRequest { missing: "username" })
        );

        let mut request = PlaybackRequest::xtream("", "u", "p", 5, ContentKind::Vod);
        assert_eq!(request.validate(), Err(RequestError::InvalidRequest { missing: "server" }));
        request.server = Some("http://x.test".to_string());
        request.content_id = None;
        assert_eq!(request.validate(), Err(RequestError::InvalidRequest { missing: "content id" }));

        assert!(PlaybackRequest::default().validate().is_err());
    }

    #[test]
    fn test_empty_password_is_allowed() {
        let request = PlaybackRequest::xtream("http://x.test", "u", "", 3, ContentKind::Vod);
        assert_eq!(resolve(&request).unwrap().as_str(), "http://x.test/movie/u//3.mp4");
    }

    #[test]
    fn test_kind_parse() {
        assert_eq!(ContentKind::parse("vod"), ContentKind::Vod);
        assert_eq!(ContentKind::parse("Series"), ContentKind::Series);
        assert_eq!(ContentKind::parse("radio"), ContentKind::Live);
        assert_eq!(serde_json::to_string(&ContentKind::Series).unwrap(), "\"series\"");
    }

    #[test]
    fn test_next_episode_request() {
        let request = PlaybackRequest::xtream("http://x.test", "u", "p", 10, ContentKind::Series)
            .with_extension("mkv")
            .with_next_episode(11)
            .with_display("Episode 10", "");
        let next = request.next_episode().unwrap();
        assert_eq!(next.content_id, Some(11));
        assert_eq!(next.next_episode_id, None);
        assert_eq!(next.extension, "mkv");
        assert_eq!(resolve(&next).unwrap().as_str(), "http://x.test/series/u/p/11.mkv");

        assert!(PlaybackRequest::direct("http://a.test/x.mp4").next_episode().is_none());
    }
}
