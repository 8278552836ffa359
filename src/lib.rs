//! Xtreme Playback - the playback core of an Xtream Codes IPTV client
//!
//! Turns a catalog selection into a playing session: builds the stream URL,
//! feeds the media engine through a pooled HTTP source and an on-disk media
//! cache, drives the session state machine, and remembers where the user
//! stopped watching.

pub mod cache;
pub mod config;
pub mod engine;
pub mod errors;
pub mod library;
pub mod progress;
pub mod request;
pub mod session;
pub mod tracks;
pub mod transport;


pub use config::{AppConfig, PlaybackPreferences};
pub use errors::{classify, ErrorClass, ErrorReport, PlaybackFailure, SessionError};
pub use request::{resolve, ContentKind, PlaybackRequest, ResolvedSource};
pub use session::{PlaybackSession, SessionDeps, SessionEvent, SessionState};
