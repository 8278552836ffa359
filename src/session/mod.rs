//! Playback session: one engine instance playing one request
//!
//! A session owns its engine and two helper threads. The `engine-events`
//! thread applies engine notifications to the session state, and the
//! `progress-tick` thread samples position and throughput once a second
//! while playback is running. Both only hold weak references, so dropping
//! the session is always enough to shut everything down.

mod events;
mod ticker;

pub use events::{SessionEvent, SessionState};

use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info, warn};

use crate::cache::{CacheProvider, SharedDiskCache};
use crate::config::{AppConfig, PlaybackPreferences};
use crate::engine::{
    AudioAttributes, BufferingConfig, EngineConfig, EngineEvent, EngineFactory, MediaItem, PlayerEngine,
    RendererPreference,
};
use crate::errors::{classify, ErrorClass, ErrorReport, SessionError, StoreError};
use crate::library::{Favorite, LibraryStore};
use crate::progress::{Clock, ProgressTracker, SystemClock, SKIP_INTRO_JUMP_MS};
use crate::request::{resolve, PlaybackRequest, ResolvedSource};
use crate::tracks::{
    auto_select_subtitle, list_tracks, SessionId, SubtitleAttachment, TrackDescriptor, TrackSelectionParameters,
    TrackType,
};
use crate::transport::{data_source_for, BandwidthMeter, DataSource, HttpDataSource};

use events::EventBus;
use ticker::{TickControl, Ticker};

/// Collaborators and settings shared by every session of an application
#[derive(Clone)]
pub struct SessionDeps {
    pub engine_factory: Arc<dyn EngineFactory>,
    pub library: Arc<dyn LibraryStore>,
    pub preferences: Arc<dyn PlaybackPreferences>,
    /// Network source; on-demand items get the media cache layered on top
    pub upstream: Arc<dyn DataSource>,
    pub cache: Arc<dyn CacheProvider>,
    /// Must be the meter `upstream` records into
    pub meter: BandwidthMeter,
    pub clock: Arc<dyn Clock>,
    pub buffering: BufferingConfig,
    pub renderers: RendererPreference,
    pub live_target_offset_ms: u64,
    pub tick_interval: Duration,
}

impl SessionDeps {
    /// Production wiring: pooled HTTP source, the process-wide disk cache and
    /// the wall clock, all tuned by the user's config.
    pub fn from_config(
        config: &AppConfig,
        engine_factory: Arc<dyn EngineFactory>,
        library: Arc<dyn LibraryStore>,
    ) -> Self {
        let meter = BandwidthMeter::new();
        Self {
            engine_factory,
            library,
            preferences: Arc::new(config.clone()),
            upstream: Arc::new(HttpDataSource::new(config.http(), meter.clone())),
            cache: Arc::new(SharedDiskCache { dir: config.cache_dir(), capacity: config.cache_capacity_bytes() }),
            meter,
            clock: Arc::new(SystemClock),
            buffering: config.buffering(),
            renderers: config.renderers(),
            live_target_offset_ms: config.live_target_offset_ms,
            tick_interval: Duration::from_secs(1),
        }
    }
}

struct SessionCore {
    id: SessionId,
    request: PlaybackRequest,
    source: ResolvedSource,
    deps: SessionDeps,
    state: SessionState,
    engine: Option<Box<dyn PlayerEngine>>,
    params: TrackSelectionParameters,
    resume_offset_ms: u64,
    tracker: ProgressTracker,
    subtitle_auto_selected: bool,
    bus: EventBus,
    engine_events: Sender<EngineEvent>,
    ticker: TickControl,
}

impl SessionCore {
    fn set_state(&mut self, state: SessionState) {
        if self.state == state {
            return;
        }
        debug!("Session {:?}: {:?} -> {:?}", self.id, self.state, state);
        self.state = state.clone();
        self.bus.emit(SessionEvent::StateChanged(state));
    }

    fn fail(&mut self, report: ErrorReport) {
        warn!("Playback of {} failed: {} ({})", self.source, report.title, report.message);
        self.ticker.suspend();
        self.set_state(SessionState::Error(report.clone()));
        self.bus.emit(SessionEvent::Error(report));
    }

    fn ensure_usable(&self) -> Result<(), SessionError> {
        if self.state.is_terminal() {
            Err(SessionError::Terminated)
        } else {
            Ok(())
        }
    }

    fn engine_mut(&mut self) -> Result<&mut Box<dyn PlayerEngine>, SessionError> {
        self.ensure_usable()?;
        self.engine.as_mut().ok_or(SessionError::NoEngine)
    }

    fn on_engine_event(&mut self, event: EngineEvent) {
        if self.state.is_terminal() {
            debug!("Ignoring {:?} after session ended", event);
            return;
        }
        match event {
            EngineEvent::Buffering => debug!("Buffering {}", self.source),
            EngineEvent::Ready => {
                if !self.subtitle_auto_selected {
                    self.subtitle_auto_selected = true;
                    self.auto_select_subtitle();
                }
                if self.state == SessionState::Preparing {
                    self.set_state(SessionState::Ready);
                }
            }
            EngineEvent::IsPlayingChanged(true) => {
                self.set_state(SessionState::Playing);
                self.ticker.resume();
            }
            EngineEvent::IsPlayingChanged(false) => {
                self.ticker.suspend();
                if self.state == SessionState::Playing {
                    self.set_state(SessionState::Paused);
                }
            }
            EngineEvent::Ended => {
                self.ticker.suspend();
                self.bus.emit(SessionEvent::Ended);
            }
            EngineEvent::TracksChanged => self.bus.emit(SessionEvent::TracksChanged),
            EngineEvent::Error(failure) => self.fail(classify(&failure)),
            EngineEvent::Released => {}
        }
    }

    fn auto_select_subtitle(&mut self) {
        let Some(engine) = self.engine.as_mut() else { return };
        let Some(info) = engine.mapped_track_info() else { return };
        let tracks = list_tracks(&info, TrackType::Text, self.id);
        let preferred = self.deps.preferences.preferred_subtitle_language();
        let Some(track) = auto_select_subtitle(&tracks, &preferred) else {
            debug!("No subtitle matches '{}'", preferred);
            return;
        };
        info!("Selected subtitle {}", track.label);
        self.params.set_override(TrackType::Text, track.locator().to_override());
        engine.set_track_parameters(&self.params);
        self.bus.emit(SessionEvent::SubtitleSelected(track.clone()));
    }

    fn on_tick(&mut self) {
        if self.state != SessionState::Playing {
            return;
        }
        let Some(engine) = self.engine.as_ref() else { return };
        let position_ms = engine.position_ms();
        let duration_ms = engine.duration_ms();
        let now = self.deps.clock.now_ms();

        let outcome = self.tracker.tick(position_ms, duration_ms, now, self.deps.meter.total_bytes());
        self.bus.emit(SessionEvent::Progress {
            position_ms,
            duration_ms,
            watched_seconds: self.tracker.watched_seconds(now),
        });
        for (affordance, visible) in outcome.changes {
            self.bus.emit(SessionEvent::Affordance { affordance, visible });
        }
        if let Some(speed) = outcome.network_speed {
            self.bus.emit(SessionEvent::NetworkSpeed(speed));
        }
    }

    fn persist_progress(&mut self) -> Result<(), StoreError> {
        // Nothing played, so nothing to record
        let Some(engine) = self.engine.as_ref() else { return Ok(()) };
        let (position_ms, duration_ms) = (engine.position_ms(), engine.duration_ms());
        let now = self.deps.clock.now_ms();
        self.tracker
            .finish(self.deps.library.as_ref(), position_ms, duration_ms, now)
            .map(|_| ())
    }

    fn prepare(&mut self) -> Result<(), SessionError> {
        self.ensure_usable()?;
        if self.engine.is_some() {
            return Ok(());
        }
        self.set_state(SessionState::Preparing);

        let kind = self.request.kind;
        let cache = if kind.is_live() {
            None
        } else {
            match self.deps.cache.cache() {
                Ok(cache) => Some(cache),
                Err(e) => {
                    warn!("Media cache unavailable, streaming without it: {}", e);
                    None
                }
            }
        };
        let config = EngineConfig {
            buffering: self.deps.buffering,
            renderers: self.deps.renderers,
            audio: AudioAttributes::default(),
            data_source: data_source_for(kind, Arc::clone(&self.deps.upstream), cache),
            live_target_offset_ms: kind.is_live().then_some(self.deps.live_target_offset_ms),
            track_parameters: self.params.clone(),
        };

        let created = config
            .buffering
            .validate()
            .and_then(|()| self.deps.engine_factory.create(config, self.engine_events.clone()));
        let mut engine = match created {
            Ok(engine) => engine,
            Err(e) => {
                self.fail(engine_failure(&e));
                return Err(e.into());
            }
        };

        engine.set_media_item(MediaItem::new(self.source.as_str()));
        if self.resume_offset_ms > 0 {
            info!("Resuming {} at {}ms", self.source, self.resume_offset_ms);
            engine.seek_to(self.resume_offset_ms);
        }
        if let Err(e) = engine.prepare() {
            engine.release();
            self.fail(engine_failure(&e));
            return Err(e.into());
        }
        engine.play();

        self.tracker.start(self.deps.clock.now_ms(), self.deps.meter.total_bytes());
        self.engine = Some(engine);
        info!("Started {} ({})", self.source, kind);
        Ok(())
    }
}

fn engine_failure(err: &crate::errors::EngineError) -> ErrorReport {
    ErrorReport {
        class: ErrorClass::Playback,
        title: "Error".to_string(),
        message: err.to_string(),
    }
}

#[derive(Default)]
struct SessionThreads {
    ticker: Option<Ticker>,
    dispatcher: Option<JoinHandle<()>>,
}

pub struct PlaybackSession {
    core: Arc<Mutex<SessionCore>>,
    threads: Mutex<SessionThreads>,
}

impl PlaybackSession {
    /// Validate and resolve the request, look up where to resume, then
    /// prepare an engine and start playing.
    pub fn create(request: PlaybackRequest, deps: SessionDeps) -> Result<Self, SessionError> {
        request.validate()?;
        let source = resolve(&request)?;
        let resume_offset_ms =
            ProgressTracker::resume_offset(deps.library.as_ref(), request.content_id, request.kind);
        let params = TrackSelectionParameters::defaults(
            &deps.preferences.preferred_audio_language(),
            &deps.preferences.preferred_subtitle_language(),
        );
        let tracker = ProgressTracker::new(
            request.content_id,
            request.kind,
            &request.category_id,
            request.next_episode_id.is_some(),
        );
        let tick_interval = deps.tick_interval;

        let (events_tx, events_rx) = channel();
        let (tick_control, tick_rx) = TickControl::channel();
        let core = Arc::new(Mutex::new(SessionCore {
            id: SessionId::next(),
            request,
            source,
            deps,
            state: SessionState::Idle,
            engine: None,
            params,
            resume_offset_ms,
            tracker,
            subtitle_auto_selected: false,
            bus: EventBus::default(),
            engine_events: events_tx,
            ticker: tick_control.clone(),
        }));

        let weak = Arc::downgrade(&core);
        let ticker = Ticker::spawn(tick_control, tick_rx, tick_interval, move || match weak.upgrade() {
            Some(core) => {
                lock(&core).on_tick();
                true
            }
            None => false,
        })?;
        let session = Self {
            core: Arc::clone(&core),
            threads: Mutex::new(SessionThreads { ticker: Some(ticker), dispatcher: None }),
        };

        let weak = Arc::downgrade(&core);
        let dispatcher = thread::Builder::new()
            .name("engine-events".to_string())
            .spawn(move || dispatch(events_rx, weak))?;
        session.threads().dispatcher = Some(dispatcher);

        session.prepare()?;
        Ok(session)
    }

    fn core(&self) -> MutexGuard<'_, SessionCore> {
        lock(&self.core)
    }

    fn threads(&self) -> MutexGuard<'_, SessionThreads> {
        self.threads.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create the engine and start playback. Does nothing when an engine
    /// already exists.
    pub fn prepare(&self) -> Result<(), SessionError> {
        self.core().prepare()
    }

    pub fn state(&self) -> SessionState {
        self.core().state.clone()
    }

    pub fn request(&self) -> PlaybackRequest {
        self.core().request.clone()
    }

    pub fn source(&self) -> ResolvedSource {
        self.core().source.clone()
    }

    /// Events from now on; nothing is replayed
    pub fn subscribe(&self) -> Receiver<SessionEvent> {
        self.core().bus.subscribe()
    }

    pub fn pause(&self) -> Result<(), SessionError> {
        let mut core = self.core();
        core.engine_mut()?.pause();
        core.ticker.suspend();
        Ok(())
    }

    pub fn resume(&self) -> Result<(), SessionError> {
        self.core().engine_mut()?.play();
        Ok(())
    }

    /// Seek relative to the current position, clamped to the item's bounds
    pub fn seek_relative(&self, delta_ms: i64) -> Result<(), SessionError> {
        let mut core = self.core();
        let engine = core.engine_mut()?;
        let target = (engine.position_ms() as i64).saturating_add(delta_ms).max(0) as u64;
        let target = clamp_to_duration(target, engine.duration_ms());
        engine.seek_to(target);
        Ok(())
    }

    pub fn seek_to(&self, position_ms: u64) -> Result<(), SessionError> {
        let mut core = self.core();
        let engine = core.engine_mut()?;
        let target = clamp_to_duration(position_ms, engine.duration_ms());
        engine.seek_to(target);
        Ok(())
    }

    /// Jump past a series intro
    pub fn skip_intro(&self) -> Result<(), SessionError> {
        self.seek_relative(SKIP_INTRO_JUMP_MS as i64)
    }

    /// Playable tracks of one type; empty until the engine has mapped them
    pub fn list_tracks(&self, track_type: TrackType) -> Vec<TrackDescriptor> {
        let core = self.core();
        core.engine
            .as_ref()
            .and_then(|engine| engine.mapped_track_info())
            .map(|info| list_tracks(&info, track_type, core.id))
            .unwrap_or_default()
    }

    /// Force one track for its type, replacing any earlier choice
    pub fn select_track(&self, track: &TrackDescriptor) -> Result<(), SessionError> {
        let mut core = self.core();
        if track.locator().session() != core.id {
            return Err(SessionError::StaleTrack);
        }
        core.engine_mut()?;
        core.params.set_override(track.track_type, track.locator().to_override());
        let SessionCore { engine, params, .. } = &mut *core;
        if let Some(engine) = engine.as_mut() {
            engine.set_track_parameters(params);
        }
        info!("Selected {:?} track {}", track.track_type, track.label);
        Ok(())
    }

    pub fn disable_track(&self, track_type: TrackType) -> Result<(), SessionError> {
        let mut core = self.core();
        core.engine_mut()?;
        core.params.disable(track_type);
        let SessionCore { engine, params, .. } = &mut *core;
        if let Some(engine) = engine.as_mut() {
            engine.set_track_parameters(params);
        }
        info!("Disabled {:?} tracks", track_type);
        Ok(())
    }

    /// Side-load a subtitle file. The media item is rebuilt with it and
    /// playback restarts where it was.
    pub fn attach_external_subtitle(
        &self,
        uri: &str,
        mime_type: Option<&str>,
        language: Option<&str>,
    ) -> Result<(), SessionError> {
        let mut core = self.core();
        let language = match language {
            Some(language) => language.to_string(),
            None => core.deps.preferences.preferred_subtitle_language(),
        };
        let attachment = SubtitleAttachment {
            mime_type: mime_type.unwrap_or(SubtitleAttachment::SUBRIP).to_string(),
            ..SubtitleAttachment::subrip(uri, &language)
        };
        let source = core.source.clone();

        let engine = core.engine_mut()?;
        let position_ms = engine.position_ms();
        let item = engine
            .current_media_item()
            .unwrap_or_else(|| MediaItem::new(source.as_str()))
            .with_subtitles(vec![attachment]);
        engine.set_media_item(item);
        engine.seek_to(position_ms);
        engine.prepare()?;
        engine.play();
        info!("Attached subtitle {} at {}ms", uri, position_ms);
        Ok(())
    }

    pub fn is_favorite(&self) -> Result<bool, SessionError> {
        let core = self.core();
        match core.request.content_id {
            Some(id) => Ok(core.deps.library.is_favorite(id, core.request.kind)?),
            None => Ok(false),
        }
    }

    /// Flip the favorite flag for the current item; returns the new value
    pub fn toggle_favorite(&self) -> Result<bool, SessionError> {
        let core = self.core();
        let request = &core.request;
        let Some(id) = request.content_id else { return Ok(false) };
        let library = &core.deps.library;
        if library.is_favorite(id, request.kind)? {
            library.remove_favorite(id, request.kind)?;
            Ok(false)
        } else {
            library.add_favorite(Favorite {
                content_id: id,
                kind: request.kind,
                name: request.name.clone(),
                image: request.icon.clone(),
                category_id: request.category_id.clone(),
            })?;
            Ok(true)
        }
    }

    /// Request for the episode after this one, when known
    pub fn next_episode_request(&self) -> Option<PlaybackRequest> {
        self.core().request.next_episode()
    }

    /// Save progress, release the engine and shut down the helper threads.
    /// Calling it again does nothing.
    pub fn stop(&self) -> Result<(), SessionError> {
        let (saved, engine_events) = {
            let mut core = self.core();
            if core.state == SessionState::Stopped {
                return Ok(());
            }
            core.ticker.suspend();
            let saved = core.persist_progress();
            if let Some(mut engine) = core.engine.take() {
                engine.release();
            }
            core.set_state(SessionState::Stopped);
            info!("Stopped {}", core.source);
            (saved, core.engine_events.clone())
        };

        let mut threads = self.threads();
        if let Some(ticker) = threads.ticker.take() {
            ticker.shutdown();
        }
        let _ = engine_events.send(EngineEvent::Released);
        if let Some(dispatcher) = threads.dispatcher.take() {
            let _ = dispatcher.join();
        }

        saved.map_err(|e| {
            warn!("Could not save watch progress: {}", e);
            e.into()
        })
    }
}

impl Drop for PlaybackSession {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn clamp_to_duration(position_ms: u64, duration_ms: Option<u64>) -> u64 {
    match duration_ms {
        Some(duration) if duration > 0 => position_ms.min(duration),
        _ => position_ms,
    }
}

fn dispatch(events: Receiver<EngineEvent>, core: Weak<Mutex<SessionCore>>) {
    for event in events {
        let released = event == EngineEvent::Released;
        match core.upgrade() {
            Some(core) => lock(&core).on_engine_event(event),
            None => break,
        }
        if released {
            break;
        }
    }
    debug!("Engine event dispatcher exited");
}

fn lock(core: &Mutex<SessionCore>) -> MutexGuard<'_, SessionCore> {
    core.lock().unwrap_or_else(PoisonError::into_inner)
}
