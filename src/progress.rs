//! Resume points, watch-time accounting and the once-a-second playback tick

use chrono::Utc;
use log::{debug, info, warn};

use crate::errors::StoreError;
use crate::library::{LibraryStore, WatchRecord};
use crate::request::ContentKind;

/// Skip-intro is offered strictly between these positions (series only)
pub const SKIP_INTRO_FROM_MS: u64 = 10_000;
pub const SKIP_INTRO_UNTIL_MS: u64 = 300_000;
/// How far skip-intro jumps ahead
pub const SKIP_INTRO_JUMP_MS: u64 = 85_000;
/// Next-episode is offered when less than this remains
pub const NEXT_EPISODE_WINDOW_MS: u64 = 45_000;
/// Fraction of the duration after which an item counts as finished
pub const FINISHED_RATIO: f64 = 0.95;

/// Wall clock in milliseconds
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Affordance {
    SkipIntro,
    NextEpisode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AffordanceState {
    pub skip_intro: bool,
    pub next_episode: bool,
}

/// Which position-gated controls should be visible right now
pub fn evaluate_affordances(
    kind: ContentKind,
    position_ms: u64,
    duration_ms: Option<u64>,
    has_next_episode: bool,
) -> AffordanceState {
    if kind.is_live() {
        return AffordanceState::default();
    }
    let skip_intro = kind == ContentKind::Series
        && position_ms > SKIP_INTRO_FROM_MS
        && position_ms < SKIP_INTRO_UNTIL_MS;
    let next_episode = has_next_episode
        && matches!(duration_ms, Some(d) if d > 0 && d.saturating_sub(position_ms) < NEXT_EPISODE_WINDOW_MS);
    AffordanceState { skip_intro, next_episode }
}

pub fn is_finished(position_ms: u64, duration_ms: Option<u64>) -> bool {
    match duration_ms {
        Some(d) if d > 0 => position_ms as f64 >= d as f64 * FINISHED_RATIO,
        _ => false,
    }
}

/// "1.5 MB/s" from one MiB per second up, "640 KB/s" below
pub fn format_speed(bytes_per_sec: u64) -> String {
    if bytes_per_sec >= 1024 * 1024 {
        format!("{:.1} MB/s", bytes_per_sec as f64 / (1024.0 * 1024.0))
    } else {
        format!("{} KB/s", bytes_per_sec / 1024)
    }
}

/// Turns a running byte counter into a throughput reading
#[derive(Debug, Clone, Default)]
pub struct NetworkSpeedSampler {
    last_bytes: u64,
    last_ms: i64,
}

impl NetworkSpeedSampler {
    pub fn new(total_bytes: u64, now_ms: i64) -> Self {
        Self { last_bytes: total_bytes, last_ms: now_ms }
    }

    /// Bytes per second since the previous sample. Samples closer than a
    /// second apart return `None` and leave the baseline alone.
    pub fn sample(&mut self, total_bytes: u64, now_ms: i64) -> Option<u64> {
        let elapsed = now_ms - self.last_ms;
        if elapsed < 1000 {
            return None;
        }
        let received = total_bytes.saturating_sub(self.last_bytes);
        self.last_bytes = total_bytes;
        self.last_ms = now_ms;
        Some(received * 1000 / elapsed as u64)
    }
}

/// Result of one tick
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickOutcome {
    /// Affordances whose visibility flipped on this tick
    pub changes: Vec<(Affordance, bool)>,
    pub network_speed: Option<String>,
}

/// Watch-progress bookkeeping for one session
#[derive(Debug)]
pub struct ProgressTracker {
    content_id: Option<i64>,
    kind: ContentKind,
    category_id: String,
    has_next_episode: bool,
    started_at_ms: Option<i64>,
    visible: AffordanceState,
    speed: NetworkSpeedSampler,
    persisted: bool,
}

impl ProgressTracker {
    pub fn new(content_id: Option<i64>, kind: ContentKind, category_id: &str, has_next_episode: bool) -> Self {
        Self {
            content_id,
            kind,
            category_id: category_id.to_string(),
            has_next_episode,
            started_at_ms: None,
            visible: AffordanceState::default(),
            speed: NetworkSpeedSampler::default(),
            persisted: false,
        }
    }

    /// Where to start playback. Live items never touch the store, and a store
    /// failure means starting from the beginning.
    pub fn resume_offset(store: &dyn LibraryStore, content_id: Option<i64>, kind: ContentKind) -> u64 {
        let Some(id) = content_id else { return 0 };
        if kind.is_live() {
            return 0;
        }
        match store.watch_record(id, kind) {
            Ok(Some(record)) if !record.finished => record.last_position_ms,
            Ok(_) => 0,
            Err(e) => {
                warn!("Could not read watch progress for {} {}: {}", kind, id, e);
                0
            }
        }
    }

    /// Engine started; watch time counts from here
    pub fn start(&mut self, now_ms: i64, total_bytes: u64) {
        self.started_at_ms = Some(now_ms);
        self.speed = NetworkSpeedSampler::new(total_bytes, now_ms);
    }

    pub fn watched_seconds(&self, now_ms: i64) -> u64 {
        self.started_at_ms
            .map(|start| (now_ms - start).max(0) as u64 / 1000)
            .unwrap_or(0)
    }

    pub fn visible(&self) -> AffordanceState {
        self.visible
    }

    pub fn tick(&mut self, position_ms: u64, duration_ms: Option<u64>, now_ms: i64, total_bytes: u64) -> TickOutcome {
        let next = evaluate_affordances(self.kind, position_ms, duration_ms, self.has_next_episode);
        let mut changes = Vec::new();
        if next.skip_intro != self.visible.skip_intro {
            changes.push((Affordance::SkipIntro, next.skip_intro));
        }
        if next.next_episode != self.visible.next_episode {
            changes.push((Affordance::NextEpisode, next.next_episode));
        }
        self.visible = next;

        let network_speed = self.speed.sample(total_bytes, now_ms).map(format_speed);
        TickOutcome { changes, network_speed }
    }

    /// Write the final progress for this session. Runs at most once; live
    /// items and items without an id are never written.
    pub fn finish(
        &mut self,
        store: &dyn LibraryStore,
        position_ms: u64,
        duration_ms: Option<u64>,
        now_ms: i64,
    ) -> Result<Option<WatchRecord>, StoreError> {
        if self.persisted {
            return Ok(None);
        }
        self.persisted = true;

        let Some(id) = self.content_id else { return Ok(None) };
        if self.kind.is_live() {
            return Ok(None);
        }

        let finished = is_finished(position_ms, duration_ms);
        let watched = self.watched_seconds(now_ms);
        let previous = store.watch_record(id, self.kind)?;
        let record = WatchRecord {
            content_id: id,
            kind: self.kind,
            category_id: self.category_id.clone(),
            last_position_ms: if finished { 0 } else { position_ms },
            watched_seconds: previous.as_ref().map_or(0, |p| p.watched_seconds) + watched,
            max_duration_ms: duration_ms
                .unwrap_or(0)
                .max(previous.as_ref().map_or(0, |p| p.max_duration_ms)),
            finished,
            updated_at: Utc::now(),
        };
        store.upsert_watch_record(&record)?;

        if finished {
            info!("Marked {} {} as finished ({}s watched in total)", self.kind, id, record.watched_seconds);
        } else {
            debug!("Saved {} {} at {}ms", self.kind, id, record.last_position_ms);
        }
        Ok(Some(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::MemoryLibrary;

    fn stored(id: i64, kind: ContentKind, position: u64, watched: u64, finished: bool) -> WatchRecord {
        WatchRecord {
            content_id: id,
            kind,
            category_id: "0".to_string(),
            last_position_ms: position,
            watched_seconds: watched,
            max_duration_ms: 1_000_000,
            finished,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_resume_offset() {
        let store = MemoryLibrary::new()
            .with_record(stored(1, ContentKind::Vod, 120_000, 300, false))
            .with_record(stored(2, ContentKind::Vod, 0, 900, true));

        assert_eq!(ProgressTracker::resume_offset(&store, Some(1), ContentKind::Vod), 120_000);
        assert_eq!(ProgressTracker::resume_offset(&store, Some(2), ContentKind::Vod), 0);
        assert_eq!(ProgressTracker::resume_offset(&store, Some(3), ContentKind::Vod), 0);
        // Same id, other kind
        assert_eq!(ProgressTracker::resume_offset(&store, Some(1), ContentKind::Series), 0);
        assert_eq!(store.read_count(), 4);

        assert_eq!(ProgressTracker::resume_offset(&store, Some(1), ContentKind::Live), 0);
        assert_eq!(ProgressTracker::resume_offset(&store, None, ContentKind::Vod), 0);
        assert_eq!(store.read_count(), 4);
    }

    #[test]
    fn test_skip_intro_window() {
        let at = |pos| evaluate_affordances(ContentKind::Series, pos, Some(2_400_000), false).skip_intro;
        assert!(!at(10_000));
        assert!(at(10_001));
        assert!(at(299_999));
        assert!(!at(300_000));
        assert!(!evaluate_affordances(ContentKind::Vod, 60_000, Some(2_400_000), false).skip_intro);
    }

    #[test]
    fn test_next_episode_window() {
        let at = |pos, next| evaluate_affordances(ContentKind::Series, pos, Some(1_000_000), next).next_episode;
        assert!(!at(900_000, true));
        assert!(at(955_001, true));
        assert!(!at(955_001, false));
        assert!(!evaluate_affordances(ContentKind::Series, 10, None, true).next_episode);
        assert_eq!(evaluate_affordances(ContentKind::Live, 20_000, Some(30_000), true), AffordanceState::default());
    }

    #[test]
    fn test_finished_threshold() {
        assert!(is_finished(950, Some(1000)));
        assert!(!is_finished(949, Some(1000)));
        assert!(!is_finished(5000, Some(0)));
        assert!(!is_finished(5000, None));
    }

    #[test]
    fn test_format_speed() {
        assert_eq!(format_speed(0), "0 KB/s");
        assert_eq!(format_speed(512 * 1024), "512 KB/s");
        assert_eq!(format_speed(1024 * 1024), "1.0 MB/s");
        assert_eq!(format_speed(3 * 1024 * 1024 / 2), "1.5 MB/s");
    }

    #[test]
    fn test_speed_sampler() {
        let mut sampler = NetworkSpeedSampler::new(0, 0);
        assert_eq!(sampler.sample(4096, 500), None);
        assert_eq!(sampler.sample(2 * 1024 * 1024, 2000), Some(1024 * 1024));
        assert_eq!(sampler.sample(2 * 1024 * 1024, 3000), Some(0));
    }

    #[test]
    fn test_tick_reports_transitions_only() {
        let mut tracker = ProgressTracker::new(Some(5), ContentKind::Series, "1", false);
        tracker.start(0, 0);

        let outcome = tracker.tick(5_000, Some(2_000_000), 1000, 0);
        assert!(outcome.changes.is_empty());

        let outcome = tracker.tick(15_000, Some(2_000_000), 2000, 0);
        assert_eq!(outcome.changes, vec![(Affordance::SkipIntro, true)]);

        let outcome = tracker.tick(16_000, Some(2_000_000), 3000, 0);
        assert!(outcome.changes.is_empty());
        assert_eq!(outcome.network_speed.as_deref(), Some("0 KB/s"));

        let outcome = tracker.tick(400_000, Some(2_000_000), 4000, 0);
        assert_eq!(outcome.changes, vec![(Affordance::SkipIntro, false)]);
    }

    #[test]
    fn test_finish_accumulates_and_resets_finished_items() {
        let store = MemoryLibrary::new().with_record(stored(9, ContentKind::Vod, 10_000, 100, false));
        let mut tracker = ProgressTracker::new(Some(9), ContentKind::Vod, "4", false);
        tracker.start(1_000, 0);

        let record = tracker.finish(&store, 960_000, Some(1_000_000), 61_000).unwrap().unwrap();
        assert!(record.finished);
        assert_eq!(record.last_position_ms, 0);
        assert_eq!(record.watched_seconds, 160);
        assert_eq!(record.max_duration_ms, 1_000_000);
        assert_eq!(record.category_id, "4");

        // Second call is a no-op
        assert_eq!(tracker.finish(&store, 10, Some(1_000_000), 120_000).unwrap(), None);
        assert_eq!(store.write_count(), 1);
        assert_eq!(store.watch_record(9, ContentKind::Vod).unwrap().unwrap().watched_seconds, 160);
    }

    #[test]
    fn test_finish_keeps_position_when_unfinished() {
        let store = MemoryLibrary::new();
        let mut tracker = ProgressTracker::new(Some(3), ContentKind::Series, "0", true);
        tracker.start(0, 0);
        let record = tracker.finish(&store, 300_000, None, 30_500).unwrap().unwrap();
        assert!(!record.finished);
        assert_eq!(record.last_position_ms, 300_000);
        assert_eq!(record.watched_seconds, 30);
        assert_eq!(record.max_duration_ms, 0);
    }

    #[test]
    fn test_live_finish_never_touches_store() {
        let store = MemoryLibrary::new();
        let mut tracker = ProgressTracker::new(Some(3), ContentKind::Live, "0", false);
        tracker.start(0, 0);
        assert_eq!(tracker.finish(&store, 1_000, None, 10_000).unwrap(), None);
        assert_eq!(store.read_count(), 0);
        assert_eq!(store.write_count(), 0);
    }
}
