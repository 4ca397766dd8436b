//! # Playback session manager.
//!
//! Binds at most one camera to one player instance.
//!
//! ```text
//! Idle ──attach──► Attaching ──► Playing ──detach──► Disposing ──► Idle
//! ```
//!
//! Attaching a different camera tears the current session down first
//! (pause → detach media → dispose, each step logged on failure). Attaching
//! the camera that is already playing is a no-op. The player is owned by a
//! guard whose `Drop` releases it, so a session can never outlive the manager.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ConsoleError;
use crate::model::{Source, SourceId};
use crate::stream_url::derive_playback_url_with_port;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    Idle,
    Attaching,
    Playing,
    Disposing,
}

#[derive(Error, Debug, Clone)]
#[error("{0}")]
pub struct PlayerError(pub String);

/// An external video player instance.
pub trait Player: Send {
    fn play(&mut self) -> Result<(), PlayerError>;
    fn pause(&mut self) -> Result<(), PlayerError>;
    fn detach_media(&mut self) -> Result<(), PlayerError>;
    fn dispose(&mut self) -> Result<(), PlayerError>;
}

pub trait PlayerFactory: Send + Sync {
    fn create(&self, source_id: &str, playback_url: &str) -> Result<Box<dyn Player>, PlayerError>;
}

struct PlayerGuard {
    source_id: SourceId,
    player: Option<Box<dyn Player>>,
}

impl PlayerGuard {
    fn release(&mut self) {
        let Some(mut player) = self.player.take() else {
            return;
        };
        if let Err(e) = player.pause() {
            warn!("Player pause failed: source={} err={}", self.source_id, e);
        }
        if let Err(e) = player.detach_media() {
            warn!("Player detach failed: source={} err={}", self.source_id, e);
        }
        if let Err(e) = player.dispose() {
            warn!("Player dispose failed: source={} err={}", self.source_id, e);
        }
        info!("Playback released: source={}", self.source_id);
    }
}

impl Drop for PlayerGuard {
    fn drop(&mut self) {
        self.release();
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlaybackInfo {
    pub session: u64,
    pub source_id: SourceId,
    pub playback_url: String,
    pub state: PlaybackState,
}

struct Session {
    id: u64,
    source_id: SourceId,
    playback_url: String,
    guard: PlayerGuard,
}

struct Inner {
    state: PlaybackState,
    session: Option<Session>,
    next_session: u64,
}

impl Inner {
    fn info(&self) -> Option<PlaybackInfo> {
        self.session.as_ref().map(|s| PlaybackInfo {
            session: s.id,
            source_id: s.source_id.clone(),
            playback_url: s.playback_url.clone(),
            state: self.state,
        })
    }

    fn teardown(&mut self) -> bool {
        let Some(mut session) = self.session.take() else {
            self.state = PlaybackState::Idle;
            return false;
        };
        self.state = PlaybackState::Disposing;
        session.guard.release();
        self.state = PlaybackState::Idle;
        true
    }
}

#[derive(Clone)]
pub struct PlaybackManager {
    inner: Arc<Mutex<Inner>>,
    factory: Arc<dyn PlayerFactory>,
    hls_port: u16,
}

impl PlaybackManager {
    pub fn new(factory: Arc<dyn PlayerFactory>, hls_port: u16) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                state: PlaybackState::Idle,
                session: None,
                next_session: 1,
            })),
            factory,
            hls_port,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn attach(&self, source: &Source) -> Result<PlaybackInfo, ConsoleError> {
        let playback_url = derive_playback_url_with_port(&source.ingest_url, self.hls_port)?;
        let mut inner = self.lock();

        if inner.state == PlaybackState::Playing {
            if let Some(info) = inner
                .info()
                .filter(|i| i.source_id == source.id && i.playback_url == playback_url)
            {
                debug!("Playback already attached: source={}", source.id);
                return Ok(info);
            }
        }

        inner.teardown();

        inner.state = PlaybackState::Attaching;
        let mut player = match self.factory.create(&source.id, &playback_url) {
            Ok(player) => player,
            Err(e) => {
                inner.state = PlaybackState::Idle;
                warn!("Player creation failed: source={} err={}", source.id, e);
                return Err(ConsoleError::PlayerFailure(e.0));
            }
        };
        // A refused autoplay leaves the session attached; the viewer can still start it.
        if let Err(e) = player.play() {
            warn!("Playback start failed: source={} err={}", source.id, e);
        }

        let id = inner.next_session;
        inner.next_session += 1;
        inner.session = Some(Session {
            id,
            source_id: source.id.clone(),
            playback_url: playback_url.clone(),
            guard: PlayerGuard {
                source_id: source.id.clone(),
                player: Some(player),
            },
        });
        inner.state = PlaybackState::Playing;
        info!(
            "Playback attached: source={} session={} url={}",
            source.id, id, playback_url
        );

        Ok(PlaybackInfo {
            session: id,
            source_id: source.id.clone(),
            playback_url,
            state: PlaybackState::Playing,
        })
    }

    /// Like [`attach`](Self::attach), but the session ends when the returned scope drops.
    pub fn attach_scoped(&self, source: &Source) -> Result<PlaybackScope, ConsoleError> {
        let info = self.attach(source)?;
        Ok(PlaybackScope {
            manager: self.clone(),
            info,
        })
    }

    /// No-op when idle.
    pub fn detach(&self) -> bool {
        self.lock().teardown()
    }

    /// Ends the session only if it is bound to `source_id`.
    pub fn detach_source(&self, source_id: &str) -> bool {
        let mut inner = self.lock();
        let bound = inner.session.as_ref().is_some_and(|s| s.source_id == source_id);
        bound && inner.teardown()
    }

    fn detach_session(&self, session_id: u64) -> bool {
        let mut inner = self.lock();
        let current = inner.session.as_ref().is_some_and(|s| s.id == session_id);
        current && inner.teardown()
    }

    pub fn current(&self) -> Option<PlaybackInfo> {
        self.lock().info()
    }

    pub fn state(&self) -> PlaybackState {
        self.lock().state
    }
}

/// Keeps a session alive for its own lifetime.
///
/// Dropping the scope detaches the session it attached, unless that session was
/// already replaced or detached.
pub struct PlaybackScope {
    manager: PlaybackManager,
    info: PlaybackInfo,
}

impl PlaybackScope {
    pub fn info(&self) -> &PlaybackInfo {
        &self.info
    }
}

impl Drop for PlaybackScope {
    fn drop(&mut self) {
        self.manager.detach_session(self.info.session);
    }
}

/// Headless player that keeps a camera's HLS playlist warm by polling it.
pub struct HlsProbeFactory {
    http: reqwest::Client,
    interval: Duration,
}

impl HlsProbeFactory {
    pub fn new(http: reqwest::Client, interval: Duration) -> Self {
        Self { http, interval }
    }
}

impl PlayerFactory for HlsProbeFactory {
    fn create(&self, source_id: &str, playback_url: &str) -> Result<Box<dyn Player>, PlayerError> {
        Ok(Box::new(HlsProbePlayer {
            source_id: source_id.to_string(),
            url: Some(playback_url.to_string()),
            http: self.http.clone(),
            interval: self.interval,
            poller: None,
        }))
    }
}

struct HlsProbePlayer {
    source_id: SourceId,
    url: Option<String>,
    http: reqwest::Client,
    interval: Duration,
    poller: Option<CancellationToken>,
}

impl Player for HlsProbePlayer {
    fn play(&mut self) -> Result<(), PlayerError> {
        if self.poller.is_some() {
            return Ok(());
        }
        let url = self
            .url
            .clone()
            .ok_or_else(|| PlayerError("no media attached".to_string()))?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| PlayerError(format!("no async runtime: {e}")))?;

        let token = CancellationToken::new();
        let task_token = token.clone();
        let http = self.http.clone();
        let interval = self.interval;
        let source_id = self.source_id.clone();
        runtime.spawn(async move {
            loop {
                match http.get(&url).send().await {
                    Ok(resp) if resp.status().is_success() => {
                        debug!("Playlist reachable: source={} url={}", source_id, url);
                    }
                    Ok(resp) => {
                        warn!("Playlist probe failed: source={} status={}", source_id, resp.status());
                    }
                    Err(e) => {
                        warn!("Playlist probe failed: source={} err={}", source_id, e);
                    }
                }
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        });
        self.poller = Some(token);
        Ok(())
    }

    fn pause(&mut self) -> Result<(), PlayerError> {
        if let Some(token) = self.poller.take() {
            token.cancel();
        }
        Ok(())
    }

    fn detach_media(&mut self) -> Result<(), PlayerError> {
        self.url = None;
        Ok(())
    }

    fn dispose(&mut self) -> Result<(), PlayerError> {
        self.pause()?;
        self.url = None;
        Ok(())
    }
}

impl Drop for HlsProbePlayer {
    fn drop(&mut self) {
        if let Some(token) = self.poller.take() {
            token.cancel();
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Records every player call as `"<verb> <source>"`.
    #[derive(Clone, Default)]
    pub struct RecordingFactory {
        pub events: Arc<Mutex<Vec<String>>>,
        pub fail_pause: bool,
    }

    impl RecordingFactory {
        pub fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }

        pub fn count(&self, verb: &str) -> usize {
            self.events().iter().filter(|e| e.starts_with(verb)).count()
        }
    }

    struct RecordingPlayer {
        source: String,
        events: Arc<Mutex<Vec<String>>>,
        fail_pause: bool,
    }

    impl RecordingPlayer {
        fn record(&self, verb: &str) {
            self.events.lock().unwrap().push(format!("{verb} {}", self.source));
        }
    }

    impl Player for RecordingPlayer {
        fn play(&mut self) -> Result<(), PlayerError> {
            self.record("play");
            Ok(())
        }

        fn pause(&mut self) -> Result<(), PlayerError> {
            self.record("pause");
            if self.fail_pause {
                return Err(PlayerError("pause refused".into()));
            }
            Ok(())
        }

        fn detach_media(&mut self) -> Result<(), PlayerError> {
            self.record("detach");
            Ok(())
        }

        fn dispose(&mut self) -> Result<(), PlayerError> {
            self.record("dispose");
            Ok(())
        }
    }

    impl PlayerFactory for RecordingFactory {
        fn create(&self, source_id: &str, _playback_url: &str) -> Result<Box<dyn Player>, PlayerError> {
            self.events.lock().unwrap().push(format!("create {source_id}"));
            Ok(Box::new(RecordingPlayer {
                source: source_id.to_string(),
                events: self.events.clone(),
                fail_pause: self.fail_pause,
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingFactory;
    use super::*;

    fn source(id: &str) -> Source {
        Source {
            id: id.to_string(),
            name: id.to_string(),
            ingest_url: format!("rtmp://203.0.113.5/live/{id}"),
            latitude: 0.0,
            longitude: 0.0,
        }
    }

    fn manager(factory: &RecordingFactory) -> PlaybackManager {
        PlaybackManager::new(Arc::new(factory.clone()), 1935)
    }

    #[test]
    fn test_reattach_same_source_is_noop() {
        let factory = RecordingFactory::default();
        let playback = manager(&factory);
        let first = playback.attach(&source("a")).unwrap();
        let second = playback.attach(&source("a")).unwrap();
        assert_eq!(first.session, second.session);
        assert_eq!(factory.count("create"), 1);
        assert_eq!(factory.count("dispose"), 0);
        assert_eq!(second.playback_url, "http://203.0.113.5:1935/live/a/playlist.m3u8");
    }

    #[test]
    fn test_reattach_after_url_change_rebuilds_session() {
        let factory = RecordingFactory::default();
        let playback = manager(&factory);
        let first = playback.attach(&source("a")).unwrap();

        let mut moved = source("a");
        moved.ingest_url = "rtmp://198.51.100.9/live/a".to_string();
        let second = playback.attach(&moved).unwrap();

        assert_ne!(first.session, second.session);
        assert_eq!(second.playback_url, "http://198.51.100.9:1935/live/a/playlist.m3u8");
        assert_eq!(factory.count("create"), 2);
        assert_eq!(factory.count("dispose"), 1);
    }

    #[test]
    fn test_switching_tears_down_previous_first() {
        let factory = RecordingFactory::default();
        let playback = manager(&factory);
        playback.attach(&source("a")).unwrap();
        playback.attach(&source("b")).unwrap();
        assert_eq!(
            factory.events(),
            vec!["create a", "play a", "pause a", "detach a", "dispose a", "create b", "play b"]
        );
        assert_eq!(playback.current().unwrap().source_id, "b");
        assert_eq!(playback.state(), PlaybackState::Playing);
    }

    #[test]
    fn test_teardown_continues_past_failed_step() {
        let factory = RecordingFactory {
            fail_pause: true,
            ..Default::default()
        };
        let playback = manager(&factory);
        playback.attach(&source("a")).unwrap();
        assert!(playback.detach());
        assert_eq!(factory.count("dispose"), 1);
        assert_eq!(playback.state(), PlaybackState::Idle);
    }

    #[test]
    fn test_detach_when_idle_is_noop() {
        let factory = RecordingFactory::default();
        let playback = manager(&factory);
        assert!(!playback.detach());
        assert!(!playback.detach());
        assert_eq!(playback.state(), PlaybackState::Idle);
        assert!(factory.events().is_empty());
    }

    #[test]
    fn test_detach_source_only_matches_bound_source() {
        let factory = RecordingFactory::default();
        let playback = manager(&factory);
        playback.attach(&source("a")).unwrap();
        assert!(!playback.detach_source("b"));
        assert!(playback.detach_source("a"));
        assert!(playback.current().is_none());
    }

    #[test]
    fn test_invalid_url_leaves_manager_idle() {
        let factory = RecordingFactory::default();
        let playback = manager(&factory);
        let mut bad = source("a");
        bad.ingest_url = "rtmp://host".into();
        assert!(playback.attach(&bad).is_err());
        assert_eq!(playback.state(), PlaybackState::Idle);
        assert_eq!(factory.count("create"), 0);
    }

    #[test]
    fn test_dropping_manager_disposes_player() {
        let factory = RecordingFactory::default();
        let playback = manager(&factory);
        playback.attach(&source("a")).unwrap();
        drop(playback);
        assert_eq!(factory.count("dispose"), 1);
    }

    #[test]
    fn test_scope_releases_on_drop() {
        let factory = RecordingFactory::default();
        let playback = manager(&factory);
        {
            let scope = playback.attach_scoped(&source("a")).unwrap();
            assert_eq!(scope.info().state, PlaybackState::Playing);
        }
        assert_eq!(playback.state(), PlaybackState::Idle);
        assert_eq!(factory.count("dispose"), 1);
    }

    #[test]
    fn test_stale_scope_does_not_end_newer_session() {
        let factory = RecordingFactory::default();
        let playback = manager(&factory);
        let scope = playback.attach_scoped(&source("a")).unwrap();
        playback.attach(&source("b")).unwrap();
        drop(scope);
        assert_eq!(playback.current().unwrap().source_id, "b");
    }
}
