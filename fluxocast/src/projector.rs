//! Media state projector.
//!
//! Command acknowledgements give an optimistic picture of the player;
//! receiver pushes are authoritative and overwrite it. The projector is the
//! only writer of [`PlaybackState`]; readers take snapshots through a
//! [`PlaybackStateHandle`].

use std::sync::{Arc, RwLock, RwLockWriteGuard};

use tracing::{debug, trace};

use crate::model::{CommandKind, PlaybackState, PlayerState, ReceiverEvent, ReceiverStatus};

/// Read-only, cloneable access to the projected state.
#[derive(Clone, Debug, Default)]
pub struct PlaybackStateHandle {
    inner: Arc<RwLock<PlaybackState>>,
}

impl PlaybackStateHandle {
    pub fn snapshot(&self) -> PlaybackState {
        match self.inner.read() {
            Ok(state) => state.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, PlaybackState> {
        self.inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Debug, Default)]
pub struct MediaStateProjector {
    state: PlaybackStateHandle,
    /// Receiver timestamp of the last applied status; None after a reset
    /// or an acknowledged seek.
    baseline_ms: Option<u64>,
}

impl MediaStateProjector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> PlaybackStateHandle {
        self.state.clone()
    }

    pub fn snapshot(&self) -> PlaybackState {
        self.state.snapshot()
    }

    /// Applies the optimistic effect of an acknowledged command.
    pub fn apply_ack(&mut self, kind: &CommandKind) {
        let mut state = self.state.write();
        match kind {
            CommandKind::Load(item) => {
                state.player_state = PlayerState::Buffering;
                state.is_live = item.is_live();
                state.duration_ms = None;
                state.position_ms = 0;
                state.last_error = None;
                state.content_url = Some(item.url().to_string());
                self.baseline_ms = None;
            }
            CommandKind::Play => state.player_state = PlayerState::Playing,
            CommandKind::Pause => state.player_state = PlayerState::Paused,
            CommandKind::Stop => state.player_state = PlayerState::Stopped,
            CommandKind::Seek { position_ms } => {
                state.position_ms = u64::try_from(*position_ms).unwrap_or(0);
                self.baseline_ms = None;
            }
            CommandKind::SetVolume { level } => state.volume_level = Some(*level),
        }
        trace!(kind = kind.name(), state = ?state.player_state, "Applied acknowledgement");
    }

    /// Applies a receiver push. Returns false when the push was dropped as
    /// out of order or carries no playback information.
    pub fn apply_receiver(&mut self, event: &ReceiverEvent) -> bool {
        match event {
            ReceiverEvent::Status(status) => self.apply_status(status),
            ReceiverEvent::Volume {
                timestamp_ms,
                level,
            } => {
                if self.is_stale(*timestamp_ms) {
                    return false;
                }
                self.state.write().volume_level = Some(level.clamp(0.0, 1.0));
                true
            }
            ReceiverEvent::Error { message } => {
                let mut state = self.state.write();
                state.player_state = PlayerState::Error;
                state.last_error = Some(message.clone());
                true
            }
            ReceiverEvent::Suspended { .. }
            | ReceiverEvent::Resumed
            | ReceiverEvent::Terminated { .. } => false,
        }
    }

    fn is_stale(&self, timestamp_ms: u64) -> bool {
        match self.baseline_ms {
            Some(baseline) if timestamp_ms < baseline => {
                debug!(
                    timestamp_ms,
                    baseline_ms = baseline,
                    "Dropping out-of-order receiver push"
                );
                true
            }
            _ => false,
        }
    }

    fn apply_status(&mut self, status: &ReceiverStatus) -> bool {
        if self.is_stale(status.timestamp_ms) {
            return false;
        }
        self.baseline_ms = Some(status.timestamp_ms);

        let mut state = self.state.write();
        if let Some(player_state) = status.player_state {
            state.player_state = player_state;
            if player_state != PlayerState::Error {
                state.last_error = None;
            }
        }
        if let Some(is_live) = status.is_live {
            state.is_live = is_live;
        }
        if let Some(position_ms) = status.position_ms {
            state.position_ms = position_ms;
        }
        if state.is_live {
            state.duration_ms = None;
        } else if status.duration_ms.is_some() {
            state.duration_ms = status.duration_ms;
        }
        true
    }

    /// Back to Idle, as after a session end.
    pub fn reset(&mut self) {
        *self.state.write() = PlaybackState::default();
        self.baseline_ms = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MediaItem;

    fn status(ts: u64, position_ms: u64) -> ReceiverEvent {
        ReceiverEvent::Status(ReceiverStatus {
            timestamp_ms: ts,
            player_state: Some(PlayerState::Playing),
            position_ms: Some(position_ms),
            duration_ms: Some(120_000),
            is_live: None,
        })
    }

    #[test]
    fn test_load_ack_sets_buffering() {
        let mut p = MediaStateProjector::new();
        let item = MediaItem::new("a").unwrap();
        p.apply_ack(&CommandKind::Load(item));

        let s = p.snapshot();
        assert_eq!(s.player_state, PlayerState::Buffering);
        assert!(!s.is_live);
        assert_eq!(s.position_ms, 0);
        assert_eq!(s.content_url.as_deref(), Some("a"));
    }

    #[test]
    fn test_receiver_wins_over_ack() {
        let mut p = MediaStateProjector::new();
        p.apply_ack(&CommandKind::Play);
        assert_eq!(p.snapshot().player_state, PlayerState::Playing);

        p.apply_receiver(&ReceiverEvent::Status(ReceiverStatus {
            timestamp_ms: 10,
            player_state: Some(PlayerState::Buffering),
            ..Default::default()
        }));
        assert_eq!(p.snapshot().player_state, PlayerState::Buffering);
    }

    #[test]
    fn test_earlier_timestamp_is_dropped() {
        let mut p = MediaStateProjector::new();
        assert!(p.apply_receiver(&status(2_000, 40_000)));
        assert!(!p.apply_receiver(&status(1_500, 30_000)));
        assert_eq!(p.snapshot().position_ms, 40_000);

        // Same timestamp is not older.
        assert!(p.apply_receiver(&status(2_000, 40_100)));
    }

    #[test]
    fn test_seek_resets_baseline() {
        let mut p = MediaStateProjector::new();
        p.apply_receiver(&status(2_000, 40_000));
        p.apply_ack(&CommandKind::Seek { position_ms: 5_000 });
        assert_eq!(p.snapshot().position_ms, 5_000);

        // Receiver clock restarted after the seek: accepted.
        assert!(p.apply_receiver(&status(100, 5_200)));
        assert_eq!(p.snapshot().position_ms, 5_200);
    }

    #[test]
    fn test_live_status_has_no_duration() {
        let mut p = MediaStateProjector::new();
        let item = MediaItem::new("https://x/live.m3u8").unwrap().live(true);
        p.apply_ack(&CommandKind::Load(item));
        p.apply_receiver(&status(1, 10));

        let s = p.snapshot();
        assert!(s.is_live);
        assert_eq!(s.duration_ms, None);
    }

    #[test]
    fn test_error_push_and_reset() {
        let mut p = MediaStateProjector::new();
        p.apply_ack(&CommandKind::SetVolume { level: 0.3 });
        p.apply_receiver(&ReceiverEvent::Error {
            message: "decoder failure".to_string(),
        });

        let handle = p.handle();
        let s = handle.snapshot();
        assert_eq!(s.player_state, PlayerState::Error);
        assert_eq!(s.last_error.as_deref(), Some("decoder failure"));
        assert_eq!(s.volume_level, Some(0.3));

        p.reset();
        assert_eq!(handle.snapshot(), PlaybackState::default());
    }

    #[test]
    fn test_stale_volume_push_is_dropped() {
        let mut p = MediaStateProjector::new();
        p.apply_receiver(&status(500, 1_000));
        assert!(!p.apply_receiver(&ReceiverEvent::Volume {
            timestamp_ms: 400,
            level: 0.9,
        }));
        assert!(p.apply_receiver(&ReceiverEvent::Volume {
            timestamp_ms: 600,
            level: 1.4,
        }));
        assert_eq!(p.snapshot().volume_level, Some(1.0));
    }

    #[test]
    fn test_lifecycle_events_are_not_applied() {
        let mut p = MediaStateProjector::new();
        assert!(!p.apply_receiver(&ReceiverEvent::Resumed));
        assert_eq!(p.snapshot(), PlaybackState::default());
    }
}
