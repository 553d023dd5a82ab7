//! Alert cooldown and notification throttling.
//!
//! The sound cooldown is an atomic flag: the monitoring loop is the only
//! party that lowers it (by winning [`AlertGate::try_fire`]) and the sound
//! player is the only party that raises it again, through the
//! [`SoundEnded`] handle it receives with each playback request.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Cooldown between desktop notifications unless configured otherwise.
pub const DEFAULT_NOTIFICATION_COOLDOWN: Duration = Duration::from_millis(3000);

#[derive(Error, Debug)]
pub enum AlertError {
    #[error("audio output unavailable: {0}")]
    Audio(String),
    #[error("notification failed: {0}")]
    Notification(String),
}

/// Where alerts go: a warning sound and a desktop notification.
pub trait AlertSink: Send {
    /// Start playing the warning sound. `finished.signal()` must be called
    /// once playback completes; on error it is the caller's job to reopen
    /// the gate.
    fn play_sound(&mut self, finished: SoundEnded) -> Result<(), AlertError>;

    fn notify(&mut self, title: &str, body: &str) -> Result<(), AlertError>;
}

/// Whether a new sound alert may fire.
#[derive(Debug, Clone)]
pub struct AlertGate {
    ready: Arc<AtomicBool>,
}

impl AlertGate {
    pub fn new() -> Self {
        Self {
            ready: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Atomically claim the alert. Returns true for exactly one caller
    /// until the gate is reopened.
    pub fn try_fire(&self) -> bool {
        self.ready
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Handle to pass to the sound player.
    pub fn sound_ended(&self) -> SoundEnded {
        SoundEnded {
            ready: Arc::clone(&self.ready),
        }
    }

    pub(crate) fn reopen(&self) {
        self.ready.store(true, Ordering::Release);
    }
}

impl Default for AlertGate {
    fn default() -> Self {
        Self::new()
    }
}

/// The "sound finished" event: reopens the gate it was issued by.
#[derive(Debug, Clone)]
pub struct SoundEnded {
    ready: Arc<AtomicBool>,
}

impl SoundEnded {
    pub fn signal(&self) {
        self.ready.store(true, Ordering::Release);
    }
}

/// Suppresses notifications shown less than `cooldown` after the previous one.
#[derive(Debug, Default)]
pub struct NotificationThrottle {
    cooldown: Option<Duration>,
    last_shown: Option<Instant>,
}

impl NotificationThrottle {
    /// Enable notifications with the given cooldown. Until armed, every
    /// request is refused.
    pub fn arm(&mut self, cooldown: Duration) {
        self.cooldown = Some(cooldown);
        self.last_shown = None;
    }

    /// Record a notification at `now` if the cooldown allows it.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        let Some(cooldown) = self.cooldown else {
            return false;
        };
        match self.last_shown {
            Some(last) if now.saturating_duration_since(last) < cooldown => false,
            _ => {
                self.last_shown = Some(now);
                true
            }
        }
    }
}
