//! Desktop alert sink: warning tone through `cpal` and notifications
//! through `org.freedesktop.Notifications` on the session bus.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use touchguard_core::{AlertError, AlertSink, SoundEnded};
use touchguard_hw::AlertTone;
use zbus::zvariant::Value;

const APP_NAME: &str = "TouchGuard";
const APP_ICON: &str = "dialog-warning";
const NOTIFICATION_TIMEOUT_MS: i32 = 3000;
/// Consecutive playback failures after which the tone is no longer tried.
const MAX_SOUND_FAILURES: u32 = 3;

#[zbus::proxy(
    interface = "org.freedesktop.Notifications",
    default_service = "org.freedesktop.Notifications",
    default_path = "/org/freedesktop/Notifications"
)]
trait Notifications {
    #[allow(clippy::too_many_arguments)]
    fn notify(
        &self,
        app_name: &str,
        replaces_id: u32,
        app_icon: &str,
        summary: &str,
        body: &str,
        actions: &[&str],
        hints: HashMap<&str, &Value<'_>>,
        expire_timeout: i32,
    ) -> zbus::Result<u32>;
}

/// Posts desktop notifications without blocking the caller.
pub struct DesktopNotifier {
    proxy: NotificationsProxy<'static>,
}

impl DesktopNotifier {
    pub async fn connect(conn: &zbus::Connection) -> zbus::Result<Self> {
        let proxy = NotificationsProxy::new(conn).await?;
        Ok(Self { proxy })
    }

    fn post(&self, summary: &str, body: &str) -> Result<(), AlertError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| AlertError::Notification(format!("no async runtime: {e}")))?;
        let proxy = self.proxy.clone();
        let summary = summary.to_string();
        let body = body.to_string();
        runtime.spawn(async move {
            let result = proxy
                .notify(
                    APP_NAME,
                    0,
                    APP_ICON,
                    &summary,
                    &body,
                    &[],
                    HashMap::new(),
                    NOTIFICATION_TIMEOUT_MS,
                )
                .await;
            match result {
                Ok(id) => tracing::debug!(id, "notification shown"),
                Err(e) => tracing::warn!(error = %e, "notification failed"),
            }
        });
        Ok(())
    }
}

/// Counts consecutive playback failures across blocking tasks.
#[derive(Clone, Default)]
struct SoundHealth {
    failures: Arc<AtomicU32>,
}

impl SoundHealth {
    fn record_success(&self) {
        self.failures.store(0, Ordering::Relaxed);
    }

    /// Returns true when this failure is the one that disables sound.
    fn record_failure(&self) -> bool {
        self.failures.fetch_add(1, Ordering::Relaxed) + 1 == MAX_SOUND_FAILURES
    }

    fn is_disabled(&self) -> bool {
        self.failures.load(Ordering::Relaxed) >= MAX_SOUND_FAILURES
    }
}

/// Where the daemon sends touch alerts. Either half may be absent
/// (sound disabled, no notification server).
pub struct DesktopAlerts {
    tone: Option<AlertTone>,
    notifier: Option<DesktopNotifier>,
    health: SoundHealth,
}

impl DesktopAlerts {
    pub fn new(tone: Option<AlertTone>, notifier: Option<DesktopNotifier>) -> Self {
        Self {
            tone,
            notifier,
            health: SoundHealth::default(),
        }
    }
}

impl AlertSink for DesktopAlerts {
    /// Opening the output device blocks, so playback starts on the blocking
    /// pool and the gate is reopened from there if it fails.
    fn play_sound(&mut self, finished: SoundEnded) -> Result<(), AlertError> {
        let tone = match &self.tone {
            Some(tone) if !self.health.is_disabled() => tone.clone(),
            _ => {
                finished.signal();
                return Ok(());
            }
        };
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| AlertError::Audio(format!("no async runtime: {e}")))?;

        let health = self.health.clone();
        runtime.spawn_blocking(move || {
            let on_end = finished.clone();
            match tone.play(move || on_end.signal()) {
                Ok(()) => health.record_success(),
                Err(e) => {
                    tracing::warn!(error = %e, "alert sound failed");
                    if health.record_failure() {
                        tracing::warn!(
                            failures = MAX_SOUND_FAILURES,
                            "alert sound disabled; notifications continue"
                        );
                    }
                    finished.signal();
                }
            }
        });
        Ok(())
    }

    fn notify(&mut self, title: &str, body: &str) -> Result<(), AlertError> {
        match &self.notifier {
            Some(notifier) => notifier.post(title, body),
            None => {
                tracing::debug!(title, body, "no notification server; alert not shown");
                Ok(())
            }
        }
    }
}

/// Load the alert tone: the configured WAV if any, else the built-in warning.
pub fn load_tone(enabled: bool, wav: Option<&std::path::Path>) -> Option<AlertTone> {
    if !enabled {
        tracing::info!("alert sound disabled via TOUCHGUARD_SOUND_ENABLED=0");
        return None;
    }
    match wav {
        Some(path) => match AlertTone::from_wav(path) {
            Ok(tone) => {
                tracing::info!(path = %path.display(), duration = ?tone.duration(), "alert sound loaded");
                Some(tone)
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "alert sound unreadable; using built-in tone");
                Some(AlertTone::warning())
            }
        },
        None => Some(AlertTone::warning()),
    }
}
