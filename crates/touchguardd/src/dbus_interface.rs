use crate::controller::SessionHandle;
use touchguard_core::{Label, SessionError};
use zbus::interface;

/// D-Bus interface for the TouchGuard monitoring daemon.
///
/// Bus name: org.freedesktop.TouchGuard1
/// Object path: /org/freedesktop/TouchGuard1
pub struct TouchGuardService {
    session: SessionHandle,
}

impl TouchGuardService {
    pub fn new(session: SessionHandle) -> Self {
        Self { session }
    }
}

#[interface(name = "org.freedesktop.TouchGuard1")]
impl TouchGuardService {
    /// Current session status as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let status = self.session.status();
        let mut json = serde_json::to_value(&status)
            .map_err(|e| zbus::fdo::Error::Failed(format!("status encoding: {e}")))?;
        json["version"] = env!("CARGO_PKG_VERSION").into();
        Ok(json.to_string())
    }

    /// Record one calibration phase ("not-touching" or "touching").
    /// Returns the number of examples stored for the label.
    async fn calibrate(&self, label: &str) -> zbus::fdo::Result<u32> {
        let label = label
            .parse::<Label>()
            .map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))?;
        tracing::info!(%label, "calibrate requested");
        let count = self.session.calibrate(label).await.map_err(to_fdo)?;
        Ok(count as u32)
    }

    /// Start monitoring. Requires both calibration phases.
    async fn run(&self) -> zbus::fdo::Result<bool> {
        tracing::info!("run requested");
        self.session.run().await.map_err(to_fdo)?;
        Ok(true)
    }

    /// Stop monitoring. Returns false if monitoring was not running.
    async fn stop(&self) -> zbus::fdo::Result<bool> {
        tracing::info!("stop requested");
        self.session.stop().await.map_err(to_fdo)
    }
}

fn to_fdo(e: SessionError) -> zbus::fdo::Error {
    match e {
        SessionError::InvalidState { .. } | SessionError::Busy => {
            zbus::fdo::Error::AccessDenied(e.to_string())
        }
        SessionError::SourceClosed => zbus::fdo::Error::ServiceUnknown(e.to_string()),
        _ => zbus::fdo::Error::Failed(e.to_string()),
    }
}
