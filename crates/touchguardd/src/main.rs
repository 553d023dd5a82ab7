use anyhow::Result;
use touchguard_core::{KnnClassifier, SessionController};
use tracing_subscriber::EnvFilter;

mod alerts;
mod config;
mod controller;
mod dbus_interface;
mod engine;

const BUS_NAME: &str = "org.freedesktop.TouchGuard1";
const OBJECT_PATH: &str = "/org/freedesktop/TouchGuard1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("touchguardd starting");

    let config = config::Config::from_env();
    tracing::info!(
        camera = %config.camera_device,
        model = %config.model_path(),
        samples_per_label = config.samples_per_label,
        "configuration loaded"
    );

    let conn = zbus::Connection::session().await?;

    let notifier = match alerts::DesktopNotifier::connect(&conn).await {
        Ok(notifier) => Some(notifier),
        Err(e) => {
            tracing::warn!(error = %e, "desktop notifications unavailable");
            None
        }
    };
    let tone = alerts::load_tone(config.sound_enabled, config.alert_sound.as_deref());

    let classifier = KnnClassifier::new(config.knn_k);
    tracing::info!(k = classifier.k(), "k-NN classifier ready");

    let controller = SessionController::new(
        config.session(),
        classifier,
        alerts::DesktopAlerts::new(tone, notifier),
    );
    let provider = engine::CameraProvider {
        camera_device: config.camera_device.clone(),
        width: config.camera_width,
        height: config.camera_height,
        model_path: config.model_path(),
        model_output: config.model_output.clone(),
        warmup_frames: config.warmup_frames,
    };
    let session = controller::spawn_session(controller, provider);

    conn.object_server()
        .at(OBJECT_PATH, dbus_interface::TouchGuardService::new(session))
        .await?;
    conn.request_name(BUS_NAME).await?;

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "touchguardd ready");

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("touchguardd shutting down");

    Ok(())
}
