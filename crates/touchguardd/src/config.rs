use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use touchguard_core::SessionConfig;

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    pub camera_width: u32,
    pub camera_height: u32,
    /// Directory containing the ONNX model file.
    pub model_dir: PathBuf,
    pub model_file: String,
    /// Name of the pooled feature output, when the model has several.
    pub model_output: Option<String>,
    /// Number of warmup frames to discard at startup (camera AGC/AE stabilization).
    pub warmup_frames: usize,
    /// Neighbors consulted per prediction.
    pub knn_k: usize,
    pub samples_per_label: usize,
    pub sample_delay_ms: u64,
    pub poll_interval_ms: u64,
    pub startup_delay_ms: u64,
    pub notify_cooldown_ms: u64,
    pub max_consecutive_failures: u32,
    /// Whether to play the warning sound on a detected touch.
    pub sound_enabled: bool,
    /// Optional WAV file replacing the built-in warning tone.
    pub alert_sound: Option<PathBuf>,
}

/// Parse a variable at its target type; unset, malformed or out-of-range
/// values yield `None`.
fn parsed<T: FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = var(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable setting");
            None
        }
    }
}

impl Config {
    /// Load configuration from `TOUCHGUARD_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let model_dir = var("TOUCHGUARD_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(touchguard_core::default_model_dir);

        Self {
            camera_device: var("TOUCHGUARD_CAMERA_DEVICE").unwrap_or_else(|| "/dev/video0".to_string()),
            camera_width: parsed(&var, "TOUCHGUARD_CAMERA_WIDTH").unwrap_or(640),
            camera_height: parsed(&var, "TOUCHGUARD_CAMERA_HEIGHT").unwrap_or(480),
            model_dir,
            model_file: var("TOUCHGUARD_MODEL_FILE")
                .unwrap_or_else(|| "mobilenetv2-features.onnx".to_string()),
            model_output: var("TOUCHGUARD_MODEL_OUTPUT").filter(|v| !v.is_empty()),
            warmup_frames: parsed(&var, "TOUCHGUARD_WARMUP_FRAMES").unwrap_or(4),
            knn_k: parsed(&var, "TOUCHGUARD_KNN_K").unwrap_or(3),
            samples_per_label: parsed(&var, "TOUCHGUARD_SAMPLES_PER_LABEL").unwrap_or(50),
            sample_delay_ms: parsed(&var, "TOUCHGUARD_SAMPLE_DELAY_MS").unwrap_or(100),
            poll_interval_ms: parsed(&var, "TOUCHGUARD_POLL_INTERVAL_MS").unwrap_or(200),
            startup_delay_ms: parsed(&var, "TOUCHGUARD_STARTUP_DELAY_MS").unwrap_or(1000),
            notify_cooldown_ms: parsed(&var, "TOUCHGUARD_NOTIFY_COOLDOWN_MS").unwrap_or(3000),
            max_consecutive_failures: parsed(&var, "TOUCHGUARD_MAX_FAILURES").unwrap_or(5),
            sound_enabled: var("TOUCHGUARD_SOUND_ENABLED")
                .map(|v| v != "0")
                .unwrap_or(true),
            alert_sound: var("TOUCHGUARD_ALERT_SOUND")
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
        }
    }

    /// Path to the MobileNet embedding model.
    pub fn model_path(&self) -> String {
        self.model_dir
            .join(&self.model_file)
            .to_string_lossy()
            .into_owned()
    }

    /// Timing and sample counts for the session controller.
    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            samples_per_label: self.samples_per_label,
            sample_delay: Duration::from_millis(self.sample_delay_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            startup_delay: Duration::from_millis(self.startup_delay_ms),
            notification_cooldown: Duration::from_millis(self.notify_cooldown_ms),
            max_consecutive_failures: self.max_consecutive_failures,
        }
    }
}
