//! Session controller: setup, two-phase calibration, continuous monitoring.
//!
//! State machine:
//!
//! ```text
//! Initializing --(camera + model ready)--> CalibratingNotTouched
//! CalibratingNotTouched --(n samples)--> CalibratingTouched
//! CalibratingTouched --(n samples)--> Ready
//! Ready --(run)--> Running --(stop / failure budget spent)--> Ready
//! ```
//!
//! Every operation takes `&mut self`, so samples and monitoring iterations
//! never overlap. UI-facing state is published through a `watch` channel.

use crate::alert::{AlertGate, AlertSink, NotificationThrottle, DEFAULT_NOTIFICATION_COOLDOWN};
use crate::classifier::{ClassifierError, ExampleStore};
use crate::types::{ClassificationResult, Embedding, Label};
use serde::Serialize;
use std::future::Future;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;

/// A touch is reported only when the classifier is more confident than this.
pub const TOUCH_CONFIDENCE_THRESHOLD: f32 = 0.8;

const NOTE_FINDING_CAMERA: &str = "Finding the camera...";
const NOTE_CAMERA_NOT_FOUND: &str = "Camera not found";
const NOTE_MODEL_FAILED: &str = "Failed to load the model";
const NOTE_STARTING: &str = "Model is starting...";
const NOTE_STEP_1: &str = "Step 1: Record a video without touching your face";
const NOTE_STEP_2: &str = "Step 2: Record a video while touching your face";
const NOTE_STEP_3: &str = "Step 3: Ready. Start monitoring to begin";
const NOTE_TOUCHING: &str = "You are touching your face";
const NOTE_NOT_TOUCHING: &str = "You are not touching your face";
const NOTE_MONITORING_STOPPED: &str = "Monitoring stopped. Start monitoring to resume";
const NOTIFY_TITLE: &str = "Warning";

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("camera unavailable: {0}")]
    CaptureUnavailable(String),
    #[error("model failed to load: {0}")]
    ModelLoad(String),
    #[error("frame capture failed: {0}")]
    Capture(String),
    #[error("embedding extraction failed: {0}")]
    Extraction(String),
    #[error("classifier: {0}")]
    Classifier(#[from] ClassifierError),
    #[error("frame source is gone")]
    SourceClosed,
    #[error("cannot {operation} while {state:?}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },
    #[error("session is busy monitoring")]
    Busy,
    #[error("gave up after {failures} consecutive failures: {last}")]
    Aborted {
        failures: u32,
        #[source]
        last: Box<SessionError>,
    },
}

/// Frame read + embedding, as seen by the session.
pub trait EmbeddingSource: Send {
    /// Embed the frame currently in front of the camera.
    fn embed_current(&mut self) -> impl Future<Output = Result<Embedding, SessionError>> + Send;
}

/// Opens the camera and loads the model for [`SessionController::initialize`].
///
/// Fails with [`SessionError::CaptureUnavailable`] or [`SessionError::ModelLoad`].
pub trait SourceProvider: Send {
    type Source: EmbeddingSource;

    fn provide(self) -> impl Future<Output = Result<Self::Source, SessionError>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Initializing,
    CalibratingNotTouched,
    CalibratingTouched,
    Ready,
    Running,
}

impl SessionState {
    /// Which control the UI offers in this state when the session is idle.
    fn idle_step(self) -> u8 {
        match self {
            SessionState::Initializing | SessionState::Running => 0,
            SessionState::CalibratingNotTouched => 1,
            SessionState::CalibratingTouched => 2,
            SessionState::Ready => 3,
        }
    }
}

/// Number of stored examples per label.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExampleCounts {
    pub not_touched: usize,
    pub touched: usize,
}

/// Snapshot published to the UI after every change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStatus {
    pub state: SessionState,
    /// 0 = no control, 1 = start step 1, 2 = start step 2, 3 = start monitoring.
    pub step: u8,
    pub note: String,
    pub touched: bool,
    /// Fraction of the current calibration phase completed.
    pub progress: Option<f32>,
    pub examples: ExampleCounts,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self {
            state: SessionState::Initializing,
            step: 0,
            note: NOTE_FINDING_CAMERA.to_string(),
            touched: false,
            progress: None,
            examples: ExampleCounts::default(),
        }
    }
}

/// Timing and sample-count knobs.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub samples_per_label: usize,
    /// Pause after each calibration sample.
    pub sample_delay: Duration,
    /// Pause between monitoring iterations.
    pub poll_interval: Duration,
    /// Pause between model load and offering step 1.
    pub startup_delay: Duration,
    pub notification_cooldown: Duration,
    /// Consecutive failed samples/iterations tolerated before giving up.
    pub max_consecutive_failures: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            samples_per_label: 50,
            sample_delay: Duration::from_millis(100),
            poll_interval: Duration::from_millis(200),
            startup_delay: Duration::from_millis(1000),
            notification_cooldown: DEFAULT_NOTIFICATION_COOLDOWN,
            max_consecutive_failures: 5,
        }
    }
}

/// Drives a single calibration/monitoring session.
pub struct SessionController<S, K, A> {
    config: SessionConfig,
    state: SessionState,
    source: Option<S>,
    store: K,
    alerts: A,
    gate: AlertGate,
    throttle: NotificationThrottle,
    status_tx: watch::Sender<SessionStatus>,
}

impl<S, K, A> SessionController<S, K, A>
where
    S: EmbeddingSource,
    K: ExampleStore,
    A: AlertSink,
{
    pub fn new(mut config: SessionConfig, store: K, alerts: A) -> Self {
        config.samples_per_label = config.samples_per_label.max(1);
        config.max_consecutive_failures = config.max_consecutive_failures.max(1);
        let (status_tx, _) = watch::channel(SessionStatus::default());
        Self {
            config,
            state: SessionState::Initializing,
            source: None,
            store,
            alerts,
            gate: AlertGate::new(),
            throttle: NotificationThrottle::default(),
            status_tx,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn status(&self) -> SessionStatus {
        self.status_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status_tx.subscribe()
    }

    pub fn store(&self) -> &K {
        &self.store
    }

    pub fn gate(&self) -> &AlertGate {
        &self.gate
    }

    /// Acquire the camera and model, arm notifications, and offer step 1.
    ///
    /// On failure the session stays in `Initializing` with the reason as
    /// its note; there is no retry.
    pub async fn initialize<P>(&mut self, provider: P) -> Result<(), SessionError>
    where
        P: SourceProvider<Source = S>,
    {
        self.expect_state(SessionState::Initializing, "initialize")?;
        self.publish(|s| s.note = NOTE_FINDING_CAMERA.to_string());

        let source = match provider.provide().await {
            Ok(source) => source,
            Err(e) => {
                let note = match e {
                    SessionError::ModelLoad(_) => NOTE_MODEL_FAILED,
                    _ => NOTE_CAMERA_NOT_FOUND,
                };
                tracing::error!(error = %e, "session initialization failed");
                self.publish(|s| s.note = note.to_string());
                return Err(e);
            }
        };
        self.source = Some(source);

        self.publish(|s| s.note = NOTE_STARTING.to_string());
        self.throttle.arm(self.config.notification_cooldown);
        tokio::time::sleep(self.config.startup_delay).await;

        self.enter(SessionState::CalibratingNotTouched, NOTE_STEP_1);
        tracing::info!("session initialized, waiting for calibration");
        Ok(())
    }

    /// Collect `samples_per_label` examples for `label`.
    ///
    /// `on_progress` receives the completed fraction after every stored
    /// sample, ending at exactly 1.0. Returns the example count for `label`.
    pub async fn calibrate<F>(&mut self, label: Label, mut on_progress: F) -> Result<usize, SessionError>
    where
        F: FnMut(f32),
    {
        let (required, next, next_note) = match label {
            Label::NotTouched => (
                SessionState::CalibratingNotTouched,
                SessionState::CalibratingTouched,
                NOTE_STEP_2,
            ),
            Label::Touched => (SessionState::CalibratingTouched, SessionState::Ready, NOTE_STEP_3),
        };
        self.expect_state(required, "calibrate")?;

        let total = self.config.samples_per_label;
        let max_failures = self.config.max_consecutive_failures;
        tracing::info!(%label, samples = total, "calibration started");
        self.publish(|s| {
            s.step = 0;
            s.progress = Some(0.0);
            s.note = "Progress: 0 %".to_string();
        });

        let mut collected = 0usize;
        let mut failures = 0u32;
        while collected < total {
            match self.sample_into_store(label).await {
                Ok(()) => {
                    failures = 0;
                    collected += 1;
                    let progress = collected as f32 / total as f32;
                    on_progress(progress);
                    let counts = self.example_counts();
                    self.publish(|s| {
                        s.progress = Some(progress);
                        s.note = format!("Progress: {} %", collected * 100 / total);
                        s.examples = counts;
                    });
                    tracing::debug!(%label, collected, total, "calibration sample stored");
                }
                Err(e) => {
                    failures += 1;
                    tracing::warn!(%label, error = %e, failures, "calibration sample failed");
                    if failures >= max_failures {
                        self.store.clear_label(label);
                        let counts = self.example_counts();
                        let note = format!("Calibration failed: {e}");
                        let step = self.state.idle_step();
                        self.publish(|s| {
                            s.step = step;
                            s.progress = None;
                            s.note = note;
                            s.examples = counts;
                        });
                        return Err(SessionError::Aborted {
                            failures,
                            last: Box::new(e),
                        });
                    }
                }
            }
            tokio::time::sleep(self.config.sample_delay).await;
        }

        self.enter(next, next_note);
        tracing::info!(%label, examples = collected, "calibration finished");
        Ok(self.store.example_count(label))
    }

    /// Fails unless both calibration phases are done and monitoring is idle.
    pub fn ensure_can_run(&self) -> Result<(), SessionError> {
        self.expect_state(SessionState::Ready, "run")
    }

    /// Monitor until `stop` turns true (or its sender is dropped).
    ///
    /// Each iteration embeds the current frame, classifies it, and raises
    /// alerts; then waits `poll_interval`. The stop signal is honored while
    /// waiting for a frame and while sleeping. Afterwards the session is
    /// back in `Ready`.
    pub async fn run(&mut self, mut stop: watch::Receiver<bool>) -> Result<(), SessionError> {
        self.ensure_can_run()?;
        self.state = SessionState::Running;
        self.publish(|s| {
            s.state = SessionState::Running;
            s.step = 0;
            s.progress = None;
        });
        tracing::info!("monitoring started");

        let max_failures = self.config.max_consecutive_failures;
        let poll_interval = self.config.poll_interval;
        let mut failures = 0u32;

        let outcome = loop {
            let polled = tokio::select! {
                biased;
                _ = stop_requested(&mut stop) => break Ok(()),
                polled = self.poll_once() => polled,
            };

            match polled {
                Ok(_) => failures = 0,
                Err(e) => {
                    failures += 1;
                    tracing::warn!(error = %e, failures, "monitoring iteration failed");
                    if failures >= max_failures {
                        break Err(SessionError::Aborted {
                            failures,
                            last: Box::new(e),
                        });
                    }
                }
            }

            tokio::select! {
                biased;
                _ = stop_requested(&mut stop) => break Ok(()),
                _ = tokio::time::sleep(poll_interval) => {}
            }
        };

        let note = match &outcome {
            Ok(()) => NOTE_MONITORING_STOPPED.to_string(),
            Err(e) => format!("Monitoring failed: {e}"),
        };
        self.state = SessionState::Ready;
        self.publish(|s| {
            s.state = SessionState::Ready;
            s.step = SessionState::Ready.idle_step();
            s.touched = false;
            s.note = note;
        });
        tracing::info!(ok = outcome.is_ok(), "monitoring ended");
        outcome
    }

    /// One monitoring iteration. Returns whether a touch was detected.
    async fn poll_once(&mut self) -> Result<bool, SessionError> {
        let embedding = self.source_mut()?.embed_current().await?;
        let result = self.store.predict(&embedding)?;
        Ok(self.apply_result(&result, Instant::now()))
    }

    /// Update the touched flag and raise alerts for one classification.
    fn apply_result(&mut self, result: &ClassificationResult, now: Instant) -> bool {
        let confidence = result.confidence(Label::Touched);
        let touched = result.label == Label::Touched && confidence > TOUCH_CONFIDENCE_THRESHOLD;
        tracing::debug!(label = %result.label, confidence, touched, "classified frame");

        if touched {
            if self.gate.try_fire() {
                match self.alerts.play_sound(self.gate.sound_ended()) {
                    Ok(()) => tracing::info!(confidence, "face touch alert"),
                    Err(e) => {
                        tracing::warn!(error = %e, "alert sound failed");
                        self.gate.reopen();
                    }
                }
            }
            if self.throttle.try_acquire(now) {
                if let Err(e) = self.alerts.notify(NOTIFY_TITLE, NOTE_TOUCHING) {
                    tracing::warn!(error = %e, "desktop notification failed");
                }
            }
        }

        let note = if touched { NOTE_TOUCHING } else { NOTE_NOT_TOUCHING };
        self.publish(|s| {
            s.touched = touched;
            s.note = note.to_string();
        });
        touched
    }

    async fn sample_into_store(&mut self, label: Label) -> Result<(), SessionError> {
        let embedding = self.source_mut()?.embed_current().await?;
        self.store.add_example(embedding, label)?;
        Ok(())
    }

    fn source_mut(&mut self) -> Result<&mut S, SessionError> {
        self.source.as_mut().ok_or(SessionError::SourceClosed)
    }

    fn example_counts(&self) -> ExampleCounts {
        ExampleCounts {
            not_touched: self.store.example_count(Label::NotTouched),
            touched: self.store.example_count(Label::Touched),
        }
    }

    fn expect_state(&self, required: SessionState, operation: &'static str) -> Result<(), SessionError> {
        if self.state == required {
            Ok(())
        } else if self.state == SessionState::Running {
            Err(SessionError::Busy)
        } else {
            Err(SessionError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }

    /// Transition to an idle state and offer its control.
    fn enter(&mut self, state: SessionState, note: &str) {
        tracing::info!(from = ?self.state, to = ?state, "session state change");
        self.state = state;
        self.publish(|s| {
            s.state = state;
            s.step = state.idle_step();
            s.progress = None;
            s.note = note.to_string();
        });
    }

    fn publish(&self, update: impl FnOnce(&mut SessionStatus)) {
        self.status_tx.send_if_modified(|status| {
            let before = status.clone();
            update(status);
            *status != before
        });
    }
}

/// Resolves once a stop is requested; a dropped sender counts as one.
async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::{AlertError, SoundEnded};
    use crate::classifier::KnnClassifier;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    // --- Fakes ---

    /// Emits distinct two-dimensional embeddings, failing on request.
    /// After `stall_after` embeddings every further request hangs, like a
    /// camera that stopped delivering frames.
    struct FakeSource {
        produced: usize,
        fail_first: usize,
        fail_always: bool,
        stall_after: Option<usize>,
    }

    impl FakeSource {
        fn healthy() -> Self {
            Self { produced: 0, fail_first: 0, fail_always: false, stall_after: None }
        }
    }

    impl EmbeddingSource for FakeSource {
        fn embed_current(&mut self) -> impl Future<Output = Result<Embedding, SessionError>> + Send {
            let stalled = self.stall_after.is_some_and(|limit| self.produced >= limit);
            let result = if stalled {
                Err(SessionError::SourceClosed)
            } else if self.fail_always || self.fail_first > 0 {
                self.fail_first = self.fail_first.saturating_sub(1);
                Err(SessionError::Capture("camera unplugged".into()))
            } else {
                self.produced += 1;
                let t = self.produced as f32;
                Ok(Embedding::new(vec![1.0, t * 0.01]))
            };
            async move {
                if stalled {
                    std::future::pending::<()>().await;
                }
                result
            }
        }
    }

    struct FakeProvider(Result<FakeSource, SessionError>);

    impl SourceProvider for FakeProvider {
        type Source = FakeSource;

        fn provide(self) -> impl Future<Output = Result<FakeSource, SessionError>> + Send {
            async move { self.0 }
        }
    }

    /// Returns scripted predictions, then "not touched" forever.
    #[derive(Default)]
    struct ScriptedStore {
        script: Mutex<VecDeque<ClassificationResult>>,
        counts: [usize; Label::COUNT],
    }

    impl ScriptedStore {
        fn with(results: Vec<ClassificationResult>) -> Self {
            Self {
                script: Mutex::new(results.into()),
                counts: [0; Label::COUNT],
            }
        }
    }

    impl ExampleStore for ScriptedStore {
        fn add_example(&mut self, _embedding: Embedding, label: Label) -> Result<(), ClassifierError> {
            self.counts[label.index()] += 1;
            Ok(())
        }

        fn predict(&self, _embedding: &Embedding) -> Result<ClassificationResult, ClassifierError> {
            let next = self.script.lock().unwrap().pop_front();
            Ok(next.unwrap_or_else(|| result(Label::NotTouched, 1.0)))
        }

        fn example_count(&self, label: Label) -> usize {
            self.counts[label.index()]
        }

        fn clear_label(&mut self, label: Label) {
            self.counts[label.index()] = 0;
        }
    }

    #[derive(Default)]
    struct AlertLog {
        sounds: usize,
        notifications: usize,
        pending_end: Option<SoundEnded>,
    }

    #[derive(Clone, Default)]
    struct FakeAlerts {
        log: Arc<Mutex<AlertLog>>,
        sound_broken: bool,
    }

    impl AlertSink for FakeAlerts {
        fn play_sound(&mut self, finished: SoundEnded) -> Result<(), AlertError> {
            if self.sound_broken {
                return Err(AlertError::Audio("no output device".into()));
            }
            let mut log = self.log.lock().unwrap();
            log.sounds += 1;
            log.pending_end = Some(finished);
            Ok(())
        }

        fn notify(&mut self, _title: &str, _body: &str) -> Result<(), AlertError> {
            self.log.lock().unwrap().notifications += 1;
            Ok(())
        }
    }

    fn result(label: Label, confidence: f32) -> ClassificationResult {
        let mut confidences = [1.0 - confidence; Label::COUNT];
        confidences[label.index()] = confidence;
        ClassificationResult { label, confidences, neighbors: 3 }
    }

    fn fast_config(samples: usize) -> SessionConfig {
        SessionConfig {
            samples_per_label: samples,
            sample_delay: Duration::ZERO,
            poll_interval: Duration::from_millis(1),
            startup_delay: Duration::ZERO,
            notification_cooldown: Duration::from_millis(3000),
            max_consecutive_failures: 3,
        }
    }

    type KnnSession = SessionController<FakeSource, KnnClassifier, FakeAlerts>;
    type ScriptedSession = SessionController<FakeSource, ScriptedStore, FakeAlerts>;

    async fn ready_session(store: ScriptedStore, alerts: FakeAlerts) -> ScriptedSession {
        let mut session = SessionController::new(fast_config(2), store, alerts);
        session.initialize(FakeProvider(Ok(FakeSource::healthy()))).await.unwrap();
        session.calibrate(Label::NotTouched, |_| {}).await.unwrap();
        session.calibrate(Label::Touched, |_| {}).await.unwrap();
        assert_eq!(session.state(), SessionState::Ready);
        session
    }

    // --- Initialization ---

    #[tokio::test]
    async fn test_initialize_without_camera() {
        let mut session: KnnSession =
            SessionController::new(fast_config(50), KnnClassifier::default(), FakeAlerts::default());
        let err = session
            .initialize(FakeProvider(Err(SessionError::CaptureUnavailable("/dev/video0".into()))))
            .await
            .unwrap_err();

        assert!(matches!(err, SessionError::CaptureUnavailable(_)));
        assert_eq!(session.state(), SessionState::Initializing);
        assert_eq!(session.status().note, NOTE_CAMERA_NOT_FOUND);
        assert_eq!(session.status().step, 0);

        // Never reaches calibration
        assert!(matches!(
            session.calibrate(Label::NotTouched, |_| {}).await,
            Err(SessionError::InvalidState { state: SessionState::Initializing, .. })
        ));
    }

    #[tokio::test]
    async fn test_initialize_model_failure() {
        let mut session: KnnSession =
            SessionController::new(fast_config(50), KnnClassifier::default(), FakeAlerts::default());
        let err = session
            .initialize(FakeProvider(Err(SessionError::ModelLoad("missing".into()))))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::ModelLoad(_)));
        assert_eq!(session.status().note, NOTE_MODEL_FAILED);
    }

    #[tokio::test]
    async fn test_initialize_offers_step_one_once() {
        let mut session: KnnSession =
            SessionController::new(fast_config(50), KnnClassifier::default(), FakeAlerts::default());
        session.initialize(FakeProvider(Ok(FakeSource::healthy()))).await.unwrap();

        let status = session.status();
        assert_eq!(status.state, SessionState::CalibratingNotTouched);
        assert_eq!(status.step, 1);
        assert_eq!(status.note, NOTE_STEP_1);

        assert!(session.initialize(FakeProvider(Ok(FakeSource::healthy()))).await.is_err());
    }

    // --- Calibration ---

    #[tokio::test]
    async fn test_full_calibration_sequence() {
        let mut session: KnnSession =
            SessionController::new(fast_config(50), KnnClassifier::default(), FakeAlerts::default());
        let mut states = vec![session.state()];

        session.initialize(FakeProvider(Ok(FakeSource::healthy()))).await.unwrap();
        states.push(session.state());
        let not_touched = session.calibrate(Label::NotTouched, |_| {}).await.unwrap();
        states.push(session.state());
        let touched = session.calibrate(Label::Touched, |_| {}).await.unwrap();
        states.push(session.state());

        assert_eq!(
            states,
            vec![
                SessionState::Initializing,
                SessionState::CalibratingNotTouched,
                SessionState::CalibratingTouched,
                SessionState::Ready,
            ]
        );
        assert_eq!((not_touched, touched), (50, 50));
        assert_eq!(session.store().len(), 100);
        assert_eq!(session.status().examples, ExampleCounts { not_touched: 50, touched: 50 });
        assert_eq!(session.status().step, 3);
    }

    #[tokio::test]
    async fn test_calibration_progress_strictly_increasing() {
        let mut session: KnnSession =
            SessionController::new(fast_config(50), KnnClassifier::default(), FakeAlerts::default());
        session.initialize(FakeProvider(Ok(FakeSource::healthy()))).await.unwrap();

        let mut progress = Vec::new();
        session.calibrate(Label::NotTouched, |p| progress.push(p)).await.unwrap();

        assert_eq!(progress.len(), 50);
        assert!((progress[0] - 1.0 / 50.0).abs() < 1e-6);
        assert_eq!(*progress.last().unwrap(), 1.0);
        assert!(progress.windows(2).all(|w| w[1] > w[0]));
    }

    #[tokio::test]
    async fn test_calibration_order_enforced() {
        let mut session: KnnSession =
            SessionController::new(fast_config(5), KnnClassifier::default(), FakeAlerts::default());
        session.initialize(FakeProvider(Ok(FakeSource::healthy()))).await.unwrap();

        assert!(matches!(
            session.calibrate(Label::Touched, |_| {}).await,
            Err(SessionError::InvalidState { operation: "calibrate", .. })
        ));
        assert_eq!(session.store().len(), 0);

        session.calibrate(Label::NotTouched, |_| {}).await.unwrap();
        // Step 1 cannot be repeated once done
        assert!(session.calibrate(Label::NotTouched, |_| {}).await.is_err());
        assert_eq!(session.store().example_count(Label::NotTouched), 5);
    }

    #[tokio::test]
    async fn test_calibration_retries_transient_failures() {
        let mut session: KnnSession =
            SessionController::new(fast_config(4), KnnClassifier::default(), FakeAlerts::default());
        let source = FakeSource { fail_first: 2, ..FakeSource::healthy() };
        session.initialize(FakeProvider(Ok(source))).await.unwrap();

        let count = session.calibrate(Label::NotTouched, |_| {}).await.unwrap();
        assert_eq!(count, 4);
        assert_eq!(session.state(), SessionState::CalibratingTouched);
    }

    #[tokio::test]
    async fn test_calibration_aborts_after_failure_budget() {
        let mut session: KnnSession =
            SessionController::new(fast_config(4), KnnClassifier::default(), FakeAlerts::default());
        let source = FakeSource { fail_always: true, ..FakeSource::healthy() };
        session.initialize(FakeProvider(Ok(source))).await.unwrap();

        let err = session.calibrate(Label::NotTouched, |_| {}).await.unwrap_err();
        assert!(matches!(err, SessionError::Aborted { failures: 3, .. }));
        assert_eq!(session.state(), SessionState::CalibratingNotTouched);
        assert_eq!(session.status().step, 1);
        assert_eq!(session.store().example_count(Label::NotTouched), 0);
    }

    // --- Monitoring ---

    #[tokio::test]
    async fn test_run_requires_both_calibrations() {
        let mut session: KnnSession =
            SessionController::new(fast_config(3), KnnClassifier::default(), FakeAlerts::default());
        let (_stop_tx, stop_rx) = watch::channel(false);

        assert!(session.run(stop_rx.clone()).await.is_err());
        session.initialize(FakeProvider(Ok(FakeSource::healthy()))).await.unwrap();
        assert!(session.run(stop_rx.clone()).await.is_err());
        session.calibrate(Label::NotTouched, |_| {}).await.unwrap();
        assert!(matches!(
            session.run(stop_rx.clone()).await,
            Err(SessionError::InvalidState { operation: "run", state: SessionState::CalibratingTouched })
        ));
        session.calibrate(Label::Touched, |_| {}).await.unwrap();
        assert!(session.ensure_can_run().is_ok());
    }

    #[tokio::test]
    async fn test_threshold_is_strict() {
        let alerts = FakeAlerts::default();
        let mut session = ready_session(ScriptedStore::default(), alerts.clone()).await;
        let now = Instant::now();

        assert!(!session.apply_result(&result(Label::Touched, 0.80), now));
        assert!(!session.status().touched);
        assert_eq!(alerts.log.lock().unwrap().sounds, 0);

        assert!(session.apply_result(&result(Label::Touched, 0.81), now));
        assert!(session.status().touched);
        assert_eq!(alerts.log.lock().unwrap().sounds, 1);
    }

    #[tokio::test]
    async fn test_confident_not_touched_never_alerts() {
        let alerts = FakeAlerts::default();
        let mut session = ready_session(ScriptedStore::default(), alerts.clone()).await;
        assert!(!session.apply_result(&result(Label::NotTouched, 1.0), Instant::now()));
        assert_eq!(alerts.log.lock().unwrap().sounds, 0);
        assert!(session.gate().is_ready());
    }

    #[tokio::test]
    async fn test_three_result_sequence_fires_once() {
        let alerts = FakeAlerts::default();
        let store = ScriptedStore::with(vec![
            result(Label::Touched, 0.9),
            result(Label::Touched, 0.9),
            result(Label::NotTouched, 0.6),
        ]);
        let mut session = ready_session(store, alerts.clone()).await;

        let mut touched = Vec::new();
        for _ in 0..3 {
            touched.push(session.poll_once().await.unwrap());
        }

        assert_eq!(touched, vec![true, true, false]);
        let log = alerts.log.lock().unwrap();
        assert_eq!(log.sounds, 1);
        // Second notification falls inside the 3 s cooldown
        assert_eq!(log.notifications, 1);
        assert!(!session.gate().is_ready());
    }

    #[tokio::test]
    async fn test_cooldown_holds_until_sound_ends() {
        let alerts = FakeAlerts::default();
        let store = ScriptedStore::with(vec![result(Label::Touched, 1.0); 10]);
        let mut session = ready_session(store, alerts.clone()).await;

        for _ in 0..5 {
            assert!(session.poll_once().await.unwrap());
        }
        assert_eq!(alerts.log.lock().unwrap().sounds, 1);

        let ended = alerts.log.lock().unwrap().pending_end.take().unwrap();
        ended.signal();
        assert!(session.poll_once().await.unwrap());
        assert_eq!(alerts.log.lock().unwrap().sounds, 2);
    }

    #[tokio::test]
    async fn test_broken_sound_reopens_gate() {
        let alerts = FakeAlerts { sound_broken: true, ..Default::default() };
        let mut session = ready_session(ScriptedStore::default(), alerts.clone()).await;

        assert!(session.apply_result(&result(Label::Touched, 0.95), Instant::now()));
        assert!(session.gate().is_ready());
        assert_eq!(alerts.log.lock().unwrap().notifications, 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_signal() {
        let alerts = FakeAlerts::default();
        let mut session = ready_session(ScriptedStore::default(), alerts).await;
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut status = session.subscribe();

        let stopper = async move {
            status
                .wait_for(|s| s.state == SessionState::Running)
                .await
                .map(|_| ())
                .unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            stop_tx.send(true).unwrap();
        };

        let (outcome, ()) = tokio::join!(session.run(stop_rx), stopper);
        assert!(outcome.is_ok());
        assert_eq!(session.state(), SessionState::Ready);
        assert!(!session.status().touched);
        assert_eq!(session.status().step, 3);

        // Restartable after a stop
        assert!(session.ensure_can_run().is_ok());
    }

    #[tokio::test]
    async fn test_run_stops_while_waiting_for_a_frame() {
        let alerts = FakeAlerts::default();
        let mut session = ready_session(ScriptedStore::default(), alerts).await;
        let produced = session.source.as_ref().map(|s| s.produced).unwrap();
        session.source.as_mut().unwrap().stall_after = Some(produced + 4);
        let (stop_tx, stop_rx) = watch::channel(false);

        let stopper = async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stop_tx.send(true).unwrap();
        };

        let run = tokio::time::timeout(Duration::from_secs(2), session.run(stop_rx));
        let (outcome, ()) = tokio::join!(run, stopper);
        assert!(outcome.expect("run ignored the stop signal").is_ok());
        assert_eq!(session.source.as_ref().map(|s| s.produced), Some(produced + 4));
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(session.status().note, NOTE_MONITORING_STOPPED);
    }

    #[tokio::test]
    async fn test_run_gives_up_after_failure_budget() {
        let alerts = FakeAlerts::default();
        let mut session = ready_session(ScriptedStore::default(), alerts).await;
        session.source = Some(FakeSource { fail_always: true, ..FakeSource::healthy() });
        let (_stop_tx, stop_rx) = watch::channel(false);

        let err = session.run(stop_rx).await.unwrap_err();
        assert!(matches!(err, SessionError::Aborted { failures: 3, .. }));
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn test_run_rejects_calibration_while_running() {
        let alerts = FakeAlerts::default();
        let mut session = ready_session(ScriptedStore::default(), alerts).await;
        session.state = SessionState::Running;
        assert!(matches!(
            session.calibrate(Label::Touched, |_| {}).await,
            Err(SessionError::Busy)
        ));
    }
}
