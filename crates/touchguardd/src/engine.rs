use std::future::Future;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use touchguard_core::{
    Embedding, EmbeddingExtractor, EmbeddingSource, MobileNetExtractor, SessionError, SourceProvider,
};
use touchguard_hw::{Camera, CaptureSource};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera error: {0}")]
    Camera(#[from] touchguard_hw::CameraError),
    #[error("extractor error: {0}")]
    Extractor(#[from] touchguard_core::ExtractorError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(String),
    #[error("engine thread exited")]
    ChannelClosed,
}

impl From<EngineError> for SessionError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Camera(e) => SessionError::Capture(e.to_string()),
            EngineError::Extractor(e) => SessionError::Extraction(e.to_string()),
            EngineError::Spawn(msg) => SessionError::CaptureUnavailable(msg),
            EngineError::ChannelClosed => SessionError::SourceClosed,
        }
    }
}

/// Messages sent from the session to the engine thread.
enum EngineRequest {
    Embed {
        reply: oneshot::Sender<Result<Embedding, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Capture the current frame and embed it.
    pub async fn embed(&self) -> Result<Embedding, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Embed { reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

impl EmbeddingSource for EngineHandle {
    fn embed_current(&mut self) -> impl Future<Output = Result<Embedding, SessionError>> + Send {
        let handle = self.clone();
        async move { handle.embed().await.map_err(SessionError::from) }
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// Discards warmup frames, then serves embed requests until every
/// handle is dropped. Capture and inference are blocking, so they never
/// run on the async runtime.
pub fn spawn_engine<C, X>(
    mut capture: C,
    mut extractor: X,
    warmup_frames: usize,
) -> Result<EngineHandle, EngineError>
where
    C: CaptureSource + 'static,
    X: EmbeddingExtractor + 'static,
{
    // Discard warmup frames for camera AGC/AE stabilization
    if warmup_frames > 0 {
        tracing::info!(count = warmup_frames, "discarding warmup frames");
        for _ in 0..warmup_frames {
            let _ = capture.current_frame();
        }
    }

    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("touchguard-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Embed { reply } => {
                        let result = embed_frame(&mut capture, &mut extractor);
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(|e| EngineError::Spawn(e.to_string()))?;

    Ok(EngineHandle { tx })
}

fn embed_frame<C, X>(capture: &mut C, extractor: &mut X) -> Result<Embedding, EngineError>
where
    C: CaptureSource,
    X: EmbeddingExtractor,
{
    let frame = capture.current_frame()?;
    if frame.is_dark {
        tracing::debug!(sequence = frame.sequence, "dark frame");
    }
    let embedding = extractor.embed(&frame.data, frame.width, frame.height)?;
    tracing::trace!(sequence = frame.sequence, dim = embedding.dim(), "frame embedded");
    Ok(embedding)
}

/// Opens the V4L2 camera and loads MobileNet for session initialization.
pub struct CameraProvider {
    pub camera_device: String,
    pub width: u32,
    pub height: u32,
    pub model_path: String,
    pub model_output: Option<String>,
    pub warmup_frames: usize,
}

impl SourceProvider for CameraProvider {
    type Source = EngineHandle;

    fn provide(self) -> impl Future<Output = Result<EngineHandle, SessionError>> + Send {
        async move {
            tokio::task::spawn_blocking(move || self.open())
                .await
                .map_err(|e| SessionError::CaptureUnavailable(format!("startup task failed: {e}")))?
        }
    }
}

impl CameraProvider {
    fn open(self) -> Result<EngineHandle, SessionError> {
        let camera = Camera::open(&self.camera_device, self.width, self.height)
            .map_err(|e| SessionError::CaptureUnavailable(e.to_string()))?;
        tracing::info!(
            device = %self.camera_device,
            width = camera.width,
            height = camera.height,
            fourcc = ?camera.fourcc,
            "camera opened"
        );

        let extractor = MobileNetExtractor::load(&self.model_path, self.model_output.as_deref())
            .map_err(|e| SessionError::ModelLoad(e.to_string()))?;
        tracing::info!(path = %self.model_path, "MobileNet extractor loaded");

        spawn_engine(camera, extractor, self.warmup_frames).map_err(SessionError::from)
    }
}
