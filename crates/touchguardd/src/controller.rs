//! Session task: owns the [`SessionController`] and serializes commands
//! coming from D-Bus handlers.
//!
//! While monitoring runs, the task keeps answering commands: `Stop`
//! signals the run loop and replies once it has ended, everything else
//! is refused with [`SessionError::Busy`].

use tokio::sync::{mpsc, oneshot, watch};
use touchguard_core::{
    AlertSink, EmbeddingSource, ExampleStore, Label, SessionController, SessionError, SessionStatus,
    SourceProvider,
};

enum Command {
    Calibrate {
        label: Label,
        reply: oneshot::Sender<Result<usize, SessionError>>,
    },
    Run {
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Stop {
        reply: oneshot::Sender<bool>,
    },
}

/// Clone-safe handle to the session task.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<Command>,
    status: watch::Receiver<SessionStatus>,
}

impl SessionHandle {
    /// Latest published session status.
    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    /// Record the calibration phase for `label`. Resolves when the phase
    /// completes, with the number of stored examples for that label.
    pub async fn calibrate(&self, label: Label) -> Result<usize, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Calibrate { label, reply }).await?;
        rx.await.map_err(|_| SessionError::SourceClosed)?
    }

    /// Start monitoring. Resolves as soon as monitoring has been accepted.
    pub async fn run(&self) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Run { reply }).await?;
        rx.await.map_err(|_| SessionError::SourceClosed)?
    }

    /// Stop monitoring. Returns false if nothing was running.
    pub async fn stop(&self) -> Result<bool, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Stop { reply }).await?;
        rx.await.map_err(|_| SessionError::SourceClosed)
    }

    async fn send(&self, command: Command) -> Result<(), SessionError> {
        self.tx
            .send(command)
            .await
            .map_err(|_| SessionError::SourceClosed)
    }
}

/// Spawn the session task. It initializes the session with `provider`
/// first; commands sent meanwhile are queued.
pub fn spawn_session<S, K, A, P>(controller: SessionController<S, K, A>, provider: P) -> SessionHandle
where
    S: EmbeddingSource + 'static,
    K: ExampleStore + 'static,
    A: AlertSink + 'static,
    P: SourceProvider<Source = S> + 'static,
{
    let (tx, rx) = mpsc::channel(8);
    let status = controller.subscribe();
    tokio::spawn(serve(controller, provider, rx));
    SessionHandle { tx, status }
}

async fn serve<S, K, A, P>(
    mut controller: SessionController<S, K, A>,
    provider: P,
    mut rx: mpsc::Receiver<Command>,
) where
    S: EmbeddingSource,
    K: ExampleStore,
    A: AlertSink,
    P: SourceProvider<Source = S>,
{
    if let Err(e) = controller.initialize(provider).await {
        tracing::error!(error = %e, "session unavailable; serving status only");
    }

    while let Some(command) = rx.recv().await {
        match command {
            Command::Calibrate { label, reply } => {
                let result = controller.calibrate(label, |_| {}).await;
                if let Err(e) = &result {
                    tracing::warn!(%label, error = %e, "calibration rejected or failed");
                }
                let _ = reply.send(result);
            }
            Command::Stop { reply } => {
                let _ = reply.send(false);
            }
            Command::Run { reply } => {
                if let Err(e) = controller.ensure_can_run() {
                    let _ = reply.send(Err(e));
                    continue;
                }
                let _ = reply.send(Ok(()));
                if monitor(&mut controller, &mut rx).await {
                    break;
                }
            }
        }
    }
    tracing::info!("session task exiting");
}

/// Run monitoring until stopped. Returns true if the command channel
/// closed in the meantime.
async fn monitor<S, K, A>(
    controller: &mut SessionController<S, K, A>,
    rx: &mut mpsc::Receiver<Command>,
) -> bool
where
    S: EmbeddingSource,
    K: ExampleStore,
    A: AlertSink,
{
    let (stop_tx, stop_rx) = watch::channel(false);
    let run = controller.run(stop_rx);
    tokio::pin!(run);

    let mut closed = false;
    let mut stop_replies = Vec::new();
    let outcome = loop {
        tokio::select! {
            outcome = &mut run => break outcome,
            command = rx.recv(), if !closed => match command {
                Some(Command::Stop { reply }) => {
                    tracing::info!("stop requested");
                    let _ = stop_tx.send(true);
                    stop_replies.push(reply);
                }
                Some(Command::Calibrate { reply, .. }) => {
                    let _ = reply.send(Err(SessionError::Busy));
                }
                Some(Command::Run { reply }) => {
                    let _ = reply.send(Err(SessionError::Busy));
                }
                None => {
                    closed = true;
                    let _ = stop_tx.send(true);
                }
            },
        }
    };

    if let Err(e) = outcome {
        tracing::error!(error = %e, "monitoring aborted");
    }
    for reply in stop_replies {
        let _ = reply.send(true);
    }
    closed
}
