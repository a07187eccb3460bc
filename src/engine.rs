//! Engine: at most one analysis and one download at a time.
//!
//! Each operation runs as its own tokio task. The presentation layer talks
//! to the engine through these methods and listens on the event receiver
//! returned by [`Engine::new`].

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::analysis::{AnalysisOrchestrator, AnalysisRequest};
use crate::config::EngineConfig;
use crate::control::{control_channel, ControlHandle};
use crate::download::DownloadOrchestrator;
use crate::error::EngineError;
use crate::events::{AnalysisEvent, EngineEvent, ErrorCode, ErrorReport, EventSink, ProgressEvent};
use crate::history::HistoryStore;
use crate::models::{DownloadRequest, HistoryMetadata, Lifecycle};

/// Buffer between the engine and the presentation layer.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OperationKind {
    Analysis,
    Download,
}

/// Handle to one running (or finished) operation. Never reused: a new
/// operation always gets a new handle.
#[derive(Debug)]
pub struct OperationHandle {
    id: Uuid,
    control: ControlHandle,
    lifecycle: watch::Receiver<Lifecycle>,
    task: JoinHandle<()>,
}

impl OperationHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Current state. A running operation whose pause was requested
    /// reports `Paused`.
    pub fn lifecycle(&self) -> Lifecycle {
        let state = *self.lifecycle.borrow();
        if state == Lifecycle::Running && self.control.is_paused() {
            Lifecycle::Paused
        } else {
            state
        }
    }

    pub fn is_finished(&self) -> bool {
        self.lifecycle().is_terminal() || self.task.is_finished()
    }

    pub fn pause(&self) {
        self.control.pause();
    }

    pub fn resume(&self) {
        self.control.resume();
    }

    pub fn cancel(&self) {
        self.control.cancel();
    }

    /// Resolves with the terminal state.
    pub async fn wait(&self) -> Lifecycle {
        let mut rx = self.lifecycle.clone();
        let res = rx.wait_for(|s| s.is_terminal()).await.map(|s| *s);
        match res {
            Ok(state) => state,
            Err(_) => *rx.borrow(),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Lifecycle> {
        self.lifecycle.clone()
    }
}

pub struct Engine {
    config: EngineConfig,
    event_tx: mpsc::Sender<EngineEvent>,
    history: Option<Arc<dyn HistoryStore>>,
    analysis: Mutex<Option<OperationHandle>>,
    download: Mutex<Option<OperationHandle>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("history", &self.history.is_some())
            .finish()
    }
}

impl Engine {
    /// Create an engine and the receiver its events arrive on.
    /// This does NOT spawn anything; work starts on demand.
    pub fn new(config: EngineConfig) -> (Self, mpsc::Receiver<EngineEvent>) {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let engine = Self {
            config,
            event_tx,
            history: None,
            analysis: Mutex::new(None),
            download: Mutex::new(None),
        };
        (engine, event_rx)
    }

    /// Record completed downloads that carry [`HistoryMetadata`].
    #[must_use]
    pub fn with_history(mut self, store: Arc<dyn HistoryStore>) -> Self {
        self.history = Some(store);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Start analyzing `req.url`. A running analysis is cancelled first and
    /// given `analysis_replace_wait` to wind down.
    pub async fn start_analysis(&self, req: AnalysisRequest) -> Result<Uuid, EngineError> {
        let mut slot = self.analysis.lock().await;

        if let Some(prev) = slot.take() {
            if !prev.is_finished() {
                log::info!("Cancelling previous analysis {}", prev.id());
                prev.cancel();
                if tokio::time::timeout(self.config.analysis_replace_wait, prev.wait())
                    .await
                    .is_err()
                {
                    log::warn!("Previous analysis {} still winding down", prev.id());
                }
            }
        }

        let id = Uuid::new_v4();
        let sink = EventSink::new(id, self.event_tx.clone());
        let (control, mut signal) = control_channel();
        let orchestrator = AnalysisOrchestrator::new(&self.config);

        log::info!("Starting analysis {} for {}", id, req.url);
        let task_sink = sink.clone();
        let work = async move {
            let result = orchestrator.run(&req, &mut signal, &task_sink).await;
            match result {
                Ok(_) if signal.is_cancelled() => {
                    task_sink.analysis(AnalysisEvent::Cancelled).await;
                    Lifecycle::Cancelled
                }
                Ok(result) => {
                    task_sink
                        .analysis(AnalysisEvent::Completed(Box::new(result)))
                        .await;
                    Lifecycle::Completed
                }
                Err(EngineError::Cancelled) => {
                    log::info!("Analysis {} cancelled", task_sink.id());
                    task_sink.analysis(AnalysisEvent::Cancelled).await;
                    Lifecycle::Cancelled
                }
                Err(e) => {
                    log::error!("Analysis {} failed: {}", task_sink.id(), e);
                    task_sink.analysis(AnalysisEvent::Failed(e.report())).await;
                    Lifecycle::Failed
                }
            }
        };

        *slot = Some(spawn_guarded(OperationKind::Analysis, sink, control, work));
        Ok(id)
    }

    /// Start a download. Fails with `Busy` while another download is
    /// active, and with a setup error if the request can't start at all.
    pub async fn start_download(
        &self,
        req: DownloadRequest,
        meta: Option<HistoryMetadata>,
    ) -> Result<Uuid, EngineError> {
        let mut slot = self.download.lock().await;
        if slot.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            return Err(EngineError::Busy);
        }

        let mut orchestrator = DownloadOrchestrator::new(&self.config);
        if let Some(store) = &self.history {
            orchestrator = orchestrator.with_history(store.clone());
        }
        orchestrator.preflight(&req).await?;

        let id = Uuid::new_v4();
        let sink = EventSink::new(id, self.event_tx.clone());
        let (control, mut signal) = control_channel();

        log::info!("Starting download {} for {}", id, req.url);
        let task_sink = sink.clone();
        let work = async move {
            orchestrator
                .run(&req, &mut signal, &task_sink, meta.as_ref())
                .await
        };

        *slot = Some(spawn_guarded(OperationKind::Download, sink, control, work));
        Ok(id)
    }

    /// Returns `false` when no download is active.
    pub async fn pause_download(&self) -> bool {
        self.with_active(&self.download, OperationHandle::pause).await
    }

    pub async fn resume_download(&self) -> bool {
        self.with_active(&self.download, OperationHandle::resume).await
    }

    pub async fn cancel_download(&self) -> bool {
        self.with_active(&self.download, OperationHandle::cancel).await
    }

    pub async fn cancel_analysis(&self) -> bool {
        self.with_active(&self.analysis, OperationHandle::cancel).await
    }

    /// Id and state of the most recent download, if any.
    pub async fn download_state(&self) -> Option<(Uuid, Lifecycle)> {
        self.download
            .lock()
            .await
            .as_ref()
            .map(|h| (h.id(), h.lifecycle()))
    }

    pub async fn analysis_state(&self) -> Option<(Uuid, Lifecycle)> {
        self.analysis
            .lock()
            .await
            .as_ref()
            .map(|h| (h.id(), h.lifecycle()))
    }

    /// Wait for the current download (if any) to reach a terminal state.
    pub async fn wait_download(&self) -> Option<Lifecycle> {
        let rx = self.download.lock().await.as_ref().map(OperationHandle::subscribe);
        wait_terminal(rx).await
    }

    pub async fn wait_analysis(&self) -> Option<Lifecycle> {
        let rx = self.analysis.lock().await.as_ref().map(OperationHandle::subscribe);
        wait_terminal(rx).await
    }

    /// Cancel everything and wait for both operations to finish.
    pub async fn shutdown(&self) {
        self.cancel_analysis().await;
        self.cancel_download().await;
        self.wait_analysis().await;
        self.wait_download().await;
    }

    async fn with_active(
        &self,
        slot: &Mutex<Option<OperationHandle>>,
        f: impl FnOnce(&OperationHandle),
    ) -> bool {
        match slot.lock().await.as_ref() {
            Some(h) if !h.is_finished() => {
                f(h);
                true
            }
            _ => false,
        }
    }
}

async fn wait_terminal(rx: Option<watch::Receiver<Lifecycle>>) -> Option<Lifecycle> {
    let mut rx = rx?;
    let res = rx.wait_for(|s| s.is_terminal()).await.map(|s| *s);
    Some(match res {
        Ok(state) => state,
        Err(_) => *rx.borrow(),
    })
}

/// Run `work` on its own task. A panic inside it becomes a `Failed`
/// lifecycle plus a terminal error event instead of taking the host down.
fn spawn_guarded<F>(
    kind: OperationKind,
    sink: EventSink,
    control: ControlHandle,
    work: F,
) -> OperationHandle
where
    F: Future<Output = Lifecycle> + Send + 'static,
{
    let id = sink.id();
    let (lifecycle_tx, lifecycle_rx) = watch::channel(Lifecycle::Created);

    let task = tokio::spawn(async move {
        lifecycle_tx.send_replace(Lifecycle::Running);

        let state = match tokio::spawn(work).await {
            Ok(state) => state,
            Err(e) => {
                log::error!("{:?} {} crashed: {}", kind, id, e);
                let report = ErrorReport {
                    code: ErrorCode::Unknown,
                    message: format!("Internal error: {e}"),
                    actions: Vec::new(),
                };
                match kind {
                    OperationKind::Analysis => sink.analysis(AnalysisEvent::Failed(report)).await,
                    OperationKind::Download => sink.download(ProgressEvent::Error(report)).await,
                }
                Lifecycle::Failed
            }
        };

        lifecycle_tx.send_replace(state);
    });

    OperationHandle {
        id,
        control,
        lifecycle: lifecycle_rx,
        task,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn panicking_work_reports_failure() {
        let (tx, mut rx) = mpsc::channel(8);
        let sink = EventSink::new(Uuid::new_v4(), tx);
        let (control, _signal) = control_channel();
        let handle = spawn_guarded(OperationKind::Download, sink, control, async {
            panic!("boom");
        });

        assert_eq!(handle.wait().await, Lifecycle::Failed);
        match rx.recv().await {
            Some(EngineEvent::Download {
                event: ProgressEvent::Error(r),
                ..
            }) => assert_eq!(r.code, ErrorCode::Unknown),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn paused_is_derived_from_control() {
        let (tx, _rx) = mpsc::channel(8);
        let sink = EventSink::new(Uuid::new_v4(), tx);
        let (control, signal) = control_channel();
        let handle = spawn_guarded(OperationKind::Download, sink, control, async move {
            let mut signal = signal;
            signal.cancelled().await;
            Lifecycle::Cancelled
        });

        let mut rx = handle.subscribe();
        rx.wait_for(|s| *s == Lifecycle::Running).await.unwrap();
        handle.pause();
        assert_eq!(handle.lifecycle(), Lifecycle::Paused);
        handle.resume();
        assert_eq!(handle.lifecycle(), Lifecycle::Running);
        handle.cancel();
        assert_eq!(handle.wait().await, Lifecycle::Cancelled);
        assert!(handle.is_finished());
    }

    #[tokio::test]
    async fn idle_engine_controls_report_nothing_active() {
        let (engine, _rx) = Engine::new(EngineConfig::default());
        assert!(!engine.pause_download().await);
        assert!(!engine.cancel_analysis().await);
        assert_eq!(engine.download_state().await, None);
        assert_eq!(engine.wait_download().await, None);
    }

    #[tokio::test]
    async fn invalid_download_never_starts() {
        let (engine, _rx) = Engine::new(EngineConfig::default());
        let dir = tempfile::tempdir().unwrap();
        let err = engine
            .start_download(DownloadRequest::new("not a url", dir.path()), None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidUrl(_)));
        assert_eq!(engine.download_state().await, None);
    }
}
