//! One download, end to end.
//!
//! The orchestrator owns the event contract: whatever happens, a run ends
//! with exactly one terminal [`ProgressEvent`], and any cleanup it triggers
//! finishes before that event is sent.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::artifacts::ArtifactTracker;
use crate::command::build_download_command;
use crate::config::EngineConfig;
use crate::control::ControlSignal;
use crate::error::{classify_error_lines, EngineError, CONFLICTING_INSTALL_HINT};
use crate::events::{ErrorCode, EventSink, ProgressEvent, Status};
use crate::history::{HistoryStore, NewHistoryEntry};
use crate::models::{DownloadRequest, HistoryMetadata, Lifecycle};
use crate::output::OutputInterpreter;
use crate::process::{last_error_line, ExitClass, OutputTail, ProcessSupervisor};
use crate::retry::RetryPolicy;
use crate::url_utils::normalize_http_url;

/// Lines of recent output kept for error classification.
const OUTPUT_TAIL_LINES: usize = 20;

#[derive(Clone)]
pub struct DownloadOrchestrator {
    supervisor: ProcessSupervisor,
    ffmpeg_path: Option<PathBuf>,
    terminate_grace: Duration,
    cancel_settle: Duration,
    subtitle_settle: Duration,
    pause_poll: Duration,
    cleanup_retry: RetryPolicy,
    history: Option<Arc<dyn HistoryStore>>,
}

impl std::fmt::Debug for DownloadOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadOrchestrator")
            .field("supervisor", &self.supervisor)
            .field("history", &self.history.is_some())
            .finish()
    }
}

/// How the process part of a run ended.
enum Finish {
    Cancelled,
    Exited(ExitClass),
    WaitFailed(std::io::Error),
}

impl DownloadOrchestrator {
    pub fn new(cfg: &EngineConfig) -> Self {
        Self {
            supervisor: ProcessSupervisor::from_config(cfg),
            ffmpeg_path: cfg.ffmpeg_path.clone(),
            terminate_grace: cfg.terminate_grace,
            cancel_settle: cfg.cancel_settle,
            subtitle_settle: cfg.subtitle_settle,
            pause_poll: cfg.pause_poll,
            cleanup_retry: cfg.cleanup_retry.clone(),
            history: None,
        }
    }

    #[must_use]
    pub fn with_history(mut self, store: Arc<dyn HistoryStore>) -> Self {
        self.history = Some(store);
        self
    }

    /// Setup checks. A request that fails here never starts.
    pub async fn preflight(&self, req: &DownloadRequest) -> Result<(), EngineError> {
        if normalize_http_url(&req.url).is_none() {
            return Err(EngineError::InvalidUrl(req.url.trim().to_string()));
        }
        self.supervisor.check_available()?;
        ensure_writable(&req.destination).await
    }

    /// Drive `req` to a terminal state and return it. Events go to `sink`.
    pub async fn run(
        &self,
        req: &DownloadRequest,
        control: &mut ControlSignal,
        sink: &EventSink,
        meta: Option<&HistoryMetadata>,
    ) -> Lifecycle {
        let cmd = build_download_command(req, self.ffmpeg_path.as_deref());
        log::info!("Download {} output template: {}", sink.id(), cmd.output_template);

        let mut tracker = ArtifactTracker::new(&req.destination, self.cleanup_retry.clone());
        if req.merge_subtitles {
            tracker.snapshot_subtitles().await;
        }

        sink.download(ProgressEvent::Status(Status::Starting)).await;
        sink.download(ProgressEvent::Percent(0.0)).await;

        if control.is_cancelled() {
            return self.finish_cancelled(&tracker, sink).await;
        }

        let mut handle = match self.supervisor.spawn(&cmd.args) {
            Ok(h) => h,
            Err(e) => {
                log::error!("Failed to start yt-dlp: {}", e);
                sink.download(ProgressEvent::Error(e.report())).await;
                return Lifecycle::Failed;
            }
        };

        let mut interpreter = OutputInterpreter::new(req.merge_subtitles);
        let mut tail = OutputTail::new(OUTPUT_TAIL_LINES);

        let finish = loop {
            if !control.wait_while_paused(self.pause_poll).await {
                break Finish::Cancelled;
            }

            let line = tokio::select! {
                biased;
                _ = control.cancelled() => break Finish::Cancelled,
                line = handle.next_line() => line,
            };
            let Some(line) = line else {
                if control.is_cancelled() {
                    break Finish::Cancelled;
                }
                match handle.wait().await {
                    Ok(status) => break Finish::Exited(ExitClass::from(&status)),
                    Err(e) => break Finish::WaitFailed(e),
                }
            };

            log::debug!("yt-dlp: {}", line.text);
            let interpretation = interpreter.feed(&line.text);
            tail.push(line.text);

            if let Some(obs) = &interpretation.observation {
                tracker.observe(obs);
            }
            for ev in interpretation.events {
                sink.download(ev).await;
            }
        };

        let state = match finish {
            Finish::Cancelled => {
                log::info!("Download {} cancelled, stopping yt-dlp", sink.id());
                handle.terminate(self.terminate_grace).await;
                self.finish_cancelled(&tracker, sink).await
            }
            Finish::Exited(ExitClass::Success) => {
                self.finish_completed(req, &tracker, sink, meta).await
            }
            Finish::Exited(ExitClass::NotFound) => {
                log::error!("yt-dlp could not be executed by the system");
                sink.download(ProgressEvent::Error(EngineError::ToolNotFound.report()))
                    .await;
                Lifecycle::Failed
            }
            Finish::Exited(ExitClass::Failure(code)) => {
                let lines = tail.into_vec();
                let err = failure_error(code, &lines);
                log::error!("Download {} failed: {}", sink.id(), err);
                self.settle_and_clean(&tracker).await;
                sink.download(ProgressEvent::Error(err.report())).await;
                Lifecycle::Failed
            }
            Finish::WaitFailed(e) => {
                log::error!("Waiting for yt-dlp failed: {}", e);
                self.settle_and_clean(&tracker).await;
                sink.download(ProgressEvent::Error(EngineError::Io(e).report()))
                    .await;
                Lifecycle::Failed
            }
        };

        tracker.clear();
        state
    }

    async fn settle_and_clean(&self, tracker: &ArtifactTracker) {
        tokio::time::sleep(self.cancel_settle).await;
        let report = tracker.cleanup_partials().await;
        if !report.failed.is_empty() {
            log::warn!("{} partial files could not be removed", report.failed.len());
        }
    }

    async fn finish_cancelled(&self, tracker: &ArtifactTracker, sink: &EventSink) -> Lifecycle {
        self.settle_and_clean(tracker).await;
        sink.download(ProgressEvent::Status(Status::Cancelled)).await;
        sink.download(ProgressEvent::Cancelled).await;
        Lifecycle::Cancelled
    }

    async fn finish_completed(
        &self,
        req: &DownloadRequest,
        tracker: &ArtifactTracker,
        sink: &EventSink,
        meta: Option<&HistoryMetadata>,
    ) -> Lifecycle {
        sink.download(ProgressEvent::Percent(100.0)).await;

        if req.merge_subtitles {
            sink.download(ProgressEvent::Status(Status::CompletedCleaning))
                .await;
            tokio::time::sleep(self.subtitle_settle).await;
            let report = tracker.cleanup_subtitles().await;
            log::info!("Removed {} subtitle files after merge", report.removed.len());
        }

        if let (Some(store), Some(meta)) = (self.history.clone(), meta) {
            match tracker.final_media() {
                Some(path) => {
                    let entry = NewHistoryEntry::from_download(req, meta, path.to_path_buf());
                    record_history(store, entry, sink.id()).await;
                }
                None => log::warn!("No output file observed for {}, skipping history", req.url),
            }
        }

        sink.download(ProgressEvent::Status(Status::Completed)).await;
        sink.download(ProgressEvent::Completed).await;
        Lifecycle::Completed
    }
}

async fn record_history(store: Arc<dyn HistoryStore>, entry: NewHistoryEntry, id: Uuid) {
    let res = tokio::task::spawn_blocking(move || store.record(entry)).await;
    match res {
        Ok(Ok(row)) => log::info!("Download {} saved to history as #{}", id, row),
        Ok(Err(e)) => log::error!("Failed to save download {} to history: {:#}", id, e),
        Err(e) => log::error!("History task for {} panicked: {}", id, e),
    }
}

/// Error for a non-zero exit. Exit 1 usually points at a shadowing install.
fn failure_error(code: Option<i32>, lines: &[String]) -> EngineError {
    let detail = last_error_line(lines);
    let (message, classified) = match code {
        Some(1) => (
            format!("Download failed with return code 1. {CONFLICTING_INSTALL_HINT}"),
            ErrorCode::ToolFailed,
        ),
        Some(c) => (
            format!("Download failed with return code {c}"),
            classify_error_lines(lines),
        ),
        None => (
            "Download was terminated".to_string(),
            classify_error_lines(lines),
        ),
    };
    let message = match detail {
        Some(d) if code != Some(1) => format!("{message}: {d}"),
        _ => message,
    };
    EngineError::ToolFailed {
        exit_code: code,
        message,
        code: classified,
    }
}

/// Create the destination and prove we can write into it.
async fn ensure_writable(dir: &std::path::Path) -> Result<(), EngineError> {
    let not_writable = |source| EngineError::DestinationNotWritable {
        path: dir.to_path_buf(),
        source,
    };
    tokio::fs::create_dir_all(dir).await.map_err(not_writable)?;
    let probe = dir.join(format!(".write-test-{}", Uuid::new_v4()));
    tokio::fs::write(&probe, b"").await.map_err(not_writable)?;
    if let Err(e) = tokio::fs::remove_file(&probe).await {
        log::warn!("Could not remove write probe {}: {}", probe.display(), e);
    }
    Ok(())
}
