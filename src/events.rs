use std::fmt;

use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::models::{AnalysisResult, MediaKind};

/// A UI-friendly action the presentation layer can render as a button.
/// `kind` should be stable; the UI can map it to behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionKind {
    ImportCookies,
    UpdateYtDlp,
    ReinstallYtDlp,
    OpenSettingsProxy,
    ChooseFormat,
    Retry,
    OpenLogs,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Action {
    pub kind: ActionKind,
    pub label: String,
}

pub fn action(kind: ActionKind, label: impl Into<String>) -> Action {
    Action {
        kind,
        label: label.into(),
    }
}

/// Stable error codes so the presentation layer can map failures to UX.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Unknown,
    InvalidUrl,
    Busy,
    DestinationUnwritable,
    ToolMissing,
    ToolFailed,
    Network,
    GeoRestricted,
    LoginRequired,
    BotCheck,
    ExtractorOutdated,
    FormatUnavailable,
    Timeout,
    InvalidOutput,
    NoVideos,
    NoFormats,
    Canceled,
}

/// A user-facing failure. Keep `message` short and actionable; details belong in logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorReport {
    pub code: ErrorCode,
    pub message: String,
    pub actions: Vec<Action>,
}

/// Human-readable phase labels. The presentation layer may localize by key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Starting,
    FetchingInfo,
    ProcessingPlaylist,
    PreparingStreams,
    Downloading,
    DownloadingVideo,
    DownloadingAudio,
    DownloadingSubtitle,
    MergingFormats,
    RemovingSponsorSegments,
    DeletingOriginal,
    VideoExists,
    AudioExists,
    SubtitleExists,
    FileExists,
    VideoCompleted,
    AudioCompleted,
    SubtitleCompleted,
    Completed,
    CompletedCleaning,
    Cancelled,

    AnalyzingExtracting,
    AnalyzingFirstVideo,
    AnalyzingProcessing,
}

impl Status {
    pub fn message(self) -> &'static str {
        match self {
            Status::Starting => "Starting download…",
            Status::FetchingInfo => "Fetching video information…",
            Status::ProcessingPlaylist => "Processing playlist data…",
            Status::PreparingStreams => "Preparing video streams…",
            Status::Downloading => "Downloading…",
            Status::DownloadingVideo => "Downloading video…",
            Status::DownloadingAudio => "Downloading audio…",
            Status::DownloadingSubtitle => "Downloading subtitles…",
            Status::MergingFormats => "Merging video and audio…",
            Status::RemovingSponsorSegments => "Removing sponsor segments…",
            Status::DeletingOriginal => "Cleaning up intermediate files…",
            Status::VideoExists => "Video file already exists",
            Status::AudioExists => "Audio file already exists",
            Status::SubtitleExists => "Subtitle file already exists",
            Status::FileExists => "File already exists",
            Status::VideoCompleted => "Video download completed",
            Status::AudioCompleted => "Audio download completed",
            Status::SubtitleCompleted => "Subtitle download completed",
            Status::Completed => "Download completed",
            Status::CompletedCleaning => "Download completed, cleaning up subtitle files…",
            Status::Cancelled => "Download cancelled",
            Status::AnalyzingExtracting => "Extracting video information…",
            Status::AnalyzingFirstVideo => "Fetching first video of playlist…",
            Status::AnalyzingProcessing => "Processing video data…",
        }
    }

    pub(crate) fn downloading(kind: MediaKind) -> Self {
        match kind {
            MediaKind::Video => Status::DownloadingVideo,
            MediaKind::Audio => Status::DownloadingAudio,
            MediaKind::Subtitle => Status::DownloadingSubtitle,
            MediaKind::Other => Status::Downloading,
        }
    }

    pub(crate) fn exists(kind: MediaKind) -> Self {
        match kind {
            MediaKind::Video => Status::VideoExists,
            MediaKind::Audio => Status::AudioExists,
            MediaKind::Subtitle => Status::SubtitleExists,
            MediaKind::Other => Status::FileExists,
        }
    }

    pub(crate) fn completed(kind: Option<MediaKind>) -> Self {
        match kind {
            Some(MediaKind::Video) => Status::VideoCompleted,
            Some(MediaKind::Audio) => Status::AudioCompleted,
            Some(MediaKind::Subtitle) => Status::SubtitleCompleted,
            Some(MediaKind::Other) | None => Status::Completed,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// Speed/ETA pair parsed from a `[download]` progress line.
/// Raw strings are "N/A" when the tool did not report them.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferDetail {
    pub speed: String,
    pub eta: String,
    pub speed_bps: Option<u64>,
    pub eta_seconds: Option<u64>,
}

impl TransferDetail {
    /// Blank detail, sent when a transfer finishes so stale speed/ETA go away.
    pub fn cleared() -> Self {
        Self {
            speed: String::new(),
            eta: String::new(),
            speed_bps: None,
            eta_seconds: None,
        }
    }

    pub fn is_cleared(&self) -> bool {
        self.speed.is_empty() && self.eta.is_empty()
    }

    /// "Speed: 1.50MiB/s | ETA: 00:05", or empty once cleared.
    pub fn text(&self) -> String {
        if self.is_cleared() {
            return String::new();
        }
        format!("Speed: {} | ETA: {}", self.speed, self.eta)
    }
}

/// Events produced while a download runs. Exactly one terminal event
/// (`Completed`, `Cancelled` or `Error`) ends every download.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum ProgressEvent {
    Status(Status),
    /// 0..=100
    Percent(f64),
    Detail(TransferDetail),
    /// File name (not path) yt-dlp announced as its destination.
    FileDestination(String),
    /// File name yt-dlp reported as already downloaded.
    FileExists(String),
    Completed,
    Cancelled,
    Error(ErrorReport),
}

impl ProgressEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProgressEvent::Completed | ProgressEvent::Cancelled | ProgressEvent::Error(_)
        )
    }
}

/// Events produced by an analysis run. The result arrives in one piece.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum AnalysisEvent {
    Status(Status),
    Completed(Box<AnalysisResult>),
    Failed(ErrorReport),
    Cancelled,
}

impl AnalysisEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, AnalysisEvent::Status(_))
    }
}

/// Engine -> presentation events, keyed by operation id.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum EngineEvent {
    Download { id: Uuid, event: ProgressEvent },
    Analysis { id: Uuid, event: AnalysisEvent },
}

impl EngineEvent {
    pub fn id(&self) -> Uuid {
        match self {
            EngineEvent::Download { id, .. } | EngineEvent::Analysis { id, .. } => *id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        match self {
            EngineEvent::Download { event, .. } => event.is_terminal(),
            EngineEvent::Analysis { event, .. } => event.is_terminal(),
        }
    }
}

/// Sends events for one operation. A closed receiver is not an error:
/// the presentation layer may go away while work finishes.
#[derive(Debug, Clone)]
pub struct EventSink {
    id: Uuid,
    tx: mpsc::Sender<EngineEvent>,
}

impl EventSink {
    pub fn new(id: Uuid, tx: mpsc::Sender<EngineEvent>) -> Self {
        Self { id, tx }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub async fn download(&self, event: ProgressEvent) {
        let _ = self
            .tx
            .send(EngineEvent::Download { id: self.id, event })
            .await;
    }

    pub async fn analysis(&self, event: AnalysisEvent) {
        let _ = self
            .tx
            .send(EngineEvent::Analysis { id: self.id, event })
            .await;
    }
}
