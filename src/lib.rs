//! Process orchestration core for a yt-dlp driven downloader.
//!
//! The crate turns download and analysis requests into yt-dlp invocations,
//! supervises the process, interprets its output into typed events, and
//! cleans up after itself. It never prints; logging goes through the `log`
//! facade and the host installs a backend.
//!
//! ```no_run
//! # async fn demo() -> Result<(), ytdl_orchestrator::EngineError> {
//! use ytdl_orchestrator::{DownloadRequest, Engine, EngineConfig};
//!
//! let (engine, mut events) = Engine::new(EngineConfig::new("/usr/local/bin/yt-dlp"));
//! engine
//!     .start_download(DownloadRequest::new("https://www.youtube.com/watch?v=abc", "/tmp/dl"), None)
//!     .await?;
//! while let Some(ev) = events.recv().await {
//!     let done = ev.is_terminal();
//!     println!("{}", serde_json::to_string(&ev).unwrap_or_default());
//!     if done {
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod analysis;
pub mod artifacts;
pub mod command;
pub mod config;
pub mod control;
pub mod download;
pub mod engine;
pub mod error;
pub mod events;
pub mod history;
pub mod models;
pub mod output;
pub mod process;
pub mod retry;
pub mod url_utils;

pub use analysis::{AnalysisOrchestrator, AnalysisRequest};
pub use artifacts::{ArtifactTracker, CleanupReport};
pub use command::{build_analysis_command, build_download_command, build_entry_command, ToolCommand};
pub use config::EngineConfig;
pub use control::{control_channel, Control, ControlHandle, ControlSignal};
pub use download::DownloadOrchestrator;
pub use engine::{Engine, OperationHandle};
pub use error::EngineError;
pub use events::{AnalysisEvent, EngineEvent, ErrorCode, ErrorReport, EventSink, ProgressEvent, Status};
pub use history::{HistoryEntry, HistoryStore, NewHistoryEntry, SqliteHistory};
pub use models::{
    AnalysisResult, Auth, DownloadRequest, HistoryMetadata, Lifecycle, MediaKind, PlaylistEntry,
    PlaylistMetadata, ProxySettings, TimeSection, VideoFormat, VideoMetadata,
};
pub use output::{interpret_line, Interpretation, LineContext, Observation, OutputInterpreter};
pub use process::{ExitClass, ProcessHandle, ProcessSupervisor};
pub use retry::{retry_async, RetryPolicy};
