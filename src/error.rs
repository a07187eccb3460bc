use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::events::{action, ActionKind, ErrorCode, ErrorReport};

/// Message for exit code 1, which in practice usually means a second yt-dlp
/// installation (snap, apt, pip) shadows the one we were given.
pub const CONFLICTING_INSTALL_HINT: &str = "This may be due to a conflict with multiple yt-dlp installations. \
Try uninstalling any system-installed yt-dlp (e.g. through snap or apt) and restart the application.";

#[derive(Debug, Error)]
pub enum EngineError {
    // --- setup ---
    #[error("yt-dlp not found at {}", .0.display())]
    ToolMissing(PathBuf),

    #[error("destination {} is not writable: {source}", path.display())]
    DestinationNotWritable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("not a valid http(s) URL: {0}")]
    InvalidUrl(String),

    #[error("another download is already running")]
    Busy,

    // --- process exit ---
    #[error("yt-dlp could not be executed (exit code 127). Check that yt-dlp is installed and the configured path is correct.")]
    ToolNotFound,

    #[error("{message}")]
    ToolFailed {
        exit_code: Option<i32>,
        message: String,
        code: ErrorCode,
    },

    #[error("yt-dlp timed out after {0:?}")]
    Timeout(Duration),

    // --- parse ---
    #[error("yt-dlp returned no data")]
    EmptyOutput,

    #[error("failed to parse yt-dlp output: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("playlist contains no videos")]
    PlaylistEmpty,

    #[error("no format information available for this video")]
    MissingFormats,

    // --- other ---
    #[error("operation cancelled")]
    Cancelled,

    #[error("failed to spawn yt-dlp: {0}")]
    Spawn(#[source] io::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl EngineError {
    pub fn code(&self) -> ErrorCode {
        match self {
            EngineError::ToolMissing(_) | EngineError::ToolNotFound | EngineError::Spawn(_) => {
                ErrorCode::ToolMissing
            }
            EngineError::DestinationNotWritable { .. } => ErrorCode::DestinationUnwritable,
            EngineError::InvalidUrl(_) => ErrorCode::InvalidUrl,
            EngineError::Busy => ErrorCode::Busy,
            EngineError::ToolFailed { code, .. } => *code,
            EngineError::Timeout(_) => ErrorCode::Timeout,
            EngineError::EmptyOutput | EngineError::InvalidJson(_) => ErrorCode::InvalidOutput,
            EngineError::PlaylistEmpty => ErrorCode::NoVideos,
            EngineError::MissingFormats => ErrorCode::NoFormats,
            EngineError::Cancelled => ErrorCode::Canceled,
            EngineError::Io(_) => ErrorCode::Unknown,
        }
    }

    fn actions(&self) -> Vec<crate::events::Action> {
        match self.code() {
            ErrorCode::ToolMissing => vec![action(ActionKind::ReinstallYtDlp, "Reinstall yt-dlp")],
            ErrorCode::ToolFailed => vec![
                action(ActionKind::ReinstallYtDlp, "Reinstall yt-dlp"),
                action(ActionKind::OpenLogs, "View logs"),
            ],
            ErrorCode::LoginRequired | ErrorCode::BotCheck => {
                vec![action(ActionKind::ImportCookies, "Import cookies from browser")]
            }
            ErrorCode::GeoRestricted => {
                vec![action(ActionKind::OpenSettingsProxy, "Configure proxy")]
            }
            ErrorCode::ExtractorOutdated => vec![
                action(ActionKind::UpdateYtDlp, "Update yt-dlp"),
                action(ActionKind::Retry, "Retry"),
            ],
            ErrorCode::FormatUnavailable => {
                vec![action(ActionKind::ChooseFormat, "Choose another format")]
            }
            ErrorCode::Network | ErrorCode::Timeout => vec![action(ActionKind::Retry, "Retry")],
            ErrorCode::Unknown | ErrorCode::InvalidOutput => {
                vec![action(ActionKind::OpenLogs, "View logs")]
            }
            _ => vec![],
        }
    }

    /// Convert into the payload carried by terminal error events.
    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            code: self.code(),
            message: self.to_string(),
            actions: self.actions(),
        }
    }
}

/// Classify the `ERROR:` lines among recent output. Other lines (file
/// names, progress) are ignored, so a destination like `cookies.mp4` can't
/// masquerade as a sign-in problem.
pub fn classify_error_lines<S: AsRef<str>>(lines: &[S]) -> ErrorCode {
    let errors: Vec<&str> = lines
        .iter()
        .map(|l| l.as_ref().trim())
        .filter(|l| l.starts_with("ERROR:"))
        .collect();
    classify_output(&errors.join("\n"))
}

/// Classify yt-dlp diagnostics into a stable code.
///
/// Only used to pick a code and remediation for generic failures; the
/// message shown to the user is decided by the caller.
pub fn classify_output(text: &str) -> ErrorCode {
    let lower = text.to_lowercase();

    if lower.contains("sign in")
        || lower.contains("login")
        || lower.contains("cookies")
        || lower.contains("age-restricted")
    {
        return ErrorCode::LoginRequired;
    }

    if lower.contains("captcha") || lower.contains("confirm you're not a bot") {
        return ErrorCode::BotCheck;
    }

    if lower.contains("not available in your country") || lower.contains("geo restrict") {
        return ErrorCode::GeoRestricted;
    }

    if lower.contains("unsupported url")
        || lower.contains("no video formats")
        || lower.contains("unable to extract")
    {
        return ErrorCode::ExtractorOutdated;
    }

    if lower.contains("requested format") || lower.contains("format not available") {
        return ErrorCode::FormatUnavailable;
    }

    if lower.contains("network")
        || lower.contains("connection")
        || lower.contains("timed out")
        || lower.contains("unable to download webpage")
    {
        return ErrorCode::Network;
    }

    ErrorCode::ToolFailed
}
