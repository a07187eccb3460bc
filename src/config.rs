//! Engine configuration.
//!
//! Everything here is resolved by the host before the engine is built.
//! Durations are (de)serialized as whole milliseconds.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::retry::RetryPolicy;

/// Where to find the external tools and how long to wait on them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Path (or bare program name resolved through PATH) of the yt-dlp executable.
    #[serde(default = "default_yt_dlp_path")]
    pub yt_dlp_path: PathBuf,

    /// Passed to yt-dlp as `--ffmpeg-location` for downloads when set.
    #[serde(default)]
    pub ffmpeg_path: Option<PathBuf>,

    /// Arguments injected before every invocation's own arguments.
    #[serde(default)]
    pub global_args: Vec<String>,

    /// Limit for the main analysis query.
    #[serde(default = "default_analysis_timeout", with = "millis")]
    pub analysis_timeout: Duration,

    /// Limit for fetching the first entry of a playlist.
    #[serde(default = "default_entry_fetch_timeout", with = "millis")]
    pub entry_fetch_timeout: Duration,

    /// How long a terminated process gets before it is force-killed.
    #[serde(default = "default_terminate_grace", with = "millis")]
    pub terminate_grace: Duration,

    /// Pause after a cancelled/failed process exits, before partial cleanup.
    #[serde(default = "default_cancel_settle", with = "millis")]
    pub cancel_settle: Duration,

    /// Pause after a successful merge, before subtitle cleanup.
    #[serde(default = "default_subtitle_settle", with = "millis")]
    pub subtitle_settle: Duration,

    /// Poll interval while a download is paused.
    #[serde(default = "default_pause_poll", with = "millis")]
    pub pause_poll: Duration,

    /// How long a new analysis waits for the previous one to wind down.
    #[serde(default = "default_analysis_replace_wait", with = "millis")]
    pub analysis_replace_wait: Duration,

    /// Retry schedule for deleting leftover files.
    #[serde(default)]
    pub cleanup_retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            yt_dlp_path: default_yt_dlp_path(),
            ffmpeg_path: None,
            global_args: Vec::new(),
            analysis_timeout: default_analysis_timeout(),
            entry_fetch_timeout: default_entry_fetch_timeout(),
            terminate_grace: default_terminate_grace(),
            cancel_settle: default_cancel_settle(),
            subtitle_settle: default_subtitle_settle(),
            pause_poll: default_pause_poll(),
            analysis_replace_wait: default_analysis_replace_wait(),
            cleanup_retry: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn new(yt_dlp_path: impl Into<PathBuf>) -> Self {
        Self {
            yt_dlp_path: yt_dlp_path.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_ffmpeg(mut self, path: impl Into<PathBuf>) -> Self {
        self.ffmpeg_path = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_global_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.global_args = args.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_analysis_timeouts(mut self, main: Duration, entry: Duration) -> Self {
        self.analysis_timeout = main;
        self.entry_fetch_timeout = entry;
        self
    }

    #[must_use]
    pub fn with_terminate_grace(mut self, grace: Duration) -> Self {
        self.terminate_grace = grace;
        self
    }

    /// Settle delays used after process exit: before partial cleanup and
    /// before subtitle cleanup respectively.
    #[must_use]
    pub fn with_settle_delays(mut self, cancel: Duration, subtitle: Duration) -> Self {
        self.cancel_settle = cancel;
        self.subtitle_settle = subtitle;
        self
    }

    #[must_use]
    pub fn with_cleanup_retry(mut self, policy: RetryPolicy) -> Self {
        self.cleanup_retry = policy;
        self
    }
}

fn default_yt_dlp_path() -> PathBuf {
    if cfg!(windows) {
        PathBuf::from("yt-dlp.exe")
    } else {
        PathBuf::from("yt-dlp")
    }
}

fn default_analysis_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_entry_fetch_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_terminate_grace() -> Duration {
    Duration::from_secs(5)
}

fn default_cancel_settle() -> Duration {
    Duration::from_secs(1)
}

fn default_subtitle_settle() -> Duration {
    Duration::from_secs(3)
}

fn default_pause_poll() -> Duration {
    Duration::from_millis(100)
}

fn default_analysis_replace_wait() -> Duration {
    Duration::from_secs(1)
}

pub(crate) mod millis {
    use super::*;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
