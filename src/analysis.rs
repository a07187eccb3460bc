//! Metadata analysis: one flattened query, plus a full fetch of the first
//! playlist entry when the URL is a playlist.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::command::{build_analysis_command, build_entry_command};
use crate::config::EngineConfig;
use crate::control::ControlSignal;
use crate::error::EngineError;
use crate::events::{AnalysisEvent, EventSink, Status};
use crate::models::{AnalysisResult, Auth, PlaylistEntry, PlaylistMetadata, ProxySettings, VideoMetadata};
use crate::process::ProcessSupervisor;
use crate::url_utils::normalize_analysis_url;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub url: String,
    #[serde(default)]
    pub auth: Auth,
    #[serde(default)]
    pub proxy: ProxySettings,
}

impl AnalysisRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            auth: Auth::default(),
            proxy: ProxySettings::default(),
        }
    }

    #[must_use]
    pub fn with_auth(mut self, auth: Auth) -> Self {
        self.auth = auth;
        self
    }

    #[must_use]
    pub fn with_proxy(mut self, proxy: ProxySettings) -> Self {
        self.proxy = proxy;
        self
    }
}

#[derive(Debug, Clone)]
pub struct AnalysisOrchestrator {
    supervisor: ProcessSupervisor,
    analysis_timeout: Duration,
    entry_fetch_timeout: Duration,
    terminate_grace: Duration,
}

impl AnalysisOrchestrator {
    pub fn new(cfg: &EngineConfig) -> Self {
        Self {
            supervisor: ProcessSupervisor::from_config(cfg),
            analysis_timeout: cfg.analysis_timeout,
            entry_fetch_timeout: cfg.entry_fetch_timeout,
            terminate_grace: cfg.terminate_grace,
        }
    }

    /// Analyze `req.url`. Status events go to `sink`; the terminal event is
    /// the caller's to send, built from the returned value.
    pub async fn run(
        &self,
        req: &AnalysisRequest,
        control: &mut ControlSignal,
        sink: &EventSink,
    ) -> Result<AnalysisResult, EngineError> {
        let url = normalize_analysis_url(&req.url)?;
        if url != req.url.trim() {
            log::info!("Analyzing {} (normalized from {})", url, req.url);
        }

        sink.analysis(AnalysisEvent::Status(Status::AnalyzingExtracting))
            .await;
        let args = build_analysis_command(&url, &req.auth, &req.proxy);
        let stdout = self
            .supervisor
            .run_collect(&args, self.analysis_timeout, self.terminate_grace, control)
            .await?
            .into_stdout()?;
        ensure_running(control)?;

        let doc = parse_first_document(&stdout)?;

        if !is_playlist_record(&doc) {
            sink.analysis(AnalysisEvent::Status(Status::AnalyzingProcessing))
                .await;
            let video = full_video(doc)?;
            return Ok(assemble(None, video, false));
        }

        let (playlist, entries) = playlist_parts(&doc)?;
        let first = entries.first().ok_or(EngineError::PlaylistEmpty)?.clone();
        log::info!(
            "Playlist {:?} with {} entries",
            playlist.title.as_deref().unwrap_or("<untitled>"),
            entries.len()
        );

        sink.analysis(AnalysisEvent::Status(Status::AnalyzingFirstVideo))
            .await;
        let (video, used_fallback) = match self.fetch_entry(&first, req, control).await {
            Ok(v) => (v, false),
            Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
            Err(e) => {
                log::warn!("Full fetch of first playlist entry failed, using flat entry: {}", e);
                (video_from_entry(&first), true)
            }
        };
        ensure_running(control)?;

        sink.analysis(AnalysisEvent::Status(Status::AnalyzingProcessing))
            .await;
        Ok(assemble(Some((playlist, entries)), video, used_fallback))
    }

    async fn fetch_entry(
        &self,
        entry: &PlaylistEntry,
        req: &AnalysisRequest,
        control: &mut ControlSignal,
    ) -> Result<VideoMetadata, EngineError> {
        let url = entry
            .fetch_url()
            .ok_or_else(|| EngineError::InvalidUrl(entry.id.clone().unwrap_or_default()))?;
        let args = build_entry_command(url, &req.auth, &req.proxy);
        let stdout = self
            .supervisor
            .run_collect(&args, self.entry_fetch_timeout, self.terminate_grace, control)
            .await?
            .into_stdout()?;
        full_video(parse_first_document(&stdout)?)
    }
}

fn ensure_running(control: &ControlSignal) -> Result<(), EngineError> {
    if control.is_cancelled() {
        Err(EngineError::Cancelled)
    } else {
        Ok(())
    }
}

/// First non-blank line of stdout, parsed as JSON.
pub fn parse_first_document(stdout: &str) -> Result<Value, EngineError> {
    let line = stdout
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .ok_or(EngineError::EmptyOutput)?;
    Ok(serde_json::from_str(line)?)
}

pub fn is_playlist_record(doc: &Value) -> bool {
    doc.get("_type").and_then(Value::as_str) == Some("playlist")
}

/// Playlist-level metadata and its flattened entries. Null entries
/// (unavailable videos) are skipped.
pub fn playlist_parts(doc: &Value) -> Result<(PlaylistMetadata, Vec<PlaylistEntry>), EngineError> {
    let playlist: PlaylistMetadata = serde_json::from_value(doc.clone())?;
    let entries = doc
        .get("entries")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter(|v| v.is_object())
                .filter_map(|v| serde_json::from_value::<PlaylistEntry>(v.clone()).ok())
                .collect()
        })
        .unwrap_or_default();
    Ok((playlist, entries))
}

/// A complete single-video record. It must carry a format list.
pub fn full_video(doc: Value) -> Result<VideoMetadata, EngineError> {
    let video: VideoMetadata = serde_json::from_value(doc)?;
    if video.formats.is_none() {
        return Err(EngineError::MissingFormats);
    }
    Ok(video)
}

/// Minimal record from a flattened entry, used when the full fetch fails.
pub fn video_from_entry(entry: &PlaylistEntry) -> VideoMetadata {
    VideoMetadata {
        id: entry.id.clone(),
        title: entry.title.clone(),
        uploader: entry.uploader.clone(),
        channel: entry.channel.clone(),
        duration: entry.duration,
        webpage_url: entry.webpage_url.clone(),
        url: entry.url.clone(),
        ..VideoMetadata::default()
    }
}

/// Build the single consolidated result. Playlist thumbnail wins over the video's.
pub fn assemble(
    playlist: Option<(PlaylistMetadata, Vec<PlaylistEntry>)>,
    video: VideoMetadata,
    used_entry_fallback: bool,
) -> AnalysisResult {
    let (playlist, entries) = match playlist {
        Some((p, e)) => (Some(p), e),
        None => (None, Vec::new()),
    };
    let thumbnail_url = playlist
        .as_ref()
        .and_then(|p| p.thumbnail.clone())
        .or_else(|| video.thumbnail.clone());

    AnalysisResult {
        is_playlist: playlist.is_some(),
        playlist,
        entries,
        video,
        thumbnail_url,
        used_entry_fallback,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_output_is_distinct() {
        assert!(matches!(parse_first_document("\n  \n"), Err(EngineError::EmptyOutput)));
        assert!(matches!(parse_first_document("{not json"), Err(EngineError::InvalidJson(_))));
    }

    #[test]
    fn single_video_requires_formats() {
        let ok = full_video(json!({"id": "a", "title": "A", "formats": []}));
        assert!(ok.is_ok());
        let missing = full_video(json!({"id": "a", "title": "A"}));
        assert!(matches!(missing, Err(EngineError::MissingFormats)));
    }

    #[test]
    fn playlist_entries_skip_nulls() {
        let doc = json!({
            "_type": "playlist",
            "title": "List",
            "thumbnail": "https://t/pl.jpg",
            "entries": [null, {"id": "a", "url": "https://v/a", "title": "A"}, {"id": "b"}]
        });
        assert!(is_playlist_record(&doc));
        let (pl, entries) = playlist_parts(&doc).unwrap();
        assert_eq!(pl.title.as_deref(), Some("List"));
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].fetch_url(), Some("https://v/a"));
    }

    #[test]
    fn assemble_prefers_playlist_thumbnail() {
        let video = VideoMetadata {
            thumbnail: Some("https://t/v.jpg".into()),
            ..Default::default()
        };
        let single = assemble(None, video.clone(), false);
        assert!(!single.is_playlist);
        assert_eq!(single.thumbnail_url.as_deref(), Some("https://t/v.jpg"));

        let pl = PlaylistMetadata {
            thumbnail: Some("https://t/pl.jpg".into()),
            ..Default::default()
        };
        let list = assemble(Some((pl, vec![PlaylistEntry::default()])), video, true);
        assert!(list.is_playlist);
        assert!(list.used_entry_fallback);
        assert_eq!(list.thumbnail_url.as_deref(), Some("https://t/pl.jpg"));
    }

    #[test]
    fn entry_fallback_keeps_flat_fields() {
        let entry = PlaylistEntry {
            id: Some("a".into()),
            title: Some("First".into()),
            duration: Some(61.0),
            ..Default::default()
        };
        let v = video_from_entry(&entry);
        assert_eq!(v.title.as_deref(), Some("First"));
        assert!(v.formats().is_empty());
    }

    #[cfg(unix)]
    mod process {
        use super::*;
        use crate::control::control_channel;
        use tokio::sync::mpsc;
        use uuid::Uuid;

        fn orchestrator(script: &str) -> AnalysisOrchestrator {
            let cfg = EngineConfig::new("/bin/sh").with_global_args(["-c", script, "yt-dlp"]);
            AnalysisOrchestrator::new(&cfg)
        }

        #[tokio::test]
        async fn playlist_entry_failure_falls_back() {
            let script = r#"case "$*" in
  *--flat-playlist*) echo '{"_type":"playlist","title":"L","entries":[{"id":"a","url":"https://v/a","title":"First"}]}' ;;
  *) echo 'ERROR: unavailable' >&2; exit 1 ;;
esac"#;
            let (tx, mut rx) = mpsc::channel(16);
            let sink = EventSink::new(Uuid::new_v4(), tx);
            let (_h, mut sig) = control_channel();
            let res = orchestrator(script)
                .run(&AnalysisRequest::new("https://x/playlist?list=L"), &mut sig, &sink)
                .await
                .unwrap();
            assert!(res.is_playlist);
            assert!(res.used_entry_fallback);
            assert_eq!(res.video.title.as_deref(), Some("First"));
            drop(sink);

            let mut statuses = Vec::new();
            while let Some(ev) = rx.recv().await {
                statuses.push(ev);
            }
            assert_eq!(statuses.len(), 3);
        }

        #[tokio::test]
        async fn empty_playlist_fails() {
            let script = r#"echo '{"_type":"playlist","title":"L","entries":[]}'"#;
            let (tx, _rx) = mpsc::channel(16);
            let sink = EventSink::new(Uuid::new_v4(), tx);
            let (_h, mut sig) = control_channel();
            let res = orchestrator(script)
                .run(&AnalysisRequest::new("https://x/p"), &mut sig, &sink)
                .await;
            assert!(matches!(res, Err(EngineError::PlaylistEmpty)));
        }
    }
}
