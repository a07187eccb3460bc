use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize};

/// Deserialize a field leniently: wrong types or nulls become `None`.
///
/// yt-dlp emits extractor-specific JSON; a float where we expect an integer
/// must not sink the whole record.
fn deserialize_lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer).unwrap_or(None))
}

/// Cookie source passed to yt-dlp. An explicit cookie file wins over a browser.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Auth {
    #[serde(default)]
    pub cookie_file: Option<PathBuf>,
    /// Browser spec understood by `--cookies-from-browser` (e.g. `firefox`, `chrome:Profile 1`).
    #[serde(default)]
    pub browser_cookies: Option<String>,
}

impl Auth {
    pub fn cookie_file(path: impl Into<PathBuf>) -> Self {
        Self {
            cookie_file: Some(path.into()),
            browser_cookies: None,
        }
    }

    pub fn browser(spec: impl Into<String>) -> Self {
        Self {
            cookie_file: None,
            browser_cookies: Some(spec.into()),
        }
    }
}

/// Proxy settings. Both are optional and independent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxySettings {
    #[serde(default)]
    pub proxy_url: Option<String>,
    /// Proxy used only for geo-verification requests.
    #[serde(default)]
    pub geo_proxy_url: Option<String>,
}

/// A `--download-sections` range such as `*10:15-20:00`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSection {
    pub range: String,
    #[serde(default)]
    pub force_keyframes: bool,
}

/// Everything needed to run one download. Immutable once the operation starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadRequest {
    pub url: String,
    pub destination: PathBuf,

    /// Explicit yt-dlp format id. When absent, `resolution` drives a sort expression.
    #[serde(default)]
    pub format_id: Option<String>,
    #[serde(default)]
    pub audio_only: bool,
    /// The chosen format is progressive (already carries an audio track).
    #[serde(default)]
    pub format_has_audio: bool,
    /// Resolution hint used when no format id is given (e.g. "1080").
    #[serde(default)]
    pub resolution: Option<String>,

    /// Subtitle selections. Entries may carry a label suffix (`"en - Manual"`).
    #[serde(default)]
    pub subtitle_langs: Vec<String>,
    #[serde(default)]
    pub merge_subtitles: bool,

    #[serde(default)]
    pub is_playlist: bool,
    /// `--playlist-items` spec, e.g. `1-3,7`.
    #[serde(default)]
    pub playlist_items: Option<String>,

    /// SponsorBlock categories to remove. Empty disables SponsorBlock.
    #[serde(default)]
    pub sponsorblock_categories: Vec<String>,

    #[serde(default)]
    pub save_description: bool,
    #[serde(default)]
    pub embed_chapters: bool,

    #[serde(default)]
    pub auth: Auth,
    #[serde(default)]
    pub proxy: ProxySettings,
    /// Rate limit as understood by `-r` (e.g. `2M`).
    #[serde(default)]
    pub rate_limit: Option<String>,
    #[serde(default)]
    pub section: Option<TimeSection>,
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            destination: destination.into(),
            format_id: None,
            audio_only: false,
            format_has_audio: false,
            resolution: None,
            subtitle_langs: Vec::new(),
            merge_subtitles: false,
            is_playlist: false,
            playlist_items: None,
            sponsorblock_categories: Vec::new(),
            save_description: false,
            embed_chapters: false,
            auth: Auth::default(),
            proxy: ProxySettings::default(),
            rate_limit: None,
            section: None,
        }
    }

    #[must_use]
    pub fn with_format(mut self, format_id: impl Into<String>, has_audio: bool) -> Self {
        self.format_id = Some(format_id.into());
        self.format_has_audio = has_audio;
        self
    }

    #[must_use]
    pub fn with_audio_only(mut self, audio_only: bool) -> Self {
        self.audio_only = audio_only;
        self
    }

    #[must_use]
    pub fn with_resolution(mut self, resolution: impl Into<String>) -> Self {
        self.resolution = Some(resolution.into());
        self
    }

    #[must_use]
    pub fn with_subtitles(mut self, langs: Vec<String>, merge: bool) -> Self {
        self.subtitle_langs = langs;
        self.merge_subtitles = merge;
        self
    }

    #[must_use]
    pub fn with_playlist(mut self, items: Option<String>) -> Self {
        self.is_playlist = true;
        self.playlist_items = items;
        self
    }

    /// Enable SponsorBlock removal. An empty list falls back to `sponsor`.
    #[must_use]
    pub fn with_sponsorblock(mut self, categories: Vec<String>) -> Self {
        self.sponsorblock_categories = if categories.is_empty() {
            vec!["sponsor".to_string()]
        } else {
            categories
        };
        self
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

    #[must_use]
    pub fn with_rate_limit(mut self, rate_limit: impl Into<String>) -> Self {
        self.rate_limit = Some(rate_limit.into());
        self
    }

    #[must_use]
    pub fn with_section(mut self, range: impl Into<String>, force_keyframes: bool) -> Self {
        self.section = Some(TimeSection {
            range: range.into(),
            force_keyframes,
        });
        self
    }
}

/// Metadata the presentation layer already holds from analysis, used to
/// write the completed-download history record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryMetadata {
    pub title: String,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub duration_seconds: Option<f64>,
    #[serde(default)]
    pub resolution: Option<String>,
}

/// Operation lifecycle. `Paused` is cooperative: the process keeps running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Created,
    Running,
    Paused,
    Completed,
    Cancelled,
    Failed,
}

impl Lifecycle {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Lifecycle::Completed | Lifecycle::Cancelled | Lifecycle::Failed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Lifecycle::Created => "created",
            Lifecycle::Running => "running",
            Lifecycle::Paused => "paused",
            Lifecycle::Completed => "completed",
            Lifecycle::Cancelled => "cancelled",
            Lifecycle::Failed => "failed",
        }
    }
}

const VIDEO_EXTENSIONS: &[&str] = &["mp4", "webm", "mkv", "avi", "mov", "flv"];
const AUDIO_EXTENSIONS: &[&str] = &["mp3", "m4a", "aac", "wav", "ogg", "opus", "flac"];
const SUBTITLE_EXTENSIONS: &[&str] = &["vtt", "srt", "ass", "ssa"];

/// Coarse media classification by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Video,
    Audio,
    Subtitle,
    Other,
}

impl MediaKind {
    pub fn from_file_name(name: &str) -> Self {
        let ext = match Path::new(name).extension() {
            Some(ext) => ext.to_string_lossy().to_ascii_lowercase(),
            None => return MediaKind::Other,
        };
        if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
            MediaKind::Video
        } else if AUDIO_EXTENSIONS.contains(&ext.as_str()) {
            MediaKind::Audio
        } else if SUBTITLE_EXTENSIONS.contains(&ext.as_str()) {
            MediaKind::Subtitle
        } else {
            MediaKind::Other
        }
    }
}

/// One entry of `formats` in yt-dlp's info JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VideoFormat {
    #[serde(default)]
    pub format_id: String,
    #[serde(default, deserialize_with = "deserialize_lenient")]
    pub ext: Option<String>,
    #[serde(default, deserialize_with = "deserialize_lenient")]
    pub resolution: Option<String>,
    #[serde(default, deserialize_with = "deserialize_lenient")]
    pub width: Option<u32>,
    #[serde(default, deserialize_with = "deserialize_lenient")]
    pub height: Option<u32>,
    #[serde(default, deserialize_with = "deserialize_lenient")]
    pub fps: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_lenient")]
    pub vcodec: Option<String>,
    #[serde(default, deserialize_with = "deserialize_lenient")]
    pub acodec: Option<String>,
    #[serde(default, deserialize_with = "deserialize_lenient")]
    pub filesize: Option<u64>,
    #[serde(default, deserialize_with = "deserialize_lenient")]
    pub filesize_approx: Option<u64>,
    #[serde(default, deserialize_with = "deserialize_lenient")]
    pub tbr: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_lenient")]
    pub format_note: Option<String>,
}

impl VideoFormat {
    fn codec_present(codec: &Option<String>) -> bool {
        codec.as_deref().map(|c| c != "none").unwrap_or(false)
    }

    pub fn has_video(&self) -> bool {
        Self::codec_present(&self.vcodec)
    }

    pub fn has_audio(&self) -> bool {
        Self::codec_present(&self.acodec)
    }

    pub fn is_audio_only(&self) -> bool {
        self.has_audio() && !self.has_video()
    }

    pub fn size_hint(&self) -> Option<u64> {
        self.filesize.or(self.filesize_approx)
    }
}

/// A downloadable subtitle rendition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtitleTrack {
    #[serde(default, deserialize_with = "deserialize_lenient")]
    pub ext: Option<String>,
    #[serde(default, deserialize_with = "deserialize_lenient")]
    pub url: Option<String>,
    #[serde(default, deserialize_with = "deserialize_lenient")]
    pub name: Option<String>,
}

pub type SubtitleMap = BTreeMap<String, Vec<SubtitleTrack>>;

/// Single-video record. For a flattened playlist entry most fields are empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VideoMetadata {
    #[serde(default, deserialize_with = "deserialize_lenient")]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "deserialize_lenient")]
    pub title: Option<String>,
    #[serde(default, deserialize_with = "deserialize_lenient")]
    pub uploader: Option<String>,
    #[serde(default, deserialize_with = "deserialize_lenient")]
    pub channel: Option<String>,
    #[serde(default, deserialize_with = "deserialize_lenient")]
    pub duration: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_lenient")]
    pub webpage_url: Option<String>,
    #[serde(default, deserialize_with = "deserialize_lenient")]
    pub url: Option<String>,
    #[serde(default, deserialize_with = "deserialize_lenient")]
    pub thumbnail: Option<String>,
    #[serde(default, deserialize_with = "deserialize_lenient")]
    pub description: Option<String>,
    #[serde(default, deserialize_with = "deserialize_lenient")]
    pub formats: Option<Vec<VideoFormat>>,
    #[serde(default, deserialize_with = "deserialize_lenient")]
    pub subtitles: Option<SubtitleMap>,
    #[serde(default, deserialize_with = "deserialize_lenient")]
    pub automatic_captions: Option<SubtitleMap>,
}

impl VideoMetadata {
    pub fn formats(&self) -> &[VideoFormat] {
        self.formats.as_deref().unwrap_or(&[])
    }

    pub fn channel_name(&self) -> Option<&str> {
        self.channel.as_deref().or(self.uploader.as_deref())
    }
}

/// Playlist-level fields of a flattened playlist record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlaylistMetadata {
    #[serde(default, deserialize_with = "deserialize_lenient")]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "deserialize_lenient")]
    pub title: Option<String>,
    #[serde(default, deserialize_with = "deserialize_lenient")]
    pub uploader: Option<String>,
    #[serde(default, deserialize_with = "deserialize_lenient")]
    pub channel: Option<String>,
    #[serde(default, deserialize_with = "deserialize_lenient")]
    pub thumbnail: Option<String>,
    #[serde(default, deserialize_with = "deserialize_lenient")]
    pub webpage_url: Option<String>,
    #[serde(default, deserialize_with = "deserialize_lenient")]
    pub playlist_count: Option<u64>,
}

/// A flattened playlist entry (no formats).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlaylistEntry {
    #[serde(default, deserialize_with = "deserialize_lenient")]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "deserialize_lenient")]
    pub url: Option<String>,
    #[serde(default, deserialize_with = "deserialize_lenient")]
    pub webpage_url: Option<String>,
    #[serde(default, deserialize_with = "deserialize_lenient")]
    pub title: Option<String>,
    #[serde(default, deserialize_with = "deserialize_lenient")]
    pub duration: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_lenient")]
    pub uploader: Option<String>,
    #[serde(default, deserialize_with = "deserialize_lenient")]
    pub channel: Option<String>,
}

impl PlaylistEntry {
    /// URL to fetch full metadata from. Prefers `url`, as flat-playlist output does.
    pub fn fetch_url(&self) -> Option<&str> {
        self.url
            .as_deref()
            .or(self.webpage_url.as_deref())
            .filter(|u| !u.trim().is_empty())
    }
}

/// Consolidated analysis output, delivered once per run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub is_playlist: bool,
    pub playlist: Option<PlaylistMetadata>,
    pub entries: Vec<PlaylistEntry>,
    pub video: VideoMetadata,
    pub thumbnail_url: Option<String>,
    /// The full fetch of the first playlist entry failed and `video` holds
    /// only the flattened entry data.
    pub used_entry_fallback: bool,
}

impl AnalysisResult {
    pub fn formats(&self) -> &[VideoFormat] {
        self.video.formats()
    }

    pub fn subtitles(&self) -> Option<&SubtitleMap> {
        self.video.subtitles.as_ref()
    }

    pub fn automatic_captions(&self) -> Option<&SubtitleMap> {
        self.video.automatic_captions.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_kind_from_extension() {
        assert_eq!(MediaKind::from_file_name("a.MP4"), MediaKind::Video);
        assert_eq!(MediaKind::from_file_name("a.opus"), MediaKind::Audio);
        assert_eq!(MediaKind::from_file_name("a.en.vtt"), MediaKind::Subtitle);
        assert_eq!(MediaKind::from_file_name("a.part"), MediaKind::Other);
        assert_eq!(MediaKind::from_file_name("noext"), MediaKind::Other);
    }

    #[test]
    fn lenient_fields_tolerate_wrong_types() {
        let v = serde_json::json!({
            "format_id": "137",
            "height": 1080.0,
            "filesize": "unknown",
            "vcodec": "avc1",
            "acodec": "none"
        });
        let f: VideoFormat = serde_json::from_value(v).unwrap();
        assert_eq!(f.format_id, "137");
        assert_eq!(f.filesize, None);
        assert!(f.has_video());
        assert!(!f.has_audio());
    }

    #[test]
    fn audio_only_format() {
        let f = VideoFormat {
            format_id: "251".into(),
            vcodec: Some("none".into()),
            acodec: Some("opus".into()),
            ..Default::default()
        };
        assert!(f.is_audio_only());
    }

    #[test]
    fn sponsorblock_defaults_to_sponsor() {
        let req = DownloadRequest::new("https://x", "/tmp").with_sponsorblock(vec![]);
        assert_eq!(req.sponsorblock_categories, vec!["sponsor".to_string()]);
    }

    #[test]
    fn entry_fetch_url_prefers_url() {
        let e = PlaylistEntry {
            url: Some("https://a".into()),
            webpage_url: Some("https://b".into()),
            ..Default::default()
        };
        assert_eq!(e.fetch_url(), Some("https://a"));

        let blank = PlaylistEntry {
            url: Some("  ".into()),
            ..Default::default()
        };
        assert_eq!(blank.fetch_url(), None);
    }

    #[test]
    fn lifecycle_terminal_states() {
        assert!(Lifecycle::Completed.is_terminal());
        assert!(Lifecycle::Cancelled.is_terminal());
        assert!(Lifecycle::Failed.is_terminal());
        assert!(!Lifecycle::Paused.is_terminal());
    }
}
