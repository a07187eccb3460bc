//! yt-dlp output interpretation.
//!
//! `interpret_line` is a pure function over one line of merged output. The
//! matchers run in a fixed priority order; earlier matchers may short-circuit
//! later ones. The only state carried between lines is the media kind of the
//! last announced destination, held by [`OutputInterpreter`].

use once_cell::sync::Lazy;
use regex::Regex;

use crate::events::{ProgressEvent, Status, TransferDetail};
use crate::models::MediaKind;

static DESTINATION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\[download\] Destination:\s*(.*)").expect("valid regex"));
static SUBTITLE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:Writing|Downloading) (?:video )?subtitles.*?(?:to|:)\s*(.+\.(?:vtt|srt))(?:\s|$)")
        .expect("valid regex")
});
static PERCENT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+\.\d+)%").expect("valid regex"));
static SPEED_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"at\s+(\d+\.\d+[KMG]iB/s)").expect("valid regex"));
static ETA_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"ETA\s+(\d+(?::\d+)+)").expect("valid regex"));
static MERGE_TARGET_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"Merging formats into "(.+)""#).expect("valid regex"));
static ALREADY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(.*?) has already been downloaded").expect("valid regex"));
static SIZE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([\d.]+)\s*(Ki?B|Mi?B|Gi?B|B)").expect("valid regex"));

/// Progress checkpoints for post-processing phases, which report no percentage.
pub const MERGE_PERCENT: f64 = 95.0;
pub const SPONSORBLOCK_PERCENT: f64 = 97.0;
pub const DELETE_ORIGINAL_PERCENT: f64 = 98.0;

/// Filesystem facts learned from a line, for the artifact tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    /// Media file yt-dlp is about to write (as printed, possibly relative).
    Destination(String),
    /// Subtitle file written while merging is enabled.
    Subtitle(String),
    /// Final merged output.
    Merged(String),
    /// Previously downloaded file yt-dlp is reusing.
    Existing(String),
}

/// Per-line inputs that are not part of the line itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LineContext {
    /// Kind of the file from the most recent destination announcement.
    pub last_kind: Option<MediaKind>,
    pub merge_subtitles: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Interpretation {
    pub events: Vec<ProgressEvent>,
    pub observation: Option<Observation>,
}

impl Interpretation {
    fn push(&mut self, ev: ProgressEvent) {
        self.events.push(ev);
    }

    fn status(&mut self, s: Status) {
        self.events.push(ProgressEvent::Status(s));
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.observation.is_none()
    }
}

/// Classify one line of output. Unmatched lines yield an empty interpretation.
pub fn interpret_line(raw: &str, ctx: &LineContext) -> Interpretation {
    let line = raw.trim();
    let mut out = Interpretation::default();
    if line.is_empty() {
        return out;
    }

    // (a) destination: must win over every generic matcher below
    if let Some(caps) = DESTINATION_RE.captures(line) {
        let path = caps.get(1).map(|m| m.as_str().trim()).unwrap_or("");
        let name = file_name_of(path);
        let status = if line.contains(" - audio only") || line.contains("Downloading audio") {
            Status::DownloadingAudio
        } else {
            Status::downloading(MediaKind::from_file_name(name))
        };
        out.status(status);
        if !name.is_empty() {
            out.push(ProgressEvent::FileDestination(name.to_string()));
            out.observation = Some(Observation::Destination(path.to_string()));
        }
        return out;
    }

    // (b) explicit stream phrases
    if line.contains("Downloading video") {
        out.status(Status::DownloadingVideo);
        return out;
    }
    if line.contains("Downloading audio") {
        out.status(Status::DownloadingAudio);
        return out;
    }

    // (c) subtitle writes
    if let Some(caps) = SUBTITLE_RE.captures(line) {
        let path = normalize_subtitle_path(caps.get(1).map(|m| m.as_str()).unwrap_or(""), cfg!(windows));
        out.status(Status::DownloadingSubtitle);
        if ctx.merge_subtitles && !path.is_empty() {
            out.observation = Some(Observation::Subtitle(path));
        }
        return out;
    }

    // (d) phase markers
    if line.contains("Downloading webpage") || line.contains("Extracting URL") {
        out.status(Status::FetchingInfo);
        out.push(ProgressEvent::Percent(0.0));
    } else if line.contains("Downloading API JSON") {
        out.status(Status::ProcessingPlaylist);
        out.push(ProgressEvent::Percent(0.0));
    } else if line.contains("Downloading m3u8 information") {
        out.status(Status::PreparingStreams);
        out.push(ProgressEvent::Percent(0.0));
    } else if line.contains("Downloading format") {
        if line.contains(" - audio only") {
            out.status(Status::DownloadingAudio);
        } else if line.contains(" - video only") {
            out.status(Status::DownloadingVideo);
        }
    }

    // (e) any float percentage, wherever it appears
    if let Some(p) = PERCENT_RE
        .captures(line)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
    {
        out.push(ProgressEvent::Percent(p.clamp(0.0, 100.0)));
    }

    // (f) speed / ETA
    if line.contains("[download]") && line.contains('%') {
        out.push(ProgressEvent::Detail(parse_detail(line)));
    }

    // (g)-(i) post-processing and terminal-ish markers
    if line.contains("[Merger]") || line.contains("Merging formats") {
        out.status(Status::MergingFormats);
        out.push(ProgressEvent::Percent(MERGE_PERCENT));
        if let Some(target) = MERGE_TARGET_RE.captures(line).and_then(|c| c.get(1)) {
            out.observation = Some(Observation::Merged(target.as_str().to_string()));
        }
    } else if line.contains("SponsorBlock") {
        out.status(Status::RemovingSponsorSegments);
        out.push(ProgressEvent::Percent(SPONSORBLOCK_PERCENT));
    } else if line.contains("Deleting original file") {
        out.status(Status::DeletingOriginal);
        out.push(ProgressEvent::Percent(DELETE_ORIGINAL_PERCENT));
    } else if line.contains("has already been downloaded") {
        let path = ALREADY_RE
            .captures(line)
            .and_then(|c| c.get(1))
            .map(|m| strip_tag(m.as_str()))
            .unwrap_or("");
        let name = file_name_of(path);
        if name.is_empty() {
            out.status(Status::FileExists);
        } else {
            out.status(Status::exists(MediaKind::from_file_name(name)));
            out.push(ProgressEvent::FileExists(name.to_string()));
            out.observation = Some(Observation::Existing(path.to_string()));
        }
    } else if line.contains("Finished downloading") {
        out.push(ProgressEvent::Percent(100.0));
        out.status(Status::completed(ctx.last_kind));
        out.push(ProgressEvent::Detail(TransferDetail::cleared()));
    }

    out
}

/// Stateful wrapper remembering the last destination's media kind.
#[derive(Debug, Clone, Default)]
pub struct OutputInterpreter {
    ctx: LineContext,
}

impl OutputInterpreter {
    pub fn new(merge_subtitles: bool) -> Self {
        Self {
            ctx: LineContext {
                last_kind: None,
                merge_subtitles,
            },
        }
    }

    pub fn feed(&mut self, line: &str) -> Interpretation {
        let out = interpret_line(line, &self.ctx);
        if let Some(Observation::Destination(path)) = &out.observation {
            self.ctx.last_kind = Some(MediaKind::from_file_name(file_name_of(path)));
        }
        out
    }

    pub fn last_kind(&self) -> Option<MediaKind> {
        self.ctx.last_kind
    }
}

/// Last path component, accepting both separators regardless of host OS.
pub fn file_name_of(path: &str) -> &str {
    let path = path.trim().trim_matches('"');
    path.rsplit(|c| c == '/' || c == '\\').next().unwrap_or(path)
}

/// Clean up a subtitle path as printed by yt-dlp.
///
/// The regex can leave a leading `:` (from `to: file`). On Windows yt-dlp
/// sometimes prints `C:\dir: C:\dir\file.vtt`; the real path is the last segment.
pub fn normalize_subtitle_path(raw: &str, windows_paths: bool) -> String {
    let mut path = raw.trim();
    if let Some(rest) = path.strip_prefix(':') {
        path = rest.trim_start();
    }
    if windows_paths && path.contains(": ") {
        if let Some(last) = path.rsplit(": ").next() {
            path = last.trim();
        }
    }
    path.to_string()
}

fn strip_tag(s: &str) -> &str {
    let s = s.trim();
    s.strip_prefix("[download]").map(str::trim_start).unwrap_or(s)
}

fn parse_detail(line: &str) -> TransferDetail {
    let speed = SPEED_RE
        .captures(line)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| "N/A".to_string());
    let eta = ETA_RE
        .captures(line)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| "N/A".to_string());
    TransferDetail {
        speed_bps: parse_speed(&speed),
        eta_seconds: parse_eta(&eta),
        speed,
        eta,
    }
}

/// "1.5MiB/s" -> bytes per second.
pub fn parse_speed(s: &str) -> Option<u64> {
    parse_bytes(s.trim().trim_end_matches("/s"))
}

/// "1.5GiB" -> bytes.
pub fn parse_bytes(s: &str) -> Option<u64> {
    let s = s.trim();
    if s == "N/A" || s.is_empty() {
        return None;
    }

    let caps = SIZE_RE.captures(s)?;
    let num: f64 = caps.get(1)?.as_str().parse().ok()?;
    let multiplier: f64 = match caps.get(2)?.as_str() {
        "KB" | "KiB" => 1024.0,
        "MB" | "MiB" => 1024.0 * 1024.0,
        "GB" | "GiB" => 1024.0 * 1024.0 * 1024.0,
        _ => 1.0,
    };

    Some((num * multiplier) as u64)
}

/// "00:05:30", "05:30" or "30" -> seconds.
pub fn parse_eta(s: &str) -> Option<u64> {
    let s = s.trim();
    if s == "N/A" || s.is_empty() {
        return None;
    }

    let mut total: u64 = 0;
    let mut parts = 0;
    for part in s.split(':') {
        parts += 1;
        if parts > 3 {
            return None;
        }
        total = total * 60 + part.parse::<u64>().ok()?;
    }
    Some(total)
}
