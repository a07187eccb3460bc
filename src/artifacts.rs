//! Filesystem artifacts of one download: what yt-dlp announced, and the
//! cleanup of leftovers after cancellation, failure, or a subtitle merge.
//!
//! Cleanup is best-effort. Deletions are retried, failures are logged and
//! reported, never returned as errors.

use std::collections::{BTreeSet, HashSet};
use std::io;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::output::Observation;
use crate::retry::{retry_async, RetryPolicy};

/// Per-format intermediate output, e.g. `Movie.f137.mp4`.
static FORMAT_PART_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\.f\d+\.").expect("valid regex"));

const PARTIAL_SUFFIX: &str = ".part";
const SUBTITLE_SUFFIXES: &[&str] = &["vtt", "srt"];

pub fn is_partial_file(name: &str) -> bool {
    name.ends_with(PARTIAL_SUFFIX) || FORMAT_PART_RE.is_match(name)
}

pub fn is_subtitle_file(path: &Path) -> bool {
    path.extension()
        .map(|e| {
            let e = e.to_string_lossy().to_ascii_lowercase();
            SUBTITLE_SUFFIXES.contains(&e.as_str())
        })
        .unwrap_or(false)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub removed: Vec<PathBuf>,
    pub failed: Vec<PathBuf>,
}

impl CleanupReport {
    fn merge(&mut self, other: CleanupReport) {
        self.removed.extend(other.removed);
        self.failed.extend(other.failed);
    }
}

#[derive(Debug, Clone)]
pub struct ArtifactTracker {
    destination: PathBuf,
    media: Vec<PathBuf>,
    subtitles: Vec<PathBuf>,
    initial_subtitles: HashSet<PathBuf>,
    merged: Option<PathBuf>,
    existing: Option<PathBuf>,
    policy: RetryPolicy,
}

impl ArtifactTracker {
    pub fn new(destination: impl Into<PathBuf>, policy: RetryPolicy) -> Self {
        Self {
            destination: destination.into(),
            media: Vec::new(),
            subtitles: Vec::new(),
            initial_subtitles: HashSet::new(),
            merged: None,
            existing: None,
            policy,
        }
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    /// Relative paths are taken relative to the destination directory.
    pub fn resolve(&self, raw: &str) -> PathBuf {
        let p = Path::new(raw.trim().trim_matches('"'));
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.destination.join(p)
        }
    }

    pub fn observe(&mut self, obs: &Observation) {
        match obs {
            Observation::Destination(p) => {
                let path = self.resolve(p);
                log::debug!("Tracking media file {}", path.display());
                self.media.push(path);
            }
            Observation::Subtitle(p) => {
                let path = self.resolve(p);
                log::debug!("Tracking subtitle file for later cleanup: {}", path.display());
                self.subtitles.push(path);
            }
            Observation::Merged(p) => self.merged = Some(self.resolve(p)),
            Observation::Existing(p) => self.existing = Some(self.resolve(p)),
        }
    }

    pub fn media(&self) -> &[PathBuf] {
        &self.media
    }

    pub fn subtitles(&self) -> &[PathBuf] {
        &self.subtitles
    }

    /// Best guess at the finished file: merge target, then a reused
    /// existing file, then the last announced destination.
    pub fn final_media(&self) -> Option<&Path> {
        self.merged
            .as_deref()
            .or(self.existing.as_deref())
            .or_else(|| self.media.last().map(PathBuf::as_path))
    }

    /// Record subtitle files present before the download starts, so cleanup
    /// only removes files this operation created.
    pub async fn snapshot_subtitles(&mut self) {
        let found = scan_subtitles(self.destination.clone()).await;
        log::debug!("Found {} existing subtitle files before download", found.len());
        self.initial_subtitles = found.into_iter().collect();
    }

    /// Delete partial and per-format intermediate files from the destination
    /// and from every directory a tracked media file lives in.
    pub async fn cleanup_partials(&self) -> CleanupReport {
        let mut dirs: BTreeSet<PathBuf> = BTreeSet::new();
        dirs.insert(self.destination.clone());
        for m in &self.media {
            if let Some(parent) = m.parent() {
                dirs.insert(parent.to_path_buf());
            }
        }

        let mut candidates: BTreeSet<PathBuf> = BTreeSet::new();
        for dir in &dirs {
            match list_files(dir).await {
                Ok(files) => candidates.extend(files.into_iter().filter(|p| {
                    p.file_name()
                        .map(|n| is_partial_file(&n.to_string_lossy()))
                        .unwrap_or(false)
                })),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => log::error!("Error cleaning partial files in {}: {}", dir.display(), e),
            }
        }

        self.delete_all(candidates).await
    }

    /// Remove tracked subtitle files and any subtitle file that appeared
    /// under the destination since [`snapshot_subtitles`](Self::snapshot_subtitles).
    pub async fn cleanup_subtitles(&self) -> CleanupReport {
        let mut report = CleanupReport::default();

        let tracked: BTreeSet<PathBuf> = self.subtitles.iter().cloned().collect();
        let tracked_report = self.delete_all(tracked.clone()).await;
        log::debug!(
            "Deleted {} of {} tracked subtitle files",
            tracked_report.removed.len(),
            tracked.len()
        );
        report.merge(tracked_report);

        let fresh: BTreeSet<PathBuf> = scan_subtitles(self.destination.clone())
            .await
            .into_iter()
            .filter(|p| !self.initial_subtitles.contains(p) && !tracked.contains(p))
            .collect();
        let count = fresh.len();
        let fresh_report = self.delete_all(fresh).await;
        log::debug!(
            "Deleted {} of {} new subtitle files",
            fresh_report.removed.len(),
            count
        );
        report.merge(fresh_report);

        report
    }

    /// Forget everything observed; the retry policy and destination stay.
    pub fn clear(&mut self) {
        self.media.clear();
        self.subtitles.clear();
        self.initial_subtitles.clear();
        self.merged = None;
        self.existing = None;
    }

    async fn delete_all(&self, paths: BTreeSet<PathBuf>) -> CleanupReport {
        let mut report = CleanupReport::default();
        for path in paths {
            match delete_with_retry(&path, &self.policy).await {
                Ok(true) => {
                    log::info!("Successfully deleted {}", path.display());
                    report.removed.push(path);
                }
                Ok(false) => {}
                Err(e) => {
                    log::error!(
                        "Failed to delete {} after {} attempts: {}",
                        path.display(),
                        self.policy.max_attempts.max(1),
                        e
                    );
                    report.failed.push(path);
                }
            }
        }
        report
    }
}

/// `Ok(false)` when the file was already gone.
async fn delete_with_retry(path: &Path, policy: &RetryPolicy) -> io::Result<bool> {
    retry_async(
        policy,
        move || async move {
            match tokio::fs::remove_file(path).await {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
                Err(e) => Err(e),
            }
        },
        |e: &io::Error| {
            log::warn!("{} is locked, retrying: {}", path.display(), e);
            true
        },
    )
    .await
}

async fn list_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut rd = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = rd.next_entry().await? {
        if entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
            out.push(entry.path());
        }
    }
    Ok(out)
}

/// Recursive subtitle scan, off the async runtime.
async fn scan_subtitles(root: PathBuf) -> Vec<PathBuf> {
    let res = tokio::task::spawn_blocking(move || {
        let mut found = Vec::new();
        walk(&root, &mut found);
        found
    })
    .await;
    match res {
        Ok(found) => found,
        Err(e) => {
            log::error!("Error scanning for subtitle files: {}", e);
            Vec::new()
        }
    }
}

fn walk(dir: &Path, found: &mut Vec<PathBuf>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        match entry.file_type() {
            Ok(t) if t.is_dir() => walk(&path, found),
            Ok(t) if t.is_file() && is_subtitle_file(&path) => found.push(path),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn touch(p: &Path) {
        if let Some(parent) = p.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(p, b"x").unwrap();
    }

    #[test]
    fn partial_patterns() {
        assert!(is_partial_file("Movie_1080p.f137.mp4"));
        assert!(is_partial_file("Movie_1080p.mp4.part"));
        assert!(is_partial_file("Movie.f251.webm.part"));
        assert!(!is_partial_file("Movie_1080p.mp4"));
        assert!(!is_partial_file("final.fmp4"));
    }

    #[test]
    fn relative_paths_resolve_against_destination() {
        let t = ArtifactTracker::new("/dl", RetryPolicy::default());
        assert_eq!(t.resolve("a.en.vtt"), PathBuf::from("/dl/a.en.vtt"));
        assert_eq!(t.resolve("/x/a.mp4"), PathBuf::from("/x/a.mp4"));
    }

    #[test]
    fn final_media_prefers_merge_target() {
        let mut t = ArtifactTracker::new("/dl", RetryPolicy::default());
        t.observe(&Observation::Destination("/dl/a.f137.mp4".into()));
        t.observe(&Observation::Destination("/dl/a.f251.webm".into()));
        assert_eq!(t.final_media(), Some(Path::new("/dl/a.f251.webm")));
        t.observe(&Observation::Merged("/dl/a.mkv".into()));
        assert_eq!(t.final_media(), Some(Path::new("/dl/a.mkv")));
    }

    #[test]
    fn clear_forgets_observed_paths() {
        let mut t = ArtifactTracker::new("/dl", RetryPolicy::default());
        t.observe(&Observation::Destination("/dl/a.f137.mp4".into()));
        t.observe(&Observation::Subtitle("a.en.vtt".into()));
        t.observe(&Observation::Merged("/dl/a.mkv".into()));
        t.clear();
        assert!(t.media().is_empty());
        assert!(t.subtitles().is_empty());
        assert_eq!(t.final_media(), None);
        assert_eq!(t.destination(), Path::new("/dl"));
    }

    #[tokio::test]
    async fn cleanup_removes_partials_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let part = root.join("Movie_1080p.f137.mp4.part");
        let fmt = root.join("Movie_1080p.f251.webm");
        let keep = root.join("Other.mp4");
        let nested = root.join("My List").join("Ep1_720p.f22.mp4");
        for p in [&part, &fmt, &keep, &nested] {
            touch(p);
        }

        let mut t = ArtifactTracker::new(root, RetryPolicy::default());
        t.observe(&Observation::Destination(nested.to_string_lossy().into_owned()));

        let report = t.cleanup_partials().await;
        assert_eq!(report.removed.len(), 3);
        assert!(report.failed.is_empty());
        assert!(!part.exists() && !fmt.exists() && !nested.exists());
        assert!(keep.exists());

        let again = t.cleanup_partials().await;
        assert_eq!(again, CleanupReport::default());
    }

    #[tokio::test]
    async fn cleanup_on_missing_destination_is_quiet() {
        let t = ArtifactTracker::new("/definitely/not/here", RetryPolicy::default());
        assert_eq!(t.cleanup_partials().await, CleanupReport::default());
        assert_eq!(t.cleanup_subtitles().await, CleanupReport::default());
    }

    #[tokio::test]
    async fn subtitle_cleanup_spares_preexisting_files() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let old = root.join("old.en.vtt");
        touch(&old);

        let mut t = ArtifactTracker::new(root, RetryPolicy::default());
        t.snapshot_subtitles().await;

        let tracked = root.join("Movie.en.vtt");
        let untracked = root.join("sub").join("Movie.de.srt");
        touch(&tracked);
        touch(&untracked);
        t.observe(&Observation::Subtitle("Movie.en.vtt".into()));

        let report = t.cleanup_subtitles().await;
        assert_eq!(report.removed.len(), 2);
        assert!(old.exists());
        assert!(!tracked.exists() && !untracked.exists());

        // second run: nothing left, nothing raised
        assert!(t.cleanup_subtitles().await.removed.is_empty());
    }
}
