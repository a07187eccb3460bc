//! yt-dlp argument assembly.
//!
//! Pure functions: no validation beyond presence. yt-dlp rejects malformed
//! values itself and we surface its message.

use std::path::Path;

use crate::models::{Auth, DownloadRequest, ProxySettings};

/// Default resolution hint when neither a format id nor a resolution is given.
pub const DEFAULT_RESOLUTION: &str = "720";

/// Argument vector for one yt-dlp invocation, without the program itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub args: Vec<String>,
    /// The `-o` template, kept separately for logging and tests.
    pub output_template: String,
}

/// Build the download invocation for `req`.
///
/// `ffmpeg_path` comes from the engine config, not the request.
pub fn build_download_command(req: &DownloadRequest, ffmpeg_path: Option<&Path>) -> ToolCommand {
    let mut args: Vec<String> = Vec::with_capacity(32);

    let (flag, selector) = format_selector(req);
    args.push(flag.to_string());
    args.push(selector);

    let output_template = output_template(&req.destination, req.is_playlist);
    args.push("-o".to_string());
    args.push(output_template.clone());

    // One progress update per line; we never read carriage-return redraws.
    args.push("--newline".to_string());
    args.push("--force-overwrites".to_string());

    if req.is_playlist {
        if let Some(items) = req.playlist_items.as_deref().filter(|s| !s.trim().is_empty()) {
            args.push("--playlist-items".to_string());
            args.push(items.to_string());
        }
    }

    let langs = subtitle_lang_codes(&req.subtitle_langs);
    if !req.subtitle_langs.is_empty() {
        args.push("--write-subs".to_string());
        if !langs.is_empty() {
            args.push("--sub-langs".to_string());
            args.push(langs.join(","));
            args.push("--write-auto-subs".to_string());
            if req.merge_subtitles {
                args.push("--embed-subs".to_string());
            }
        }
    }

    if !req.sponsorblock_categories.is_empty() {
        args.push("--sponsorblock-remove".to_string());
        args.push(req.sponsorblock_categories.join(","));
    }

    if req.save_description {
        args.push("--write-description".to_string());
    }
    if req.embed_chapters {
        args.push("--embed-chapters".to_string());
    }

    push_auth_args(&mut args, &req.auth);
    push_proxy_args(&mut args, &req.proxy);

    if let Some(rate) = non_empty(&req.rate_limit) {
        args.push("-r".to_string());
        args.push(rate.to_string());
    }

    if let Some(section) = req.section.as_ref().filter(|s| !s.range.trim().is_empty()) {
        args.push("--download-sections".to_string());
        args.push(section.range.clone());
        if section.force_keyframes {
            args.push("--force-keyframes-at-cuts".to_string());
        }
    }

    if let Some(ffmpeg) = ffmpeg_path {
        args.push("--ffmpeg-location".to_string());
        args.push(ffmpeg.to_string_lossy().to_string());
    }

    // URL last
    args.push(req.url.clone());

    ToolCommand {
        args,
        output_template,
    }
}

/// Main analysis query: one JSON document, playlists flattened.
pub fn build_analysis_command(url: &str, auth: &Auth, proxy: &ProxySettings) -> Vec<String> {
    let mut args = vec![
        "--dump-single-json".to_string(),
        "--flat-playlist".to_string(),
        "--no-warnings".to_string(),
    ];
    push_auth_args(&mut args, auth);
    push_proxy_args(&mut args, proxy);
    args.push(url.to_string());
    args
}

/// Full-metadata query for a single playlist entry.
pub fn build_entry_command(url: &str, auth: &Auth, proxy: &ProxySettings) -> Vec<String> {
    let mut args = vec!["--dump-single-json".to_string(), "--no-warnings".to_string()];
    push_auth_args(&mut args, auth);
    push_proxy_args(&mut args, proxy);
    args.push(url.to_string());
    args
}

/// `-f <id>` / `-f <id>+bestaudio/best` / `-S res:<hint>`.
fn format_selector(req: &DownloadRequest) -> (&'static str, String) {
    match non_empty(&req.format_id) {
        Some(id) => {
            let id = clean_format_id(id);
            if req.audio_only || req.format_has_audio {
                ("-f", id.to_string())
            } else {
                ("-f", format!("{id}+bestaudio/best"))
            }
        }
        None => {
            let res = non_empty(&req.resolution).unwrap_or(DEFAULT_RESOLUTION);
            ("-S", format!("res:{res}"))
        }
    }
}

/// Dynamic-range-compressed variants (`251-drc`) are selected by base id.
fn clean_format_id(id: &str) -> &str {
    match id.find("-drc") {
        Some(idx) => &id[..idx],
        None => id,
    }
}

fn output_template(destination: &Path, is_playlist: bool) -> String {
    let base = destination.to_string_lossy();
    let base = if cfg!(windows) {
        base.replace('\\', "/")
    } else {
        base.into_owned()
    };
    let base = base.trim_end_matches('/');

    if is_playlist {
        format!("{base}/%(playlist_title)s/%(title)s_%(resolution)s.%(ext)s")
    } else {
        format!("{base}/%(title)s_%(resolution)s.%(ext)s")
    }
}

/// `"en - Manual"` -> `"en"`. Blank selections are skipped.
fn subtitle_lang_codes(selections: &[String]) -> Vec<String> {
    selections
        .iter()
        .filter_map(|s| {
            let code = s.split(" - ").next().unwrap_or("").trim();
            (!code.is_empty()).then(|| code.to_string())
        })
        .collect()
}

/// Cookie file wins over browser cookies; never both.
fn push_auth_args(args: &mut Vec<String>, auth: &Auth) {
    if let Some(file) = auth.cookie_file.as_ref().filter(|p| !p.as_os_str().is_empty()) {
        args.push("--cookies".to_string());
        args.push(file.to_string_lossy().to_string());
    } else if let Some(browser) = non_empty(&auth.browser_cookies) {
        args.push("--cookies-from-browser".to_string());
        args.push(browser.to_string());
    }
}

fn push_proxy_args(args: &mut Vec<String>, proxy: &ProxySettings) {
    if let Some(p) = non_empty(&proxy.proxy_url) {
        args.push("--proxy".to_string());
        args.push(p.to_string());
    }
    if let Some(p) = non_empty(&proxy.geo_proxy_url) {
        args.push("--geo-verification-proxy".to_string());
        args.push(p.to_string());
    }
}

fn non_empty(v: &Option<String>) -> Option<&str> {
    v.as_deref().filter(|s| !s.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .map(String::as_str)
    }

    fn req() -> DownloadRequest {
        DownloadRequest::new("https://www.youtube.com/watch?v=abc", "/downloads")
    }

    #[test]
    fn video_only_format_gets_bestaudio_fallback() {
        let cmd = build_download_command(&req().with_format("137", false), None);
        assert_eq!(value_after(&cmd.args, "-f"), Some("137+bestaudio/best"));
    }

    #[test]
    fn progressive_or_audio_format_is_verbatim() {
        let cmd = build_download_command(&req().with_format("18", true), None);
        assert_eq!(value_after(&cmd.args, "-f"), Some("18"));

        let cmd = build_download_command(&req().with_format("251", false).with_audio_only(true), None);
        assert_eq!(value_after(&cmd.args, "-f"), Some("251"));
    }

    #[test]
    fn drc_suffix_is_stripped() {
        let cmd = build_download_command(&req().with_format("251-drc", false).with_audio_only(true), None);
        assert_eq!(value_after(&cmd.args, "-f"), Some("251"));
    }

    #[test]
    fn resolution_sort_when_no_format() {
        let cmd = build_download_command(&req(), None);
        assert_eq!(value_after(&cmd.args, "-S"), Some("res:720"));
        assert!(!cmd.args.contains(&"-f".to_string()));

        let cmd = build_download_command(&req().with_resolution("1080"), None);
        assert_eq!(value_after(&cmd.args, "-S"), Some("res:1080"));
    }

    #[test]
    fn output_template_with_playlist_dir() {
        let single = build_download_command(&req(), None);
        assert_eq!(single.output_template, "/downloads/%(title)s_%(resolution)s.%(ext)s");

        let pl = build_download_command(&req().with_playlist(Some("1-3".into())), None);
        assert_eq!(
            pl.output_template,
            "/downloads/%(playlist_title)s/%(title)s_%(resolution)s.%(ext)s"
        );
        assert_eq!(value_after(&pl.args, "--playlist-items"), Some("1-3"));
    }

    #[test]
    fn subtitles_only_when_selected() {
        let cmd = build_download_command(&req(), None);
        assert!(!cmd.args.iter().any(|a| a.contains("subs")));

        let cmd = build_download_command(
            &req().with_subtitles(vec!["en - Manual".into(), "de - Auto-generated".into()], false),
            None,
        );
        assert!(cmd.args.contains(&"--write-subs".to_string()));
        assert!(cmd.args.contains(&"--write-auto-subs".to_string()));
        assert_eq!(value_after(&cmd.args, "--sub-langs"), Some("en,de"));
        assert!(!cmd.args.contains(&"--embed-subs".to_string()));

        let cmd = build_download_command(&req().with_subtitles(vec!["en".into()], true), None);
        assert!(cmd.args.contains(&"--embed-subs".to_string()));
    }

    #[test]
    fn cookie_file_beats_browser() {
        let auth = Auth {
            cookie_file: Some("/tmp/cookies.txt".into()),
            browser_cookies: Some("firefox".into()),
        };
        let cmd = build_download_command(&req().with_auth(auth), None);
        assert_eq!(value_after(&cmd.args, "--cookies"), Some("/tmp/cookies.txt"));
        assert!(!cmd.args.contains(&"--cookies-from-browser".to_string()));

        let cmd = build_download_command(&req().with_auth(Auth::browser("chrome")), None);
        assert_eq!(value_after(&cmd.args, "--cookies-from-browser"), Some("chrome"));
    }

    #[test]
    fn optional_flags_are_independent() {
        let r = req()
            .with_proxy(ProxySettings {
                proxy_url: None,
                geo_proxy_url: Some("socks5://geo:1080".into()),
            })
            .with_rate_limit("2M")
            .with_section("*0:10-0:20", true)
            .with_sponsorblock(vec!["sponsor".into(), "intro".into()]);
        let cmd = build_download_command(&r, Some(Path::new("/usr/bin/ffmpeg")));
        assert!(!cmd.args.contains(&"--proxy".to_string()));
        assert_eq!(value_after(&cmd.args, "--geo-verification-proxy"), Some("socks5://geo:1080"));
        assert_eq!(value_after(&cmd.args, "-r"), Some("2M"));
        assert_eq!(value_after(&cmd.args, "--download-sections"), Some("*0:10-0:20"));
        assert!(cmd.args.contains(&"--force-keyframes-at-cuts".to_string()));
        assert_eq!(value_after(&cmd.args, "--sponsorblock-remove"), Some("sponsor,intro"));
        assert_eq!(value_after(&cmd.args, "--ffmpeg-location"), Some("/usr/bin/ffmpeg"));
        assert_eq!(cmd.args.last().map(String::as_str), Some("https://www.youtube.com/watch?v=abc"));
    }

    #[test]
    fn analysis_command_forwards_auth_and_proxy() {
        let proxy = ProxySettings {
            proxy_url: Some("http://p:8080".into()),
            geo_proxy_url: None,
        };
        let args = build_analysis_command("https://x/y", &Auth::cookie_file("/c.txt"), &proxy);
        assert_eq!(&args[..3], &["--dump-single-json", "--flat-playlist", "--no-warnings"]);
        assert_eq!(value_after(&args, "--cookies"), Some("/c.txt"));
        assert_eq!(value_after(&args, "--proxy"), Some("http://p:8080"));
        assert_eq!(args.last().map(String::as_str), Some("https://x/y"));

        let entry = build_entry_command("https://x/v", &Auth::default(), &ProxySettings::default());
        assert!(!entry.contains(&"--flat-playlist".to_string()));
    }
}
