use url::Url;

use crate::error::EngineError;

const PLAYLIST_BASE: &str = "https://www.youtube.com/playlist";

/// Normalize a presumed http(s) URL.
///
/// - Only accepts http/https
/// - Removes URL fragments (`#...`), they are not meaningful for downloads
/// - Scheme/host lowercasing and default-port removal come from `Url` parsing
///
/// Path characters are kept as typed, including a trailing `)` or `.`.
pub fn normalize_http_url(input: &str) -> Option<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }

    let mut url = Url::parse(trimmed).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    url.host_str()?;
    url.set_fragment(None);

    Some(url.to_string())
}

/// Prepare a user-supplied URL for analysis.
///
/// A watch URL that also carries a playlist (`watch?v=X&list=Y`) is turned
/// into the playlist URL, so the whole list is analyzed.
pub fn normalize_analysis_url(input: &str) -> Result<String, EngineError> {
    let normalized =
        normalize_http_url(input).ok_or_else(|| EngineError::InvalidUrl(input.trim().to_string()))?;

    match playlist_id_of_watch_url(&normalized) {
        Some(list) => {
            let mut url = Url::parse(PLAYLIST_BASE).map_err(|_| EngineError::InvalidUrl(normalized.clone()))?;
            url.query_pairs_mut().append_pair("list", &list);
            Ok(url.to_string())
        }
        None => Ok(normalized),
    }
}

fn playlist_id_of_watch_url(normalized: &str) -> Option<String> {
    let url = Url::parse(normalized).ok()?;
    if !url.path().ends_with("/watch") {
        return None;
    }
    let mut has_video = false;
    let mut list = None;
    for (k, v) in url.query_pairs() {
        match k.as_ref() {
            "v" => has_video = true,
            "list" if !v.is_empty() => list = Some(v.into_owned()),
            _ => {}
        }
    }
    list.filter(|_| has_video)
}
