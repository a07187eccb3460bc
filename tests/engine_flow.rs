//! End-to-end engine runs against a shell script standing in for yt-dlp.
#![cfg(unix)]

use std::time::Duration;

use tokio::sync::mpsc;
use uuid::Uuid;
use ytdl_orchestrator::{
    AnalysisEvent, AnalysisRequest, DownloadRequest, Engine, EngineConfig, EngineError,
    EngineEvent, ErrorCode, Lifecycle, ProgressEvent, RetryPolicy,
};

fn fake_tool(script: &str) -> EngineConfig {
    EngineConfig::new("/bin/sh")
        .with_global_args(["-c", script, "yt-dlp"])
        .with_settle_delays(Duration::from_millis(10), Duration::from_millis(10))
        .with_terminate_grace(Duration::from_secs(2))
        .with_cleanup_retry(RetryPolicy::new(2, Duration::from_millis(5), 1.5))
}

/// Collect events for `id` until its terminal event.
async fn until_terminal(rx: &mut mpsc::Receiver<EngineEvent>, id: Uuid) -> Vec<EngineEvent> {
    let mut out = Vec::new();
    while let Some(ev) = tokio::time::timeout(Duration::from_secs(20), rx.recv())
        .await
        .expect("engine went quiet")
    {
        if ev.id() != id {
            continue;
        }
        let done = ev.is_terminal();
        out.push(ev);
        if done {
            break;
        }
    }
    out
}

fn progress(events: &[EngineEvent]) -> Vec<&ProgressEvent> {
    events
        .iter()
        .filter_map(|e| match e {
            EngineEvent::Download { event, .. } => Some(event),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn download_completes_with_single_terminal_event() {
    let dir = tempfile::tempdir().unwrap();
    let script = r#"echo '[download] Destination: Movie_1080p.mp4'
echo '[download]  47.32% of 10.00MiB at 2.00MiB/s ETA 00:03'
echo '[download] 100.0% of 10.00MiB'"#;
    let (engine, mut rx) = Engine::new(fake_tool(script));

    let id = engine
        .start_download(DownloadRequest::new("https://example.com/watch?v=1", dir.path()), None)
        .await
        .unwrap();
    let events = until_terminal(&mut rx, id).await;
    let progress = progress(&events);

    assert!(progress.contains(&&ProgressEvent::FileDestination("Movie_1080p.mp4".into())));
    assert!(progress.contains(&&ProgressEvent::Percent(47.32)));
    assert_eq!(progress.last(), Some(&&ProgressEvent::Completed));
    assert_eq!(engine.wait_download().await, Some(Lifecycle::Completed));
}

#[tokio::test]
async fn second_download_is_busy_until_first_is_cancelled() {
    let dir = tempfile::tempdir().unwrap();
    let partial = dir.path().join("Movie.f137.mp4.part");
    std::fs::write(&partial, b"partial").unwrap();
    let (engine, mut rx) = Engine::new(fake_tool("echo '[download] Destination: Movie.f137.mp4'; exec sleep 30"));

    let req = DownloadRequest::new("https://example.com/watch?v=1", dir.path());
    let id = engine.start_download(req.clone(), None).await.unwrap();
    assert!(matches!(
        engine.start_download(req.clone(), None).await,
        Err(EngineError::Busy)
    ));

    loop {
        match rx.recv().await {
            Some(EngineEvent::Download {
                event: ProgressEvent::FileDestination(_),
                ..
            }) => break,
            Some(_) => {}
            None => panic!("channel closed"),
        }
    }
    assert!(engine.pause_download().await);
    assert_eq!(engine.download_state().await, Some((id, Lifecycle::Paused)));
    assert!(engine.cancel_download().await);

    let events = until_terminal(&mut rx, id).await;
    assert_eq!(progress(&events).last(), Some(&&ProgressEvent::Cancelled));
    assert!(!partial.exists());
    assert_eq!(engine.wait_download().await, Some(Lifecycle::Cancelled));

    // The slot frees up once the first download is terminal.
    assert!(engine.start_download(req, None).await.is_ok());
    engine.shutdown().await;
}

#[tokio::test]
async fn exit_codes_are_reported_distinctly() {
    let dir = tempfile::tempdir().unwrap();
    let req = DownloadRequest::new("https://example.com/watch?v=1", dir.path());

    let (engine, mut rx) = Engine::new(fake_tool("exit 127"));
    let id = engine.start_download(req.clone(), None).await.unwrap();
    let not_found = until_terminal(&mut rx, id).await;

    let (engine, mut rx) = Engine::new(fake_tool("exit 1"));
    let id = engine.start_download(req, None).await.unwrap();
    let generic = until_terminal(&mut rx, id).await;

    let report = |events: &[EngineEvent]| match progress(events).last() {
        Some(ProgressEvent::Error(r)) => r.clone(),
        other => panic!("unexpected terminal event: {other:?}"),
    };
    let (a, b) = (report(&not_found), report(&generic));
    assert_eq!(a.code, ErrorCode::ToolMissing);
    assert_eq!(b.code, ErrorCode::ToolFailed);
    assert_ne!(a.message, b.message);
    assert!(b.message.contains("multiple yt-dlp installations"));
}

#[tokio::test]
async fn playlist_analysis_falls_back_to_flat_entry() {
    let script = r#"case "$*" in
  *--flat-playlist*) echo '{"_type":"playlist","title":"Mix","thumbnail":"https://t/p.jpg","entries":[{"id":"a","url":"https://www.youtube.com/watch?v=a","title":"First","duration":12.0}]}' ;;
  *) echo 'ERROR: [youtube] a: Video unavailable' >&2; exit 1 ;;
esac"#;
    let (engine, mut rx) = Engine::new(fake_tool(script));
    let id = engine
        .start_analysis(AnalysisRequest::new("https://www.youtube.com/watch?v=a&list=PL1"))
        .await
        .unwrap();

    let events = until_terminal(&mut rx, id).await;
    match events.last() {
        Some(EngineEvent::Analysis {
            event: AnalysisEvent::Completed(result),
            ..
        }) => {
            assert!(result.is_playlist);
            assert!(result.used_entry_fallback);
            assert_eq!(result.video.title.as_deref(), Some("First"));
            assert_eq!(result.thumbnail_url.as_deref(), Some("https://t/p.jpg"));
        }
        other => panic!("unexpected terminal event: {other:?}"),
    }
}

#[tokio::test]
async fn new_analysis_cancels_the_previous_one() {
    let script = r#"case "$*" in
  *slow*) exec sleep 30 ;;
  *) echo '{"id":"b","title":"B","formats":[{"format_id":"18","vcodec":"avc1","acodec":"mp4a"}]}' ;;
esac"#;
    let (engine, mut rx) = Engine::new(fake_tool(script));

    let first = engine
        .start_analysis(AnalysisRequest::new("https://example.com/slow"))
        .await
        .unwrap();
    let second = engine
        .start_analysis(AnalysisRequest::new("https://example.com/fast"))
        .await
        .unwrap();
    assert_ne!(first, second);

    let mut first_terminal = None;
    let mut second_terminal = None;
    while first_terminal.is_none() || second_terminal.is_none() {
        let ev = tokio::time::timeout(Duration::from_secs(20), rx.recv())
            .await
            .expect("engine went quiet")
            .expect("channel closed");
        if let EngineEvent::Analysis { id, event } = ev {
            if event.is_terminal() {
                if id == first {
                    first_terminal = Some(event);
                } else if id == second {
                    second_terminal = Some(event);
                }
            }
        }
    }

    assert_eq!(first_terminal, Some(AnalysisEvent::Cancelled));
    assert!(matches!(second_terminal, Some(AnalysisEvent::Completed(_))));
}

#[tokio::test]
async fn analysis_reports_bad_json() {
    let (engine, mut rx) = Engine::new(fake_tool("echo 'not json'"));
    let id = engine
        .start_analysis(AnalysisRequest::new("https://example.com/v"))
        .await
        .unwrap();
    match until_terminal(&mut rx, id).await.last() {
        Some(EngineEvent::Analysis {
            event: AnalysisEvent::Failed(r),
            ..
        }) => assert_eq!(r.code, ErrorCode::InvalidOutput),
        other => panic!("unexpected terminal event: {other:?}"),
    }
}
