//! End-to-end render tests against a real FFmpeg.
//!
//! Each test skips itself when `ffmpeg`/`ffprobe` or a system font is missing.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use capburn_media::{
    check_ffmpeg, check_ffprobe, list_keyframes, plan_render, probe_video, render_with_job, FontBook,
    MediaError, ProgressFn, RenderJob, RenderSettings,
};
use capburn_models::{CaptionSegment, ExportConfig, Quality, RenderRequest, VideoClip, WordTiming};

fn tools_available() -> bool {
    let ok = check_ffmpeg("ffmpeg").is_ok()
        && check_ffprobe("ffprobe").is_ok()
        && FontBook::new(None, "DejaVu Sans").has_fonts();
    if !ok {
        eprintln!("skipping: ffmpeg, ffprobe or a system font is not available");
    }
    ok
}

/// Generate a test clip with lavfi, one keyframe every `gop` frames.
async fn make_source(dir: &Path, name: &str, secs: u32, with_audio: bool, gop: u32) -> PathBuf {
    let path = dir.join(name);
    let mut args: Vec<String> = vec![
        "-y".into(),
        "-hide_banner".into(),
        "-v".into(),
        "error".into(),
        "-f".into(),
        "lavfi".into(),
        "-i".into(),
        format!("testsrc=size=640x360:rate=30:duration={}", secs),
    ];
    if with_audio {
        args.extend([
            "-f".into(),
            "lavfi".into(),
            "-i".into(),
            format!("sine=frequency=440:duration={}", secs),
            "-c:a".into(),
            "aac".into(),
            "-shortest".into(),
        ]);
    }
    args.extend([
        "-c:v".into(),
        "libx264".into(),
        "-preset".into(),
        "ultrafast".into(),
        "-g".into(),
        gop.to_string(),
        "-keyint_min".into(),
        gop.to_string(),
        "-sc_threshold".into(),
        "0".into(),
        "-pix_fmt".into(),
        "yuv420p".into(),
        path.to_string_lossy().to_string(),
    ]);

    let status = tokio::process::Command::new("ffmpeg")
        .args(&args)
        .status()
        .await
        .unwrap();
    assert!(status.success(), "failed to generate test source");
    path
}

fn settings_in(dir: &Path) -> RenderSettings {
    RenderSettings {
        temp_root: Some(dir.join("jobs")),
        hw_preference: Vec::new(),
        ..Default::default()
    }
}

fn recording_sink() -> (ProgressFn, Arc<Mutex<Vec<u8>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink: ProgressFn = {
        let seen = Arc::clone(&seen);
        Arc::new(move |pct| seen.lock().unwrap().push(pct))
    };
    (sink, seen)
}

#[tokio::test]
async fn test_round_trip_static_captions() {
    if !tools_available() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let source = make_source(dir.path(), "src.mp4", 10, false, 30).await;
    let output = dir.path().join("out.mp4");

    let request = RenderRequest::new(&source, &output)
        .with_captions(vec![
            CaptionSegment::new("c1", 0, 5000, "First caption"),
            CaptionSegment::new("c2", 5000, 10000, "Second caption"),
        ])
        .with_export(ExportConfig {
            framerate: None,
            quality: Quality::Medium,
        });
    let settings = settings_in(dir.path());

    let plan = plan_render(&request, &settings).await.unwrap();
    assert_eq!(plan.overlay_count, 2);
    assert_eq!(plan.captions, request.captions);

    let (sink, seen) = recording_sink();
    let job = RenderJob::new(settings).unwrap();
    let temp = job.temp_path().to_path_buf();
    let result = render_with_job(job, &request, Some(sink)).await;
    tokio_test::assert_ok!(&result);

    assert_eq!(result.unwrap(), output);
    assert!(std::fs::metadata(&output).unwrap().len() > 0);
    assert!(!temp.exists());

    let info = probe_video(&output).await.unwrap();
    assert_eq!((info.width, info.height), (640, 360));
    assert!((info.duration - 10.0).abs() <= 1.0 / 30.0 + 1e-3, "duration {}", info.duration);

    let seen = seen.lock().unwrap();
    assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(seen.last().copied(), Some(100));
}

#[tokio::test]
async fn test_removed_clip_remaps_captions() {
    if !tools_available() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let source = make_source(dir.path(), "src.mp4", 20, true, 30).await;
    let output = dir.path().join("trimmed.mp4");

    let request = RenderRequest::new(&source, &output)
        .with_captions(vec![
            CaptionSegment::new("inside", 6000, 7000, "gone"),
            CaptionSegment::new("straddle", 9000, 11000, "kept"),
        ])
        .with_clips(vec![
            VideoClip::new(0, 5000),
            VideoClip::removed(5000, 10000),
            VideoClip::new(10000, 20000),
        ]);
    let settings = settings_in(dir.path());

    let plan = plan_render(&request, &settings).await.unwrap();
    assert_eq!(plan.captions.len(), 1);
    assert_eq!(plan.captions[0].id, "straddle");
    assert_eq!((plan.captions[0].start_time_ms, plan.captions[0].end_time_ms), (5000, 6000));
    assert_eq!(plan.dropped.len(), 1);

    let job = RenderJob::new(settings).unwrap();
    render_with_job(job, &request, None).await.unwrap();

    let info = probe_video(&output).await.unwrap();
    assert!((info.duration - 15.0).abs() < 0.25, "duration {}", info.duration);
    assert!(info.has_audio);
}

#[tokio::test]
async fn test_sparse_word_captions_with_smart_chunks() {
    if !tools_available() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let source = make_source(dir.path(), "src.mp4", 30, true, 30).await;
    let output = dir.path().join("words.mp4");

    let caption = CaptionSegment::new("w", 12000, 14000, "one two three").with_words(vec![
        WordTiming::new("one", 12000, 12600),
        WordTiming::new("two", 12600, 13300),
        WordTiming::new("three", 13300, 14000),
    ]);
    let request = RenderRequest::new(&source, &output).with_captions(vec![caption]);
    let settings = settings_in(dir.path());

    let plan = plan_render(&request, &settings).await.unwrap();
    assert_eq!(plan.overlay_count, 3);
    assert_eq!(plan.chunks.iter().filter(|c| c.has_captions).count(), 1);
    assert_eq!(plan.chunks.len(), 3);

    let job = RenderJob::new(settings).unwrap();
    render_with_job(job, &request, None).await.unwrap();

    let info = probe_video(&output).await.unwrap();
    assert!((info.duration - 30.0).abs() < 0.5, "duration {}", info.duration);
}

#[tokio::test]
async fn test_mid_gop_chunk_keeps_planned_duration() {
    if !tools_available() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    // Keyframes only at 0, 10 and 20 s
    let source = make_source(dir.path(), "src.mp4", 30, true, 300).await;
    let keyframes = list_keyframes(std::path::Path::new("ffprobe"), &source).await.unwrap();
    assert_eq!(keyframes.len(), 3, "keyframes {:?}", keyframes);

    let output = dir.path().join("long_gop.mp4");
    let request = RenderRequest::new(&source, &output)
        .with_captions(vec![CaptionSegment::new("c", 3000, 5000, "early caption")]);
    // Windows of 7.5 s put the caption-free run's start between keyframes
    let settings = RenderSettings {
        smart_window_secs: 7.5,
        ..settings_in(dir.path())
    };

    let plan = plan_render(&request, &settings).await.unwrap();
    let mid_gop = plan
        .chunks
        .iter()
        .filter(|c| !c.has_captions && c.start_secs > 0.0)
        .any(|c| keyframes.iter().all(|k| (k - c.start_secs).abs() > 0.1));
    assert!(mid_gop, "plan has no caption-free chunk starting mid-GOP: {:?}", plan.chunks);

    let job = RenderJob::new(settings).unwrap();
    render_with_job(job, &request, None).await.unwrap();

    let info = probe_video(&output).await.unwrap();
    assert!((info.duration - 30.0).abs() <= 2.0 / 30.0 + 1e-3, "duration {}", info.duration);
}

#[tokio::test]
async fn test_cancellation_stops_render_and_cleans_up() {
    if !tools_available() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let source = make_source(dir.path(), "src.mp4", 10, false, 30).await;
    let output = dir.path().join("cancelled.mp4");

    let captions: Vec<CaptionSegment> = (0..10u64)
        .map(|i| CaptionSegment::new(format!("c{}", i), i * 1000, i * 1000 + 900, format!("caption {}", i)))
        .collect();
    let request = RenderRequest::new(&source, &output).with_captions(captions);

    let job = RenderJob::new(settings_in(dir.path())).unwrap();
    let temp = job.temp_path().to_path_buf();
    let processes = Arc::clone(job.processes());
    let cancel = job.cancel_handle();
    let sink: ProgressFn = Arc::new(move |pct| {
        if pct >= 10 {
            cancel.cancel();
        }
    });

    let result = render_with_job(job, &request, Some(sink)).await;

    assert!(matches!(result, Err(MediaError::Cancelled)), "got {:?}", result);
    assert!(!temp.exists());
    assert!(!output.exists());
    assert_eq!(processes.active_count(), 0);
}
