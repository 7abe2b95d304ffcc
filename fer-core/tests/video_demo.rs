mod common;

use std::collections::BTreeSet;
use std::path::Path;

use common::*;
use fer_core::emotion::EmotionLabel;
use fer_core::error::FailureKind;
use fer_core::pipeline::{video_artifact_base, Upload, VideoDemo};
use fer_core::video::{self, VideoWriter};
use ffmpeg_next::Rational;

/// Encode `frames` copies of the test picture as an mp4 and return its bytes.
fn clip_bytes(dir: &Path, frames: usize) -> Vec<u8> {
    let path = dir.join("source.mp4");
    let mut writer = VideoWriter::create(&path, 160, 120, Rational::new(25, 1)).unwrap();
    for _ in 0..frames {
        writer.write(&picture(160, 120)).unwrap();
    }
    writer.finish().unwrap();
    std::fs::read(path).unwrap()
}

fn names(dir: &Path) -> BTreeSet<String> {
    std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect()
}

#[test]
fn video_writes_annotated_clip_charts_and_summary() {
    let work = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let staging = tempfile::tempdir().unwrap();
    let upload = Upload::new("clip.mp4", clip_bytes(work.path(), 4));

    let cfg = config(0.5, false);
    let locator = ScriptedLocator::every_call(vec![face(20.0, 20.0, 80.0, 90.0, 0.9)], 10);
    let engine = engine(&cfg, locator, CyclingClassifier::always(EmotionLabel::Surprise));
    let mut demo = VideoDemo::new(cfg, engine, out.path(), 1)
        .unwrap()
        .with_staging_dir(staging.path().to_path_buf());

    let mut last_progress = 0;
    let report = demo.process(&upload, |done, _| last_progress = done).unwrap();

    assert_eq!(report.frames, 4);
    assert_eq!(report.compute_frames, 2);
    assert_eq!(report.counts.get(EmotionLabel::Surprise), 2);
    assert_eq!(report.mean_frequencies[&EmotionLabel::Surprise], 1.0);
    assert_eq!(last_progress, 4);

    let base = video_artifact_base(&cfg, "clip", report.fps, 1);
    assert!(base.ends_with("_fps25.0_skip1"), "{base}");
    let expected: BTreeSet<String> = [
        format!("{base}.mp4"),
        format!("{base}_freq_plot.pdf"),
        format!("{base}_mean_freq_plot.pdf"),
        format!("{base}_summary.json"),
    ]
    .into_iter()
    .collect();
    let videos = out.path().join("videos");
    assert_eq!(names(&videos), expected);
    assert_eq!(report.artifacts.len(), 4);
    assert!(report.artifacts.iter().all(|p| p.starts_with(&videos)));

    let annotated = video::probe(videos.join(format!("{base}.mp4"))).unwrap();
    assert_eq!((annotated.width, annotated.height), (160, 120));

    let chart = std::fs::read(videos.join(format!("{base}_mean_freq_plot.pdf"))).unwrap();
    assert!(chart.starts_with(b"%PDF-"));

    let summary: serde_json::Value = serde_json::from_slice(
        &std::fs::read(videos.join(format!("{base}_summary.json"))).unwrap(),
    )
    .unwrap();
    assert_eq!(summary["compute_frames"], 2);
    assert_eq!(summary["skip"], 1);

    assert!(names(staging.path()).is_empty());
}

#[test]
fn missing_face_mid_video_with_enforcement_leaves_nothing_behind() {
    let work = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let staging = tempfile::tempdir().unwrap();
    let upload = Upload::new("clip.mp4", clip_bytes(work.path(), 4));

    // Frame 0 finds a face, frame 2 (the next Compute frame) finds none.
    let cfg = config(0.5, true);
    let locator = ScriptedLocator::every_call(vec![face(20.0, 20.0, 80.0, 90.0, 0.9)], 1);
    let engine = engine(&cfg, locator, CyclingClassifier::always(EmotionLabel::Fear));
    let mut demo = VideoDemo::new(cfg, engine, out.path(), 1)
        .unwrap()
        .with_staging_dir(staging.path().to_path_buf());

    let err = demo.process(&upload, |_, _| {}).unwrap_err();
    assert_eq!(FailureKind::of(&err), FailureKind::DetectionFailure);

    assert!(names(&out.path().join("videos")).is_empty());
    assert!(names(staging.path()).is_empty());
}

#[test]
fn undecodable_video_is_invalid_input() {
    let out = tempfile::tempdir().unwrap();
    let staging = tempfile::tempdir().unwrap();
    let cfg = config(0.5, false);
    let engine = engine(
        &cfg,
        ScriptedLocator::every_call(Vec::new(), 0),
        CyclingClassifier::always(EmotionLabel::Neutral),
    );
    let mut demo = VideoDemo::new(cfg, engine, out.path(), 0)
        .unwrap()
        .with_staging_dir(staging.path().to_path_buf());

    let err = demo
        .process(&Upload::new("broken.mov", b"not a video".to_vec()), |_, _| {})
        .unwrap_err();
    assert_eq!(FailureKind::of(&err), FailureKind::InvalidInput);
    assert!(names(&out.path().join("videos")).is_empty());
    assert!(names(staging.path()).is_empty());
}
