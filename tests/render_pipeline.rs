#![cfg(unix)]

use std::os::unix::fs::PermissionsExt as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use turntable::render::job::{WorkspaceMode, save_uid};
use turntable::{
    Driver, EncoderConfig, EventLog, FfmpegEncoder, GpuDevices, GpuPool, LogCategory, Publisher,
    RenderEngine, RenderOrchestrator, RenderSettings, RendererConfig, SelectedAsset,
};

/// Creates three camera folders and a shared three-frame sequence in `--output_dir`.
const FAKE_RENDERER: &str = r#"#!/bin/sh
out=""
while [ $# -gt 0 ]; do
  if [ "$1" = "--output_dir" ]; then out="$2"; fi
  shift
done
mkdir -p "$out/cameras_cam00" "$out/cameras_cam01" "$out/cameras_cam02" "$out/frames"
for i in 000 001 002; do echo png > "$out/frames/$i.png"; done
"#;

const HANGING_RENDERER: &str = "#!/bin/sh\nsleep 30\n";

/// Writes its last argument, which is the output video path.
const FAKE_FFMPEG: &str = r#"#!/bin/sh
if [ "$1" = "-version" ]; then exit 0; fi
for last in "$@"; do :; done
echo "$*" > "$last"
"#;

fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn orchestrator(tmp: &Path, renderer: &str, timeout: Duration, workspace: WorkspaceMode) -> RenderOrchestrator {
    let bin = tmp.join("bin");
    std::fs::create_dir_all(&bin).unwrap();
    let settings = RenderSettings {
        renderer: RendererConfig {
            blender: script(&bin, "renderer", renderer),
            script: PathBuf::from("scene.py"),
            use_xvfb: false,
        },
        num_renders: 3,
        num_cameras: Some(3),
        only_northern_hemisphere: false,
        timeout,
        lease_wait: Duration::from_secs(1),
        workspace,
    };
    let encoder = FfmpegEncoder::new(EncoderConfig {
        ffmpeg: script(&bin, "ffmpeg", FAKE_FFMPEG),
        ..EncoderConfig::default()
    })
    .unwrap();
    let gpus = GpuPool::new(GpuDevices::Cpu, tmp.join("leases"));
    RenderOrchestrator::new(settings, gpus, encoder)
        .unwrap()
        .with_engine(RenderEngine::Cycles)
}

fn asset(tmp: &Path, id: &str) -> SelectedAsset {
    let local_path = tmp.join("glbs/x").join(format!("{id}.glb"));
    std::fs::create_dir_all(local_path.parent().unwrap()).unwrap();
    std::fs::write(&local_path, b"glTF").unwrap();
    SelectedAsset {
        id: id.to_string(),
        local_path,
    }
}

#[test]
fn resumed_job_encodes_only_the_next_camera() {
    let tmp = tempfile::tempdir().unwrap();
    let work = tmp.path().join("work");
    let job = work.join(save_uid("a1"));
    std::fs::create_dir_all(job.join("videos")).unwrap();
    std::fs::write(job.join("videos/cam00.mp4"), b"done").unwrap();

    let orch = orchestrator(
        tmp.path(),
        FAKE_RENDERER,
        Duration::from_secs(30),
        WorkspaceMode::Persistent(work.clone()),
    );
    let a1 = asset(tmp.path(), "a1");
    let outcome = orch.render(&a1.id, &a1.local_path).unwrap();

    let encoded = outcome.encoded.unwrap();
    assert_eq!(encoded.camera_name, "cam01");
    assert_eq!(encoded.video_path, job.join("videos/cam01.mp4"));
    assert_eq!(outcome.pending, vec!["cam02".to_string()]);
    assert!(job.join("videos/cam01.mp4").is_file());
    assert!(!job.join("videos/cam02.mp4").exists());
    assert_eq!(std::fs::read(job.join("videos/cam00.mp4")).unwrap(), b"done");
    assert!(!job.join("frames").exists());

    let second = orch.render(&a1.id, &a1.local_path).unwrap();
    assert_eq!(second.encoded.unwrap().camera_name, "cam02");
    assert!(second.pending.is_empty());
}

#[test]
fn timed_out_render_is_logged_as_failure_only() {
    let tmp = tempfile::tempdir().unwrap();
    let orch = orchestrator(
        tmp.path(),
        HANGING_RENDERER,
        Duration::from_millis(300),
        WorkspaceMode::Temporary,
    );
    let log = EventLog::open(tmp.path().join("logs")).unwrap();
    let publisher = Publisher::for_destination(&tmp.path().join("dest").to_string_lossy()).unwrap();
    let driver = Driver::new(orch, publisher, log);

    let summary = driver.run(&[asset(tmp.path(), "slow")]).unwrap();
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.rendered, 0);

    let logs = tmp.path().join("logs");
    let failed = std::fs::read_to_string(logs.join(LogCategory::RenderFailure.file_name())).unwrap();
    assert_eq!(failed.lines().count(), 1);
    assert!(failed.contains(",slow,"));
    assert!(failed.contains("timed out"));
    assert!(!logs.join(LogCategory::RenderSuccess.file_name()).exists());
    assert!(!tmp.path().join("dest/renders").join(format!("{}.zip", save_uid("slow"))).exists());
}

#[test]
fn driver_publishes_logs_and_continues_past_failures() {
    let tmp = tempfile::tempdir().unwrap();
    let orch = orchestrator(
        tmp.path(),
        FAKE_RENDERER,
        Duration::from_secs(30),
        WorkspaceMode::Temporary,
    );
    let log_dir = tmp.path().join("logs");
    let dest = tmp.path().join("dest");
    let publisher = Publisher::for_destination(&dest.to_string_lossy())
        .unwrap()
        .with_unpacker(turntable::Unpacker::spawn().unwrap());
    let driver = Driver::new(orch, publisher, EventLog::open(&log_dir).unwrap());

    let missing = SelectedAsset {
        id: "gone".to_string(),
        local_path: tmp.path().join("glbs/x/gone.glb"),
    };
    let summary = driver.run(&[missing, asset(tmp.path(), "a1")]).unwrap();
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.rendered, 1);
    assert_eq!(summary.pending_cameras, 2);
    assert_eq!(summary.unpack.extracted(), 1);

    let uid = save_uid("a1");
    assert!(dest.join("renders").join(format!("{uid}.zip")).is_file());
    assert!(dest.join("renders").join(&uid).join("videos/cam00.mp4").is_file());

    let log = EventLog::open(&log_dir).unwrap();
    let ok = log.read(LogCategory::RenderSuccess).unwrap();
    assert_eq!(ok.len(), 1);
    assert_eq!(ok[0].asset_id, "a1");
    assert_eq!(ok[0].sha.len(), 64);
    let failed = log.read(LogCategory::RenderFailure).unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].asset_id, "gone");
    assert_eq!(failed[0].sha, "");
}

#[test]
fn completed_assets_are_skipped_on_request() {
    let tmp = tempfile::tempdir().unwrap();
    let log_dir = tmp.path().join("logs");
    {
        let log = EventLog::open(&log_dir).unwrap();
        log.append(LogCategory::RenderSuccess, &["a1", "abc"]);
    }
    let orch = orchestrator(
        tmp.path(),
        HANGING_RENDERER,
        Duration::from_millis(100),
        WorkspaceMode::Temporary,
    );
    let publisher = Publisher::for_destination(&tmp.path().join("dest").to_string_lossy()).unwrap();
    let summary = Driver::new(orch, publisher, EventLog::open(&log_dir).unwrap())
        .skip_completed(true)
        .run(&[asset(tmp.path(), "a1")])
        .unwrap();
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.failed, 0);
}

#[test]
fn modified_object_logs_old_and_new_hash() {
    let tmp = tempfile::tempdir().unwrap();
    let orch = orchestrator(
        tmp.path(),
        FAKE_RENDERER,
        Duration::from_secs(30),
        WorkspaceMode::Temporary,
    );
    let log_dir = tmp.path().join("logs");
    let publisher = Publisher::for_destination(&tmp.path().join("dest").to_string_lossy()).unwrap();
    let driver = Driver::new(orch, publisher, EventLog::open(&log_dir).unwrap());

    assert!(driver.process_modified_object(&asset(tmp.path(), "m1"), "oldsha"));
    driver.record_new_object("n1", "s1");
    driver.record_missing_object("x1", "s2");

    let log = driver.log();
    let modified = log.read(LogCategory::ModifiedObjectSuccess).unwrap();
    assert_eq!(modified.len(), 1);
    assert_eq!(modified[0].sha, "oldsha");
    assert_eq!(modified[0].extra.len(), 1);
    assert_eq!(modified[0].extra[0].len(), 64);
    assert!(log.read(LogCategory::RenderSuccess).unwrap().is_empty());
    assert_eq!(log.read(LogCategory::NewObject).unwrap()[0].asset_id, "n1");
    assert_eq!(log.read(LogCategory::MissingObject).unwrap()[0].asset_id, "x1");
}

#[test]
fn complete_job_still_drops_fresh_frames() {
    let tmp = tempfile::tempdir().unwrap();
    let work = tmp.path().join("work");
    let job = work.join(save_uid("a1"));
    std::fs::create_dir_all(job.join("videos")).unwrap();
    for cam in ["cam00", "cam01", "cam02"] {
        std::fs::write(job.join("videos").join(format!("{cam}.mp4")), b"done").unwrap();
    }

    let orch = orchestrator(
        tmp.path(),
        FAKE_RENDERER,
        Duration::from_secs(30),
        WorkspaceMode::Persistent(work.clone()),
    );
    let a1 = asset(tmp.path(), "a1");
    let outcome = orch.render(&a1.id, &a1.local_path).unwrap();

    assert!(outcome.encoded.is_none());
    assert!(outcome.pending.is_empty());
    assert!(!job.join("frames").exists());
    assert!(job.join("cameras_cam00").is_dir());
}

#[test]
fn failed_frame_cleanup_does_not_fail_the_encode() {
    let tmp = tempfile::tempdir().unwrap();
    let job = tmp.path().join("job");
    let cam = job.join("cameras_cam00");
    std::fs::create_dir_all(&cam).unwrap();
    std::fs::write(cam.join("000.png"), b"png").unwrap();
    // A directory with a frame name cannot be unlinked as a file.
    std::fs::create_dir_all(cam.join("001.png")).unwrap();

    let orch = orchestrator(
        tmp.path(),
        FAKE_RENDERER,
        Duration::from_secs(30),
        WorkspaceMode::Temporary,
    );
    let (encoded, pending) = orch.encode_next("a1", &job).unwrap();

    let encoded = encoded.unwrap();
    assert_eq!(encoded.camera_name, "cam00");
    assert!(encoded.video_path.is_file());
    assert!(pending.is_empty());
    assert!(cam.join("001.png").is_dir());
}
