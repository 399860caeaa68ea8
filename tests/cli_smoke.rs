use std::path::PathBuf;
use std::process::Command;

fn exe() -> PathBuf {
    std::env::var_os("CARGO_BIN_EXE_turntable")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let mut p = PathBuf::from("target").join("debug");
            p.push(if cfg!(windows) {
                "turntable.exe"
            } else {
                "turntable"
            });
            p
        })
}

#[test]
fn cli_unpack_extracts_archives() {
    let tmp = tempfile::tempdir().unwrap();
    let job = tmp.path().join("work/uid");
    std::fs::create_dir_all(job.join("videos")).unwrap();
    std::fs::write(job.join("videos/cam00.mp4"), b"video").unwrap();
    let renders = tmp.path().join("renders");
    std::fs::create_dir_all(&renders).unwrap();
    turntable::publish::archive::zip_dir(&job, &renders.join("uid.zip")).unwrap();

    let status = Command::new(exe())
        .arg("unpack")
        .arg(&renders)
        .status()
        .unwrap();

    assert!(status.success());
    assert!(renders.join("uid/videos/cam00.mp4").is_file());
    assert_eq!(
        std::fs::read_to_string(renders.join("extracted_folders.txt")).unwrap(),
        "uid\n"
    );
}

#[test]
fn cli_render_rejects_bad_gpu_list() {
    let out = Command::new(exe())
        .args(["render", "--gpu-devices", "1,x"])
        .output()
        .unwrap();
    assert!(!out.status.success());
}

#[test]
fn cli_render_without_local_selection_fails() {
    let tmp = tempfile::tempdir().unwrap();
    let out = Command::new(exe())
        .arg("render")
        .arg("--download-dir")
        .arg(tmp.path())
        .args(["--gpu-devices", "0"])
        .output()
        .unwrap();
    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("object-paths.json.gz"), "{stderr}");
}

#[test]
fn cli_download_rejects_unknown_category() {
    use std::io::Write as _;

    let tmp = tempfile::tempdir().unwrap();
    let json = serde_json::json!({ "chair": ["c1"] }).to_string();
    let mut gz = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    gz.write_all(json.as_bytes()).unwrap();
    std::fs::write(
        tmp.path().join(turntable::manifest::ANNOTATIONS_FILE),
        gz.finish().unwrap(),
    )
    .unwrap();

    let out = Command::new(exe())
        .arg("download")
        .arg("--download-dir")
        .arg(tmp.path())
        .args(["--category", "sofa"])
        .output()
        .unwrap();
    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("unknown category 'sofa'"), "{stderr}");
}

#[test]
fn cli_download_needs_ids_or_category() {
    let out = Command::new(exe()).arg("download").output().unwrap();
    assert!(!out.status.success());
}
