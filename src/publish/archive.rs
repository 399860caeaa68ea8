use std::fs::File;
use std::io::{BufReader, BufWriter, Write as _};
use std::path::{Component, Path, PathBuf};

use anyhow::Context as _;

use crate::foundation::error::{PipelineError, PipelineResult};

/// Zip `dir` recursively into `archive`.
///
/// Entry names are `<basename(dir)>/<path relative to dir>` with `/` separators, so extracting
/// the archive anywhere recreates the job directory under its own name. Returns the number of
/// files written.
pub fn zip_dir(dir: &Path, archive: &Path) -> PipelineResult<usize> {
    let base = dir
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| PipelineError::validation(format!("cannot archive '{}'", dir.display())))?
        .to_string();
    let out = File::create(archive)
        .with_context(|| format!("create archive '{}'", archive.display()))?;
    let mut zip = zip::ZipWriter::new(BufWriter::new(out));
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .large_file(true);

    let mut files = 0usize;
    for entry in walkdir::WalkDir::new(dir).min_depth(1).sort_by_file_name() {
        let entry = entry.with_context(|| format!("walk '{}'", dir.display()))?;
        let rel = entry
            .path()
            .strip_prefix(dir)
            .context("walked entry outside the archived directory")?;
        let name = entry_name(&base, rel);
        if entry.file_type().is_dir() {
            zip.add_directory(name, options)
                .with_context(|| format!("add directory to '{}'", archive.display()))?;
        } else if entry.file_type().is_file() {
            zip.start_file(name, options)
                .with_context(|| format!("add file to '{}'", archive.display()))?;
            let mut src = BufReader::new(
                File::open(entry.path())
                    .with_context(|| format!("open '{}'", entry.path().display()))?,
            );
            std::io::copy(&mut src, &mut zip)
                .with_context(|| format!("compress '{}'", entry.path().display()))?;
            files += 1;
        }
    }
    let mut inner = zip
        .finish()
        .with_context(|| format!("finish archive '{}'", archive.display()))?;
    std::io::Write::flush(&mut inner)
        .with_context(|| format!("flush archive '{}'", archive.display()))?;
    Ok(files)
}

fn entry_name(base: &str, rel: &Path) -> String {
    let mut name = base.to_string();
    for part in rel.components() {
        if let Component::Normal(p) = part {
            name.push('/');
            name.push_str(&p.to_string_lossy());
        }
    }
    name
}

/// Extract `archive` into `dest`, dropping a leading `strip` folder from entry names.
///
/// Entries that would escape `dest` are skipped. Existing files are overwritten and unrelated
/// files in `dest` are left alone. Returns the number of files written.
pub fn extract_zip(archive: &Path, dest: &Path, strip: Option<&str>) -> PipelineResult<usize> {
    let file = File::open(archive).with_context(|| format!("open '{}'", archive.display()))?;
    let mut zip = zip::ZipArchive::new(BufReader::new(file))
        .with_context(|| format!("read archive '{}'", archive.display()))?;
    std::fs::create_dir_all(dest).with_context(|| format!("create '{}'", dest.display()))?;

    let mut files = 0usize;
    for i in 0..zip.len() {
        let mut entry = zip
            .by_index(i)
            .with_context(|| format!("read entry {i} of '{}'", archive.display()))?;
        let Some(rel) = entry.enclosed_name() else {
            tracing::warn!(archive = %archive.display(), name = entry.name(), "skipping unsafe entry");
            continue;
        };
        let rel: PathBuf = match strip {
            Some(prefix) => rel.strip_prefix(prefix).map(Path::to_path_buf).unwrap_or(rel),
            None => rel,
        };
        if rel.as_os_str().is_empty() {
            continue;
        }
        let out_path = dest.join(&rel);
        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)
                .with_context(|| format!("create '{}'", out_path.display()))?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create '{}'", parent.display()))?;
        }
        let mut out = BufWriter::new(
            File::create(&out_path).with_context(|| format!("create '{}'", out_path.display()))?,
        );
        std::io::copy(&mut entry, &mut out)
            .with_context(|| format!("extract '{}'", out_path.display()))?;
        out.flush()
            .with_context(|| format!("flush '{}'", out_path.display()))?;
        files += 1;
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(archive: &Path) -> Vec<String> {
        let zip = zip::ZipArchive::new(File::open(archive).unwrap()).unwrap();
        let mut names = zip.file_names().map(str::to_string).collect::<Vec<_>>();
        names.sort();
        names
    }

    #[test]
    fn entries_are_prefixed_with_the_directory_name() {
        let tmp = tempfile::tempdir().unwrap();
        let job = tmp.path().join("uid");
        std::fs::create_dir_all(job.join("videos")).unwrap();
        std::fs::create_dir_all(job.join("cameras_cam00")).unwrap();
        std::fs::write(job.join("videos/cam00.mp4"), b"video").unwrap();
        std::fs::write(job.join("cameras_cam00/000.npy"), b"pose").unwrap();
        std::fs::write(job.join("metadata.json"), b"{}").unwrap();

        let archive = tmp.path().join("uid.zip");
        assert_eq!(zip_dir(&job, &archive).unwrap(), 3);
        assert_eq!(
            names(&archive),
            vec![
                "uid/cameras_cam00/",
                "uid/cameras_cam00/000.npy",
                "uid/metadata.json",
                "uid/videos/",
                "uid/videos/cam00.mp4",
            ]
        );
    }

    #[test]
    fn extract_strips_the_leading_folder() {
        let tmp = tempfile::tempdir().unwrap();
        let job = tmp.path().join("uid");
        std::fs::create_dir_all(job.join("videos")).unwrap();
        std::fs::write(job.join("videos/cam00.mp4"), b"video").unwrap();
        let archive = tmp.path().join("uid.zip");
        zip_dir(&job, &archive).unwrap();

        let out = tmp.path().join("out/uid");
        std::fs::create_dir_all(&out).unwrap();
        std::fs::write(out.join("keep.txt"), b"old").unwrap();
        assert_eq!(extract_zip(&archive, &out, Some("uid")).unwrap(), 1);
        assert_eq!(std::fs::read(out.join("videos/cam00.mp4")).unwrap(), b"video");
        assert!(out.join("keep.txt").exists());
    }

    #[test]
    fn extract_rejects_non_zip() {
        let tmp = tempfile::tempdir().unwrap();
        let bogus = tmp.path().join("x.zip");
        std::fs::write(&bogus, b"nope").unwrap();
        assert!(extract_zip(&bogus, &tmp.path().join("out"), None).is_err());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn extract_reports_late_write_errors() {
        let tmp = tempfile::tempdir().unwrap();
        let job = tmp.path().join("uid");
        std::fs::create_dir_all(&job).unwrap();
        std::fs::write(job.join("small.txt"), b"fits in the write buffer").unwrap();
        let archive = tmp.path().join("uid.zip");
        zip_dir(&job, &archive).unwrap();

        // Writes to /dev/full fail with ENOSPC, but only once the buffer is flushed.
        let out = tmp.path().join("out");
        std::fs::create_dir_all(&out).unwrap();
        std::os::unix::fs::symlink("/dev/full", out.join("small.txt")).unwrap();
        let err = extract_zip(&archive, &out, Some("uid")).unwrap_err();
        assert!(err.to_string().contains("small.txt"), "{err}");
    }
}
