//! Group compression: the codecs that turn a file group into one archive.
//!
//! The pipeline only depends on the [`Compressor`] trait; [`CodecCompressor`]
//! is the shipped implementation covering the configured methods. Progress
//! is published through a shared [`CompressionProgress`] so the worker's
//! refresher task can report mid-archive state without touching the codec.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Context;
use log::warn;

use tapeback_lib::{CompressionMethod, PendingFile};

/// What a finished archive looks like to the rest of the pipeline.
#[derive(Clone, Debug)]
pub struct ArchiveStats {
    pub path: PathBuf,
    pub archive_size: u64,
    /// crc32c of the archive bytes, hex-encoded.
    pub checksum: String,
    pub compression_enabled: bool,
}

/// Shared per-archive progress, readable by external observers while a
/// compression runs.
#[derive(Debug, Default)]
pub struct CompressionProgress {
    current: AtomicU64,
    total: AtomicU64,
}

impl CompressionProgress {
    pub fn begin(&self, total: u64) {
        self.total.store(total, Ordering::Relaxed);
        self.current.store(0, Ordering::Relaxed);
    }

    pub fn tick(&self) {
        self.current.fetch_add(1, Ordering::Relaxed);
    }

    /// `(current, total)` as last published.
    pub fn snapshot(&self) -> (u64, u64) {
        (
            self.current.load(Ordering::Relaxed),
            self.total.load(Ordering::Relaxed),
        )
    }

    pub fn percent(&self) -> f64 {
        let (current, total) = self.snapshot();
        if total == 0 {
            0.0
        } else {
            current as f64 / total as f64 * 100.0
        }
    }
}

/// Compresses one group of files into an archive at a given path.
///
/// Implementations run on a blocking thread; they are free to take as long
/// as the data demands (compression has no timeout).
pub trait Compressor: Send + Sync {
    fn compress_group(
        &self,
        files: &[PendingFile],
        out_path: &Path,
        progress: &CompressionProgress,
    ) -> anyhow::Result<ArchiveStats>;
}

/// The configured-codec compressor.
pub struct CodecCompressor {
    method: CompressionMethod,
    level: u32,
    threads: u32,
}

impl CodecCompressor {
    pub fn new(method: CompressionMethod, level: u32, threads: u32) -> Self {
        CodecCompressor {
            method,
            level,
            threads,
        }
    }

    fn build_tar<W: Write>(
        &self,
        files: &[PendingFile],
        writer: W,
        progress: &CompressionProgress,
    ) -> anyhow::Result<W> {
        let mut builder = tar::Builder::new(writer);
        builder.follow_symlinks(false);
        for file in files {
            // A file can vanish between scan and compression; that is not a
            // group-fatal condition.
            match std::fs::metadata(&file.path) {
                Ok(_) => {
                    let name = archive_member_name(&file.path);
                    builder
                        .append_path_with_name(&file.path, name)
                        .with_context(|| format!("archiving {}", file.path.display()))?;
                }
                Err(e) => warn!("skipping vanished file {}: {e}", file.path.display()),
            }
            progress.tick();
        }
        Ok(builder.into_inner()?)
    }
}

impl Compressor for CodecCompressor {
    fn compress_group(
        &self,
        files: &[PendingFile],
        out_path: &Path,
        progress: &CompressionProgress,
    ) -> anyhow::Result<ArchiveStats> {
        progress.begin(files.len() as u64);
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        match self.method {
            CompressionMethod::Tar => {
                let file = File::create(out_path)?;
                let file = self.build_tar(files, file, progress)?;
                file.sync_all()?;
            }
            CompressionMethod::Pgzip => {
                let file = File::create(out_path)?;
                let gz = flate2::write::GzEncoder::new(
                    file,
                    flate2::Compression::new(self.level.min(9)),
                );
                let gz = self.build_tar(files, gz, progress)?;
                gz.finish()?.sync_all()?;
            }
            CompressionMethod::Zstd => {
                let file = File::create(out_path)?;
                let enc = zstd::stream::write::Encoder::new(
                    file,
                    (self.level as i32).clamp(1, 21),
                )?;
                let enc = self.build_tar(files, enc, progress)?;
                enc.finish()?.sync_all()?;
            }
            CompressionMethod::SevenZipCommand => {
                self.run_seven_zip(files, out_path)?;
                progress.begin(files.len() as u64);
                for _ in files {
                    progress.tick();
                }
            }
        }

        let (archive_size, checksum) = size_and_checksum(out_path)?;
        Ok(ArchiveStats {
            path: out_path.to_owned(),
            archive_size,
            checksum,
            compression_enabled: self.method.compresses(),
        })
    }
}

impl CodecCompressor {
    fn run_seven_zip(&self, files: &[PendingFile], out_path: &Path) -> anyhow::Result<()> {
        let list_path = out_path.with_extension("filelist");
        {
            let mut list = File::create(&list_path)?;
            for file in files {
                writeln!(list, "{}", file.path.display())?;
            }
        }
        let result = duct::cmd(
            "7z",
            [
                "a".to_string(),
                "-y".to_string(),
                format!("-mx={}", self.level.min(9)),
                format!("-mmt={}", self.threads.max(1)),
                out_path.display().to_string(),
                format!("@{}", list_path.display()),
            ],
        )
        .stdout_null()
        .stderr_capture()
        .run()
        .context("running 7z");
        let _ = std::fs::remove_file(&list_path);
        let output = result?;
        anyhow::ensure!(
            output.status.success(),
            "7z exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr)
        );
        Ok(())
    }
}

/// Member name inside the archive: the absolute path with the root stripped,
/// so archives unpack relative.
fn archive_member_name(path: &Path) -> PathBuf {
    path.strip_prefix("/")
        .map(Path::to_owned)
        .unwrap_or_else(|_| path.to_owned())
}

fn size_and_checksum(path: &Path) -> anyhow::Result<(u64, String)> {
    let mut file = File::open(path)?;
    let mut crc = 0u32;
    let mut size = 0u64;
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        crc = crc32c::crc32c_append(crc, &buf[..n]);
        size += n as u64;
    }
    Ok((size, format!("{crc:08x}")))
}

/// Test compressor: concatenates the input paths into the "archive" and
/// reports a fixed compression factor, so pipeline tests don't pay for a
/// real codec.
#[cfg(any(test, feature = "test"))]
pub struct RecordingCompressor;

#[cfg(any(test, feature = "test"))]
impl Compressor for RecordingCompressor {
    fn compress_group(
        &self,
        files: &[PendingFile],
        out_path: &Path,
        progress: &CompressionProgress,
    ) -> anyhow::Result<ArchiveStats> {
        progress.begin(files.len() as u64);
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = File::create(out_path)?;
        for file in files {
            writeln!(out, "{}\t{}", file.path.display(), file.size)?;
            progress.tick();
        }
        out.sync_all()?;
        let (archive_size, checksum) = size_and_checksum(out_path)?;
        Ok(ArchiveStats {
            path: out_path.to_owned(),
            archive_size,
            checksum,
            compression_enabled: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tapeback_lib::FileId;

    fn pending(path: &Path, size: u64) -> PendingFile {
        PendingFile {
            id: FileId(1),
            path: path.to_owned(),
            size,
        }
    }

    #[test]
    fn tar_gz_round_trips_member_data() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("hello.txt");
        std::fs::write(&src, b"hello tape").unwrap();

        let out = dir.path().join("out.tar.gz");
        let codec = CodecCompressor::new(CompressionMethod::Pgzip, 6, 1);
        let progress = CompressionProgress::default();
        let stats = codec
            .compress_group(&[pending(&src, 10)], &out, &progress)
            .unwrap();
        assert!(stats.archive_size > 0);
        assert!(stats.compression_enabled);
        assert_eq!(progress.snapshot(), (1, 1));

        let gz = flate2::read::GzDecoder::new(File::open(&out).unwrap());
        let mut ar = tar::Archive::new(gz);
        let mut entries = ar.entries().unwrap();
        let mut first = entries.next().unwrap().unwrap();
        let mut data = String::new();
        first.read_to_string(&mut data).unwrap();
        assert_eq!(data, "hello tape");
    }

    #[test]
    fn vanished_files_are_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("here.txt");
        std::fs::write(&present, b"x").unwrap();
        let gone = dir.path().join("gone.txt");

        let out = dir.path().join("out.tar");
        let codec = CodecCompressor::new(CompressionMethod::Tar, 0, 1);
        let progress = CompressionProgress::default();
        let stats = codec
            .compress_group(&[pending(&gone, 5), pending(&present, 1)], &out, &progress)
            .unwrap();
        assert!(stats.archive_size > 0);
        assert!(!stats.compression_enabled);
        assert_eq!(progress.snapshot(), (2, 2));
    }

    #[test]
    fn checksum_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        std::fs::write(&path, b"0123456789").unwrap();
        let (size_a, sum_a) = size_and_checksum(&path).unwrap();
        let (size_b, sum_b) = size_and_checksum(&path).unwrap();
        assert_eq!(size_a, 10);
        assert_eq!((size_a, sum_a), (size_b, sum_b));
    }
}
