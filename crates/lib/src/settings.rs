use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use log::warn;
use serde::{Deserialize, Serialize};

const GIB: u64 = 1024 * 1024 * 1024;
const MIB: u64 = 1024 * 1024;

/// Which codec the compression worker drives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionMethod {
    /// Parallel gzip: a `.tar.gz` archive.
    Pgzip,
    /// External `7z` binary invoked as a subprocess.
    SevenZipCommand,
    /// Plain tar, no compression.
    Tar,
    /// A `.tar.zst` archive.
    Zstd,
}

impl CompressionMethod {
    /// Archive file extension, including the leading dot.
    pub fn extension(&self) -> &'static str {
        match self {
            CompressionMethod::Pgzip => ".tar.gz",
            CompressionMethod::SevenZipCommand => ".7z",
            CompressionMethod::Tar => ".tar",
            CompressionMethod::Zstd => ".tar.zst",
        }
    }

    /// Whether the codec actually shrinks data (vs. just packing it).
    pub fn compresses(&self) -> bool {
        !matches!(self, CompressionMethod::Tar)
    }
}

impl FromStr for CompressionMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pgzip" => Ok(CompressionMethod::Pgzip),
            "7zip_command" => Ok(CompressionMethod::SevenZipCommand),
            "tar" => Ok(CompressionMethod::Tar),
            "zstd" => Ok(CompressionMethod::Zstd),
            other => Err(format!("unknown compression method: {other:?}")),
        }
    }
}

/// Engine configuration, sourced from the environment.
///
/// Every knob has a default good enough for a first run against a directory
/// tape emulation; production deployments set the `MAX_FILE_SIZE` and
/// staging paths explicitly.
#[derive(Clone, Debug)]
pub struct Settings {
    /// Target archive size in bytes.
    pub max_file_size: u64,
    pub compression_method: CompressionMethod,
    pub compression_level: u32,
    pub compression_threads: u32,
    /// Stream archives into the tape device instead of staging them in the
    /// final directory for the tape writer to move.
    pub compress_directly_to_tape: bool,
    pub default_retention_months: u32,
    pub staging_sync_batch_size: usize,
    pub staging_sync_interval: Duration,
    pub staging_max_files: usize,
    pub staging_checkpoint_interval: Duration,
    pub staging_checkpoint_retention_hours: u64,
    /// How long the compression worker sleeps between empty group fetches.
    pub worker_poll_interval: Duration,
    /// Persist scan progress every this many records
    /// (`SCAN_UPDATE_RECORDS`)...
    pub scan_update_records: u64,
    /// ...or at least this often (`SCAN_UPDATE_INTERVAL`, seconds).
    pub scan_update_interval: Duration,
    /// Where archives are built before they are handed to the tape writer.
    pub staging_dir: PathBuf,
    /// The "final" directory the tape writer consumes from.
    pub final_dir: PathBuf,
    /// Staging-buffer checkpoint dumps.
    pub checkpoint_dir: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            max_file_size: 6 * GIB,
            compression_method: CompressionMethod::Pgzip,
            compression_level: 6,
            compression_threads: 4,
            compress_directly_to_tape: false,
            default_retention_months: 12,
            staging_sync_batch_size: 3000,
            staging_sync_interval: Duration::from_secs(5),
            staging_max_files: 200_000,
            staging_checkpoint_interval: Duration::from_secs(300),
            staging_checkpoint_retention_hours: 24,
            worker_poll_interval: Duration::from_secs(5),
            scan_update_records: 1000,
            scan_update_interval: Duration::from_secs(5),
            staging_dir: PathBuf::from("temp/staging"),
            final_dir: PathBuf::from("temp/final"),
            checkpoint_dir: PathBuf::from("temp/checkpoints"),
        }
    }
}

impl Settings {
    /// Read settings from the process environment, falling back to defaults
    /// for unset or unparseable variables (the latter with a warning).
    pub fn from_env() -> Self {
        let d = Settings::default();
        Settings {
            max_file_size: env_parsed("MAX_FILE_SIZE", d.max_file_size),
            compression_method: env_parsed("COMPRESSION_METHOD", d.compression_method),
            compression_level: env_parsed("COMPRESSION_LEVEL", d.compression_level),
            compression_threads: env_parsed("COMPRESSION_THREADS", d.compression_threads),
            compress_directly_to_tape: env_bool("COMPRESS_DIRECTLY_TO_TAPE", false),
            default_retention_months: env_parsed(
                "DEFAULT_RETENTION_MONTHS",
                d.default_retention_months,
            ),
            staging_sync_batch_size: env_parsed(
                "STAGING_SYNC_BATCH_SIZE",
                d.staging_sync_batch_size,
            ),
            staging_sync_interval: Duration::from_secs(env_parsed("STAGING_SYNC_INTERVAL", 5)),
            staging_max_files: env_parsed("STAGING_MAX_FILES", d.staging_max_files),
            staging_checkpoint_interval: Duration::from_secs(env_parsed(
                "STAGING_CHECKPOINT_INTERVAL",
                300,
            )),
            staging_checkpoint_retention_hours: env_parsed(
                "STAGING_CHECKPOINT_RETENTION_HOURS",
                d.staging_checkpoint_retention_hours,
            ),
            worker_poll_interval: d.worker_poll_interval,
            scan_update_records: env_parsed("SCAN_UPDATE_RECORDS", d.scan_update_records),
            scan_update_interval: Duration::from_secs(env_parsed("SCAN_UPDATE_INTERVAL", 5)),
            staging_dir: env_path("TAPEBACK_STAGING_DIR", d.staging_dir),
            final_dir: env_path("TAPEBACK_FINAL_DIR", d.final_dir),
            checkpoint_dir: env_path("TAPEBACK_CHECKPOINT_DIR", d.checkpoint_dir),
        }
    }

    pub fn group_tuning(&self) -> GroupTuning {
        GroupTuning::for_target(self.max_file_size)
    }
}

fn env_parsed<T: FromStr + Copy>(name: &str, default: T) -> T
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => match raw.trim().parse() {
            Ok(v) => v,
            Err(e) => {
                warn!("invalid {name}={raw:?} ({e}), using default");
                default
            }
        },
        Err(_) => default,
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(raw) => matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"),
        Err(_) => default,
    }
}

fn env_path(name: &str, default: PathBuf) -> PathBuf {
    std::env::var_os(name).map(PathBuf::from).unwrap_or(default)
}

/// Derived thresholds for group forming, all computed from the target
/// archive size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GroupTuning {
    /// `MAX_FILE_SIZE`: the size an archive aims for.
    pub target_size: u64,
    /// 5% of the target.
    pub tolerance: u64,
    /// `target - tolerance`; a group at or above this is complete, and a
    /// single file above it is a "giant" that forms its own group.
    pub min_group: u64,
    /// Groups below this are only shipped once the scan has completed
    /// (residuals), never while more files may still arrive.
    pub min_acceptable: u64,
    /// Row-fetch batch for the pending query.
    pub batch: usize,
    /// How many empty fetches a caller may wait through before forcing
    /// whatever has accumulated.
    pub max_retries: u32,
}

impl GroupTuning {
    pub fn for_target(target_size: u64) -> Self {
        let tolerance = target_size / 20;
        let gb = target_size as f64 / GIB as f64;
        let batch = ((gb * 500.0).round() as i64).clamp(3000, 50_000) as usize;
        GroupTuning {
            target_size,
            tolerance,
            min_group: target_size - tolerance,
            min_acceptable: (target_size / 100).max(100 * MIB),
            batch,
            max_retries: 6,
        }
    }

    /// A single file this large forms its own archive.
    pub fn is_giant(&self, size: u64) -> bool {
        size > self.min_group
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn tuning_for_six_gib() {
        let t = GroupTuning::for_target(6 * GIB);
        assert_eq!(t.tolerance, 6 * GIB / 20);
        assert_eq!(t.min_group, 6 * GIB - 6 * GIB / 20);
        // 1% of 6 GiB < 100 MiB, so the floor wins.
        assert_eq!(t.min_acceptable, 100 * MIB);
        assert_eq!(t.batch, 3000);
        assert_eq!(t.max_retries, 6);
    }

    #[test]
    fn batch_clamps_on_both_ends() {
        assert_eq!(GroupTuning::for_target(GIB).batch, 3000);
        assert_eq!(GroupTuning::for_target(200 * GIB).batch, 50_000);
        assert_eq!(GroupTuning::for_target(20 * GIB).batch, 10_000);
    }

    #[test]
    fn min_acceptable_scales_past_ten_gib() {
        // 1% of 20 GiB = 204.8 MiB beats the 100 MiB floor.
        let t = GroupTuning::for_target(20 * GIB);
        assert_eq!(t.min_acceptable, 20 * GIB / 100);
    }

    #[test]
    fn giant_threshold_sits_at_min_group() {
        let t = GroupTuning::for_target(GIB);
        assert!(!t.is_giant(t.min_group));
        assert!(t.is_giant(t.min_group + 1));
    }

    #[test]
    fn method_parsing() {
        assert_eq!(
            "7zip_command".parse::<CompressionMethod>().unwrap(),
            CompressionMethod::SevenZipCommand
        );
        assert!("lz4".parse::<CompressionMethod>().is_err());
        assert_eq!(CompressionMethod::Zstd.extension(), ".tar.zst");
        assert!(!CompressionMethod::Tar.compresses());
    }
}
