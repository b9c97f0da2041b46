use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{FileId, SetId};

/// What kind of filesystem entry a record describes.
///
/// Symlinks are recorded as-is and never dereferenced; directories carry no
/// size contribution.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    File,
    Directory,
    Symlink,
}

impl FileKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileKind::File => "file",
            FileKind::Directory => "directory",
            FileKind::Symlink => "symlink",
        }
    }
}

impl FromStr for FileKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file" => Ok(FileKind::File),
            "directory" => Ok(FileKind::Directory),
            "symlink" => Ok(FileKind::Symlink),
            other => Err(format!("unknown file type: {other:?}")),
        }
    }
}

/// A scanned filesystem entry as the scanner emits it, before it has a
/// database identity. This is what flows through the staging buffer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Absolute path of the entry.
    pub path: PathBuf,
    pub file_name: String,
    pub size: u64,
    pub kind: FileKind,
    /// Unix mode bits where available.
    pub permissions: Option<u32>,
    pub created: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
    pub accessed: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl FileRecord {
    pub fn new(path: PathBuf, size: u64, kind: FileKind) -> Self {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        FileRecord {
            path,
            file_name,
            size,
            kind,
            permissions: None,
            created: None,
            modified: None,
            accessed: None,
            metadata: Default::default(),
        }
    }
}

/// A full `backup_files` row.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackupFile {
    pub id: FileId,
    pub backup_set_id: SetId,
    #[serde(flatten)]
    pub record: FileRecord,
    pub compressed_size: Option<u64>,
    pub compressed: bool,
    /// Checksum of the archive the file went into, hex-encoded.
    pub checksum: Option<String>,
    /// Set only once the containing archive is on tape.
    pub chunk_number: Option<u32>,
    pub tape_block_start: Option<u64>,
    pub is_copy_success: bool,
    pub copy_status_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The slice of a pending row the group builder works with.
///
/// `is_copy_success = true && chunk_number = NULL` rows ("reserved but not
/// yet on tape") are already filtered out by the pending queries, so this
/// type only ever describes genuinely unarchived regular files.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingFile {
    pub id: FileId,
    pub path: PathBuf,
    pub size: u64,
}
