use filetime::FileTime;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};
use walkdir::WalkDir;

use crate::formkey::ModKey;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSnapshot {
    pub name: String,
    pub size: u64,
    pub last_write: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectorySnapshot {
    pub path: PathBuf,
    pub file_count: usize,
    /// Top-level plugin and archive files, sorted by name.
    pub files: Vec<FileSnapshot>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub directories: Vec<DirectorySnapshot>,
}

impl FileSnapshot {
    pub fn of(path: &Path) -> Option<Self> {
        let meta = fs::metadata(path).ok()?;
        let name = path.file_name()?.to_string_lossy().to_string();
        Some(Self {
            name,
            size: meta.len(),
            last_write: FileTime::from_last_modification_time(&meta).unix_seconds(),
        })
    }
}

impl DirectorySnapshot {
    pub fn of(path: &Path) -> Self {
        let file_count = WalkDir::new(path)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .count();
        let mut files = Vec::new();
        if let Ok(entries) = fs::read_dir(path) {
            for entry in entries.flatten() {
                let entry_path = entry.path();
                if !entry_path.is_file() || !is_tracked_file(&entry_path) {
                    continue;
                }
                if let Some(snapshot) = FileSnapshot::of(&entry_path) {
                    files.push(snapshot);
                }
            }
        }
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Self {
            path: path.to_path_buf(),
            file_count,
            files,
        }
    }
}

impl ConfigSnapshot {
    pub fn of(folders: &[PathBuf]) -> Self {
        Self {
            directories: folders.iter().map(|folder| DirectorySnapshot::of(folder)).collect(),
        }
    }
}

/// True when the stored fingerprint no longer matches the folders on disk.
pub fn needs_rescan(stored: Option<&ConfigSnapshot>, folders: &[PathBuf]) -> bool {
    match stored {
        Some(stored) => *stored != ConfigSnapshot::of(folders),
        None => true,
    }
}

fn is_tracked_file(path: &Path) -> bool {
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("");
    if ModKey::is_plugin_file(name) {
        return true;
    }
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ["bsa", "ba2", "zip"].iter().any(|known| known.eq_ignore_ascii_case(ext)))
        .unwrap_or(false)
}
