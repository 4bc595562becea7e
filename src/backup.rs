use crate::library::{Library, LIBRARY_FILE};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

#[derive(Debug, Serialize, Deserialize)]
pub struct BackupMeta {
    pub timestamp: u64,
    pub reason: Option<String>,
    pub configurations: usize,
    pub selections: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct LastBackup {
    path: PathBuf,
    timestamp: u64,
}

/// Snapshot of the library taken before a destructive bulk action.
pub fn create_backup(data_dir: &Path, library: &Library, reason: Option<&str>) -> Result<PathBuf> {
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    let backup_root = data_dir.join("backups");
    fs::create_dir_all(&backup_root).context("create backups dir")?;
    let backup_dir = backup_root.join(format!("backup-{stamp}"));
    fs::create_dir_all(&backup_dir).context("create backup dir")?;

    let library_json = serde_json::to_string_pretty(library).context("serialize library")?;
    fs::write(backup_dir.join(LIBRARY_FILE), library_json).context("write library backup")?;

    let meta = BackupMeta {
        timestamp: stamp,
        reason: reason.map(|value| value.to_string()),
        configurations: library.configurations.len(),
        selections: library.selections.selections.len(),
    };
    let meta_json = serde_json::to_string_pretty(&meta).context("serialize backup meta")?;
    fs::write(backup_dir.join("meta.json"), meta_json).context("write backup meta")?;

    let last = LastBackup {
        path: backup_dir.clone(),
        timestamp: stamp,
    };
    let last_json = serde_json::to_string_pretty(&last).context("serialize last backup")?;
    fs::write(backup_root.join("last.json"), last_json).context("write last backup")?;

    Ok(backup_dir)
}

pub fn load_last_backup(data_dir: &Path) -> Result<Option<PathBuf>> {
    let path = data_dir.join("backups").join("last.json");
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(&path).context("read last backup")?;
    let last: LastBackup = serde_json::from_str(&raw).context("parse last backup")?;
    if last.path.exists() {
        Ok(Some(last.path))
    } else {
        Ok(None)
    }
}

pub fn load_backup_library(backup_dir: &Path) -> Result<Library> {
    let raw = fs::read_to_string(backup_dir.join(LIBRARY_FILE)).context("read backup library")?;
    let mut library: Library = serde_json::from_str(&raw).context("parse backup library")?;
    library.normalize();
    Ok(library)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{catalog::ModConfiguration, environment::fixtures::fk, selection::Selection};

    #[test]
    fn last_backup_restores_the_library() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_last_backup(dir.path()).unwrap().is_none());

        let mut library = Library::default();
        library.configurations.push(ModConfiguration::new("Bijin"));
        library.selections.selections.insert(
            fk("013BBD:Skyrim.esm"),
            Selection {
                mod_name: "Bijin".to_string(),
                source_npc: fk("013BBD:Skyrim.esm"),
            },
        );
        let backup_dir = create_backup(dir.path(), &library, Some("clear all")).unwrap();
        assert!(backup_dir.join("meta.json").exists());

        let last = load_last_backup(dir.path()).unwrap().unwrap();
        assert_eq!(last, backup_dir);
        let restored = load_backup_library(&last).unwrap();
        assert_eq!(restored.configurations.len(), 1);
        assert_eq!(restored.selections, library.selections);
    }
}
